use std::path::{Path, PathBuf};

use anyhow::Result;
use tokio::task::spawn_blocking;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::sampler::ARTIFACT_SUFFIX;

const VIDEO_EXTS: [&str; 10] = [
    "avi", "flv", "m4v", "mkv", "mov", "mp4", "mpg", "ts", "webm", "wmv",
];

/// Longest directory name still treated as a season or extras folder.
const SEASON_NAME_MAX: usize = 10;

pub fn is_video(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        .is_some_and(|ext| VIDEO_EXTS.contains(&ext.as_str()))
}

/// Sample artifact left behind by an interrupted run, named `<uuid>-tmp.<ext>`.
pub fn is_stale_artifact(path: &Path) -> bool {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .and_then(|stem| stem.strip_suffix(ARTIFACT_SUFFIX))
        .is_some_and(|id| uuid::Uuid::parse_str(id).is_ok())
}

/// Recursively collects video files under `roots`, in walk order.
pub async fn find_videos(roots: Vec<PathBuf>) -> Result<Vec<PathBuf>> {
    spawn_blocking(move || {
        let mut files = Vec::new();
        for entry in roots.into_iter().flat_map(|p| WalkDir::new(p).sort_by_file_name()) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("skipping entry: {e}");
                    continue;
                }
            };
            let path = entry.path();
            if entry.path_is_symlink() {
                debug!("skipping symlink: '{}'", path.display());
                continue;
            }
            if entry.file_type().is_dir() {
                continue;
            }
            if !is_video(path) {
                debug!("skipping non-video file '{}'", path.display());
                continue;
            }
            files.push(path.to_path_buf());
        }
        anyhow::Ok(files)
    })
    .await?
}

fn is_season_folder(name: &str) -> bool {
    if name.chars().count() > SEASON_NAME_MAX {
        return false;
    }
    let name = name.trim().to_lowercase();
    if name.starts_with("extra") || name.starts_with("special") {
        return true;
    }
    let rest = name
        .strip_prefix("season")
        .or_else(|| name.strip_prefix('s'))
        .unwrap_or_default();
    let digits = rest.trim_start_matches([' ', '.', '_', '-']);
    !digits.is_empty() && digits.len() <= 3 && digits.chars().all(|c| c.is_ascii_digit())
}

/// Folder the encode of `source` lands in, relative to the output directory.
///
/// Files directly inside a season or extras folder keep the show folder above
/// it, e.g. `Show/S01`; anything else keeps only its parent folder.
pub fn destination_folder(source: &Path) -> PathBuf {
    let Some(parent) = source.parent() else {
        return PathBuf::new();
    };
    let parent_name = parent.file_name().map(PathBuf::from).unwrap_or_default();
    let is_season = parent
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(is_season_folder);

    match parent.parent().and_then(Path::file_name) {
        Some(show) if is_season => Path::new(show).join(parent_name),
        _ => parent_name,
    }
}

pub fn output_path(output_dir: &Path, source: &Path, extension: &str) -> PathBuf {
    let stem = source.file_stem().unwrap_or_default().to_string_lossy();
    output_dir
        .join(destination_folder(source))
        .join(format!("{stem}.{extension}"))
}

/// Path the full encode is written to before it is moved into place.
pub fn partial_path(output: &Path) -> PathBuf {
    let stem = output.file_stem().unwrap_or_default().to_string_lossy();
    let ext = output.extension().unwrap_or_default().to_string_lossy();
    output.with_file_name(format!("{stem}.partial.{ext}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognises_video_extensions() {
        assert!(is_video(Path::new("/a/b.mkv")));
        assert!(is_video(Path::new("/a/B.MP4")));
        assert!(!is_video(Path::new("/a/b.srt")));
        assert!(!is_video(Path::new("/a/mkv")));
    }

    #[test]
    fn recognises_stale_artifacts() {
        let id = uuid::Uuid::new_v4();
        assert!(is_stale_artifact(Path::new(&format!("/m/{id}-tmp.mp4"))));
        assert!(!is_stale_artifact(Path::new("/m/not-a-uuid-tmp.mp4")));
        assert!(!is_stale_artifact(Path::new(&format!("/m/{id}.mp4"))));
    }

    #[test]
    fn season_folders() {
        for name in ["S01", "s1", "Season 2", "season_10", "Extras", "Specials"] {
            assert!(is_season_folder(name), "{name}");
        }
        for name in ["Movies", "Season Finale", "s", "The Wire S01 Complete"] {
            assert!(!is_season_folder(name), "{name}");
        }
    }

    #[test]
    fn destination_keeps_show_for_season_folders() {
        assert_eq!(
            destination_folder(Path::new("/tv/Breaking Bad/S01/e01.mkv")),
            PathBuf::from("Breaking Bad/S01")
        );
        assert_eq!(
            destination_folder(Path::new("/movies/Heat (1995)/heat.mkv")),
            PathBuf::from("Heat (1995)")
        );
    }

    #[test]
    fn output_and_partial_paths() {
        let out = output_path(
            Path::new("/out"),
            Path::new("/tv/Show/Season 1/Show.S01E01.mkv"),
            "mp4",
        );
        assert_eq!(out, PathBuf::from("/out/Show/Season 1/Show.S01E01.mp4"));
        assert_eq!(
            partial_path(&out),
            PathBuf::from("/out/Show/Season 1/Show.S01E01.partial.mp4")
        );
    }

    #[tokio::test]
    async fn finds_videos_recursively() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("Show").join("S01");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("e02.mkv"), b"").unwrap();
        std::fs::write(nested.join("e01.mkv"), b"").unwrap();
        std::fs::write(nested.join("e01.srt"), b"").unwrap();
        std::fs::write(dir.path().join("movie.mp4"), b"").unwrap();

        let files = find_videos(vec![dir.path().to_path_buf()]).await.unwrap();
        assert_eq!(
            files,
            vec![
                nested.join("e01.mkv"),
                nested.join("e02.mkv"),
                dir.path().join("movie.mp4"),
            ]
        );
    }
}
