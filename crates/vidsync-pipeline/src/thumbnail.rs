//! Single-frame JPEG previews next to copied videos.

use std::path::{Path, PathBuf};

use vidsync_core::PipelineResult;

use crate::tools::{run_checked, ToolCommand, ToolRunner};

/// `clip.MP4` → `clip_thumb.jpg`
pub fn thumbnail_path(video: &Path) -> PathBuf {
    let stem = video
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    video.with_file_name(format!("{stem}_thumb.jpg"))
}

/// Removes a video's thumbnail. A missing thumbnail is not an error.
pub fn remove_thumbnail(video: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(thumbnail_path(video)) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

pub fn thumbnail_command(ffmpeg: &Path, video: &Path, thumb: &Path) -> ToolCommand {
    ToolCommand::new(ffmpeg)
        .args(["-y", "-loglevel", "error", "-ss", "00:00:01", "-i"])
        .arg(video.as_os_str())
        .args(["-frames:v", "1", "-vf", "scale=320:-1"])
        .arg(thumb.as_os_str())
}

/// Extract a frame one second in. Returns the thumbnail path.
pub async fn generate(
    runner: &dyn ToolRunner,
    ffmpeg: &Path,
    video: &Path,
) -> PipelineResult<PathBuf> {
    let thumb = thumbnail_path(video);
    run_checked(runner, &thumbnail_command(ffmpeg, video, &thumb)).await?;
    Ok(thumb)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thumbnail_path() {
        assert_eq!(
            thumbnail_path(Path::new("/share/drone/DJI_0001.MP4")),
            PathBuf::from("/share/drone/DJI_0001_thumb.jpg")
        );
    }

    #[test]
    fn test_remove_thumbnail() {
        let tmp = tempfile::TempDir::new().unwrap();
        let video = tmp.path().join("DJI_0001.MP4");
        std::fs::write(thumbnail_path(&video), b"jpg").unwrap();
        remove_thumbnail(&video).unwrap();
        assert!(!thumbnail_path(&video).exists());
        remove_thumbnail(&video).unwrap();

        // A directory in the thumbnail's place cannot be unlinked
        let blocked = tmp.path().join("DJI_0002.MP4");
        std::fs::create_dir(thumbnail_path(&blocked)).unwrap();
        assert!(remove_thumbnail(&blocked).is_err());
    }
}
