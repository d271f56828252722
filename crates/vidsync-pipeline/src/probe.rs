//! Media metadata via `ffprobe`.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

use vidsync_core::PipelineResult;

use crate::tools::{run_checked, ToolCommand, ToolRunner};

#[derive(Debug, Clone, PartialEq)]
pub struct MediaInfo {
    pub duration_secs: f64,
    /// Container creation time tag, when present
    pub creation_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeSection>,
    #[serde(default)]
    format: Option<ProbeSection>,
}

#[derive(Debug, Deserialize)]
struct ProbeSection {
    #[serde(default)]
    duration: Option<String>,
    #[serde(default)]
    tags: HashMap<String, String>,
}

impl ProbeSection {
    fn duration(&self) -> Option<f64> {
        self.duration.as_deref()?.parse().ok()
    }

    fn creation_time(&self) -> Option<DateTime<Utc>> {
        ["creation_time", "com.apple.quicktime.creationdate"]
            .iter()
            .filter_map(|k| self.tags.get(*k))
            .find_map(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|t| t.with_timezone(&Utc))
    }
}

/// Parse `ffprobe -print_format json -show_format -show_streams` output.
pub fn parse_ffprobe(json: &str) -> Result<MediaInfo> {
    let probe: ProbeOutput = serde_json::from_str(json).context("parsing ffprobe output")?;

    let duration_secs = probe
        .streams
        .iter()
        .chain(probe.format.iter())
        .find_map(ProbeSection::duration)
        .context("ffprobe reported no duration")?;
    let creation_time = probe
        .format
        .iter()
        .chain(probe.streams.iter())
        .find_map(ProbeSection::creation_time);

    Ok(MediaInfo {
        duration_secs,
        creation_time,
    })
}

pub fn probe_command(ffprobe: &Path, file: &Path) -> ToolCommand {
    ToolCommand::new(ffprobe)
        .args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ])
        .arg(file.as_os_str())
}

pub async fn probe(
    runner: &dyn ToolRunner,
    ffprobe: &Path,
    file: &Path,
) -> PipelineResult<MediaInfo> {
    let output = run_checked(runner, &probe_command(ffprobe, file)).await?;
    let info = parse_ffprobe(&output.stdout)
        .with_context(|| format!("probing {}", file.display()))?;
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_dji_probe() {
        let json = r#"{
            "streams": [
                { "codec_type": "video", "duration": "31.031000",
                  "tags": { "creation_time": "2024-05-01T14:30:00.000000Z" } }
            ],
            "format": { "duration": "31.040000", "tags": { "major_brand": "isom" } }
        }"#;
        let info = parse_ffprobe(json).unwrap();
        assert!((info.duration_secs - 31.031).abs() < 1e-6);
        assert_eq!(
            info.creation_time,
            Some(Utc.with_ymd_and_hms(2024, 5, 1, 14, 30, 0).unwrap())
        );
    }

    #[test]
    fn test_parse_format_only() {
        let json = r#"{ "format": { "duration": "12.5",
            "tags": { "com.apple.quicktime.creationdate": "2023-08-10T09:00:00+02:00" } } }"#;
        let info = parse_ffprobe(json).unwrap();
        assert_eq!(info.duration_secs, 12.5);
        assert_eq!(
            info.creation_time,
            Some(Utc.with_ymd_and_hms(2023, 8, 10, 7, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_parse_without_duration_fails() {
        assert!(parse_ffprobe(r#"{ "streams": [] }"#).is_err());
    }
}
