//! Integration tests: flight grouping over probed footage on disk.

mod common;

use chrono::{TimeDelta, TimeZone, Utc};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use common::{script_ffprobe, write_file, ScriptedRunner};
use vidsync_core::ProgressReporter;
use vidsync_pipeline::flight::{group_clips, group_flights, Clip};

fn clip(name: &str, offset_secs: i64, duration_secs: f64) -> Clip {
    let base = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
    Clip {
        path: PathBuf::from(format!("/footage/{name}.mp4")),
        created: base + TimeDelta::seconds(offset_secs),
        duration_secs,
    }
}

fn names(paths: &[PathBuf]) -> Vec<String> {
    paths
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect()
}

#[test]
fn sequence_jump_on_long_clip_starts_new_flight() {
    let clips = [
        clip("A_001", 0, 30.0),
        clip("A_002", 31, 30.0),
        clip("A_010", 65, 40.0),
    ];
    let flights = group_clips(&clips, 10, None);

    assert_eq!(flights.len(), 2);
    assert_eq!(names(&flights[0].file_paths), ["A_001.mp4", "A_002.mp4"]);
    assert_eq!(names(&flights[1].file_paths), ["A_010.mp4"]);
    assert_eq!(flights[0].folder_count, 0);
    assert_eq!(flights[1].folder_count, 1);
}

#[test]
fn short_trailing_clip_does_not_split() {
    // A_010 is short, so the jump from A_002 is not trusted
    let clips = [
        clip("A_001", 0, 30.0),
        clip("A_002", 31, 30.0),
        clip("A_010", 65, 5.0),
    ];
    assert_eq!(group_clips(&clips, 10, None).len(), 1);
}

#[tokio::test]
async fn group_flights_probes_folders_and_skips_bad_clips() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path();
    for name in [
        "DJI_0001.MP4",
        "DJI_0002.MP4",
        "DJI_0003.MP4",
        "morning/DJI_0010.MP4",
        "output/merged.mp4",
    ] {
        write_file(&root.join(name), b"frames");
    }

    let runner = ScriptedRunner::new();
    script_ffprobe(
        &runner,
        &[
            ("DJI_0001.MP4", 60.0, "2024-05-01T10:00:00Z"),
            ("DJI_0002.MP4", 60.0, "2024-05-01T10:01:01Z"),
            // DJI_0003.MP4 is unreadable
            ("DJI_0010.MP4", 45.0, "2024-05-01T07:00:00Z"),
            ("merged.mp4", 600.0, "2024-05-01T07:00:00Z"),
        ],
    );

    let reporter = ProgressReporter::detached("test");
    let flights = group_flights(runner.as_ref(), Path::new("ffprobe"), root, 10, &reporter)
        .await
        .unwrap();

    assert_eq!(flights.len(), 2);
    assert_eq!(flights[0].extra_metadata.as_deref(), Some("morning"));
    assert_eq!(names(&flights[0].file_paths), ["DJI_0010.MP4"]);
    assert_eq!(flights[1].extra_metadata, None);
    assert_eq!(names(&flights[1].file_paths), ["DJI_0001.MP4", "DJI_0002.MP4"]);
    assert_eq!(flights[1].folder_count, 0);

    assert!(reporter
        .logs()
        .iter()
        .any(|l| l.msg.contains("DJI_0003.MP4")));
    assert!(runner
        .calls_to("ffprobe")
        .iter()
        .all(|c| !c.display().contains("output")));
}
