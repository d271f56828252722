//! Flight grouping.
//!
//! Drones split one continuous recording into fixed-size fragments
//! (`DJI_0001.MP4`, `DJI_0002.MP4`, ...). A flight is a maximal run of
//! fragments that belong together. Two signals end a flight:
//!
//! - the next clip starts more than `gap` after the previous clip ended, if
//!   its clock is trustworthy (year >= 2020);
//! - the next clip's sequence number jumps by more than one past the last
//!   number seen on a long clip, and the next clip is itself long. Short
//!   clips are often deleted test shots, so their numbers are not trusted.
//!
//! Folder traversal and grouping are separate: [`discover`] lists the source
//! folders, [`group_clips`] is a pure function over probed clips.

use chrono::{DateTime, Datelike, TimeDelta, Utc};
use regex::Regex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use vidsync_core::{PipelineResult, ProgressReporter};

use crate::probe;
use crate::tools::ToolRunner;

/// Folders never searched for fragments.
pub const RESERVED_DIRS: [&str; 2] = ["output", "initial"];
/// Clips at least this long count as real footage.
pub const LONG_CLIP_SECS: f64 = 30.0;
/// Clocks before this year are unset, so time gaps mean nothing.
pub const MIN_TRUSTED_CLOCK_YEAR: i32 = 2020;

static SEQUENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"_(\d+)$").expect("valid sequence regex"));

/// A probed fragment.
#[derive(Debug, Clone, PartialEq)]
pub struct Clip {
    pub path: PathBuf,
    pub created: DateTime<Utc>,
    pub duration_secs: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Flight {
    pub file_paths: Vec<PathBuf>,
    pub created_time: Option<DateTime<Utc>>,
    /// Index of this flight within its folder
    pub folder_count: usize,
    /// Name of the subfolder the fragments came from
    pub extra_metadata: Option<String>,
}

/// Fragments of one folder, in file-name order.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceFolder {
    pub dir: PathBuf,
    pub extra_metadata: Option<String>,
    pub files: Vec<PathBuf>,
}

/// Trailing `_<digits>` of the file stem.
pub fn sequence_number(path: &Path) -> Option<u64> {
    let stem = path.file_stem()?.to_string_lossy();
    SEQUENCE.captures(&stem)?[1].parse().ok()
}

fn is_fragment(path: &Path) -> bool {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    name.ends_with(".mp4") && !name.contains("stabilized")
}

fn is_reserved(name: &str) -> bool {
    let lower = name.to_lowercase();
    RESERVED_DIRS.iter().any(|r| *r == lower)
}

/// List fragment folders under `root`. Subfolders come before the folder
/// that contains them; each subfolder carries its own name as metadata.
pub fn discover(root: &Path) -> std::io::Result<Vec<SourceFolder>> {
    let mut out = Vec::new();
    discover_into(root, None, &mut out)?;
    Ok(out)
}

fn discover_into(
    dir: &Path,
    extra_metadata: Option<String>,
    out: &mut Vec<SourceFolder>,
) -> std::io::Result<()> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)?.filter_map(|e| e.ok()).collect();
    entries.sort_by_key(|e| e.file_name());

    let mut files = Vec::new();
    for entry in entries {
        let path = entry.path();
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        let name = entry.file_name().to_string_lossy().into_owned();
        if file_type.is_dir() {
            if !is_reserved(&name) {
                discover_into(&path, Some(name), out)?;
            }
        } else if file_type.is_file() && is_fragment(&path) {
            files.push(path);
        }
    }

    if !files.is_empty() {
        out.push(SourceFolder {
            dir: dir.to_path_buf(),
            extra_metadata,
            files,
        });
    }
    Ok(())
}

/// Partition clips into flights. Clips are ordered by file name first.
pub fn group_clips(clips: &[Clip], gap_secs: u64, extra_metadata: Option<&str>) -> Vec<Flight> {
    let mut sorted: Vec<&Clip> = clips.iter().collect();
    sorted.sort_by(|a, b| a.path.file_name().cmp(&b.path.file_name()));

    let gap = TimeDelta::seconds(gap_secs as i64);
    let mut flights = Vec::new();
    let mut current: Option<Flight> = None;
    let mut last_end: Option<DateTime<Utc>> = None;
    let mut last_number: Option<u64> = None;
    let mut folder_count = 0;

    for clip in sorted {
        let number = sequence_number(&clip.path);
        let long = clip.duration_secs >= LONG_CLIP_SECS;

        let time_split = last_end.is_some_and(|end| {
            clip.created > end + gap && clip.created.year() >= MIN_TRUSTED_CLOCK_YEAR
        });
        let sequence_split = match (number, last_number) {
            (Some(n), Some(last)) => long && n > last.saturating_add(1),
            _ => false,
        };

        if current.is_none() || time_split || sequence_split {
            if let Some(done) = current.take() {
                flights.push(done);
            }
            current = Some(Flight {
                file_paths: Vec::new(),
                created_time: Some(clip.created),
                folder_count,
                extra_metadata: extra_metadata.map(str::to_string),
            });
            folder_count += 1;
        }

        if let Some(flight) = current.as_mut() {
            flight.file_paths.push(clip.path.clone());
        }
        last_end = Some(clip.created + TimeDelta::milliseconds((clip.duration_secs * 1000.0) as i64));
        if long && number.is_some() {
            last_number = number;
        }
    }

    flights.extend(current);
    flights
}

/// Probe every fragment under `root` and group each folder into flights.
/// Clips that cannot be probed are skipped with a warning.
pub async fn group_flights(
    runner: &dyn ToolRunner,
    ffprobe: &Path,
    root: &Path,
    gap_secs: u64,
    reporter: &ProgressReporter,
) -> PipelineResult<Vec<Flight>> {
    let folders = discover(root)?;
    let mut flights = Vec::new();

    for folder in folders {
        let mut clips = Vec::with_capacity(folder.files.len());
        for path in &folder.files {
            let info = match probe::probe(runner, ffprobe, path).await {
                Ok(info) => info,
                Err(e) => {
                    reporter.warn(format!("Skipping {}: {e}", path.display()));
                    continue;
                }
            };
            let created = match info.creation_time {
                Some(t) => t,
                None => match std::fs::metadata(path).and_then(|m| m.modified()) {
                    Ok(t) => DateTime::<Utc>::from(t),
                    Err(e) => {
                        reporter.warn(format!("Skipping {}: no timestamp: {e}", path.display()));
                        continue;
                    }
                },
            };
            clips.push(Clip {
                path: path.clone(),
                created,
                duration_secs: info.duration_secs,
            });
        }
        flights.extend(group_clips(
            &clips,
            gap_secs,
            folder.extra_metadata.as_deref(),
        ));
    }

    Ok(flights)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
    }

    fn clip(name: &str, offset_secs: i64, duration_secs: f64) -> Clip {
        Clip {
            path: PathBuf::from(format!("/f/{name}.mp4")),
            created: base() + TimeDelta::seconds(offset_secs),
            duration_secs,
        }
    }

    #[test]
    fn test_sequence_number() {
        assert_eq!(sequence_number(Path::new("/a/DJI_0042.MP4")), Some(42));
        assert_eq!(
            sequence_number(Path::new("DJI_20240501143000_0007_D.MP4")),
            None
        );
        assert_eq!(sequence_number(Path::new("clip.mp4")), None);
    }

    #[test]
    fn test_time_gap_splits() {
        let clips = [
            clip("A_001", 0, 60.0),
            clip("A_002", 60, 60.0),
            clip("A_003", 600, 60.0),
        ];
        let flights = group_clips(&clips, 10, None);
        assert_eq!(flights.len(), 2);
        assert_eq!(flights[0].file_paths.len(), 2);
        assert_eq!(flights[1].folder_count, 1);
        assert_eq!(flights[1].created_time, Some(base() + TimeDelta::seconds(600)));
    }

    #[test]
    fn test_untrusted_clock_ignores_gaps() {
        let old = Utc.with_ymd_and_hms(2015, 1, 1, 0, 0, 0).unwrap();
        let clips = [
            Clip {
                path: PathBuf::from("/f/A_001.mp4"),
                created: old,
                duration_secs: 60.0,
            },
            Clip {
                path: PathBuf::from("/f/A_002.mp4"),
                created: old + TimeDelta::hours(5),
                duration_secs: 60.0,
            },
        ];
        assert_eq!(group_clips(&clips, 10, None).len(), 1);
    }

    #[test]
    fn test_short_clip_numbers_not_trusted() {
        // A_001 is a short test shot, so the jump to A_005 is not a split
        let clips = [clip("A_001", 0, 5.0), clip("A_005", 6, 60.0)];
        assert_eq!(group_clips(&clips, 10, None).len(), 1);
    }

    #[test]
    fn test_largest_sequence_number() {
        let max = u64::MAX;
        // A clip numbered u64::MAX followed by another long clip
        let clips = [clip(&format!("A_{max}"), 0, 30.0), clip("B_0005", 31, 30.0)];
        assert_eq!(sequence_number(&clips[0].path), Some(max));
        assert_eq!(group_clips(&clips, 10, None).len(), 1);

        let jump = [clip("A_0001", 0, 30.0), clip(&format!("A_{max}"), 31, 30.0)];
        assert_eq!(group_clips(&jump, 10, None).len(), 2);
    }

    #[test]
    fn test_input_order_does_not_matter() {
        let clips = [clip("A_002", 31, 30.0), clip("A_001", 0, 30.0)];
        let flights = group_clips(&clips, 10, Some("trip"));
        assert_eq!(flights.len(), 1);
        assert_eq!(
            flights[0].file_paths,
            [PathBuf::from("/f/A_001.mp4"), PathBuf::from("/f/A_002.mp4")]
        );
        assert_eq!(flights[0].extra_metadata.as_deref(), Some("trip"));
    }

    #[test]
    fn test_discover_orders_subfolders_first() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("morning")).unwrap();
        std::fs::create_dir_all(root.join("output")).unwrap();
        std::fs::create_dir_all(root.join("Initial")).unwrap();
        std::fs::write(root.join("DJI_0001.MP4"), b"x").unwrap();
        std::fs::write(root.join("DJI_0001_stabilized.mp4"), b"x").unwrap();
        std::fs::write(root.join("DJI_0001.SRT"), b"x").unwrap();
        std::fs::write(root.join("morning/DJI_0002.mp4"), b"x").unwrap();
        std::fs::write(root.join("output/merged.mp4"), b"x").unwrap();
        std::fs::write(root.join("Initial/raw.mp4"), b"x").unwrap();

        let folders = discover(root).unwrap();
        assert_eq!(folders.len(), 2);
        assert_eq!(folders[0].extra_metadata.as_deref(), Some("morning"));
        assert_eq!(folders[1].extra_metadata, None);
        assert_eq!(folders[1].files, [root.join("DJI_0001.MP4")]);
    }

    proptest! {
        #[test]
        fn grouping_keeps_every_clip(durations in proptest::collection::vec(1.0f64..120.0, 1..40)) {
            let mut offset = 0i64;
            let clips: Vec<Clip> = durations
                .iter()
                .enumerate()
                .map(|(i, d)| {
                    let c = clip(&format!("A_{:03}", i + 1), offset, *d);
                    offset += *d as i64 + (i as i64 % 3) * 7;
                    c
                })
                .collect();
            let flights = group_clips(&clips, 10, None);
            let total: usize = flights.iter().map(|f| f.file_paths.len()).sum();
            prop_assert_eq!(total, clips.len());
            for (i, f) in flights.iter().enumerate() {
                prop_assert_eq!(f.folder_count, i);
                prop_assert!(!f.file_paths.is_empty());
            }
        }
    }
}
