//! Timestamp recovery from sidecars, paths, file names and folder names.
//!
//! Device clocks are often unset (1970, 1980 or 2000 epochs), so every
//! source has a plausibility floor below which it is ignored. Naive
//! date-times found in text are interpreted as UTC.

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;
use std::time::SystemTime;

/// Birth/modify times older than this are a reset device clock.
pub const MIN_FILE_CLOCK_YEAR: i32 = 1980;
/// Capture dates older than this are treated as missing.
pub const MIN_CAPTURE_YEAR: i32 = 2000;
pub const MAX_PATH_YEAR: i32 = 2100;

static SRT_TIMESTAMP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d{4}-\d{2}-\d{2})\s+(\d{2}:\d{2}:\d{2})").expect("valid sidecar regex")
});
static PATH_YMD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{4})-(\d{2})-(\d{2})").expect("valid path date regex"));
static PATH_DMY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{2})-(\d{2})-(\d{4})").expect("valid path date regex"));
static DJI_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^DJI_(\d{14})_").expect("valid DJI name regex"));
static FOLDER_METADATA: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\d+)-(\d+)-(\d+)\s+(\d+)-(\d+)-(\d+)\s+(am|pm)")
        .expect("valid folder metadata regex")
});
static SYNC_FOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{4})-(\d{2})-(\d{2})_(\d{2})-(\d{2})-(\d{2})$")
        .expect("valid sync folder regex")
});

pub fn is_plausible(t: DateTime<Utc>, min_year: i32) -> bool {
    t.year() >= min_year
}

pub fn system_time_to_utc(t: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(t)
}

fn naive_to_utc(naive: NaiveDateTime) -> DateTime<Utc> {
    Utc.from_utc_datetime(&naive)
}

/// First `YYYY-MM-DD HH:MM:SS` stamp in a subtitle track.
pub fn parse_srt_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let caps = SRT_TIMESTAMP.captures(text)?;
    let joined = format!("{} {}", &caps[1], &caps[2]);
    let naive = NaiveDateTime::parse_from_str(&joined, "%Y-%m-%d %H:%M:%S").ok()?;
    let t = naive_to_utc(naive);
    is_plausible(t, MIN_CAPTURE_YEAR).then_some(t)
}

/// Telemetry subtitle next to a video (`clip.SRT` / `clip.srt`).
pub fn sidecar_path(video: &Path) -> Option<std::path::PathBuf> {
    ["SRT", "srt"]
        .iter()
        .map(|ext| video.with_extension(ext))
        .find(|p| p.is_file())
}

/// Capture time from the video's SRT sidecar, if it has one.
pub fn sidecar_date(video: &Path) -> Option<DateTime<Utc>> {
    let path = sidecar_path(video)?;
    let bytes = std::fs::read(&path).ok()?;
    parse_srt_timestamp(&String::from_utf8_lossy(&bytes))
}

fn date_in_range(year: i32, month: u32, day: u32) -> Option<DateTime<Utc>> {
    if !(MIN_CAPTURE_YEAR..=MAX_PATH_YEAR).contains(&year) {
        return None;
    }
    let date = NaiveDate::from_ymd_opt(year, month, day)?;
    Some(naive_to_utc(date.and_time(NaiveTime::MIN)))
}

/// Date embedded in a path: `YYYY-MM-DD` first, then `DD-MM-YYYY`.
pub fn path_date(path: &str) -> Option<DateTime<Utc>> {
    let ymd = PATH_YMD.captures_iter(path).find_map(|c| {
        date_in_range(c[1].parse().ok()?, c[2].parse().ok()?, c[3].parse().ok()?)
    });
    ymd.or_else(|| {
        PATH_DMY.captures_iter(path).find_map(|c| {
            date_in_range(c[3].parse().ok()?, c[2].parse().ok()?, c[1].parse().ok()?)
        })
    })
}

/// `DJI_20240501143000_0001_D.MP4` → 2024-05-01 14:30:00.
pub fn dji_filename_time(file_name: &str) -> Option<DateTime<Utc>> {
    let caps = DJI_NAME.captures(file_name)?;
    let naive = NaiveDateTime::parse_from_str(&caps[1], "%Y%m%d%H%M%S").ok()?;
    Some(naive_to_utc(naive))
}

/// Folder names exported by some phone apps: `03-12-2024_02-15-09 pm`
/// (day-month-year, 12-hour clock). The first underscore separates date and
/// time.
pub fn folder_metadata_time(folder_name: &str) -> Option<DateTime<Utc>> {
    let normalized = folder_name.replacen('_', " ", 1);
    let caps = FOLDER_METADATA.captures(&normalized)?;
    let day: u32 = caps[1].parse().ok()?;
    let month: u32 = caps[2].parse().ok()?;
    let year: i32 = caps[3].parse().ok()?;
    let hour12: u32 = caps[4].parse().ok()?;
    let minute: u32 = caps[5].parse().ok()?;
    let second: u32 = caps[6].parse().ok()?;
    if !(1..=12).contains(&hour12) {
        return None;
    }
    let pm = caps[7].eq_ignore_ascii_case("pm");
    let hour = match (hour12, pm) {
        (12, false) => 0,
        (12, true) => 12,
        (h, false) => h,
        (h, true) => h + 12,
    };
    let date = NaiveDate::from_ymd_opt(year, month, day)?;
    let time = NaiveTime::from_hms_opt(hour, minute, second)?;
    Some(naive_to_utc(date.and_time(time)))
}

/// Name of a per-run sync folder: `YYYY-MM-DD_HH-mm-ss`.
pub fn sync_folder_name(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%d_%H-%M-%S").to_string()
}

/// Inverse of [`sync_folder_name`].
pub fn sync_folder_time(name: &str) -> Option<DateTime<Utc>> {
    if !SYNC_FOLDER.is_match(name) {
        return None;
    }
    let naive = NaiveDateTime::parse_from_str(name, "%Y-%m-%d_%H-%M-%S").ok()?;
    Some(naive_to_utc(naive))
}

/// ISO-8601 with separators stripped: `20240501T143000000Z`.
pub fn compact_iso(t: DateTime<Utc>) -> String {
    t.format("%Y%m%dT%H%M%S%3fZ").to_string()
}
