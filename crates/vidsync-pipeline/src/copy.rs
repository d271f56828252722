//! Verified file transfer.
//!
//! Data is written to `<dest>.part`, the size is checked against the source,
//! and only then is the temp renamed into place and the source removed. A
//! failed or interrupted copy leaves no `.part` behind and never touches the
//! source.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use vidsync_core::{PipelineError, PipelineResult};

const COPY_BUF: usize = 1024 * 1024;

pub fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

/// Copy `src` to `part`, preserving the modify time. Optionally throttled to
/// `limit` bytes per second.
pub fn copy_to_part(src: &Path, part: &Path, limit: Option<u64>) -> std::io::Result<u64> {
    let result = copy_inner(src, part, limit);
    if result.is_err() {
        let _ = std::fs::remove_file(part);
    }
    result
}

fn copy_inner(src: &Path, part: &Path, limit: Option<u64>) -> std::io::Result<u64> {
    let mut reader = File::open(src)?;
    let src_mtime = reader.metadata()?.modified()?;
    let mut writer = File::create(part)?;

    let started = Instant::now();
    let mut buf = vec![0u8; COPY_BUF];
    let mut written: u64 = 0;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n])?;
        written += n as u64;

        if let Some(rate) = limit.filter(|r| *r > 0) {
            let due = Duration::from_secs_f64(written as f64 / rate as f64);
            let elapsed = started.elapsed();
            if due > elapsed {
                std::thread::sleep(due - elapsed);
            }
        }
    }
    writer.flush()?;
    writer.sync_all()?;
    writer.set_modified(src_mtime)?;
    Ok(written)
}

/// Check `part` against `src`, then move it to `dest`.
pub fn commit_verified(
    src: &Path,
    part: &Path,
    dest: &Path,
    remove_source: bool,
) -> PipelineResult<u64> {
    let expected = std::fs::metadata(src)?.len();
    let actual = match std::fs::metadata(part) {
        Ok(m) => m.len(),
        Err(e) => {
            let _ = std::fs::remove_file(part);
            return Err(e.into());
        }
    };

    if expected != actual {
        let _ = std::fs::remove_file(part);
        return Err(PipelineError::IntegrityMismatch {
            path: dest.to_path_buf(),
            expected,
            actual,
        });
    }

    std::fs::rename(part, dest)?;
    if remove_source {
        std::fs::remove_file(src)?;
    }
    Ok(actual)
}

/// Copy, verify and commit on the blocking pool.
pub async fn transfer(
    src: PathBuf,
    dest: PathBuf,
    limit: Option<u64>,
    remove_source: bool,
) -> PipelineResult<u64> {
    tokio::task::spawn_blocking(move || {
        let part = part_path(&dest);
        copy_to_part(&src, &part, limit)?;
        commit_verified(&src, &part, &dest, remove_source)
    })
    .await
    .map_err(|e| PipelineError::Other(anyhow::anyhow!("copy task panicked: {e}")))?
}

/// Human-readable byte count: `1.5 GB`.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    if bytes == 0 {
        return "0 B".into();
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    let rounded = (value * 100.0).round() / 100.0;
    format!("{rounded} {}", UNITS[unit])
}
