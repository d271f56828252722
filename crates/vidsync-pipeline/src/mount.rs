//! Device mount adapter.
//!
//! Every device is mounted at the same fixed mount point. Cards pulled out of
//! cameras without a clean eject often carry a dirty NTFS journal or a
//! damaged MFT; for those the adapter walks a ladder of read-only mounts
//! before giving up. A read-only mount means files can be copied but never
//! deleted from the device.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use vidsync_core::config::ToolsConfig;
use vidsync_core::{PipelineError, PipelineResult, ProgressReporter};

use crate::tools::{stderr_tail, ToolCommand, ToolRunner};

/// One read-only fallback attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MountAttempt {
    pub fstype: Option<&'static str>,
    pub options: &'static str,
}

/// Tried in order after a plain mount fails with a corruption signature.
pub const READ_ONLY_LADDER: [MountAttempt; 4] = [
    MountAttempt {
        fstype: Some("ntfs-3g"),
        options: "ro,remove_hiberfile",
    },
    MountAttempt {
        fstype: Some("ntfs-3g"),
        options: "ro",
    },
    MountAttempt {
        fstype: None,
        options: "ro,noload",
    },
    MountAttempt {
        fstype: None,
        options: "ro",
    },
];

const CORRUPTION_SIGNATURES: &[&str] = &["NTFS", "ntfs", "MFT", "corrupt", "bad superblock"];

pub fn looks_corrupted(stderr: &str) -> bool {
    CORRUPTION_SIGNATURES.iter().any(|s| stderr.contains(s))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountMode {
    ReadWrite,
    /// Mounted through a fallback; the sources must not be modified
    ReadOnly { options: String },
}

impl MountMode {
    pub fn is_read_only(&self) -> bool {
        matches!(self, MountMode::ReadOnly { .. })
    }
}

pub struct MountAdapter {
    runner: Arc<dyn ToolRunner>,
    tools: ToolsConfig,
    mount_point: PathBuf,
}

impl MountAdapter {
    pub fn new(runner: Arc<dyn ToolRunner>, tools: ToolsConfig, mount_point: PathBuf) -> Self {
        MountAdapter {
            runner,
            tools,
            mount_point,
        }
    }

    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    fn attempt_command(&self, device: &Path, attempt: &MountAttempt) -> ToolCommand {
        let mut cmd = ToolCommand::new(&self.tools.mount);
        if let Some(fstype) = attempt.fstype {
            cmd = cmd.arg("-t").arg(fstype);
        }
        cmd.arg("-o")
            .arg(attempt.options)
            .arg(device.as_os_str())
            .arg(self.mount_point.as_os_str())
    }

    fn failure(device: &Path, detail: impl Into<String>) -> PipelineError {
        PipelineError::MountFailure {
            device: device.display().to_string(),
            detail: detail.into(),
        }
    }

    /// Mount `device` at the fixed mount point.
    pub async fn mount(
        &self,
        device: &Path,
        reporter: &ProgressReporter,
    ) -> PipelineResult<MountMode> {
        // Desktop automounters may already hold the device
        self.release(device).await;

        tokio::fs::create_dir_all(&self.mount_point)
            .await
            .map_err(|e| {
                Self::failure(
                    device,
                    format!("creating mount point {}: {e}", self.mount_point.display()),
                )
            })?;

        let plain = ToolCommand::new(&self.tools.mount)
            .arg(device.as_os_str())
            .arg(self.mount_point.as_os_str());
        let output = self
            .runner
            .run(&plain)
            .await
            .map_err(|e| Self::failure(device, format!("could not run mount: {e}")))?;

        if output.success() {
            reporter.info(format!(
                "Mounted {} at {}",
                device.display(),
                self.mount_point.display()
            ));
            return Ok(MountMode::ReadWrite);
        }

        if !looks_corrupted(&output.stderr) {
            return Err(Self::failure(device, stderr_tail(&output.stderr)));
        }

        reporter.warn(format!(
            "Filesystem on {} looks damaged, trying read-only mounts: {}",
            device.display(),
            stderr_tail(&output.stderr)
        ));

        let mut last_error = stderr_tail(&output.stderr);
        for attempt in READ_ONLY_LADDER.iter() {
            let cmd = self.attempt_command(device, attempt);
            match self.runner.run(&cmd).await {
                Ok(out) if out.success() => {
                    reporter.warn(format!(
                        "Mounted {} read-only ({}); sources will be kept",
                        device.display(),
                        cmd.display()
                    ));
                    return Ok(MountMode::ReadOnly {
                        options: attempt.options.to_string(),
                    });
                }
                Ok(out) => {
                    tracing::debug!(cmd = %cmd.display(), stderr = %out.stderr, "mount fallback failed");
                    last_error = stderr_tail(&out.stderr);
                }
                Err(e) => last_error = e.to_string(),
            }
        }

        Err(Self::failure(
            device,
            format!(
                "all read-only mount attempts failed; repair the filesystem \
                 (chkdsk /f on Windows or ntfsfix) and retry. Last error: {last_error}"
            ),
        ))
    }

    /// Flush buffers and unmount the mount point. Failures are logged only.
    pub async fn unmount(&self, reporter: &ProgressReporter) {
        let flush = ToolCommand::new(&self.tools.sync);
        if let Err(e) = self.runner.run(&flush).await {
            tracing::warn!("sync before unmount failed: {e}");
        }

        let cmd = ToolCommand::new(&self.tools.umount).arg(self.mount_point.as_os_str());
        match self.runner.run(&cmd).await {
            Ok(out) if out.success() => {
                reporter.info(format!("Unmounted {}", self.mount_point.display()))
            }
            Ok(out) => reporter.warn(format!(
                "Unmount of {} failed: {}",
                self.mount_point.display(),
                stderr_tail(&out.stderr)
            )),
            Err(e) => reporter.warn(format!(
                "Unmount of {} failed: {e}",
                self.mount_point.display()
            )),
        }
    }

    /// Best-effort unmount of the device wherever it is currently mounted.
    async fn release(&self, device: &Path) {
        let cmd = ToolCommand::new(&self.tools.umount).arg(device.as_os_str());
        if let Ok(out) = self.runner.run(&cmd).await {
            if out.success() {
                tracing::debug!(device = %device.display(), "released existing mount");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corruption_signatures() {
        assert!(looks_corrupted(
            "$MFTMirr does not match $MFT (record 3).\nFailed to mount '/dev/sdb1'"
        ));
        assert!(looks_corrupted(
            "The disk contains an unclean file system (0, 0). Metadata kept in Windows cache, refused to mount. NTFS is inconsistent."
        ));
        assert!(!looks_corrupted("mount: /mnt/usb_incoming: special device /dev/sdz1 does not exist."));
    }

    #[test]
    fn test_ladder_order() {
        let opts: Vec<_> = READ_ONLY_LADDER.iter().map(|a| a.options).collect();
        assert_eq!(opts, ["ro,remove_hiberfile", "ro", "ro,noload", "ro"]);
        assert_eq!(READ_ONLY_LADDER[0].fstype, Some("ntfs-3g"));
        assert_eq!(READ_ONLY_LADDER[3].fstype, None);
    }
}
