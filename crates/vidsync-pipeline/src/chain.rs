//! Follow-on jobs derived from a finished stage.
//!
//! Stages never enqueue anything themselves. These functions turn a stage's
//! payload and report into the next payload, and the scheduler enqueues it
//! once the completion has been recorded.

use vidsync_core::types::{
    MergePayload, StabilizeMode, StabilizePayload, SyncPayload, TerminalStatus,
};

use crate::merge::MergeReport;
use crate::sync::SyncReport;

/// Merge job for a completed sync, when the device wants merging.
pub fn after_sync(
    payload: &SyncPayload,
    report: &SyncReport,
    output_folder_name: &str,
) -> Option<MergePayload> {
    if !payload.config.merger_enabled || report.status != TerminalStatus::Completed {
        return None;
    }
    Some(MergePayload {
        uuid: payload.uuid.clone(),
        config: payload.config.clone(),
        target_folder: report.target_folder.clone(),
        output_folder: Some(report.device_folder.join(output_folder_name)),
        should_stabilize_after_merge: payload.config.stabilize_after_merge,
    })
}

/// Stabilize job over exactly the outputs of this merge run.
pub fn after_merge(payload: &MergePayload, report: &MergeReport) -> Option<StabilizePayload> {
    if !payload.should_stabilize_after_merge || report.outputs.is_empty() {
        return None;
    }
    Some(StabilizePayload {
        uuid: payload.uuid.clone(),
        config: payload.config.clone(),
        target_folder: report.output_folder.clone(),
        mode: StabilizeMode::Merged,
        inputs: report.output_paths(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use vidsync_core::device::DeviceConfig;

    fn sync_report(status: TerminalStatus) -> SyncReport {
        SyncReport {
            success: true,
            uuid: "ABCD-1234".into(),
            device_name: "Mavic".into(),
            status,
            files_moved: 3,
            files_skipped: 0,
            total_size: 300,
            duration_seconds: 1.0,
            device_folder: PathBuf::from("/share/mavic"),
            target_folder: PathBuf::from("/share/mavic/2024-05-01_10-00-00"),
            files: Vec::new(),
            logs: Vec::new(),
            dry_run: false,
            read_only: false,
        }
    }

    fn sync_payload(merger: bool, stabilize: bool) -> SyncPayload {
        let mut config = DeviceConfig::new("ABCD-1234");
        config.merger_enabled = merger;
        config.stabilize_after_merge = stabilize;
        SyncPayload {
            device_handle: "sdb1".into(),
            uuid: "ABCD-1234".into(),
            config,
        }
    }

    #[test]
    fn test_after_sync_targets_sync_folder() {
        let merge = after_sync(
            &sync_payload(true, true),
            &sync_report(TerminalStatus::Completed),
            "output",
        )
        .unwrap();
        assert_eq!(
            merge.target_folder,
            PathBuf::from("/share/mavic/2024-05-01_10-00-00")
        );
        assert_eq!(merge.output_folder, Some(PathBuf::from("/share/mavic/output")));
        assert!(merge.should_stabilize_after_merge);
    }

    #[test]
    fn test_no_merge_without_flag_or_files() {
        let done = sync_report(TerminalStatus::Completed);
        assert!(after_sync(&sync_payload(false, false), &done, "output").is_none());
        let empty = sync_report(TerminalStatus::NothingToDo);
        assert!(after_sync(&sync_payload(true, false), &empty, "output").is_none());
    }

    #[test]
    fn test_after_merge_restricts_to_outputs() {
        let payload = MergePayload {
            uuid: "ABCD-1234".into(),
            config: DeviceConfig::new("ABCD-1234"),
            target_folder: PathBuf::from("/share/mavic/2024-05-01_10-00-00"),
            output_folder: Some(PathBuf::from("/share/mavic/output")),
            should_stabilize_after_merge: true,
        };
        let report = MergeReport {
            success: true,
            uuid: "ABCD-1234".into(),
            status: TerminalStatus::Completed,
            target_folder: payload.target_folder.clone(),
            output_folder: PathBuf::from("/share/mavic/output"),
            flights: 1,
            outputs: vec!["Mavic_20240501T100000000Z_0.mp4".into()],
            merges: Vec::new(),
            skipped: Vec::new(),
            logs: Vec::new(),
            duration_seconds: 0.5,
        };
        let stab = after_merge(&payload, &report).unwrap();
        assert_eq!(stab.mode, StabilizeMode::Merged);
        assert_eq!(
            stab.inputs,
            [PathBuf::from("/share/mavic/output/Mavic_20240501T100000000Z_0.mp4")]
        );

        let no_flag = MergePayload {
            should_stabilize_after_merge: false,
            ..payload
        };
        assert!(after_merge(&no_flag, &report).is_none());
    }
}
