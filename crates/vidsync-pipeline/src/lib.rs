//! vidsync-pipeline: device sync, flight grouping, merge and stabilization stages

pub mod cache;
pub mod chain;
pub mod copy;
pub mod dates;
pub mod flight;
pub mod merge;
pub mod mount;
pub mod probe;
pub mod scan;
pub mod stabilize;
pub mod sync;
pub mod thumbnail;
pub mod tools;

pub use cache::{CacheBackend, CopyDecision, CopyReason, FingerprintStore, SharedCache};
pub use flight::{Flight, group_clips, group_flights};
pub use merge::{MergeReport, MergeStage};
pub use stabilize::{GpuStatus, StabilizeReport, StabilizeStage};
pub use sync::{SyncReport, SyncStage};
pub use tools::{SystemRunner, ToolCommand, ToolOutput, ToolRunner};
