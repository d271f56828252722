pub mod config;
pub mod device;
pub mod error;
pub mod events;
pub mod progress;
pub mod types;

pub use error::{PipelineError, PipelineResult, ToolFailureKind};
pub use events::{Event, Publisher};
pub use progress::{ProgressReporter, StageUpdate};
