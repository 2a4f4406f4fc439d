pub mod completion;
pub mod enums;
pub mod error;
pub mod metrics;
pub mod resources;
pub mod workload;

// Re-exports for convenience
pub use completion::CompletionReport;
pub use enums::{Arch, Os};
pub use error::{HangarError, Result, StopCause};
pub use metrics::{LoadSample, RunEvent};
pub use resources::Limits;
pub use workload::{Assignment, Credentials, WorkRequest, Workload};
