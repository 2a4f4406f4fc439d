pub mod archive;
pub mod logging;
pub mod security;
pub mod utils;

// Node runtime
pub mod container;
pub mod control_plane;
pub mod downloader;
pub mod ledger;
pub mod mount_security;
pub mod sampler;
pub mod scheduler;
pub mod spool;
pub mod workspace;

pub use archive::{pack_directory, unpack_archive};
pub use logging::init_logging;
pub use security::{check_path_traversal, sanitize_filename};
pub use utils::{Backoff, BackoffConfig, GracefulShutdown};

pub use container::{
    BuildSpec, ContainerRuntime, DockerRuntime, EngineClient, ExecProtocol, ExecSpec, ExecState,
    RunPlan, RunSpec, Streams,
};
pub use control_plane::{CompletionUploader, ControlPlane, Submission, WorkSource};
pub use downloader::{Downloader, Fetch, WorkFetcher};
pub use ledger::ResourceLedger;
pub use mount_security::{workload_mounts, MountMode, MountSpec};
pub use sampler::LoadSampler;
pub use scheduler::{run_local, Scheduler, State};
pub use spool::{Location, Spool, SpoolEntry};
pub use workspace::Workspace;
