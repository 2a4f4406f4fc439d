pub mod demux;
pub mod docker;
pub mod engine;
pub mod exec;
pub mod runtime;
pub mod tty;

pub use docker::DockerRuntime;
pub use engine::EngineClient;
pub use exec::{ExecProtocol, RunPlan, Streams};
pub use runtime::{BuildSpec, ContainerRuntime, ExecSpec, ExecState, ExecStream, RunSpec};
