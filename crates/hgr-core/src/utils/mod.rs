pub mod backoff;
pub mod shutdown;

pub use backoff::{Backoff, BackoffConfig};
pub use shutdown::GracefulShutdown;
