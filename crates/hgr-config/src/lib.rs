pub mod config;
pub mod watcher;

pub use config::Config;
pub use watcher::ConfigWatcher;
