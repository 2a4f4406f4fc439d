pub mod connection;
pub mod events;
pub mod samples;

pub use connection::MetricsStore;
pub use events::EventRepository;
pub use samples::SampleRepository;
