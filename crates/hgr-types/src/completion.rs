use std::time::Duration;

use uuid::Uuid;

/// Outcome of one workload run, handed to the completion uploader.
#[derive(Debug, Clone)]
pub struct CompletionReport {
    pub workload_id: Uuid,
    pub duration: Duration,
    pub successful: bool,
    /// Human-readable failure cause, when the run did not succeed.
    pub cause: Option<String>,
    /// Captured stdout/stderr of the run.
    pub logs: Vec<u8>,
    /// The run's metrics store file.
    pub analytics: Vec<u8>,
}

impl CompletionReport {
    pub fn duration_ms(&self) -> u64 {
        u64::try_from(self.duration.as_millis()).unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_ms_truncates() {
        let report = CompletionReport {
            workload_id: Uuid::nil(),
            duration: Duration::from_micros(2_500),
            successful: true,
            cause: None,
            logs: Vec::new(),
            analytics: Vec::new(),
        };
        assert_eq!(report.duration_ms(), 2);
    }
}
