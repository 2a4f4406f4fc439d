use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One host load sample taken while a workload runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadSample {
    pub timestamp: DateTime<Utc>,
    pub load_one: f64,
    pub load_five: f64,
    pub load_fifteen: f64,
    pub mem_used: u64,
    pub mem_total: u64,
}

/// A lifecycle marker recorded in the run's metrics store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: String,
    #[serde(default)]
    pub detail: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_event_detail_defaults() {
        let json = r#"{"timestamp": "2025-01-01T00:00:00Z", "kind": "exec_started"}"#;
        let event: RunEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.kind, "exec_started");
        assert!(event.detail.is_none());
    }
}
