use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::enums::{Arch, Os};
use crate::resources::Limits;

/// Immutable description of one unit of work, persisted as `metadata.json`
/// next to the workload's archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workload {
    pub id: Uuid,
    /// Module path, relative to the unpacked archive, handed to the runtime.
    pub entry: String,
    /// Time-to-live in milliseconds.
    pub ttl: u64,
    pub cores: u32,
    /// Requested memory in bytes.
    pub memory: u64,
    pub arch: Arch,
    pub os: Os,
    #[serde(default)]
    pub allow_shared: bool,
    #[serde(default)]
    pub vcs_uri: String,
    #[serde(default)]
    pub account_id: String,
    #[serde(default)]
    pub labels: BTreeSet<String>,
}

impl Workload {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl)
    }

    /// Resources this workload reserves while it runs.
    pub fn limits(&self) -> Limits {
        Limits::new(self.cores, self.memory)
    }

    /// Name of the container that runs this workload.
    pub fn container_name(&self) -> String {
        format!("hangar-{}", self.id)
    }

    /// Tag of the image built for this workload.
    pub fn image_tag(&self) -> String {
        format!("hangar-workload:{}", self.id)
    }
}

/// A workload handed out by the control plane together with the
/// credential the run needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub workload: Workload,
    #[serde(default)]
    pub token: String,
}

/// Credentials persisted alongside a spooled workload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub token: String,
}

/// Resource filter sent when asking the control plane for work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkRequest {
    pub os: Os,
    pub arch: Arch,
    pub cores: u32,
    pub memory: u64,
}
