use serde::{Deserialize, Serialize};

/// An amount of node capacity: whole cores and bytes of memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Limits {
    pub cores: u32,
    pub memory: u64,
}

impl Limits {
    pub const fn new(cores: u32, memory: u64) -> Self {
        Self { cores, memory }
    }

    pub fn saturating_add(self, other: Limits) -> Limits {
        Limits {
            cores: self.cores.saturating_add(other.cores),
            memory: self.memory.saturating_add(other.memory),
        }
    }

    pub fn saturating_sub(self, other: Limits) -> Limits {
        Limits {
            cores: self.cores.saturating_sub(other.cores),
            memory: self.memory.saturating_sub(other.memory),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.cores == 0 || self.memory == 0
    }
}

impl std::fmt::Display for Limits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} cores / {} bytes", self.cores, self.memory)
    }
}
