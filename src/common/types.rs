//! Core identifiers for cluster members
//!
//! A `ServerId` names one enlistment of one server: the slot index is reused
//! across enlistments, the generation number is not. Stale references are
//! detectable because both components must match.

use serde::{Deserialize, Serialize};

/// Identifier for one enlistment of a server.
///
/// `index` is the server's slot in the coordinator's registry (never 0);
/// `generation` counts how many times the slot has been allocated. Equality
/// requires both components, so an id held across a crash/re-enlist cycle
/// stops resolving instead of silently naming the replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerId {
    pub index: u32,
    pub generation: u32,
}

impl ServerId {
    pub fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Pack into the u64 wire representation (index high, generation low).
    pub fn as_u64(&self) -> u64 {
        (u64::from(self.index) << 32) | u64::from(self.generation)
    }

    /// Unpack from the u64 wire representation. Index 0 means "no server".
    pub fn from_u64(raw: u64) -> Option<Self> {
        let index = (raw >> 32) as u32;
        if index == 0 {
            return None;
        }
        Some(Self {
            index,
            generation: raw as u32,
        })
    }
}

impl std::fmt::Display for ServerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.index, self.generation)
    }
}

/// Set of services a server offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServiceMask(pub u32);

impl ServiceMask {
    pub const MASTER: ServiceMask = ServiceMask(1 << 0);
    pub const BACKUP: ServiceMask = ServiceMask(1 << 1);
    pub const MEMBERSHIP: ServiceMask = ServiceMask(1 << 2);

    /// Every known service bit.
    pub const ALL: ServiceMask = ServiceMask((1 << 0) | (1 << 1) | (1 << 2));

    pub fn empty() -> Self {
        ServiceMask(0)
    }

    pub fn has(&self, service: ServiceMask) -> bool {
        self.0 & service.0 != 0
    }

    /// True if this mask and `other` share any service bit.
    pub fn intersects(&self, other: ServiceMask) -> bool {
        self.0 & other.0 != 0
    }

    pub fn with(self, service: ServiceMask) -> Self {
        ServiceMask(self.0 | service.0)
    }
}

impl std::ops::BitOr for ServiceMask {
    type Output = ServiceMask;

    fn bitor(self, rhs: ServiceMask) -> ServiceMask {
        ServiceMask(self.0 | rhs.0)
    }
}

impl std::fmt::Display for ServiceMask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names = Vec::new();
        if self.has(ServiceMask::MASTER) {
            names.push("master");
        }
        if self.has(ServiceMask::BACKUP) {
            names.push("backup");
        }
        if self.has(ServiceMask::MEMBERSHIP) {
            names.push("membership");
        }
        if names.is_empty() {
            write!(f, "none")
        } else {
            write!(f, "{}", names.join("+"))
        }
    }
}

/// Lifecycle state of a registry entry. Transitions are one-way:
/// `Up → Crashed → Down`, and `Down` slots are freed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Up,
    Crashed,
    Down,
}

impl ServerStatus {
    pub fn as_u32(self) -> u32 {
        match self {
            ServerStatus::Up => 0,
            ServerStatus::Crashed => 1,
            ServerStatus::Down => 2,
        }
    }

    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(ServerStatus::Up),
            1 => Some(ServerStatus::Crashed),
            2 => Some(ServerStatus::Down),
            _ => None,
        }
    }
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerStatus::Up => write!(f, "up"),
            ServerStatus::Crashed => write!(f, "crashed"),
            ServerStatus::Down => write!(f, "down"),
        }
    }
}
