//! Top-level driver error.

use slotshare_schedule::AllocationError;
use thiserror::Error;

use crate::clients::ClientError;
use crate::config::ConfigError;
use crate::store::StoreError;

/// Errors surfaced by the control loop.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("allocation failed: {0}")]
    Allocation(#[from] AllocationError),
}

impl DriverError {
    /// Whether the loop must stop.
    ///
    /// The process never proceeds with state it could not persist, so any
    /// store failure that survived retries is fatal. Network failures are
    /// retried on the next tick.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Config(_) => true,
            Self::Store(e) => !e.is_transient(),
            Self::Client(_) => false,
            Self::Allocation(e) => !e.is_degradable(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatality() {
        assert!(DriverError::from(StoreError::Unavailable("gone".into())).is_fatal());
        assert!(!DriverError::from(StoreError::Busy("locked".into())).is_fatal());
        assert!(!DriverError::from(ClientError::Timeout(std::time::Duration::from_secs(1))).is_fatal());
        assert!(DriverError::from(ConfigError::NonPositiveCapacity).is_fatal());
        assert!(DriverError::from(AllocationError::InvalidCapacity).is_fatal());
    }
}
