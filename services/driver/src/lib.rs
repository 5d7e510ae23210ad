//! slotshare epoch driver
//!
//! Divides a fixed epoch of provider capacity among coordinators by
//! stake, collects the contributions coordinators score, and commits a
//! normalized reward vector to the ledger once per epoch.
//!
//! ## Architecture
//!
//! - **Driver**: a single control loop that walks the epoch state machine
//!   (`Scheduling → Polling → Aggregating → Committing`) and persists a
//!   checkpoint after every transition
//! - **Poller**: one task per coordinator endpoint, bounded by a semaphore,
//!   merged through a single channel
//! - **Aggregator**: the only writer of score state; EMA per dimension
//! - **Weight setter**: normalizes a frozen snapshot and commits it with
//!   bounded retry
//! - **Store**: SQLite-backed persistence, the source of truth on restart

pub mod aggregator;
pub mod backoff;
pub mod cli;
pub mod clients;
pub mod config;
pub mod driver;
pub mod epoch;
pub mod error;
pub mod model;
pub mod poller;
pub mod store;
pub mod weights;

pub use config::Config;
pub use driver::{DriverDeps, EpochDriver};
pub use error::DriverError;
