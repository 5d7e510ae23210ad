//! # slotshare-id
//!
//! Typed identifiers shared by the scheduler and the epoch driver.
//!
//! ## Kinds of ID
//!
//! - **Keys** name entities that live outside this system: coordinators,
//!   capacity providers and the contribution records coordinators emit.
//!   They wrap the external string verbatim after validation.
//! - **Generated IDs** are minted here. They use a prefixed ULID format
//!   `{prefix}_{ulid}` (for example `cmt_01HV4Z2WQXKJNM8GPQY6VBKC3D`).
//! - **Epoch indices** are plain monotonic integers.
//!
//! Keys are kept distinct at the type level so a provider id can never be
//! passed where a coordinator id is expected.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
