//! Session layer.
//!
//! - [`manager`]: registry of live sessions, creation with load progress
//! - [`state`]: one session with its busy flag and operations
//! - [`snapshot`]: on-disk cache snapshots

pub mod manager;
pub mod snapshot;
pub mod state;

pub use manager::{LoadProgress, SessionManager};
pub use snapshot::{SnapshotError, SnapshotSignature};
pub use state::{Activity, Session, SessionInfo, SnapshotLoad};
