//! psm-reconcile
//!
//! Source → target reconciliation for property collections.
//!
//! - Target drift (out-of-band edits) is detected by fingerprint comparison
//!   and never overwritten automatically.
//! - Every mutation is preceded by a snapshot committed in the same
//!   transaction as the update.
//! - One run per (tenant, target) at a time; a second caller fails fast.
//!
//! No SQL here. Storage is reached through [`RecordStore`].

pub mod cancel;
pub mod conflict;
pub mod context;
pub mod engine;
pub mod error;
pub mod record;
pub mod snapshot;
pub mod store;

pub use cancel::CancelFlag;
pub use conflict::{detect, drift_warning, manual_edit_warning, ConflictState};
pub use context::{Clock, SyncContext, SystemClock};
pub use engine::SyncEngine;
pub use error::{RecordError, RunError, StoreError};
pub use snapshot::Mutation;
pub use store::{RecordStore, RecordUpdate};
