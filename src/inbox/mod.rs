//! Local notification state.
//!
//! - [`model`] - canonical [`NotificationRecord`] and set helpers
//! - [`normalize`] - server payloads to canonical records
//! - [`reconciler`] - the [`Reconciler`] that owns and synchronizes state

pub mod model;
pub mod normalize;
pub mod reconciler;

pub use model::{NotificationRecord, Priority};
pub use normalize::{normalize_count, normalize_list, normalize_record};
pub use reconciler::{IdentityTransition, InboxSnapshot, Reconciler, RefreshOutcome};
