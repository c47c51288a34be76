//! Configuration persistence behind a trait seam.
//!
//! The relay only ever talks to [`ConfigStore`]; the in-memory
//! implementation backs the server today and every test.

mod memory;

pub use memory::MemoryStore;

use thiserror::Error;
use uuid::Uuid;

use crate::model::{Action, Profile};

/// Storage errors. Activation failures are transactional: the store
/// guarantees no flag was changed when an error comes back.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Profile not found: {id}")]
    ProfileNotFound { id: Uuid },

    #[error("Activation transaction failed: {message}")]
    Transaction { message: String },
}

/// Persistence seam for profiles and automation rules.
pub trait ConfigStore: Send + Sync {
    /// All stored profiles, activation flags included.
    fn profiles(&self) -> Result<Vec<Profile>, StoreError>;

    /// The automation rules owned by one profile, in insertion order.
    /// Rule evaluation is first-match-wins over exactly this order.
    fn actions_for(&self, profile_id: Uuid) -> Result<Vec<Action>, StoreError>;

    /// Atomically deactivate every profile and activate the target.
    ///
    /// Fails without side effects when the target does not exist, so
    /// the previously active profile stays active.
    fn activate(&self, profile_id: Uuid) -> Result<(), StoreError>;
}
