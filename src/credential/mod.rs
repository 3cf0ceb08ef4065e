//! Credential lifecycle: discovery from pluggable sources, OAuth refresh,
//! and the auto-ban/auto-recovery failure policy that keeps a bad
//! credential out of rotation without operator intervention.

pub mod events;
pub mod manager;
pub mod model;
pub mod oauth;
pub mod source;

pub use events::{CredentialEvent, EventBus, Topic};
pub use manager::CredentialManager;
pub use model::{ChangeReason, Credential, CredentialProfile, FailureClass, SourceTag};
