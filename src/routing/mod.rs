//! Routing strategy: sticky header overrides, round-robin selection,
//! cooldown backoff, and persistence of routing state across restarts.

pub mod strategy;

pub use strategy::{CooldownSnapshot, PickInfo, PickReason, RoutingStateSnapshot, RoutingStrategy};
