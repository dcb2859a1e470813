//! Shared data model, configuration, clock abstraction, and persistence
//! contract for the fleet control plane. Every other crate in the workspace
//! depends on this one; it depends on nothing else in the workspace.

pub mod clock;
pub mod config;
pub mod persistence;
pub mod types;
