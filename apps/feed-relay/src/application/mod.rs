//! Application Layer - Port definitions.
//!
//! Interfaces through which the relay core reaches the upstream exchange
//! and consumer-side persistence.

/// Port interfaces for the upstream link and preference storage.
pub mod ports;
