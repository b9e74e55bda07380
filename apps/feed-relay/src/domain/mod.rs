//! Domain Layer - Core relay types and business logic.
//!
//! Pure types with no I/O: link lifecycle, subscription bookkeeping and
//! frame classification. Everything here is testable without a transport.

/// Link lifecycle state machine and backoff policy.
pub mod connection;

/// Upstream, client and relay frame classification.
pub mod frame;

/// Subscription identity and reference-counted registry.
pub mod subscription;
