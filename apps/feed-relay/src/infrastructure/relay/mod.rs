//! Client Fan-out Router
//!
//! Admission control, per-session queues and the hub task that binds every
//! downstream session to the shared upstream link.

mod hub;
mod session;

pub use hub::{RelayError, RelayHandle, RelayHub, RelaySettings, RelaySnapshot};
pub use session::{ClientConnection, ClientSession, Delivery, OutboundFrame, SessionCounter};
