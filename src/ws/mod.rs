//! Push gateway
//!
//! Long-lived per-session subscriptions: observers attach over a websocket
//! keyed by `sessionId`, receive full-state snapshots on every change
//! authored anywhere in the cluster, are heartbeated, and can resync after
//! a gap. Delivery is best-effort; states are absolute, so a missed push is
//! compensated by the next `STATE_UPDATE` or an explicit `STATE_SYNC`.

mod gateway;
mod messages;
mod routes;

pub use gateway::{ObserverHandle, PushGateway};
pub use messages::{ClientMessage, ServerMessage};
pub use routes::ws_handler;
