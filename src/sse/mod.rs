//! Real-time progress fan-out over server-sent events.

pub mod hub;
pub mod routes;

pub use hub::{ConnectionHandle, EventName, OutboundEvent, SseHub};
