//! Mindcycle Gateway - display fan-out over WebSocket and sensor ingress over HTTP

pub mod server;
pub mod ws;

pub use server::{router, start_gateway, ApiError, GatewayState};
