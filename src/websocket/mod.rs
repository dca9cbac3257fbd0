//! Socket transport primitives and the authentication state machine.
//!
//! The frame transport itself (accepting upgrades, reading/writing frames)
//! is an external collaborator; what lives here is connection bookkeeping
//! ([`handler`]) and the authenticate/refresh/logout transition logic
//! ([`auth`]) that a transport wires its frames into.

pub mod auth;
mod config;
mod handler;

pub use auth::{AuthOutcome, ConnectionState, SocketAuthenticator};
pub use config::WebSocketConfig;
pub use handler::{ConnectionId, WebSocketConnection};

pub use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
