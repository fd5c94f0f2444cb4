//! wssh - browser-to-SSH terminal relay.
//!
//! Multiplexes terminal sessions from browser WebSocket clients onto remote
//! SSH shells. See [`gateway::Gateway`] for the message flow and
//! [`api::router`] for the HTTP/WebSocket surface.

pub mod api;
pub mod config;
pub mod driver;
pub mod error;
pub mod gateway;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod shutdown;
pub mod ssh;
