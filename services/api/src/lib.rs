//! Darwin API Library Crate
//!
//! This library contains the web layer around the conversation core: the
//! application state, REST handlers for topic presets, the WebSocket
//! conversation protocol, and routing. The binaries are thin wrappers
//! around this library.

pub mod config;
pub mod handlers;
pub mod models;
pub mod router;
pub mod state;
pub mod ws;
