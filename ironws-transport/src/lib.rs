//! # IronWS Transport
//!
//! Network transport layer for WebSocket messaging.
//!
//! This crate provides:
//! - [`tcp`] - Listening socket setup and the WebSocket upgrade of accepted streams
//! - [`error`] - Transport error types, including the setup stage that failed

pub mod error;
pub mod tcp;

pub use error::{SetupStage, TransportError};
