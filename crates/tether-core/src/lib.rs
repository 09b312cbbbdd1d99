//! # tether-core
//!
//! Foundation types for the tether connector.
//!
//! This crate provides the shared vocabulary the client crate builds on:
//!
//! - **Envelope**: the decoded wire message (`type` / `correlationId` /
//!   `actionOrder` plus an opaque payload)
//! - **Errors**: [`errors::TetherError`] taxonomy via `thiserror`, plus the
//!   [`errors::TransportError`] raised by transport implementations
//! - **Logging**: [`logging::init_subscriber`] for `tracing` setup

#![deny(unsafe_code)]

pub mod envelope;
pub mod errors;
pub mod logging;

pub use envelope::{AUTHENTICATE, AuthMessage, CONNECTION_ESTABLISHED, Envelope};
pub use errors::{RejectReason, TetherError, TransportError, TransportErrorKind};
