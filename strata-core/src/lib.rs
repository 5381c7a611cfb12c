//! # Strata Core
//!
//! Foundational types for the Strata messaging server.
//!
//! Strata speaks the NATS client protocol and layers durable streams,
//! acknowledged consumers and key-value buckets on top of plain
//! publish/subscribe. This crate holds everything the other layers share.
//!
//! ## Features
//!
//! - **Subjects**: validation and `*` / `>` wildcard matching
//! - **Wire Protocol**: incremental decoder and encoder for the text protocol
//! - **Messages**: immutable messages with NATS/1.0 headers
//! - **Configuration**: layered TOML + environment loading with validation
//! - **Telemetry**: `tracing-subscriber` setup with text or JSON output
//!
//! ## Quick Start
//!
//! ```rust
//! use strata_core::{subject, Message};
//!
//! let message = Message::new("orders.new", "hello").unwrap();
//! assert!(subject::matches("orders.*", message.subject.as_str()));
//! ```
//!
//! ## Architecture
//!
//! - [`message`]: Message types and builders
//! - [`subject`]: Subject validation and matching
//! - [`protocol`]: Client/server operations and their wire codec
//! - [`config`]: Configuration management and validation
//! - [`error`]: Error types and result handling
//! - [`types`]: Core type definitions and serde helpers
//! - [`telemetry`]: Log subscriber installation
//! - [`prelude`]: Common imports for convenient usage

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod message;
pub mod prelude;
pub mod protocol;
pub mod subject;
pub mod telemetry;
pub mod types;

pub use crate::{
    config::StrataConfig,
    error::{Error, Result},
    message::{Message, MessageBuilder},
    protocol::Headers,
    subject::Subject,
    types::{ConnectionId, Sequence, Timestamp},
};

/// Crate version, advertised in `INFO`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
