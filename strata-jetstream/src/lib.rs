//! # Strata JetStream
//!
//! Durable streams, acknowledged pull consumers and key-value buckets for
//! the Strata messaging server.
//!
//! This crate provides:
//! - Streams with count, byte and age retention and limits/interest/work-queue policies
//! - Pull consumers with explicit acknowledgement, redelivery and backpressure
//! - Key-value buckets with monotonic revisions
//! - The `$JS.API` administrative request dispatcher
//!
//! ## Examples
//!
//! ```rust
//! use std::{sync::Arc, time::Duration};
//! use strata_core::{config::JetStreamConfig, Message};
//! use strata_jetstream::{ConsumerConfig, JetStreamEngine, StreamConfig};
//! use strata_storage::MemoryBackend;
//!
//! # async fn example() -> strata_core::Result<()> {
//! let engine = JetStreamEngine::new(JetStreamConfig::default(), Arc::new(MemoryBackend::new()));
//! engine.create_stream(StreamConfig::new("ORDERS", ["orders.*"]))?;
//! let consumer = engine.create_consumer("ORDERS", ConsumerConfig::durable("worker"), None)?;
//!
//! engine.ingest(&Message::new("orders.new", "42")?);
//!
//! for delivery in consumer.next_batch(10, Duration::from_secs(1), false).await? {
//!     consumer.ack(delivery.ack.stream_seq);
//! }
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod ack;
pub mod api;
pub mod config;
pub mod consumer;
pub mod engine;
pub mod kv;
pub mod stream;

pub use ack::{AckKind, AckSubject};
pub use api::{ApiRequest, KvOperation, PullRequest};
pub use config::{
    AckPolicy, ConsumerConfig, DeliverPolicy, DiscardPolicy, ReplayPolicy, RetentionPolicy,
    StreamConfig,
};
pub use consumer::{Consumer, ConsumerInfo, ConsumerState, Delivery, SequenceInfo};
pub use engine::{ApiReply, JetStreamEngine, PullTicket};
pub use kv::{KvBucket, KvEntry};
pub use stream::{MsgGetRequest, PubAck, PurgeRequest, Stream, StreamInfo, StreamState};
pub use strata_core::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::{
        ConsumerConfig, Delivery, JetStreamEngine, PubAck, Stream, StreamConfig, StreamInfo,
    };
    pub use strata_core::prelude::*;
}
