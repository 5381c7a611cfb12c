//! # Strata Broker
//!
//! The network-facing half of Strata: a NATS-compatible TCP server that
//! routes core publishes through a subject trie and hands the reserved
//! `$JS.API`, `$JS.ACK` and `$KV` namespaces to the JetStream engine.
//!
//! This crate provides:
//! - Client sessions speaking the text wire protocol
//! - Subject-trie fan-out with queue groups and auto-unsubscribe
//! - Pull delivery for stream consumers and key-value requests
//! - Bounded per-client outbound queues with slow-consumer eviction
//! - The `strata-server` binary
//!
//! ## Examples
//!
//! ```rust,no_run
//! use strata_broker::Broker;
//! use strata_core::config::StrataConfig;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = Broker::new(StrataConfig::default())?;
//! let handle = broker.start().await?;
//! println!("listening on {}", handle.local_addr());
//! handle.shutdown().await?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod broker;
pub mod network;
pub mod routing;

pub use broker::{Broker, BrokerHandle, BrokerState, BrokerStats};
pub use routing::{Subscription, SubscriptionIndex};
pub use strata_core::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::{Broker, BrokerHandle, BrokerState};
    pub use strata_core::prelude::*;
}
