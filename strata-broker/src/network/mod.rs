//! Network handling for client connections.
//!
//! ## Key Components
//! - [`TcpServer`] - binds the listener and owns the shutdown signal
//! - [`TcpListener`] - accept loop, socket options, capacity checks
//! - [`Session`] - per-connection command loop and writer task
//! - [`Connection`] - shared client state and its bounded outbound queue
//! - [`ConnectionManager`] - the live-connection set
//!
//! ## Examples
//!
//! ```rust,no_run
//! use strata_broker::{broker::BrokerState, network::TcpServer};
//! use strata_core::config::StrataConfig;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let state = BrokerState::new(StrataConfig::default())?;
//! let mut server = TcpServer::start(state).await?;
//! println!("listening on {}", server.local_addr());
//! server.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod listener;
pub mod server;
pub mod session;

pub use connection::{Connection, ConnectionManager, ConnectionStats};
pub use listener::TcpListener;
pub use server::TcpServer;
pub use session::Session;
