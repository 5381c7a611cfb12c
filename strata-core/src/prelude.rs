//! # Prelude
//!
//! Commonly used types and traits from Strata Core.

pub use crate::{
    config::{ConfigLoader, StrataConfig},
    error::{Error, Result},
    message::{Message, MessageBuilder},
    protocol::{ClientOp, Headers, ServerOp},
    subject::{matches, Subject},
    types::{ConnectionId, Sequence, Timestamp},
};

pub use bytes::Bytes;
pub use chrono::{DateTime, Utc};
