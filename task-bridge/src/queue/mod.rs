//! Queue module for RabbitMQ operations.
//!
//! This module provides:
//! - The wire envelope and its JSON codec
//! - A transactional publisher for enqueueing batches of envelopes
//!
//! ## Message flow
//!
//! ```text
//! HTTP route → Publisher → queue → Dispatcher → TaskRegistry → handler
//! ```

pub mod envelope;
pub mod publisher;

pub use envelope::{decode, encode, CodecError, Envelope, DEFAULT_QUEUE};
pub use publisher::{PublishError, Publisher};
