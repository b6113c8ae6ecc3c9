//! Courier - federated chat bot
//!
//! Answers interactive emoji (SAS) device verification requests and posts
//! deduplicated news digests to rooms.
//!
//! Key principles:
//! - One session per transaction, cancellable at every step
//! - A pending human decision never stalls other handshakes
//! - Crypto and transport stay behind traits

pub mod news;
pub mod verification;
