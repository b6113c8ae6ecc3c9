//! News digests
//!
//! Turns feed entries into one room message per run, skipping links the room
//! has already seen. Fetching feeds and reading room history are left to the
//! caller; this module only composes and parses message bodies.

pub mod digest;

pub use digest::{compose_digest, extract_links, upgrade_link, Digest, FeedEntry, NewsSource};
