//! dproxy preview links.
//!
//! A preview link is an unguessable token standing in for one sandbox
//! port. The [`LinkRegistry`] issues, resolves, revokes and expires them.

#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod link;
pub mod registry;

pub use link::{LinkLookup, LinkStats, PreviewLink, TOKEN_BYTES, generate_token};
pub use registry::{DEFAULT_SWEEP_INTERVAL, DEFAULT_TTL, LinkRegistry, MIN_SWEEP_INTERVAL};
