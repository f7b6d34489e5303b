//! Serve a directory tree over HTTP as a tar archive.
//!
//! The archive is produced on the fly: a blocking task walks the tree and encodes tar entries
//! into a [`bridge`], and the HTTP response body drains the other end.  Nothing is buffered
//! beyond a single chunk, so a slow client throttles the filesystem walk instead of filling
//! memory.

pub mod auth;
pub mod bridge;
pub mod config;
pub mod encoder;
pub mod error;
pub mod handler;
pub mod lifecycle;
pub mod policy;
pub mod server;

pub use error::{Error, Result};

/// Size of a tar block.  Headers occupy exactly one block and file content is padded to a
/// multiple of it.
pub const TAR_BLOCK_SIZE: usize = 512;

/// Upper bound for a single chunk handed from the encoder to the HTTP body.
pub const CHUNK_SIZE: usize = 64 * 1024;
