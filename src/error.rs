//! Crate-wide error type.
//!
//! Follows the behavioural taxonomy of the design doc: transient I/O, source-gone,
//! configuration, resource-exhaustion, protocol and fatal/corrupt errors are each
//! their own variant rather than being collapsed into a single opaque string, so
//! callers can match on the ones they can recover from (`PublisherGone`,
//! `NoFreeSlot`) and simply log-and-propagate the rest.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt data: {0}")]
    Corrupt(&'static str),

    #[error("another publisher already owns channel {0:?}")]
    PublisherAlreadyActive(PathBuf),

    #[error("publisher is gone")]
    PublisherGone,

    #[error("no free subscriber slot")]
    NoFreeSlot,

    #[error("payload of {len} bytes exceeds max_payload of {max}")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("protocol error: {0}")]
    Protocol(&'static str),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("unsupported: {0}")]
    Unsupported(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
