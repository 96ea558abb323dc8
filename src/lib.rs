//! Core of a host-local video-surveillance toolkit.
//!
//! The hard part lives in five modules: [`reactor`] (the single-threaded event
//! loop every binary is built on), [`pubchannel`] (the shared-memory video bus),
//! [`framecache`] + [`filestore`] (deferred-commit recording), [`motion`]
//! (frame-to-frame change detection), and [`http`] (the streaming server). The
//! remaining modules ([`rtp`], [`commandbus`], [`image`]) round out the data
//! flow between capture, network, and the bus.

pub mod commandbus;
pub mod error;
pub mod filestore;
pub mod framecache;
pub mod http;
pub mod image;
pub mod motion;
pub mod pubchannel;
pub mod reactor;
pub mod rtp;

pub use error::{Error, Result};
