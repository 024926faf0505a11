//! Discover cast devices and drive media playback on them.
//!
//! `mdns` finds a device, `async_client::Client` holds the control session,
//! and the receiver and media controls are methods on `Client`.

#[macro_use]
mod util;
pub use util::named;

#[cfg(feature = "clap")]
pub mod args;
pub mod async_client;
pub mod cast;
pub mod codec;
pub mod error;
mod heartbeat;
pub mod mdns;
pub mod media;
pub mod message;
pub mod payload;
pub mod receiver;
pub mod types;

#[cfg(test)]
mod test_util;

pub use async_client::{Client, Config};
pub use error::{CloseReason, Error};
