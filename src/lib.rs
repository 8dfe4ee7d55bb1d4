//! tgfilestream - HTTP streaming of files stored in Telegram messages
//!
//! Files are addressed by an opaque token that seals the message identity.
//! Byte ranges are fetched from the file's storage partition in aligned
//! chunks over a pool of partition connections and streamed back in order.
//!
//! The embedding application owns the MTProto client and the bot. It
//! implements [`telegram::MessageStore`] and [`telegram::ProtocolClient`] on
//! top of them and runs [`server::serve`].

pub mod config;
pub mod error;
pub mod locator;
pub mod logging;
pub mod server;
pub mod telegram;
pub mod transfer;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::locator::{LocatorCodec, ResourceIdentity};
    pub use crate::telegram::{FileHandle, MessageStore, ProtocolClient};
}
