//! coda-client — async engine for the streaming service's session protocol.
//!
//! The engine owns three things and nothing else:
//!
//!   1. the authenticated login handshake (DH agreement, server blob,
//!      proof-of-work puzzle, HMAC key confirmation)
//!   2. the encrypted packet transport layered on the handshake's keys
//!   3. the channel registry multiplexing many logical replies onto the
//!      one cipher stream
//!
//! Discovery, the media object graph inside channel payloads, and
//! playback all live with the embedding application.
//!
//! ```no_run
//! use std::sync::Arc;
//! use coda_client::{connect, SessionConfig};
//!
//! # async fn example(listener: Arc<dyn coda_client::ChannelListener>) -> anyhow::Result<()> {
//! let stream = tokio::net::TcpStream::connect("ap.example.net:4070").await?;
//! let mut config = SessionConfig::load()?;
//! config.username = "alice".into();
//!
//! let connection = connect(config, stream).await?;
//! let (client, _pump) = connection.start();
//! client.search("misty mountains", 0, 10, listener).await?;
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod config;
pub mod error;
pub mod session;
pub mod transport;

mod handshake;

pub use channel::{ChannelId, ChannelKind, ChannelListener, CommandListener};
pub use config::{ConfigError, SessionConfig};
pub use error::{ProtocolError, RejectCause};
pub use session::{connect, Client, Connection};

pub use coda_core::wire::{BrowseKind, Command, SEARCH_UNLIMITED};
