//! Error taxonomy for the protocol engine.
//!
//! With one exception every error here is fatal to its session: the
//! protocol gives a client no way to re-synchronize a cipher stream or
//! re-enter a half-finished handshake, so recovery is always "drop the
//! session, build a new one". The exception is [`ProtocolError::InvalidArgument`],
//! which is raised before anything touches the wire and leaves the
//! session fully usable.

use std::fmt;

use coda_core::codec::CodecError;
use coda_core::crypto::CryptoError;
use coda_core::wire::WireError;
use thiserror::Error;

use crate::config::ConfigError;

// ── Rejection causes ──────────────────────────────────────────────────────────

/// Why the server refused the client hello.
///
/// The sub-code arrives in the second byte of a status packet during the
/// handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectCause {
    /// 0x01 — this client build is too old; an upgrade URL follows.
    UpgradeRequired,
    /// 0x03 — no such account.
    UnknownUser,
    /// 0x04 — the account exists but may not log in.
    AccountDisabled,
    /// 0x06 — the account has not finished registration.
    IncompleteProfile,
    /// 0x09 — the account's region does not match the endpoint.
    RegionMismatch,
    /// Anything else the server may have invented since.
    Unknown(u8),
}

impl RejectCause {
    pub fn from_code(code: u8) -> Self {
        match code {
            0x01 => Self::UpgradeRequired,
            0x03 => Self::UnknownUser,
            0x04 => Self::AccountDisabled,
            0x06 => Self::IncompleteProfile,
            0x09 => Self::RegionMismatch,
            other => Self::Unknown(other),
        }
    }
}

impl fmt::Display for RejectCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UpgradeRequired => write!(f, "client upgrade required"),
            Self::UnknownUser => write!(f, "unknown user"),
            Self::AccountDisabled => write!(f, "account disabled"),
            Self::IncompleteProfile => write!(f, "profile incomplete"),
            Self::RegionMismatch => write!(f, "region mismatch"),
            Self::Unknown(code) => write!(f, "unknown server status 0x{code:02x}"),
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Socket I/O failed or the peer vanished mid-frame.
    #[error("connection lost: {0}")]
    ConnectionLost(#[source] std::io::Error),

    /// The server answered the hello with a status packet.
    #[error("handshake rejected: {cause}")]
    HandshakeRejected {
        cause: RejectCause,
        /// Where to fetch a newer client, when `cause` is
        /// [`RejectCause::UpgradeRequired`].
        upgrade_url: Option<String>,
    },

    /// The server refused the key-confirmation packet.
    #[error("authentication failed, server code 0x{code:02x}")]
    AuthFailed { code: u8 },

    /// An inbound record failed cipher MAC verification.
    #[error("packet MAC verification failed")]
    MacMismatch,

    /// A fixed constant or length constraint was violated by the peer.
    #[error("malformed handshake data: {0}")]
    Malformed(&'static str),

    /// The caller violated a payload precondition. Recoverable; nothing
    /// was sent and no session state changed.
    #[error("invalid request: {0}")]
    InvalidArgument(#[from] WireError),

    /// A record declared more data than it carried.
    #[error(transparent)]
    ShortData(#[from] CodecError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// All 65536 channel ids are live.
    #[error("channel ids exhausted")]
    ChannelsExhausted,
}
