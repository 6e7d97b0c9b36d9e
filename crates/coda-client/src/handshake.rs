//! The login handshake.
//!
//! Four packets, strict order, plaintext on the wire:
//!
//!   H1  client hello        (identity, randoms, DH and RSA publics)
//!   H2  server hello        (server random, DH public, signed blob,
//!                            salt, canonical username, puzzle)
//!   H3  —                   (local: key derivation + puzzle search)
//!   H4  key confirmation    (transcript HMAC + puzzle solution)
//!   H5  auth status
//!
//! Both sides then derive identical session keys from the DH shared
//! secret and the byte-exact handshake transcripts, which is why every
//! byte read here is captured verbatim: one byte off and the ciphers
//! never line up, with no diagnostic beyond a dead connection.

use rand::RngCore;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use coda_core::codec::PacketReader;
use coda_core::crypto::{self, DhLocalKeys, RsaLocalKeys, SessionKeys};
use coda_core::wire;

use crate::config::SessionConfig;
use crate::error::{ProtocolError, RejectCause};

/// Everything a completed handshake hands to the transport layer.
pub(crate) struct Established {
    pub keys: SessionKeys,
    /// The login name as the server canonicalized it.
    pub username: Vec<u8>,
    /// The server's 256-byte RSA-signed authenticator.
    pub server_blob: [u8; 256],
}

impl std::fmt::Debug for Established {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Established").finish_non_exhaustive()
    }
}

/// Reads that append every byte to the handshake transcript.
struct TranscriptReader<'a, S> {
    stream: &'a mut S,
    transcript: Vec<u8>,
}

impl<'a, S: AsyncRead + Unpin> TranscriptReader<'a, S> {
    fn new(stream: &'a mut S) -> Self {
        Self {
            stream,
            transcript: Vec::new(),
        }
    }

    async fn read_exact(&mut self, n: usize) -> Result<Vec<u8>, ProtocolError> {
        let mut buf = vec![0u8; n];
        self.stream
            .read_exact(&mut buf)
            .await
            .map_err(ProtocolError::ConnectionLost)?;
        self.transcript.extend_from_slice(&buf);
        Ok(buf)
    }

    async fn read_array<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        let mut buf = [0u8; N];
        self.stream
            .read_exact(&mut buf)
            .await
            .map_err(ProtocolError::ConnectionLost)?;
        self.transcript.extend_from_slice(&buf);
        Ok(buf)
    }

    async fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.read_array::<1>().await?[0])
    }

    async fn read_u16(&mut self) -> Result<u16, ProtocolError> {
        Ok(u16::from_be_bytes(self.read_array::<2>().await?))
    }

    fn into_transcript(self) -> Vec<u8> {
        self.transcript
    }
}

/// Drive the full handshake over `stream`.
pub(crate) async fn run<S>(
    config: &SessionConfig,
    stream: &mut S,
) -> Result<Established, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // H1 — client hello.
    let mut client_random = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut client_random);
    let dh = DhLocalKeys::random();
    let rsa = RsaLocalKeys::random()?;

    let hello = wire::client_hello(
        config.client_id,
        config.client_revision,
        &client_random,
        dh.public_bytes(),
        rsa.modulus_bytes(),
        config.username.as_bytes(),
    )?;
    stream
        .write_all(&hello)
        .await
        .map_err(ProtocolError::ConnectionLost)?;
    stream.flush().await.map_err(ProtocolError::ConnectionLost)?;
    tracing::debug!(bytes = hello.len(), "sent client hello");

    // H2 — server hello, captured byte for byte.
    let mut reader = TranscriptReader::new(stream);

    let head: [u8; 2] = reader.read_array().await?;
    if head[0] != 0 {
        return Err(rejection(head[1], &mut reader).await?);
    }

    let mut server_random = [0u8; 16];
    server_random[..2].copy_from_slice(&head);
    let random_tail: [u8; 14] = reader.read_array().await?;
    server_random[2..].copy_from_slice(&random_tail);

    let dh_server_public: [u8; 96] = reader.read_array().await?;
    let server_blob: [u8; 256] = reader.read_array().await?;
    let salt: [u8; 10] = reader.read_array().await?;

    let padding_len = reader.read_u8().await?;
    if padding_len == 0 {
        return Err(ProtocolError::Malformed("zero server hello padding length"));
    }
    let username_len = reader.read_u8().await?;

    let mut block_lens = [0usize; 4];
    for len in &mut block_lens {
        *len = reader.read_u16().await? as usize;
    }

    let _padding = reader.read_exact(padding_len as usize).await?;
    let username = reader.read_exact(username_len as usize).await?;
    let trailing = reader.read_exact(block_lens.iter().sum()).await?;

    // Puzzle parameters sit at the head of the trailing block.
    let mut puzzle = PacketReader::new(&trailing);
    if puzzle.read_u8()? != 0x01 {
        return Err(ProtocolError::Malformed("bad puzzle marker"));
    }
    let denominator = puzzle.read_u8()?;
    let magic = puzzle.read_u32()?;

    let server_packet = reader.into_transcript();
    tracing::debug!(
        denominator,
        magic,
        server_hello_bytes = server_packet.len(),
        "received server hello"
    );

    // H3 — key derivation and puzzle search.
    let shared_secret = dh.shared_secret(&dh_server_public);
    let transcript: [&[u8]; 4] = [&hello, &server_packet, &salt, &username];
    let keys = crypto::derive_session_keys(&shared_secret[..], &transcript);
    let auth_hmac = crypto::hmac_sha1(&keys.hmac_key, &transcript);
    let puzzle_solution = crypto::solve_puzzle(&server_random, denominator, magic);

    // H4 — key confirmation.
    let auth = wire::auth_packet(&auth_hmac, &puzzle_solution);
    stream
        .write_all(&auth)
        .await
        .map_err(ProtocolError::ConnectionLost)?;
    stream.flush().await.map_err(ProtocolError::ConnectionLost)?;

    // H5 — auth status.
    let mut status = [0u8; 2];
    stream
        .read_exact(&mut status)
        .await
        .map_err(ProtocolError::ConnectionLost)?;
    if status[0] != 0 {
        return Err(ProtocolError::AuthFailed { code: status[1] });
    }
    let payload_len = status[1] as usize;
    if payload_len == 0 {
        return Err(ProtocolError::Malformed("zero auth status payload length"));
    }
    let mut discard = vec![0u8; payload_len];
    stream
        .read_exact(&mut discard)
        .await
        .map_err(ProtocolError::ConnectionLost)?;

    tracing::info!(
        username = %String::from_utf8_lossy(&username),
        "handshake complete, transport keys established"
    );

    Ok(Established {
        keys,
        username,
        server_blob,
    })
}

/// Consume a status packet's tail and build the rejection error.
///
/// Sub-code 0x01 carries an upgrade pointer: a 282-byte region whose
/// final byte gives the length of the URL tail that follows it.
async fn rejection<S: AsyncRead + Unpin>(
    code: u8,
    reader: &mut TranscriptReader<'_, S>,
) -> Result<ProtocolError, ProtocolError> {
    let cause = RejectCause::from_code(code);
    let upgrade_url = if cause == RejectCause::UpgradeRequired {
        let region = reader.read_exact(282).await?;
        let tail_len = region[281] as usize;
        let tail = reader.read_exact(tail_len).await?;
        Some(String::from_utf8_lossy(&tail).into_owned())
    } else {
        None
    };
    tracing::warn!(%cause, "server rejected handshake");
    Ok(ProtocolError::HandshakeRejected { cause, upgrade_url })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
