//! Encrypted packet transport.
//!
//! Post-handshake, every message is an independently encrypted record:
//!
//!   u8  command | u16 payload_length | payload | mac[4]
//!
//! Everything before the MAC is transformed in place by the stream
//! cipher, keyed per direction and nonced with that direction's 32-bit
//! IV. IVs start at zero and advance by exactly one per record, never
//! skipped and never reused; a desynchronized IV turns every later
//! record into garbage, so the send path serializes under one lock and
//! the receive path has a single owner.

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use coda_core::wire::{self, Command};
use shannon::Shannon;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::error::ProtocolError;

/// Bytes of the encrypted record header (command + payload length).
pub const HEADER_LEN: usize = 3;

/// Bytes of cipher MAC trailing every record.
pub const MAC_LEN: usize = 4;

// ── Send path ─────────────────────────────────────────────────────────────────

struct SendHalf<W> {
    stream: W,
    cipher: Shannon,
    iv: u32,
}

/// Shared, cloneable handle to the session's send half.
///
/// Nonce draw, encryption, MAC, and the socket write happen under one
/// lock, so records reach the wire in lock-acquisition order — which is
/// exactly the order their nonces were drawn in.
pub struct PacketSender<W> {
    inner: Arc<Mutex<SendHalf<W>>>,
}

impl<W> Clone for PacketSender<W> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<W: AsyncWrite + Unpin> PacketSender<W> {
    /// Wrap a write half with a cipher keyed for the client-to-server
    /// direction. The IV starts at zero.
    pub fn new(stream: W, key: &[u8]) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SendHalf {
                stream,
                cipher: Shannon::new(key),
                iv: 0,
            })),
        }
    }

    pub async fn send(&self, command: Command, payload: &[u8]) -> Result<(), ProtocolError> {
        self.send_raw(command.into(), payload).await
    }

    /// Encrypt and emit one record.
    pub async fn send_raw(&self, command: u8, payload: &[u8]) -> Result<(), ProtocolError> {
        if payload.len() > wire::MAX_PAYLOAD {
            return Err(wire::WireError::PayloadTooLarge(payload.len()).into());
        }

        let mut guard = self.inner.lock().await;
        let SendHalf { stream, cipher, iv } = &mut *guard;

        cipher.nonce(&iv.to_be_bytes());

        let mut frame = BytesMut::with_capacity(HEADER_LEN + payload.len() + MAC_LEN);
        frame.put_u8(command);
        frame.put_u16(payload.len() as u16);
        frame.put_slice(payload);
        cipher.encrypt(&mut frame[..]);

        let mut mac = [0u8; MAC_LEN];
        cipher.finish(&mut mac);
        frame.put_slice(&mac);

        stream
            .write_all(&frame)
            .await
            .map_err(ProtocolError::ConnectionLost)?;
        stream.flush().await.map_err(ProtocolError::ConnectionLost)?;

        *iv = iv.wrapping_add(1);
        Ok(())
    }

    /// The nonce the next record will be encrypted under — equal to the
    /// number of records sent so far.
    pub async fn iv(&self) -> u32 {
        self.inner.lock().await.iv
    }
}

// ── Receive path ──────────────────────────────────────────────────────────────

/// The session's receive half. Exactly one owner; the receive loop.
pub struct PacketReceiver<R> {
    stream: R,
    cipher: Shannon,
    iv: u32,
}

impl<R: AsyncRead + Unpin> PacketReceiver<R> {
    /// Wrap a read half with a cipher keyed for the server-to-client
    /// direction. The IV starts at zero.
    pub fn new(stream: R, key: &[u8]) -> Self {
        Self {
            stream,
            cipher: Shannon::new(key),
            iv: 0,
        }
    }

    /// Read, decrypt, and verify one record.
    ///
    /// EOF mid-frame is a lost connection; a MAC mismatch means the
    /// stream is corrupt or tampered with and the session is done for
    /// either way.
    pub async fn recv(&mut self) -> Result<(u8, Bytes), ProtocolError> {
        let mut header = [0u8; HEADER_LEN];
        self.stream
            .read_exact(&mut header)
            .await
            .map_err(ProtocolError::ConnectionLost)?;

        self.cipher.nonce(&self.iv.to_be_bytes());
        self.cipher.decrypt(&mut header);
        let command = header[0];
        let payload_len = u16::from_be_bytes([header[1], header[2]]) as usize;

        let mut body = vec![0u8; payload_len + MAC_LEN];
        self.stream
            .read_exact(&mut body)
            .await
            .map_err(ProtocolError::ConnectionLost)?;

        let (payload, mac) = body.split_at_mut(payload_len);
        self.cipher.decrypt(payload);

        let mut expected = [0u8; MAC_LEN];
        self.cipher.finish(&mut expected);
        if *mac != expected {
            return Err(ProtocolError::MacMismatch);
        }

        self.iv = self.iv.wrapping_add(1);
        body.truncate(payload_len);
        Ok((command, Bytes::from(body)))
    }

    /// The nonce the next record will be decrypted under.
    pub fn iv(&self) -> u32 {
        self.iv
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
