//! In-process mock access point.
//!
//! Speaks the server side of the protocol over a duplex pipe with fixed
//! randomness, so every scenario is deterministic: it parses the real
//! client hello, serves a real server hello, derives the session keys
//! from its own side of the DH exchange, and refuses to come up if the
//! client's confirmation HMAC or puzzle solution is wrong.

use anyhow::{bail, Context, Result};
use coda_core::crypto::{self, DhLocalKeys};
use shannon::Shannon;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

/// Fixed server-side handshake inputs.
pub struct MockConfig {
    /// First byte must be zero — a non-zero first byte is a status packet.
    pub server_random: [u8; 16],
    pub salt: [u8; 10],
    pub padding: Vec<u8>,
    pub puzzle_marker: u8,
    pub puzzle_denominator: u8,
    pub puzzle_magic: u32,
    /// Replace the client's login name with this canonical form.
    pub canonical_username: Option<Vec<u8>>,
    /// Refuse the key confirmation with this sub-code instead of
    /// accepting it.
    pub reject_auth: Option<u8>,
}

impl Default for MockConfig {
    fn default() -> Self {
        let mut server_random = [0u8; 16];
        for (i, byte) in server_random.iter_mut().enumerate().skip(1) {
            *byte = 0x20 + i as u8;
        }
        let mut salt = [0u8; 10];
        for (i, byte) in salt.iter_mut().enumerate() {
            *byte = 0x30 + i as u8;
        }
        Self {
            server_random,
            salt,
            padding: vec![0xa5],
            puzzle_marker: 0x01,
            puzzle_denominator: 8,
            puzzle_magic: 0x0102_0304,
            canonical_username: None,
            reject_auth: None,
        }
    }
}

/// A mock server that finished the handshake and keys its ciphers.
pub struct ServerSession {
    stream: DuplexStream,
    send_cipher: Shannon,
    recv_cipher: Shannon,
    send_iv: u32,
    recv_iv: u32,
    /// The client hello, byte for byte as received.
    pub client_hello: Vec<u8>,
    /// The login name the server settled on.
    pub username: Vec<u8>,
    /// The puzzle solution the client submitted.
    pub puzzle_solution: [u8; 8],
}

/// Serve the handshake on `stream`.
pub async fn serve(mut stream: DuplexStream, config: MockConfig) -> Result<ServerSession> {
    // Client hello: version and total length first, then the rest.
    let mut head = [0u8; 4];
    stream
        .read_exact(&mut head)
        .await
        .context("reading hello head")?;
    if head[0..2] != [0x00, 0x03] {
        bail!("unexpected hello version {:02x}{:02x}", head[0], head[1]);
    }
    let total = u16::from_be_bytes([head[2], head[3]]) as usize;
    let mut rest = vec![0u8; total - 4];
    stream
        .read_exact(&mut rest)
        .await
        .context("reading hello body")?;
    let mut client_hello = head.to_vec();
    client_hello.extend_from_slice(&rest);

    let dh_client_public = client_hello[48..144].to_vec();
    let username_len = client_hello[273] as usize;
    let client_username = client_hello[276..276 + username_len].to_vec();
    if client_hello[total - 1] != 0x40 {
        bail!("hello missing its trailer byte");
    }

    // Server hello.
    let dh = DhLocalKeys::random();
    let username = config
        .canonical_username
        .clone()
        .unwrap_or(client_username);
    let mut puzzle_block = vec![config.puzzle_marker, config.puzzle_denominator];
    puzzle_block.extend_from_slice(&config.puzzle_magic.to_be_bytes());

    let mut hello = Vec::new();
    hello.extend_from_slice(&config.server_random);
    hello.extend_from_slice(dh.public_bytes());
    hello.extend_from_slice(&[0x5a; 256]); // signed blob; verification is the client app's business
    hello.extend_from_slice(&config.salt);
    hello.push(config.padding.len() as u8);
    hello.push(username.len() as u8);
    hello.extend_from_slice(&(puzzle_block.len() as u16).to_be_bytes());
    hello.extend_from_slice(&0u16.to_be_bytes());
    hello.extend_from_slice(&0u16.to_be_bytes());
    hello.extend_from_slice(&0u16.to_be_bytes());
    hello.extend_from_slice(&config.padding);
    hello.extend_from_slice(&username);
    hello.extend_from_slice(&puzzle_block);
    stream.write_all(&hello).await.context("writing server hello")?;

    // Key confirmation.
    let mut auth = [0u8; 36];
    stream
        .read_exact(&mut auth)
        .await
        .context("reading auth packet")?;
    if let Some(code) = config.reject_auth {
        stream.write_all(&[0x01, code]).await?;
        bail!("auth rejected by configuration");
    }

    let auth_hmac: [u8; 20] = auth[0..20].try_into().unwrap();
    if auth[20..22] != [0, 0] {
        bail!("unexpected auth filler bytes");
    }
    if auth[22..24] != [0x00, 0x08] {
        bail!("bad puzzle solution length field");
    }
    let puzzle_solution: [u8; 8] = auth[28..36].try_into().unwrap();

    // The server derives the same keys from its side of the exchange.
    let shared_secret = dh.shared_secret(&dh_client_public);
    let transcript: [&[u8]; 4] = [&client_hello, &hello, &config.salt, &username];
    let keys = crypto::derive_session_keys(&shared_secret[..], &transcript);

    let expected = crypto::hmac_sha1(&keys.hmac_key, &transcript);
    if expected != auth_hmac {
        bail!("client confirmation hmac does not verify");
    }
    if !crypto::puzzle_accepts(
        &config.server_random,
        &puzzle_solution,
        config.puzzle_denominator,
        config.puzzle_magic,
    ) {
        bail!("puzzle solution rejected");
    }

    // Accept: zero status, one discarded payload byte.
    stream.write_all(&[0x00, 0x01, 0x00]).await?;

    Ok(ServerSession {
        stream,
        // The server's send direction is the client's receive direction.
        send_cipher: Shannon::new(&keys.recv_key),
        recv_cipher: Shannon::new(&keys.send_key),
        send_iv: 0,
        recv_iv: 0,
        client_hello,
        username,
        puzzle_solution,
    })
}

impl ServerSession {
    /// Encrypt and push one record at the client.
    pub async fn send_packet(&mut self, command: u8, payload: &[u8]) -> Result<()> {
        self.send_cipher.nonce(&self.send_iv.to_be_bytes());
        let mut frame = Vec::with_capacity(3 + payload.len() + 4);
        frame.push(command);
        frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        frame.extend_from_slice(payload);
        self.send_cipher.encrypt(&mut frame);
        let mut mac = [0u8; 4];
        self.send_cipher.finish(&mut mac);
        frame.extend_from_slice(&mac);
        self.stream.write_all(&frame).await?;
        self.send_iv += 1;
        Ok(())
    }

    /// Read and decrypt one record from the client.
    pub async fn recv_packet(&mut self) -> Result<(u8, Vec<u8>)> {
        let mut header = [0u8; 3];
        self.stream.read_exact(&mut header).await?;
        self.recv_cipher.nonce(&self.recv_iv.to_be_bytes());
        self.recv_cipher.decrypt(&mut header);
        let command = header[0];
        let payload_len = u16::from_be_bytes([header[1], header[2]]) as usize;

        let mut body = vec![0u8; payload_len + 4];
        self.stream.read_exact(&mut body).await?;
        let (payload, mac) = body.split_at_mut(payload_len);
        self.recv_cipher.decrypt(payload);
        let mut expected = [0u8; 4];
        self.recv_cipher.finish(&mut expected);
        if *mac != expected {
            bail!("client record failed mac verification");
        }
        self.recv_iv += 1;
        body.truncate(payload_len);
        Ok((command, body))
    }

    /// Read exactly `n` raw ciphertext bytes.
    pub async fn read_raw(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; n];
        self.stream.read_exact(&mut buf).await?;
        Ok(buf)
    }

    /// Decrypt a complete raw record previously taken with [`read_raw`].
    pub fn decrypt_record(&mut self, record: &[u8]) -> Result<(u8, Vec<u8>)> {
        self.recv_cipher.nonce(&self.recv_iv.to_be_bytes());
        let mut header = [record[0], record[1], record[2]];
        self.recv_cipher.decrypt(&mut header);
        let payload_len = u16::from_be_bytes([header[1], header[2]]) as usize;
        if record.len() != 3 + payload_len + 4 {
            bail!(
                "record is {} bytes, header says {}",
                record.len(),
                3 + payload_len + 4
            );
        }
        let mut payload = record[3..3 + payload_len].to_vec();
        self.recv_cipher.decrypt(&mut payload);
        let mut expected = [0u8; 4];
        self.recv_cipher.finish(&mut expected);
        if record[3 + payload_len..] != expected {
            bail!("raw record failed mac verification");
        }
        self.recv_iv += 1;
        Ok((header[0], payload))
    }

    pub fn recv_iv(&self) -> u32 {
        self.recv_iv
    }
}
