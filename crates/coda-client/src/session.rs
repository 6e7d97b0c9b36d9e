//! Session establishment and the running connection.
//!
//! [`connect`] drives the plaintext handshake, then keys the per-direction
//! ciphers and splits the stream. The resulting [`Connection`] is started
//! into two tasks:
//!
//!   receive loop — reads and decrypts records, answers pings, feeds the
//!                  dispatch queue (sole owner of the receive cipher)
//!   dispatcher   — drains the queue and fans each packet out to command
//!                  listeners in registration order
//!
//! Any number of tasks may hold a [`Client`] and send concurrently; the
//! send path serializes internally. Closing the socket is the only
//! cancellation mechanism — in-flight I/O then fails with
//! `ConnectionLost` and the session is discarded.

use std::sync::{Arc, RwLock};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use coda_core::wire::{self, BrowseKind, BrowseId, Command, FileId, ImageId, PlaylistId, TrackId};

use crate::channel::{
    ChannelDispatcher, ChannelId, ChannelKind, ChannelListener, ChannelRegistry, CommandListener,
};
use crate::config::SessionConfig;
use crate::error::ProtocolError;
use crate::handshake;
use crate::transport::{PacketReceiver, PacketSender};

type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Open a session over `stream`: handshake, then key the transport.
///
/// The stream is typically a fresh `TcpStream` to an access point; any
/// async byte stream works, which is also how the tests drive the engine.
pub async fn connect<S>(config: SessionConfig, mut stream: S) -> Result<Connection, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let cache_hash = config.cache_hash_bytes()?;
    let established = handshake::run(&config, &mut stream).await?;
    Ok(Connection::from_parts(config, cache_hash, established, stream))
}

/// An authenticated session that has not started its receive loop yet.
pub struct Connection {
    client: Client,
    receiver: PacketReceiver<BoxedRead>,
    server_blob: [u8; 256],
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

impl Connection {
    fn from_parts<S>(
        config: SessionConfig,
        cache_hash: [u8; 20],
        established: handshake::Established,
        stream: S,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read, write) = tokio::io::split(stream);
        let sender = PacketSender::new(
            Box::new(write) as BoxedWrite,
            &established.keys.send_key,
        );
        let receiver = PacketReceiver::new(
            Box::new(read) as BoxedRead,
            &established.keys.recv_key,
        );

        let channels = Arc::new(ChannelRegistry::new());
        let dispatcher: Arc<dyn CommandListener> =
            Arc::new(ChannelDispatcher::new(Arc::clone(&channels)));

        let client = Client {
            sender,
            channels,
            listeners: Arc::new(RwLock::new(vec![dispatcher])),
            username: Arc::new(established.username),
            cache_hash,
            queue_depth: config.queue_depth.max(1),
        };

        Self {
            client,
            receiver,
            server_blob: established.server_blob,
        }
    }

    /// The login name as the server canonicalized it.
    pub fn username(&self) -> &[u8] {
        &self.client.username
    }

    /// The server's RSA-signed authenticator, for embedders that verify it.
    pub fn server_blob(&self) -> &[u8; 256] {
        &self.server_blob
    }

    /// A send handle usable before the receive loop starts.
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    /// Spawn the receive loop and dispatcher.
    ///
    /// The returned handle resolves with the error that ended the
    /// session; it does not resolve while the session is healthy.
    pub fn start(self) -> (Client, JoinHandle<Result<(), ProtocolError>>) {
        let Connection {
            client,
            mut receiver,
            ..
        } = self;

        let (queue_tx, mut queue_rx) = mpsc::channel::<(u8, Bytes)>(client.queue_depth);

        let dispatch_client = client.clone();
        tokio::spawn(async move {
            while let Some((command, payload)) = queue_rx.recv().await {
                dispatch_client.dispatch(command, &payload);
            }
        });

        let pump_client = client.clone();
        let pump = tokio::spawn(async move {
            loop {
                let (command, payload) = receiver.recv().await?;
                if Command::from_u8(command) == Some(Command::Ping) {
                    tracing::debug!("server ping, answering");
                    pump_client.send_pong().await?;
                }
                if queue_tx.send((command, payload)).await.is_err() {
                    // Dispatcher is gone; nobody is listening anymore.
                    return Ok(());
                }
            }
        });

        (client, pump)
    }
}

/// Cloneable handle for the send side of a running session.
pub struct Client {
    sender: PacketSender<BoxedWrite>,
    channels: Arc<ChannelRegistry>,
    listeners: Arc<RwLock<Vec<Arc<dyn CommandListener>>>>,
    username: Arc<Vec<u8>>,
    cache_hash: [u8; 20],
    queue_depth: usize,
}

impl Clone for Client {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            channels: Arc::clone(&self.channels),
            listeners: Arc::clone(&self.listeners),
            username: Arc::clone(&self.username),
            cache_hash: self.cache_hash,
            queue_depth: self.queue_depth,
        }
    }
}

impl Client {
    /// Append a command listener. Listeners see every inbound packet in
    /// wire order, after the channel dispatcher.
    pub fn add_listener(&self, listener: Arc<dyn CommandListener>) {
        self.listeners
            .write()
            .expect("listener table poisoned")
            .push(listener);
    }

    /// The login name as the server canonicalized it.
    pub fn username(&self) -> &[u8] {
        &self.username
    }

    /// Live channels right now.
    pub fn open_channels(&self) -> usize {
        self.channels.len()
    }

    /// Packets sent so far (equals the next send nonce).
    pub async fn send_iv(&self) -> u32 {
        self.sender.iv().await
    }

    fn dispatch(&self, command: u8, payload: &Bytes) {
        let listeners: Vec<Arc<dyn CommandListener>> = self
            .listeners
            .read()
            .expect("listener table poisoned")
            .clone();
        for listener in listeners {
            listener.on_packet(command, payload);
        }
    }

    /// Register a channel, build its payload, send. On any failure the
    /// channel is retired again so a rejected call leaves no trace.
    async fn channel_request<F>(
        &self,
        kind: ChannelKind,
        listener: Arc<dyn ChannelListener>,
        command: Command,
        build: F,
    ) -> Result<ChannelId, ProtocolError>
    where
        F: FnOnce(ChannelId) -> Result<Bytes, wire::WireError>,
    {
        let id = self.channels.register(kind, listener)?;
        let payload = match build(id) {
            Ok(payload) => payload,
            Err(error) => {
                self.channels.retire(id);
                return Err(error.into());
            }
        };
        if let Err(error) = self.sender.send(command, &payload).await {
            self.channels.retire(id);
            return Err(error);
        }
        tracing::debug!(channel = id, ?command, "opened channel");
        Ok(id)
    }

    // ── Requests ──────────────────────────────────────────────────────────────

    /// Announce the configured cache digest.
    pub async fn send_cache_hash(&self) -> Result<(), ProtocolError> {
        self.sender
            .send(Command::CacheHash, &wire::cache_hash(&self.cache_hash))
            .await
    }

    /// Request an ad banner of the given type.
    pub async fn request_ad(
        &self,
        ad_type: u8,
        listener: Arc<dyn ChannelListener>,
    ) -> Result<ChannelId, ProtocolError> {
        self.channel_request(ChannelKind::Ad, listener, Command::RequestAd, |id| {
            Ok(wire::request_ad(id, ad_type))
        })
        .await
    }

    /// Fetch a cover image by id.
    pub async fn request_image(
        &self,
        image_id: &ImageId,
        listener: Arc<dyn ChannelListener>,
    ) -> Result<ChannelId, ProtocolError> {
        self.channel_request(ChannelKind::Image, listener, Command::Image, |id| {
            Ok(wire::request_image(id, image_id))
        })
        .await
    }

    /// Search the catalogue. `limit` is a result cap, or
    /// [`wire::SEARCH_UNLIMITED`] for everything.
    pub async fn search(
        &self,
        query: &str,
        offset: u32,
        limit: i32,
        listener: Arc<dyn ChannelListener>,
    ) -> Result<ChannelId, ProtocolError> {
        self.channel_request(ChannelKind::Search, listener, Command::Search, |id| {
            wire::search(id, offset, limit, query.as_bytes())
        })
        .await
    }

    /// Ask for the AES key protecting a file.
    pub async fn request_key(
        &self,
        file_id: &FileId,
        track_id: &TrackId,
        listener: Arc<dyn ChannelListener>,
    ) -> Result<ChannelId, ProtocolError> {
        self.channel_request(ChannelKind::AesKey, listener, Command::RequestKey, |id| {
            Ok(wire::request_key(id, file_id, track_id))
        })
        .await
    }

    /// Stream a byte range of a file. `offset` and `length` must be
    /// 4096-aligned.
    pub async fn request_substream(
        &self,
        file_id: &FileId,
        offset: u32,
        length: u32,
        listener: Arc<dyn ChannelListener>,
    ) -> Result<ChannelId, ProtocolError> {
        self.channel_request(
            ChannelKind::Substream,
            listener,
            Command::GetSubstream,
            |id| wire::substream(id, file_id, offset, length),
        )
        .await
    }

    /// Browse artist, album, or track metadata.
    pub async fn browse(
        &self,
        kind: BrowseKind,
        ids: &[BrowseId],
        listener: Arc<dyn ChannelListener>,
    ) -> Result<ChannelId, ProtocolError> {
        self.channel_request(ChannelKind::Browse, listener, Command::Browse, |id| {
            wire::browse(id, kind, ids)
        })
        .await
    }

    /// Fetch a playlist.
    pub async fn request_playlist(
        &self,
        playlist_id: &PlaylistId,
        listener: Arc<dyn ChannelListener>,
    ) -> Result<ChannelId, ProtocolError> {
        self.channel_request(
            ChannelKind::Playlist,
            listener,
            Command::GetPlaylist,
            |id| Ok(wire::get_playlist(id, playlist_id)),
        )
        .await
    }

    /// Publish a playlist delta.
    #[allow(clippy::too_many_arguments)]
    pub async fn change_playlist(
        &self,
        playlist_id: &PlaylistId,
        revision: u32,
        track_count: u32,
        checksum: u32,
        collaborative: bool,
        xml: &[u8],
        listener: Arc<dyn ChannelListener>,
    ) -> Result<ChannelId, ProtocolError> {
        self.channel_request(
            ChannelKind::Playlist,
            listener,
            Command::ChangePlaylist,
            |id| {
                Ok(wire::change_playlist(
                    id,
                    playlist_id,
                    revision,
                    track_count,
                    checksum,
                    collaborative,
                    xml,
                ))
            },
        )
        .await
    }

    /// Tell the server playback began.
    pub async fn request_play(&self) -> Result<(), ProtocolError> {
        self.sender.send(Command::RequestPlay, &[]).await
    }

    /// Notify the server the play token was taken over.
    pub async fn send_token_notify(&self) -> Result<(), ProtocolError> {
        self.sender.send(Command::TokenNotify, &[]).await
    }

    /// Answer a server ping.
    pub async fn send_pong(&self) -> Result<(), ProtocolError> {
        self.sender.send(Command::Pong, &wire::pong()).await
    }
}
