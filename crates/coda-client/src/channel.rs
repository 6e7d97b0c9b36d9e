//! Per-session channel registry and inbound routing.
//!
//! A channel is a short-lived 16-bit correlation handle: every outbound
//! request that expects streamed data allocates one, and the server tags
//! its reply fragments with it. The registry is owned by the session —
//! two sessions never share id space — and is touched from both the
//! request path (register) and the receive path (route, retire).
//!
//! Lifecycle: allocated → registered → open (fragments arriving) →
//! retired on the end-of-channel marker or a server error. A retired id
//! may be handed out again; a live one is skipped by the allocator.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use coda_core::wire::{self, Command};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::ProtocolError;

/// Channel identifier as it travels on the wire.
pub type ChannelId = u16;

/// What a channel was opened for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Ad,
    Image,
    Search,
    AesKey,
    Substream,
    Browse,
    Playlist,
}

/// Receives a channel's inbound fragments.
///
/// Callbacks run on the dispatch task and must not block: hand data off
/// to your own queue. In particular, do not synchronously wait for a
/// send whose reply would arrive through this same dispatcher.
pub trait ChannelListener: Send + Sync {
    /// A data fragment arrived. The channel stays open.
    fn on_data(&self, id: ChannelId, data: Bytes);

    /// The server closed the channel normally. It is already retired;
    /// no further callbacks follow.
    fn on_end(&self, id: ChannelId);

    /// The server signalled failure. The channel is retired.
    fn on_error(&self, id: ChannelId);
}

/// Receives every inbound packet, in wire order.
pub trait CommandListener: Send + Sync {
    fn on_packet(&self, command: u8, payload: &Bytes);
}

// ── Registry ──────────────────────────────────────────────────────────────────

struct ChannelEntry {
    kind: ChannelKind,
    listener: Arc<dyn ChannelListener>,
}

/// Live channels of one session.
pub struct ChannelRegistry {
    channels: DashMap<ChannelId, ChannelEntry>,
    next_id: AtomicU16,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            next_id: AtomicU16::new(0),
        }
    }

    /// Reserve a fresh id and register its listener.
    ///
    /// Ids come from an incrementing counter; on wrap-around, ids still
    /// live are skipped.
    pub fn register(
        &self,
        kind: ChannelKind,
        listener: Arc<dyn ChannelListener>,
    ) -> Result<ChannelId, ProtocolError> {
        for _ in 0..=u16::MAX as u32 {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            match self.channels.entry(id) {
                Entry::Occupied(_) => continue,
                Entry::Vacant(slot) => {
                    slot.insert(ChannelEntry { kind, listener });
                    return Ok(id);
                }
            }
        }
        Err(ProtocolError::ChannelsExhausted)
    }

    /// Drop a channel. Returns false if it was not live.
    pub fn retire(&self, id: ChannelId) -> bool {
        self.channels.remove(&id).is_some()
    }

    pub fn kind(&self, id: ChannelId) -> Option<ChannelKind> {
        self.channels.get(&id).map(|entry| entry.kind)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Clone the listener out so callbacks run without holding a map ref.
    fn listener(&self, id: ChannelId) -> Option<Arc<dyn ChannelListener>> {
        self.channels.get(&id).map(|entry| Arc::clone(&entry.listener))
    }

    #[cfg(test)]
    fn set_next_id(&self, id: ChannelId) {
        self.next_id.store(id, Ordering::Relaxed);
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ── Dispatcher ────────────────────────────────────────────────────────────────

/// Routes channel-bearing commands to their listeners.
///
/// Installed as the session's first command listener. Payloads of the
/// channel commands lead with the u16 channel id; the remainder is the
/// fragment. An empty remainder on a data command is the end-of-channel
/// marker.
pub struct ChannelDispatcher {
    registry: Arc<ChannelRegistry>,
}

impl ChannelDispatcher {
    pub fn new(registry: Arc<ChannelRegistry>) -> Self {
        Self { registry }
    }

    fn data(&self, payload: &Bytes) {
        let (id, rest) = match wire::split_channel(payload) {
            Ok(parts) => parts,
            Err(error) => {
                tracing::warn!(%error, "undersized channel data payload");
                return;
            }
        };
        let Some(listener) = self.registry.listener(id) else {
            tracing::warn!(channel = id, "data for unregistered channel");
            return;
        };
        if rest.is_empty() {
            self.registry.retire(id);
            listener.on_end(id);
        } else {
            listener.on_data(id, payload.slice(2..));
        }
    }

    fn error(&self, payload: &Bytes) {
        let Ok((id, _)) = wire::split_channel(payload) else {
            tracing::warn!("undersized channel error payload");
            return;
        };
        let Some(listener) = self.registry.listener(id) else {
            return;
        };
        self.registry.retire(id);
        listener.on_error(id);
    }
}

impl CommandListener for ChannelDispatcher {
    fn on_packet(&self, command: u8, payload: &Bytes) {
        match Command::from_u8(command) {
            Some(Command::ChannelData) | Some(Command::AesKey) => self.data(payload),
            Some(Command::ChannelError)
            | Some(Command::ChannelAbort)
            | Some(Command::AesKeyError) => self.error(payload),
            _ => {}
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
