//! Coda wire format — on-wire layouts for everything the engine sends.
//!
//! These layouts ARE the protocol. Every field, every width, every odd
//! constant was recovered from the live service, and the server rejects a
//! connection over a single wrong byte without telling you why. Changing
//! anything here is a compatibility break.
//!
//! Fixed-size regions are `#[repr(C, packed)]` zerocopy structs over
//! big-endian integers; variable-size records go through the
//! [`PacketBuilder`](crate::codec::PacketBuilder).

use bytes::Bytes;
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{BigEndian, U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::codec::{CodecError, PacketBuilder, PacketReader};
use crate::crypto::{DH_PUBLIC_LEN, DIGEST_LEN, PUZZLE_SOLUTION_LEN, RSA_MODULUS_LEN};

// ── Identifiers ───────────────────────────────────────────────────────────────

/// 20-byte id of a stored media file.
pub type FileId = [u8; 20];

/// 16-byte track id.
pub type TrackId = [u8; 16];

/// 20-byte cover-image id.
pub type ImageId = [u8; 20];

/// 17-byte playlist id.
pub type PlaylistId = [u8; 17];

/// 16-byte id handed to the browse service.
pub type BrowseId = [u8; 16];

// ── Commands ──────────────────────────────────────────────────────────────────

/// Post-handshake packet commands.
///
/// The numeric values are the server's; the names are ours. Several of
/// these the engine only ever receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    SecretBlock = 0x02,
    Ping = 0x04,
    GetSubstream = 0x08,
    ChannelData = 0x09,
    ChannelError = 0x0a,
    ChannelAbort = 0x0b,
    RequestKey = 0x0c,
    AesKey = 0x0d,
    AesKeyError = 0x0e,
    CacheHash = 0x0f,
    ShaHash = 0x10,
    Image = 0x19,
    CountryCode = 0x1b,
    Browse = 0x30,
    Search = 0x31,
    GetPlaylist = 0x35,
    ChangePlaylist = 0x36,
    Notify = 0x42,
    Log = 0x48,
    Pong = 0x49,
    PongAck = 0x4a,
    Pause = 0x4b,
    RequestAd = 0x4e,
    RequestPlay = 0x4f,
    ProdInfo = 0x50,
    Welcome = 0x69,
    TokenNotify = 0x76,
}

impl Command {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x02 => Some(Self::SecretBlock),
            0x04 => Some(Self::Ping),
            0x08 => Some(Self::GetSubstream),
            0x09 => Some(Self::ChannelData),
            0x0a => Some(Self::ChannelError),
            0x0b => Some(Self::ChannelAbort),
            0x0c => Some(Self::RequestKey),
            0x0d => Some(Self::AesKey),
            0x0e => Some(Self::AesKeyError),
            0x0f => Some(Self::CacheHash),
            0x10 => Some(Self::ShaHash),
            0x19 => Some(Self::Image),
            0x1b => Some(Self::CountryCode),
            0x30 => Some(Self::Browse),
            0x31 => Some(Self::Search),
            0x35 => Some(Self::GetPlaylist),
            0x36 => Some(Self::ChangePlaylist),
            0x42 => Some(Self::Notify),
            0x48 => Some(Self::Log),
            0x49 => Some(Self::Pong),
            0x4a => Some(Self::PongAck),
            0x4b => Some(Self::Pause),
            0x4e => Some(Self::RequestAd),
            0x4f => Some(Self::RequestPlay),
            0x50 => Some(Self::ProdInfo),
            0x69 => Some(Self::Welcome),
            0x76 => Some(Self::TokenNotify),
            _ => None,
        }
    }
}

impl From<Command> for u8 {
    fn from(command: Command) -> u8 {
        command as u8
    }
}

// ── Client hello ──────────────────────────────────────────────────────────────

/// Handshake protocol version. Fixed; there is no negotiation.
pub const PROTOCOL_VERSION: u16 = 3;

/// Maximum payload of one encrypted record — the length field is a u16.
pub const MAX_PAYLOAD: usize = 65535;

/// Offset of the back-patched total-length field in the client hello.
pub const HELLO_LENGTH_OFFSET: usize = 2;

/// The byte every client hello ends with.
const HELLO_TRAILER: u8 = 0x40;

/// Usernames travel behind a one-byte length.
pub const MAX_USERNAME_LEN: usize = 255;

/// Fixed-layout head of the client hello — everything before the username.
///
/// The `unknown*` fields are constants the live service insists on; their
/// meaning was never recovered.
///
/// Wire size: 276 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct ClientHelloPrefix {
    pub version: U16<BigEndian>,
    /// Total packet length, back-patched after the tail is appended.
    pub length: U16<BigEndian>,
    pub unknown0: U32<BigEndian>, // 0
    pub unknown1: U32<BigEndian>, // 0x0003_0c00
    pub client_revision: U32<BigEndian>,
    pub unknown2: U32<BigEndian>, // 0
    pub unknown3: U32<BigEndian>, // 0x0100_0000
    pub client_id: U32<BigEndian>,
    pub unknown4: U32<BigEndian>, // 0
    pub client_random: [u8; 16],
    pub dh_public: [u8; DH_PUBLIC_LEN],
    pub rsa_modulus: [u8; RSA_MODULUS_LEN],
    pub random_len: u8, // 0
    pub username_len: u8,
    pub unknown5: U16<BigEndian>, // 0x0100
}

assert_eq_size!(ClientHelloPrefix, [u8; 276]);

/// Build the client hello.
///
/// The length field at offset 2 is patched to the final size once the
/// username and trailer are in place.
pub fn client_hello(
    client_id: u32,
    client_revision: u32,
    client_random: &[u8; 16],
    dh_public: &[u8; DH_PUBLIC_LEN],
    rsa_modulus: &[u8; RSA_MODULUS_LEN],
    username: &[u8],
) -> Result<Bytes, WireError> {
    if username.len() > MAX_USERNAME_LEN {
        return Err(WireError::UsernameTooLong(username.len()));
    }

    let prefix = ClientHelloPrefix {
        version: U16::new(PROTOCOL_VERSION),
        length: U16::new(0),
        unknown0: U32::new(0),
        unknown1: U32::new(0x0003_0c00),
        client_revision: U32::new(client_revision),
        unknown2: U32::new(0),
        unknown3: U32::new(0x0100_0000),
        client_id: U32::new(client_id),
        unknown4: U32::new(0),
        client_random: *client_random,
        dh_public: *dh_public,
        rsa_modulus: *rsa_modulus,
        random_len: 0,
        username_len: username.len() as u8,
        unknown5: U16::new(0x0100),
    };

    let mut b = PacketBuilder::with_capacity(std::mem::size_of::<ClientHelloPrefix>() + username.len() + 1);
    b.put_slice(prefix.as_bytes());
    b.put_slice(username);
    b.put_u8(HELLO_TRAILER);
    let total = b.len() as u16;
    b.patch_u16(HELLO_LENGTH_OFFSET, total);
    Ok(b.freeze())
}

/// Build the key-confirmation packet sent after the puzzle is solved.
///
/// Wire size: 36 bytes.
pub fn auth_packet(
    auth_hmac: &[u8; DIGEST_LEN],
    puzzle_solution: &[u8; PUZZLE_SOLUTION_LEN],
) -> Bytes {
    let mut b = PacketBuilder::with_capacity(36);
    b.put_slice(auth_hmac);
    b.put_u8(0); // random length
    b.put_u8(0);
    b.put_u16(puzzle_solution.len() as u16);
    b.put_u32(0);
    b.put_slice(puzzle_solution);
    b.freeze()
}

// ── Channel-bearing payloads ──────────────────────────────────────────────────

/// Substream offsets and lengths must sit on this boundary.
pub const SUBSTREAM_ALIGN: u32 = 4096;

/// Search result counts fit a signed 32-bit field; -1 means "no limit".
pub const SEARCH_UNLIMITED: i32 = -1;

/// What a browse request is asking about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BrowseKind {
    Artist = 1,
    Album = 2,
    Track = 3,
}

/// Pull the leading channel id off an inbound channel-bearing payload.
pub fn split_channel(payload: &[u8]) -> Result<(u16, &[u8]), CodecError> {
    let mut r = PacketReader::new(payload);
    let channel = r.read_u16()?;
    Ok((channel, r.rest()))
}

/// `CacheHash` — announce the client's 20-byte cache digest.
pub fn cache_hash(digest: &[u8; 20]) -> Bytes {
    Bytes::copy_from_slice(digest)
}

/// `RequestAd` payload.
pub fn request_ad(channel: u16, ad_type: u8) -> Bytes {
    let mut b = PacketBuilder::with_capacity(3);
    b.put_u16(channel).put_u8(ad_type);
    b.freeze()
}

/// `Image` payload.
pub fn request_image(channel: u16, image_id: &ImageId) -> Bytes {
    let mut b = PacketBuilder::with_capacity(2 + image_id.len());
    b.put_u16(channel).put_slice(image_id);
    b.freeze()
}

/// `Search` payload.
///
/// `limit` must be positive or [`SEARCH_UNLIMITED`]; the query travels
/// behind a one-byte length.
pub fn search(channel: u16, offset: u32, limit: i32, query: &[u8]) -> Result<Bytes, WireError> {
    if limit <= 0 && limit != SEARCH_UNLIMITED {
        return Err(WireError::BadSearchLimit(limit));
    }
    if query.len() > 255 {
        return Err(WireError::QueryTooLong(query.len()));
    }

    let mut b = PacketBuilder::with_capacity(13 + query.len());
    b.put_u16(channel)
        .put_u32(offset)
        .put_i32(limit)
        .put_u16(0)
        .put_u8(query.len() as u8)
        .put_slice(query);
    Ok(b.freeze())
}

/// `RequestKey` payload.
///
/// The one channel-bearing request whose channel id travels at the tail,
/// not the head.
pub fn request_key(channel: u16, file_id: &FileId, track_id: &TrackId) -> Bytes {
    let mut b = PacketBuilder::with_capacity(file_id.len() + track_id.len() + 4);
    b.put_slice(file_id)
        .put_slice(track_id)
        .put_u16(0)
        .put_u16(channel);
    b.freeze()
}

/// Fixed layout of a `GetSubstream` request.
///
/// File positions travel as 4-byte word counts, hence the `/ 4`. The
/// `unknown*` constants look like bandwidth-shaping hints; the service
/// rejects requests without them.
///
/// Wire size: 44 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct SubstreamRequest {
    pub channel: U16<BigEndian>,
    pub unknown0: U16<BigEndian>, // 0x0800
    pub unknown1: U16<BigEndian>, // 0
    pub unknown2: U16<BigEndian>, // 0
    pub unknown3: U16<BigEndian>, // 0
    pub unknown4: U16<BigEndian>, // 0x4e20
    pub unknown5: U32<BigEndian>, // 200_000
    pub file_id: [u8; 20],
    pub begin_word: U32<BigEndian>,
    pub end_word: U32<BigEndian>,
}

assert_eq_size!(SubstreamRequest, [u8; 44]);

/// `GetSubstream` payload.
///
/// `offset` and `length` are byte positions and must both be multiples of
/// [`SUBSTREAM_ALIGN`]; `length` must be non-zero.
pub fn substream(
    channel: u16,
    file_id: &FileId,
    offset: u32,
    length: u32,
) -> Result<Bytes, WireError> {
    if length == 0 {
        return Err(WireError::EmptySubstream);
    }
    if offset % SUBSTREAM_ALIGN != 0 || length % SUBSTREAM_ALIGN != 0 {
        return Err(WireError::UnalignedSubstream { offset, length });
    }

    let request = SubstreamRequest {
        channel: U16::new(channel),
        unknown0: U16::new(0x0800),
        unknown1: U16::new(0),
        unknown2: U16::new(0),
        unknown3: U16::new(0),
        unknown4: U16::new(0x4e20),
        unknown5: U32::new(200_000),
        file_id: *file_id,
        begin_word: U32::new(offset / 4),
        end_word: U32::new((offset + length) / 4),
    };
    Ok(Bytes::copy_from_slice(request.as_bytes()))
}

/// `Browse` payload.
///
/// Artist and album lookups take exactly one id; track lookups may batch.
/// Artist and album requests carry a trailing zero word.
pub fn browse(channel: u16, kind: BrowseKind, ids: &[BrowseId]) -> Result<Bytes, WireError> {
    if ids.is_empty() {
        return Err(WireError::EmptyBrowse);
    }
    if matches!(kind, BrowseKind::Artist | BrowseKind::Album) && ids.len() != 1 {
        return Err(WireError::BadBrowseArity {
            kind,
            got: ids.len(),
        });
    }

    let mut b = PacketBuilder::with_capacity(3 + ids.len() * 16 + 4);
    b.put_u16(channel).put_u8(kind as u8);
    for id in ids {
        b.put_slice(id);
    }
    if matches!(kind, BrowseKind::Artist | BrowseKind::Album) {
        b.put_u32(0);
    }
    Ok(b.freeze())
}

/// `GetPlaylist` payload.
pub fn get_playlist(channel: u16, playlist_id: &PlaylistId) -> Bytes {
    let mut b = PacketBuilder::with_capacity(2 + playlist_id.len() + 13);
    b.put_u16(channel)
        .put_slice(playlist_id)
        .put_i32(-1)
        .put_u32(0)
        .put_i32(-1)
        .put_u8(0x01);
    b.freeze()
}

/// `ChangePlaylist` payload.
pub fn change_playlist(
    channel: u16,
    playlist_id: &PlaylistId,
    revision: u32,
    track_count: u32,
    checksum: u32,
    collaborative: bool,
    xml: &[u8],
) -> Bytes {
    let mut b = PacketBuilder::with_capacity(2 + playlist_id.len() + 14 + xml.len());
    b.put_u16(channel)
        .put_slice(playlist_id)
        .put_u32(revision)
        .put_u32(track_count)
        .put_u32(checksum)
        .put_u8(collaborative as u8)
        .put_u8(0x03)
        .put_slice(xml);
    b.freeze()
}

/// `Pong` payload — a single zero word.
pub fn pong() -> Bytes {
    Bytes::from_static(&[0, 0, 0, 0])
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// A caller violated a payload precondition. Nothing was sent and no
/// session state changed; these are recoverable at the call site.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("username length {0} exceeds {MAX_USERNAME_LEN}")]
    UsernameTooLong(usize),

    #[error("payload length {0} exceeds maximum {MAX_PAYLOAD}")]
    PayloadTooLarge(usize),

    #[error("search limit must be positive or -1, got {0}")]
    BadSearchLimit(i32),

    #[error("search query length {0} exceeds 255")]
    QueryTooLong(usize),

    #[error("substream offset {offset} / length {length} not aligned to {SUBSTREAM_ALIGN}")]
    UnalignedSubstream { offset: u32, length: u32 },

    #[error("substream length must be non-zero")]
    EmptySubstream,

    #[error("browse kind {kind:?} takes exactly one id, got {got}")]
    BadBrowseArity { kind: BrowseKind, got: usize },

    #[error("browse requires at least one id")]
    EmptyBrowse,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
