//! Cryptographic primitives for the login handshake.
//!
//! Provides four things:
//!   1. SHA-1 and HMAC-SHA1 — puzzle hashing and key derivation
//!   2. Diffie–Hellman key agreement over the protocol's fixed 768-bit group
//!   3. A 1024-bit RSA client identity (the raw modulus travels in the hello)
//!   4. The counter-mode HMAC-SHA1 expansion that turns the handshake
//!      transcript into the session's cipher and confirmation keys
//!
//! Key material derives ZeroizeOnDrop — wiped from memory when dropped.
//! The stream cipher itself lives with the packet transport, keyed from
//! the [`SessionKeys`] produced here.

use hmac::{Hmac, Mac};
use num_bigint::BigUint;
use rand::RngCore;
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use sha1::{Digest, Sha1};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Serialized length of a DH public key on the wire.
pub const DH_PUBLIC_LEN: usize = 96;

/// Serialized length of the RSA public modulus on the wire.
pub const RSA_MODULUS_LEN: usize = 128;

/// Output length of SHA-1 and HMAC-SHA1.
pub const DIGEST_LEN: usize = 20;

type HmacSha1 = Hmac<Sha1>;

// ── Hashes ────────────────────────────────────────────────────────────────────

/// One-shot SHA-1.
pub fn sha1_digest(data: &[u8]) -> [u8; DIGEST_LEN] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// HMAC-SHA1 over the concatenation of `parts`.
///
/// Taking the message in parts lets callers feed multi-segment transcripts
/// without assembling them into one allocation first.
pub fn hmac_sha1(key: &[u8], parts: &[&[u8]]) -> [u8; DIGEST_LEN] {
    let mut mac = HmacSha1::new_from_slice(key).expect("hmac accepts keys of any length");
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().into()
}

// ── Diffie–Hellman ────────────────────────────────────────────────────────────

// 768-bit MODP group (Oakley group 1), the group the service fixed for its
// login exchange. Generator 2.
const DH_PRIME: [u8; DH_PUBLIC_LEN] = [
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xc9, 0x0f, 0xda, 0xa2, 0x21, 0x68, 0xc2,
    0x34, 0xc4, 0xc6, 0x62, 0x8b, 0x80, 0xdc, 0x1c, 0xd1, 0x29, 0x02, 0x4e, 0x08, 0x8a, 0x67,
    0xcc, 0x74, 0x02, 0x0b, 0xbe, 0xa6, 0x3b, 0x13, 0x9b, 0x22, 0x51, 0x4a, 0x08, 0x79, 0x8e,
    0x34, 0x04, 0xdd, 0xef, 0x95, 0x19, 0xb3, 0xcd, 0x3a, 0x43, 0x1b, 0x30, 0x2b, 0x0a, 0x6d,
    0xf2, 0x5f, 0x14, 0x37, 0x4f, 0xe1, 0x35, 0x6d, 0x6d, 0x51, 0xc2, 0x45, 0xe4, 0x85, 0xb5,
    0x76, 0x62, 0x5e, 0x7e, 0xc6, 0xf4, 0x4c, 0x42, 0xe9, 0xa6, 0x3a, 0x36, 0x20, 0xff, 0xff,
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
];

const DH_GENERATOR: u32 = 2;

/// Left-pad a big-endian integer into an exact-width wire field.
fn to_fixed_be<const N: usize>(value: &BigUint) -> [u8; N] {
    let bytes = value.to_bytes_be();
    let mut out = [0u8; N];
    out[N - bytes.len()..].copy_from_slice(&bytes);
    out
}

/// A session's ephemeral DH keypair.
///
/// Generated fresh for every connection. The 96-byte public component is
/// sent raw in the client hello; the exponent never leaves this struct and
/// is zeroized on drop.
pub struct DhLocalKeys {
    exponent: Zeroizing<Vec<u8>>,
    public: [u8; DH_PUBLIC_LEN],
}

impl DhLocalKeys {
    /// Generate a keypair from a fresh 95-byte random exponent.
    pub fn random() -> Self {
        let mut exponent = Zeroizing::new(vec![0u8; 95]);
        rand::thread_rng().fill_bytes(&mut exponent);
        Self::from_exponent(&exponent)
    }

    /// Deterministic construction from a caller-supplied exponent.
    pub fn from_exponent(exponent: &[u8]) -> Self {
        let prime = BigUint::from_bytes_be(&DH_PRIME);
        let public = BigUint::from(DH_GENERATOR)
            .modpow(&BigUint::from_bytes_be(exponent), &prime);
        Self {
            exponent: Zeroizing::new(exponent.to_vec()),
            public: to_fixed_be(&public),
        }
    }

    pub fn public_bytes(&self) -> &[u8; DH_PUBLIC_LEN] {
        &self.public
    }

    /// Agree on the 96-byte shared secret with the peer's public key.
    pub fn shared_secret(&self, remote_public: &[u8]) -> Zeroizing<[u8; DH_PUBLIC_LEN]> {
        let prime = BigUint::from_bytes_be(&DH_PRIME);
        let shared = BigUint::from_bytes_be(remote_public)
            .modpow(&BigUint::from_bytes_be(&self.exponent), &prime);
        Zeroizing::new(to_fixed_be(&shared))
    }
}

// ── RSA identity ──────────────────────────────────────────────────────────────

/// The client's RSA keypair.
///
/// Only the raw 128-byte public modulus appears on the wire (hello offset
/// 144); the server uses it to address its signed blob at this client.
pub struct RsaLocalKeys {
    key: RsaPrivateKey,
    modulus: [u8; RSA_MODULUS_LEN],
}

impl RsaLocalKeys {
    /// Generate a fresh 1024-bit keypair.
    pub fn random() -> Result<Self, CryptoError> {
        let key = RsaPrivateKey::new(&mut rand::thread_rng(), RSA_MODULUS_LEN * 8)?;
        let n = key.n().to_bytes_be();
        let mut modulus = [0u8; RSA_MODULUS_LEN];
        modulus[RSA_MODULUS_LEN - n.len()..].copy_from_slice(&n);
        Ok(Self { key, modulus })
    }

    pub fn modulus_bytes(&self) -> &[u8; RSA_MODULUS_LEN] {
        &self.modulus
    }

    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.key
    }
}

// ── Key derivation ────────────────────────────────────────────────────────────

/// Keys derived from a completed handshake.
///
/// `hmac_key` authenticates the client's key-confirmation packet;
/// `send_key` and `recv_key` seed the per-direction stream ciphers.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    pub hmac_key: [u8; DIGEST_LEN],
    pub send_key: [u8; 32],
    pub recv_key: [u8; 32],
}

/// Counter-mode HMAC-SHA1 key expansion.
///
/// Computes `HMAC-SHA1(shared, transcript || counter)` for counters 1..=5
/// into a 100-byte pool and slices it:
///
///   [0..20)   confirmation HMAC key
///   [20..52)  send cipher key
///   [52..84)  receive cipher key
///   [84..100) unused
pub fn derive_session_keys(shared_secret: &[u8], transcript: &[&[u8]]) -> SessionKeys {
    let mut pool = Zeroizing::new([0u8; 100]);
    for counter in 1u8..=5 {
        let mut mac =
            HmacSha1::new_from_slice(shared_secret).expect("hmac accepts keys of any length");
        for part in transcript {
            mac.update(part);
        }
        mac.update(&[counter]);
        let offset = (counter as usize - 1) * DIGEST_LEN;
        pool[offset..offset + DIGEST_LEN].copy_from_slice(&mac.finalize().into_bytes());
    }

    let mut keys = SessionKeys {
        hmac_key: [0u8; DIGEST_LEN],
        send_key: [0u8; 32],
        recv_key: [0u8; 32],
    };
    keys.hmac_key.copy_from_slice(&pool[0..20]);
    keys.send_key.copy_from_slice(&pool[20..52]);
    keys.recv_key.copy_from_slice(&pool[52..84]);
    keys
}

// ── Puzzle ────────────────────────────────────────────────────────────────────

/// Length of a puzzle solution on the wire.
pub const PUZZLE_SOLUTION_LEN: usize = 8;

/// Does `solution` satisfy the server's difficulty predicate?
///
/// The last four digest bytes of `SHA-1(server_random || solution)`,
/// folded with the server's magic constant, must have their low
/// `denominator` bits clear.
pub fn puzzle_accepts(
    server_random: &[u8],
    solution: &[u8; PUZZLE_SOLUTION_LEN],
    denominator: u8,
    magic: u32,
) -> bool {
    let mut hasher = Sha1::new();
    hasher.update(server_random);
    hasher.update(solution);
    let digest: [u8; DIGEST_LEN] = hasher.finalize().into();

    let tail = u32::from_be_bytes([digest[16], digest[17], digest[18], digest[19]]);
    let mask = if denominator >= 32 {
        u32::MAX
    } else {
        (1u32 << denominator) - 1
    };
    tail.wrapping_add(magic) & mask == 0
}

/// Brute-force an 8-byte solution to the server's puzzle.
///
/// Counts up from zero; expected work is about 2^denominator hashes, so
/// the servers keep the denominator small.
pub fn solve_puzzle(server_random: &[u8], denominator: u8, magic: u32) -> [u8; PUZZLE_SOLUTION_LEN] {
    let mut counter = 0u64;
    loop {
        let solution = counter.to_be_bytes();
        if puzzle_accepts(server_random, &solution, denominator, magic) {
            return solution;
        }
        counter = counter.wrapping_add(1);
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("RSA key generation failed: {0}")]
    Rsa(#[from] rsa::Error),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
