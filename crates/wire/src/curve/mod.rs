//! CurveZMQ handshake.
//!
//! The handshake authenticates both peers and agrees on a shared secret using
//! Curve25519 key agreement and XSalsa20-Poly1305 boxes:
//!
//! ```text
//! C -> S  HELLO     C' + Box[64 zero bytes](C'->S)
//! S -> C  WELCOME   Box[S' + cookie](S->C')
//! C -> S  INITIATE  cookie + Box[C + vouch + metadata](C'->S')
//! S -> C  READY     Box[metadata](S'->C')
//! ```
//!
//! `C`/`S` are long-term keys, `C'`/`S'` transient keys. Any command that
//! arrives out of order, has the wrong size, or fails to authenticate rejects
//! the handshake.
//!
//! - [`client`]: stateless client-side command builders and parsers
//! - [`server`]: stateless server-side command builders and parsers
//! - [`mechanism`]: the client and server state machines

pub mod client;
pub mod mechanism;
pub mod server;

use crypto_box::aead::{Aead, Nonce};
pub use crypto_box::{PublicKey, SalsaBox, SecretKey};
use rand::rngs::OsRng;

use crate::error::{ProtocolError, Result};

/// Size of a Curve25519 key.
pub const KEY_SIZE: usize = 32;

/// Size of a full box nonce.
pub const NONCE_SIZE: usize = 24;

/// Size of the Poly1305 tag prepended to every box.
pub const BOX_OVERHEAD: usize = 16;

/// Size of the short nonce carried on the wire.
pub const SHORT_NONCE_SIZE: usize = 8;

/// Size of the long nonce carried in WELCOME, cookies and vouches.
pub const LONG_NONCE_SIZE: usize = 16;

// HELLO: tag(6) + version(2) + padding(72) + C'(32) + short nonce(8) + box(80)

/// HELLO command tag.
pub const HELLO_TAG: &[u8] = b"\x05HELLO";
/// CurveZMQ major and minor version carried in HELLO.
pub const HELLO_VERSION: [u8; 2] = [1, 0];
/// Offset of the version field.
pub const HELLO_VERSION_OFFSET: usize = 6;
/// Offset of the anti-amplification padding.
pub const HELLO_PADDING_OFFSET: usize = 8;
/// Size of the anti-amplification padding.
pub const HELLO_PADDING_SIZE: usize = 72;
/// Offset of the client transient public key.
pub const HELLO_CLIENT_KEY_OFFSET: usize = 80;
/// Offset of the short nonce.
pub const HELLO_NONCE_OFFSET: usize = 112;
/// Offset of the signature box.
pub const HELLO_BOX_OFFSET: usize = 120;
/// Size of the signature box.
pub const HELLO_BOX_SIZE: usize = 80;
/// Total HELLO size.
pub const HELLO_SIZE: usize = 200;
/// Plaintext of the HELLO box.
pub const HELLO_PLAINTEXT_SIZE: usize = 64;
/// Prefix of the HELLO nonce.
pub const HELLO_NONCE_PREFIX: &[u8; 16] = b"CurveZMQHELLO---";

const _: () = assert!(HELLO_TAG.len() == HELLO_VERSION_OFFSET);
const _: () = assert!(HELLO_PADDING_OFFSET + HELLO_PADDING_SIZE == HELLO_CLIENT_KEY_OFFSET);
const _: () = assert!(HELLO_CLIENT_KEY_OFFSET + KEY_SIZE == HELLO_NONCE_OFFSET);
const _: () = assert!(HELLO_NONCE_OFFSET + SHORT_NONCE_SIZE == HELLO_BOX_OFFSET);
const _: () = assert!(HELLO_BOX_OFFSET + HELLO_BOX_SIZE == HELLO_SIZE);
const _: () = assert!(HELLO_PLAINTEXT_SIZE + BOX_OVERHEAD == HELLO_BOX_SIZE);

// WELCOME: tag(8) + nonce(16) + box(144) = Box[S'(32) + cookie(96)]

/// WELCOME command tag.
pub const WELCOME_TAG: &[u8] = b"\x07WELCOME";
/// Offset of the long nonce.
pub const WELCOME_NONCE_OFFSET: usize = 8;
/// Offset of the box.
pub const WELCOME_BOX_OFFSET: usize = 24;
/// Size of the box.
pub const WELCOME_BOX_SIZE: usize = 144;
/// Total WELCOME size.
pub const WELCOME_SIZE: usize = 168;
/// Prefix of the WELCOME nonce.
pub const WELCOME_NONCE_PREFIX: &[u8; 8] = b"WELCOME-";

/// Size of the opaque cookie.
pub const COOKIE_SIZE: usize = 96;
/// Prefix of the cookie nonce.
pub const COOKIE_NONCE_PREFIX: &[u8; 8] = b"COOKIE--";

const _: () = assert!(WELCOME_TAG.len() == WELCOME_NONCE_OFFSET);
const _: () = assert!(WELCOME_NONCE_OFFSET + LONG_NONCE_SIZE == WELCOME_BOX_OFFSET);
const _: () = assert!(WELCOME_BOX_OFFSET + WELCOME_BOX_SIZE == WELCOME_SIZE);
const _: () = assert!(BOX_OVERHEAD + KEY_SIZE + COOKIE_SIZE == WELCOME_BOX_SIZE);
const _: () = assert!(LONG_NONCE_SIZE + BOX_OVERHEAD + 2 * KEY_SIZE == COOKIE_SIZE);

// INITIATE: tag(9) + cookie(96) + short nonce(8) + Box[C(32) + vouch(96) + metadata]

/// INITIATE command tag.
pub const INITIATE_TAG: &[u8] = b"\x08INITIATE";
/// Offset of the echoed cookie.
pub const INITIATE_COOKIE_OFFSET: usize = 9;
/// Offset of the short nonce.
pub const INITIATE_NONCE_OFFSET: usize = 105;
/// Offset of the box.
pub const INITIATE_BOX_OFFSET: usize = 113;
/// Prefix of the INITIATE nonce.
pub const INITIATE_NONCE_PREFIX: &[u8; 16] = b"CurveZMQINITIATE";
/// Prefix of the vouch nonce.
pub const VOUCH_NONCE_PREFIX: &[u8; 8] = b"VOUCH---";
/// Size of the vouch box over C' + S.
pub const VOUCH_BOX_SIZE: usize = 80;
/// Size of the vouch: long nonce plus box.
pub const VOUCH_SIZE: usize = LONG_NONCE_SIZE + VOUCH_BOX_SIZE;
/// Smallest valid INITIATE (empty metadata).
pub const INITIATE_MIN_SIZE: usize = 257;

const _: () = assert!(INITIATE_TAG.len() == INITIATE_COOKIE_OFFSET);
const _: () = assert!(INITIATE_COOKIE_OFFSET + COOKIE_SIZE == INITIATE_NONCE_OFFSET);
const _: () = assert!(INITIATE_NONCE_OFFSET + SHORT_NONCE_SIZE == INITIATE_BOX_OFFSET);
const _: () = assert!(INITIATE_BOX_OFFSET + BOX_OVERHEAD + KEY_SIZE + VOUCH_SIZE == INITIATE_MIN_SIZE);
const _: () = assert!(2 * KEY_SIZE + BOX_OVERHEAD == VOUCH_BOX_SIZE);

// READY: tag(6) + short nonce(8) + Box[metadata]

/// READY command tag.
pub const READY_TAG: &[u8] = b"\x05READY";
/// Offset of the short nonce.
pub const READY_NONCE_OFFSET: usize = 6;
/// Offset of the box.
pub const READY_BOX_OFFSET: usize = 14;
/// Smallest valid READY (empty metadata).
pub const READY_MIN_SIZE: usize = READY_BOX_OFFSET + BOX_OVERHEAD;
/// Prefix of the READY nonce.
pub const READY_NONCE_PREFIX: &[u8; 16] = b"CurveZMQREADY---";

const _: () = assert!(READY_TAG.len() == READY_NONCE_OFFSET);
const _: () = assert!(READY_NONCE_OFFSET + SHORT_NONCE_SIZE == READY_BOX_OFFSET);

// ERROR: tag(6) + reason length(1) + reason

/// ERROR command tag.
pub const ERROR_TAG: &[u8] = b"\x05ERROR";
/// Smallest valid ERROR (empty reason).
pub const ERROR_MIN_SIZE: usize = ERROR_TAG.len() + 1;

/// A Curve25519 key pair.
#[derive(Clone)]
pub struct KeyPair {
    /// Public half.
    pub public: PublicKey,
    /// Secret half.
    pub secret: SecretKey,
}

impl KeyPair {
    /// Generate a fresh key pair from the operating system's CSPRNG.
    pub fn generate() -> Self {
        let secret = SecretKey::generate(&mut OsRng);
        Self {
            public: secret.public_key(),
            secret,
        }
    }

    /// Rebuild a key pair from its secret half.
    pub fn from_secret_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        let secret = SecretKey::from(bytes);
        Self {
            public: secret.public_key(),
            secret,
        }
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public.as_bytes())
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Parse a public key from a 32-byte slice.
pub fn public_key_from_slice(bytes: &[u8]) -> Result<PublicKey> {
    let key: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| {
        ProtocolError::InvalidKey(format!("expected {} bytes, got {}", KEY_SIZE, bytes.len()))
    })?;
    Ok(PublicKey::from(key))
}

/// Shared secret precomputed from one public and one secret key.
///
/// Both `Precomputed::new(&a.public, &b.secret)` and
/// `Precomputed::new(&b.public, &a.secret)` yield the same secret.
pub struct Precomputed(SalsaBox);

impl Precomputed {
    /// Derive the shared secret.
    pub fn new(public: &PublicKey, secret: &SecretKey) -> Self {
        Self(SalsaBox::new(public, secret))
    }

    /// Seal `plaintext` under this secret.
    pub fn seal(&self, nonce: &[u8; NONCE_SIZE], plaintext: &[u8]) -> Result<Vec<u8>> {
        self.0
            .encrypt(&Nonce::<SalsaBox>::from(*nonce), plaintext)
            .map_err(|_| ProtocolError::Encryption("box sealing failed"))
    }

    /// Open a box sealed under this secret. `what` names the box in errors.
    pub fn open(
        &self,
        nonce: &[u8; NONCE_SIZE],
        ciphertext: &[u8],
        what: &'static str,
    ) -> Result<Vec<u8>> {
        self.0
            .decrypt(&Nonce::<SalsaBox>::from(*nonce), ciphertext)
            .map_err(|_| ProtocolError::Authentication(what))
    }
}

impl std::fmt::Debug for Precomputed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Precomputed([REDACTED])")
    }
}

/// Monotonic short-nonce counter for one key pair.
///
/// Starts at 1 and refuses to wrap, so no value is ever handed out twice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonceCounter(u64);

impl Default for NonceCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl NonceCounter {
    /// Create a counter whose first value is 1.
    pub fn new() -> Self {
        Self(1)
    }

    /// Take the next unused nonce value.
    pub fn next_nonce(&mut self) -> Result<u64> {
        if self.0 == u64::MAX {
            return Err(ProtocolError::NonceExhausted);
        }
        let value = self.0;
        self.0 += 1;
        Ok(value)
    }
}

/// Build a full nonce from a literal prefix and wire-supplied tail.
pub(crate) fn full_nonce(prefix: &[u8], tail: &[u8]) -> [u8; NONCE_SIZE] {
    assert_eq!(prefix.len() + tail.len(), NONCE_SIZE, "nonce parts must fill 24 bytes");
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[..prefix.len()].copy_from_slice(prefix);
    nonce[prefix.len()..].copy_from_slice(tail);
    nonce
}

/// Random tail for a long nonce.
pub(crate) fn random_long_nonce() -> [u8; LONG_NONCE_SIZE] {
    use rand::RngCore;
    let mut tail = [0u8; LONG_NONCE_SIZE];
    OsRng.fill_bytes(&mut tail);
    tail
}

pub(crate) fn read_short_nonce(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; SHORT_NONCE_SIZE];
    buf.copy_from_slice(&bytes[..SHORT_NONCE_SIZE]);
    u64::from_be_bytes(buf)
}

fn is_handshake_command(msg: &[u8], tag: &[u8]) -> bool {
    msg.len() >= tag.len() && &msg[..tag.len()] == tag
}

/// Whether `msg` is a HELLO command.
pub fn is_handshake_command_hello(msg: &[u8]) -> bool {
    is_handshake_command(msg, HELLO_TAG)
}

/// Whether `msg` is a WELCOME command.
pub fn is_handshake_command_welcome(msg: &[u8]) -> bool {
    is_handshake_command(msg, WELCOME_TAG)
}

/// Whether `msg` is an INITIATE command.
pub fn is_handshake_command_initiate(msg: &[u8]) -> bool {
    is_handshake_command(msg, INITIATE_TAG)
}

/// Whether `msg` is a READY command.
pub fn is_handshake_command_ready(msg: &[u8]) -> bool {
    is_handshake_command(msg, READY_TAG)
}

/// Whether `msg` is an ERROR command.
pub fn is_handshake_command_error(msg: &[u8]) -> bool {
    is_handshake_command(msg, ERROR_TAG)
}

/// Build an ERROR command. Reasons longer than 255 bytes are truncated.
pub fn produce_error(reason: &str) -> Vec<u8> {
    let reason = &reason.as_bytes()[..reason.len().min(u8::MAX as usize)];
    let mut out = Vec::with_capacity(ERROR_MIN_SIZE + reason.len());
    out.extend_from_slice(ERROR_TAG);
    out.push(reason.len() as u8);
    out.extend_from_slice(reason);
    out
}

/// Parse the reason out of an ERROR command.
pub fn process_error(msg: &[u8]) -> Result<String> {
    if msg.len() < ERROR_MIN_SIZE {
        return Err(ProtocolError::InvalidCommandSize {
            command: "ERROR",
            expected: ERROR_MIN_SIZE,
            got: msg.len(),
        });
    }
    let len = msg[ERROR_TAG.len()] as usize;
    let reason = &msg[ERROR_MIN_SIZE..];
    if reason.len() != len {
        return Err(ProtocolError::InvalidCommandSize {
            command: "ERROR",
            expected: ERROR_MIN_SIZE + len,
            got: msg.len(),
        });
    }
    Ok(String::from_utf8_lossy(reason).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precomputed_is_symmetric() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        let ab = Precomputed::new(&b.public, &a.secret);
        let ba = Precomputed::new(&a.public, &b.secret);

        let nonce = [7u8; NONCE_SIZE];
        let sealed = ab.seal(&nonce, b"shared").unwrap();
        assert_eq!(sealed.len(), 6 + BOX_OVERHEAD);
        assert_eq!(ba.open(&nonce, &sealed, "test").unwrap(), b"shared");
    }

    #[test]
    fn test_open_with_wrong_nonce_fails() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        let key = Precomputed::new(&b.public, &a.secret);
        let sealed = key.seal(&[1u8; NONCE_SIZE], b"data").unwrap();
        assert_eq!(
            key.open(&[2u8; NONCE_SIZE], &sealed, "test").unwrap_err(),
            ProtocolError::Authentication("test")
        );
    }

    #[test]
    fn test_nonce_counter_starts_at_one_and_increments() {
        let mut counter = NonceCounter::new();
        assert_eq!(counter.next_nonce().unwrap(), 1);
        assert_eq!(counter.next_nonce().unwrap(), 2);
    }

    #[test]
    fn test_nonce_counter_refuses_to_wrap() {
        let mut counter = NonceCounter(u64::MAX - 1);
        assert_eq!(counter.next_nonce().unwrap(), u64::MAX - 1);
        assert_eq!(counter.next_nonce().unwrap_err(), ProtocolError::NonceExhausted);
        assert_eq!(counter.next_nonce().unwrap_err(), ProtocolError::NonceExhausted);
    }

    #[test]
    fn test_command_tag_recognition() {
        assert!(is_handshake_command_welcome(b"\x07WELCOME rest"));
        assert!(is_handshake_command_ready(b"\x05READY"));
        assert!(is_handshake_command_error(b"\x05ERROR\x00"));
        assert!(!is_handshake_command_welcome(b"\x07WELCOM"));
        assert!(!is_handshake_command_ready(b"\x06READY!"));
        assert!(!is_handshake_command_error(b""));
    }

    #[test]
    fn test_error_command_roundtrip() {
        let msg = produce_error("denied");
        assert!(is_handshake_command_error(&msg));
        assert_eq!(process_error(&msg).unwrap(), "denied");
    }

    #[test]
    fn test_error_command_length_mismatch() {
        let mut msg = produce_error("denied");
        msg.pop();
        assert!(matches!(
            process_error(&msg),
            Err(ProtocolError::InvalidCommandSize { command: "ERROR", .. })
        ));
    }

    #[test]
    fn test_public_key_from_slice_rejects_wrong_length() {
        assert!(public_key_from_slice(&[0u8; 31]).is_err());
        assert!(public_key_from_slice(&[0u8; 32]).is_ok());
    }

    #[test]
    fn test_key_pair_from_secret_bytes_is_stable() {
        let pair = KeyPair::generate();
        let rebuilt = KeyPair::from_secret_bytes(pair.secret.to_bytes());
        assert_eq!(pair.public, rebuilt.public);
    }

    #[test]
    fn test_key_pair_debug_redacts_secret() {
        let pair = KeyPair::generate();
        assert!(format!("{:?}", pair).contains("[REDACTED]"));
    }
}
