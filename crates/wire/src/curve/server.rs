//! Server-side CURVE command builders and parsers.

use super::{
    full_nonce, public_key_from_slice, random_long_nonce, read_short_nonce, KeyPair, Precomputed,
    PublicKey, SecretKey, COOKIE_NONCE_PREFIX, COOKIE_SIZE, HELLO_BOX_OFFSET,
    HELLO_CLIENT_KEY_OFFSET, HELLO_NONCE_OFFSET, HELLO_NONCE_PREFIX, HELLO_SIZE, HELLO_VERSION,
    HELLO_VERSION_OFFSET, INITIATE_BOX_OFFSET, INITIATE_COOKIE_OFFSET, INITIATE_MIN_SIZE,
    INITIATE_NONCE_OFFSET, INITIATE_NONCE_PREFIX, KEY_SIZE, LONG_NONCE_SIZE, NONCE_SIZE,
    READY_NONCE_PREFIX, READY_TAG, VOUCH_NONCE_PREFIX, VOUCH_SIZE, WELCOME_SIZE, WELCOME_TAG,
};
use crate::error::{ProtocolError, Result};
use crate::metadata::Metadata;

/// Symmetric key the server uses to seal cookies to itself.
///
/// Generated once per server mechanism; a cookie sealed by one instance does
/// not open under another.
pub struct CookieKey(Precomputed);

impl CookieKey {
    /// Generate a fresh cookie key.
    pub fn generate() -> Self {
        let pair = KeyPair::generate();
        Self(Precomputed::new(&pair.public, &pair.secret))
    }

    fn seal(&self, nonce: &[u8; NONCE_SIZE], plaintext: &[u8]) -> Result<Vec<u8>> {
        self.0.seal(nonce, plaintext)
    }

    fn open(&self, nonce: &[u8; NONCE_SIZE], ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.0.open(nonce, ciphertext, "cookie")
    }
}

impl std::fmt::Debug for CookieKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CookieKey([REDACTED])")
    }
}

/// Fields extracted from an authenticated HELLO.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    /// Client transient public key `C'`.
    pub client_transient: PublicKey,
    /// Client short nonce.
    pub short_nonce: u64,
}

/// Fields extracted from an authenticated INITIATE.
#[derive(Debug)]
pub struct Initiate {
    /// Client long-term public key `C`.
    pub client_key: PublicKey,
    /// Client transient public key `C'`, recovered from the cookie.
    pub client_transient: PublicKey,
    /// Client short nonce.
    pub short_nonce: u64,
    /// Client metadata.
    pub metadata: Metadata,
    /// Session secret derived from `C'` and the server transient secret.
    pub precomputed: Precomputed,
}

/// Authenticate and parse a HELLO command.
pub fn process_hello(msg: &[u8], server_secret: &SecretKey) -> Result<Hello> {
    if msg.len() != HELLO_SIZE {
        return Err(ProtocolError::InvalidCommandSize {
            command: "HELLO",
            expected: HELLO_SIZE,
            got: msg.len(),
        });
    }
    let version = &msg[HELLO_VERSION_OFFSET..HELLO_VERSION_OFFSET + 2];
    if version[0] != HELLO_VERSION[0] {
        return Err(ProtocolError::UnsupportedVersion(version[0]));
    }

    let client_transient =
        public_key_from_slice(&msg[HELLO_CLIENT_KEY_OFFSET..HELLO_NONCE_OFFSET])?;
    let short_nonce = &msg[HELLO_NONCE_OFFSET..HELLO_BOX_OFFSET];
    let nonce = full_nonce(HELLO_NONCE_PREFIX, short_nonce);
    let plaintext = Precomputed::new(&client_transient, server_secret).open(
        &nonce,
        &msg[HELLO_BOX_OFFSET..],
        "HELLO",
    )?;
    if plaintext.iter().any(|&b| b != 0) {
        return Err(ProtocolError::Authentication("HELLO"));
    }

    Ok(Hello {
        client_transient,
        short_nonce: read_short_nonce(short_nonce),
    })
}

/// Build a WELCOME command.
///
/// The cookie carries `C'` and the server transient secret, sealed under
/// `cookie_key`, so INITIATE can be verified against it later.
pub fn produce_welcome(
    client_transient: &PublicKey,
    server_secret: &SecretKey,
    server_transient: &KeyPair,
    cookie_key: &CookieKey,
) -> Result<[u8; WELCOME_SIZE]> {
    let cookie_tail = random_long_nonce();
    let mut cookie_plaintext = [0u8; 2 * KEY_SIZE];
    cookie_plaintext[..KEY_SIZE].copy_from_slice(client_transient.as_bytes());
    cookie_plaintext[KEY_SIZE..].copy_from_slice(&server_transient.secret.to_bytes());
    let sealed_cookie = cookie_key.seal(
        &full_nonce(COOKIE_NONCE_PREFIX, &cookie_tail),
        &cookie_plaintext,
    )?;

    let mut plaintext = Vec::with_capacity(KEY_SIZE + COOKIE_SIZE);
    plaintext.extend_from_slice(server_transient.public.as_bytes());
    plaintext.extend_from_slice(&cookie_tail);
    plaintext.extend_from_slice(&sealed_cookie);
    debug_assert_eq!(plaintext.len(), KEY_SIZE + COOKIE_SIZE);

    let tail = random_long_nonce();
    let sealed = Precomputed::new(client_transient, server_secret)
        .seal(&full_nonce(super::WELCOME_NONCE_PREFIX, &tail), &plaintext)?;

    let mut welcome = [0u8; WELCOME_SIZE];
    welcome[..WELCOME_TAG.len()].copy_from_slice(WELCOME_TAG);
    welcome[WELCOME_TAG.len()..WELCOME_TAG.len() + LONG_NONCE_SIZE].copy_from_slice(&tail);
    welcome[WELCOME_TAG.len() + LONG_NONCE_SIZE..].copy_from_slice(&sealed);
    Ok(welcome)
}

/// Authenticate and parse an INITIATE command.
///
/// Opens the cookie, the INITIATE box and the vouch; the vouch must name the
/// transient key from the cookie and `server_public`.
pub fn process_initiate(
    msg: &[u8],
    cookie_key: &CookieKey,
    server_public: &PublicKey,
) -> Result<Initiate> {
    if msg.len() < INITIATE_MIN_SIZE {
        return Err(ProtocolError::InvalidCommandSize {
            command: "INITIATE",
            expected: INITIATE_MIN_SIZE,
            got: msg.len(),
        });
    }

    let cookie = &msg[INITIATE_COOKIE_OFFSET..INITIATE_NONCE_OFFSET];
    let cookie_plaintext = cookie_key.open(
        &full_nonce(COOKIE_NONCE_PREFIX, &cookie[..LONG_NONCE_SIZE]),
        &cookie[LONG_NONCE_SIZE..],
    )?;
    let client_transient = public_key_from_slice(&cookie_plaintext[..KEY_SIZE])?;
    let mut transient_secret = [0u8; KEY_SIZE];
    transient_secret.copy_from_slice(&cookie_plaintext[KEY_SIZE..]);
    let server_transient = KeyPair::from_secret_bytes(transient_secret);
    let precomputed = Precomputed::new(&client_transient, &server_transient.secret);

    let short_nonce = &msg[INITIATE_NONCE_OFFSET..INITIATE_BOX_OFFSET];
    let plaintext = precomputed.open(
        &full_nonce(INITIATE_NONCE_PREFIX, short_nonce),
        &msg[INITIATE_BOX_OFFSET..],
        "INITIATE",
    )?;

    let client_key = public_key_from_slice(&plaintext[..KEY_SIZE])?;
    let vouch = &plaintext[KEY_SIZE..KEY_SIZE + VOUCH_SIZE];
    let vouched = Precomputed::new(&client_key, &server_transient.secret).open(
        &full_nonce(VOUCH_NONCE_PREFIX, &vouch[..LONG_NONCE_SIZE]),
        &vouch[LONG_NONCE_SIZE..],
        "vouch",
    )?;
    if &vouched[..KEY_SIZE] != client_transient.as_bytes()
        || &vouched[KEY_SIZE..] != server_public.as_bytes()
    {
        return Err(ProtocolError::Authentication("vouch"));
    }

    Ok(Initiate {
        client_key,
        client_transient,
        short_nonce: read_short_nonce(short_nonce),
        metadata: Metadata::decode(&plaintext[KEY_SIZE + VOUCH_SIZE..])?,
        precomputed,
    })
}

/// Build a READY command.
pub fn produce_ready(
    precomputed: &Precomputed,
    cn_nonce: u64,
    metadata: &[u8],
) -> Result<Vec<u8>> {
    let short_nonce = cn_nonce.to_be_bytes();
    let sealed = precomputed.seal(&full_nonce(READY_NONCE_PREFIX, &short_nonce), metadata)?;

    let mut ready = Vec::with_capacity(READY_TAG.len() + short_nonce.len() + sealed.len());
    ready.extend_from_slice(READY_TAG);
    ready.extend_from_slice(&short_nonce);
    ready.extend_from_slice(&sealed);
    Ok(ready)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::curve::client::{
        process_ready, process_welcome, produce_hello, produce_initiate, produce_vouch,
    };
    use crate::curve::is_handshake_command_ready;
    use crate::metadata::SOCKET_TYPE;

    #[test]
    fn test_process_hello_accepts_client_hello() {
        let server = KeyPair::generate();
        let transient = KeyPair::generate();
        let hello = produce_hello(&server.public, 7, &transient.public, &transient.secret).unwrap();

        let parsed = process_hello(&hello, &server.secret).unwrap();
        assert_eq!(parsed.client_transient, transient.public);
        assert_eq!(parsed.short_nonce, 7);
    }

    #[test]
    fn test_process_hello_rejects_wrong_server() {
        let server = KeyPair::generate();
        let other = KeyPair::generate();
        let transient = KeyPair::generate();
        let hello = produce_hello(&server.public, 1, &transient.public, &transient.secret).unwrap();

        assert_eq!(
            process_hello(&hello, &other.secret).unwrap_err(),
            ProtocolError::Authentication("HELLO")
        );
    }

    #[test]
    fn test_process_hello_rejects_bad_version_and_size() {
        let server = KeyPair::generate();
        let transient = KeyPair::generate();
        let mut hello =
            produce_hello(&server.public, 1, &transient.public, &transient.secret).unwrap();

        assert!(matches!(
            process_hello(&hello[..199], &server.secret),
            Err(ProtocolError::InvalidCommandSize { command: "HELLO", .. })
        ));
        hello[6] = 2;
        assert_eq!(
            process_hello(&hello, &server.secret).unwrap_err(),
            ProtocolError::UnsupportedVersion(2)
        );
    }

    #[test]
    fn test_full_command_exchange() {
        let server = KeyPair::generate();
        let client = KeyPair::generate();
        let client_transient = KeyPair::generate();
        let server_transient = KeyPair::generate();
        let cookie_key = CookieKey::generate();

        let hello = produce_hello(
            &server.public,
            1,
            &client_transient.public,
            &client_transient.secret,
        )
        .unwrap();
        let hello = process_hello(&hello, &server.secret).unwrap();

        let welcome =
            produce_welcome(&hello.client_transient, &server.secret, &server_transient, &cookie_key)
                .unwrap();
        let welcome = process_welcome(&welcome, &server.public, &client_transient.secret).unwrap();

        let vouch = produce_vouch(
            &client.secret,
            &client_transient.public,
            &server.public,
            &welcome.server_transient,
        )
        .unwrap();
        let metadata = Metadata::new().with(SOCKET_TYPE, "DEALER").unwrap();
        let initiate = produce_initiate(
            &welcome.cookie,
            2,
            &welcome.precomputed,
            &client.public,
            &vouch,
            &metadata.encode(),
        )
        .unwrap();
        let initiate = process_initiate(&initiate, &cookie_key, &server.public).unwrap();
        assert_eq!(initiate.client_key, client.public);
        assert_eq!(initiate.client_transient, client_transient.public);
        assert_eq!(initiate.short_nonce, 2);
        assert_eq!(initiate.metadata.get(SOCKET_TYPE), Some(&b"DEALER"[..]));

        let server_metadata = Metadata::new().with(SOCKET_TYPE, "ROUTER").unwrap();
        let ready = produce_ready(&initiate.precomputed, 1, &server_metadata.encode()).unwrap();
        assert!(is_handshake_command_ready(&ready));
        let ready = process_ready(&ready, &welcome.precomputed).unwrap();
        assert_eq!(ready.short_nonce, 1);
        assert_eq!(ready.metadata, server_metadata);
    }

    #[test]
    fn test_any_flipped_initiate_or_ready_box_bit_rejected() {
        let server = KeyPair::generate();
        let client = KeyPair::generate();
        let client_transient = KeyPair::generate();
        let server_transient = KeyPair::generate();
        let cookie_key = CookieKey::generate();

        let welcome = produce_welcome(
            &client_transient.public,
            &server.secret,
            &server_transient,
            &cookie_key,
        )
        .unwrap();
        let welcome = process_welcome(&welcome, &server.public, &client_transient.secret).unwrap();
        let vouch = produce_vouch(
            &client.secret,
            &client_transient.public,
            &server.public,
            &welcome.server_transient,
        )
        .unwrap();
        let initiate =
            produce_initiate(&welcome.cookie, 2, &welcome.precomputed, &client.public, &vouch, &[])
                .unwrap();

        for offset in INITIATE_BOX_OFFSET..initiate.len() {
            for bit in 0..8 {
                let mut tampered = initiate.clone();
                tampered[offset] ^= 1 << bit;
                assert_eq!(
                    process_initiate(&tampered, &cookie_key, &server.public).unwrap_err(),
                    ProtocolError::Authentication("INITIATE")
                );
            }
        }

        let accepted = process_initiate(&initiate, &cookie_key, &server.public).unwrap();
        let ready = produce_ready(&accepted.precomputed, 1, &[]).unwrap();
        for offset in crate::curve::READY_BOX_OFFSET..ready.len() {
            for bit in 0..8 {
                let mut tampered = ready.clone();
                tampered[offset] ^= 1 << bit;
                assert_eq!(
                    process_ready(&tampered, &welcome.precomputed).unwrap_err(),
                    ProtocolError::Authentication("READY")
                );
            }
        }
    }

    #[test]
    fn test_initiate_with_foreign_cookie_rejected() {
        let server = KeyPair::generate();
        let client = KeyPair::generate();
        let client_transient = KeyPair::generate();
        let server_transient = KeyPair::generate();
        let cookie_key = CookieKey::generate();

        let welcome = produce_welcome(
            &client_transient.public,
            &server.secret,
            &server_transient,
            &cookie_key,
        )
        .unwrap();
        let welcome = process_welcome(&welcome, &server.public, &client_transient.secret).unwrap();
        let vouch = produce_vouch(
            &client.secret,
            &client_transient.public,
            &server.public,
            &welcome.server_transient,
        )
        .unwrap();
        let initiate = produce_initiate(
            &welcome.cookie,
            2,
            &welcome.precomputed,
            &client.public,
            &vouch,
            &[],
        )
        .unwrap();

        assert_eq!(
            process_initiate(&initiate, &CookieKey::generate(), &server.public).unwrap_err(),
            ProtocolError::Authentication("cookie")
        );
    }

    #[test]
    fn test_initiate_vouch_for_other_server_rejected() {
        let server = KeyPair::generate();
        let client = KeyPair::generate();
        let client_transient = KeyPair::generate();
        let server_transient = KeyPair::generate();
        let cookie_key = CookieKey::generate();

        let welcome = produce_welcome(
            &client_transient.public,
            &server.secret,
            &server_transient,
            &cookie_key,
        )
        .unwrap();
        let welcome = process_welcome(&welcome, &server.public, &client_transient.secret).unwrap();
        let elsewhere = KeyPair::generate();
        let vouch = produce_vouch(
            &client.secret,
            &client_transient.public,
            &elsewhere.public,
            &welcome.server_transient,
        )
        .unwrap();
        let initiate = produce_initiate(
            &welcome.cookie,
            2,
            &welcome.precomputed,
            &client.public,
            &vouch,
            &[],
        )
        .unwrap();

        assert_eq!(
            process_initiate(&initiate, &cookie_key, &server.public).unwrap_err(),
            ProtocolError::Authentication("vouch")
        );
    }

    #[test]
    fn test_initiate_too_short_rejected() {
        let server = KeyPair::generate();
        assert!(matches!(
            process_initiate(&[0u8; 256], &CookieKey::generate(), &server.public),
            Err(ProtocolError::InvalidCommandSize { command: "INITIATE", .. })
        ));
    }
}
