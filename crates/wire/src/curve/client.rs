//! Client-side CURVE command builders and parsers.
//!
//! Every function here is stateless: keys and nonces go in, bytes or parsed
//! fields come out. [`CurveClient`](super::mechanism::CurveClient) owns the
//! state between calls.

use super::{
    full_nonce, public_key_from_slice, random_long_nonce, read_short_nonce, Precomputed,
    PublicKey, SecretKey, COOKIE_SIZE, HELLO_BOX_OFFSET, HELLO_BOX_SIZE, HELLO_CLIENT_KEY_OFFSET,
    HELLO_NONCE_OFFSET, HELLO_NONCE_PREFIX, HELLO_PLAINTEXT_SIZE, HELLO_SIZE, HELLO_TAG,
    HELLO_VERSION, HELLO_VERSION_OFFSET, INITIATE_NONCE_PREFIX, INITIATE_TAG, KEY_SIZE,
    LONG_NONCE_SIZE, READY_BOX_OFFSET, READY_MIN_SIZE, READY_NONCE_OFFSET, READY_NONCE_PREFIX,
    VOUCH_BOX_SIZE, VOUCH_NONCE_PREFIX, VOUCH_SIZE, WELCOME_BOX_OFFSET, WELCOME_NONCE_OFFSET,
    WELCOME_NONCE_PREFIX, WELCOME_SIZE,
};
use crate::error::{ProtocolError, Result};
use crate::metadata::Metadata;

/// Fields extracted from an authenticated WELCOME.
#[derive(Debug)]
pub struct Welcome {
    /// Server transient public key `S'`.
    pub server_transient: PublicKey,
    /// Opaque cookie to echo in INITIATE.
    pub cookie: [u8; COOKIE_SIZE],
    /// Session secret derived from `S'` and the client transient secret.
    pub precomputed: Precomputed,
}

/// Fields extracted from an authenticated READY.
#[derive(Debug)]
pub struct Ready {
    /// Server short nonce.
    pub short_nonce: u64,
    /// Server metadata.
    pub metadata: Metadata,
}

/// Build a HELLO command.
pub fn produce_hello(
    server_key: &PublicKey,
    cn_nonce: u64,
    cn_public: &PublicKey,
    cn_secret: &SecretKey,
) -> Result<[u8; HELLO_SIZE]> {
    let short_nonce = cn_nonce.to_be_bytes();
    let nonce = full_nonce(HELLO_NONCE_PREFIX, &short_nonce);
    let signature =
        Precomputed::new(server_key, cn_secret).seal(&nonce, &[0u8; HELLO_PLAINTEXT_SIZE])?;
    debug_assert_eq!(signature.len(), HELLO_BOX_SIZE);

    // Padding stays zeroed.
    let mut hello = [0u8; HELLO_SIZE];
    hello[..HELLO_VERSION_OFFSET].copy_from_slice(HELLO_TAG);
    hello[HELLO_VERSION_OFFSET..HELLO_VERSION_OFFSET + 2].copy_from_slice(&HELLO_VERSION);
    hello[HELLO_CLIENT_KEY_OFFSET..HELLO_NONCE_OFFSET].copy_from_slice(cn_public.as_bytes());
    hello[HELLO_NONCE_OFFSET..HELLO_BOX_OFFSET].copy_from_slice(&short_nonce);
    hello[HELLO_BOX_OFFSET..].copy_from_slice(&signature);
    Ok(hello)
}

/// Authenticate and parse a WELCOME command.
///
/// Fails without side effects on a wrong length or if the box does not open.
pub fn process_welcome(
    msg: &[u8],
    server_key: &PublicKey,
    cn_secret: &SecretKey,
) -> Result<Welcome> {
    if msg.len() != WELCOME_SIZE {
        return Err(ProtocolError::InvalidCommandSize {
            command: "WELCOME",
            expected: WELCOME_SIZE,
            got: msg.len(),
        });
    }

    let nonce = full_nonce(
        WELCOME_NONCE_PREFIX,
        &msg[WELCOME_NONCE_OFFSET..WELCOME_BOX_OFFSET],
    );
    let plaintext = Precomputed::new(server_key, cn_secret).open(
        &nonce,
        &msg[WELCOME_BOX_OFFSET..],
        "WELCOME",
    )?;

    let server_transient = public_key_from_slice(&plaintext[..KEY_SIZE])?;
    let mut cookie = [0u8; COOKIE_SIZE];
    cookie.copy_from_slice(&plaintext[KEY_SIZE..KEY_SIZE + COOKIE_SIZE]);

    Ok(Welcome {
        precomputed: Precomputed::new(&server_transient, cn_secret),
        server_transient,
        cookie,
    })
}

/// Build the vouch proving that the long-term key owns the transient key.
pub fn produce_vouch(
    client_secret: &SecretKey,
    cn_public: &PublicKey,
    server_key: &PublicKey,
    server_transient: &PublicKey,
) -> Result<[u8; VOUCH_SIZE]> {
    let tail = random_long_nonce();
    let nonce = full_nonce(VOUCH_NONCE_PREFIX, &tail);

    let mut plaintext = [0u8; 2 * KEY_SIZE];
    plaintext[..KEY_SIZE].copy_from_slice(cn_public.as_bytes());
    plaintext[KEY_SIZE..].copy_from_slice(server_key.as_bytes());
    let sealed = Precomputed::new(server_transient, client_secret).seal(&nonce, &plaintext)?;
    debug_assert_eq!(sealed.len(), VOUCH_BOX_SIZE);

    let mut vouch = [0u8; VOUCH_SIZE];
    vouch[..LONG_NONCE_SIZE].copy_from_slice(&tail);
    vouch[LONG_NONCE_SIZE..].copy_from_slice(&sealed);
    Ok(vouch)
}

/// Build an INITIATE command.
pub fn produce_initiate(
    cookie: &[u8; COOKIE_SIZE],
    cn_nonce: u64,
    precomputed: &Precomputed,
    client_public: &PublicKey,
    vouch: &[u8; VOUCH_SIZE],
    metadata: &[u8],
) -> Result<Vec<u8>> {
    let short_nonce = cn_nonce.to_be_bytes();
    let nonce = full_nonce(INITIATE_NONCE_PREFIX, &short_nonce);

    let mut plaintext = Vec::with_capacity(KEY_SIZE + VOUCH_SIZE + metadata.len());
    plaintext.extend_from_slice(client_public.as_bytes());
    plaintext.extend_from_slice(vouch);
    plaintext.extend_from_slice(metadata);
    let sealed = precomputed.seal(&nonce, &plaintext)?;

    let mut initiate =
        Vec::with_capacity(INITIATE_TAG.len() + COOKIE_SIZE + short_nonce.len() + sealed.len());
    initiate.extend_from_slice(INITIATE_TAG);
    initiate.extend_from_slice(cookie);
    initiate.extend_from_slice(&short_nonce);
    initiate.extend_from_slice(&sealed);
    Ok(initiate)
}

/// Authenticate and parse a READY command.
pub fn process_ready(msg: &[u8], precomputed: &Precomputed) -> Result<Ready> {
    if msg.len() < READY_MIN_SIZE {
        return Err(ProtocolError::InvalidCommandSize {
            command: "READY",
            expected: READY_MIN_SIZE,
            got: msg.len(),
        });
    }

    let short_nonce = &msg[READY_NONCE_OFFSET..READY_BOX_OFFSET];
    let nonce = full_nonce(READY_NONCE_PREFIX, short_nonce);
    let plaintext = precomputed.open(&nonce, &msg[READY_BOX_OFFSET..], "READY")?;

    Ok(Ready {
        short_nonce: read_short_nonce(short_nonce),
        metadata: Metadata::decode(&plaintext)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::curve::server::{produce_welcome, CookieKey};
    use crate::curve::{is_handshake_command_welcome, KeyPair, NONCE_SIZE};

    struct Peers {
        server: KeyPair,
        client_transient: KeyPair,
        server_transient: KeyPair,
        cookie_key: CookieKey,
    }

    fn peers() -> Peers {
        Peers {
            server: KeyPair::generate(),
            client_transient: KeyPair::generate(),
            server_transient: KeyPair::generate(),
            cookie_key: CookieKey::generate(),
        }
    }

    fn welcome(p: &Peers) -> [u8; WELCOME_SIZE] {
        produce_welcome(
            &p.client_transient.public,
            &p.server.secret,
            &p.server_transient,
            &p.cookie_key,
        )
        .unwrap()
    }

    #[test]
    fn test_hello_layout() {
        let p = peers();
        let hello = produce_hello(
            &p.server.public,
            1,
            &p.client_transient.public,
            &p.client_transient.secret,
        )
        .unwrap();

        assert_eq!(hello.len(), 200);
        assert_eq!(&hello[..6], b"\x05HELLO");
        assert_eq!(&hello[6..8], &[1, 0]);
        assert!(hello[8..80].iter().all(|&b| b == 0));
        assert_eq!(&hello[80..112], p.client_transient.public.as_bytes());
        assert_eq!(&hello[112..120], &1u64.to_be_bytes());
    }

    #[test]
    fn test_hello_box_opens_with_server_secret() {
        let p = peers();
        let hello = produce_hello(
            &p.server.public,
            42,
            &p.client_transient.public,
            &p.client_transient.secret,
        )
        .unwrap();

        let key = Precomputed::new(&p.client_transient.public, &p.server.secret);
        let nonce = full_nonce(HELLO_NONCE_PREFIX, &hello[112..120]);
        let opened = key.open(&nonce, &hello[120..], "HELLO").unwrap();
        assert_eq!(opened, vec![0u8; 64]);
    }

    #[test]
    fn test_welcome_roundtrip_yields_same_shared_secret() {
        let p = peers();
        let msg = welcome(&p);
        assert!(is_handshake_command_welcome(&msg));

        let parsed =
            process_welcome(&msg, &p.server.public, &p.client_transient.secret).unwrap();
        assert_eq!(parsed.server_transient, p.server_transient.public);

        let server_side =
            Precomputed::new(&p.client_transient.public, &p.server_transient.secret);
        let nonce = [9u8; NONCE_SIZE];
        let sealed = parsed.precomputed.seal(&nonce, b"both sides agree").unwrap();
        assert_eq!(
            server_side.open(&nonce, &sealed, "test").unwrap(),
            b"both sides agree"
        );
    }

    #[test]
    fn test_welcome_wrong_length_rejected() {
        let p = peers();
        let msg = welcome(&p);
        for len in [0, 8, 167] {
            let err = process_welcome(&msg[..len], &p.server.public, &p.client_transient.secret)
                .unwrap_err();
            assert_eq!(
                err,
                ProtocolError::InvalidCommandSize {
                    command: "WELCOME",
                    expected: 168,
                    got: len,
                }
            );
        }

        let mut long = msg.to_vec();
        long.push(0);
        assert!(process_welcome(&long, &p.server.public, &p.client_transient.secret).is_err());
    }

    #[test]
    fn test_welcome_any_flipped_box_bit_rejected() {
        let p = peers();
        let msg = welcome(&p);
        for offset in WELCOME_BOX_OFFSET..WELCOME_SIZE {
            for bit in 0..8 {
                let mut tampered = msg;
                tampered[offset] ^= 1 << bit;
                assert_eq!(
                    process_welcome(&tampered, &p.server.public, &p.client_transient.secret)
                        .unwrap_err(),
                    ProtocolError::Authentication("WELCOME")
                );
            }
        }
    }

    #[test]
    fn test_welcome_from_wrong_server_rejected() {
        let p = peers();
        let msg = welcome(&p);
        let impostor = KeyPair::generate();
        assert!(process_welcome(&msg, &impostor.public, &p.client_transient.secret).is_err());
    }

    #[test]
    fn test_initiate_minimum_size() {
        let p = peers();
        let client = KeyPair::generate();
        let parsed = process_welcome(&welcome(&p), &p.server.public, &p.client_transient.secret)
            .unwrap();
        let vouch = produce_vouch(
            &client.secret,
            &p.client_transient.public,
            &p.server.public,
            &parsed.server_transient,
        )
        .unwrap();
        let initiate =
            produce_initiate(&parsed.cookie, 2, &parsed.precomputed, &client.public, &vouch, &[])
                .unwrap();

        assert_eq!(initiate.len(), crate::curve::INITIATE_MIN_SIZE);
        assert_eq!(&initiate[..9], b"\x08INITIATE");
        assert_eq!(&initiate[9..105], &parsed.cookie);
        assert_eq!(&initiate[105..113], &2u64.to_be_bytes());
    }

    #[test]
    fn test_ready_too_short_rejected() {
        let p = peers();
        let key = Precomputed::new(&p.server.public, &p.client_transient.secret);
        assert!(matches!(
            process_ready(b"\x05READY", &key),
            Err(ProtocolError::InvalidCommandSize { command: "READY", .. })
        ));
    }
}
