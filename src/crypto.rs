//! Crypto primitives for the relay protocol.
//!
//! One pre-shared key plus two fresh public values become a pair of
//! direction-specific AES-256-GCM keys via HKDF-SHA256. Every post-handshake
//! frame is `nonce(12) ‖ ciphertext ‖ tag(16)` under the sender's key; nonces
//! are drawn fresh from the OS CSPRNG per frame.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Domain-separation string bound into the key derivation.
pub const HKDF_INFO: &[u8] = b"secure-proxy-v1";

/// AEAD nonce length in bytes.
pub const NONCE_LEN: usize = 12;
/// GCM authentication tag length in bytes.
pub const TAG_LEN: usize = 16;
/// Minimum well-formed frame: nonce plus tag around an empty ciphertext.
pub const MIN_FRAME_LEN: usize = NONCE_LEN + TAG_LEN;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("key derivation failed")]
    Kdf,
    #[error("frame shorter than nonce + tag")]
    FrameTooShort,
    #[error("authentication failed")]
    Auth,
}

/// Direction-specific AEAD keys derived during the handshake.
///
/// The client's `send` key equals the relay's `recv` key and vice versa; the
/// relay performs the mirrored split of the same 64-byte output.
#[derive(Clone)]
pub struct SessionKeys {
    pub send: [u8; 32],
    pub recv: [u8; 32],
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material stays out of logs.
        f.debug_struct("SessionKeys").finish_non_exhaustive()
    }
}

/// Derives the send/recv key pair from the PSK and the handshake salt.
///
/// The salt MUST be `client_public ‖ server_public` in that order; any other
/// layout derives keys the relay cannot match.
pub fn derive_keys(psk: &[u8; 32], salt: &[u8; 64]) -> Result<SessionKeys, CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(salt), psk);
    let mut okm = [0u8; 64];
    hk.expand(HKDF_INFO, &mut okm).map_err(|_| CryptoError::Kdf)?;
    let mut send = [0u8; 32];
    let mut recv = [0u8; 32];
    send.copy_from_slice(&okm[..32]);
    recv.copy_from_slice(&okm[32..]);
    Ok(SessionKeys { send, recv })
}

/// Encrypts `plaintext` into a self-contained frame: `nonce ‖ ciphertext ‖ tag`.
///
/// Output length is always `plaintext.len() + 28`.
pub fn seal(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::Auth)?;
    let mut frame = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    frame.extend_from_slice(&nonce);
    frame.extend_from_slice(&ciphertext);
    Ok(frame)
}

/// Decrypts a frame produced by [`seal`]. Tag mismatch is fatal for the
/// session and surfaces as [`CryptoError::Auth`].
pub fn open(key: &[u8; 32], frame: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if frame.len() < MIN_FRAME_LEN {
        return Err(CryptoError::FrameTooShort);
    }
    let (nonce, ciphertext) = frame.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::Auth)
}

/// HMAC-SHA256 over `msg`.
pub fn hmac_tag(key: &[u8], msg: &[u8]) -> [u8; 32] {
    // new_from_slice accepts keys of any length.
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(msg);
    mac.finalize().into_bytes().into()
}

/// Constant-time equality; runtime does not depend on the differing index.
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

/// Fills a fixed-size array from the OS CSPRNG.
pub fn random_array<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    OsRng.fill_bytes(&mut out);
    out
}

/// Draws `n` bytes from the OS CSPRNG.
pub fn random_bytes(n: usize) -> Vec<u8> {
    let mut out = vec![0u8; n];
    OsRng.fill_bytes(&mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn salt_of(client: &[u8; 32], server: &[u8; 32]) -> [u8; 64] {
        let mut salt = [0u8; 64];
        salt[..32].copy_from_slice(client);
        salt[32..].copy_from_slice(server);
        salt
    }

    #[test]
    fn derive_is_deterministic_and_split() {
        let psk = [0u8; 32];
        let salt = salt_of(&[0x00; 32], &[0x01; 32]);
        let a = derive_keys(&psk, &salt).unwrap();
        let b = derive_keys(&psk, &salt).unwrap();
        assert_eq!(a.send, b.send);
        assert_eq!(a.recv, b.recv);
        assert_ne!(a.send, a.recv);
    }

    #[test]
    fn mirrored_split_matches_across_endpoints() {
        // The relay splits the same 64-byte output the other way around, so
        // our send key must decrypt what their recv key encrypted.
        let psk = random_array::<32>();
        let salt = salt_of(&random_array::<32>(), &random_array::<32>());
        let client = derive_keys(&psk, &salt).unwrap();
        let server_side = {
            let k = derive_keys(&psk, &salt).unwrap();
            SessionKeys {
                send: k.recv,
                recv: k.send,
            }
        };
        let frame = seal(&client.send, b"payload").unwrap();
        assert_eq!(open(&server_side.recv, &frame).unwrap(), b"payload");
    }

    #[test]
    fn salt_order_matters() {
        let psk = [7u8; 32];
        let a = derive_keys(&psk, &salt_of(&[1; 32], &[2; 32])).unwrap();
        let b = derive_keys(&psk, &salt_of(&[2; 32], &[1; 32])).unwrap();
        assert_ne!(a.send, b.send);
    }

    #[test]
    fn seal_open_round_trip() {
        let key = random_array::<32>();
        let msg = b"tunnelled bytes";
        let frame = seal(&key, msg).unwrap();
        assert_eq!(frame.len(), msg.len() + MIN_FRAME_LEN);
        assert_eq!(open(&key, &frame).unwrap(), msg);
    }

    #[test]
    fn single_bit_flip_fails_open() {
        let key = random_array::<32>();
        let frame = seal(&key, b"sensitive").unwrap();
        for bit in [0usize, frame.len() * 8 / 2, frame.len() * 8 - 1] {
            let mut tampered = frame.clone();
            tampered[bit / 8] ^= 1 << (bit % 8);
            assert_eq!(open(&key, &tampered).unwrap_err(), CryptoError::Auth);
        }
    }

    #[test]
    fn open_rejects_short_frames() {
        let key = [0u8; 32];
        assert_eq!(
            open(&key, &[0u8; MIN_FRAME_LEN - 1]).unwrap_err(),
            CryptoError::FrameTooShort
        );
    }

    #[test]
    fn empty_plaintext_round_trips() {
        let key = random_array::<32>();
        let frame = seal(&key, b"").unwrap();
        assert_eq!(frame.len(), MIN_FRAME_LEN);
        assert!(open(&key, &frame).unwrap().is_empty());
    }

    #[test]
    fn ct_eq_basic() {
        assert!(ct_eq(b"abc", b"abc"));
        assert!(!ct_eq(b"abc", b"abd"));
        assert!(!ct_eq(b"abc", b"abcd"));
    }

    #[test]
    fn hmac_differs_per_key_and_message() {
        let t1 = hmac_tag(b"k1", b"auth");
        let t2 = hmac_tag(b"k2", b"auth");
        let t3 = hmac_tag(b"k1", b"ok");
        assert_ne!(t1, t2);
        assert_ne!(t1, t3);
    }
}
