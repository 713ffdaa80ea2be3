// src/crypto.rs
// The Crypto Envelope (C1): ECDH key agreement, AES-256-GCM, the optional
// room-password layer, and the dual-layer chunk framing (spec §4.1).
//
// The teacher's `CryptoManager` does the same shape of thing on X25519; this
// keeps its structure (one `RwLock<Option<keypair>>`, one
// `RwLock<HashMap<PeerId, session>>`) but moves to P-256, which the spec
// calls out explicitly, and adds the room-password layer and dual-layer
// framing the teacher doesn't need.

use std::collections::HashMap;
use std::sync::RwLock;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hmac::Hmac;
use p256::ecdh::diffie_hellman;
use p256::pkcs8::{DecodePublicKey, EncodePublicKey};
use p256::{PublicKey, SecretKey};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::CryptoError;
use crate::model::{PeerId, RoomCode};

/// AES-GCM nonce size in bytes.
const NONCE_SIZE: usize = 12;
/// PBKDF2 iteration count for the room key (spec §3 "RoomKey").
const PBKDF2_ITERATIONS: u32 = 100_000;
/// Minimum accepted room password length (spec §6).
const MIN_PASSWORD_LEN: usize = 6;

/// Derives the salted SHA-256 hex digest the signaling hub gates a room with,
/// and that a client sends as its own proof of knowing the password
/// (spec §4.2 "Password gate", §4.1 `hashPasswordForServer`).
pub fn hash_password_for_server(password: &str, room_code: &RoomCode) -> String {
    let composite = format!("{}:{}:clouddrop", password, room_code.as_str());
    let mut hasher = Sha256::new();
    hasher.update(composite.as_bytes());
    hex::encode(hasher.finalize())
}

/// Derives the AES-256-GCM room key by PBKDF2-SHA256 over
/// `(password, "clouddrop-room-<roomCode>")` (spec §3 "RoomKey").
fn derive_room_key(password: &str, room_code: &RoomCode) -> [u8; 32] {
    let salt = format!("clouddrop-room-{}", room_code.as_str());
    let mut out = [0u8; 32];
    pbkdf2::pbkdf2::<Hmac<Sha256>>(
        password.as_bytes(),
        salt.as_bytes(),
        PBKDF2_ITERATIONS,
        &mut out,
    )
    .expect("32-byte output is always a valid PBKDF2 length");
    out
}

fn random_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

fn cipher_from_key(key: &[u8; 32]) -> Aes256Gcm {
    Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key))
}

/// A device's long-lived (session-scoped) P-256 keypair.
struct LocalKeypair {
    secret: SecretKey,
    public: PublicKey,
}

/// The crypto manager for one device: one local keypair, one AES-GCM
/// session key per peer, and at most one room key.
pub struct CryptoManager {
    keypair: RwLock<Option<LocalKeypair>>,
    peer_keys: RwLock<HashMap<PeerId, [u8; 32]>>,
    room_key: RwLock<Option<[u8; 32]>>,
}

impl CryptoManager {
    pub fn new() -> Self {
        CryptoManager {
            keypair: RwLock::new(None),
            peer_keys: RwLock::new(HashMap::new()),
            room_key: RwLock::new(None),
        }
    }

    /// Generates a fresh P-256 keypair for this session.
    pub fn generate_local_keypair(&self) {
        let secret = SecretKey::random(&mut rand::rngs::OsRng);
        let public = secret.public_key();
        *self.keypair.write().unwrap() = Some(LocalKeypair { secret, public });
    }

    /// SPKI-encodes the local public key and base64-encodes the result, for
    /// transmission via the signaling hub's `key-exchange`/`offer` frames.
    pub fn export_local_public_key(&self) -> Result<String, CryptoError> {
        let guard = self.keypair.read().unwrap();
        let keypair = guard
            .as_ref()
            .ok_or_else(|| CryptoError::InvalidPublicKey("no local keypair generated".into()))?;
        let der = keypair
            .public
            .to_public_key_der()
            .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
        Ok(BASE64.encode(der.as_bytes()))
    }

    /// Imports a peer's SPKI-encoded public key and derives the shared
    /// AES-256-GCM key for that peer (spec §4.1 "Key agreement").
    pub fn import_peer_public_key(&self, peer: PeerId, b64: &str) -> Result<(), CryptoError> {
        let der = BASE64
            .decode(b64)
            .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
        let peer_public = PublicKey::from_public_key_der(&der)
            .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;

        let guard = self.keypair.read().unwrap();
        let keypair = guard
            .as_ref()
            .ok_or_else(|| CryptoError::InvalidPublicKey("no local keypair generated".into()))?;

        let shared = diffie_hellman(keypair.secret.to_nonzero_scalar(), peer_public.as_affine());
        let mut hasher = Sha256::new();
        hasher.update(shared.raw_secret_bytes());
        let derived: [u8; 32] = hasher.finalize().into();

        self.peer_keys.write().unwrap().insert(peer, derived);
        Ok(())
    }

    pub fn has_peer_key(&self, peer: PeerId) -> bool {
        self.peer_keys.read().unwrap().contains_key(&peer)
    }

    pub fn forget_peer(&self, peer: PeerId) {
        self.peer_keys.write().unwrap().remove(&peer);
    }

    /// Derives and stores the room key from the room password (spec §3
    /// "RoomKey"). Fails with `PasswordTooShort` below the 6-char minimum
    /// (spec §8 boundary behavior).
    pub fn set_room_password(&self, password: &str, room_code: &RoomCode) -> Result<(), CryptoError> {
        if password.len() < MIN_PASSWORD_LEN {
            return Err(CryptoError::PasswordTooShort);
        }
        let key = derive_room_key(password, room_code);
        *self.room_key.write().unwrap() = Some(key);
        Ok(())
    }

    pub fn clear_room_password(&self) {
        *self.room_key.write().unwrap() = None;
    }

    pub fn has_room_key(&self) -> bool {
        self.room_key.read().unwrap().is_some()
    }

    /// Encrypts a chunk for `peer`, applying the optional room-key layer
    /// first and the mandatory peer-key layer second (spec §4.1 wire
    /// layout). Fresh 12-byte IV per layer per call.
    pub fn encrypt_chunk(&self, peer: PeerId, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let peer_key = *self
            .peer_keys
            .read()
            .unwrap()
            .get(&peer)
            .ok_or_else(|| CryptoError::NoSharedKey(peer.to_string()))?;

        let room_key = *self.room_key.read().unwrap();

        let mut stage = plaintext.to_vec();
        let mut room_iv: Option<[u8; NONCE_SIZE]> = None;
        if let Some(room_key) = room_key {
            let iv = random_nonce();
            let cipher = cipher_from_key(&room_key);
            stage = cipher
                .encrypt(Nonce::from_slice(&iv), stage.as_ref())
                .map_err(|_| CryptoError::DecryptionFailed)?;
            room_iv = Some(iv);
        }

        let peer_iv = random_nonce();
        let peer_cipher = cipher_from_key(&peer_key);
        let ciphertext = peer_cipher
            .encrypt(Nonce::from_slice(&peer_iv), stage.as_ref())
            .map_err(|_| CryptoError::DecryptionFailed)?;

        let mut wire = Vec::with_capacity(1 + 12 + NONCE_SIZE + ciphertext.len());
        match room_iv {
            Some(iv) => {
                wire.push(12u8);
                wire.extend_from_slice(&iv);
            }
            None => wire.push(0u8),
        }
        wire.extend_from_slice(&peer_iv);
        wire.extend_from_slice(&ciphertext);
        Ok(wire)
    }

    /// Decrypts a chunk from `peer`, reversing the layering in
    /// `encrypt_chunk`. Never attempts to recover plaintext on AEAD auth
    /// failure (spec §4.1 "Failure modes").
    pub fn decrypt_chunk(&self, peer: PeerId, wire: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if wire.is_empty() {
            return Err(CryptoError::MalformedEnvelope("empty envelope"));
        }
        let room_iv_len = wire[0];
        let rest = &wire[1..];

        let (room_iv, after_room_iv) = match room_iv_len {
            0 => (None, rest),
            12 => {
                if rest.len() < 12 {
                    return Err(CryptoError::MalformedEnvelope("truncated room IV"));
                }
                (Some(&rest[..12]), &rest[12..])
            }
            _ => return Err(CryptoError::MalformedEnvelope("invalid roomIvLen")),
        };

        if after_room_iv.len() < NONCE_SIZE {
            return Err(CryptoError::MalformedEnvelope("truncated peer IV"));
        }
        let peer_iv = &after_room_iv[..NONCE_SIZE];
        let ciphertext = &after_room_iv[NONCE_SIZE..];

        let peer_key = *self
            .peer_keys
            .read()
            .unwrap()
            .get(&peer)
            .ok_or_else(|| CryptoError::NoSharedKey(peer.to_string()))?;
        let peer_cipher = cipher_from_key(&peer_key);
        let mut plaintext = peer_cipher
            .decrypt(Nonce::from_slice(peer_iv), ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed)?;

        if let Some(room_iv) = room_iv {
            let room_key = self
                .room_key
                .read()
                .unwrap()
                .ok_or(CryptoError::RoomKeyMissing)?;
            let room_cipher = cipher_from_key(&room_key);
            plaintext = room_cipher
                .decrypt(Nonce::from_slice(room_iv), plaintext.as_slice())
                .map_err(|_| CryptoError::DecryptionFailed)?;
        }

        Ok(plaintext)
    }
}

impl Default for CryptoManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn paired_managers() -> (CryptoManager, CryptoManager, PeerId, PeerId) {
        let a = CryptoManager::new();
        let b = CryptoManager::new();
        a.generate_local_keypair();
        b.generate_local_keypair();

        let pub_a = a.export_local_public_key().unwrap();
        let pub_b = b.export_local_public_key().unwrap();

        let id_a = PeerId::new();
        let id_b = PeerId::new();

        a.import_peer_public_key(id_b, &pub_b).unwrap();
        b.import_peer_public_key(id_a, &pub_a).unwrap();

        (a, b, id_a, id_b)
    }

    #[test]
    fn ecdh_agreement_is_symmetric() {
        // Invariant 1: both sides derive the same key without further round-trips.
        let (a, b, id_a, id_b) = paired_managers();
        let key_a = *a.peer_keys.read().unwrap().get(&id_b).unwrap();
        let key_b = *b.peer_keys.read().unwrap().get(&id_a).unwrap();
        assert_eq!(key_a, key_b);
    }

    #[test]
    fn chunk_round_trips_without_room_key() {
        let (a, b, _id_a, id_b) = paired_managers();
        let plaintext = b"hello clouddrop";
        let wire = a.encrypt_chunk(id_b, plaintext).unwrap();
        // decrypt_chunk is called by B about A, so key it by A's id on B's side.
        let id_a_on_b = *b.peer_keys.read().unwrap().keys().next().unwrap();
        let decrypted = b.decrypt_chunk(id_a_on_b, &wire).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn chunk_round_trips_with_room_key_on_both_sides() {
        let (a, b, _id_a, id_b) = paired_managers();
        let room = RoomCode::parse("ABC234").unwrap();
        a.set_room_password("correcthorse", &room).unwrap();
        b.set_room_password("correcthorse", &room).unwrap();

        let plaintext = vec![7u8; 1024];
        let wire = a.encrypt_chunk(id_b, &plaintext).unwrap();
        let id_a_on_b = *b.peer_keys.read().unwrap().keys().next().unwrap();
        let decrypted = b.decrypt_chunk(id_a_on_b, &wire).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn receiver_without_room_key_still_accepts_unlayered_chunk() {
        let (a, b, _id_a, id_b) = paired_managers();
        // Only A sets a room password; its receiver-side logic treats the
        // room layer as optional from the sender's perspective, so B (no
        // room key at all) must still be able to decrypt a chunk A sends
        // with roomIvLen == 0 (A itself has no room key here either).
        let plaintext = b"no room layer";
        let wire = a.encrypt_chunk(id_b, plaintext).unwrap();
        let id_a_on_b = *b.peer_keys.read().unwrap().keys().next().unwrap();
        assert_eq!(b.decrypt_chunk(id_a_on_b, &wire).unwrap(), plaintext);
    }

    #[test]
    fn room_key_missing_on_receiver_fails_explicitly() {
        let (a, b, _id_a, id_b) = paired_managers();
        let room = RoomCode::parse("ABC234").unwrap();
        a.set_room_password("correcthorse", &room).unwrap();
        // B never sets a room password.
        let wire = a.encrypt_chunk(id_b, b"secret").unwrap();
        let id_a_on_b = *b.peer_keys.read().unwrap().keys().next().unwrap();
        let err = b.decrypt_chunk(id_a_on_b, &wire).unwrap_err();
        assert!(matches!(err, CryptoError::RoomKeyMissing));
    }

    #[test]
    fn tampered_ciphertext_fails_auth_without_recovering_plaintext() {
        let (a, b, _id_a, id_b) = paired_managers();
        let mut wire = a.encrypt_chunk(id_b, b"authentic").unwrap();
        *wire.last_mut().unwrap() ^= 0xFF;
        let id_a_on_b = *b.peer_keys.read().unwrap().keys().next().unwrap();
        let err = b.decrypt_chunk(id_a_on_b, &wire).unwrap_err();
        assert!(matches!(err, CryptoError::DecryptionFailed));
    }

    #[test]
    fn password_hash_is_salted_with_room_code() {
        let room_a = RoomCode::parse("ABC234").unwrap();
        let room_b = RoomCode::parse("XYZ987").unwrap();
        let hash_a = hash_password_for_server("hunter2!", &room_a);
        let hash_b = hash_password_for_server("hunter2!", &room_b);
        assert_ne!(hash_a, hash_b);
        assert_eq!(hash_a.len(), 64); // hex-encoded SHA-256
    }

    #[test]
    fn set_room_password_rejects_short_passwords() {
        let crypto = CryptoManager::new();
        let room = RoomCode::parse("ABC234").unwrap();
        assert!(matches!(
            crypto.set_room_password("abcde", &room),
            Err(CryptoError::PasswordTooShort)
        ));
        assert!(crypto.set_room_password("abcdef", &room).is_ok());
    }

    #[test]
    fn no_shared_key_before_import() {
        let crypto = CryptoManager::new();
        crypto.generate_local_keypair();
        let stranger = PeerId::from_str("00000000-0000-0000-0000-000000000099").unwrap();
        let err = crypto.encrypt_chunk(stranger, b"x").unwrap_err();
        assert!(matches!(err, CryptoError::NoSharedKey(_)));
    }
}
