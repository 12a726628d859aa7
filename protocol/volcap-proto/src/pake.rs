//! SPAKE2-EE password-authenticated key exchange over ristretto255.
//!
//! The capture server never stores the password, only `StoredData`
//! (salt plus the derived blinding scalar). The exchange is four messages:
//!
//! ```text
//! server  -> client : PublicData   (36 B)  version + salt
//! client  -> server : Response1    (32 B)  X = x*G + w*M
//! server  -> client : Response2    (64 B)  Y = y*G + w*N, server proof
//! client  -> server : Response3    (32 B)  client proof
//! ```
//!
//! A wrong password on either side makes the transcript MACs disagree, so
//! failure surfaces deterministically at the proof step. Both sides derive
//! `(client_sk, server_sk)` for the transport's symmetric encryption.
//!
//! Each side is an explicit state machine with one transition per inbound
//! message; out-of-order or repeated transitions are errors, not panics.

use curve25519_dalek::constants::RISTRETTO_BASEPOINT_TABLE;
use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};
use curve25519_dalek::scalar::Scalar;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256, Sha512};
use subtle::ConstantTimeEq;

pub const PUBLIC_DATA_BYTES: usize = 36;
pub const RESPONSE1_BYTES: usize = 32;
pub const RESPONSE2_BYTES: usize = 64;
pub const RESPONSE3_BYTES: usize = 32;
pub const SHARED_KEY_BYTES: usize = 32;
pub const STORED_DATA_BYTES: usize = 4 + SALT_BYTES + 32;

const SALT_BYTES: usize = 32;
const VERSION: u32 = 1;

pub const AUTH_CLIENT_STRING: &[u8] = b"client";
pub const AUTH_SERVER_STRING: &[u8] = b"server";

type HmacSha256 = Hmac<Sha256>;

pub type PakeResult<T> = std::result::Result<T, PakeError>;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum PakeError {
    #[error("stored data is malformed")]
    BadStoredData,
    #[error("public data version {0} unsupported")]
    BadVersion(u32),
    #[error("peer sent an invalid group element")]
    InvalidPoint,
    #[error("proof verification failed (password mismatch)")]
    ProofMismatch,
    #[error("handshake message out of order")]
    OutOfOrder,
}

/// Session keys shared by both sides after a successful exchange.
///
/// `client_sk` keys client-to-server traffic, `server_sk` the reverse.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKeys {
    pub client_sk: [u8; SHARED_KEY_BYTES],
    pub server_sk: [u8; SHARED_KEY_BYTES],
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material stays out of logs.
        write!(f, "SessionKeys {{ .. }}")
    }
}

fn blind_point_m() -> RistrettoPoint {
    RistrettoPoint::hash_from_bytes::<Sha512>(b"volcap-pake-M")
}

fn blind_point_n() -> RistrettoPoint {
    RistrettoPoint::hash_from_bytes::<Sha512>(b"volcap-pake-N")
}

fn password_scalar(salt: &[u8], password: &str) -> Scalar {
    let mut h = Sha512::new();
    h.update(b"volcap-pake-w");
    h.update(salt);
    h.update(password.as_bytes());
    Scalar::from_hash(h)
}

fn random_scalar() -> Scalar {
    let wide: [u8; 64] = std::array::from_fn(|_| rand::random::<u8>());
    Scalar::from_bytes_mod_order_wide(&wide)
}

/// Derive the server-side stored verifier for a password.
pub fn server_store(password: &str) -> [u8; STORED_DATA_BYTES] {
    let salt: [u8; SALT_BYTES] = std::array::from_fn(|_| rand::random::<u8>());
    let w = password_scalar(&salt, password);
    let mut stored = [0u8; STORED_DATA_BYTES];
    stored[..4].copy_from_slice(&VERSION.to_le_bytes());
    stored[4..4 + SALT_BYTES].copy_from_slice(&salt);
    stored[4 + SALT_BYTES..].copy_from_slice(w.as_bytes());
    stored
}

pub fn stored_to_base64(stored: &[u8; STORED_DATA_BYTES]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(stored)
}

pub fn stored_from_base64(encoded: &str) -> PakeResult<[u8; STORED_DATA_BYTES]> {
    use base64::Engine;
    let raw = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|_| PakeError::BadStoredData)?;
    let raw: [u8; STORED_DATA_BYTES] = raw.try_into().map_err(|_| PakeError::BadStoredData)?;
    Ok(raw)
}

struct Transcript {
    digest: [u8; 32],
}

impl Transcript {
    fn new(salt: &[u8], x_msg: &[u8; 32], y_point: &CompressedRistretto, k: &RistrettoPoint) -> Self {
        let mut h = Sha256::new();
        for part in [
            AUTH_CLIENT_STRING,
            AUTH_SERVER_STRING,
            salt,
            x_msg.as_slice(),
            y_point.as_bytes().as_slice(),
            k.compress().as_bytes().as_slice(),
        ] {
            h.update((part.len() as u64).to_le_bytes());
            h.update(part);
        }
        Self {
            digest: h.finalize().into(),
        }
    }

    fn derive(&self, k: &RistrettoPoint) -> DerivedKeys {
        let hk = Hkdf::<Sha256>::new(Some(&self.digest), k.compress().as_bytes());
        let mut expand = |label: &[u8]| -> [u8; 32] {
            let mut out = [0u8; 32];
            hk.expand(label, &mut out).expect("hkdf expand length");
            out
        };
        DerivedKeys {
            client_sk: expand(b"volcap client sk"),
            server_sk: expand(b"volcap server sk"),
            client_mac: expand(b"volcap client mac"),
            server_mac: expand(b"volcap server mac"),
        }
    }
}

struct DerivedKeys {
    client_sk: [u8; 32],
    server_sk: [u8; 32],
    client_mac: [u8; 32],
    server_mac: [u8; 32],
}

impl DerivedKeys {
    fn mac(&self, key: &[u8; 32], transcript: &Transcript) -> [u8; 32] {
        let mut mac = HmacSha256::new_from_slice(key).expect("hmac key length");
        mac.update(&transcript.digest);
        mac.finalize().into_bytes().into()
    }

    fn session_keys(&self) -> SessionKeys {
        SessionKeys {
            client_sk: self.client_sk,
            server_sk: self.server_sk,
        }
    }
}

enum ServerState {
    Fresh,
    HelloSent { y: Scalar },
    ProofSent { keys: DerivedKeys, transcript: Transcript },
    Done,
}

/// Server side of the exchange. One instance per viewer connection.
pub struct PakeServer {
    salt: [u8; SALT_BYTES],
    w: Scalar,
    state: ServerState,
}

impl PakeServer {
    pub fn new(stored: &[u8; STORED_DATA_BYTES]) -> PakeResult<Self> {
        let version = u32::from_le_bytes(stored[..4].try_into().expect("slice length"));
        if version != VERSION {
            return Err(PakeError::BadVersion(version));
        }
        let mut salt = [0u8; SALT_BYTES];
        salt.copy_from_slice(&stored[4..4 + SALT_BYTES]);
        let w_bytes: [u8; 32] = stored[4 + SALT_BYTES..].try_into().expect("slice length");
        let w = Option::<Scalar>::from(Scalar::from_canonical_bytes(w_bytes))
            .ok_or(PakeError::BadStoredData)?;
        Ok(Self {
            salt,
            w,
            state: ServerState::Fresh,
        })
    }

    /// Step 0: emit PublicData for the hello message.
    pub fn step0(&mut self) -> PakeResult<[u8; PUBLIC_DATA_BYTES]> {
        if !matches!(self.state, ServerState::Fresh) {
            return Err(PakeError::OutOfOrder);
        }
        let mut public_data = [0u8; PUBLIC_DATA_BYTES];
        public_data[..4].copy_from_slice(&VERSION.to_le_bytes());
        public_data[4..].copy_from_slice(&self.salt);
        let y = random_scalar();
        self.state = ServerState::HelloSent { y };
        Ok(public_data)
    }

    /// Step 2: consume the client reply, emit Response2 (Y + server proof)
    /// plus the derived session keys.
    ///
    /// The keys are handed out here because the client starts encrypting
    /// as soon as it verifies the server proof; the server stages them in
    /// wait-for-peer mode and only trusts the peer after step 4 verifies.
    pub fn step2(
        &mut self,
        response1: &[u8; RESPONSE1_BYTES],
    ) -> PakeResult<([u8; RESPONSE2_BYTES], SessionKeys)> {
        let y = match &self.state {
            ServerState::HelloSent { y } => *y,
            _ => return Err(PakeError::OutOfOrder),
        };
        let x_point = CompressedRistretto::from_slice(response1)
            .map_err(|_| PakeError::InvalidPoint)?
            .decompress()
            .ok_or(PakeError::InvalidPoint)?;

        let y_point = (&y * RISTRETTO_BASEPOINT_TABLE + self.w * blind_point_n()).compress();
        let k = (x_point - self.w * blind_point_m()) * y;

        let transcript = Transcript::new(&self.salt, response1, &y_point, &k);
        let keys = transcript.derive(&k);
        let proof = keys.mac(&keys.server_mac, &transcript);

        let mut response2 = [0u8; RESPONSE2_BYTES];
        response2[..32].copy_from_slice(y_point.as_bytes());
        response2[32..].copy_from_slice(&proof);

        let session = keys.session_keys();
        self.state = ServerState::ProofSent { keys, transcript };
        Ok((response2, session))
    }

    /// Step 4: verify the client proof. Success yields the session keys.
    pub fn step4(&mut self, response3: &[u8; RESPONSE3_BYTES]) -> PakeResult<SessionKeys> {
        let (keys, transcript) = match &self.state {
            ServerState::ProofSent { keys, transcript } => (keys, transcript),
            _ => return Err(PakeError::OutOfOrder),
        };
        let expected = keys.mac(&keys.client_mac, transcript);
        if expected[..].ct_eq(&response3[..]).unwrap_u8() != 1 {
            return Err(PakeError::ProofMismatch);
        }
        let session = keys.session_keys();
        self.state = ServerState::Done;
        Ok(session)
    }
}

enum ClientState {
    Fresh,
    ReplySent {
        x: Scalar,
        w: Scalar,
        salt: [u8; SALT_BYTES],
        response1: [u8; RESPONSE1_BYTES],
    },
    Done,
}

/// Client side of the exchange.
pub struct PakeClient {
    password: String,
    state: ClientState,
}

impl PakeClient {
    pub fn new(password: &str) -> Self {
        Self {
            password: password.to_string(),
            state: ClientState::Fresh,
        }
    }

    /// Step 1: consume PublicData, emit Response1.
    pub fn step1(&mut self, public_data: &[u8; PUBLIC_DATA_BYTES]) -> PakeResult<[u8; RESPONSE1_BYTES]> {
        if !matches!(self.state, ClientState::Fresh) {
            return Err(PakeError::OutOfOrder);
        }
        let version = u32::from_le_bytes(public_data[..4].try_into().expect("slice length"));
        if version != VERSION {
            return Err(PakeError::BadVersion(version));
        }
        let mut salt = [0u8; SALT_BYTES];
        salt.copy_from_slice(&public_data[4..]);

        let w = password_scalar(&salt, &self.password);
        let x = random_scalar();
        let x_point = (&x * RISTRETTO_BASEPOINT_TABLE + w * blind_point_m()).compress();

        let response1: [u8; RESPONSE1_BYTES] = *x_point.as_bytes();
        self.state = ClientState::ReplySent {
            x,
            w,
            salt,
            response1,
        };
        Ok(response1)
    }

    /// Step 3: verify the server proof, derive keys, emit Response3.
    ///
    /// `ProofMismatch` here is the "incorrect password" signal.
    pub fn step3(
        &mut self,
        response2: &[u8; RESPONSE2_BYTES],
    ) -> PakeResult<([u8; RESPONSE3_BYTES], SessionKeys)> {
        let (x, w, salt, response1) = match &self.state {
            ClientState::ReplySent {
                x,
                w,
                salt,
                response1,
            } => (*x, *w, *salt, *response1),
            _ => return Err(PakeError::OutOfOrder),
        };
        let y_bytes: [u8; 32] = response2[..32].try_into().expect("slice length");
        let server_proof: [u8; 32] = response2[32..].try_into().expect("slice length");

        let y_compressed =
            CompressedRistretto::from_slice(&y_bytes).map_err(|_| PakeError::InvalidPoint)?;
        let y_point = y_compressed.decompress().ok_or(PakeError::InvalidPoint)?;

        let k = (y_point - w * blind_point_n()) * x;
        let transcript = Transcript::new(&salt, &response1, &y_compressed, &k);
        let keys = transcript.derive(&k);

        let expected = keys.mac(&keys.server_mac, &transcript);
        if expected[..].ct_eq(&server_proof[..]).unwrap_u8() != 1 {
            return Err(PakeError::ProofMismatch);
        }

        let response3 = keys.mac(&keys.client_mac, &transcript);
        let session = keys.session_keys();
        self.state = ClientState::Done;
        Ok((response3, session))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_handshake(
        server_password: &str,
        client_password: &str,
    ) -> (PakeResult<SessionKeys>, PakeResult<SessionKeys>) {
        let stored = server_store(server_password);
        let mut server = PakeServer::new(&stored).unwrap();
        let mut client = PakeClient::new(client_password);

        let hello = server.step0().unwrap();
        let response1 = client.step1(&hello).unwrap();
        let (response2, early_keys) = server.step2(&response1).unwrap();
        match client.step3(&response2) {
            Ok((response3, client_keys)) => {
                let server_keys = server.step4(&response3);
                if let Ok(server_keys) = &server_keys {
                    // Step 2 already handed out the same keys.
                    assert_eq!(server_keys.client_sk, early_keys.client_sk);
                }
                (server_keys, Ok(client_keys))
            }
            Err(e) => (Err(PakeError::ProofMismatch), Err(e)),
        }
    }

    #[test]
    fn matching_passwords_agree_on_keys() {
        let (server_keys, client_keys) = run_handshake("hunter2", "hunter2");
        let server_keys = server_keys.unwrap();
        let client_keys = client_keys.unwrap();
        assert_eq!(server_keys.client_sk, client_keys.client_sk);
        assert_eq!(server_keys.server_sk, client_keys.server_sk);
        assert_ne!(server_keys.client_sk, server_keys.server_sk);
    }

    #[test]
    fn empty_password_is_allowed() {
        let (server_keys, client_keys) = run_handshake("", "");
        assert_eq!(server_keys.unwrap().client_sk, client_keys.unwrap().client_sk);
    }

    #[test]
    fn wrong_password_fails_at_client_proof() {
        let (_, client_keys) = run_handshake("xyz", "abc");
        assert_eq!(client_keys.unwrap_err(), PakeError::ProofMismatch);
    }

    #[test]
    fn forged_client_proof_fails_at_server() {
        let stored = server_store("pw");
        let mut server = PakeServer::new(&stored).unwrap();
        let mut client = PakeClient::new("pw");
        let hello = server.step0().unwrap();
        let response1 = client.step1(&hello).unwrap();
        let _ = server.step2(&response1).unwrap();
        let forged = [0u8; RESPONSE3_BYTES];
        assert_eq!(server.step4(&forged).unwrap_err(), PakeError::ProofMismatch);
    }

    #[test]
    fn out_of_order_transitions_are_rejected() {
        let stored = server_store("pw");
        let mut server = PakeServer::new(&stored).unwrap();
        assert_eq!(
            server.step2(&[0u8; RESPONSE1_BYTES]).unwrap_err(),
            PakeError::OutOfOrder
        );
        let _ = server.step0().unwrap();
        assert_eq!(server.step0().unwrap_err(), PakeError::OutOfOrder);
    }

    #[test]
    fn stored_data_base64_round_trips() {
        let stored = server_store("secret");
        let encoded = stored_to_base64(&stored);
        assert_eq!(stored_from_base64(&encoded).unwrap(), stored);
        assert!(stored_from_base64("not base64!").is_err());
    }

    #[test]
    fn sessions_are_unique_per_handshake() {
        let (a, _) = run_handshake("pw", "pw");
        let (b, _) = run_handshake("pw", "pw");
        assert_ne!(a.unwrap().client_sk, b.unwrap().client_sk);
    }
}
