//! secp256k1 identity keys.
//!
//! Public keys travel between peers inside a protobuf envelope
//! `{ KeyType type = 1; bytes data = 2; }` where `data` is the 33-byte SEC1
//! compressed point. Signatures are DER-encoded ECDSA over `SHA-256(msg)`.

use crate::{CoreError, CoreResult};
use k256::ecdsa::signature::{DigestSigner, DigestVerifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use prost::Message;
use sha2::{Digest, Sha256};
use std::fmt;
use subtle::ConstantTimeEq;

/// Key algorithms of the public-key envelope, as assigned by the multicodec
/// registry. Only secp256k1 is produced; the others exist so foreign
/// envelopes decode far enough to be rejected by type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
enum KeyType {
    Rsa = 0,
    Ed25519 = 1,
    Secp256k1 = 2,
    Ecdsa = 3,
}

#[derive(Clone, PartialEq, Message)]
struct PublicKeyEnvelope {
    #[prost(enumeration = "KeyType", tag = "1")]
    r#type: i32,
    #[prost(bytes = "vec", tag = "2")]
    data: Vec<u8>,
}

/// A secp256k1 private key.
#[derive(Clone)]
pub struct SecretKey {
    inner: SigningKey,
}

impl SecretKey {
    /// Generate a fresh random key.
    pub fn generate() -> SecretKey {
        SecretKey {
            inner: SigningKey::random(&mut rand::rngs::OsRng),
        }
    }

    /// Decode from the 32-byte scalar encoding.
    pub fn from_bytes(bytes: &[u8]) -> CoreResult<SecretKey> {
        let inner = SigningKey::from_slice(bytes)
            .map_err(|_| CoreError::BadKeyEncoding("invalid secp256k1 scalar".into()))?;
        Ok(SecretKey { inner })
    }

    /// The 32-byte scalar encoding.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.inner.to_bytes().to_vec()
    }

    /// The public key paired with this key.
    pub fn public(&self) -> PublicKey {
        PublicKey {
            inner: *self.inner.verifying_key(),
        }
    }

    /// DER-encoded ECDSA signature over `SHA-256(msg)`.
    pub fn sign(&self, msg: &[u8]) -> Vec<u8> {
        let signature: Signature = self.inner.sign_digest(Sha256::new_with_prefix(msg));
        signature.to_der().as_bytes().to_vec()
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Key material stays out of logs.
        f.debug_struct("SecretKey").finish_non_exhaustive()
    }
}

/// A secp256k1 public key.
#[derive(Clone)]
pub struct PublicKey {
    inner: VerifyingKey,
}

impl PublicKey {
    /// Decode a SEC1 point encoding (compressed or uncompressed).
    pub fn from_bytes(bytes: &[u8]) -> CoreResult<PublicKey> {
        let inner = VerifyingKey::from_sec1_bytes(bytes)
            .map_err(|_| CoreError::BadKeyEncoding("invalid secp256k1 point".into()))?;
        Ok(PublicKey { inner })
    }

    /// The 33-byte SEC1 compressed encoding.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.inner.to_encoded_point(true).as_bytes().to_vec()
    }

    /// Serialize into the protobuf envelope.
    pub fn to_protobuf_encoding(&self) -> Vec<u8> {
        let envelope = PublicKeyEnvelope {
            r#type: KeyType::Secp256k1 as i32,
            data: self.to_bytes(),
        };
        envelope.encode_to_vec()
    }

    /// Deserialize from the protobuf envelope.
    pub fn from_protobuf_encoding(bytes: &[u8]) -> CoreResult<PublicKey> {
        let envelope = PublicKeyEnvelope::decode(bytes)
            .map_err(|e| CoreError::BadKeyEncoding(format!("malformed envelope: {e}")))?;
        if envelope.r#type != KeyType::Secp256k1 as i32 {
            return Err(CoreError::BadKeyEncoding(format!(
                "unsupported key type {}",
                envelope.r#type
            )));
        }
        PublicKey::from_bytes(&envelope.data)
    }

    /// Verify a DER-encoded ECDSA signature over `SHA-256(msg)`.
    pub fn verify(&self, msg: &[u8], signature: &[u8]) -> CoreResult<()> {
        let signature =
            Signature::from_der(signature).map_err(|_| CoreError::SignatureInvalid)?;
        self.inner
            .verify_digest(Sha256::new_with_prefix(msg), &signature)
            .map_err(|_| CoreError::SignatureInvalid)
    }
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes().ct_eq(&other.to_bytes()).into()
    }
}

impl Eq for PublicKey {}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PublicKey")
            .field(&hex::encode(self.to_bytes()))
            .finish()
    }
}

/// A secp256k1 key pair.
#[derive(Clone, Debug)]
pub struct Keypair {
    secret: SecretKey,
    public: PublicKey,
}

impl Keypair {
    /// Generate a fresh random key pair.
    pub fn generate() -> Keypair {
        SecretKey::generate().into()
    }

    pub fn secret(&self) -> &SecretKey {
        &self.secret
    }

    pub fn public(&self) -> &PublicKey {
        &self.public
    }
}

impl From<SecretKey> for Keypair {
    fn from(secret: SecretKey) -> Keypair {
        let public = secret.public();
        Keypair { secret, public }
    }
}
