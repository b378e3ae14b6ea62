//! RSA column master keys.
//!
//! Column encryption keys are wrapped with RSA-OAEP (SHA-1) and envelopes are
//! signed with RSA PKCS#1 v1.5 over a SHA-256 digest.

use rsa::pkcs1::EncodeRsaPublicKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha1::{Digest, Sha1};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::CryptoError;

/// An RSA key pair acting as a column master key.
#[derive(Clone)]
pub struct RsaMasterKey {
    private: RsaPrivateKey,
}

impl std::fmt::Debug for RsaMasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RsaMasterKey")
            .field("bits", &(self.key_size() * 8))
            .finish_non_exhaustive()
    }
}

impl RsaMasterKey {
    /// Generate a fresh key pair with the given modulus size in bits.
    pub fn generate(bits: usize) -> Result<Self, CryptoError> {
        let private = RsaPrivateKey::new(&mut rand::thread_rng(), bits)
            .map_err(|e| CryptoError::InvalidRsaKey(e.to_string()))?;
        Ok(Self { private })
    }

    /// Import a PKCS#8 PEM private key.
    pub fn from_pkcs8_pem(pem: &str) -> Result<Self, CryptoError> {
        let private = RsaPrivateKey::from_pkcs8_pem(pem)
            .map_err(|e| CryptoError::InvalidRsaKey(e.to_string()))?;
        Ok(Self { private })
    }

    /// Import a PKCS#8 DER private key.
    pub fn from_pkcs8_der(der: &[u8]) -> Result<Self, CryptoError> {
        let private = RsaPrivateKey::from_pkcs8_der(der)
            .map_err(|e| CryptoError::InvalidRsaKey(e.to_string()))?;
        Ok(Self { private })
    }

    /// Modulus size in bytes. Wrapped keys and signatures are exactly this long.
    pub fn key_size(&self) -> usize {
        self.private.size()
    }

    pub fn public_key(&self) -> RsaPublicKey {
        self.private.to_public_key()
    }

    /// Uppercase hex SHA-1 of the PKCS#1 DER public key. Used as a stable
    /// identifier when importing keys into a certificate store.
    pub fn thumbprint(&self) -> Result<String, CryptoError> {
        let der = self
            .public_key()
            .to_pkcs1_der()
            .map_err(|e| CryptoError::InvalidRsaKey(e.to_string()))?;
        let digest = Sha1::digest(der.as_bytes());
        Ok(digest.iter().map(|b| format!("{:02X}", b)).collect())
    }

    /// RSA-OAEP (SHA-1) encrypt a column encryption key.
    pub fn wrap_key(&self, column_key: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.public_key()
            .encrypt(&mut rand::thread_rng(), Oaep::new::<Sha1>(), column_key)
            .map_err(|e| CryptoError::WrapFailed(e.to_string()))
    }

    /// RSA-OAEP (SHA-1) decrypt a wrapped column encryption key.
    pub fn unwrap_key(&self, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        self.private
            .decrypt(Oaep::new::<Sha1>(), ciphertext)
            .map(Zeroizing::new)
            .map_err(|e| CryptoError::UnwrapFailed(e.to_string()))
    }

    /// PKCS#1 v1.5 signature over a SHA-256 digest.
    pub fn sign_digest(&self, digest: &[u8; 32]) -> Result<Vec<u8>, CryptoError> {
        self.private
            .sign(Pkcs1v15Sign::new::<Sha256>(), digest)
            .map_err(|e| CryptoError::SigningFailed(e.to_string()))
    }

    /// Verify a PKCS#1 v1.5 signature over a SHA-256 digest.
    pub fn verify_digest(&self, digest: &[u8; 32], signature: &[u8]) -> bool {
        self.public_key()
            .verify(Pkcs1v15Sign::new::<Sha256>(), digest, signature)
            .is_ok()
    }
}

/// SHA-256 of `data` as a fixed array.
pub(crate) fn sha256(data: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(data));
    out
}
