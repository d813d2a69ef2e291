//! Key bundles: an encryption key paired with an HMAC key.

use crate::error::{CryptoError, CryptoResult};
use aes_gcm::{
    aead::{generic_array::GenericArray, Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

type HmacSha256 = Hmac<Sha256>;

/// Size of each key in bytes.
pub const KEY_SIZE: usize = 32;
/// Size of the AES-GCM initialization vector in bytes.
pub const IV_SIZE: usize = 12;
/// Size of the GCM authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

/// HKDF info prefix for root-derived bundles; the username is appended.
const HMAC_INPUT: &str = "Sync-AES_256_CBC-HMAC256";

/// An encryption key and an HMAC key used together.
///
/// Two bundles are equal only if both keys match. Key material is
/// zeroized when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyBundle {
    encryption_key: [u8; KEY_SIZE],
    hmac_key: [u8; KEY_SIZE],
}

impl KeyBundle {
    /// Generates a bundle of two independent random keys.
    #[must_use]
    pub fn generate_random() -> Self {
        let mut rng = rand::thread_rng();
        let mut encryption_key = [0u8; KEY_SIZE];
        let mut hmac_key = [0u8; KEY_SIZE];
        rng.fill_bytes(&mut encryption_key);
        rng.fill_bytes(&mut hmac_key);
        Self {
            encryption_key,
            hmac_key,
        }
    }

    /// Creates a bundle from raw key bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if either key is not exactly 32 bytes.
    pub fn from_keys(encryption_key: &[u8], hmac_key: &[u8]) -> CryptoResult<Self> {
        Ok(Self {
            encryption_key: to_key(encryption_key)?,
            hmac_key: to_key(hmac_key)?,
        })
    }

    /// Creates a bundle from its wire form: `[base64 enc key, base64 hmac key]`.
    pub fn from_key_pair(pair: &[String; 2]) -> CryptoResult<Self> {
        let mut encryption_key = STANDARD.decode(&pair[0])?;
        let mut hmac_key = STANDARD.decode(&pair[1])?;
        let bundle = Self::from_keys(&encryption_key, &hmac_key);
        encryption_key.zeroize();
        hmac_key.zeroize();
        bundle
    }

    /// Returns the wire form of the bundle.
    ///
    /// # Security
    ///
    /// The result contains raw key material; never log it.
    pub fn key_pair(&self) -> [String; 2] {
        [
            STANDARD.encode(self.encryption_key),
            STANDARD.encode(self.hmac_key),
        ]
    }

    /// Derives a bundle from a high-entropy root secret.
    ///
    /// HKDF-SHA256 expands the secret into 64 bytes using
    /// `"Sync-AES_256_CBC-HMAC256" + username` as info. The first half
    /// becomes the encryption key, the second half the HMAC key.
    pub fn derive_from_root(root_secret: &[u8], username: &str) -> CryptoResult<Self> {
        use hkdf::Hkdf;

        let hk = Hkdf::<Sha256>::new(None, root_secret);
        let info = format!("{HMAC_INPUT}{username}");

        let mut okm = [0u8; KEY_SIZE * 2];
        hk.expand(info.as_bytes(), &mut okm)
            .map_err(|_| CryptoError::KeyDerivationFailed)?;

        let bundle = Self::from_keys(&okm[..KEY_SIZE], &okm[KEY_SIZE..]);
        okm.zeroize();
        bundle
    }

    /// Returns the encryption key.
    #[must_use]
    pub fn encryption_key(&self) -> &[u8; KEY_SIZE] {
        &self.encryption_key
    }

    /// Returns the HMAC key.
    #[must_use]
    pub fn hmac_key(&self) -> &[u8; KEY_SIZE] {
        &self.hmac_key
    }

    /// Encrypts under a fresh random IV. Returns `(iv, ciphertext)`; the
    /// ciphertext carries the GCM tag.
    pub fn encrypt(&self, plaintext: &[u8]) -> CryptoResult<([u8; IV_SIZE], Vec<u8>)> {
        let mut iv = [0u8; IV_SIZE];
        rand::thread_rng().fill_bytes(&mut iv);

        let ciphertext = self
            .cipher()
            .encrypt(Nonce::from_slice(&iv), plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)?;

        Ok((iv, ciphertext))
    }

    /// Decrypts a ciphertext produced by [`encrypt`](Self::encrypt).
    pub fn decrypt(&self, iv: &[u8], ciphertext: &[u8]) -> CryptoResult<Vec<u8>> {
        if iv.len() != IV_SIZE {
            return Err(CryptoError::DecryptionFailed(format!(
                "IV is {} bytes, expected {IV_SIZE}",
                iv.len()
            )));
        }
        if ciphertext.len() < TAG_SIZE {
            return Err(CryptoError::DecryptionFailed("ciphertext too short".into()));
        }

        self.cipher()
            .decrypt(Nonce::from_slice(iv), ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed("decryption error".into()))
    }

    /// Computes the hex HMAC-SHA256 of `data`.
    pub fn hmac_hex(&self, data: &[u8]) -> CryptoResult<String> {
        let mut mac = self.mac()?;
        mac.update(data);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Verifies a hex HMAC-SHA256 in constant time.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::HmacMismatch`] if the HMAC does not verify or
    /// is not valid hex.
    pub fn verify_hmac(&self, data: &[u8], expected_hex: &str) -> CryptoResult<()> {
        let mut mac = self.mac()?;
        mac.update(data);

        let verified = match hex::decode(expected_hex) {
            Ok(expected) => mac.clone().verify_slice(&expected).is_ok(),
            Err(_) => false,
        };

        if verified {
            Ok(())
        } else {
            Err(CryptoError::HmacMismatch {
                expected: expected_hex.to_string(),
                computed: hex::encode(mac.finalize().into_bytes()),
            })
        }
    }

    fn cipher(&self) -> Aes256Gcm {
        // Infallible: the key is always KEY_SIZE (32) bytes.
        Aes256Gcm::new(GenericArray::from_slice(&self.encryption_key))
    }

    fn mac(&self) -> CryptoResult<HmacSha256> {
        <HmacSha256 as Mac>::new_from_slice(&self.hmac_key).map_err(|_| {
            CryptoError::InvalidKeySize {
                actual: self.hmac_key.len(),
                expected: KEY_SIZE,
            }
        })
    }
}

fn to_key(bytes: &[u8]) -> CryptoResult<[u8; KEY_SIZE]> {
    bytes.try_into().map_err(|_| CryptoError::InvalidKeySize {
        actual: bytes.len(),
        expected: KEY_SIZE,
    })
}

impl PartialEq for KeyBundle {
    fn eq(&self, other: &Self) -> bool {
        self.encryption_key == other.encryption_key && self.hmac_key == other.hmac_key
    }
}

impl Eq for KeyBundle {}

impl std::fmt::Debug for KeyBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyBundle")
            .field("encryption_key", &"[REDACTED]")
            .field("hmac_key", &"[REDACTED]")
            .finish()
    }
}
