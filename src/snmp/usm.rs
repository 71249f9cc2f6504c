//! User-based Security Model (RFC 3414, RFC 3826): key localization,
//! HMAC-96 authentication and AES-128-CFB privacy.

use cfb_mode::cipher::{AsyncStreamCipher, KeyIvInit};
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use serde::Deserialize;
use sha1::Sha1;
use thiserror::Error;

/// Length of the truncated HMAC carried in `msgAuthenticationParameters`.
pub const AUTH_PARAMS_LEN: usize = 12;
/// Length of the salt carried in `msgPrivacyParameters`.
pub const PRIV_PARAMS_LEN: usize = 8;

const PASSWORD_EXPANSION: usize = 1_048_576;
const AES_KEY_LEN: usize = 16;

type Aes128CfbEnc = cfb_mode::Encryptor<aes::Aes128>;
type Aes128CfbDec = cfb_mode::Decryptor<aes::Aes128>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UsmError {
    #[error("passphrase must be at least 8 characters")]
    ShortPassphrase,
    #[error("invalid key length")]
    KeyLength,
    #[error("wrong message digest")]
    WrongDigest,
    #[error("malformed privacy parameters")]
    BadPrivParams,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthProtocol {
    Md5,
    Sha,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrivProtocol {
    Aes,
}

impl AuthProtocol {
    /// Turns a passphrase into a master key (RFC 3414 A.2).
    pub fn password_to_key(self, passphrase: &[u8]) -> Result<Vec<u8>, UsmError> {
        if passphrase.len() < 8 {
            return Err(UsmError::ShortPassphrase);
        }
        Ok(match self {
            AuthProtocol::Md5 => expand::<Md5>(passphrase),
            AuthProtocol::Sha => expand::<Sha1>(passphrase),
        })
    }

    /// Binds a master key to one authoritative engine.
    pub fn localize(self, key: &[u8], engine_id: &[u8]) -> Vec<u8> {
        match self {
            AuthProtocol::Md5 => digest::<Md5>(&[key, engine_id, key]),
            AuthProtocol::Sha => digest::<Sha1>(&[key, engine_id, key]),
        }
    }

    fn mac(self, key: &[u8], message: &[u8]) -> Result<Vec<u8>, UsmError> {
        Ok(match self {
            AuthProtocol::Md5 => {
                let mut mac =
                    <Hmac<Md5> as Mac>::new_from_slice(key).map_err(|_| UsmError::KeyLength)?;
                mac.update(message);
                mac.finalize().into_bytes().to_vec()
            }
            AuthProtocol::Sha => {
                let mut mac =
                    <Hmac<Sha1> as Mac>::new_from_slice(key).map_err(|_| UsmError::KeyLength)?;
                mac.update(message);
                mac.finalize().into_bytes().to_vec()
            }
        })
    }
}

fn expand<D: Digest>(passphrase: &[u8]) -> Vec<u8> {
    let mut hasher = D::new();
    let mut chunk = [0u8; 64];
    let mut index = 0;
    for _ in 0..PASSWORD_EXPANSION / chunk.len() {
        for byte in chunk.iter_mut() {
            *byte = passphrase[index % passphrase.len()];
            index += 1;
        }
        hasher.update(chunk);
    }
    hasher.finalize().to_vec()
}

fn digest<D: Digest>(parts: &[&[u8]]) -> Vec<u8> {
    let mut hasher = D::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().to_vec()
}

/// Passphrase-derived master keys. Deriving these is the expensive step, so
/// it happens once per process rather than once per device.
#[derive(Clone)]
pub struct MasterKeys {
    auth: AuthProtocol,
    auth_key: Vec<u8>,
    priv_key: Vec<u8>,
}

impl MasterKeys {
    pub fn derive(
        auth: AuthProtocol,
        auth_passphrase: &str,
        priv_passphrase: &str,
    ) -> Result<Self, UsmError> {
        Ok(Self {
            auth,
            auth_key: auth.password_to_key(auth_passphrase.as_bytes())?,
            priv_key: auth.password_to_key(priv_passphrase.as_bytes())?,
        })
    }

    pub fn localize(&self, engine_id: &[u8]) -> Result<LocalKeys, UsmError> {
        let priv_key = self.auth.localize(&self.priv_key, engine_id);
        if priv_key.len() < AES_KEY_LEN {
            return Err(UsmError::KeyLength);
        }
        Ok(LocalKeys {
            auth: self.auth,
            auth_key: self.auth.localize(&self.auth_key, engine_id),
            priv_key,
        })
    }
}

impl std::fmt::Debug for MasterKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKeys")
            .field("auth", &self.auth)
            .finish_non_exhaustive()
    }
}

/// Keys localized to one engine.
#[derive(Clone)]
pub struct LocalKeys {
    auth: AuthProtocol,
    auth_key: Vec<u8>,
    priv_key: Vec<u8>,
}

impl LocalKeys {
    /// HMAC-96 over a whole message whose authentication parameters are
    /// still zeroed.
    pub fn sign(&self, message: &[u8]) -> Result<[u8; AUTH_PARAMS_LEN], UsmError> {
        let full = self.auth.mac(&self.auth_key, message)?;
        let mut out = [0u8; AUTH_PARAMS_LEN];
        out.copy_from_slice(&full[..AUTH_PARAMS_LEN]);
        Ok(out)
    }

    pub fn verify(&self, message: &[u8], received: &[u8]) -> Result<(), UsmError> {
        let expected = self.sign(message)?;
        if received.len() != AUTH_PARAMS_LEN {
            return Err(UsmError::WrongDigest);
        }
        let diff = expected
            .iter()
            .zip(received)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b));
        if diff != 0 {
            return Err(UsmError::WrongDigest);
        }
        Ok(())
    }

    /// Encrypts `data` in place and returns the privacy parameters.
    pub fn encrypt(
        &self,
        boots: u32,
        time: u32,
        salt: u64,
        data: &mut [u8],
    ) -> Result<[u8; PRIV_PARAMS_LEN], UsmError> {
        let salt = salt.to_be_bytes();
        let iv = aes_iv(boots, time, &salt);
        Aes128CfbEnc::new_from_slices(&self.priv_key[..AES_KEY_LEN], &iv)
            .map_err(|_| UsmError::KeyLength)?
            .encrypt(data);
        Ok(salt)
    }

    pub fn decrypt(
        &self,
        boots: u32,
        time: u32,
        priv_params: &[u8],
        data: &mut [u8],
    ) -> Result<(), UsmError> {
        if priv_params.len() != PRIV_PARAMS_LEN {
            return Err(UsmError::BadPrivParams);
        }
        let iv = aes_iv(boots, time, priv_params);
        Aes128CfbDec::new_from_slices(&self.priv_key[..AES_KEY_LEN], &iv)
            .map_err(|_| UsmError::KeyLength)?
            .decrypt(data);
        Ok(())
    }
}

fn aes_iv(boots: u32, time: u32, salt: &[u8]) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[..4].copy_from_slice(&boots.to_be_bytes());
    iv[4..8].copy_from_slice(&time.to_be_bytes());
    iv[8..].copy_from_slice(salt);
    iv
}
