use crate::signal::SignalError;
use aes_gcm::Aes256Gcm;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;

pub(crate) const MESSAGE_KEY_SEED: u8 = 0x01;
pub(crate) const CHAIN_KEY_SEED: u8 = 0x02;

pub(crate) fn hmac_sha256(key: &[u8; 32], input: &[u8]) -> Result<[u8; 32], SignalError> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key)
        .map_err(|e| SignalError::InvalidKey(e.to_string()))?;
    mac.update(input);
    Ok(mac.finalize().into_bytes().into())
}

pub(crate) fn hkdf_sha256<const N: usize>(
    ikm: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
) -> Result<[u8; N], SignalError> {
    let mut okm = [0u8; N];
    Hkdf::<Sha256>::new(salt, ikm)
        .expand(info, &mut okm)
        .map_err(|e| SignalError::InvalidKey(e.to_string()))?;
    Ok(okm)
}

pub(crate) fn aes_gcm_encrypt(
    key: &[u8; 32],
    iv: &[u8; 12],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, SignalError> {
    Aes256Gcm::new(key.into())
        .encrypt(
            iv.into(),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| SignalError::InvalidMessage(format!("encrypt failed: {e}")))
}

pub(crate) fn aes_gcm_decrypt(
    key: &[u8; 32],
    iv: &[u8; 12],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, SignalError> {
    Aes256Gcm::new(key.into())
        .decrypt(
            iv.into(),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| SignalError::BadMac)
}
