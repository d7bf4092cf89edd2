use crate::signal::SignalError;
use curve25519_dalek::constants::ED25519_BASEPOINT_TABLE;
use curve25519_dalek::edwards::EdwardsPoint;
use curve25519_dalek::montgomery::MontgomeryPoint;
use curve25519_dalek::scalar::{self, Scalar};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use std::fmt;
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey, StaticSecret};

pub const DJB_TYPE: u8 = 5;
pub const SIGNATURE_LENGTH: usize = 64;

// 0xFE followed by 31 bytes of 0xFF.
static XEDDSA_HASH_PREFIX: [u8; 32] = {
    let mut prefix = [0xFF; 32];
    prefix[0] = 0xFE;
    prefix
};

/// A Curve25519 key pair usable for both agreement and XEdDSA signing.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPair {
    #[serde(rename = "public", with = "crate::buffer_json")]
    pub public_key: [u8; 32],
    #[serde(rename = "private", with = "crate::buffer_json")]
    pub private_key: [u8; 32],
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &hex::encode(self.public_key))
            .finish_non_exhaustive()
    }
}

impl KeyPair {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut bytes);
        Self::from_private_key(bytes)
    }

    pub fn from_private_key(private_key: [u8; 32]) -> Self {
        let private_key = scalar::clamp_integer(private_key);
        let secret = StaticSecret::from(private_key);
        Self {
            public_key: PublicKey::from(&secret).to_bytes(),
            private_key,
        }
    }

    /// Packs the pair as `public || private`.
    pub fn to_bytes(&self) -> [u8; 64] {
        let mut out = [0u8; 64];
        out[..32].copy_from_slice(&self.public_key);
        out[32..].copy_from_slice(&self.private_key);
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, SignalError> {
        if data.len() != 64 {
            return Err(SignalError::InvalidKey(format!(
                "packed key pair must be 64 bytes, got {}",
                data.len()
            )));
        }
        let mut private_key = [0u8; 32];
        private_key.copy_from_slice(&data[32..]);
        let pair = Self::from_private_key(private_key);
        if pair.public_key[..] != data[..32] {
            return Err(SignalError::InvalidKey(
                "public half does not match private half".into(),
            ));
        }
        Ok(pair)
    }

    pub fn calculate_agreement(&self, their_public_key: &[u8; 32]) -> [u8; 32] {
        *StaticSecret::from(self.private_key)
            .diffie_hellman(&PublicKey::from(*their_public_key))
            .as_bytes()
    }

    /// XEdDSA signature over the concatenation of `message` pieces.
    ///
    /// The sign bit of the Edwards public key travels in the top bit of the
    /// last signature byte.
    pub fn sign(&self, message: &[&[u8]]) -> [u8; SIGNATURE_LENGTH] {
        let key_scalar = Scalar::from_bytes_mod_order(self.private_key);
        let ed_public_key = (&key_scalar * ED25519_BASEPOINT_TABLE).compress();
        let sign_bit = ed_public_key.as_bytes()[31] & 0b1000_0000_u8;

        let mut random_bytes = [0u8; 64];
        rand::rng().fill_bytes(&mut random_bytes);

        let mut hash1 = Sha512::new();
        hash1.update(&XEDDSA_HASH_PREFIX[..]);
        hash1.update(&self.private_key[..]);
        for message_piece in message {
            hash1.update(message_piece);
        }
        hash1.update(&random_bytes[..]);

        let r = Scalar::from_hash(hash1);
        let cap_r = (&r * ED25519_BASEPOINT_TABLE).compress();

        let mut hash = Sha512::new();
        hash.update(cap_r.as_bytes());
        hash.update(ed_public_key.as_bytes());
        for message_piece in message {
            hash.update(message_piece);
        }

        let h = Scalar::from_hash(hash);
        let s = (h * key_scalar) + r;

        let mut result = [0u8; SIGNATURE_LENGTH];
        result[..32].copy_from_slice(cap_r.as_bytes());
        result[32..].copy_from_slice(s.as_bytes());
        result[SIGNATURE_LENGTH - 1] &= 0b0111_1111_u8;
        result[SIGNATURE_LENGTH - 1] |= sign_bit;
        result
    }

    /// Creates a signed pre-key whose signature covers the DJB-typed public key.
    pub fn create_signed_pre_key(&self, key_id: u32) -> SignedKeyPair {
        let key_pair = KeyPair::generate();
        let signature = self.sign(&[&signal_public_key(&key_pair.public_key)[..]]);
        SignedKeyPair {
            key_pair,
            signature,
            key_id,
        }
    }
}

pub fn verify_signature(
    their_public_key: &[u8; 32],
    message: &[&[u8]],
    signature: &[u8; SIGNATURE_LENGTH],
) -> bool {
    let mont_point = MontgomeryPoint(*their_public_key);
    let ed_pub_key_point =
        match mont_point.to_edwards((signature[SIGNATURE_LENGTH - 1] & 0b1000_0000_u8) >> 7) {
            Some(x) => x,
            None => return false,
        };
    let cap_a = ed_pub_key_point.compress();
    let mut cap_r = [0u8; 32];
    cap_r.copy_from_slice(&signature[..32]);
    let mut s = [0u8; 32];
    s.copy_from_slice(&signature[32..]);
    s[31] &= 0b0111_1111_u8;
    if (s[31] & 0b1110_0000_u8) != 0 {
        return false;
    }
    let minus_cap_a = -ed_pub_key_point;

    let mut hash = Sha512::new();
    hash.update(&cap_r[..]);
    hash.update(cap_a.as_bytes());
    for message_piece in message {
        hash.update(message_piece);
    }
    let h = Scalar::from_hash(hash);

    let cap_r_check = EdwardsPoint::vartime_double_scalar_mul_basepoint(
        &h,
        &minus_cap_a,
        &Scalar::from_bytes_mod_order(s),
    )
    .compress();

    bool::from(cap_r_check.as_bytes().ct_eq(&cap_r))
}

/// The 33-byte wire form of a public key: DJB type byte then the key.
pub fn signal_public_key(public_key: &[u8; 32]) -> [u8; 33] {
    let mut out = [0u8; 33];
    out[0] = DJB_TYPE;
    out[1..].copy_from_slice(public_key);
    out
}

/// Accepts both the 32-byte raw and the 33-byte DJB-typed forms.
pub fn strip_key_prefix(data: &[u8]) -> Result<[u8; 32], SignalError> {
    let raw = match data.len() {
        33 if data[0] == DJB_TYPE => &data[1..],
        32 => data,
        n => {
            return Err(SignalError::InvalidKey(format!(
                "unexpected public key length {n}"
            )));
        }
    };
    let mut key = [0u8; 32];
    key.copy_from_slice(raw);
    Ok(key)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedKeyPair {
    pub key_pair: KeyPair,
    #[serde(with = "crate::buffer_json")]
    pub signature: [u8; SIGNATURE_LENGTH],
    pub key_id: u32,
}

impl SignedKeyPair {
    pub fn verify(&self, identity_public_key: &[u8; 32]) -> bool {
        verify_signature(
            identity_public_key,
            &[&signal_public_key(&self.key_pair.public_key)[..]],
            &self.signature,
        )
    }
}
