use crate::noise::{NoiseError, Result, generate_iv};
use aes_gcm::Aes256Gcm;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use x25519_dalek::x25519;

fn prepare_cipher(key: &[u8]) -> Result<Aes256Gcm> {
    Aes256Gcm::new_from_slice(key).map_err(|e| NoiseError::Crypto(e.to_string()))
}

/// Symmetric handshake state: running hash, chaining key and the current
/// handshake cipher.
pub struct NoiseState {
    hash: [u8; 32],
    salt: [u8; 32],
    key: Aes256Gcm,
    counter: u32,
}

impl NoiseState {
    pub fn new(pattern: &str, prologue: &[u8]) -> Result<Self> {
        let h: [u8; 32] = match <[u8; 32]>::try_from(pattern.as_bytes()) {
            Ok(exact) => exact,
            Err(_) => Sha256::digest(pattern.as_bytes()).into(),
        };

        let mut state = Self {
            hash: h,
            salt: h,
            key: prepare_cipher(&h)?,
            counter: 0,
        };
        state.authenticate(prologue);
        Ok(state)
    }

    pub fn hash(&self) -> &[u8; 32] {
        &self.hash
    }

    pub fn authenticate(&mut self, data: &[u8]) {
        let mut hasher = Sha256::new();
        hasher.update(self.hash);
        hasher.update(data);
        self.hash = hasher.finalize().into();
    }

    fn post_increment_counter(&mut self) -> u32 {
        let count = self.counter;
        self.counter += 1;
        count
    }

    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let iv = generate_iv(self.post_increment_counter());
        let payload = Payload {
            msg: plaintext,
            aad: &self.hash,
        };
        let ciphertext = self
            .key
            .encrypt(iv.as_ref().into(), payload)
            .map_err(|e| NoiseError::Crypto(e.to_string()))?;
        self.authenticate(&ciphertext);
        Ok(ciphertext)
    }

    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let aad = self.hash;
        let iv = generate_iv(self.post_increment_counter());
        let payload = Payload {
            msg: ciphertext,
            aad: &aad,
        };
        let plaintext = self
            .key
            .decrypt(iv.as_ref().into(), payload)
            .map_err(|e| NoiseError::Crypto(format!("Noise decrypt failed: {e}")))?;
        // the hash only advances once the ciphertext authenticated
        self.authenticate(ciphertext);
        Ok(plaintext)
    }

    pub fn mix_into_key(&mut self, data: &[u8]) -> Result<()> {
        self.counter = 0;
        let (write, read) = self.extract_and_expand(Some(data))?;
        self.salt = write;
        self.key = prepare_cipher(&read)?;
        Ok(())
    }

    pub fn mix_shared_secret(&mut self, priv_key: &[u8; 32], pub_key: &[u8; 32]) -> Result<()> {
        let shared_secret = x25519(*priv_key, *pub_key);
        self.mix_into_key(&shared_secret)
    }

    fn extract_and_expand(&self, data: Option<&[u8]>) -> Result<([u8; 32], [u8; 32])> {
        let hk = Hkdf::<Sha256>::new(Some(&self.salt), data.unwrap_or_default());
        let mut okm = [0u8; 64];
        hk.expand(&[], &mut okm)
            .map_err(|e| NoiseError::Crypto(e.to_string()))?;

        let mut write = [0u8; 32];
        let mut read = [0u8; 32];
        write.copy_from_slice(&okm[..32]);
        read.copy_from_slice(&okm[32..]);
        Ok((write, read))
    }

    /// Derives the initiator's transport cipher. The responder swaps the
    /// two keys, see [`NoiseState::finish_responder`].
    pub fn finish(self) -> Result<TransportCipher> {
        let (write, read) = self.extract_and_expand(None)?;
        TransportCipher::new(&write, &read)
    }

    pub fn finish_responder(self) -> Result<TransportCipher> {
        let (write, read) = self.extract_and_expand(None)?;
        TransportCipher::new(&read, &write)
    }
}

/// Post-handshake frame cipher with independent write and read counters.
pub struct TransportCipher {
    write_key: Aes256Gcm,
    read_key: Aes256Gcm,
    write_counter: u32,
    read_counter: u32,
}

impl TransportCipher {
    fn new(write: &[u8], read: &[u8]) -> Result<Self> {
        Ok(Self {
            write_key: prepare_cipher(write)?,
            read_key: prepare_cipher(read)?,
            write_counter: 0,
            read_counter: 0,
        })
    }

    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let iv = generate_iv(self.write_counter);
        let ciphertext = self
            .write_key
            .encrypt(iv.as_ref().into(), plaintext)
            .map_err(|e| NoiseError::Crypto(e.to_string()))?;
        self.write_counter = self.write_counter.wrapping_add(1);
        Ok(ciphertext)
    }

    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let iv = generate_iv(self.read_counter);
        let plaintext = self
            .read_key
            .decrypt(iv.as_ref().into(), ciphertext)
            .map_err(|e| NoiseError::Crypto(format!("frame decrypt failed: {e}")))?;
        self.read_counter = self.read_counter.wrapping_add(1);
        Ok(plaintext)
    }
}
