use {
    super::{
        Encryptor,
        io::{DecryptingWriter, EncryptingWriter},
    },
    aes_siv::{Aes256SivAead, KeyInit, Nonce, aead::Aead},
    anyhow::{Context, Result},
    deflate::{CompressionOptions, write::DeflateEncoder},
    heddle_protocol::credentials::EncryptionKey,
    std::io::{self, Read, Write},
};

pub struct Cipher {
    inner: Aes256SivAead,
}

impl Cipher {
    #[must_use]
    #[inline]
    pub fn new(key: &EncryptionKey) -> Self {
        Self {
            inner: Aes256SivAead::new(key.get()),
        }
    }

    #[inline]
    pub fn encrypt_bytes(&self, nonce: &Nonce, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.inner
            .encrypt(nonce, plaintext)
            .context("encryption failed for bytes")
    }

    #[inline]
    pub fn decrypt_bytes(&self, nonce: &Nonce, ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.inner
            .decrypt(nonce, ciphertext)
            .context("decryption failed for bytes")
    }
}

impl Encryptor for Cipher {
    #[inline]
    fn encrypt(&self, plaintext: &mut dyn Read, output: &mut dyn Write) -> Result<()> {
        let encryptor = EncryptingWriter::new(output, self)?;
        let mut encoder = DeflateEncoder::new(encryptor, CompressionOptions::high());
        io::copy(plaintext, &mut encoder).context("failed to encrypt stream")?;
        encoder.finish()?.finish()?;
        Ok(())
    }

    #[inline]
    fn decrypt(&self, ciphertext: &mut dyn Read, output: &mut dyn Write) -> Result<()> {
        let mut decryptor = DecryptingWriter::new(self, output);
        io::copy(ciphertext, &mut decryptor).context("failed to decrypt stream")?;
        decryptor.finish().context("failed to decrypt stream")?;
        Ok(())
    }
}

#[cfg(test)]
#[expect(
    clippy::unwrap_used,
    clippy::default_numeric_fallback,
    clippy::arithmetic_side_effects,
    reason = "test"
)]
mod tests {
    use {
        super::*,
        std::io::{Cursor, Seek},
        tempfile::NamedTempFile,
    };

    #[test]
    fn stream_roundtrip() {
        let key = EncryptionKey::generate().unwrap();
        let cipher = Cipher::new(&key);

        let mut input = Vec::new();
        for _ in 0..3_000 {
            let chunk: Vec<u8> = (0..1000).map(|_| rand::random::<u8>()).collect();
            input.extend_from_slice(&chunk);
        }
        let mut encrypted = NamedTempFile::new().unwrap();
        cipher
            .encrypt(&mut Cursor::new(&input), &mut encrypted)
            .unwrap();
        encrypted.rewind().unwrap();

        let mut decrypted = Vec::new();
        cipher.decrypt(&mut encrypted, &mut decrypted).unwrap();
        assert_eq!(decrypted, input);
    }

    #[test]
    fn empty_stream() {
        let cipher = Cipher::new(&EncryptionKey::generate().unwrap());
        let mut encrypted = Vec::new();
        cipher.encrypt(&mut io::empty(), &mut encrypted).unwrap();
        let mut decrypted = Vec::new();
        cipher
            .decrypt(&mut Cursor::new(encrypted), &mut decrypted)
            .unwrap();
        assert!(decrypted.is_empty());
    }

    #[test]
    fn wrong_key_or_tampering_fails() {
        let cipher = Cipher::new(&EncryptionKey::generate().unwrap());
        let mut encrypted = Vec::new();
        cipher
            .encrypt(&mut Cursor::new(b"some secret data".to_vec()), &mut encrypted)
            .unwrap();

        let other = Cipher::new(&EncryptionKey::generate().unwrap());
        other
            .decrypt(&mut Cursor::new(encrypted.clone()), &mut Vec::new())
            .unwrap_err();

        let last = encrypted.len() - 1;
        if let Some(byte) = encrypted.get_mut(last) {
            *byte ^= 1;
        }
        cipher
            .decrypt(&mut Cursor::new(encrypted), &mut Vec::new())
            .unwrap_err();
    }
}
