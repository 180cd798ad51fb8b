//! Encryption of stored files.
//!
//! The engine only sees the [`Encryptor`] capability: a streaming transform from
//! plaintext to ciphertext and back. The built-in implementation is [`Cipher`], which
//! uses AES-SIV with a random nonce per block.
//!
//! The plaintext is first compressed using deflate and then split into fixed-size
//! blocks. The encrypted stream starts with a 32-bit little-endian magic number,
//! followed by blocks of the following form:
//!
//! - block size (32 bits, little endian) - length of the following block (nonce + encrypted content)
//! - nonce (128 bits) - the random nonce used to encrypt this block
//! - encrypted content
//!
//! AES-SIV authenticates every block, so tampered data fails to decrypt.

mod cipher;
mod io;

pub use {
    cipher::Cipher,
    io::{DecryptingWriter, EncryptingWriter, HashingWriter},
};

use {
    anyhow::Result,
    std::io::{Read, Write},
};

/// Streaming encryption capability.
///
/// Implementations own their key material; callers never see it.
pub trait Encryptor: Send + Sync {
    /// Reads all of `plaintext` and writes the encrypted form to `output`.
    fn encrypt(&self, plaintext: &mut dyn Read, output: &mut dyn Write) -> Result<()>;

    /// Reads all of `ciphertext` and writes the decrypted form to `output`.
    /// Fails if the data was not produced by [`Encryptor::encrypt`] with the same key.
    fn decrypt(&self, ciphertext: &mut dyn Read, output: &mut dyn Write) -> Result<()>;
}
