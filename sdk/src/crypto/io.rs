use {
    crate::crypto::Cipher,
    aes_siv::{Aes256SivAead, AeadCore, Nonce},
    byteorder::{ByteOrder, LE, WriteBytesExt},
    generic_array::typenum::ToInt,
    inflate::InflateWriter,
    rand::{RngCore, TryRngCore, rngs::OsRng},
    sha2::Digest,
    std::{
        cmp::min,
        io::{self, Write},
    },
};

/// Max length of a plaintext chunk that will be encrypted at once.
const BLOCK_SIZE: usize = 1024 * 1024;

/// File type marker that is stored at the beginning of every encrypted stream.
const MAGIC_NUMBER: u32 = 3_137_690_536;

// It should be a constant, but it currently doesn't work.
fn nonce_size() -> usize {
    <Aes256SivAead as AeadCore>::NonceSize::to_int()
}

fn other_err(message: impl Into<String>) -> io::Error {
    io::Error::other(message.into())
}

fn to_u64(value: usize) -> io::Result<u64> {
    u64::try_from(value).map_err(io::Error::other)
}

/// Passes through any writes and calculates the hash and size of the written data.
pub struct HashingWriter<W, D> {
    hasher: D,
    size: u64,
    inner: W,
}

impl<W, D: Digest> HashingWriter<W, D> {
    #[inline]
    pub fn new(inner: W) -> Self {
        Self {
            hasher: D::new(),
            inner,
            size: 0,
        }
    }

    /// Returns the inner writer, the digest and the number of bytes written.
    #[inline]
    pub fn finish(mut self) -> io::Result<(W, Vec<u8>, u64)>
    where
        W: Write,
    {
        self.inner.flush()?;
        Ok((self.inner, self.hasher.finalize().to_vec(), self.size))
    }
}

impl<W: Write, D: Digest> Write for HashingWriter<W, D> {
    #[inline]
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let len = self.inner.write(buf)?;
        let written = buf
            .get(..len)
            .ok_or_else(|| other_err("writer reported too many bytes"))?;
        self.hasher.update(written);
        self.size = self.size.saturating_add(to_u64(len)?);
        Ok(len)
    }

    #[inline]
    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Writes encrypted blocks of a stream.
pub struct EncryptingWriter<'a, W> {
    // Input data of the currently accumulated block.
    buf: Vec<u8>,
    output: W,
    cipher: &'a Cipher,
    encrypted_size: u64,
}

impl<'a, W: Write> EncryptingWriter<'a, W> {
    #[inline]
    pub fn new(mut output: W, cipher: &'a Cipher) -> io::Result<Self> {
        output.write_u32::<LE>(MAGIC_NUMBER)?;
        Ok(Self {
            buf: Vec::new(),
            output,
            cipher,
            // size of magic number
            encrypted_size: 4,
        })
    }

    fn write_block(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let input_len = min(self.buf.len(), BLOCK_SIZE);
        let mut nonce = Nonce::default();
        OsRng.unwrap_err().fill_bytes(&mut nonce);

        let plaintext = self
            .buf
            .get(..input_len)
            .ok_or_else(|| other_err("block out of range"))?;
        let ciphertext = self
            .cipher
            .encrypt_bytes(&nonce, plaintext)
            .map_err(|_| other_err("encryption failed"))?;
        let output_size = nonce.len().saturating_add(ciphertext.len());

        self.output
            .write_u32::<LE>(u32::try_from(output_size).map_err(io::Error::other)?)?;
        self.output.write_all(&nonce)?;
        self.output.write_all(&ciphertext)?;
        self.encrypted_size = self
            .encrypted_size
            .saturating_add(4)
            .saturating_add(to_u64(output_size)?);

        self.buf.drain(..input_len);

        Ok(())
    }

    /// Flushes the last block. Returns the output and the total encrypted size.
    #[inline]
    pub fn finish(mut self) -> io::Result<(W, u64)> {
        self.write_block()?;
        self.output.flush()?;
        Ok((self.output, self.encrypted_size))
    }
}

impl<W: Write> Write for EncryptingWriter<'_, W> {
    #[inline]
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        while self.buf.len() >= BLOCK_SIZE {
            self.write_block()?;
        }
        Ok(buf.len())
    }

    #[inline]
    fn flush(&mut self) -> io::Result<()> {
        self.output.flush()
    }
}

/// Decrypts a stream written by [`EncryptingWriter`] and inflates it into `output`.
pub struct DecryptingWriter<'a, W: Write> {
    // Whether the magic number has been read.
    got_header: bool,
    // Input data that is not yet decrypted.
    buf: Vec<u8>,
    cipher: &'a Cipher,
    output: InflateWriter<W>,
}

impl<'a, W: Write> DecryptingWriter<'a, W> {
    #[inline]
    pub fn new(cipher: &'a Cipher, output: W) -> Self {
        Self {
            got_header: false,
            buf: Vec::new(),
            cipher,
            output: InflateWriter::new(output),
        }
    }

    #[inline]
    pub fn finish(mut self) -> io::Result<W> {
        while self.process_block()? {}
        if !self.got_header {
            return Err(other_err("stream is too short"));
        }
        if !self.buf.is_empty() {
            return Err(other_err("trailing data found"));
        }
        self.output.finish()
    }

    /// Decrypts one complete block if there is one. Returns false if more input is needed.
    fn process_block(&mut self) -> io::Result<bool> {
        if !self.got_header {
            if self.buf.len() < 4 {
                return Ok(false);
            }
            if LE::read_u32(&self.buf) != MAGIC_NUMBER {
                return Err(other_err("magic number mismatch"));
            }
            self.buf.drain(..4);
            self.got_header = true;
        }
        if self.buf.len() < 4 {
            return Ok(false);
        }
        let len = usize::try_from(LE::read_u32(&self.buf)).map_err(io::Error::other)?;
        let nonce_size = nonce_size();
        let max_block_size = BLOCK_SIZE.saturating_add(nonce_size).saturating_add(16);
        if len > max_block_size {
            return Err(other_err(format!(
                "block size is too large (expected {max_block_size}, got {len})"
            )));
        }
        let Some(chunk_data) = self.buf.get(4..).and_then(|rest| rest.get(..len)) else {
            return Ok(false);
        };

        let nonce = chunk_data
            .get(..nonce_size)
            .ok_or_else(|| other_err("chunk data is too short"))?;
        let ciphertext = chunk_data
            .get(nonce_size..)
            .ok_or_else(|| other_err("chunk data is too short"))?;
        let plaintext = self
            .cipher
            .decrypt_bytes(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| other_err("decryption failed"))?;
        self.output.write_all(&plaintext)?;
        self.buf.drain(..len.saturating_add(4));
        Ok(true)
    }
}

impl<W: Write> Write for DecryptingWriter<'_, W> {
    #[inline]
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        while self.process_block()? {}
        Ok(buf.len())
    }

    #[inline]
    fn flush(&mut self) -> io::Result<()> {
        self.output.flush()?;
        Ok(())
    }
}

#[cfg(test)]
#[expect(clippy::unwrap_used, reason = "test")]
mod tests {
    use {super::*, sha1::Sha1, sha2::Sha256};

    #[test]
    fn hashing_writer() {
        let mut writer = HashingWriter::<_, Sha256>::new(Vec::new());
        writer.write_all(b"abc").unwrap();
        let (inner, hash, size) = writer.finish().unwrap();
        assert_eq!(inner, b"abc");
        assert_eq!(size, 3);
        assert_eq!(
            hex::encode(hash),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );

        let mut writer = HashingWriter::<_, Sha1>::new(io::sink());
        writer.write_all(b"abc").unwrap();
        let (_, hash, _) = writer.finish().unwrap();
        assert_eq!(hex::encode(hash), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }
}
