//! Transforms between the plain form of a file and its stored form: gzip,
//! encryption, or nothing, as selected by the file name suffix.

use {
    crate::crypto::Encryptor,
    anyhow::{Context as _, Result, bail},
    flate2::{Compression, read::GzDecoder, write::GzEncoder},
    heddle_protocol::naming::Encoding,
    std::io::{self, Read, Write},
};

/// Converts plain bytes into the stored form.
#[inline]
pub fn seal(
    encoding: Encoding,
    encryptor: Option<&dyn Encryptor>,
    input: &mut dyn Read,
    output: &mut dyn Write,
) -> Result<()> {
    match encoding {
        Encoding::Plain => {
            io::copy(input, output)?;
        }
        Encoding::Gzip => {
            let mut encoder = GzEncoder::new(&mut *output, Compression::default());
            io::copy(input, &mut encoder)?;
            encoder.finish()?;
        }
        Encoding::Encrypted => {
            let Some(encryptor) = encryptor else {
                bail!("encryption requested but no encryption key is configured");
            };
            encryptor.encrypt(input, output)?;
        }
    }
    output.flush()?;
    Ok(())
}

/// Inverse of [`seal`].
#[inline]
pub fn open(
    encoding: Encoding,
    encryptor: Option<&dyn Encryptor>,
    input: &mut dyn Read,
    output: &mut dyn Write,
) -> Result<()> {
    match encoding {
        Encoding::Plain => {
            io::copy(input, output)?;
        }
        Encoding::Gzip => {
            io::copy(&mut GzDecoder::new(input), output).context("invalid gzip data")?;
        }
        Encoding::Encrypted => {
            let Some(encryptor) = encryptor else {
                bail!("file is encrypted but no encryption key is configured");
            };
            encryptor.decrypt(input, output)?;
        }
    }
    output.flush()?;
    Ok(())
}

#[cfg(test)]
#[expect(clippy::unwrap_used, reason = "test")]
mod tests {
    use {
        super::*,
        crate::crypto::Cipher,
        heddle_protocol::credentials::EncryptionKey,
        std::io::Cursor,
    };

    #[test]
    fn all_encodings() {
        let cipher = Cipher::new(&EncryptionKey::generate().unwrap());
        let data = b"hello hello hello hello".repeat(100);
        for encoding in [Encoding::Plain, Encoding::Gzip, Encoding::Encrypted] {
            let mut stored = Vec::new();
            seal(encoding, Some(&cipher), &mut Cursor::new(&data), &mut stored).unwrap();
            if encoding != Encoding::Plain {
                assert_ne!(stored, data);
            }
            let mut plain = Vec::new();
            open(encoding, Some(&cipher), &mut Cursor::new(stored), &mut plain).unwrap();
            assert_eq!(plain, data);
        }
    }

    #[test]
    fn missing_key() {
        let mut out = Vec::new();
        seal(Encoding::Encrypted, None, &mut io::empty(), &mut out).unwrap_err();
        open(Encoding::Gzip, None, &mut Cursor::new(b"not gzip".to_vec()), &mut out).unwrap_err();
    }
}
