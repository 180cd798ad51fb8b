use {
    aes_siv::{Aes256SivAead, Key, KeyInit, aead::array::Array},
    anyhow::{Error, format_err},
    base64::{Engine, display::Base64Display, prelude::BASE64_URL_SAFE_NO_PAD},
    generic_array::typenum::U64,
    rand::CryptoRng,
    serde::{Deserialize, Deserializer, Serialize, Serializer, de},
    std::{
        borrow::Cow,
        fmt::{self, Debug, Display},
        str::FromStr,
    },
};

/// Secret used to encrypt volumes, manifests and signatures of a repository.
///
/// Every run against the same repository must use the same key. The key is read from
/// the OS keyring or the config file, never from the command line or the environment.
#[derive(Clone)]
pub struct EncryptionKey(Array<u8, U64>);

impl EncryptionKey {
    #[inline]
    pub fn generate() -> anyhow::Result<Self> {
        Ok(Self(Aes256SivAead::generate_key()?))
    }

    #[inline]
    pub fn generate_with_rng<R: CryptoRng + ?Sized>(rng: &mut R) -> Self {
        let mut key = Key::<Aes256SivAead>::default();
        rng.fill_bytes(&mut key);
        Self(key)
    }

    #[must_use]
    #[inline]
    pub fn get(&self) -> &Array<u8, U64> {
        &self.0
    }

    #[must_use]
    #[inline]
    pub fn display_unmasked(&self) -> impl Display + '_ {
        Base64Display::new(self.0.as_ref(), &BASE64_URL_SAFE_NO_PAD)
    }
}

impl<'de> Deserialize<'de> for EncryptionKey {
    #[inline]
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Cow::<'_, str>::deserialize(deserializer)?
            .parse()
            .map_err(de::Error::custom)
    }
}

impl Serialize for EncryptionKey {
    #[inline]
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        BASE64_URL_SAFE_NO_PAD.encode(self.0).serialize(serializer)
    }
}

impl FromStr for EncryptionKey {
    type Err = Error;

    #[inline]
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        const KEY_LENGTH: usize = 64;

        let bytes = BASE64_URL_SAFE_NO_PAD.decode(s)?;
        let array = <[u8; KEY_LENGTH]>::try_from(bytes).map_err(|bytes| {
            format_err!("invalid length; got {}, expected {KEY_LENGTH}", bytes.len())
        })?;
        Ok(Self(array.into()))
    }
}

impl Debug for EncryptionKey {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionKey").finish()
    }
}

#[cfg(test)]
#[expect(clippy::unwrap_used, reason = "test")]
mod tests {
    use {
        super::*,
        rand::{rand_core::UnwrapErr, rngs::OsRng},
    };

    #[test]
    fn encryption_key_from_str() {
        static KEY: &str = "qqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqg";
        assert_eq!(
            EncryptionKey::from_str(KEY)
                .unwrap()
                .display_unmasked()
                .to_string(),
            KEY,
        );
        EncryptionKey::from_str("").unwrap_err();
        EncryptionKey::from_str("qqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqo").unwrap_err();
        EncryptionKey::from_str(&format!("{KEY}:")).unwrap_err();
    }

    #[test]
    fn debug_is_masked() {
        let key = EncryptionKey::generate_with_rng(&mut UnwrapErr(OsRng));
        let text = key.display_unmasked().to_string();
        assert!(!format!("{key:?}").contains(&text));
        let parsed: EncryptionKey = text.parse().unwrap();
        assert_eq!(parsed.get(), key.get());
    }
}
