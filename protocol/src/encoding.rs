//! Compact binary encoding for values kept in the local block index.

use {
    anyhow::{Context as _, Result},
    serde::{Serialize, de::DeserializeOwned},
};

#[inline]
pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(value, bincode::config::legacy()).context("failed to encode value")
}

#[inline]
pub fn deserialize<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    bincode::serde::decode_from_slice(data, bincode::config::legacy())
        .map(|(data, _len)| data)
        .context("failed to decode value")
}

#[cfg(test)]
#[expect(clippy::unwrap_used, reason = "test")]
mod tests {
    use super::*;

    #[test]
    fn values() {
        let names = vec!["a.dblock".to_owned(), "b.dblock".to_owned()];
        let bytes = serialize(&names).unwrap();
        assert_eq!(deserialize::<Vec<String>>(&bytes).unwrap(), names);
        deserialize::<Vec<String>>(&[0xff]).unwrap_err();
    }
}
