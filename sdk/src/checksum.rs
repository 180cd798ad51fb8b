//! Block checksums for signatures and deltas.

use sha2::{Digest, Sha256};

/// Length of the strong checksum stored per signature block.
pub const STRONG_LEN: usize = 16;

pub type StrongChecksum = [u8; STRONG_LEN];

/// rsync-style weak checksum that can be moved along the data one byte at a time.
///
/// Both halves are sums modulo 2^16; the digest is `s1 + (s2 << 16)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RollingChecksum {
    s1: u32,
    s2: u32,
    len: u32,
}

impl RollingChecksum {
    #[must_use]
    #[inline]
    pub fn new(data: &[u8]) -> Self {
        let mut sum = Self::default();
        sum.update(data);
        sum
    }

    /// Appends bytes to the end of the window.
    #[inline]
    pub fn update(&mut self, data: &[u8]) {
        for &byte in data {
            self.s1 = self.s1.wrapping_add(u32::from(byte));
            self.s2 = self.s2.wrapping_add(self.s1);
            self.len = self.len.wrapping_add(1);
        }
    }

    /// Moves the window one byte forward: drops `old` from the front and appends `new`.
    #[inline]
    pub fn roll(&mut self, old: u8, new: u8) {
        self.s1 = self
            .s1
            .wrapping_sub(u32::from(old))
            .wrapping_add(u32::from(new));
        self.s2 = self
            .s2
            .wrapping_sub(self.len.wrapping_mul(u32::from(old)))
            .wrapping_add(self.s1);
    }

    /// Drops `old` from the front of the window without appending anything.
    #[inline]
    pub fn rollout(&mut self, old: u8) {
        self.s2 = self
            .s2
            .wrapping_sub(self.len.wrapping_mul(u32::from(old)));
        self.s1 = self.s1.wrapping_sub(u32::from(old));
        self.len = self.len.wrapping_sub(1);
    }

    #[must_use]
    #[inline]
    pub fn digest(&self) -> u32 {
        (self.s1 & 0xffff) | ((self.s2 & 0xffff) << 16)
    }
}

/// First [`STRONG_LEN`] bytes of the SHA-256 of `data`.
#[must_use]
#[inline]
pub fn strong_checksum(data: &[u8]) -> StrongChecksum {
    let digest = Sha256::digest(data);
    let mut out = [0; STRONG_LEN];
    for (dst, src) in out.iter_mut().zip(digest.iter()) {
        *dst = *src;
    }
    out
}

#[cfg(test)]
#[expect(clippy::indexing_slicing, clippy::arithmetic_side_effects, reason = "test")]
mod tests {
    use super::*;

    #[test]
    fn rolling_matches_fresh_computation() {
        let data: Vec<u8> = (0..200_u8).map(|i| i.wrapping_mul(37)).collect();
        let window = 16;
        let mut rolling = RollingChecksum::new(&data[..window]);
        for start in 1..data.len() - window {
            rolling.roll(data[start - 1], data[start + window - 1]);
            assert_eq!(
                rolling.digest(),
                RollingChecksum::new(&data[start..start + window]).digest()
            );
        }
    }

    #[test]
    fn rollout_shrinks_window() {
        let data = b"the quick brown fox";
        let mut rolling = RollingChecksum::new(data);
        for start in 1..data.len() {
            rolling.rollout(data[start - 1]);
            assert_eq!(rolling.digest(), RollingChecksum::new(&data[start..]).digest());
        }
    }

    #[test]
    fn strong() {
        assert_eq!(
            hex::encode(strong_checksum(b"abc")),
            "ba7816bf8f01cfea414140de5dae2223"
        );
    }
}
