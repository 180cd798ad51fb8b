//! File signatures: a weak rolling checksum and a strong checksum per block.
//!
//! Wire format: magic `HSIG`, `u32 BE` block length, `u32 BE` strong length, then per
//! block a `u32 BE` weak checksum followed by the strong checksum.

use {
    crate::checksum::{RollingChecksum, STRONG_LEN, StrongChecksum, strong_checksum},
    anyhow::{Result, bail, ensure},
    byteorder::{BE, ReadBytesExt, WriteBytesExt},
    std::{
        collections::HashMap,
        io::{self, Read, Write},
    },
};

const MAGIC: &[u8; 4] = b"HSIG";
const MIN_BLOCK_LEN: u32 = 512;
const MAX_BLOCK_LEN: u32 = 2048;
const SMALL_FILE_LIMIT: u64 = 1_024_000;
const TARGET_BLOCKS: u64 = 2000;

/// Block length for a file of `file_size` bytes.
///
/// Small files use the minimum; larger ones grow the block so the signature stays at
/// about 2000 blocks, up to [`MAX_BLOCK_LEN`].
#[must_use]
#[inline]
pub fn block_len_for(file_size: u64) -> u32 {
    if file_size < SMALL_FILE_LIMIT {
        return MIN_BLOCK_LEN;
    }
    let unit = u64::from(MIN_BLOCK_LEN);
    let scaled = file_size / (TARGET_BLOCKS * unit) * unit;
    u32::try_from(scaled.min(u64::from(MAX_BLOCK_LEN))).unwrap_or(MAX_BLOCK_LEN)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSignature {
    pub weak: u32,
    pub strong: StrongChecksum,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    block_len: u32,
    blocks: Vec<BlockSignature>,
}

impl Signature {
    #[must_use]
    #[inline]
    pub fn block_len(&self) -> u32 {
        self.block_len
    }

    #[must_use]
    #[inline]
    pub fn blocks(&self) -> &[BlockSignature] {
        &self.blocks
    }

    #[inline]
    pub fn write_to(&self, mut out: impl Write) -> io::Result<()> {
        out.write_all(MAGIC)?;
        out.write_u32::<BE>(self.block_len)?;
        out.write_u32::<BE>(u32::try_from(STRONG_LEN).map_err(io::Error::other)?)?;
        for block in &self.blocks {
            out.write_u32::<BE>(block.weak)?;
            out.write_all(&block.strong)?;
        }
        Ok(())
    }

    #[must_use]
    #[inline]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            self.blocks
                .len()
                .saturating_mul(STRONG_LEN.saturating_add(4))
                .saturating_add(12),
        );
        // Writing to a Vec never fails.
        let _ = self.write_to(&mut out);
        out
    }

    #[inline]
    pub fn from_bytes(mut data: &[u8]) -> Result<Self> {
        let mut magic = [0; 4];
        data.read_exact(&mut magic)?;
        ensure!(&magic == MAGIC, "not a signature");
        let block_len = data.read_u32::<BE>()?;
        ensure!(block_len > 0, "invalid signature block length");
        let strong_len = data.read_u32::<BE>()?;
        if usize::try_from(strong_len)? != STRONG_LEN {
            bail!("unsupported strong checksum length {strong_len}");
        }
        let record_len = STRONG_LEN.saturating_add(4);
        if data.len() % record_len != 0 {
            bail!("truncated signature");
        }
        let mut blocks = Vec::with_capacity(data.len() / record_len);
        while !data.is_empty() {
            let weak = data.read_u32::<BE>()?;
            let mut strong = [0; STRONG_LEN];
            data.read_exact(&mut strong)?;
            blocks.push(BlockSignature { weak, strong });
        }
        Ok(Self { block_len, blocks })
    }

    /// Computes the signature of everything `reader` yields.
    #[inline]
    pub fn of_reader(block_len: u32, mut reader: impl Read) -> io::Result<Self> {
        let mut builder = SignatureBuilder::new(block_len);
        io::copy(&mut reader, &mut builder)?;
        Ok(builder.finish())
    }

    /// Weak checksum to block numbers with that checksum.
    pub(crate) fn weak_lookup(&self) -> HashMap<u32, Vec<u32>> {
        let mut map: HashMap<u32, Vec<u32>> = HashMap::new();
        for (number, block) in (0_u32..).zip(&self.blocks) {
            map.entry(block.weak).or_default().push(number);
        }
        map
    }
}

/// Computes a signature from data supplied in arbitrary pieces.
#[derive(Debug)]
pub struct SignatureBuilder {
    block_len: usize,
    partial: Vec<u8>,
    signature: Signature,
}

impl SignatureBuilder {
    #[must_use]
    #[inline]
    pub fn new(block_len: u32) -> Self {
        let len = usize::try_from(block_len).unwrap_or(usize::MAX);
        Self {
            block_len: len,
            partial: Vec::with_capacity(len),
            signature: Signature {
                block_len,
                blocks: Vec::new(),
            },
        }
    }

    #[inline]
    pub fn update(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let wanted = self.block_len.saturating_sub(self.partial.len());
            let (head, tail) = data.split_at(wanted.min(data.len()));
            self.partial.extend_from_slice(head);
            data = tail;
            if self.partial.len() == self.block_len {
                self.push_block();
            }
        }
    }

    fn push_block(&mut self) {
        self.signature.blocks.push(BlockSignature {
            weak: RollingChecksum::new(&self.partial).digest(),
            strong: strong_checksum(&self.partial),
        });
        self.partial.clear();
    }

    #[must_use]
    #[inline]
    pub fn finish(mut self) -> Signature {
        if !self.partial.is_empty() {
            self.push_block();
        }
        self.signature
    }
}

impl Write for SignatureBuilder {
    #[inline]
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    #[inline]
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
#[expect(
    clippy::unwrap_used,
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects,
    reason = "test"
)]
mod tests {
    use super::*;

    #[test]
    fn block_lengths() {
        assert_eq!(block_len_for(0), 512);
        assert_eq!(block_len_for(1_023_999), 512);
        assert_eq!(block_len_for(1_024_000), 512);
        assert_eq!(block_len_for(2_048_000), 1024);
        assert_eq!(block_len_for(3_000_000), 1024);
        assert_eq!(block_len_for(100_000_000_000), 2048);
    }

    #[test]
    fn pieces_do_not_matter() {
        let data: Vec<u8> = (0..5000_u32).map(|i| i.to_le_bytes()[0] ^ 0x5a).collect();
        let whole = Signature::of_reader(512, data.as_slice()).unwrap();
        let mut builder = SignatureBuilder::new(512);
        for chunk in data.chunks(77) {
            builder.update(chunk);
        }
        assert_eq!(builder.finish(), whole);
        assert_eq!(whole.blocks().len(), 10);
    }

    #[test]
    fn bytes() {
        let signature = Signature::of_reader(512, &b"abc".repeat(1000)[..]).unwrap();
        let bytes = signature.to_bytes();
        assert_eq!(&bytes[..4], b"HSIG");
        assert_eq!(Signature::from_bytes(&bytes).unwrap(), signature);
        Signature::from_bytes(&bytes[..bytes.len() - 3]).unwrap_err();
        Signature::from_bytes(b"NOPE").unwrap_err();
        let empty = Signature::of_reader(512, &b""[..]).unwrap();
        assert!(empty.blocks().is_empty());
        assert_eq!(Signature::from_bytes(&empty.to_bytes()).unwrap(), empty);
    }
}
