//! Binary deltas between an old file, known only by its signature, and new content.
//!
//! Wire format: magic `HDLT`, then commands until the end marker:
//!
//! - `0x00` end
//! - `0x01`, `u64 BE` offset, `u32 BE` length: copy from the old file
//! - `0x02`, `u32 BE` length, bytes: literal data

use {
    crate::{
        checksum::{RollingChecksum, strong_checksum},
        signature::Signature,
    },
    anyhow::{Context as _, Result, bail, ensure},
    byteorder::{BE, ReadBytesExt, WriteBytesExt},
    std::{
        collections::HashMap,
        io::{self, Read, Seek, SeekFrom, Write},
    },
};

const MAGIC: &[u8; 4] = b"HDLT";
const CMD_END: u8 = 0;
const CMD_COPY: u8 = 1;
const CMD_LITERAL: u8 = 2;
const MAX_LITERAL: usize = 64 * 1024;
/// Consumed input is dropped from the window buffer once this much accumulates.
const COMPACT_THRESHOLD: usize = 1024 * 1024;

/// Computes a delta of the bytes written to it against `signature`.
///
/// Input can arrive in pieces of any size; the delta is written to `output` as it
/// becomes known. Call [`DeltaWriter::finish`] after the last piece.
pub struct DeltaWriter<W: Write> {
    output: W,
    block_len: usize,
    signature: Signature,
    lookup: HashMap<u32, Vec<u32>>,
    /// Unprocessed input. The current window starts at `pos`.
    pending: Vec<u8>,
    pos: usize,
    /// Weak checksum of the current window, if computed.
    window: Option<RollingChecksum>,
    literal: Vec<u8>,
    copy: Option<(u64, u32)>,
    literal_bytes: u64,
}

impl<W: Write> DeltaWriter<W> {
    #[inline]
    pub fn new(signature: Signature, mut output: W) -> io::Result<Self> {
        output.write_all(MAGIC)?;
        let lookup = signature.weak_lookup();
        Ok(Self {
            output,
            block_len: usize::try_from(signature.block_len()).map_err(io::Error::other)?,
            signature,
            lookup,
            pending: Vec::new(),
            pos: 0,
            window: None,
            literal: Vec::new(),
            copy: None,
            literal_bytes: 0,
        })
    }

    /// Number of literal bytes emitted so far.
    #[must_use]
    #[inline]
    pub fn literal_bytes(&self) -> u64 {
        self.literal_bytes
    }

    #[must_use]
    #[inline]
    pub fn get_ref(&self) -> &W {
        &self.output
    }

    #[inline]
    pub fn get_mut(&mut self) -> &mut W {
        &mut self.output
    }

    /// Processes the remaining input and writes the end marker.
    #[inline]
    pub fn finish(mut self) -> io::Result<W> {
        self.process(true)?;
        self.flush_literal()?;
        self.flush_copy()?;
        self.output.write_u8(CMD_END)?;
        self.output.flush()?;
        Ok(self.output)
    }

    fn find_match(&self, window: &[u8], weak: u32) -> Option<u32> {
        let candidates = self.lookup.get(&weak)?;
        let strong = strong_checksum(window);
        candidates.iter().copied().find(|&number| {
            self.signature
                .blocks()
                .get(usize::try_from(number).unwrap_or(usize::MAX))
                .is_some_and(|block| block.strong == strong)
        })
    }

    fn process(&mut self, last: bool) -> io::Result<()> {
        loop {
            let available = self.pending.len().saturating_sub(self.pos);
            if available == 0 || (available < self.block_len && !last) {
                break;
            }
            let window_len = available.min(self.block_len);
            let window_end = self.pos.saturating_add(window_len);
            let window = self
                .pending
                .get(self.pos..window_end)
                .ok_or_else(|| io::Error::other("window out of range"))?;
            let weak = *self.window.get_or_insert_with(|| RollingChecksum::new(window));

            if let Some(number) = self.find_match(window, weak.digest()) {
                let offset = u64::from(number)
                    .saturating_mul(u64::try_from(self.block_len).map_err(io::Error::other)?);
                self.flush_literal()?;
                self.push_copy(offset, u32::try_from(window_len).map_err(io::Error::other)?)?;
                self.pos = window_end;
                self.window = None;
            } else {
                let first = *self
                    .pending
                    .get(self.pos)
                    .ok_or_else(|| io::Error::other("window out of range"))?;
                let next = self.pending.get(window_end).copied();
                self.window = match (self.window, next) {
                    (Some(mut rolling), Some(next)) if window_len == self.block_len => {
                        rolling.roll(first, next);
                        Some(rolling)
                    }
                    (Some(mut rolling), None) if last => {
                        rolling.rollout(first);
                        Some(rolling)
                    }
                    // The next byte has not arrived yet.
                    _ => None,
                };
                self.flush_copy()?;
                self.literal.push(first);
                if self.literal.len() >= MAX_LITERAL {
                    self.flush_literal()?;
                }
                self.pos = self.pos.saturating_add(1);
            }
        }
        if self.pos >= COMPACT_THRESHOLD {
            self.pending.drain(..self.pos);
            self.pos = 0;
        }
        Ok(())
    }

    fn push_copy(&mut self, offset: u64, len: u32) -> io::Result<()> {
        if let Some((start, current)) = &mut self.copy
            && start.saturating_add(u64::from(*current)) == offset
            && let Some(merged) = current.checked_add(len)
        {
            *current = merged;
            return Ok(());
        }
        self.flush_copy()?;
        self.copy = Some((offset, len));
        Ok(())
    }

    fn flush_copy(&mut self) -> io::Result<()> {
        if let Some((offset, len)) = self.copy.take() {
            self.output.write_u8(CMD_COPY)?;
            self.output.write_u64::<BE>(offset)?;
            self.output.write_u32::<BE>(len)?;
        }
        Ok(())
    }

    fn flush_literal(&mut self) -> io::Result<()> {
        if self.literal.is_empty() {
            return Ok(());
        }
        self.output.write_u8(CMD_LITERAL)?;
        self.output
            .write_u32::<BE>(u32::try_from(self.literal.len()).map_err(io::Error::other)?)?;
        self.output.write_all(&self.literal)?;
        self.literal_bytes = self
            .literal_bytes
            .saturating_add(u64::try_from(self.literal.len()).map_err(io::Error::other)?);
        self.literal.clear();
        Ok(())
    }
}

impl<W: Write> Write for DeltaWriter<W> {
    #[inline]
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(buf);
        self.process(false)?;
        Ok(buf.len())
    }

    #[inline]
    fn flush(&mut self) -> io::Result<()> {
        self.output.flush()
    }
}

/// Reconstructs new content from the old file and a delta.
#[inline]
pub fn apply_delta(
    mut basis: impl Read + Seek,
    mut delta: impl Read,
    mut output: impl Write,
) -> Result<()> {
    let mut magic = [0; 4];
    delta.read_exact(&mut magic).context("truncated delta")?;
    ensure!(&magic == MAGIC, "not a delta");
    loop {
        let command = delta.read_u8().context("truncated delta")?;
        match command {
            CMD_END => break,
            CMD_COPY => {
                let offset = delta.read_u64::<BE>()?;
                let len = u64::from(delta.read_u32::<BE>()?);
                basis.seek(SeekFrom::Start(offset))?;
                let copied = io::copy(&mut (&mut basis).take(len), &mut output)?;
                if copied != len {
                    bail!("delta copies past the end of the old file");
                }
            }
            CMD_LITERAL => {
                let len = u64::from(delta.read_u32::<BE>()?);
                let copied = io::copy(&mut (&mut delta).take(len), &mut output)?;
                if copied != len {
                    bail!("truncated delta literal");
                }
            }
            _ => bail!("unknown delta command {command}"),
        }
    }
    output.flush()?;
    Ok(())
}

#[cfg(test)]
#[expect(
    clippy::unwrap_used,
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects,
    reason = "test"
)]
mod tests {
    use {super::*, rand::RngCore, std::io::Cursor};

    fn random(len: usize) -> Vec<u8> {
        let mut data = vec![0; len];
        rand::rng().fill_bytes(&mut data);
        data
    }

    fn delta(old: &[u8], new: &[u8], piece: usize) -> (Vec<u8>, u64) {
        let signature = Signature::of_reader(512, old).unwrap();
        let mut writer = DeltaWriter::new(signature, Vec::new()).unwrap();
        for chunk in new.chunks(piece.max(1)) {
            writer.write_all(chunk).unwrap();
        }
        let literal = writer.literal_bytes();
        (writer.finish().unwrap(), literal)
    }

    fn patched(old: &[u8], delta: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        apply_delta(Cursor::new(old), delta, &mut out).unwrap();
        out
    }

    #[test]
    fn identical_files_copy_everything() {
        let old = random(10_000);
        let (delta, literal) = delta(&old, &old, 1000);
        assert_eq!(literal, 0);
        // One merged copy command plus magic and end marker.
        assert_eq!(delta.len(), 4 + 13 + 1);
        assert_eq!(patched(&old, &delta), old);
    }

    #[test]
    fn local_edits_stay_small() {
        let old = random(50_000);
        let mut new = old.clone();
        new[20_000] ^= 0xff;
        new.splice(30_000..30_000, b"inserted bytes".iter().copied());
        new.truncate(45_000);
        for piece in [1, 100, 4096, 100_000] {
            let (delta, literal) = delta(&old, &new, piece);
            assert!(literal < 2_000, "{literal}");
            assert_eq!(patched(&old, &delta), new);
        }
    }

    #[test]
    fn unrelated_and_empty() {
        let old = random(3_000);
        let new = random(2_000);
        let (d, literal) = delta(&old, &new, 333);
        assert_eq!(literal, 2_000);
        assert_eq!(patched(&old, &d), new);

        let (d, _) = delta(&old, &[], 1);
        assert!(patched(&old, &d).is_empty());

        let (d, _) = delta(&[], &new, 1);
        assert_eq!(patched(&[], &d), new);
    }

    #[test]
    fn short_tail_block_matches() {
        let old = random(1_000);
        let mut new = random(100);
        new.extend_from_slice(&old);
        let (d, literal) = delta(&old, &new, 64);
        assert_eq!(literal, 100);
        assert_eq!(patched(&old, &d), new);
    }

    #[test]
    fn malformed_deltas() {
        let old = random(100);
        let mut out = Vec::new();
        apply_delta(Cursor::new(&old), &b"HDLT"[..], &mut out).unwrap_err();
        apply_delta(Cursor::new(&old), &b"XXXX\0"[..], &mut out).unwrap_err();
        let mut bad_copy = b"HDLT\x01".to_vec();
        bad_copy.extend_from_slice(&90_u64.to_be_bytes());
        bad_copy.extend_from_slice(&20_u32.to_be_bytes());
        bad_copy.push(0);
        apply_delta(Cursor::new(&old), bad_copy.as_slice(), &mut out).unwrap_err();
    }
}
