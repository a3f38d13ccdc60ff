// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::io::Write;

use thiserror::Error;

use crate::codec::h264::nalu::find_start_code;
use crate::codec::h264::nalu::Nalu;
use crate::codec::h264::nalu::NaluError;
use crate::codec::h264::nalu::START_CODE;

#[derive(Debug, Error)]
pub enum NalStreamError {
    #[error("no decodable NAL unit found after wrapping around the stream")]
    Exhausted,
    #[error(transparent)]
    Nalu(#[from] NaluError),
}

/// An Annex B elementary stream read in a loop.
///
/// Reaching the end of the buffer moves the cursor back to its start, so the
/// same stream can be played indefinitely. Only the NAL unit types the
/// decoder acts on are returned.
#[derive(Debug, Clone)]
pub struct NalStream {
    data: Vec<u8>,
    cursor: usize,
    loops: u32,
}

impl NalStream {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            cursor: 0,
            loops: 0,
        }
    }

    /// Returns the next SPS, PPS or slice NAL unit.
    ///
    /// The cursor wraps to the start of the buffer at most once per call. A
    /// second wrap means the whole stream was scanned without finding a
    /// usable unit.
    pub fn next_nal(&mut self) -> Result<Nalu<'_>, NalStreamError> {
        let mut wrapped = false;

        loop {
            let Some(offset) = find_start_code(&self.data, self.cursor) else {
                if wrapped {
                    return Err(NalStreamError::Exhausted);
                }

                wrapped = true;
                self.cursor = 0;
                self.loops += 1;
                log::debug!("End of stream reached, looping ({} loops)", self.loops);
                continue;
            };

            let next = find_start_code(&self.data, offset + START_CODE.len())
                .unwrap_or(self.data.len());
            self.cursor = next;

            let nalu = Nalu::from_span(&self.data, offset, next)?;
            if nalu.header.type_.is_decodable() {
                return Ok(nalu);
            }

            log::trace!(
                "Skipping {:?} NAL unit at offset {}",
                nalu.header.type_,
                offset
            );
        }
    }

    /// Moves the cursor back to `offset`, usually the offset of a NAL unit
    /// returned earlier that must be read again.
    pub fn rewind(&mut self, offset: usize) {
        self.cursor = offset.min(self.data.len());
    }

    pub fn position(&self) -> usize {
        self.cursor
    }

    /// Number of times the end of the stream has been reached.
    pub fn loop_count(&self) -> u32 {
        self.loops
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum BitWriterError {
    #[error("invalid bit count")]
    InvalidBitCount,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type BitWriterResult<T> = std::result::Result<T, BitWriterError>;

/// Writes bits MSB first into a [`std::io::Write`].
pub struct BitWriter<W: Write> {
    out: W,
    nth_bit: u8,
    curr_byte: u8,
}

impl<W: Write> BitWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            out: writer,
            curr_byte: 0,
            nth_bit: 0,
        }
    }

    /// Writes the `bits` low bits of `value`, up to 32.
    pub fn write_f<T: Into<u32>>(&mut self, bits: usize, value: T) -> BitWriterResult<usize> {
        let value = value.into();

        if bits > 32 {
            return Err(BitWriterError::InvalidBitCount);
        }

        for shift in (0..bits).rev() {
            self.write_bit((value >> shift) & 1 == 1)?;
        }

        Ok(bits)
    }

    pub fn write_bit(&mut self, bit: bool) -> BitWriterResult<()> {
        self.curr_byte |= (bit as u8) << (7u8 - self.nth_bit);
        self.nth_bit += 1;

        if self.nth_bit == 8 {
            self.out.write_all(&[self.curr_byte])?;
            self.nth_bit = 0;
            self.curr_byte = 0;
        }

        Ok(())
    }

    /// Outputs the partially filled byte, if any, padded with zeros.
    pub fn flush(&mut self) -> BitWriterResult<()> {
        if self.nth_bit != 0 {
            self.out.write_all(&[self.curr_byte])?;
            self.nth_bit = 0;
            self.curr_byte = 0;
        }

        self.out.flush()?;
        Ok(())
    }

    /// Returns `true` if some bits were not written out yet.
    pub fn has_data_pending(&self) -> bool {
        self.nth_bit != 0
    }

    pub(crate) fn inner(&self) -> &W {
        &self.out
    }

    pub(crate) fn inner_mut(&mut self) -> &mut W {
        &mut self.out
    }
}

impl<W: Write> Drop for BitWriter<W> {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            log::error!("Unable to flush bits {e:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::h264::nalu::NaluType;

    // SPS, SEI, PPS, IDR slice, filler.
    const STREAM: [u8; 26] = [
        0x00, 0x00, 0x00, 0x01, 0x67, 0x42, 0x00, 0x00, 0x01, 0x06, 0x05, 0x00, 0x00, 0x01, 0x68,
        0xce, 0x00, 0x00, 0x01, 0x65, 0x88, 0x84, 0x00, 0x00, 0x01, 0x0c,
    ];

    #[test]
    fn skips_unused_types() {
        let mut stream = NalStream::new(STREAM);

        let types: Vec<_> = (0..3)
            .map(|_| stream.next_nal().unwrap().header.type_)
            .collect();
        assert_eq!(types, [NaluType::Sps, NaluType::Pps, NaluType::SliceIdr]);
        assert_eq!(stream.loop_count(), 0);
    }

    #[test]
    fn single_wrap_succeeds() {
        let mut stream = NalStream::new(STREAM);
        for _ in 0..3 {
            stream.next_nal().unwrap();
        }

        // Only the filler unit is left before the end of the buffer.
        let nalu = stream.next_nal().unwrap();
        assert_eq!(nalu.header.type_, NaluType::Sps);
        assert_eq!(nalu.offset, 1);
        assert_eq!(stream.loop_count(), 1);
    }

    #[test]
    fn double_wrap_is_fatal() {
        // Nothing but SEI and filler data.
        let mut stream = NalStream::new([
            0x00, 0x00, 0x01, 0x06, 0x05, 0x00, 0x00, 0x01, 0x0c, 0xff,
        ]);

        assert!(matches!(stream.next_nal(), Err(NalStreamError::Exhausted)));
        assert_eq!(stream.loop_count(), 1);

        let mut empty = NalStream::new(Vec::new());
        assert!(matches!(empty.next_nal(), Err(NalStreamError::Exhausted)));
    }

    #[test]
    fn truncated_unit_is_an_error() {
        let mut stream = NalStream::new([0x00, 0x00, 0x01, 0x00, 0x00, 0x01, 0x67, 0x42]);
        assert!(matches!(
            stream.next_nal(),
            Err(NalStreamError::Nalu(NaluError::Truncated(0)))
        ));
    }

    #[test]
    fn rewind_returns_same_unit() {
        let mut stream = NalStream::new(STREAM);
        stream.next_nal().unwrap();

        let offset = stream.next_nal().unwrap().offset;
        stream.rewind(offset);

        let nalu = stream.next_nal().unwrap();
        assert_eq!(nalu.header.type_, NaluType::Pps);
        assert_eq!(nalu.offset, offset);
    }

    #[test]
    fn bitwriter_single_bits() {
        let mut buf = Vec::<u8>::new();
        {
            let mut writer = BitWriter::new(&mut buf);
            for bit in [true, false, false, false, true, true, true, true] {
                writer.write_bit(bit).unwrap();
            }
            assert!(!writer.has_data_pending());
        }
        assert_eq!(buf, vec![0b10001111u8]);
    }

    #[test]
    fn bitwriter_pads_on_drop() {
        let mut buf = Vec::<u8>::new();
        {
            let mut writer = BitWriter::new(&mut buf);
            writer.write_f(3, 0b100u8).unwrap();
            writer.write_f(3, 0b101u8).unwrap();
            writer.write_f(3, 0b011u8).unwrap();
            assert!(writer.has_data_pending());
        }
        assert_eq!(buf, vec![0b10010101u8, 0b10000000u8]);
    }

    #[test]
    fn bitwriter_rejects_wide_values() {
        let mut buf = Vec::<u8>::new();
        let mut writer = BitWriter::new(&mut buf);
        assert!(matches!(
            writer.write_f(33, 0u32),
            Err(BitWriterError::InvalidBitCount)
        ));
        assert_eq!(writer.write_f(32, 0xdead_beefu32).unwrap(), 32);
        drop(writer);
        assert_eq!(buf, vec![0xde, 0xad, 0xbe, 0xef]);
    }
}
