// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::io::Write;

use thiserror::Error;

use crate::bitstream_utils::BitWriter;
use crate::bitstream_utils::BitWriterError;
use crate::codec::h264::nalu::NaluType;

/// Inserts `0x03` after two zero bytes followed by a byte lower than 4.
struct EmulationPrevention<W: Write> {
    out: W,
    /// The last two bytes written, most recent first. Held back until the
    /// next byte is known.
    prev_bytes: [Option<u8>; 2],
    enabled: bool,
}

impl<W: Write> EmulationPrevention<W> {
    fn new(writer: W, enabled: bool) -> Self {
        Self {
            out: writer,
            prev_bytes: [None; 2],
            enabled,
        }
    }

    fn write_byte(&mut self, curr_byte: u8) -> std::io::Result<()> {
        if self.prev_bytes == [Some(0x00), Some(0x00)] && curr_byte <= 0x03 {
            self.out.write_all(&[0x00, 0x00, 0x03, curr_byte])?;
            self.prev_bytes = [None; 2];
            return Ok(());
        }

        if let Some(byte) = self.prev_bytes[1] {
            self.out.write_all(&[byte])?;
        }

        self.prev_bytes[1] = self.prev_bytes[0];
        self.prev_bytes[0] = Some(curr_byte);
        Ok(())
    }

    /// Writes a 4-byte start code and the NAL unit header byte, bypassing
    /// emulation prevention.
    fn write_header(&mut self, ref_idc: u8, type_: NaluType) -> std::io::Result<()> {
        self.flush()?;
        self.out
            .write_all(&[0x00, 0x00, 0x00, 0x01, (ref_idc & 0b11) << 5 | (type_ as u8 & 0x1f)])
    }

    fn has_data_pending(&self) -> bool {
        self.prev_bytes.iter().any(Option::is_some)
    }
}

impl<W: Write> Write for EmulationPrevention<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if !self.enabled {
            self.out.write_all(buf)?;
            return Ok(buf.len());
        }

        for byte in buf {
            self.write_byte(*byte)?;
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if let Some(byte) = self.prev_bytes[1].take() {
            self.out.write_all(&[byte])?;
        }

        if let Some(byte) = self.prev_bytes[0].take() {
            self.out.write_all(&[byte])?;
        }

        self.out.flush()
    }
}

impl<W: Write> Drop for EmulationPrevention<W> {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            log::error!("Unable to flush pending bytes {e:?}");
        }
    }
}

#[derive(Error, Debug)]
pub enum NaluWriterError {
    #[error("value increment caused value overflow")]
    Overflow,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    BitWriterError(#[from] BitWriterError),
}

pub type NaluWriterResult<T> = std::result::Result<T, NaluWriterError>;

/// Writes H.264 syntax elements, optionally with emulation prevention.
pub struct NaluWriter<W: Write>(BitWriter<EmulationPrevention<W>>);

impl<W: Write> NaluWriter<W> {
    pub fn new(writer: W, ep_enabled: bool) -> Self {
        Self(BitWriter::new(EmulationPrevention::new(writer, ep_enabled)))
    }

    /// `f(n)`: a fixed size field of up to 32 bits.
    pub fn write_f<T: Into<u32>>(&mut self, bits: usize, value: T) -> NaluWriterResult<usize> {
        Ok(self.0.write_f(bits, value)?)
    }

    /// `u(n)`, same encoding as `f(n)`.
    pub fn write_u<T: Into<u32>>(&mut self, bits: usize, value: T) -> NaluWriterResult<usize> {
        self.write_f(bits, value)
    }

    /// `ue(v)`: unsigned Exp-Golomb.
    pub fn write_ue<T: Into<u32>>(&mut self, value: T) -> NaluWriterResult<()> {
        let value = value.into().checked_add(1).ok_or(NaluWriterError::Overflow)?;
        let bits = 32 - value.leading_zeros() as usize;

        self.write_f(bits - 1, 0u32)?;
        self.write_f(bits, value)?;
        Ok(())
    }

    /// `se(v)`: signed Exp-Golomb, positive values first.
    pub fn write_se<T: Into<i32>>(&mut self, value: T) -> NaluWriterResult<()> {
        let value: i32 = value.into();
        let abs_value = value.unsigned_abs();

        if value <= 0 {
            self.write_ue(2 * abs_value)
        } else {
            self.write_ue(2 * abs_value - 1)
        }
    }

    /// Starts a new NAL unit. Any pending bits are flushed first.
    pub fn write_header(&mut self, ref_idc: u8, type_: NaluType) -> NaluWriterResult<()> {
        self.0.flush()?;
        self.0.inner_mut().write_header(ref_idc, type_)?;
        Ok(())
    }

    /// `rbsp_trailing_bits()`: a stop bit and zeros up to the byte boundary.
    pub fn write_trailing_bits(&mut self) -> NaluWriterResult<()> {
        self.write_f(1, true)?;

        while !self.aligned() {
            self.write_f(1, false)?;
        }

        Ok(())
    }

    /// Returns `true` if some data was not written out yet.
    pub fn has_data_pending(&self) -> bool {
        self.0.has_data_pending() || self.0.inner().has_data_pending()
    }

    /// Returns `true` if the next bit starts a byte.
    pub fn aligned(&self) -> bool {
        !self.0.has_data_pending()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::h264::nalu_reader::NaluReader;

    fn single_ue(value: u32) -> Vec<u8> {
        let mut buf = Vec::<u8>::new();
        {
            let mut writer = NaluWriter::new(&mut buf, false);
            writer.write_ue(value).unwrap();
        }
        buf
    }

    #[test]
    fn first_codewords() {
        assert_eq!(single_ue(0), vec![0b10000000u8]);
        assert_eq!(single_ue(1), vec![0b01000000u8]);
        assert_eq!(single_ue(2), vec![0b01100000u8]);
        assert_eq!(single_ue(3), vec![0b00100000u8]);
        assert_eq!(single_ue(7), vec![0b00010000u8]);
        assert_eq!(single_ue(9), vec![0b00010100u8]);
    }

    #[test]
    fn ue_overflow() {
        let mut buf = Vec::<u8>::new();
        let mut writer = NaluWriter::new(&mut buf, false);
        assert!(matches!(
            writer.write_ue(u32::MAX),
            Err(NaluWriterError::Overflow)
        ));
    }

    #[test]
    fn read_back_mixed_fields() {
        let mut buf = Vec::<u8>::new();
        {
            let mut writer = NaluWriter::new(&mut buf, false);
            writer.write_ue(10u32).unwrap();
            writer.write_se(-42).unwrap();
            writer.write_u(5, 0b10110u8).unwrap();
            writer.write_se(3).unwrap();
            writer.write_trailing_bits().unwrap();
            assert!(writer.aligned());
        }

        let mut reader = NaluReader::new(&buf);
        assert_eq!(reader.read_ue::<u32>().unwrap(), 10);
        assert_eq!(reader.read_se::<i32>().unwrap(), -42);
        assert_eq!(reader.read_bits::<u8>(5).unwrap(), 0b10110);
        assert_eq!(reader.read_se::<i32>().unwrap(), 3);
        assert!(!reader.has_more_rsbp_data());
    }

    #[test]
    fn header_is_not_escaped() {
        let mut buf = Vec::<u8>::new();
        {
            let mut writer = NaluWriter::new(&mut buf, true);
            writer.write_header(3, NaluType::Sps).unwrap();
            writer.write_f(8, 0x42u8).unwrap();
        }
        assert_eq!(buf, vec![0x00, 0x00, 0x00, 0x01, 0x67, 0x42]);
    }

    #[test]
    fn emulation_prevention() {
        fn check(input: &[u8], bitstream: &[u8]) {
            let mut buf = Vec::<u8>::new();
            {
                let mut writer = NaluWriter::new(&mut buf, true);
                for byte in input {
                    writer.write_f(8, *byte).unwrap();
                }
            }
            assert_eq!(buf, bitstream);

            let mut reader = NaluReader::new(&buf);
            for byte in input {
                assert_eq!(*byte, reader.read_bits::<u8>(8).unwrap());
            }
        }

        check(&[0x00, 0x00, 0x00], &[0x00, 0x00, 0x03, 0x00]);
        check(&[0x00, 0x00, 0x01], &[0x00, 0x00, 0x03, 0x01]);
        check(&[0x00, 0x00, 0x03], &[0x00, 0x00, 0x03, 0x03]);
        check(&[0x00, 0x00, 0x04], &[0x00, 0x00, 0x04]);
        check(&[0x00, 0x00, 0x00, 0x01], &[0x00, 0x00, 0x03, 0x00, 0x01]);
    }
}
