// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::io::Cursor;

use anyhow::anyhow;
use bytes::Buf;
use thiserror::Error;

/// Largest number of bits that can be fetched by a single [`NaluReader::read_bits`] call.
pub const MAX_READ_BITS: usize = 32;

/// A MSB-first bit reader over the RBSP of a NAL unit. Emulation-prevention
/// bytes are dropped as they are met, so the caller only ever sees RBSP bits.
pub struct NaluReader<'a> {
    /// Next unread byte.
    data: Cursor<&'a [u8]>,
    /// Byte currently being consumed. The first unread bit is at position
    /// `8 - num_remaining_bits_in_curr_byte`.
    curr_byte: u32,
    num_remaining_bits_in_curr_byte: usize,
    /// Last two bytes seen, used to spot `00 00 03`.
    prev_two_bytes: u32,
}

#[derive(Debug, Error)]
pub enum GetByteError {
    #[error("reader ran out of bits")]
    OutOfBits,
}

#[derive(Debug, Error)]
pub enum ReadBitsError {
    #[error("more than {MAX_READ_BITS} ({0}) bits were requested")]
    TooManyBytesRequested(usize),
    #[error("failed to advance the current byte")]
    GetByte(#[from] GetByteError),
    #[error("failed to convert read input to target type")]
    ConversionFailed,
}

impl<'a> NaluReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data: Cursor::new(data),
            curr_byte: Default::default(),
            num_remaining_bits_in_curr_byte: Default::default(),
            prev_two_bytes: 0xffff,
        }
    }

    /// Read a single bit from the stream.
    pub fn read_bit(&mut self) -> Result<bool, ReadBitsError> {
        Ok(self.read_bits::<u32>(1)? == 1)
    }

    /// Read up to 32 bits from the stream.
    pub fn read_bits<U: TryFrom<u32>>(&mut self, num_bits: usize) -> Result<U, ReadBitsError> {
        if num_bits > MAX_READ_BITS {
            return Err(ReadBitsError::TooManyBytesRequested(num_bits));
        }

        let mut bits_left = num_bits;
        let mut out = 0u64;

        while self.num_remaining_bits_in_curr_byte < bits_left {
            out |= u64::from(self.curr_byte) << (bits_left - self.num_remaining_bits_in_curr_byte);
            bits_left -= self.num_remaining_bits_in_curr_byte;
            self.update_curr_byte()?;
        }

        out |= u64::from(self.curr_byte >> (self.num_remaining_bits_in_curr_byte - bits_left));
        out &= (1u64 << num_bits) - 1;
        self.num_remaining_bits_in_curr_byte -= bits_left;

        let out = u32::try_from(out).map_err(|_| ReadBitsError::ConversionFailed)?;
        U::try_from(out).map_err(|_| ReadBitsError::ConversionFailed)
    }

    /// Skip `num_bits` bits from the stream.
    pub fn skip_bits(&mut self, mut num_bits: usize) -> Result<(), ReadBitsError> {
        while num_bits > 0 {
            let n = std::cmp::min(num_bits, MAX_READ_BITS);
            self.read_bits::<u32>(n)?;
            num_bits -= n;
        }

        Ok(())
    }

    /// Returns the amount of bits left in the stream
    pub fn num_bits_left(&self) -> usize {
        self.data.remaining() * 8 + self.num_remaining_bits_in_curr_byte
    }

    /// Implements `more_rbsp_data()`.
    pub fn has_more_rsbp_data(&mut self) -> bool {
        if self.num_remaining_bits_in_curr_byte == 0 && self.update_curr_byte().is_err() {
            return false;
        }

        // Past the stop bit only zero bits may follow.
        if (self.curr_byte & ((1 << (self.num_remaining_bits_in_curr_byte - 1)) - 1)) != 0 {
            return true;
        }

        if self.data.chunk().iter().any(|b| *b != 0) {
            return true;
        }

        self.data.advance(self.data.remaining());
        false
    }

    /// Reads an unsigned Exp-Golomb code, `ue(v)`.
    pub fn read_ue<U: TryFrom<u32>>(&mut self) -> anyhow::Result<U> {
        let mut num_bits = 0;

        while !self.read_bit()? {
            num_bits += 1;
            if num_bits > 31 {
                return Err(anyhow!("invalid Exp-Golomb code: too many leading zeros"));
            }
        }

        // 31 leading zeros only encode 2^31 - 1 with an all-zero suffix.
        let value = if num_bits == 31 {
            match self.read_bits::<u32>(num_bits)? {
                0 => (1u32 << 31) - 1,
                _ => return Err(anyhow!("invalid Exp-Golomb code: value overflows 32 bits")),
            }
        } else if num_bits > 0 {
            (1u32 << num_bits) - 1 + self.read_bits::<u32>(num_bits)?
        } else {
            0
        };

        U::try_from(value).map_err(|_| anyhow!("Conversion error"))
    }

    pub fn read_ue_bounded<U: TryFrom<u32>>(&mut self, min: u32, max: u32) -> anyhow::Result<U> {
        let ue = self.read_ue()?;
        if ue > max || ue < min {
            Err(anyhow!(
                "Value out of bounds: expected {} - {}, got {}",
                min,
                max,
                ue
            ))
        } else {
            Ok(U::try_from(ue).map_err(|_| anyhow!("Conversion error"))?)
        }
    }

    pub fn read_ue_max<U: TryFrom<u32>>(&mut self, max: u32) -> anyhow::Result<U> {
        self.read_ue_bounded(0, max)
    }

    /// Reads a signed Exp-Golomb code, `se(v)`. Code `2k` maps to `-k`, code
    /// `2k - 1` maps to `k`.
    pub fn read_se<U: TryFrom<i32>>(&mut self) -> anyhow::Result<U> {
        let ue = i64::from(self.read_ue::<u32>()?);

        let value = if ue % 2 == 0 { -ue / 2 } else { ue / 2 + 1 };
        let value = i32::try_from(value).map_err(|_| anyhow!("Conversion error"))?;

        U::try_from(value).map_err(|_| anyhow!("Conversion error"))
    }

    pub fn read_se_bounded<U: TryFrom<i32>>(&mut self, min: i32, max: i32) -> anyhow::Result<U> {
        let se = self.read_se()?;
        if se < min || se > max {
            Err(anyhow!(
                "Value out of bounds, expected between {}-{}, got {}",
                min,
                max,
                se
            ))
        } else {
            Ok(U::try_from(se).map_err(|_| anyhow!("Conversion error"))?)
        }
    }

    fn get_byte(&mut self) -> Result<u8, GetByteError> {
        if self.data.remaining() == 0 {
            return Err(GetByteError::OutOfBits);
        }

        Ok(self.data.get_u8())
    }

    fn update_curr_byte(&mut self) -> Result<(), GetByteError> {
        let mut byte = self.get_byte()?;

        if (self.prev_two_bytes & 0xffff) == 0 && byte == 0x03 {
            byte = self.get_byte()?;
            // Another epb needs three more bytes.
            self.prev_two_bytes = 0xffff;
        }

        self.num_remaining_bits_in_curr_byte = 8;
        self.prev_two_bytes = ((self.prev_two_bytes & 0xff) << 8) | u32::from(byte);

        self.curr_byte = u32::from(byte);
        Ok(())
    }
}
