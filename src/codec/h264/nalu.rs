// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::io::Cursor;

use enumn::N;
use thiserror::Error;

/// Annex B start code prefix, `00 00 01`.
pub const START_CODE: [u8; 3] = [0x00, 0x00, 0x01];

#[derive(N, Debug, PartialEq, Eq, Clone, Copy)]
pub enum NaluType {
    Unknown = 0,
    Slice = 1,
    SliceDpa = 2,
    SliceDpb = 3,
    SliceDpc = 4,
    SliceIdr = 5,
    Sei = 6,
    Sps = 7,
    Pps = 8,
    AuDelimiter = 9,
    SeqEnd = 10,
    StreamEnd = 11,
    FillerData = 12,
    SpsExt = 13,
    PrefixUnit = 14,
    SubsetSps = 15,
    DepthSps = 16,
    SliceAux = 19,
    SliceExt = 20,
    SliceDepth = 21,
}

impl NaluType {
    /// Whether the decoder acts on this type. Everything else is skipped.
    pub fn is_decodable(&self) -> bool {
        matches!(
            self,
            NaluType::Sps | NaluType::Pps | NaluType::Slice | NaluType::SliceIdr
        )
    }

    pub fn is_slice(&self) -> bool {
        matches!(self, NaluType::Slice | NaluType::SliceIdr)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NaluError {
    #[error("no start code found")]
    NoStartCode,
    #[error("NAL unit at offset {0} is shorter than a start code and a header")]
    Truncated(usize),
    #[error("forbidden_zero_bit is set in the NAL unit at offset {0}")]
    ForbiddenBit(usize),
}

/// The one byte H.264 NAL unit header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NaluHeader {
    pub forbidden_bit: bool,
    /// 0 for non-reference pictures.
    pub ref_idc: u8,
    pub type_: NaluType,
    pub idr_pic_flag: bool,
}

impl NaluHeader {
    pub const LEN: usize = 1;

    pub fn parse(byte: u8) -> Self {
        let type_ = NaluType::n(byte & 0x1f).unwrap_or(NaluType::Unknown);

        Self {
            forbidden_bit: byte & 0x80 != 0,
            ref_idc: (byte & 0x60) >> 5,
            type_,
            idr_pic_flag: matches!(type_, NaluType::SliceIdr),
        }
    }
}

/// Returns the offset of the first `00 00 01` at or after `from`.
pub fn find_start_code(data: &[u8], from: usize) -> Option<usize> {
    data.get(from..)?
        .windows(START_CODE.len())
        .position(|window| window == START_CODE)
        .map(|pos| from + pos)
}

/// A NAL unit borrowed from the buffer it was found in.
#[derive(Debug, Clone)]
pub struct Nalu<'a> {
    pub header: NaluHeader,
    /// Offset of the start code in the containing buffer.
    pub offset: usize,
    /// Start code, header and payload.
    data: &'a [u8],
}

impl<'a> Nalu<'a> {
    /// Builds the NAL unit whose start code sits at `offset`, with the next
    /// start code (or the end of the buffer) at `next`. Trailing zero bytes
    /// belong to the next start code and are dropped.
    pub fn from_span(buf: &'a [u8], offset: usize, next: usize) -> Result<Self, NaluError> {
        let header_pos = offset + START_CODE.len();
        let mut end = next;
        while end > header_pos && buf[end - 1] == 0x00 {
            end -= 1;
        }

        if end < header_pos + NaluHeader::LEN {
            return Err(NaluError::Truncated(offset));
        }

        let header = NaluHeader::parse(buf[header_pos]);
        if header.forbidden_bit {
            return Err(NaluError::ForbiddenBit(offset));
        }

        Ok(Self {
            header,
            offset,
            data: &buf[offset..end],
        })
    }

    /// Reads the next NAL unit from a non-looping cursor.
    pub fn next(cursor: &mut Cursor<&'a [u8]>) -> Result<Self, NaluError> {
        let buf = *cursor.get_ref();
        let pos = usize::try_from(cursor.position()).map_err(|_| NaluError::NoStartCode)?;

        let offset = find_start_code(buf, pos).ok_or(NaluError::NoStartCode)?;
        let next = find_start_code(buf, offset + START_CODE.len()).unwrap_or(buf.len());

        cursor.set_position(next as u64);

        Self::from_span(buf, offset, next)
    }

    /// The start code followed by the NAL unit, as handed to the accelerator.
    pub fn with_start_code(&self) -> &'a [u8] {
        self.data
    }

    /// The header byte and payload, without the start code.
    pub fn payload(&self) -> &'a [u8] {
        &self.data[START_CODE.len()..]
    }

    /// The payload after the header byte.
    pub fn rbsp(&self) -> &'a [u8] {
        &self.data[START_CODE.len() + NaluHeader::LEN..]
    }

    /// Size of the span including the start code.
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

impl AsRef<[u8]> for Nalu<'_> {
    fn as_ref(&self) -> &[u8] {
        self.payload()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_fields() {
        let header = NaluHeader::parse(0x67);
        assert!(!header.forbidden_bit);
        assert_eq!(header.ref_idc, 3);
        assert_eq!(header.type_, NaluType::Sps);

        let header = NaluHeader::parse(0x65);
        assert_eq!(header.type_, NaluType::SliceIdr);
        assert!(header.idr_pic_flag);

        let header = NaluHeader::parse(0x01);
        assert_eq!(header.ref_idc, 0);
        assert_eq!(header.type_, NaluType::Slice);

        // Reserved types are carried as unknown rather than rejected.
        assert_eq!(NaluHeader::parse(0x17).type_, NaluType::Unknown);
        assert!(NaluHeader::parse(0x80 | 0x07).forbidden_bit);
    }

    #[test]
    fn split_annex_b() {
        const STREAM: [u8; 15] = [
            0x00, 0x00, 0x00, 0x01, 0x67, 0xaa, 0x00, 0x00, 0x01, 0x68, 0xbb, 0x00, 0x00, 0x01,
            0x06,
        ];

        let mut cursor = Cursor::new(&STREAM[..]);

        let sps = Nalu::next(&mut cursor).unwrap();
        assert_eq!(sps.offset, 1);
        assert_eq!(sps.header.type_, NaluType::Sps);
        assert_eq!(sps.payload(), &[0x67, 0xaa]);

        let pps = Nalu::next(&mut cursor).unwrap();
        assert_eq!(pps.offset, 6);
        assert_eq!(pps.with_start_code(), &[0x00, 0x00, 0x01, 0x68, 0xbb]);
        assert_eq!(pps.rbsp(), &[0xbb]);

        let sei = Nalu::next(&mut cursor).unwrap();
        assert_eq!(sei.header.type_, NaluType::Sei);
        assert_eq!(sei.size(), 4);

        assert_eq!(Nalu::next(&mut cursor).unwrap_err(), NaluError::NoStartCode);
    }

    #[test]
    fn truncated_nalu() {
        let buf = [0x00, 0x00, 0x01, 0x00, 0x00, 0x01, 0x65];
        assert_eq!(Nalu::from_span(&buf, 0, 3).unwrap_err(), NaluError::Truncated(0));
        assert!(Nalu::from_span(&buf, 3, buf.len()).is_ok());
    }
}
