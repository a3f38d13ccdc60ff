// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Hardware-accelerated playback of looping H.264 streams.
//!
//! A [`session::SessionManager`] owns one [`session::Session`] per stream. Each session parses
//! the stream's parameter sets, creates a hardware decode session from them, and on every
//! `process(dt)` tick decodes ahead of display and converts the next picture in display order
//! into an RGBA target image.
//!
//! The codec logic lives in [`codec::h264`] and [`decoder::stateless::h264`] and is independent
//! of the hardware, which is reached through the backend traits of [`decoder::stateless`]. The
//! Vulkan Video backend is enabled by the `vulkan` feature.

pub mod backend;
pub mod bitstream_utils;
pub mod codec;
pub mod decoder;
pub mod session;

#[cfg(feature = "vulkan")]
pub use ash;

/// Rounds `value` up to a multiple of `alignment`. An alignment of 0 leaves
/// `value` untouched.
pub fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment == 0 {
        return value;
    }

    value.div_ceil(alignment) * alignment
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitstream_size_alignment() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(1000, 64), 1024);
        assert_eq!(align_up(13, 0), 13);
    }
}
