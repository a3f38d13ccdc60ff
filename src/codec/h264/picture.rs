// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use log::debug;

use crate::codec::h264::parser::Sps;

/// Position of a picture in presentation order.
///
/// Keys compare by GOP cycle first, so every picture of a later GOP sorts
/// after the pictures of an earlier one even when the POC restarts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DisplayKey {
    /// Number of `pic_order_cnt_lsb == 0` pictures seen before, minus one.
    pub cycle: i64,
    /// PicOrderCnt of the picture.
    pub pic_order_cnt: i32,
}

/// Per-picture data handed to the backend along with the slice.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PictureData {
    pub frame_num: u16,
    pub nal_ref_idc: u8,
    pub idr: bool,
    pub idr_pic_id: u16,
    pub pic_order_cnt_lsb: u16,
    pub key: DisplayKey,
}

impl PictureData {
    /// Whether later pictures may refer to this one.
    pub fn is_reference(&self) -> bool {
        self.nal_ref_idc != 0
    }
}

/// Derives the picture order count of frames using `pic_order_cnt_type` 0,
/// 8.2.1.1.
#[derive(Clone, Debug)]
pub struct PicOrderCounter {
    max_pic_order_cnt_lsb: i32,
    prev_pic_order_cnt_lsb: i32,
    prev_pic_order_cnt_msb: i32,
    cycle: i64,
}

impl PicOrderCounter {
    pub fn new(max_pic_order_cnt_lsb: u32) -> Self {
        Self {
            max_pic_order_cnt_lsb: max_pic_order_cnt_lsb as i32,
            prev_pic_order_cnt_lsb: 0,
            prev_pic_order_cnt_msb: 0,
            cycle: 0,
        }
    }

    pub fn from_sps(sps: &Sps) -> Self {
        Self::new(sps.max_pic_order_cnt_lsb())
    }

    pub fn max_pic_order_cnt_lsb(&self) -> u32 {
        self.max_pic_order_cnt_lsb as u32
    }

    pub fn cycle(&self) -> i64 {
        self.cycle
    }

    /// Computes the display key of the next picture in decoding order.
    ///
    /// The MSB state is reset by IDR pictures and only carried over from
    /// reference pictures.
    pub fn next(&mut self, pic_order_cnt_lsb: u16, idr: bool, reference: bool) -> DisplayKey {
        if idr {
            self.prev_pic_order_cnt_lsb = 0;
            self.prev_pic_order_cnt_msb = 0;
        }

        let lsb = i32::from(pic_order_cnt_lsb);
        let prev_lsb = self.prev_pic_order_cnt_lsb;
        let prev_msb = self.prev_pic_order_cnt_msb;
        let max_lsb = self.max_pic_order_cnt_lsb;

        let msb = if lsb < prev_lsb && prev_lsb - lsb >= max_lsb / 2 {
            prev_msb + max_lsb
        } else if lsb > prev_lsb && lsb - prev_lsb > max_lsb / 2 {
            prev_msb - max_lsb
        } else {
            prev_msb
        };

        if lsb == 0 {
            self.cycle += 1;
        }

        if reference {
            self.prev_pic_order_cnt_lsb = lsb;
            self.prev_pic_order_cnt_msb = msb;
        }

        let key = DisplayKey {
            cycle: self.cycle - 1,
            pic_order_cnt: msb + lsb,
        };

        debug!(
            "POC lsb {} (prev lsb {}, msb {}) -> {:?}",
            lsb, prev_lsb, prev_msb, key
        );

        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_wrap() {
        let mut poc = PicOrderCounter::new(256);

        poc.next(0, true, true);
        for lsb in [100, 200] {
            poc.next(lsb, false, true);
        }
        assert_eq!(poc.next(250, false, true).pic_order_cnt, 250);
        assert_eq!(poc.next(4, false, true).pic_order_cnt, 260);
    }

    #[test]
    fn backward_wrap() {
        let mut poc = PicOrderCounter::new(256);

        assert_eq!(poc.next(2, false, true).pic_order_cnt, 2);
        // 200 - 2 > 128: the picture precedes the previous one.
        assert_eq!(poc.next(200, false, false).pic_order_cnt, -56);
    }

    #[test]
    fn half_range_boundaries() {
        // A backward distance of exactly max/2 wraps forward.
        let mut poc = PicOrderCounter::new(16);
        poc.next(8, false, true);
        assert_eq!(poc.next(0, false, true).pic_order_cnt, 16);

        // A forward distance of exactly max/2 does not wrap backward.
        let mut poc = PicOrderCounter::new(16);
        poc.next(0, true, true);
        assert_eq!(poc.next(8, false, true).pic_order_cnt, 8);
    }

    #[test]
    fn cycle_increments_on_zero_lsb() {
        let mut poc = PicOrderCounter::new(256);

        let idr = poc.next(0, true, true);
        assert_eq!(poc.cycle(), 1);
        assert_eq!(idr, DisplayKey { cycle: 0, pic_order_cnt: 0 });

        poc.next(2, false, true);
        poc.next(4, false, true);
        assert_eq!(poc.cycle(), 1);

        // A new GOP restarts the POC but sorts after the previous one.
        let next_idr = poc.next(0, true, true);
        assert_eq!(poc.cycle(), 2);
        assert_eq!(next_idr.pic_order_cnt, 0);
        assert!(next_idr > DisplayKey { cycle: 0, pic_order_cnt: 4 });
    }

    #[test]
    fn non_reference_pictures_do_not_move_msb() {
        let mut poc = PicOrderCounter::new(16);

        poc.next(0, true, true);
        poc.next(6, false, true);
        poc.next(12, false, true);
        // Wraps, but is not a reference.
        assert_eq!(poc.next(2, false, false).pic_order_cnt, 18);
        // Still relative to 12.
        assert_eq!(poc.next(14, false, true).pic_order_cnt, 14);
    }

    #[test]
    fn idr_resets_prev_values() {
        let mut poc = PicOrderCounter::new(256);

        poc.next(0, true, true);
        poc.next(120, false, true);
        poc.next(240, false, true);
        assert_eq!(poc.next(4, false, true).pic_order_cnt, 260);
        assert_eq!(poc.next(0, true, true).pic_order_cnt, 0);
        assert_eq!(poc.next(2, false, true).pic_order_cnt, 2);
    }
}
