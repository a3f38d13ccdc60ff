// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use log::debug;

use crate::codec::h264::picture::DisplayKey;

/// Metadata of one picture slot of the DPB. The picture itself lives in the
/// backend, at the same index.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DpbSlot {
    pub frame_num: u16,
    /// `None` until a picture is decoded into the slot.
    pub key: Option<DisplayKey>,
    /// The picture has been handed out for display.
    pub viewed: bool,
    /// The picture may be referenced by later pictures.
    pub reference: bool,
}

impl DpbSlot {
    /// Whether the slot holds a picture that has not been displayed yet.
    pub fn is_pending(&self) -> bool {
        self.key.is_some() && !self.viewed
    }
}

/// Slots used by one decode operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodeSlots {
    /// The slot the picture is decoded into.
    pub setup: usize,
    /// Slots holding the reference pictures, most recent first. Never
    /// contains `setup`.
    pub references: Vec<usize>,
}

/// A fixed set of `max_num_ref_frames + 1` slots recycled in round-robin
/// order.
#[derive(Clone, Debug)]
pub struct Dpb {
    slots: Vec<DpbSlot>,
    /// Slot the next picture is decoded into.
    cursor: usize,
    /// Number of slots trailing the cursor that hold references.
    active_reference_slots: usize,
}

impl Dpb {
    pub fn new(num_slots: usize) -> Self {
        Self {
            slots: vec![Default::default(); num_slots.max(1)],
            cursor: 0,
            active_reference_slots: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slots(&self) -> &[DpbSlot] {
        &self.slots
    }

    pub fn slot(&self, index: usize) -> Option<&DpbSlot> {
        self.slots.get(index)
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn active_reference_slots(&self) -> usize {
        self.active_reference_slots
    }

    /// Slot the next picture would be decoded into. IDR pictures always
    /// start over from the first slot.
    pub fn next_setup_slot(&self, idr: bool) -> usize {
        if idr {
            0
        } else {
            self.cursor
        }
    }

    /// Picks the slots for decoding the next picture and invalidates the
    /// previous contents of the setup slot.
    pub fn begin_picture(&mut self, idr: bool) -> DecodeSlots {
        if idr {
            self.cursor = 0;
            self.active_reference_slots = 0;
        }

        let n = self.slots.len();
        let setup = self.cursor;
        let references = (1..=self.active_reference_slots)
            .map(|k| (setup + n - k) % n)
            .collect();

        self.slots[setup] = Default::default();

        DecodeSlots { setup, references }
    }

    /// Records the picture decoded into `setup` and advances the cursor if
    /// the picture is a reference.
    pub fn finish_picture(
        &mut self,
        setup: usize,
        frame_num: u16,
        key: DisplayKey,
        reference: bool,
    ) {
        self.slots[setup] = DpbSlot {
            frame_num,
            key: Some(key),
            viewed: false,
            reference,
        };

        if reference {
            let n = self.slots.len();
            self.cursor = (self.cursor + 1) % n;
            self.active_reference_slots = (self.active_reference_slots + 1).min(n - 1);
        }

        debug!(
            "Slot {} <- {:?}, cursor {}, {} reference slots",
            setup, key, self.cursor, self.active_reference_slots
        );
    }

    /// Returns the pending slot that comes first in display order and marks it
    /// as viewed.
    pub fn select_for_display(&mut self) -> Option<usize> {
        let index = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_pending())
            .min_by_key(|(_, slot)| slot.key)
            .map(|(index, _)| index)?;

        self.slots[index].viewed = true;
        Some(index)
    }

    /// Forgets every picture, as when the stream starts over.
    pub fn clear(&mut self) {
        self.slots.fill(Default::default());
        self.cursor = 0;
        self.active_reference_slots = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(pic_order_cnt: i32) -> DisplayKey {
        DisplayKey {
            cycle: 0,
            pic_order_cnt,
        }
    }

    #[test]
    fn idr_resets_cursor() {
        let mut dpb = Dpb::new(3);

        let slots = dpb.begin_picture(true);
        assert_eq!(slots.setup, 0);
        assert!(slots.references.is_empty());
        dpb.finish_picture(0, 0, key(0), true);

        let slots = dpb.begin_picture(false);
        assert_eq!(slots, DecodeSlots { setup: 1, references: vec![0] });
        dpb.finish_picture(1, 1, key(2), true);
        assert_eq!(dpb.cursor(), 2);

        let slots = dpb.begin_picture(true);
        assert_eq!(slots.setup, 0);
        assert!(slots.references.is_empty());
        assert_eq!(dpb.active_reference_slots(), 0);
    }

    #[test]
    fn references_trail_the_cursor() {
        let num_slots = 3;
        let mut dpb = Dpb::new(num_slots);

        dpb.begin_picture(true);
        dpb.finish_picture(0, 0, key(0), true);

        for frame_num in 1..20u16 {
            let slots = dpb.begin_picture(false);

            assert!(!slots.references.contains(&slots.setup));
            assert!(slots.references.len() <= num_slots - 1);
            // The most recent reference is the one decoded just before.
            assert_eq!(slots.references[0], (slots.setup + num_slots - 1) % num_slots);

            let poc = 2 * i32::from(frame_num);
            dpb.finish_picture(slots.setup, frame_num, key(poc), true);
            dpb.select_for_display();
        }

        assert_eq!(dpb.active_reference_slots(), num_slots - 1);
    }

    #[test]
    fn non_reference_pictures_reuse_the_slot() {
        let mut dpb = Dpb::new(2);

        dpb.begin_picture(true);
        dpb.finish_picture(0, 0, key(0), true);

        let slots = dpb.begin_picture(false);
        dpb.finish_picture(slots.setup, 1, key(2), false);
        assert_eq!(dpb.cursor(), 1);
        assert_eq!(dpb.next_setup_slot(false), 1);
        assert_eq!(dpb.active_reference_slots(), 1);
    }

    #[test]
    fn display_selection_is_idempotent() {
        let mut dpb = Dpb::new(3);

        dpb.begin_picture(true);
        dpb.finish_picture(0, 0, key(0), true);
        let slots = dpb.begin_picture(false);
        dpb.finish_picture(slots.setup, 1, key(4), true);
        let slots = dpb.begin_picture(false);
        dpb.finish_picture(slots.setup, 2, key(2), false);

        assert_eq!(dpb.select_for_display(), Some(0));
        assert_eq!(dpb.select_for_display(), Some(2));
        assert_eq!(dpb.select_for_display(), Some(1));
        assert_eq!(dpb.select_for_display(), None);
        assert_eq!(dpb.select_for_display(), None);
    }

    #[test]
    fn later_cycle_sorts_last() {
        let mut dpb = Dpb::new(2);

        dpb.begin_picture(true);
        dpb.finish_picture(0, 0, DisplayKey { cycle: 1, pic_order_cnt: 0 }, true);
        let slots = dpb.begin_picture(false);
        dpb.finish_picture(slots.setup, 3, DisplayKey { cycle: 0, pic_order_cnt: 6 }, true);

        assert_eq!(dpb.select_for_display(), Some(1));
        assert_eq!(dpb.select_for_display(), Some(0));
    }
}
