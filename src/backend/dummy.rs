// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This file contains a dummy backend whose only purpose is to let the decoder
//! run so we can test it in isolation. Every request is recorded so tests can
//! check what the hardware would have been asked to do.

use std::cell::RefCell;
use std::rc::Rc;

use crate::codec::h264::picture::DisplayKey;
use crate::decoder::stateless::StatelessBackendError;
use crate::decoder::stateless::StatelessBackendResult;
use crate::decoder::stateless::StatelessDecoderBackend;

/// A request received by the dummy backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackendCall {
    NewSequence {
        coded_width: u32,
        coded_height: u32,
        num_slots: usize,
    },
    Decode {
        setup: usize,
        references: Vec<usize>,
        frame_num: u16,
        key: DisplayKey,
        /// Size of the bitstream buffer, start code included.
        size: usize,
        /// CRC32 of the bitstream buffer.
        crc: u32,
    },
    Convert {
        slot: usize,
        target: u32,
    },
}

pub type CallLog = Rc<RefCell<Vec<BackendCall>>>;

/// Dummy backend that can be used for any codec.
pub(crate) struct Backend {
    pub calls: CallLog,
    /// Whether the simulated device decodes into the DPB images directly.
    pub dpb_and_output_coincide: bool,
    pub max_dpb_slots: usize,
    /// Index of the decode request that fails to submit, if any.
    pub fail_decode_at: Option<usize>,
    pub(crate) num_slots: usize,
    pub(crate) num_decodes: usize,
}

impl Backend {
    pub(crate) fn new() -> Self {
        Self {
            calls: Default::default(),
            dpb_and_output_coincide: true,
            max_dpb_slots: 17,
            fail_decode_at: None,
            num_slots: 0,
            num_decodes: 0,
        }
    }

    pub(crate) fn record(&self, call: BackendCall) {
        self.calls.borrow_mut().push(call);
    }

    /// Slots converted so far, in order.
    pub fn converted_slots(&self) -> Vec<usize> {
        self.calls
            .borrow()
            .iter()
            .filter_map(|call| match call {
                BackendCall::Convert { slot, .. } => Some(*slot),
                _ => None,
            })
            .collect()
    }

    /// Display keys of the decoded pictures, in decoding order.
    pub fn decoded_keys(&self) -> Vec<DisplayKey> {
        self.calls
            .borrow()
            .iter()
            .filter_map(|call| match call {
                BackendCall::Decode { key, .. } => Some(*key),
                _ => None,
            })
            .collect()
    }
}

impl StatelessDecoderBackend for Backend {
    type DisplayTarget = u32;

    fn convert_picture(&mut self, slot: usize, target: &u32) -> StatelessBackendResult<()> {
        if slot >= self.num_slots {
            return Err(StatelessBackendError::Other(anyhow::anyhow!(
                "slot {} out of {}",
                slot,
                self.num_slots
            )));
        }

        self.record(BackendCall::Convert {
            slot,
            target: *target,
        });
        Ok(())
    }
}
