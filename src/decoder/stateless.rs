// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Stateless decoders.
//!
//! Stateless here refers to the backend API targeted by these decoders. The decoders themselves do
//! hold the decoding state so the backend doesn't need to: the backend only sees requests of the
//! form "decode this NAL unit into slot X, using slots Y and Z as references".
//!
//! The [`StatelessDecoder`] struct is the basis of all stateless decoders. It is created by
//! combining a codec to a [backend](crate::backend) and the stream it plays.

pub mod h264;

use thiserror::Error;

use crate::bitstream_utils::NalStream;
use crate::decoder::DecoderState;
use crate::decoder::ErrorKind;

/// Error returned by stateless backend methods.
#[derive(Error, Debug)]
pub enum StatelessBackendError {
    #[error("unsupported by the device: {0}")]
    Unsupported(String),
    #[error("not enough resources to proceed with the operation: {0}")]
    OutOfResources(String),
    #[error("submission failed: {0}")]
    Submission(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StatelessBackendError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StatelessBackendError::Unsupported(_) => ErrorKind::Capability,
            StatelessBackendError::OutOfResources(_) => ErrorKind::Resource,
            StatelessBackendError::Submission(_) | StatelessBackendError::Other(_) => {
                ErrorKind::Submission
            }
        }
    }
}

/// Result type returned by stateless backend methods.
pub type StatelessBackendResult<T> = Result<T, StatelessBackendError>;

/// Common trait shared by all stateless video decoder backends, providing codec-independent
/// methods.
pub trait StatelessDecoderBackend {
    /// Image receiving the converted pictures.
    type DisplayTarget;

    /// Converts the picture decoded into DPB slot `slot` into `target`.
    ///
    /// The decode of `slot` has completed when this is called.
    fn convert_picture(
        &mut self,
        slot: usize,
        target: &Self::DisplayTarget,
    ) -> StatelessBackendResult<()>;
}

/// Stateless codecs are identified by a marker type implementing this trait.
pub trait StatelessCodec {
    /// State that needs to be kept during a decoding operation, typed by backend.
    type DecoderState;
}

/// A stateless decoder playing a looping stream through backend `B`.
///
/// The codec-specific operations are implemented in the codec modules, e.g.
/// [`h264`].
pub struct StatelessDecoder<C, B>
where
    C: StatelessCodec,
{
    /// The stream being played.
    stream: NalStream,

    /// Codec-specific state.
    codec: C::DecoderState,

    /// The backend used for hardware acceleration.
    backend: B,

    state: DecoderState,
}

impl<C, B> StatelessDecoder<C, B>
where
    C: StatelessCodec,
{
    pub fn state(&self) -> DecoderState {
        self.state
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn stream(&self) -> &NalStream {
        &self.stream
    }

    /// Marks the decoder as closed. Backend resources are released when the
    /// decoder is dropped.
    pub fn close(&mut self) {
        self.state = DecoderState::Closed;
    }
}
