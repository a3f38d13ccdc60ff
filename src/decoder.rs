// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decoding of looping H.264 elementary streams into backend-owned pictures.
//!
//! The [`stateless`] module contains the decoder proper. This module holds
//! what is shared between the decoder and the [sessions](crate::session)
//! driving it: the error taxonomy and the decoder state machine.

pub mod stateless;

use thiserror::Error;

use crate::bitstream_utils::NalStreamError;
use crate::decoder::stateless::StatelessBackendError;
use crate::session::SessionId;

/// Broad classes of failures, telling the caller what can be done about
/// them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The device cannot decode this stream. Reported at session creation.
    Capability,
    /// The stream cannot be decoded. The session is dead.
    StreamMalformed,
    /// Memory allocation or binding failed.
    Resource,
    /// Command submission or completion wait failed. The session should be
    /// closed and created again.
    Submission,
    /// The caller referred to a session that does not exist.
    Usage,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("slice found before both an SPS and a PPS")]
    MissingParameterSets,
    #[error("stream error: {0}")]
    Stream(#[from] NalStreamError),
    #[error(transparent)]
    Parse(#[from] anyhow::Error),
    #[error("no picture could be decoded from a full pass over the stream")]
    NoPictures,
    #[error("unsupported stream: {0}")]
    UnsupportedStream(String),
    #[error(transparent)]
    Backend(#[from] StatelessBackendError),
    #[error("the decoder is {0:?} and cannot be used anymore")]
    InvalidState(DecoderState),
    #[error("no session with id {0}")]
    UnknownSession(SessionId),
}

impl DecodeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DecodeError::MissingParameterSets
            | DecodeError::Stream(_)
            | DecodeError::Parse(_)
            | DecodeError::NoPictures
            | DecodeError::InvalidState(_) => ErrorKind::StreamMalformed,
            DecodeError::UnsupportedStream(_) => ErrorKind::Capability,
            DecodeError::Backend(e) => e.kind(),
            DecodeError::UnknownSession(_) => ErrorKind::Usage,
        }
    }

    /// Whether the decoder that returned this error can be used again.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, DecodeError::UnknownSession(_))
    }
}

/// Lifecycle of a decoder.
///
/// ```text
/// Uninitialized -> ParsingHeaders -> Ready -> Decoding <-> Displaying -> Closed
/// ```
///
/// Any fatal error moves the decoder to `Failed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DecoderState {
    #[default]
    Uninitialized,
    ParsingHeaders,
    /// The hardware session exists and no picture was decoded yet.
    Ready,
    Decoding,
    Displaying,
    Closed,
    Failed,
}

impl DecoderState {
    /// Whether pictures can still be decoded or displayed.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            DecoderState::Ready | DecoderState::Decoding | DecoderState::Displaying
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::h264::nalu::NaluError;

    #[test]
    fn error_classes() {
        assert_eq!(
            DecodeError::MissingParameterSets.kind(),
            ErrorKind::StreamMalformed
        );
        assert_eq!(
            DecodeError::from(NalStreamError::Nalu(NaluError::Truncated(4))).kind(),
            ErrorKind::StreamMalformed
        );
        assert_eq!(
            DecodeError::from(anyhow::anyhow!("bad SPS")).kind(),
            ErrorKind::StreamMalformed
        );
        assert_eq!(
            DecodeError::UnsupportedStream("fields".into()).kind(),
            ErrorKind::Capability
        );
        assert_eq!(
            DecodeError::from(StatelessBackendError::Unsupported("no coincide".into())).kind(),
            ErrorKind::Capability
        );
        assert_eq!(
            DecodeError::from(StatelessBackendError::OutOfResources("dpb".into())).kind(),
            ErrorKind::Resource
        );
        assert_eq!(
            DecodeError::from(StatelessBackendError::Submission("lost".into())).kind(),
            ErrorKind::Submission
        );
    }

    #[test]
    fn active_states() {
        assert!(!DecoderState::Uninitialized.is_active());
        assert!(DecoderState::Ready.is_active());
        assert!(DecoderState::Displaying.is_active());
        assert!(!DecoderState::Failed.is_active());
        assert!(!DecoderState::Closed.is_active());
    }
}
