// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Playback sessions.
//!
//! A [`Session`] plays one looping stream at a fixed cadence: every time its
//! frame interval elapses it decodes ahead and converts the next picture in
//! display order into its display target. Sessions are owned by a
//! [`SessionManager`] and referred to by [`SessionId`].

use std::fmt;
use std::time::Duration;

use log::info;
use log::warn;

use crate::bitstream_utils::NalStream;
use crate::decoder::stateless::h264::StatelessH264DecoderBackend;
use crate::decoder::stateless::h264::H264;
use crate::decoder::stateless::StatelessBackendError;
use crate::decoder::stateless::StatelessBackendResult;
use crate::decoder::stateless::StatelessDecoder;
use crate::decoder::stateless::StatelessDecoderBackend;
use crate::decoder::DecodeError;
use crate::decoder::DecoderState;

/// Playback rate used when the stream does not say otherwise.
pub const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_nanos(1_000_000_000 / 30);

/// Per-session settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    /// Time between two displayed pictures.
    pub frame_interval: Duration,
    /// Use the frame rate of the VUI timing info instead of
    /// `frame_interval`, when the stream carries one.
    pub use_stream_timing: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            frame_interval: DEFAULT_FRAME_INTERVAL,
            use_stream_timing: false,
        }
    }
}

/// Settings shared by every session of a manager.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Maximum number of sessions alive at once. Also sizes the descriptor
    /// pool of the conversion pipeline.
    pub max_sessions: usize,
    pub session: SessionConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_sessions: 4,
            session: Default::default(),
        }
    }
}

/// Handle to a session of a [`SessionManager`].
///
/// Handles are never reused, so a handle to a closed session stays invalid
/// even after its storage has been given to a new session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId {
    index: u32,
    generation: u32,
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

/// One stream being played.
pub struct Session<B>
where
    B: StatelessH264DecoderBackend,
{
    decoder: StatelessDecoder<H264, B>,
    target: Option<B::DisplayTarget>,
    frame_interval: Duration,
    /// Time left before the next picture is due.
    countdown: Duration,
    frames_displayed: u64,
}

impl<B> Session<B>
where
    B: StatelessH264DecoderBackend,
{
    /// Creates the decoder for `stream` and initializes it. No session exists
    /// if this fails.
    pub fn new(stream: NalStream, backend: B, config: &SessionConfig) -> Result<Self, DecodeError> {
        let mut decoder = StatelessDecoder::<H264, B>::new(stream, backend);
        decoder.initialize()?;

        let frame_interval = match decoder.frame_interval() {
            Some(interval) if config.use_stream_timing && !interval.is_zero() => interval,
            _ => config.frame_interval,
        };

        Ok(Self {
            decoder,
            target: None,
            frame_interval,
            // The first picture is due on the first call to `process`.
            countdown: Duration::ZERO,
            frames_displayed: 0,
        })
    }

    pub fn assign_display_target(&mut self, target: B::DisplayTarget) {
        self.target = Some(target);
    }

    pub fn display_target(&self) -> Option<&B::DisplayTarget> {
        self.target.as_ref()
    }

    /// Advances the playback clock by `dt`. When the current picture has been
    /// shown long enough, decodes ahead and displays the next one.
    ///
    /// Returns `true` if a new picture was displayed.
    pub fn process(&mut self, dt: Duration) -> Result<bool, DecodeError> {
        if !self.decoder.state().is_active() {
            return Err(DecodeError::InvalidState(self.decoder.state()));
        }

        if dt < self.countdown {
            self.countdown -= dt;
            return Ok(false);
        }
        self.countdown = self.frame_interval;

        self.decoder.decode_ahead()?;
        let displayed = self.decoder.display(self.target.as_ref())?.is_some();
        if displayed {
            self.frames_displayed += 1;
        }

        Ok(displayed)
    }

    pub fn close(&mut self) {
        self.decoder.close();
    }

    pub fn width(&self) -> u32 {
        self.decoder.width()
    }

    pub fn height(&self) -> u32 {
        self.decoder.height()
    }

    pub fn state(&self) -> DecoderState {
        self.decoder.state()
    }

    /// DPB slot of the picture displayed last. The converted picture lives in
    /// the display target.
    pub fn displayed_slot(&self) -> Option<usize> {
        self.decoder.displayed_slot()
    }

    pub fn frames_displayed(&self) -> u64 {
        self.frames_displayed
    }

    pub fn frame_interval(&self) -> Duration {
        self.frame_interval
    }

    pub fn decoder(&self) -> &StatelessDecoder<H264, B> {
        &self.decoder
    }
}

struct Entry<B>
where
    B: StatelessH264DecoderBackend,
{
    generation: u32,
    session: Option<Session<B>>,
}

/// Owns every session and drives them from a single thread.
///
/// Sessions are stored in an arena indexed by [`SessionId`]. Backends are
/// created by `factory`, which usually shares device-wide resources between
/// the sessions.
pub struct SessionManager<B, F>
where
    B: StatelessH264DecoderBackend,
    F: FnMut() -> StatelessBackendResult<B>,
{
    config: ManagerConfig,
    factory: F,
    entries: Vec<Entry<B>>,
}

impl<B, F> SessionManager<B, F>
where
    B: StatelessH264DecoderBackend,
    F: FnMut() -> StatelessBackendResult<B>,
{
    pub fn new(config: ManagerConfig, factory: F) -> Self {
        Self {
            config,
            factory,
            entries: Vec::new(),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Number of sessions not closed yet, including failed ones.
    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.session.is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Creates a session playing `stream`. Fails without leaving anything
    /// behind if the device cannot decode the stream.
    pub fn create_session(&mut self, stream: impl Into<Vec<u8>>) -> Result<SessionId, DecodeError> {
        if self.len() >= self.config.max_sessions {
            return Err(StatelessBackendError::OutOfResources(format!(
                "all {} sessions in use",
                self.config.max_sessions
            ))
            .into());
        }

        let backend = (self.factory)()?;
        let session = Session::new(NalStream::new(stream), backend, &self.config.session)?;

        let index = match self.entries.iter().position(|entry| entry.session.is_none()) {
            Some(index) => index,
            None => {
                self.entries.push(Entry {
                    generation: 0,
                    session: None,
                });
                self.entries.len() - 1
            }
        };

        let entry = &mut self.entries[index];
        entry.session = Some(session);
        let id = SessionId {
            index: index as u32,
            generation: entry.generation,
        };

        info!("Created session {}", id);
        Ok(id)
    }

    pub fn session(&self, id: SessionId) -> Option<&Session<B>> {
        self.entries
            .get(id.index as usize)
            .filter(|entry| entry.generation == id.generation)
            .and_then(|entry| entry.session.as_ref())
    }

    pub fn session_mut(&mut self, id: SessionId) -> Option<&mut Session<B>> {
        self.entries
            .get_mut(id.index as usize)
            .filter(|entry| entry.generation == id.generation)
            .and_then(|entry| entry.session.as_mut())
    }

    pub fn assign_display_target(
        &mut self,
        id: SessionId,
        target: <B as StatelessDecoderBackend>::DisplayTarget,
    ) -> Result<(), DecodeError> {
        self.session_mut(id)
            .ok_or(DecodeError::UnknownSession(id))?
            .assign_display_target(target);
        Ok(())
    }

    /// Advances session `id` by `dt`.
    pub fn process_session(&mut self, id: SessionId, dt: Duration) -> Result<bool, DecodeError> {
        self.session_mut(id)
            .ok_or(DecodeError::UnknownSession(id))?
            .process(dt)
    }

    /// Advances every live session by `dt`. A failing session is reported
    /// and left in its failed state; the others keep playing.
    pub fn process(&mut self, dt: Duration) {
        for (index, entry) in self.entries.iter_mut().enumerate() {
            let Some(session) = entry.session.as_mut() else {
                continue;
            };

            if !session.state().is_active() {
                continue;
            }

            if let Err(e) = session.process(dt) {
                warn!(
                    "Session {}v{} failed ({:?}): {}",
                    index,
                    entry.generation,
                    e.kind(),
                    e
                );
            }
        }
    }

    /// Closes session `id` and releases its resources.
    pub fn close(&mut self, id: SessionId) -> Result<(), DecodeError> {
        let entry = self
            .entries
            .get_mut(id.index as usize)
            .filter(|entry| entry.generation == id.generation)
            .ok_or(DecodeError::UnknownSession(id))?;

        let mut session = entry.session.take().ok_or(DecodeError::UnknownSession(id))?;
        session.close();
        entry.generation = entry.generation.wrapping_add(1);

        info!(
            "Closed session {} after {} frames",
            id,
            session.frames_displayed()
        );
        Ok(())
    }

    /// Ids of the sessions not closed yet.
    pub fn ids(&self) -> impl Iterator<Item = SessionId> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.session.is_some())
            .map(|(index, entry)| SessionId {
                index: index as u32,
                generation: entry.generation,
            })
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::backend::dummy::Backend;
    use crate::backend::dummy::BackendCall;
    use crate::backend::dummy::CallLog;
    use crate::codec::h264::parser::Profile;
    use crate::codec::h264::parser::SpsBuilder;
    use crate::codec::h264::test_streams::StreamBuilder;
    use crate::decoder::ErrorKind;

    const FRAME: Duration = DEFAULT_FRAME_INTERVAL;

    fn idr_p_p() -> Vec<u8> {
        StreamBuilder::new(800, 600, 1)
            .parameter_sets()
            .idr(0)
            .p(1, 2)
            .p(2, 4)
            .build()
    }

    /// A manager whose backends all log into the returned call log.
    fn manager(
        config: ManagerConfig,
    ) -> (
        SessionManager<Backend, impl FnMut() -> StatelessBackendResult<Backend>>,
        CallLog,
    ) {
        let calls: CallLog = Rc::new(RefCell::new(Vec::new()));
        let log = Rc::clone(&calls);
        let factory = move || {
            let mut backend = Backend::new();
            backend.calls = Rc::clone(&log);
            Ok(backend)
        };

        (SessionManager::new(config, factory), calls)
    }

    fn converted(calls: &CallLog) -> Vec<(usize, u32)> {
        calls
            .borrow()
            .iter()
            .filter_map(|call| match call {
                BackendCall::Convert { slot, target } => Some((*slot, *target)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn plays_at_a_fixed_cadence() {
        let (mut manager, calls) = manager(Default::default());
        let id = manager.create_session(idr_p_p()).unwrap();
        manager.assign_display_target(id, 3).unwrap();

        let session = manager.session(id).unwrap();
        assert_eq!((session.width(), session.height()), (800, 600));
        assert_eq!(session.state(), DecoderState::Ready);
        assert_eq!(session.frame_interval(), FRAME);

        // First picture right away, then one per interval.
        assert!(manager.process_session(id, Duration::ZERO).unwrap());
        assert!(!manager.process_session(id, FRAME / 2).unwrap());
        assert!(manager.process_session(id, FRAME - FRAME / 2).unwrap());
        assert!(!manager.process_session(id, FRAME / 3).unwrap());
        assert!(manager.process_session(id, FRAME).unwrap());

        assert_eq!(converted(&calls), [(0, 3), (1, 3), (0, 3)]);

        let session = manager.session(id).unwrap();
        assert_eq!(session.frames_displayed(), 3);
        assert_eq!(session.displayed_slot(), Some(0));
        assert_eq!(session.state(), DecoderState::Displaying);
        let key = session
            .decoder()
            .dpb()
            .slot(0)
            .and_then(|slot| slot.key)
            .unwrap();
        assert_eq!(key.pic_order_cnt, 4);
    }

    #[test]
    fn pictures_without_target_are_skipped() {
        let (mut manager, calls) = manager(Default::default());
        let id = manager.create_session(idr_p_p()).unwrap();

        manager.process(FRAME);
        manager.assign_display_target(id, 1).unwrap();
        manager.process(FRAME);

        assert_eq!(converted(&calls), [(1, 1)]);
        assert_eq!(manager.session(id).unwrap().frames_displayed(), 2);
    }

    #[test]
    fn stream_timing() {
        let sps = SpsBuilder::new()
            .profile_idc(Profile::Main)
            .resolution(64, 64)
            .max_num_ref_frames(1)
            .log2_max_pic_order_cnt_lsb_minus4(4)
            .frame_rate(50)
            .build();
        let data = StreamBuilder::with_sps(sps).parameter_sets().idr(0).build();

        let (mut manager, _) = manager(ManagerConfig {
            session: SessionConfig {
                use_stream_timing: true,
                ..Default::default()
            },
            ..Default::default()
        });
        let id = manager.create_session(data.clone()).unwrap();
        assert_eq!(
            manager.session(id).unwrap().frame_interval(),
            Duration::from_millis(20)
        );

        let (mut manager, _) = self::manager(Default::default());
        let id = manager.create_session(data).unwrap();
        assert_eq!(manager.session(id).unwrap().frame_interval(), FRAME);
    }

    #[test]
    fn failed_creation_leaves_no_session() {
        let (mut manager, calls) = manager(Default::default());

        let err = manager
            .create_session(StreamBuilder::new(64, 48, 1).idr(0).build())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StreamMalformed);
        assert!(manager.is_empty());
        assert!(calls.borrow().is_empty());

        let mut manager = SessionManager::new(Default::default(), || {
            let mut backend = Backend::new();
            backend.dpb_and_output_coincide = false;
            Ok(backend)
        });
        let err = manager.create_session(idr_p_p()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Capability);
        assert!(manager.is_empty());
    }

    #[test]
    fn session_limit() {
        let (mut manager, _) = manager(ManagerConfig {
            max_sessions: 2,
            ..Default::default()
        });

        let first = manager.create_session(idr_p_p()).unwrap();
        manager.create_session(idr_p_p()).unwrap();
        let err = manager.create_session(idr_p_p()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Resource);

        manager.close(first).unwrap();
        manager.create_session(idr_p_p()).unwrap();
        assert_eq!(manager.len(), 2);
    }

    #[test]
    fn closed_ids_stay_invalid() {
        let (mut manager, _) = manager(Default::default());

        let first = manager.create_session(idr_p_p()).unwrap();
        manager.close(first).unwrap();
        assert!(manager.session(first).is_none());

        // Same storage, new handle.
        let second = manager.create_session(idr_p_p()).unwrap();
        assert_ne!(first, second);
        assert!(manager.session(second).is_some());

        for err in [
            manager.close(first).unwrap_err(),
            manager.assign_display_target(first, 0).unwrap_err(),
            manager.process_session(first, FRAME).unwrap_err(),
        ] {
            assert!(matches!(err, DecodeError::UnknownSession(id) if id == first));
            assert_eq!(err.kind(), ErrorKind::Usage);
        }

        assert_eq!(manager.ids().collect::<Vec<_>>(), [second]);
    }

    #[test]
    fn failing_session_does_not_stop_the_others() {
        let (mut manager, calls) = manager(Default::default());

        let broken = manager
            .create_session(StreamBuilder::new(64, 48, 1).parameter_sets().build())
            .unwrap();
        let good = manager.create_session(idr_p_p()).unwrap();
        manager.assign_display_target(good, 9).unwrap();

        manager.process(FRAME);
        manager.process(FRAME);

        assert_eq!(manager.session(broken).unwrap().state(), DecoderState::Failed);
        assert_eq!(manager.session(good).unwrap().frames_displayed(), 2);
        assert_eq!(converted(&calls), [(0, 9), (1, 9)]);

        let err = manager.process_session(broken, FRAME).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::InvalidState(DecoderState::Failed)
        ));

        manager.close(broken).unwrap();
        assert_eq!(manager.len(), 1);
    }
}
