//! Device session control and interruption handling.
//!
//! A [`SessionCoordinator`] owns the playback and capture controllers and
//! reacts to [`SessionSignal`]s: interruptions pause whatever is running and
//! resume it after a settle delay, configuration changes rebuild the active
//! graphs, and a media services reset rebuilds everything from scratch.
//!
//! Signals may be sent from any thread through a [`SignalSender`]; they are
//! processed on the control thread by [`SessionCoordinator::tick`].

use crate::capture::CaptureController;
use crate::config::EngineConfig;
use crate::graph::GraphError;
use crate::playback::PlaybackController;
use crossbeam_channel::{Receiver, Sender};
use kara_comms::StateListener;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// What the application intends to do with the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCategory {
    Playback,
    PlayAndRecord,
}

/// Non-fatal: callers log it and carry on.
#[derive(Debug, thiserror::Error)]
pub enum SessionConfigError {
    #[error("Cannot set session category {category:?}: {reason}")]
    Category {
        category: SessionCategory,
        reason: String,
    },

    #[error("Cannot change session activation: {0}")]
    Activation(String),
}

/// Platform audio session capability.
pub trait AudioSession: Send {
    fn set_category(&mut self, category: SessionCategory) -> Result<(), SessionConfigError>;

    fn set_active(&mut self, active: bool) -> Result<(), SessionConfigError>;

    /// System output volume, 0.0 to 1.0.
    fn output_level(&self) -> f32;
}

pub type SharedSession = Arc<Mutex<dyn AudioSession>>;

/// Desktop platforms have no session to negotiate; this records the
/// requested state and logs it.
#[derive(Debug, Default)]
pub struct DesktopSession {
    category: Option<SessionCategory>,
    active: bool,
    activations: usize,
}

impl DesktopSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedSession {
        Arc::new(Mutex::new(Self::new()))
    }

    pub const fn category(&self) -> Option<SessionCategory> {
        self.category
    }

    pub const fn is_active(&self) -> bool {
        self.active
    }

    /// Number of inactive to active transitions.
    pub const fn activations(&self) -> usize {
        self.activations
    }
}

impl AudioSession for DesktopSession {
    fn set_category(&mut self, category: SessionCategory) -> Result<(), SessionConfigError> {
        if self.category != Some(category) {
            tracing::debug!("Session category: {:?}", category);
        }
        self.category = Some(category);
        Ok(())
    }

    fn set_active(&mut self, active: bool) -> Result<(), SessionConfigError> {
        if active && !self.active {
            self.activations += 1;
            tracing::debug!("Session activated");
        }
        self.active = active;
        Ok(())
    }

    fn output_level(&self) -> f32 {
        1.0
    }
}

/// The session shared by the playback and capture controllers.
///
/// Each controller holds the session from start to stop. The category is
/// the union of what the holders need (PlayAndRecord wins over Playback)
/// and the session is only deactivated when the last holder lets go.
/// Failures are logged, never returned.
#[derive(Clone)]
pub struct SessionHandle {
    session: SharedSession,
    holders: Arc<Mutex<Holders>>,
}

#[derive(Debug, Default)]
struct Holders {
    playback: bool,
    record: bool,
}

impl Holders {
    fn slot(&mut self, need: SessionCategory) -> &mut bool {
        match need {
            SessionCategory::Playback => &mut self.playback,
            SessionCategory::PlayAndRecord => &mut self.record,
        }
    }

    const fn category(&self) -> Option<SessionCategory> {
        if self.record {
            Some(SessionCategory::PlayAndRecord)
        } else if self.playback {
            Some(SessionCategory::Playback)
        } else {
            None
        }
    }
}

impl SessionHandle {
    pub fn new(session: SharedSession) -> Self {
        Self {
            session,
            holders: Arc::new(Mutex::new(Holders::default())),
        }
    }

    pub const fn session(&self) -> &SharedSession {
        &self.session
    }

    /// Category the current holders need, `None` when nobody holds it.
    pub fn category(&self) -> Option<SessionCategory> {
        self.holders.lock().category()
    }

    /// Hold the session for `need` and activate it.
    pub fn acquire(&self, need: SessionCategory) {
        let mut holders = self.holders.lock();
        *holders.slot(need) = true;
        let mut session = self.session.lock();
        if let Some(category) = holders.category() {
            if let Err(e) = session.set_category(category) {
                tracing::warn!("{}", e);
            }
        }
        if let Err(e) = session.set_active(true) {
            tracing::warn!("{}", e);
        }
    }

    /// Let go of `need`. The remaining holders keep the session active.
    pub fn release(&self, need: SessionCategory) {
        let mut holders = self.holders.lock();
        if !std::mem::take(holders.slot(need)) {
            return;
        }
        let mut session = self.session.lock();
        let result = match holders.category() {
            Some(category) => session.set_category(category),
            None => session.set_active(false),
        };
        if let Err(e) = result {
            tracing::warn!("{}", e);
        }
    }

    /// Activate again after an interruption, restoring the holders' category.
    pub fn reactivate(&self) {
        let holders = self.holders.lock();
        let mut session = self.session.lock();
        if let Some(category) = holders.category() {
            if let Err(e) = session.set_category(category) {
                tracing::warn!("{}", e);
            }
        }
        if let Err(e) = session.set_active(true) {
            tracing::warn!("{}", e);
        }
    }
}

pub(crate) fn acquire(session: Option<&SessionHandle>, need: SessionCategory) {
    if let Some(session) = session {
        session.acquire(need);
    }
}

pub(crate) fn release(session: Option<&SessionHandle>, need: SessionCategory) {
    if let Some(session) = session {
        session.release(need);
    }
}

/// Events from the platform (or the device) that affect running graphs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionSignal {
    InterruptionBegan,
    InterruptionEnded,
    ConfigurationChanged,
    MediaServicesReset,
}

pub type SignalSender = Sender<SessionSignal>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InterruptionState {
    #[default]
    NotInterrupted,
    Interrupting,
}

/// A controller the coordinator can suspend and rebuild.
pub trait Interruptible {
    fn label(&self) -> &'static str;

    /// Playing, recording or resuming.
    fn is_running(&self) -> bool;

    /// Anything but stopped.
    fn is_active(&self) -> bool;

    fn suspend(&mut self) -> Result<(), GraphError>;

    fn resume(&mut self) -> Result<(), GraphError>;

    /// Confirm a pending resume once the runtime renders again.
    fn poll(&mut self);

    /// Rebuild connections after a device configuration change.
    fn rebuild(&mut self) -> Result<(), GraphError>;

    /// Rebuild from a fully reset graph after the media services went away.
    fn reset_all(&mut self) -> Result<(), GraphError>;
}

fn clients<'a>(
    playback: &'a mut Option<PlaybackController>,
    capture: &'a mut Option<CaptureController>,
) -> [Option<&'a mut dyn Interruptible>; 2] {
    [
        playback.as_mut().map(|c| c as &mut dyn Interruptible),
        capture.as_mut().map(|c| c as &mut dyn Interruptible),
    ]
}

pub struct SessionCoordinator {
    playback: Option<PlaybackController>,
    capture: Option<CaptureController>,
    session: SessionHandle,
    settle_delay: Duration,
    signals: (Sender<SessionSignal>, Receiver<SessionSignal>),
    state: InterruptionState,
    pending_configuration: bool,
    /// Controllers paused by the current interruption, by client index
    suspended: [bool; 2],
    resume_at: Option<Instant>,
    listener: Option<Box<dyn StateListener<InterruptionState>>>,
}

impl SessionCoordinator {
    pub fn new(session: SharedSession, config: &EngineConfig) -> Self {
        Self {
            playback: None,
            capture: None,
            session: SessionHandle::new(session),
            settle_delay: config.settle_delay(),
            signals: crossbeam_channel::unbounded(),
            state: InterruptionState::NotInterrupted,
            pending_configuration: false,
            suspended: [false; 2],
            resume_at: None,
            listener: None,
        }
    }

    pub fn set_playback(&mut self, mut controller: PlaybackController) {
        controller.set_session(self.session.clone());
        self.playback = Some(controller);
    }

    pub fn set_capture(&mut self, mut controller: CaptureController) {
        controller.set_session(self.session.clone());
        self.capture = Some(controller);
    }

    pub const fn playback(&self) -> Option<&PlaybackController> {
        self.playback.as_ref()
    }

    pub fn playback_mut(&mut self) -> Option<&mut PlaybackController> {
        self.playback.as_mut()
    }

    pub const fn capture(&self) -> Option<&CaptureController> {
        self.capture.as_ref()
    }

    pub fn capture_mut(&mut self) -> Option<&mut CaptureController> {
        self.capture.as_mut()
    }

    pub fn take_capture(&mut self) -> Option<CaptureController> {
        self.capture.take()
    }

    pub const fn session(&self) -> &SharedSession {
        self.session.session()
    }

    /// The session as held by the controllers.
    pub const fn session_handle(&self) -> &SessionHandle {
        &self.session
    }

    /// Cloneable handle for delivering signals from other threads.
    pub fn signal_sender(&self) -> SignalSender {
        self.signals.0.clone()
    }

    pub fn set_listener(&mut self, listener: impl StateListener<InterruptionState> + 'static) {
        self.listener = Some(Box::new(listener));
    }

    pub const fn interruption_state(&self) -> InterruptionState {
        self.state
    }

    pub const fn has_pending_configuration(&self) -> bool {
        self.pending_configuration
    }

    /// When the deferred post-interruption resume will fire.
    pub const fn pending_resume(&self) -> Option<Instant> {
        self.resume_at
    }

    pub const fn settle_delay(&self) -> Duration {
        self.settle_delay
    }

    /// Process queued signals, fire a due resume and poll the controllers.
    pub fn tick(&mut self, now: Instant) {
        while let Ok(signal) = self.signals.1.try_recv() {
            self.handle_signal(signal, now);
        }

        if self.resume_at.is_some_and(|at| at <= now) {
            self.resume_at = None;
            self.resume_suspended();
        }

        for client in clients(&mut self.playback, &mut self.capture).into_iter().flatten() {
            client.poll();
        }
    }

    pub fn handle_signal(&mut self, signal: SessionSignal, now: Instant) {
        tracing::info!("Session signal: {:?}", signal);
        match signal {
            SessionSignal::InterruptionBegan => self.interruption_began(),
            SessionSignal::InterruptionEnded => self.interruption_ended(now),
            SessionSignal::ConfigurationChanged => {
                self.pending_configuration = true;
                if self.state == InterruptionState::NotInterrupted {
                    self.rebuild_active();
                }
            }
            SessionSignal::MediaServicesReset => self.media_services_reset(),
        }
    }

    fn interruption_began(&mut self) {
        self.resume_at = None;
        self.set_state(InterruptionState::Interrupting);

        let suspended = &mut self.suspended;
        for (index, client) in clients(&mut self.playback, &mut self.capture)
            .into_iter()
            .enumerate()
        {
            let Some(client) = client else { continue };
            if !client.is_running() {
                continue;
            }
            match client.suspend() {
                Ok(()) => suspended[index] = true,
                Err(e) => tracing::error!("Failed to pause {} for interruption: {}", client.label(), e),
            }
        }
    }

    fn interruption_ended(&mut self, now: Instant) {
        if self.state == InterruptionState::NotInterrupted {
            return;
        }
        self.set_state(InterruptionState::NotInterrupted);

        self.session.reactivate();
        if self.pending_configuration {
            self.rebuild_active();
        }
        if self.suspended.iter().any(|&s| s) {
            self.resume_at = Some(now + self.settle_delay);
            tracing::debug!("Resume scheduled in {:?}", self.settle_delay);
        }
    }

    fn resume_suspended(&mut self) {
        let suspended = std::mem::take(&mut self.suspended);
        for (index, client) in clients(&mut self.playback, &mut self.capture)
            .into_iter()
            .enumerate()
        {
            let Some(client) = client else { continue };
            if !suspended[index] {
                continue;
            }
            if let Err(e) = client.resume() {
                tracing::error!("Failed to resume {} after interruption: {}", client.label(), e);
            }
        }
    }

    fn rebuild_active(&mut self) {
        self.pending_configuration = false;
        for client in clients(&mut self.playback, &mut self.capture).into_iter().flatten() {
            if !client.is_active() {
                continue;
            }
            if let Err(e) = client.rebuild() {
                tracing::error!("Failed to rebuild {} graph: {}", client.label(), e);
            }
        }
    }

    fn media_services_reset(&mut self) {
        self.pending_configuration = false;
        for client in clients(&mut self.playback, &mut self.capture).into_iter().flatten() {
            if let Err(e) = client.reset_all() {
                tracing::error!("Failed to restore {} after media reset: {}", client.label(), e);
            }
        }
    }

    fn set_state(&mut self, state: InterruptionState) {
        if self.state == state {
            return;
        }
        self.state = state;
        if let Some(listener) = self.listener.as_mut() {
            listener.state_changed(state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_desktop_session_records_requests() {
        let mut session = DesktopSession::new();
        assert!(!session.is_active());
        session.set_category(SessionCategory::PlayAndRecord).unwrap();
        session.set_active(true).unwrap();
        session.set_active(true).unwrap();
        assert_eq!(session.category(), Some(SessionCategory::PlayAndRecord));
        assert_eq!(session.activations(), 1);
        assert_eq!(session.output_level(), 1.0);
    }

    #[test]
    fn test_handle_keeps_session_for_remaining_holder() {
        let desktop = Arc::new(Mutex::new(DesktopSession::new()));
        let handle = SessionHandle::new(desktop.clone());

        handle.acquire(SessionCategory::PlayAndRecord);
        handle.acquire(SessionCategory::Playback);
        assert_eq!(desktop.lock().category(), Some(SessionCategory::PlayAndRecord));

        handle.release(SessionCategory::PlayAndRecord);
        assert!(desktop.lock().is_active());
        assert_eq!(desktop.lock().category(), Some(SessionCategory::Playback));

        // releasing twice must not drop the other holder's activation
        handle.release(SessionCategory::PlayAndRecord);
        assert!(desktop.lock().is_active());

        handle.release(SessionCategory::Playback);
        assert!(!desktop.lock().is_active());
        assert_eq!(handle.category(), None);
    }

    #[test]
    fn test_interruption_state_changes_reach_listener() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut coordinator =
            SessionCoordinator::new(DesktopSession::shared(), &EngineConfig::default());
        coordinator.set_listener(kara_comms::ChannelListener(tx));

        let now = Instant::now();
        coordinator.handle_signal(SessionSignal::InterruptionBegan, now);
        coordinator.handle_signal(SessionSignal::InterruptionBegan, now);
        coordinator.handle_signal(SessionSignal::InterruptionEnded, now);
        coordinator.handle_signal(SessionSignal::InterruptionEnded, now);

        let states: Vec<_> = rx.try_iter().collect();
        assert_eq!(
            states,
            vec![InterruptionState::Interrupting, InterruptionState::NotInterrupted]
        );
        // nothing was running, so nothing to resume
        assert!(coordinator.pending_resume().is_none());
    }

    #[test]
    fn test_configuration_change_deferred_while_interrupted() {
        let mut coordinator =
            SessionCoordinator::new(DesktopSession::shared(), &EngineConfig::default());
        let sender = coordinator.signal_sender();
        let now = Instant::now();

        sender.send(SessionSignal::InterruptionBegan).unwrap();
        sender.send(SessionSignal::ConfigurationChanged).unwrap();
        coordinator.tick(now);
        assert!(coordinator.has_pending_configuration());

        sender.send(SessionSignal::InterruptionEnded).unwrap();
        coordinator.tick(now);
        assert!(!coordinator.has_pending_configuration());
        assert_eq!(coordinator.interruption_state(), InterruptionState::NotInterrupted);
        assert_eq!(coordinator.session().lock().output_level(), 1.0);
    }
}
