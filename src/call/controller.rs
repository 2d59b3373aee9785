//! # Call Controller
//!
//! Owns the lifecycle of a single outbound call and the UI-visibility flag
//! that accompanies it.
//!
//! ## State Machine:
//! - `idle|ended|failed → dialing`: [`CallController::initiate_call`], UI shown immediately
//! - `dialing → connecting`: initiation accepted, call id recorded
//! - `dialing → failed`: initiation refused or errored
//! - `connecting → connected`: first `answered` event from the status feed
//! - `connected → ended`: [`CallController::hangup_call`] or carrier `completed`,
//!   followed by a delayed reset to idle
//! - `dialing|connecting → failed`: pending timeout
//! - `* → idle`: [`CallController::close_call_ui`]
//! - `ended|failed → dialing`: [`CallController::redial`]
//!
//! ## Concurrency:
//! State lives behind a mutex that is never held across an await. Every
//! initiation bumps an attempt counter; timers, initiation results and feed
//! events from an older attempt are discarded. A call id that arrives after
//! its attempt was abandoned is hung up at the carrier. The feed listener of
//! an attempt is aborted once the call fails, resets or is superseded.

use crate::call::error::CallError;
use crate::call::feed::{CallEventKind, CallStatusEvent, CallStatusFeed};
use crate::call::initiator::CallInitiator;
use crate::call::state::{CallInitiation, CallRequest, CallState, CallStatus, CallView};
use crate::call::transport::{ActiveCallTransport, CallControl};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Timer budgets for the controller.
#[derive(Debug, Clone, Copy)]
pub struct CallTimings {
    /// How long `dialing`/`connecting` may last before the call is failed.
    pub pending_timeout: Duration,
    /// How long an `ended` call stays visible before resetting to idle.
    pub ended_reset: Duration,
}

impl Default for CallTimings {
    fn default() -> Self {
        Self {
            pending_timeout: Duration::from_secs(30),
            ended_reset: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    state: CallState,
    show_call_ui: bool,
    attempt: u64,
    listener: Option<JoinHandle<()>>,
}

impl Inner {
    fn view(&self) -> CallView {
        CallView {
            state: self.state.clone(),
            show_call_ui: self.show_call_ui,
            is_call_active: self.state.is_call_active(),
        }
    }

    fn reset(&mut self) {
        self.stop_listening();
        self.state = CallState::default();
        self.show_call_ui = false;
    }

    fn fail(&mut self, error: String) {
        self.stop_listening();
        self.state.status = CallStatus::Failed;
        self.state.error = Some(error);
        self.state.controls = Default::default();
    }

    fn stop_listening(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}

enum FeedOutcome {
    Continue,
    Stop,
    Ended,
}

enum Initiated {
    Connecting(String),
    /// The carrier accepted a call nobody is waiting for any more.
    Orphaned(String),
    Settled,
}

/// Client-side owner of the call state. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct CallController {
    inner: Arc<Mutex<Inner>>,
    updates: Arc<watch::Sender<CallView>>,
    initiator: Arc<dyn CallInitiator>,
    transport: Arc<dyn ActiveCallTransport>,
    feed: Arc<dyn CallStatusFeed>,
    timings: CallTimings,
}

impl CallController {
    pub fn new(
        initiator: Arc<dyn CallInitiator>,
        transport: Arc<dyn ActiveCallTransport>,
        feed: Arc<dyn CallStatusFeed>,
        timings: CallTimings,
    ) -> Self {
        let (updates, _) = watch::channel(CallView::default());
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            updates: Arc::new(updates),
            initiator,
            transport,
            feed,
            timings,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply a change and publish the resulting view to subscribers.
    fn mutate<R>(&self, change: impl FnOnce(&mut Inner) -> R) -> R {
        let mut inner = self.lock();
        let result = change(&mut inner);
        self.updates.send_replace(inner.view());
        result
    }

    pub fn snapshot(&self) -> CallView {
        self.lock().view()
    }

    pub fn state(&self) -> CallState {
        self.lock().state.clone()
    }

    pub fn show_call_ui(&self) -> bool {
        self.lock().show_call_ui
    }

    pub fn is_call_active(&self) -> bool {
        self.lock().state.is_call_active()
    }

    /// Watch the call view; a new value is published on every change.
    pub fn subscribe(&self) -> watch::Receiver<CallView> {
        self.updates.subscribe()
    }

    /// Start a call.
    ///
    /// `status = dialing` and `showCallUI = true` are set before this returns;
    /// the returned future performs the initiation request and resolves to the
    /// view after it settles. Must be called within a tokio runtime.
    pub fn initiate_call(
        &self,
        request: CallRequest,
    ) -> Result<impl Future<Output = CallView> + Send + 'static, CallError> {
        let phone_number = request.phone_number.trim().to_string();
        if phone_number.is_empty() {
            return Err(CallError::MissingPhoneNumber);
        }
        let request = CallRequest {
            phone_number,
            ..request
        };

        let attempt = self.mutate(|inner| {
            if inner.state.status.is_active() {
                return Err(CallError::CallInProgress(inner.state.status));
            }
            inner.stop_listening();
            inner.attempt += 1;
            inner.show_call_ui = true;
            inner.state = CallState {
                status: CallStatus::Dialing,
                phone_number: request.phone_number.clone(),
                message: request.message.clone(),
                service: request.service,
                ..CallState::default()
            };
            Ok(inner.attempt)
        })?;

        info!(phone_number = %request.phone_number, service = ?request.service, attempt, "Dialing");
        self.arm_pending_timeout(attempt);

        let controller = self.clone();
        Ok(async move {
            let outcome = controller.initiator.initiate(&request).await;
            controller.finish_initiation(attempt, outcome).await;
            controller.snapshot()
        })
    }

    async fn finish_initiation(&self, attempt: u64, outcome: Result<CallInitiation, CallError>) {
        let initiated = self.mutate(|inner| {
            if inner.attempt != attempt || inner.state.status != CallStatus::Dialing {
                debug!(attempt, "Discarding initiation result for superseded attempt");
                return match outcome {
                    Ok(CallInitiation {
                        success: true,
                        call_sid: Some(call_sid),
                        ..
                    }) => Initiated::Orphaned(call_sid),
                    _ => Initiated::Settled,
                };
            }

            match outcome {
                Ok(CallInitiation {
                    success: true,
                    call_sid: Some(call_sid),
                    service,
                    ..
                }) => {
                    inner.state.status = CallStatus::Connecting;
                    inner.state.call_sid = Some(call_sid.clone());
                    if service.is_some() {
                        inner.state.service = service;
                    }
                    inner.listener = Some(self.listen(attempt, &call_sid));
                    Initiated::Connecting(call_sid)
                }
                Ok(CallInitiation { success: true, .. }) => {
                    inner.fail("call initiation succeeded without a call id".to_string());
                    Initiated::Settled
                }
                Ok(CallInitiation { error, .. }) => {
                    inner.fail(error.unwrap_or_else(|| "call initiation failed".to_string()));
                    Initiated::Settled
                }
                Err(err) => {
                    inner.fail(err.to_string());
                    Initiated::Settled
                }
            }
        });

        match initiated {
            Initiated::Connecting(call_sid) => {
                info!(call_sid = %call_sid, "Call accepted by carrier, connecting");
            }
            Initiated::Orphaned(call_sid) => {
                info!(call_sid = %call_sid, "Hanging up call accepted after its attempt ended");
                if let Err(err) = self.transport.hang_up(&call_sid).await {
                    warn!(call_sid = %call_sid, error = %err, "Carrier hangup failed");
                }
            }
            Initiated::Settled => {
                let state = self.state();
                if state.status == CallStatus::Failed {
                    warn!(error = state.error.as_deref().unwrap_or(""), "Call initiation failed");
                }
            }
        }
    }

    /// Subscribe to the feed for `call_sid` and apply its events until the
    /// call settles. The returned handle stops the listener when aborted.
    fn listen(&self, attempt: u64, call_sid: &str) -> JoinHandle<()> {
        let mut events = self.feed.subscribe(call_sid);
        let controller = self.clone();

        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match controller.apply_event(attempt, &event) {
                    FeedOutcome::Continue => {}
                    FeedOutcome::Stop => break,
                    FeedOutcome::Ended => {
                        controller.schedule_reset(attempt);
                        break;
                    }
                }
            }
        })
    }

    fn apply_event(&self, attempt: u64, event: &CallStatusEvent) -> FeedOutcome {
        self.mutate(|inner| {
            if inner.attempt != attempt {
                return FeedOutcome::Stop;
            }

            let status = inner.state.status;
            match (status, event.kind) {
                (CallStatus::Connecting, CallEventKind::Answered) => {
                    inner.state.status = CallStatus::Connected;
                    inner.state.status_origin = Some(event.origin);
                    info!(origin = ?event.origin, "Call connected");
                    FeedOutcome::Continue
                }
                (CallStatus::Connected, CallEventKind::Answered) => FeedOutcome::Continue,
                (CallStatus::Connecting | CallStatus::Connected, CallEventKind::Completed) => {
                    inner.state.status = CallStatus::Ended;
                    inner.state.status_origin = Some(event.origin);
                    inner.state.controls = Default::default();
                    info!("Call completed by remote party");
                    FeedOutcome::Ended
                }
                (CallStatus::Connecting | CallStatus::Connected, kind) => {
                    let reason = event
                        .reason
                        .clone()
                        .unwrap_or_else(|| format!("call {}", failure_label(kind)));
                    inner.fail(reason);
                    inner.state.status_origin = Some(event.origin);
                    warn!(?kind, "Call failed at carrier");
                    FeedOutcome::Stop
                }
                _ => FeedOutcome::Stop,
            }
        })
    }

    fn arm_pending_timeout(&self, attempt: u64) {
        let controller = self.clone();
        let timeout = self.timings.pending_timeout;

        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            controller.mutate(|inner| {
                if inner.attempt == attempt && inner.state.status.is_pending() {
                    warn!(status = %inner.state.status, "Call setup timed out");
                    inner.fail(format!("call setup timed out after {:?}", timeout));
                }
            });
        });
    }

    fn schedule_reset(&self, attempt: u64) {
        let controller = self.clone();
        let delay = self.timings.ended_reset;

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            controller.mutate(|inner| {
                if inner.attempt == attempt && inner.state.status == CallStatus::Ended {
                    inner.reset();
                    debug!("Ended call reset to idle");
                }
            });
        });
    }

    /// End the current call. The status flips to `ended` immediately; the UI
    /// stays visible until the reset delay elapses.
    pub async fn hangup_call(&self) -> Result<CallView, CallError> {
        let (attempt, call_sid) = self.mutate(|inner| {
            if !inner.state.status.is_active() {
                return Err(CallError::NoActiveCall(inner.state.status));
            }
            inner.state.status = CallStatus::Ended;
            inner.state.status_origin = None;
            inner.state.controls = Default::default();
            Ok((inner.attempt, inner.state.call_sid.clone()))
        })?;

        info!(call_sid = call_sid.as_deref().unwrap_or("-"), "Hanging up");
        self.schedule_reset(attempt);

        if let Some(call_sid) = call_sid {
            if let Err(err) = self.transport.hang_up(&call_sid).await {
                warn!(call_sid = %call_sid, error = %err, "Carrier hangup failed");
            }
        }
        Ok(self.snapshot())
    }

    /// Reset to idle from any state and hide the call UI.
    pub fn close_call_ui(&self) -> CallView {
        self.mutate(|inner| {
            if inner.state.is_call_active() {
                warn!(status = %inner.state.status, "Closing call UI while call is active");
            }
            inner.attempt += 1;
            inner.reset();
            inner.view()
        })
    }

    /// Call the last number again with the same message and service.
    ///
    /// Returns `Ok(None)` without touching state when there is no stored
    /// number.
    pub fn redial(
        &self,
    ) -> Result<Option<impl Future<Output = CallView> + Send + 'static>, CallError> {
        let request = {
            let inner = self.lock();
            if inner.state.phone_number.is_empty() {
                debug!("Redial ignored: no previous number");
                return Ok(None);
            }
            if !inner.state.status.is_terminal() {
                return Err(CallError::CallInProgress(inner.state.status));
            }
            CallRequest {
                phone_number: inner.state.phone_number.clone(),
                message: inner.state.message.clone(),
                service: inner.state.service,
            }
        };

        self.initiate_call(request).map(Some)
    }

    pub async fn toggle_mute(&self) -> Result<bool, CallError> {
        self.toggle(CallControl::Mute).await
    }

    pub async fn toggle_hold(&self) -> Result<bool, CallError> {
        self.toggle(CallControl::Hold).await
    }

    pub async fn toggle_speaker(&self) -> Result<bool, CallError> {
        self.toggle(CallControl::Speaker).await
    }

    /// Flip a side-channel control through the transport. The local flag only
    /// changes once the transport confirms.
    pub async fn toggle(&self, control: CallControl) -> Result<bool, CallError> {
        let (call_sid, enabled) = {
            let inner = self.lock();
            let status = inner.state.status;
            let call_sid = match (&inner.state.call_sid, status) {
                (Some(sid), CallStatus::Connecting | CallStatus::Connected) => sid.clone(),
                _ => {
                    debug!(control = control.as_str(), %status, "Control ignored outside an active call");
                    return Err(CallError::NoActiveCall(status));
                }
            };
            (call_sid, !control_flag(&inner.state, control))
        };

        self.transport.apply(&call_sid, control, enabled).await?;

        self.mutate(|inner| {
            let same_call = inner.state.call_sid.as_deref() == Some(call_sid.as_str());
            if same_call && inner.state.status.is_active() {
                set_control_flag(&mut inner.state, control, enabled);
            }
        });
        info!(call_sid = %call_sid, control = control.as_str(), enabled, "Call control applied");
        Ok(enabled)
    }
}

fn control_flag(state: &CallState, control: CallControl) -> bool {
    match control {
        CallControl::Mute => state.controls.muted,
        CallControl::Hold => state.controls.on_hold,
        CallControl::Speaker => state.controls.speaker,
    }
}

fn set_control_flag(state: &mut CallState, control: CallControl, enabled: bool) {
    match control {
        CallControl::Mute => state.controls.muted = enabled,
        CallControl::Hold => state.controls.on_hold = enabled,
        CallControl::Speaker => state.controls.speaker = enabled,
    }
}

fn failure_label(kind: CallEventKind) -> &'static str {
    match kind {
        CallEventKind::Busy => "busy",
        CallEventKind::NoAnswer => "not answered",
        _ => "failed",
    }
}
