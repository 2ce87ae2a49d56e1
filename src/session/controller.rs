use std::{future::pending, sync::Arc};

use anyhow::{Context, Result};
use tokio::{
    sync::{mpsc, oneshot, watch, Mutex},
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    capture::{FramePump, FrameSource},
    channel::{ChannelEvent, ChannelManager, Connector},
    metrics::MetricsAggregator,
    protocol::{ClientMessage, InboundMessage},
    settings::Settings,
};

use super::{Effect, Phase, SessionError, SessionSnapshot, SessionState};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Intent {
    Calibrate,
    Capture,
    StartMeasuring,
    StopMeasuring,
}

struct Request {
    intent: Intent,
    reply: oneshot::Sender<Result<(), SessionError>>,
}

/// Cancels the session task once the last controller clone is dropped.
struct ShutdownGuard {
    cancel_token: CancellationToken,
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

/// Handle to a running session. Cheap to clone; the session lives until
/// [`SessionController::teardown`] or until every clone is dropped.
#[derive(Clone)]
pub struct SessionController {
    session_id: Uuid,
    requests: mpsc::Sender<Request>,
    state_rx: watch::Receiver<SessionSnapshot>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
    guard: Arc<ShutdownGuard>,
}

impl SessionController {
    /// Validate `settings`, open the channel and start the session task.
    /// Must be called from within a tokio runtime.
    pub fn init(
        settings: Settings,
        source: Arc<dyn FrameSource>,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        settings.validate().context("invalid session settings")?;

        let session_id = Uuid::new_v4();
        let state = SessionState::new(settings.calibration_marker.clone());
        let (state_tx, state_rx) = watch::channel(state.snapshot(session_id, 0, false));
        let (requests_tx, requests_rx) = mpsc::channel(16);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let channel = ChannelManager::new(connector, settings.reconnect, events_tx);
        let cancel_token = CancellationToken::new();

        let actor = SessionActor {
            session_id,
            metrics: MetricsAggregator::new(Instant::now()),
            settings,
            state,
            channel,
            pump: FramePump::new(),
            source,
            publisher: state_tx,
            watchdog_deadline: None,
        };

        log_info!("session {session_id} starting");
        let handle = tokio::spawn(actor.run(requests_rx, events_rx, cancel_token.clone()));

        Ok(Self {
            session_id,
            requests: requests_tx,
            state_rx,
            task: Arc::new(Mutex::new(Some(handle))),
            guard: Arc::new(ShutdownGuard { cancel_token }),
        })
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.state_rx.borrow().clone()
    }

    /// Receiver that observes every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.state_rx.clone()
    }

    pub async fn request_calibration(&self) -> Result<(), SessionError> {
        self.request(Intent::Calibrate).await
    }

    pub async fn request_capture(&self) -> Result<(), SessionError> {
        self.request(Intent::Capture).await
    }

    pub async fn request_start_measuring(&self) -> Result<(), SessionError> {
        self.request(Intent::StartMeasuring).await
    }

    pub async fn request_stop_measuring(&self) -> Result<(), SessionError> {
        self.request(Intent::StopMeasuring).await
    }

    async fn request(&self, intent: Intent) -> Result<(), SessionError> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(Request { intent, reply })
            .await
            .map_err(|_| SessionError::ShutDown)?;
        response.await.map_err(|_| SessionError::ShutDown)?
    }

    /// Stop the pump, close the channel and wait for the session task.
    pub async fn teardown(&self) -> Result<()> {
        self.guard.cancel_token.cancel();
        if let Some(handle) = self.task.lock().await.take() {
            handle.await.context("session task failed to join")?;
            log_info!("session {} torn down", self.session_id);
        }
        Ok(())
    }
}

struct SessionActor {
    session_id: Uuid,
    settings: Settings,
    state: SessionState,
    channel: ChannelManager,
    pump: FramePump,
    metrics: MetricsAggregator,
    source: Arc<dyn FrameSource>,
    publisher: watch::Sender<SessionSnapshot>,
    watchdog_deadline: Option<Instant>,
}

impl SessionActor {
    async fn run(
        mut self,
        mut requests: mpsc::Receiver<Request>,
        mut events: mpsc::UnboundedReceiver<ChannelEvent>,
        cancel_token: CancellationToken,
    ) {
        self.channel.open(&self.settings.server_url);

        let fps_interval = self.settings.fps_sample_interval();
        let mut fps_ticker = time::interval_at(Instant::now() + fps_interval, fps_interval);
        fps_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel_token.cancelled() => break,
                Some(event) = events.recv() => self.handle_channel_event(event).await,
                request = requests.recv() => match request {
                    Some(request) => self.handle_request(request).await,
                    None => break,
                },
                _ = fps_ticker.tick() => {
                    self.metrics.sample_fps(Instant::now());
                }
                _ = wait_until(self.watchdog_deadline) => {
                    self.watchdog_deadline = None;
                    if self.state.on_watchdog_expired() {
                        log_warn!(
                            "session {}: no result within {}ms while measuring",
                            self.session_id,
                            self.settings.watchdog_timeout_ms
                        );
                    }
                }
            }
            self.publish();
        }

        self.shutdown().await;
    }

    async fn handle_request(&mut self, request: Request) {
        let Request { intent, reply } = request;
        let result = match intent {
            Intent::Calibrate => self.state.request_calibration(),
            Intent::Capture => self.state.request_capture(self.source.snapshot()),
            Intent::StartMeasuring => self.state.request_start_measuring(),
            Intent::StopMeasuring => self.state.request_stop_measuring(),
        };

        let outcome = match result {
            Ok(effects) => {
                log_info!(
                    "session {}: {intent:?} accepted, phase now {:?}",
                    self.session_id,
                    self.state.phase
                );
                self.apply(effects).await;
                self.refresh_watchdog(false);
                Ok(())
            }
            Err(err) => {
                log_warn!("session {}: {intent:?} rejected: {err}", self.session_id);
                Err(err)
            }
        };

        // Callers see the new phase as soon as their request returns.
        self.publish();
        let _ = reply.send(outcome);
    }

    async fn handle_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Opened => {
                log_info!("session {}: channel connected", self.session_id);
                let effects = self.state.on_channel_opened();
                self.apply(effects).await;
                self.refresh_watchdog(false);
            }
            ChannelEvent::Closed => {
                let effects = self.state.on_channel_lost(None);
                self.apply(effects).await;
                self.refresh_watchdog(false);
            }
            ChannelEvent::Errored(reason) => {
                let effects = self.state.on_channel_lost(Some(&reason));
                self.apply(effects).await;
                self.refresh_watchdog(false);
            }
            ChannelEvent::Message(raw) => match InboundMessage::parse(&raw) {
                Ok(message) => {
                    self.state.on_message(&message, &self.metrics);
                    self.refresh_watchdog(true);
                }
                Err(err) => log_warn!("session {}: ignoring message: {err}", self.session_id),
            },
        }
    }

    async fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Send(message) => {
                    if !self.channel.send(&message) {
                        log_debug!("{} not sent: channel unavailable", message.kind());
                    }
                }
                Effect::StartPump => self.start_pump(),
                Effect::StopPump => {
                    if let Err(err) = self.pump.stop().await {
                        log_error!("session {}: failed to stop frame pump: {err:#}", self.session_id);
                    }
                }
            }
        }
    }

    fn start_pump(&mut self) {
        let source = self.source.clone();
        let sender = self.channel.sender();
        let counter = self.metrics.counter();
        let verbose = self.settings.verbose_frames;

        let started = self.pump.start(
            self.settings.frame_interval(),
            move || source.snapshot(),
            move |image| {
                let bytes = image.len();
                let sent = sender.send(&ClientMessage::frame(image));
                if sent {
                    counter.record();
                    if verbose {
                        log::debug!("frame sent ({bytes} bytes)");
                    }
                }
                sent
            },
        );
        if let Err(err) = started {
            log_warn!("session {}: {err:#}", self.session_id);
        }
    }

    /// Arm, re-arm or disarm the measurement watchdog. It runs only while
    /// frames are being pumped and is pushed back by every result.
    fn refresh_watchdog(&mut self, result_arrived: bool) {
        let Some(timeout) = self.settings.watchdog_timeout() else {
            self.watchdog_deadline = None;
            return;
        };

        if self.state.phase != Phase::Measuring || !self.pump.is_running() {
            self.watchdog_deadline = None;
        } else if result_arrived
            || (self.watchdog_deadline.is_none() && !self.state.measurement_stalled)
        {
            self.watchdog_deadline = Some(Instant::now() + timeout);
        }
    }

    fn publish(&self) {
        let next = self
            .state
            .snapshot(self.session_id, self.metrics.fps(), self.pump.is_running());
        self.publisher.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    async fn shutdown(&mut self) {
        self.watchdog_deadline = None;
        if let Err(err) = self.pump.stop().await {
            log_error!("session {}: failed to stop frame pump: {err:#}", self.session_id);
        }
        if let Err(err) = self.channel.close().await {
            log_error!("session {}: failed to close channel: {err:#}", self.session_id);
        }
        self.publish();
        log_info!("session {} stopped", self.session_id);
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => pending::<()>().await,
    }
}
