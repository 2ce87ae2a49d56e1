use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use rand::{rngs::StdRng, SeedableRng};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::protocol::ClientMessage;

use super::{connector::OutboundSink, Connection, Connector, ReconnectPolicy};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info, log_warn};

/// Frames allowed to wait for the socket writer. When the writer falls
/// behind, fresh frames are dropped instead of queued. Commands are never
/// capped.
pub const FRAME_BUFFER: usize = 4;

/// Connection-level notifications, delivered in the order they happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Opened,
    Closed,
    Errored(String),
    Message(String),
}

enum Outbound {
    Command(String),
    Frame(String),
}

/// Cheap handle for pushing messages onto the open channel from any task.
#[derive(Clone)]
pub struct ChannelSender {
    tx: mpsc::UnboundedSender<Outbound>,
    frames_in_flight: Arc<AtomicUsize>,
    open: Arc<AtomicBool>,
}

impl ChannelSender {
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Serialize and queue `message` for the writer, in send order. Returns
    /// `false` when the message was dropped: nothing is sent while the
    /// channel is not open, and frames are also dropped while
    /// [`FRAME_BUFFER`] frames are still waiting. Drops are never reported
    /// as errors.
    pub fn send(&self, message: &ClientMessage) -> bool {
        if !self.is_open() {
            log_debug!("channel not open; dropping {} message", message.kind());
            return false;
        }

        let json = match message.to_json() {
            Ok(json) => json,
            Err(err) => {
                log_warn!("failed to encode {} message: {err}", message.kind());
                return false;
            }
        };

        let item = match message {
            ClientMessage::Command(_) => Outbound::Command(json),
            ClientMessage::Frame { .. } => {
                let reserved = self
                    .frames_in_flight
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |waiting| {
                        (waiting < FRAME_BUFFER).then_some(waiting + 1)
                    })
                    .is_ok();
                if !reserved {
                    log_debug!("writer behind; dropping frame");
                    return false;
                }
                Outbound::Frame(json)
            }
        };

        match self.tx.send(item) {
            Ok(()) => true,
            Err(mpsc::error::SendError(item)) => {
                if matches!(item, Outbound::Frame(_)) {
                    self.frames_in_flight.fetch_sub(1, Ordering::SeqCst);
                }
                false
            }
        }
    }
}

/// Writer side of the outbound queue.
struct OutboundQueue {
    rx: mpsc::UnboundedReceiver<Outbound>,
    frames_in_flight: Arc<AtomicUsize>,
}

impl OutboundQueue {
    async fn next(&mut self) -> Option<String> {
        let item = self.rx.recv().await?;
        Some(self.release(item))
    }

    /// Drop anything queued for a connection that no longer exists.
    fn discard_stale(&mut self) {
        while let Ok(item) = self.rx.try_recv() {
            self.release(item);
        }
    }

    fn release(&self, item: Outbound) -> String {
        match item {
            Outbound::Command(text) => text,
            Outbound::Frame(text) => {
                self.frames_in_flight.fetch_sub(1, Ordering::SeqCst);
                text
            }
        }
    }
}

/// Owns the single streaming connection to the detection service.
pub struct ChannelManager {
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    events: mpsc::UnboundedSender<ChannelEvent>,
    sender: ChannelSender,
    outbound: Option<OutboundQueue>,
    handle: Option<JoinHandle<()>>,
    cancel_token: CancellationToken,
}

impl ChannelManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        policy: ReconnectPolicy,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let frames_in_flight = Arc::new(AtomicUsize::new(0));
        Self {
            connector,
            policy,
            events,
            sender: ChannelSender {
                tx,
                frames_in_flight: frames_in_flight.clone(),
                open: Arc::new(AtomicBool::new(false)),
            },
            outbound: Some(OutboundQueue {
                rx,
                frames_in_flight,
            }),
            handle: None,
            cancel_token: CancellationToken::new(),
        }
    }

    /// Start the connection task. Only the first call per manager does
    /// anything; later calls are ignored.
    pub fn open(&mut self, url: &str) {
        let Some(outbound) = self.outbound.take() else {
            log_debug!("channel already opened once; ignoring open({url})");
            return;
        };

        log_info!("opening channel to {url}");
        let handle = tokio::spawn(connection_loop(
            url.to_string(),
            self.connector.clone(),
            self.policy,
            self.events.clone(),
            outbound,
            self.sender.open.clone(),
            self.cancel_token.clone(),
        ));
        self.handle = Some(handle);
    }

    pub fn send(&self, message: &ClientMessage) -> bool {
        self.sender.send(message)
    }

    pub fn sender(&self) -> ChannelSender {
        self.sender.clone()
    }

    pub fn is_open(&self) -> bool {
        self.sender.is_open()
    }

    /// Close the connection and wait for the connection task to finish.
    pub async fn close(&mut self) -> Result<()> {
        self.cancel_token.cancel();
        self.sender.open.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            handle
                .await
                .context("channel task failed to join")
                .map(|_| ())
        } else {
            Ok(())
        }
    }
}

impl Drop for ChannelManager {
    fn drop(&mut self) {
        self.cancel_token.cancel();
        self.sender.open.store(false, Ordering::SeqCst);
    }
}

enum ConnectionOutcome {
    Shutdown,
    Closed,
    Failed(String),
}

async fn connection_loop(
    url: String,
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    events: mpsc::UnboundedSender<ChannelEvent>,
    mut outbound: OutboundQueue,
    open: Arc<AtomicBool>,
    cancel_token: CancellationToken,
) {
    let mut rng = StdRng::from_entropy();
    let mut attempt: u32 = 0;

    loop {
        let connected = tokio::select! {
            biased;
            _ = cancel_token.cancelled() => break,
            result = connector.connect(&url) => result,
        };

        match connected {
            Ok(connection) => {
                attempt = 0;
                outbound.discard_stale();

                open.store(true, Ordering::SeqCst);
                let _ = events.send(ChannelEvent::Opened);
                log_info!("channel open: {url}");

                let outcome =
                    run_connection(connection, &mut outbound, &events, &cancel_token).await;
                open.store(false, Ordering::SeqCst);

                match outcome {
                    ConnectionOutcome::Shutdown => break,
                    ConnectionOutcome::Closed => {
                        log_info!("channel closed by service");
                        let _ = events.send(ChannelEvent::Closed);
                    }
                    ConnectionOutcome::Failed(reason) => {
                        log_warn!("channel failed: {reason}");
                        let _ = events.send(ChannelEvent::Errored(reason));
                    }
                }
            }
            Err(err) => {
                log_warn!("connect to {url} failed: {err:#}");
                let _ = events.send(ChannelEvent::Errored(format!("{err:#}")));
            }
        }

        if !policy.allows(attempt) {
            log_info!("no reconnect attempts left for {url}");
            break;
        }
        let delay = policy.delay_for(attempt, &mut rng);
        attempt += 1;
        log_info!("reconnecting in {}ms (attempt {attempt})", delay.as_millis());

        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    open.store(false, Ordering::SeqCst);
}

async fn run_connection(
    connection: Connection,
    outbound: &mut OutboundQueue,
    events: &mpsc::UnboundedSender<ChannelEvent>,
    cancel_token: &CancellationToken,
) -> ConnectionOutcome {
    let Connection {
        mut sink,
        mut stream,
    } = connection;

    loop {
        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => {
                let _ = sink.close().await;
                return ConnectionOutcome::Shutdown;
            }
            inbound = stream.next() => match inbound {
                Some(Ok(text)) => {
                    if events.send(ChannelEvent::Message(text)).is_err() {
                        let _ = sink.close().await;
                        return ConnectionOutcome::Shutdown;
                    }
                }
                Some(Err(err)) => return ConnectionOutcome::Failed(format!("{err:#}")),
                None => return ConnectionOutcome::Closed,
            },
            text = outbound.next() => match text {
                Some(text) => {
                    if let Some(outcome) = write(&mut sink, text, cancel_token).await {
                        return outcome;
                    }
                }
                None => {
                    let _ = sink.close().await;
                    return ConnectionOutcome::Shutdown;
                }
            },
        }
    }
}

/// Write one message. A stalled socket must not hold up shutdown, so the
/// write gives way to cancellation.
async fn write(
    sink: &mut OutboundSink,
    text: String,
    cancel_token: &CancellationToken,
) -> Option<ConnectionOutcome> {
    tokio::select! {
        biased;
        _ = cancel_token.cancelled() => Some(ConnectionOutcome::Shutdown),
        result = sink.send(text) => match result {
            Ok(()) => None,
            Err(err) => Some(ConnectionOutcome::Failed(format!("{err:#}"))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryConnector;
    use crate::protocol::{Command, EncodedImage};
    use futures::{
        channel::mpsc as fmpsc,
        future::BoxFuture,
        stream, FutureExt,
    };
    use std::{sync::Mutex, time::Duration};

    /// Socket whose peer takes one message at a time, and only when the
    /// test reads it.
    struct StalledConnector {
        sink: Mutex<Option<fmpsc::Sender<String>>>,
    }

    impl StalledConnector {
        fn new() -> (Arc<Self>, fmpsc::Receiver<String>) {
            let (tx, rx) = fmpsc::channel(0);
            let connector = Self {
                sink: Mutex::new(Some(tx)),
            };
            (Arc::new(connector), rx)
        }
    }

    impl Connector for StalledConnector {
        fn connect(&self, _url: &str) -> BoxFuture<'static, Result<Connection>> {
            let sink = self.sink.lock().unwrap().take();
            async move {
                let sink = sink.context("stalled connector only connects once")?;
                Ok(Connection {
                    sink: Box::pin(sink.sink_map_err(anyhow::Error::from)),
                    stream: stream::pending().boxed(),
                })
            }
            .boxed()
        }
    }

    fn frame() -> ClientMessage {
        ClientMessage::frame(EncodedImage::from_data_url("data:image/jpeg;base64,AAAA"))
    }

    fn is_frame(text: &str) -> bool {
        !text.contains("command")
    }

    fn manager_with(
        connector: Arc<dyn Connector>,
        policy: ReconnectPolicy,
    ) -> (ChannelManager, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ChannelManager::new(connector, policy, tx), rx)
    }

    #[tokio::test]
    async fn send_before_open_is_dropped_silently() {
        let (connector, _peers) = MemoryConnector::new();
        let (manager, _events) = manager_with(Arc::new(connector), ReconnectPolicy::disabled());
        assert!(!manager.is_open());
        assert!(!manager.send(&Command::StartCalibration.into()));
    }

    #[tokio::test]
    async fn open_send_receive_and_close() {
        let (connector, mut peers) = MemoryConnector::new();
        let (mut manager, mut events) =
            manager_with(Arc::new(connector), ReconnectPolicy::disabled());

        manager.open("mem://service");
        let mut peer = peers.next_peer().await.unwrap();
        assert_eq!(events.recv().await, Some(ChannelEvent::Opened));
        assert!(manager.is_open());

        assert!(manager.send(&Command::StartDistance.into()));
        assert_eq!(peer.recv().await.as_deref(), Some(r#"{"command":"start_distance"}"#));

        peer.send(r#"{"message":"one"}"#).unwrap();
        peer.send(r#"{"message":"two"}"#).unwrap();
        assert_eq!(
            events.recv().await,
            Some(ChannelEvent::Message(r#"{"message":"one"}"#.into()))
        );
        assert_eq!(
            events.recv().await,
            Some(ChannelEvent::Message(r#"{"message":"two"}"#.into()))
        );

        manager.close().await.unwrap();
        assert!(!manager.is_open());
        assert!(peer.recv().await.is_none());
    }

    #[tokio::test]
    async fn second_open_is_ignored() {
        let (connector, mut peers) = MemoryConnector::new();
        let connector = Arc::new(connector);
        let (mut manager, mut events) =
            manager_with(connector.clone(), ReconnectPolicy::disabled());

        manager.open("mem://service");
        manager.open("mem://service");
        let _peer = peers.next_peer().await.unwrap();
        assert_eq!(events.recv().await, Some(ChannelEvent::Opened));
        assert_eq!(connector.attempts(), 1);
        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn drop_without_reconnect_reports_closed() {
        let (connector, mut peers) = MemoryConnector::new();
        let connector = Arc::new(connector);
        let (mut manager, mut events) =
            manager_with(connector.clone(), ReconnectPolicy::disabled());

        manager.open("mem://service");
        let peer = peers.next_peer().await.unwrap();
        assert_eq!(events.recv().await, Some(ChannelEvent::Opened));

        peer.close();
        assert_eq!(events.recv().await, Some(ChannelEvent::Closed));
        // Task exits: no reconnect and the event stream ends.
        manager.close().await.unwrap();
        assert_eq!(connector.attempts(), 1);
        assert!(!manager.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn transport_error_then_reconnect() {
        let (connector, mut peers) = MemoryConnector::new();
        let connector = Arc::new(connector);
        let policy = ReconnectPolicy {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 1000,
            jitter_ms: 0,
        };
        let (mut manager, mut events) = manager_with(connector.clone(), policy);

        manager.open("mem://service");
        let peer = peers.next_peer().await.unwrap();
        assert_eq!(events.recv().await, Some(ChannelEvent::Opened));

        peer.fail("reset by peer");
        assert!(matches!(events.recv().await, Some(ChannelEvent::Errored(reason)) if reason.contains("reset")));

        let mut peer = peers.next_peer().await.unwrap();
        assert_eq!(events.recv().await, Some(ChannelEvent::Opened));
        assert_eq!(connector.attempts(), 2);

        assert!(manager.send(&Command::StopAll.into()));
        assert_eq!(peer.recv().await.as_deref(), Some(r#"{"command":"stop_all"}"#));
        manager.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let (connector, _peers) = MemoryConnector::new();
        connector.refuse_next(10, "refused");
        let connector = Arc::new(connector);
        let policy = ReconnectPolicy {
            max_attempts: 2,
            base_delay_ms: 100,
            max_delay_ms: 1000,
            jitter_ms: 0,
        };
        let (mut manager, mut events) = manager_with(connector.clone(), policy);
        manager.open("mem://service");

        for _ in 0..3 {
            assert_eq!(events.recv().await, Some(ChannelEvent::Errored("refused".into())));
        }
        manager.close().await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.attempts(), 3);
    }

    #[tokio::test]
    async fn stalled_writer_drops_frames_but_keeps_commands_in_order() {
        let (connector, mut written) = StalledConnector::new();
        let (mut manager, mut events) = manager_with(connector, ReconnectPolicy::disabled());
        manager.open("mem://service");
        assert_eq!(events.recv().await, Some(ChannelEvent::Opened));

        let accepted = (0..8).filter(|_| manager.send(&frame())).count();
        assert_eq!(accepted, FRAME_BUFFER);
        assert!(manager.send(&Command::StopAll.into()));
        assert!(manager.is_open());

        for _ in 0..FRAME_BUFFER {
            let text = written.next().await.unwrap();
            assert!(is_frame(&text), "expected a frame, got {text}");
        }
        assert_eq!(
            written.next().await.as_deref(),
            Some(r#"{"command":"stop_all"}"#)
        );

        // Written frames free their slots.
        assert!(manager.send(&frame()));
        assert!(is_frame(&written.next().await.unwrap()));
        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn commands_are_queued_past_the_frame_limit() {
        let (connector, mut written) = StalledConnector::new();
        let (mut manager, mut events) = manager_with(connector, ReconnectPolicy::disabled());
        manager.open("mem://service");
        assert_eq!(events.recv().await, Some(ChannelEvent::Opened));

        for _ in 0..FRAME_BUFFER {
            assert!(manager.send(&frame()));
        }
        assert!(!manager.send(&frame()));
        assert!(manager.send(&Command::StartDistance.into()));
        assert!(manager.send(&Command::StopAll.into()));

        let mut commands = Vec::new();
        for _ in 0..FRAME_BUFFER + 2 {
            let text = written.next().await.unwrap();
            if !is_frame(&text) {
                commands.push(text);
            }
        }
        assert_eq!(
            commands,
            vec![
                r#"{"command":"start_distance"}"#.to_string(),
                r#"{"command":"stop_all"}"#.to_string(),
            ]
        );
        manager.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn close_does_not_wait_for_a_stalled_socket() {
        let (connector, _written) = StalledConnector::new();
        let (mut manager, mut events) = manager_with(connector, ReconnectPolicy::disabled());
        manager.open("mem://service");
        assert_eq!(events.recv().await, Some(ChannelEvent::Opened));

        // The first write fills the socket; the second blocks the writer.
        assert!(manager.send(&frame()));
        assert!(manager.send(&frame()));
        tokio::task::yield_now().await;

        tokio::time::timeout(Duration::from_secs(1), manager.close())
            .await
            .expect("close should not hang on a stalled socket")
            .unwrap();
        assert!(!manager.is_open());
    }
}
