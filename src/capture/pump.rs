use anyhow::{bail, Context, Result};
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::protocol::EncodedImage;

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info};

pub const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_millis(100);

/// Repeatedly takes a snapshot and sends it at a fixed cadence.
///
/// Each tick uses only the freshest snapshot. A tick with no snapshot is
/// skipped outright and late ticks are dropped rather than bunched up, so the
/// pump holds nothing between ticks however slow the consumer is.
pub struct FramePump {
    handle: Option<JoinHandle<()>>,
    cancel_token: Option<CancellationToken>,
}

impl FramePump {
    pub fn new() -> Self {
        Self {
            handle: None,
            cancel_token: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// `snapshot` is asked for a frame on every tick and `send` receives it;
    /// `send` reports whether the frame actually went out.
    pub fn start<S, F>(&mut self, interval: Duration, snapshot: S, send: F) -> Result<()>
    where
        S: FnMut() -> Option<EncodedImage> + Send + 'static,
        F: FnMut(EncodedImage) -> bool + Send + 'static,
    {
        if self.handle.is_some() {
            bail!("frame pump already running");
        }
        if interval.is_zero() {
            bail!("frame interval must be greater than zero");
        }

        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(pump_loop(interval, snapshot, send, cancel_token.clone()));

        log_info!("frame pump started ({}ms cadence)", interval.as_millis());
        self.handle = Some(handle);
        self.cancel_token = Some(cancel_token);
        Ok(())
    }

    /// Cancel the pump and wait for its task. Calling it on a stopped pump is
    /// a no-op.
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }

        if let Some(handle) = self.handle.take() {
            log_info!("frame pump stopped");
            handle
                .await
                .context("frame pump task failed to join")
                .map(|_| ())
        } else {
            Ok(())
        }
    }
}

impl Default for FramePump {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for FramePump {
    fn drop(&mut self) {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }
    }
}

async fn pump_loop<S, F>(
    interval: Duration,
    mut snapshot: S,
    mut send: F,
    cancel_token: CancellationToken,
) where
    S: FnMut() -> Option<EncodedImage>,
    F: FnMut(EncodedImage) -> bool,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => break,
            _ = ticker.tick() => {
                match snapshot() {
                    Some(frame) => {
                        if !send(frame) {
                            log_debug!("frame dropped: channel not ready");
                        }
                    }
                    None => log_debug!("no snapshot available; skipping tick"),
                }
            }
        }
    }
}
