//! Shared fixtures for session integration tests.

use std::{sync::Arc, time::Duration};

use distcam_lib::{
    capture::LatestFrameSlot,
    channel::{MemoryConnector, MemoryPeer, MemoryPeers, ReconnectPolicy},
    protocol::EncodedImage,
    session::{ConnectionState, SessionController, SessionSnapshot},
    settings::Settings,
};
use serde_json::Value;

pub const WAIT: Duration = Duration::from_secs(30);

const FIXTURE_JPEG: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, 0xFF, 0xD9];

#[allow(dead_code)]
pub struct Harness {
    pub controller: SessionController,
    pub connector: Arc<MemoryConnector>,
    pub peers: MemoryPeers,
    pub frames: Arc<LatestFrameSlot>,
}

#[allow(dead_code)]
pub fn test_settings() -> Settings {
    Settings {
        server_url: "mem://detector/ws".into(),
        reconnect: ReconnectPolicy::disabled(),
        ..Settings::default()
    }
}

#[allow(dead_code)]
pub fn fixture_frame() -> EncodedImage {
    EncodedImage::from_jpeg_bytes(FIXTURE_JPEG)
}

/// Start a session with a frame already published.
#[allow(dead_code)]
pub fn start_session(settings: Settings) -> Harness {
    let (connector, peers) = MemoryConnector::new();
    let connector = Arc::new(connector);
    let frames = Arc::new(LatestFrameSlot::new());
    frames.publish_jpeg(FIXTURE_JPEG);

    let controller = SessionController::init(settings, frames.clone(), connector.clone())
        .expect("session should start");
    Harness {
        controller,
        connector,
        peers,
        frames,
    }
}

/// Start a session and wait until its channel is connected.
#[allow(dead_code)]
pub async fn connected_session(settings: Settings) -> (Harness, MemoryPeer) {
    let mut harness = start_session(settings);
    let peer = tokio::time::timeout(WAIT, harness.peers.next_peer())
        .await
        .expect("connection attempt should happen")
        .expect("peer should be handed over");
    wait_for(&harness.controller, |s| {
        s.connection_state == ConnectionState::Connected
    })
    .await;
    (harness, peer)
}

#[allow(dead_code)]
pub async fn wait_for(
    controller: &SessionController,
    predicate: impl FnMut(&SessionSnapshot) -> bool,
) -> SessionSnapshot {
    let mut updates = controller.subscribe();
    let snapshot = tokio::time::timeout(WAIT, updates.wait_for(predicate))
        .await
        .expect("condition should be reached in time")
        .expect("session should still be publishing");
    (*snapshot).clone()
}

/// Next message with a `command` key, skipping bare frames.
#[allow(dead_code)]
pub async fn recv_command(peer: &mut MemoryPeer) -> Value {
    loop {
        let message = tokio::time::timeout(WAIT, peer.recv_json())
            .await
            .expect("client should send a command")
            .expect("client should still be connected");
        if message.get("command").is_some() {
            return message;
        }
    }
}

/// Next bare frame, failing if a command shows up first.
#[allow(dead_code)]
pub async fn recv_frame(peer: &mut MemoryPeer) -> Value {
    let message = tokio::time::timeout(WAIT, peer.recv_json())
        .await
        .expect("client should send a frame")
        .expect("client should still be connected");
    assert!(
        message.get("command").is_none(),
        "expected a bare frame, got {message}"
    );
    message
}
