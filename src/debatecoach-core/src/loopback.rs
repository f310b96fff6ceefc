//! In-process transport.
//!
//! Implements every transport trait without touching a network or an audio
//! device. The remote side of each loopback peer is exposed through a
//! [`LoopbackRemote`] handle that can inject control-channel messages and
//! inspect what the session sent, which is how captured event logs are
//! replayed.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::context::DebateContext;
use crate::error::DebateError;
use crate::transport::{
    ControlChannel, CredentialIssuer, LocalAudio, MediaDevices, PeerConnector, PeerEvent,
    PeerSession, SignalingEndpoint, TransportDeps,
};
use crate::volume::AudioProbe;

/// Counts microphone acquisitions and releases.
#[derive(Debug, Default)]
pub struct MediaStats {
    acquired: AtomicUsize,
    released: AtomicUsize,
}

impl MediaStats {
    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// Streams acquired and not yet stopped.
    pub fn live(&self) -> usize {
        self.acquired().saturating_sub(self.released())
    }
}

/// Order in which loopback resources were torn down.
#[derive(Debug, Clone, Default)]
pub struct TeardownLog(Arc<Mutex<Vec<&'static str>>>);

impl TeardownLog {
    fn record(&self, what: &'static str) {
        if let Ok(mut log) = self.0.lock() {
            log.push(what);
        }
    }

    pub fn entries(&self) -> Vec<&'static str> {
        self.0.lock().map(|l| l.clone()).unwrap_or_default()
    }
}

/// Microphone that is always (or never) granted.
#[derive(Debug, Default)]
pub struct LoopbackMedia {
    deny: bool,
    stats: Arc<MediaStats>,
    teardown: TeardownLog,
}

impl LoopbackMedia {
    pub fn new() -> Self {
        Self::default()
    }

    /// A device that refuses access, like a user denying the permission prompt.
    pub fn denying() -> Self {
        Self {
            deny: true,
            ..Self::default()
        }
    }

    pub fn stats(&self) -> Arc<MediaStats> {
        self.stats.clone()
    }
}

struct LoopbackAudio {
    track_id: String,
    stopped: bool,
    stats: Arc<MediaStats>,
    teardown: TeardownLog,
}

impl LocalAudio for LoopbackAudio {
    fn track_id(&self) -> &str {
        &self.track_id
    }

    fn stop(&mut self) {
        if !self.stopped {
            self.stopped = true;
            self.stats.released.fetch_add(1, Ordering::SeqCst);
            self.teardown.record("microphone");
        }
    }
}

#[async_trait]
impl MediaDevices for LoopbackMedia {
    async fn acquire_microphone(&self) -> Result<Box<dyn LocalAudio>, DebateError> {
        if self.deny {
            return Err(DebateError::MediaAccess("Permission denied".to_string()));
        }
        let n = self.stats.acquired.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Box::new(LoopbackAudio {
            track_id: format!("loopback-mic-{}", n),
            stopped: false,
            stats: self.stats.clone(),
            teardown: self.teardown.clone(),
        }))
    }
}

/// Hands out a fixed token.
#[derive(Debug, Clone)]
pub struct StaticCredentialIssuer {
    token: String,
}

impl StaticCredentialIssuer {
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: token.into() }
    }
}

#[async_trait]
impl CredentialIssuer for StaticCredentialIssuer {
    async fn issue(&self, _context: Option<&DebateContext>) -> Result<String, DebateError> {
        Ok(self.token.clone())
    }
}

/// Answers any offer with a minimal answer.
#[derive(Debug, Clone, Default)]
pub struct LoopbackSignaling;

#[async_trait]
impl SignalingEndpoint for LoopbackSignaling {
    async fn exchange(&self, offer_sdp: &str, token: &str) -> Result<String, DebateError> {
        if token.is_empty() {
            return Err(DebateError::SignalingError("401 Unauthorized".to_string()));
        }
        if !offer_sdp.starts_with("v=0") {
            return Err(DebateError::SignalingError("400 Bad Request".to_string()));
        }
        Ok(LOOPBACK_ANSWER.to_string())
    }
}

const LOOPBACK_OFFER: &str = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\nm=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n";
const LOOPBACK_ANSWER: &str = "v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\nm=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n";

/// Square wave at a fixed amplitude; its RMS equals the amplitude.
#[derive(Debug, Clone)]
pub struct ConstantLevelProbe {
    level: f32,
}

impl ConstantLevelProbe {
    pub fn new(level: f32) -> Self {
        Self { level }
    }
}

impl AudioProbe for ConstantLevelProbe {
    fn time_domain(&mut self) -> Vec<f32> {
        (0..128)
            .map(|i| if i % 2 == 0 { self.level } else { -self.level })
            .collect()
    }
}

/// Remote end of a loopback peer connection.
#[derive(Clone)]
pub struct LoopbackRemote {
    events: mpsc::UnboundedSender<PeerEvent>,
    outbound: Arc<Mutex<Vec<String>>>,
    open: Arc<AtomicBool>,
}

impl LoopbackRemote {
    /// Deliver a control-channel message to the session.
    pub fn push(&self, text: impl Into<String>) -> Result<(), DebateError> {
        self.push_event(PeerEvent::ChannelMessage(text.into()))
    }

    pub fn push_event(&self, event: PeerEvent) -> Result<(), DebateError> {
        self.events
            .send(event)
            .map_err(|_| DebateError::Transport("Session is no longer listening".to_string()))
    }

    /// Simulate the remote side dropping the connection.
    pub fn disconnect(&self) -> Result<(), DebateError> {
        self.open.store(false, Ordering::SeqCst);
        self.push_event(PeerEvent::Disconnected)
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Everything the session sent over the control channel so far.
    pub fn outbound(&self) -> Vec<String> {
        self.outbound.lock().map(|o| o.clone()).unwrap_or_default()
    }

    pub fn outbound_json(&self) -> Vec<Value> {
        self.outbound()
            .iter()
            .filter_map(|s| serde_json::from_str(s).ok())
            .collect()
    }

    /// Outbound message types, in send order.
    pub fn outbound_types(&self) -> Vec<String> {
        self.outbound_json()
            .iter()
            .filter_map(|v| v.get("type").and_then(Value::as_str).map(str::to_string))
            .collect()
    }

    /// Push each non-empty line as a message, pausing `pace` between lines.
    pub async fn replay_lines<I, S>(&self, lines: I, pace: Duration) -> Result<usize, DebateError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut sent = 0;
        for line in lines {
            let line = line.as_ref().trim();
            if line.is_empty() {
                continue;
            }
            self.push(line)?;
            sent += 1;
            if !pace.is_zero() {
                tokio::time::sleep(pace).await;
            }
        }
        Ok(sent)
    }
}

/// Creates loopback peers and keeps the remote handle of the latest one.
pub struct LoopbackConnector {
    latest: Arc<Mutex<Option<LoopbackRemote>>>,
    connections: AtomicUsize,
    probe_level: f32,
    announce_open: bool,
    teardown: TeardownLog,
}

impl Default for LoopbackConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackConnector {
    pub fn new() -> Self {
        Self::with_probe_level(0.25)
    }

    /// Level reported by the inbound track's probe once connected.
    pub fn with_probe_level(level: f32) -> Self {
        Self {
            latest: Arc::new(Mutex::new(None)),
            connections: AtomicUsize::new(0),
            probe_level: level,
            announce_open: true,
            teardown: TeardownLog::default(),
        }
    }

    /// Open the channel on answer without announcing it; the test delivers
    /// `PeerEvent::ChannelOpen` itself through the remote handle.
    pub fn with_deferred_open(mut self) -> Self {
        self.announce_open = false;
        self
    }

    /// Record peer and channel teardown into `log`.
    pub fn with_teardown_log(mut self, log: TeardownLog) -> Self {
        self.teardown = log;
        self
    }

    /// Remote handle of the most recent connection.
    pub fn remote(&self) -> Option<LoopbackRemote> {
        self.latest.lock().ok().and_then(|r| r.clone())
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerConnector for LoopbackConnector {
    async fn connect(
        &self,
    ) -> Result<(Box<dyn PeerSession>, mpsc::UnboundedReceiver<PeerEvent>), DebateError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let remote = LoopbackRemote {
            events: tx.clone(),
            outbound: Arc::new(Mutex::new(Vec::new())),
            open: Arc::new(AtomicBool::new(false)),
        };
        if let Ok(mut latest) = self.latest.lock() {
            *latest = Some(remote.clone());
        }
        self.connections.fetch_add(1, Ordering::SeqCst);

        let peer = LoopbackPeer {
            remote,
            tracks: Vec::new(),
            channel_created: false,
            probe_level: self.probe_level,
            announce_open: self.announce_open,
            teardown: self.teardown.clone(),
        };
        Ok((Box::new(peer), rx))
    }
}

struct LoopbackPeer {
    remote: LoopbackRemote,
    tracks: Vec<String>,
    channel_created: bool,
    probe_level: f32,
    announce_open: bool,
    teardown: TeardownLog,
}

#[async_trait]
impl PeerSession for LoopbackPeer {
    fn add_local_track(&mut self, audio: &dyn LocalAudio) -> Result<(), DebateError> {
        self.tracks.push(audio.track_id().to_string());
        Ok(())
    }

    fn create_control_channel(&mut self, label: &str) -> Result<Box<dyn ControlChannel>, DebateError> {
        self.channel_created = true;
        Ok(Box::new(LoopbackChannel {
            label: label.to_string(),
            outbound: self.remote.outbound.clone(),
            open: self.remote.open.clone(),
            teardown: self.teardown.clone(),
        }))
    }

    async fn create_offer(&mut self) -> Result<String, DebateError> {
        if self.tracks.is_empty() || !self.channel_created {
            return Err(DebateError::Transport(
                "Offer needs an audio track and a data channel".to_string(),
            ));
        }
        Ok(LOOPBACK_OFFER.to_string())
    }

    async fn set_remote_answer(&mut self, sdp: &str) -> Result<(), DebateError> {
        if !sdp.starts_with("v=0") {
            return Err(DebateError::SignalingError("Malformed answer".to_string()));
        }
        self.remote.open.store(true, Ordering::SeqCst);
        self.remote.push_event(PeerEvent::TrackAdded(Box::new(ConstantLevelProbe::new(
            self.probe_level,
        ))))?;
        if self.announce_open {
            self.remote.push_event(PeerEvent::ChannelOpen)?;
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.remote.open.store(false, Ordering::SeqCst);
        self.teardown.record("peer");
    }
}

struct LoopbackChannel {
    label: String,
    outbound: Arc<Mutex<Vec<String>>>,
    open: Arc<AtomicBool>,
    teardown: TeardownLog,
}

impl ControlChannel for LoopbackChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn send(&self, text: &str) -> Result<(), DebateError> {
        if !self.is_open() {
            return Err(DebateError::ChannelNotOpen);
        }
        self.outbound
            .lock()
            .map_err(|_| DebateError::Transport("Outbound log poisoned".to_string()))?
            .push(text.to_string());
        Ok(())
    }

    fn close(&mut self) {
        self.open.store(false, Ordering::SeqCst);
        self.teardown.record("channel");
    }
}

/// A loopback transport and the handles needed to drive it.
pub struct Loopback {
    pub media: Arc<LoopbackMedia>,
    pub connector: Arc<LoopbackConnector>,
}

impl Loopback {
    pub fn new() -> Self {
        Self::with_media(LoopbackMedia::new())
    }

    pub fn with_media(media: LoopbackMedia) -> Self {
        let connector = LoopbackConnector::new().with_teardown_log(media.teardown.clone());
        Self {
            media: Arc::new(media),
            connector: Arc::new(connector),
        }
    }

    /// Resources torn down so far, oldest first: `channel`, `peer` and
    /// `microphone` entries.
    pub fn teardown_log(&self) -> Vec<&'static str> {
        self.media.teardown.entries()
    }

    pub fn deps(&self) -> TransportDeps {
        TransportDeps {
            media: self.media.clone(),
            issuer: Arc::new(StaticCredentialIssuer::new("loopback-token")),
            signaling: Arc::new(LoopbackSignaling),
            peers: self.connector.clone(),
        }
    }
}

impl Default for Loopback {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_peer_opens_channel_after_answer() {
        let loopback = Loopback::new();
        let deps = loopback.deps();

        let mut mic = deps.media.acquire_microphone().await.unwrap();
        let (mut peer, mut events) = deps.peers.connect().await.unwrap();
        peer.add_local_track(mic.as_ref()).unwrap();
        let channel = peer.create_control_channel("response").unwrap();
        assert!(!channel.is_open());
        assert!(channel.send("{}").is_err());

        let offer = peer.create_offer().await.unwrap();
        let answer = deps.signaling.exchange(&offer, "t").await.unwrap();
        peer.set_remote_answer(&answer).await.unwrap();

        assert!(matches!(events.recv().await, Some(PeerEvent::TrackAdded(_))));
        assert!(matches!(events.recv().await, Some(PeerEvent::ChannelOpen)));
        channel.send(r#"{"type":"response.create"}"#).unwrap();

        let remote = loopback.connector.remote().unwrap();
        assert_eq!(remote.outbound_types(), vec!["response.create"]);

        mic.stop();
        mic.stop();
        assert_eq!(loopback.media.stats().released(), 1);
        assert_eq!(loopback.teardown_log(), vec!["microphone"]);
    }

    #[tokio::test]
    async fn test_offer_requires_track_and_channel() {
        let connector = LoopbackConnector::new();
        let (mut peer, _events) = connector.connect().await.unwrap();
        assert!(peer.create_offer().await.is_err());
    }

    #[tokio::test]
    async fn test_denied_microphone() {
        let media = LoopbackMedia::denying();
        let err = media.acquire_microphone().await.err().unwrap();
        assert!(matches!(err, DebateError::MediaAccess(_)));
        assert_eq!(media.stats().acquired(), 0);
    }

    #[tokio::test]
    async fn test_replay_skips_blank_lines() {
        let connector = LoopbackConnector::new();
        let (_peer, mut events) = connector.connect().await.unwrap();
        let remote = connector.remote().unwrap();

        let sent = remote
            .replay_lines(["{\"type\":\"a\"}", "", "  ", "{\"type\":\"b\"}"], Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(sent, 2);
        assert!(matches!(events.recv().await, Some(PeerEvent::ChannelMessage(m)) if m.contains("\"a\"")));
        assert!(matches!(events.recv().await, Some(PeerEvent::ChannelMessage(m)) if m.contains("\"b\"")));
    }
}
