//! Trait abstractions for the session's external collaborators.
//!
//! The session controller only talks to the microphone, the credential
//! issuer, the signaling endpoint and the peer connection through these
//! traits, so the whole lifecycle can run against in-process doubles.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::context::DebateContext;
use crate::error::DebateError;
use crate::volume::AudioProbe;

/// A captured local microphone stream.
pub trait LocalAudio: Send {
    /// Identifier of the audio track, used when attaching it to a peer.
    fn track_id(&self) -> &str;

    /// Stop every track of the stream. Must be safe to call twice.
    fn stop(&mut self);
}

/// Access to local capture devices.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire_microphone(&self) -> Result<Box<dyn LocalAudio>, DebateError>;
}

/// Issuer of short-lived credentials for the realtime endpoint.
#[async_trait]
pub trait CredentialIssuer: Send + Sync {
    async fn issue(&self, context: Option<&DebateContext>) -> Result<String, DebateError>;
}

/// One-shot offer/answer exchange with the realtime endpoint.
#[async_trait]
pub trait SignalingEndpoint: Send + Sync {
    /// Send the local offer SDP, returning the remote answer SDP.
    async fn exchange(&self, offer_sdp: &str, token: &str) -> Result<String, DebateError>;
}

/// Asynchronous notifications from a peer connection.
pub enum PeerEvent {
    /// Remote media track arrived; the probe reads its samples.
    TrackAdded(Box<dyn AudioProbe>),
    ChannelOpen,
    ChannelMessage(String),
    ChannelClosed,
    /// The peer connection failed or was closed by the remote side.
    Disconnected,
}

impl std::fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerEvent::TrackAdded(_) => f.write_str("TrackAdded"),
            PeerEvent::ChannelOpen => f.write_str("ChannelOpen"),
            PeerEvent::ChannelMessage(m) => write!(f, "ChannelMessage({} bytes)", m.len()),
            PeerEvent::ChannelClosed => f.write_str("ChannelClosed"),
            PeerEvent::Disconnected => f.write_str("Disconnected"),
        }
    }
}

/// Bidirectional control (data) channel.
pub trait ControlChannel: Send {
    fn label(&self) -> &str;

    fn is_open(&self) -> bool;

    fn send(&self, text: &str) -> Result<(), DebateError>;

    fn close(&mut self);
}

/// A live peer connection.
#[async_trait]
pub trait PeerSession: Send {
    fn add_local_track(&mut self, audio: &dyn LocalAudio) -> Result<(), DebateError>;

    /// Must be called before the offer is created so the channel is part
    /// of the same negotiation.
    fn create_control_channel(&mut self, label: &str) -> Result<Box<dyn ControlChannel>, DebateError>;

    /// Create an offer and apply it as the local description.
    async fn create_offer(&mut self) -> Result<String, DebateError>;

    async fn set_remote_answer(&mut self, sdp: &str) -> Result<(), DebateError>;

    async fn close(&mut self);
}

/// Factory for peer connections.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Open a new peer connection together with the stream of its events.
    async fn connect(
        &self,
    ) -> Result<(Box<dyn PeerSession>, mpsc::UnboundedReceiver<PeerEvent>), DebateError>;
}

/// The collaborators a session needs, bundled.
#[derive(Clone)]
pub struct TransportDeps {
    pub media: Arc<dyn MediaDevices>,
    pub issuer: Arc<dyn CredentialIssuer>,
    pub signaling: Arc<dyn SignalingEndpoint>,
    pub peers: Arc<dyn PeerConnector>,
}
