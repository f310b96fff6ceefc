//! Media/transport manager.
//!
//! Owns the microphone stream, the peer connection and the control
//! channel for one session, and knows how to take them down again in a
//! fixed order regardless of how far the connection got.

use tokio::sync::mpsc;

use crate::config::Config;
use crate::context::DebateContext;
use crate::error::DebateError;
use crate::protocol::{ClientEvent, SessionSettings, TranscriptionSettings};
use crate::tools::ToolDefinition;
use crate::transport::{ControlChannel, LocalAudio, PeerEvent, PeerSession, TransportDeps};

/// Label of the control data channel.
pub const CONTROL_CHANNEL_LABEL: &str = "response";

pub struct MediaTransport {
    deps: TransportDeps,
    local_audio: Option<Box<dyn LocalAudio>>,
    peer: Option<Box<dyn PeerSession>>,
    channel: Option<Box<dyn ControlChannel>>,
}

impl MediaTransport {
    pub fn new(deps: TransportDeps) -> Self {
        Self {
            deps,
            local_audio: None,
            peer: None,
            channel: None,
        }
    }

    pub fn deps(&self) -> &TransportDeps {
        &self.deps
    }

    /// Keep an acquired microphone stream so it is released with the session.
    pub fn adopt_microphone(&mut self, audio: Box<dyn LocalAudio>) {
        if let Some(mut previous) = self.local_audio.replace(audio) {
            previous.stop();
        }
    }

    pub fn has_microphone(&self) -> bool {
        self.local_audio.is_some()
    }

    pub fn has_peer(&self) -> bool {
        self.peer.is_some()
    }

    /// Open the peer connection, attach the microphone track and create the
    /// control channel ahead of the offer.
    ///
    /// The peer is retained as soon as it exists, so a failure in a later
    /// step still gets it closed by [`MediaTransport::release`].
    pub async fn open_peer(&mut self) -> Result<mpsc::UnboundedReceiver<PeerEvent>, DebateError> {
        let (peer, events) = self.deps.peers.connect().await?;
        let peer = self.peer.insert(peer);

        if let Some(audio) = self.local_audio.as_deref() {
            peer.add_local_track(audio)?;
            tracing::debug!(track = audio.track_id(), "Attached local audio track");
        }

        let channel = peer.create_control_channel(CONTROL_CHANNEL_LABEL)?;
        tracing::debug!(label = channel.label(), "Created control channel");
        self.channel = Some(channel);

        Ok(events)
    }

    /// Generate the local offer and set it as the local description.
    pub async fn create_offer(&mut self) -> Result<String, DebateError> {
        let peer = self
            .peer
            .as_mut()
            .ok_or_else(|| DebateError::Transport("No peer connection".to_string()))?;
        peer.create_offer().await
    }

    pub async fn accept_answer(&mut self, sdp: &str) -> Result<(), DebateError> {
        if sdp.trim().is_empty() {
            return Err(DebateError::SignalingError("Empty answer".to_string()));
        }
        let peer = self
            .peer
            .as_mut()
            .ok_or_else(|| DebateError::Transport("No peer connection".to_string()))?;
        peer.set_remote_answer(sdp).await
    }

    pub fn is_channel_open(&self) -> bool {
        self.channel.as_ref().is_some_and(|c| c.is_open())
    }

    pub fn send(&self, event: &ClientEvent) -> Result<(), DebateError> {
        let channel = self
            .channel
            .as_ref()
            .filter(|c| c.is_open())
            .ok_or(DebateError::ChannelNotOpen)?;
        let text = event.to_json()?;
        channel.send(&text)?;
        tracing::trace!(bytes = text.len(), "-> control message");
        Ok(())
    }

    /// Send events in order, stopping at the first failure.
    pub fn send_all(&self, events: &[ClientEvent]) -> Result<(), DebateError> {
        for event in events {
            self.send(event)?;
        }
        Ok(())
    }

    /// Release the control channel, the peer connection and the local
    /// tracks, in that order. Only what was actually acquired is touched.
    pub async fn release(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            channel.close();
            tracing::debug!("Closed control channel");
        }
        if let Some(mut peer) = self.peer.take() {
            peer.close().await;
            tracing::debug!("Closed peer connection");
        }
        if let Some(mut audio) = self.local_audio.take() {
            audio.stop();
            tracing::debug!("Stopped local audio tracks");
        }
    }
}

/// Messages sent once the control channel opens: the session
/// configuration, then the opening instructions when a debate is set up.
pub fn session_configuration(
    config: &Config,
    tools: &[ToolDefinition],
    context: Option<&DebateContext>,
) -> Vec<ClientEvent> {
    let mut events = vec![ClientEvent::SessionUpdate {
        session: SessionSettings {
            modalities: vec!["text".to_string(), "audio".to_string()],
            tools: tools.to_vec(),
            input_audio_transcription: TranscriptionSettings {
                model: config.realtime.transcription_model.clone(),
            },
        },
    }];

    if let Some(context) = context {
        let instructions = crate::config::format_prompt(
            &config.prompts.initial_instructions,
            &[
                ("username", context.username.as_str()),
                ("topic", context.topic.as_str()),
            ],
        );
        events.push(ClientEvent::respond_with(instructions));
    }

    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_config;
    use crate::context::Stance;
    use crate::tools::debate_tools;
    use serde_json::Value;

    #[test]
    fn test_configuration_without_context() {
        let events = session_configuration(&default_config(), &debate_tools(), None);
        assert_eq!(events.len(), 1);

        let value: Value = serde_json::to_value(&events[0]).unwrap();
        assert_eq!(value["type"], "session.update");
        assert_eq!(value["session"]["modalities"][1], "audio");
        assert_eq!(value["session"]["tools"].as_array().unwrap().len(), 2);
        assert_eq!(value["session"]["input_audio_transcription"]["model"], "whisper-1");
    }

    #[test]
    fn test_configuration_with_context_adds_instructions() {
        let ctx = DebateContext::new("Ada", "Space exploration", Stance::For);
        let events = session_configuration(&default_config(), &[], Some(&ctx));
        assert_eq!(events.len(), 2);

        let value: Value = serde_json::to_value(&events[1]).unwrap();
        assert_eq!(value["type"], "response.create");
        let instructions = value["response"]["instructions"].as_str().unwrap();
        assert!(instructions.contains("Ada"));
        assert!(instructions.contains("Space exploration"));
    }
}
