//! Control-channel wire vocabulary.
//!
//! Inbound events are decoded into [`ServerEvent`]; everything the core
//! sends back is a [`ClientEvent`]. Only the fields the session core reads
//! are modelled; unknown fields are ignored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tools::ToolDefinition;

/// Event received from the realtime endpoint.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted,

    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped,

    #[serde(rename = "input_audio_buffer.committed")]
    AudioCommitted,

    #[serde(rename = "conversation.item.input_audio_transcription")]
    PartialTranscript {
        #[serde(default)]
        transcript: Option<String>,
        #[serde(default)]
        text: Option<String>,
    },

    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    FinalTranscript {
        #[serde(default)]
        transcript: Option<String>,
    },

    #[serde(rename = "response.audio_transcript.delta")]
    AssistantDelta {
        #[serde(default)]
        delta: String,
    },

    #[serde(rename = "response.audio_transcript.done")]
    AssistantDone,

    #[serde(rename = "response.function_call_arguments.done")]
    FunctionCallDone {
        #[serde(default)]
        name: String,
        call_id: String,
        /// Usually a JSON-encoded object; some endpoints send the object itself.
        #[serde(default)]
        arguments: Value,
    },

    #[serde(rename = "response.done")]
    ResponseDone {
        #[serde(default)]
        response: Option<ResponseSummary>,
    },

    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        error: Option<ErrorDetail>,
    },

    #[serde(other)]
    Unrecognized,
}

impl ServerEvent {
    /// Short name of the event kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::SpeechStarted => "speech-started",
            ServerEvent::SpeechStopped => "speech-stopped",
            ServerEvent::AudioCommitted => "audio-committed",
            ServerEvent::PartialTranscript { .. } => "partial-transcript",
            ServerEvent::FinalTranscript { .. } => "final-transcript",
            ServerEvent::AssistantDelta { .. } => "assistant-text-delta",
            ServerEvent::AssistantDone => "assistant-done",
            ServerEvent::FunctionCallDone { .. } => "function-call-done",
            ServerEvent::ResponseDone { .. } => "response-done",
            ServerEvent::Error { .. } => "error",
            ServerEvent::Unrecognized => "unrecognized",
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ResponseSummary {
    #[serde(default)]
    pub usage: Option<TokenUsage>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ErrorDetail {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
}

/// Token counts reported by the endpoint at the end of a response.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

/// An inbound message exactly as received, kept for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawEvent {
    pub received_at: DateTime<Utc>,
    /// The message text byte for byte.
    pub text: String,
    /// Parsed JSON, or the verbatim text as a JSON string if it did not parse.
    pub payload: Value,
}

impl RawEvent {
    pub fn from_text(text: &str) -> Self {
        let payload =
            serde_json::from_str::<Value>(text).unwrap_or_else(|_| Value::String(text.to_string()));
        Self {
            received_at: Utc::now(),
            text: text.to_string(),
            payload,
        }
    }

    /// The wire `type` field, if present.
    pub fn kind(&self) -> Option<&str> {
        self.payload.get("type").and_then(Value::as_str)
    }
}

/// Event sent to the realtime endpoint.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionSettings },

    #[serde(rename = "response.create")]
    ResponseCreate {
        #[serde(skip_serializing_if = "Option::is_none")]
        response: Option<ResponseSettings>,
    },

    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate { item: ConversationItem },
}

impl ClientEvent {
    /// Ask the model to continue generating.
    pub fn continue_response() -> Self {
        ClientEvent::ResponseCreate { response: None }
    }

    /// Ask the model to respond following the given instructions.
    pub fn respond_with(instructions: impl Into<String>) -> Self {
        ClientEvent::ResponseCreate {
            response: Some(ResponseSettings {
                instructions: Some(instructions.into()),
            }),
        }
    }

    pub fn function_output(call_id: impl Into<String>, output: &Value) -> Self {
        ClientEvent::ConversationItemCreate {
            item: ConversationItem::FunctionCallOutput {
                call_id: call_id.into(),
                output: output.to_string(),
            },
        }
    }

    pub fn user_text(text: impl Into<String>) -> Self {
        ClientEvent::ConversationItemCreate {
            item: ConversationItem::Message {
                role: "user".to_string(),
                content: vec![ContentPart::InputText { text: text.into() }],
            },
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SessionSettings {
    pub modalities: Vec<String>,
    pub tools: Vec<ToolDefinition>,
    pub input_audio_transcription: TranscriptionSettings,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TranscriptionSettings {
    pub model: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ResponseSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type")]
pub enum ConversationItem {
    #[serde(rename = "function_call_output")]
    FunctionCallOutput {
        call_id: String,
        /// JSON-encoded result.
        output: String,
    },

    #[serde(rename = "message")]
    Message {
        role: String,
        content: Vec<ContentPart>,
    },
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type")]
pub enum ContentPart {
    #[serde(rename = "input_text")]
    InputText { text: String },
}
