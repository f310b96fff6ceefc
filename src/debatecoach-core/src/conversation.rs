//! Conversation log.
//!
//! An append-only list of turns. User turns pass through an ephemeral
//! phase while speech is transcribed; assistant turns accumulate streamed
//! text until the model signals completion. Both "open" turns are tracked
//! by explicit pointers rather than by inspecting the tail of the log.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Placeholder shown while committed audio is being transcribed.
pub const PROCESSING_PLACEHOLDER: &str = "Processing speech...";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// Transcription state of a user turn.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TurnStatus {
    Speaking,
    Processing,
    Final,
}

/// One entry of the debate transcript.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationTurn {
    pub id: String,
    pub role: Role,
    pub text: String,
    /// RFC 3339 creation time.
    pub timestamp: String,
    pub is_final: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TurnStatus>,
}

impl ConversationTurn {
    fn new(role: Role, text: impl Into<String>, is_final: bool, status: Option<TurnStatus>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            text: text.into(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            is_final,
            status,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConversationLog {
    turns: Vec<ConversationTurn>,
    /// Index of the user turn still being transcribed.
    ephemeral_user: Option<usize>,
    /// Index of the assistant turn still receiving deltas.
    open_assistant: Option<usize>,
}

impl ConversationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Owned copy for the presentation layer.
    pub fn snapshot(&self) -> Vec<ConversationTurn> {
        self.turns.clone()
    }

    pub fn ephemeral_user(&self) -> Option<&ConversationTurn> {
        self.ephemeral_user.and_then(|i| self.turns.get(i))
    }

    pub fn open_assistant(&self) -> Option<&ConversationTurn> {
        self.open_assistant.and_then(|i| self.turns.get(i))
    }

    /// Return the ephemeral user turn, creating an empty one if needed.
    pub fn ensure_ephemeral_user(&mut self) -> &mut ConversationTurn {
        let index = match self.ephemeral_user {
            Some(i) => i,
            None => {
                self.turns.push(ConversationTurn::new(
                    Role::User,
                    "",
                    false,
                    Some(TurnStatus::Speaking),
                ));
                let i = self.turns.len() - 1;
                self.ephemeral_user = Some(i);
                i
            }
        };
        &mut self.turns[index]
    }

    /// Apply an update to the ephemeral user turn, if there is one.
    ///
    /// Returns false when no user turn is being transcribed.
    pub fn update_ephemeral_user<F>(&mut self, update: F) -> bool
    where
        F: FnOnce(&mut ConversationTurn),
    {
        match self.ephemeral_user.and_then(|i| self.turns.get_mut(i)) {
            Some(turn) => {
                update(turn);
                true
            }
            None => false,
        }
    }

    /// Finalize the ephemeral user turn and release the pointer so the next
    /// speech starts a fresh turn.
    pub fn finalize_ephemeral_user(&mut self, text: impl Into<String>) -> bool {
        let text = text.into();
        let updated = self.update_ephemeral_user(|turn| {
            turn.text = text;
            turn.is_final = true;
            turn.status = Some(TurnStatus::Final);
        });
        self.ephemeral_user = None;
        updated
    }

    pub fn clear_ephemeral_user(&mut self) {
        self.ephemeral_user = None;
    }

    /// Append streamed assistant text.
    ///
    /// Extends the open assistant turn while it is still the last entry of
    /// the log; otherwise a new assistant turn is opened. An open turn that
    /// has been overtaken by other turns is finalized first so at most one
    /// assistant turn is ever open.
    pub fn append_assistant_delta(&mut self, delta: &str) {
        let last = self.turns.len().checked_sub(1);
        if let Some(i) = self.open_assistant {
            if Some(i) == last {
                self.turns[i].text.push_str(delta);
                return;
            }
            self.turns[i].is_final = true;
        }

        self.turns
            .push(ConversationTurn::new(Role::Assistant, delta, false, None));
        self.open_assistant = Some(self.turns.len() - 1);
    }

    /// Mark the open assistant turn final. Returns false if none was open.
    pub fn finalize_assistant(&mut self) -> bool {
        match self.open_assistant.take() {
            Some(i) => {
                self.turns[i].is_final = true;
                true
            }
            None => false,
        }
    }

    /// Append a typed user message; text input has no ephemeral phase.
    pub fn push_final_user(&mut self, text: impl Into<String>) -> &ConversationTurn {
        self.turns.push(ConversationTurn::new(
            Role::User,
            text,
            true,
            Some(TurnStatus::Final),
        ));
        &self.turns[self.turns.len() - 1]
    }

    pub fn clear(&mut self) {
        self.turns.clear();
        self.ephemeral_user = None;
        self.open_assistant = None;
    }

    /// Plain `role: text` transcript, one line per turn.
    pub fn transcript_lines(&self) -> String {
        transcript_lines(&self.turns)
    }
}

/// Render turns as `role: text` lines.
pub fn transcript_lines(turns: &[ConversationTurn]) -> String {
    turns
        .iter()
        .map(|t| format!("{}: {}", t.role.as_str(), t.text))
        .collect::<Vec<_>>()
        .join("\n")
}
