//! Debate context supplied by the user before a session starts.
//!
//! The context is immutable for the lifetime of a session; the AI opponent
//! always argues the opposite stance.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::DebateError;

/// Side of the motion the user argues.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Stance {
    #[serde(rename = "FOR")]
    For,
    #[serde(rename = "AGAINST")]
    Against,
}

impl Stance {
    pub fn display_name(&self) -> &'static str {
        match self {
            Stance::For => "FOR",
            Stance::Against => "AGAINST",
        }
    }

    /// The stance taken by the AI opponent.
    pub fn opposite(&self) -> Stance {
        match self {
            Stance::For => Stance::Against,
            Stance::Against => Stance::For,
        }
    }
}

impl fmt::Display for Stance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl FromStr for Stance {
    type Err = DebateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "FOR" => Ok(Stance::For),
            "AGAINST" => Ok(Stance::Against),
            other => Err(DebateError::ConfigError(format!(
                "Unknown stance '{}', expected FOR or AGAINST",
                other
            ))),
        }
    }
}

/// Who is debating, what about, and from which side.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DebateContext {
    pub username: String,
    pub topic: String,
    pub stance: Stance,
}

impl DebateContext {
    pub fn new(username: impl Into<String>, topic: impl Into<String>, stance: Stance) -> Self {
        Self {
            username: username.into(),
            topic: topic.into(),
            stance,
        }
    }

    /// Placeholder values for the system prompt template.
    ///
    /// Missing context falls back to a generic user and topic arguing FOR.
    pub fn prompt_values(context: Option<&DebateContext>) -> Vec<(&'static str, String)> {
        let username = context
            .map(|c| c.username.clone())
            .filter(|u| !u.trim().is_empty())
            .unwrap_or_else(|| "User".to_string());
        let topic = context
            .map(|c| c.topic.clone())
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| "General Debate Topic".to_string());
        let stance = context.map(|c| c.stance).unwrap_or(Stance::For);

        vec![
            ("username", username),
            ("topic", topic),
            ("userStance", stance.display_name().to_string()),
            ("aiStance", stance.opposite().display_name().to_string()),
        ]
    }
}
