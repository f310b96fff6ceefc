//! Configuration module for loading TOML config files.

use regex::Regex;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::DebateError;

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub realtime: RealtimeConfig,
    pub session: SessionConfig,
    pub analysis: AnalysisConfig,
    pub prompts: PromptsConfig,
}

/// Realtime endpoint settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    pub api_base: String,
    pub model: String,
    pub voice: String,
    pub transcription_model: String,
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-realtime-preview-2024-12-17".to_string(),
            voice: "alloy".to_string(),
            transcription_model: "whisper-1".to_string(),
            request_timeout_secs: 30,
            connect_timeout_secs: 10,
        }
    }
}

impl RealtimeConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Cadence of the session's periodic work.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub timer_tick_ms: u64,
    pub volume_tick_ms: u64,
    /// Delay between the model calling `end_debate` and the session stopping.
    pub end_debate_grace_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timer_tick_ms: 1000,
            volume_tick_ms: 100,
            end_debate_grace_ms: 2000,
        }
    }
}

/// Settings for the post-debate analysis request.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub model: String,
    pub temperature: f32,
    /// Retries after the first attempt.
    pub max_retries: u32,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            temperature: 0.2,
            max_retries: 3,
        }
    }
}

/// Prompt templates. Placeholders look like `{topic}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PromptsConfig {
    pub system_prompt: String,
    pub initial_instructions: String,
    pub analysis: String,
}

impl Default for PromptsConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            initial_instructions: DEFAULT_INITIAL_INSTRUCTIONS.to_string(),
            analysis: DEFAULT_ANALYSIS_PROMPT.to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, DebateError> {
        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| DebateError::ConfigError(format!("Failed to read config: {}", e)))?;

        Self::from_str(&content)
    }

    /// Load configuration from string content.
    pub fn from_str(content: &str) -> Result<Self, DebateError> {
        toml::from_str(content)
            .map_err(|e| DebateError::ConfigError(format!("Failed to parse config: {}", e)))
    }

    /// Apply `OPENAI_API_BASE` / `OPENAI_BASE_URL` if either is set.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(base) = std::env::var("OPENAI_API_BASE").or_else(|_| std::env::var("OPENAI_BASE_URL")) {
            if !base.trim().is_empty() {
                self.realtime.api_base = base.trim_end_matches('/').to_string();
            }
        }
        self
    }
}

/// Default configuration embedded in the binary.
pub fn default_config() -> Config {
    Config::default()
}

/// Replace `{key}` placeholders with the given values.
///
/// Placeholders without a value are left untouched.
pub fn format_prompt<K, V>(template: &str, values: &[(K, V)]) -> String
where
    K: AsRef<str>,
    V: AsRef<str>,
{
    let Ok(re) = Regex::new(r"\{(\w+)\}") else {
        return template.to_string();
    };

    re.replace_all(template, |caps: &regex::Captures<'_>| {
        let key = &caps[1];
        values
            .iter()
            .find(|(k, _)| k.as_ref() == key)
            .map(|(_, v)| v.as_ref().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| caps[0].to_string())
    })
    .into_owned()
}

const DEFAULT_SYSTEM_PROMPT: &str = r#"You are DebateAI, a relentless debate opponent built for tight, structured, high-pressure practice debates. You are here to win with sharp logic and fast counters, not to help.

DEBATE SETUP:
- Debater: {username}
- Topic: {topic}
- Debater's stance: {userStance}
- Your stance: {aiStance}

HOW YOU DEBATE:
- Compete. Never help the debater prove their own points.
- Never praise an argument; answer it with a stronger one.
- If asked how to prove something, push the burden back on the debater.
- Cut in when the debater stalls or rambles.
- Match the debater's energy; if they get heated, call it out and return to logic.
- Shut down attempts to drift off-topic.
- Talk like a person: natural pauses, the odd filler word, varied sentences.
- Keep every reply to two or three lines.
- If you cannot counter a point, concede in one short sentence.

TIMING:
- Near the four minute mark, press the debater after every argument.
- Near the five minute mark, end the debate even mid-sentence.
- Close with a single line that the debate on {topic} has concluded.
"#;

const DEFAULT_INITIAL_INSTRUCTIONS: &str = "Greet the user and open the debate. Alright, {username}, let's go. This debate on {topic} won't be easy for you. Who's starting, you or me?";

const DEFAULT_ANALYSIS_PROMPT: &str = r#"Analyze the following debate transcript as an expert debate coach. Cover argument structure and logic, rhetorical skill, debate strategy, areas for improvement and an overall assessment with a 1-10 effectiveness score.

Debate Topic: {topic}
Debater's Stance: {stance}
Duration: {duration} minutes

Transcript:
{transcript}

Respond with JSON only, using exactly this structure:
{
  "argument_analysis": {
    "main_arguments": string[],
    "reasoning_quality": string,
    "evidence_usage": string,
    "logical_fallacies": string[]
  },
  "rhetorical_analysis": {
    "persuasiveness_score": number,
    "clarity_score": number,
    "language_effectiveness": string,
    "notable_phrases": string[]
  },
  "strategy_analysis": {
    "opening_effectiveness": string,
    "counterargument_handling": string,
    "time_management": string,
    "overall_strategy": string
  },
  "improvement_areas": {
    "priority_improvements": string[],
    "practice_suggestions": string[],
    "specific_examples": string[]
  },
  "overall_assessment": {
    "key_strengths": string[],
    "learning_points": string[],
    "effectiveness_score": number,
    "summary": string
  }
}"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_file() {
        let config = default_config();
        assert_eq!(config.realtime.voice, "alloy");
        assert_eq!(config.realtime.transcription_model, "whisper-1");
        assert_eq!(config.session.timer_tick_ms, 1000);
        assert_eq!(config.session.volume_tick_ms, 100);
        assert!(config.prompts.system_prompt.contains("{aiStance}"));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_str(
            r#"
            [realtime]
            voice = "verse"

            [analysis]
            model = "llama3:8b"
            "#,
        )
        .unwrap();

        assert_eq!(config.realtime.voice, "verse");
        assert_eq!(config.realtime.model, RealtimeConfig::default().model);
        assert_eq!(config.analysis.model, "llama3:8b");
        assert_eq!(config.analysis.max_retries, 3);
        assert_eq!(config.session.end_debate_grace_ms, 2000);
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = Config::from_str("[realtime\nvoice=").unwrap_err();
        assert!(matches!(err, DebateError::ConfigError(_)));
    }

    #[test]
    fn test_format_prompt_replaces_known_keys() {
        let out = format_prompt("{username} on {topic}", &[("username", "Ada"), ("topic", "AI")]);
        assert_eq!(out, "Ada on AI");
    }

    #[test]
    fn test_format_prompt_leaves_unknown_and_empty_keys() {
        let out = format_prompt("{username} vs {opponent}", &[("username", "")]);
        assert_eq!(out, "{username} vs {opponent}");
    }

    #[test]
    fn test_format_prompt_ignores_json_braces() {
        let out = format_prompt("{\n  \"a\": {topic}\n}", &[("topic", "x")]);
        assert_eq!(out, "{\n  \"a\": x\n}");
    }
}
