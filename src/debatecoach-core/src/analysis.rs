//! Post-debate performance analysis through a chat-completion model.

use async_openai::Client;
use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessage,
    ChatCompletionRequestUserMessage, CreateChatCompletionRequest,
    CreateChatCompletionRequestArgs,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::{format_prompt, Config};
use crate::context::Stance;
use crate::conversation::{transcript_lines, ConversationTurn};
use crate::error::DebateError;

const COACH_SYSTEM_MESSAGE: &str = "You are an expert debate coach. Analyze debates and provide detailed feedback strictly in the JSON format requested.";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ArgumentAnalysis {
    pub main_arguments: Vec<String>,
    pub reasoning_quality: String,
    pub evidence_usage: String,
    pub logical_fallacies: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RhetoricalAnalysis {
    pub persuasiveness_score: f64,
    pub clarity_score: f64,
    pub language_effectiveness: String,
    pub notable_phrases: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StrategyAnalysis {
    pub opening_effectiveness: String,
    pub counterargument_handling: String,
    pub time_management: String,
    pub overall_strategy: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ImprovementAreas {
    pub priority_improvements: Vec<String>,
    pub practice_suggestions: Vec<String>,
    pub specific_examples: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OverallAssessment {
    pub key_strengths: Vec<String>,
    pub learning_points: Vec<String>,
    pub effectiveness_score: f64,
    pub summary: String,
}

/// Structured coaching feedback for one debate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DebateAnalysis {
    pub argument_analysis: ArgumentAnalysis,
    pub rhetorical_analysis: RhetoricalAnalysis,
    pub strategy_analysis: StrategyAnalysis,
    pub improvement_areas: ImprovementAreas,
    pub overall_assessment: OverallAssessment,
}

/// What the analyzer needs to know about a finished debate.
#[derive(Debug, Clone)]
pub struct AnalysisRequest<'a> {
    pub topic: &'a str,
    pub stance: Stance,
    pub duration: Duration,
    pub turns: &'a [ConversationTurn],
}

/// Fill the analysis template. Duration is rounded to whole minutes.
pub fn build_analysis_prompt(template: &str, request: &AnalysisRequest<'_>) -> String {
    let minutes = (request.duration.as_secs_f64() / 60.0).round() as u64;
    format_prompt(
        template,
        &[
            ("topic", request.topic.to_string()),
            ("stance", request.stance.display_name().to_string()),
            ("duration", minutes.to_string()),
            ("transcript", transcript_lines(request.turns)),
        ],
    )
}

/// Remove a surrounding Markdown code fence, with or without a language tag.
pub fn strip_code_fences(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => rest,
    };
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

pub fn parse_analysis(content: &str) -> Result<DebateAnalysis, DebateError> {
    serde_json::from_str(strip_code_fences(content))
        .map_err(|e| DebateError::AnalysisError(format!("Model returned invalid analysis: {}", e)))
}

/// Sends finished debates to a chat-completion model for feedback.
pub struct Analyzer {
    client: Client<OpenAIConfig>,
    config: Config,
}

impl Analyzer {
    pub fn new(config: Config, api_key: &str) -> Result<Self, DebateError> {
        let http_client = reqwest::Client::builder()
            .timeout(config.realtime.request_timeout())
            .connect_timeout(config.realtime.connect_timeout())
            .build()
            .map_err(|e| DebateError::ConfigError(format!("Failed to create HTTP client: {}", e)))?;

        let openai = OpenAIConfig::new()
            .with_api_key(api_key)
            .with_api_base(&config.realtime.api_base);

        Ok(Self {
            client: Client::with_config(openai).with_http_client(http_client),
            config,
        })
    }

    pub fn build_request(
        &self,
        request: &AnalysisRequest<'_>,
    ) -> Result<CreateChatCompletionRequest, DebateError> {
        let prompt = build_analysis_prompt(&self.config.prompts.analysis, request);
        let messages = vec![
            ChatCompletionRequestMessage::System(ChatCompletionRequestSystemMessage {
                content: COACH_SYSTEM_MESSAGE.into(),
                name: None,
            }),
            ChatCompletionRequestMessage::User(ChatCompletionRequestUserMessage {
                content: prompt.into(),
                name: None,
            }),
        ];

        Ok(CreateChatCompletionRequestArgs::default()
            .model(&self.config.analysis.model)
            .temperature(self.config.analysis.temperature)
            .messages(messages)
            .build()?)
    }

    pub async fn analyze(&self, request: &AnalysisRequest<'_>) -> Result<DebateAnalysis, DebateError> {
        if request.turns.is_empty() {
            return Err(DebateError::AnalysisError("Transcript is empty".to_string()));
        }
        let completion = self.build_request(request)?;
        tracing::info!(
            model = %self.config.analysis.model,
            turns = request.turns.len(),
            "Requesting debate analysis"
        );

        let max_retries = self.config.analysis.max_retries;
        let mut last_error = None;

        for attempt in 0..=max_retries {
            if attempt > 0 {
                let delay = retry_delay(attempt);
                tracing::warn!(attempt, delay_secs = delay.as_secs(), "Retrying analysis request");
                tokio::time::sleep(delay).await;
            }

            match self.client.chat().create(completion.clone()).await {
                Ok(response) => {
                    let content = response
                        .choices
                        .first()
                        .and_then(|c| c.message.content.clone())
                        .unwrap_or_default();
                    return parse_analysis(&content);
                }
                Err(e) => last_error = Some(e),
            }
        }

        Err(last_error.map(DebateError::from).unwrap_or_else(|| {
            DebateError::AnalysisError("Unknown API error after retries".to_string())
        }))
    }
}

/// Longest wait between analysis attempts.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Wait before retry number `attempt` (1-based): 1 s, 2 s, 4 s, ... capped
/// at [`MAX_RETRY_DELAY`].
fn retry_delay(attempt: u32) -> Duration {
    let secs = 2u64.saturating_pow(attempt.saturating_sub(1));
    Duration::from_secs(secs).min(MAX_RETRY_DELAY)
}
