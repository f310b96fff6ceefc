//! HTTP side of session setup: minting the ephemeral credential and the
//! SDP offer/answer exchange against the realtime API.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{format_prompt, Config, RealtimeConfig};
use crate::context::DebateContext;
use crate::error::DebateError;
use crate::transport::{CredentialIssuer, SignalingEndpoint};

/// Body of the credential request.
#[derive(Debug, Clone, Serialize)]
pub struct SessionRequest {
    pub model: String,
    pub voice: String,
    pub modalities: Vec<String>,
    pub instructions: String,
    pub tool_choice: String,
}

impl SessionRequest {
    /// Build the request for a debate; a missing context uses the defaults.
    pub fn for_debate(config: &Config, context: Option<&DebateContext>) -> Self {
        let values = DebateContext::prompt_values(context);
        Self {
            model: config.realtime.model.clone(),
            voice: config.realtime.voice.clone(),
            modalities: vec!["audio".to_string(), "text".to_string()],
            instructions: format_prompt(&config.prompts.system_prompt, &values),
            tool_choice: "auto".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    client_secret: Option<ClientSecret>,
}

#[derive(Debug, Deserialize)]
struct ClientSecret {
    value: String,
}

/// Pull the ephemeral token out of a credential response body.
pub fn parse_credential(body: &str) -> Result<String, DebateError> {
    let response: SessionResponse = serde_json::from_str(body)
        .map_err(|e| DebateError::CredentialFetch(format!("Invalid session response: {}", e)))?;
    response
        .client_secret
        .map(|s| s.value)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| DebateError::CredentialFetch("Response has no client secret".to_string()))
}

fn http_client(realtime: &RealtimeConfig) -> Result<reqwest::Client, DebateError> {
    Ok(reqwest::Client::builder()
        .timeout(realtime.request_timeout())
        .connect_timeout(realtime.connect_timeout())
        .build()?)
}

fn endpoint(api_base: &str, path: &str) -> String {
    format!("{}/{}", api_base.trim_end_matches('/'), path)
}

/// Mints ephemeral credentials with the long-lived API key.
pub struct HttpCredentialIssuer {
    client: reqwest::Client,
    config: Config,
    api_key: String,
}

impl HttpCredentialIssuer {
    pub fn new(config: Config, api_key: impl Into<String>) -> Result<Self, DebateError> {
        let api_key = api_key.into();
        if api_key.is_empty() {
            return Err(DebateError::ConfigError("OPENAI_API_KEY is not set".to_string()));
        }
        Ok(Self {
            client: http_client(&config.realtime)?,
            config,
            api_key,
        })
    }

    pub fn url(&self) -> String {
        endpoint(&self.config.realtime.api_base, "realtime/sessions")
    }
}

#[async_trait]
impl CredentialIssuer for HttpCredentialIssuer {
    async fn issue(&self, context: Option<&DebateContext>) -> Result<String, DebateError> {
        let request = SessionRequest::for_debate(&self.config, context);
        tracing::debug!(model = %request.model, voice = %request.voice, "Requesting ephemeral credential");

        let response = self
            .client
            .post(self.url())
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| DebateError::CredentialFetch(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| DebateError::CredentialFetch(e.to_string()))?;
        if !status.is_success() {
            tracing::error!(status = %status, "Credential request rejected");
            return Err(DebateError::CredentialFetch(format!(
                "API request failed with status {}",
                status
            )));
        }
        parse_credential(&body)
    }
}

/// Posts the offer SDP and returns the answer SDP.
pub struct HttpSignaling {
    client: reqwest::Client,
    realtime: RealtimeConfig,
}

impl HttpSignaling {
    pub fn new(realtime: RealtimeConfig) -> Result<Self, DebateError> {
        Ok(Self {
            client: http_client(&realtime)?,
            realtime,
        })
    }

    pub fn url(&self) -> String {
        format!(
            "{}?model={}&voice={}",
            endpoint(&self.realtime.api_base, "realtime"),
            self.realtime.model,
            self.realtime.voice
        )
    }
}

#[async_trait]
impl SignalingEndpoint for HttpSignaling {
    async fn exchange(&self, offer_sdp: &str, token: &str) -> Result<String, DebateError> {
        let response = self
            .client
            .post(self.url())
            .bearer_auth(token)
            .header(reqwest::header::CONTENT_TYPE, "application/sdp")
            .body(offer_sdp.to_string())
            .send()
            .await
            .map_err(|e| DebateError::SignalingError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DebateError::SignalingError(format!(
                "Offer rejected with status {}",
                status
            )));
        }
        let answer = response
            .text()
            .await
            .map_err(|e| DebateError::SignalingError(e.to_string()))?;
        if answer.trim().is_empty() {
            return Err(DebateError::SignalingError("Empty answer".to_string()));
        }
        tracing::debug!(bytes = answer.len(), "Received answer SDP");
        Ok(answer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_config;
    use crate::context::Stance;

    #[test]
    fn test_request_uses_context() {
        let mut config = default_config();
        config.prompts.system_prompt =
            "{username} argues {userStance} on {topic}; you argue {aiStance}".to_string();
        let ctx = DebateContext::new("Ada", "Nuclear power", Stance::Against);

        let request = SessionRequest::for_debate(&config, Some(&ctx));
        assert_eq!(request.instructions, "Ada argues AGAINST on Nuclear power; you argue FOR");
        assert_eq!(request.modalities, vec!["audio", "text"]);
        assert_eq!(request.tool_choice, "auto");
        assert_eq!(request.voice, "alloy");
    }

    #[test]
    fn test_request_defaults_without_context() {
        let mut config = default_config();
        config.prompts.system_prompt = "{username}/{topic}/{userStance}/{aiStance}".to_string();
        let request = SessionRequest::for_debate(&config, None);
        assert_eq!(request.instructions, "User/General Debate Topic/FOR/AGAINST");
    }

    #[test]
    fn test_parse_credential() {
        let body = r#"{"id":"sess_1","client_secret":{"value":"ek_abc","expires_at":0}}"#;
        assert_eq!(parse_credential(body).unwrap(), "ek_abc");

        assert!(matches!(
            parse_credential(r#"{"id":"sess_1"}"#),
            Err(DebateError::CredentialFetch(_))
        ));
        assert!(matches!(
            parse_credential("not json"),
            Err(DebateError::CredentialFetch(_))
        ));
    }

    #[test]
    fn test_urls() {
        let mut config = default_config();
        config.realtime.api_base = "http://localhost:8080/v1/".to_string();

        let issuer = HttpCredentialIssuer::new(config.clone(), "sk-test").unwrap();
        assert_eq!(issuer.url(), "http://localhost:8080/v1/realtime/sessions");

        let signaling = HttpSignaling::new(config.realtime.clone()).unwrap();
        assert_eq!(
            signaling.url(),
            "http://localhost:8080/v1/realtime?model=gpt-4o-realtime-preview-2024-12-17&voice=alloy"
        );
    }

    #[test]
    fn test_issuer_requires_key() {
        assert!(matches!(
            HttpCredentialIssuer::new(default_config(), ""),
            Err(DebateError::ConfigError(_))
        ));
    }
}
