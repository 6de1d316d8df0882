//! HTTP transport for a Gemini-style Interactions API.
//!
//! Research jobs are created as long-lived "interactions"; progress arrives
//! as a newline-delimited JSON event stream that can be resumed from the
//! last received event id. Status polls and the final payload go through
//! the interaction resource itself.

use crate::transport::{
    EventStream, ProviderState, ProviderStatus, ResearchTransport, ResumeToken, StreamEvent,
};
use crate::types::{
    GroundingMetadata, ProgressKind, RawResearchOutput, ResearchError, ResearchRequest, Result,
};
use async_stream::try_stream;
use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

/// Connection settings for [`GeminiTransport`].
#[derive(Debug, Clone)]
pub struct GeminiTransportConfig {
    /// Opaque API credential, sent as `x-goog-api-key`
    pub api_key: String,
    /// API root, default `https://generativelanguage.googleapis.com/v1beta`
    pub base_url: String,
    /// Agent identifier used for deep-research submissions
    pub research_agent: String,
    /// Timeout applied to every unary call (submit, poll, fetch, follow-up)
    pub request_timeout: Duration,
}

impl GeminiTransportConfig {
    /// Config with production defaults for the given credential.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            research_agent: "deep-research".to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }

    /// Point the transport at a different API root.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Use a different research agent identifier.
    pub fn with_research_agent(mut self, agent: impl Into<String>) -> Self {
        self.research_agent = agent.into();
        self
    }

    /// Set the per-call timeout for unary requests.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Production transport over reqwest.
pub struct GeminiTransport {
    /// Client for unary calls, carries the request timeout
    unary: reqwest::Client,
    /// Client for the event stream; only the connect phase is bounded here,
    /// read liveness is the orchestrator's concern
    streaming: reqwest::Client,
    config: GeminiTransportConfig,
}

impl GeminiTransport {
    /// Build the HTTP clients; fails only on a broken TLS backend.
    pub fn new(config: GeminiTransportConfig) -> Result<Self> {
        let unary = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ResearchError::Config(format!("http client init failed: {e}")))?;
        let streaming = reqwest::Client::builder()
            .connect_timeout(config.request_timeout)
            .build()
            .map_err(|e| ResearchError::Config(format!("http client init failed: {e}")))?;
        Ok(Self {
            unary,
            streaming,
            config,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn get_interaction(&self, task_id: &str) -> Result<InteractionResponse> {
        let response = self
            .unary
            .get(self.url(&format!("interactions/{task_id}")))
            .header("x-goog-api-key", &self.config.api_key)
            .send()
            .await
            .map_err(net_error)?;
        let response = check_status(response).await?;
        response
            .json::<InteractionResponse>()
            .await
            .map_err(|e| ResearchError::Transient(format!("malformed interaction body: {e}")))
    }

    fn open_event_stream(&self, task_id: &str, last_event_id: Option<&str>) -> EventStream {
        let mut request = self
            .streaming
            .get(self.url(&format!("interactions/{task_id}:stream")))
            .header("x-goog-api-key", &self.config.api_key);
        if let Some(cursor) = last_event_id {
            request = request.query(&[("lastEventId", cursor)]);
        }

        Box::pin(try_stream! {
            let response = request.send().await.map_err(net_error)?;
            let response = check_status(response).await?;
            let mut body = response.bytes_stream();
            let mut buffer = Vec::new();

            while let Some(chunk) = body.next().await {
                let chunk = chunk.map_err(net_error)?;
                buffer.extend_from_slice(&chunk);

                while let Some(newline) = buffer.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=newline).collect();
                    let line = String::from_utf8_lossy(&line);
                    if let Some(event) = parse_event_line(line.trim()) {
                        yield event;
                    }
                }
            }
        })
    }
}

#[async_trait]
impl ResearchTransport for GeminiTransport {
    async fn submit(&self, request: &ResearchRequest) -> Result<String> {
        let mut input = json!({ "query": request.query });
        if let Some(instructions) = &request.format_instructions {
            input["formatInstructions"] = json!(instructions);
        }
        if !request.file_search_stores.is_empty() {
            input["fileSearchStoreNames"] = json!(request.file_search_stores);
        }

        let response = self
            .unary
            .post(self.url("interactions"))
            .header("x-goog-api-key", &self.config.api_key)
            .json(&json!({
                "agent": self.config.research_agent,
                "background": true,
                "input": input,
            }))
            .send()
            .await
            .map_err(net_error)?;
        let response = check_status(response).await?;

        let created: CreatedInteraction = response
            .json()
            .await
            .map_err(|e| ResearchError::Transient(format!("malformed submit body: {e}")))?;
        if created.id.is_empty() {
            return Err(ResearchError::ProviderFatal {
                code: "NO_INTERACTION_ID".to_string(),
                message: "provider accepted the job but returned no interaction id".to_string(),
            });
        }
        tracing::info!(task_id = %created.id, "research interaction created");
        Ok(created.id)
    }

    async fn open_stream(&self, task_id: &str) -> Result<EventStream> {
        Ok(self.open_event_stream(task_id, None))
    }

    async fn resume_stream(&self, task_id: &str, token: &ResumeToken) -> Result<EventStream> {
        Ok(self.open_event_stream(task_id, Some(token.as_str())))
    }

    async fn poll_status(&self, task_id: &str) -> Result<ProviderStatus> {
        let interaction = self.get_interaction(task_id).await?;
        Ok(interaction.status())
    }

    async fn fetch_result(&self, task_id: &str) -> Result<RawResearchOutput> {
        let interaction = self.get_interaction(task_id).await?;
        let outputs = interaction.outputs.unwrap_or_default();
        Ok(RawResearchOutput {
            text: outputs.text,
            grounding: outputs.grounding_metadata,
        })
    }

    async fn follow_up(&self, task_id: &str, question: &str, model: &str) -> Result<String> {
        let response = self
            .unary
            .post(self.url("interactions"))
            .header("x-goog-api-key", &self.config.api_key)
            .json(&json!({
                "model": model,
                "previousInteractionId": task_id,
                "input": { "query": question },
            }))
            .send()
            .await
            .map_err(net_error)?;
        let response = check_status(response).await?;

        let interaction: InteractionResponse = response
            .json()
            .await
            .map_err(|e| ResearchError::Transient(format!("malformed follow-up body: {e}")))?;
        Ok(interaction.outputs.unwrap_or_default().text)
    }
}

// ============= Wire Types =============

#[derive(Debug, Deserialize)]
struct CreatedInteraction {
    #[serde(default)]
    id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InteractionResponse {
    #[serde(default)]
    status: String,
    #[serde(default)]
    error: Option<ProviderErrorBody>,
    #[serde(default)]
    outputs: Option<InteractionOutputs>,
}

#[derive(Debug, Deserialize)]
struct ProviderErrorBody {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InteractionOutputs {
    #[serde(default)]
    text: String,
    #[serde(default)]
    grounding_metadata: Option<GroundingMetadata>,
}

impl InteractionResponse {
    fn status(&self) -> ProviderStatus {
        let detail = self
            .error
            .as_ref()
            .map(|e| format!("{}: {}", e.code, e.message));
        let state = match self.status.as_str() {
            "completed" => ProviderState::Completed,
            "failed" => ProviderState::Failed,
            "cancelled" => ProviderState::Cancelled,
            // in_progress, pending, or anything the provider adds later
            _ => ProviderState::Running,
        };
        ProviderStatus { state, detail }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEvent {
    #[serde(default)]
    event_type: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    event_id: Option<String>,
}

/// Parse one NDJSON line into a stream event. Blank lines, comments, and
/// event types this crate does not track are skipped.
fn parse_event_line(line: &str) -> Option<StreamEvent> {
    if line.is_empty() || line.starts_with(':') {
        return None;
    }
    let wire: WireEvent = match serde_json::from_str(line) {
        Ok(wire) => wire,
        Err(err) => {
            tracing::debug!(error = %err, "skipping unparseable stream line");
            return None;
        }
    };

    let kind = match wire.event_type.as_str() {
        "start" => ProgressKind::Started,
        "thought" => ProgressKind::Thought,
        "action" => ProgressKind::Action,
        "error" => ProgressKind::Error,
        _ => return None,
    };

    let mut event = StreamEvent::new(kind, wire.content);
    if let Some(id) = wire.event_id {
        event = event.with_cursor(id);
    }
    Some(event)
}

fn net_error(err: reqwest::Error) -> ResearchError {
    if err.is_timeout() {
        ResearchError::Timeout(err.to_string())
    } else {
        ResearchError::Transient(err.to_string())
    }
}

/// Map HTTP status classes onto the error taxonomy.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let detail = if body.is_empty() {
        status.to_string()
    } else {
        format!("{status}: {body}")
    };

    Err(match status.as_u16() {
        401 | 403 => ResearchError::Auth(detail),
        429 => ResearchError::Transient(detail),
        400..=499 => ResearchError::PermanentRequest(detail),
        _ => ResearchError::Transient(detail),
    })
}
