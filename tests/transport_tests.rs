//! Wire-level tests for the Gemini transport against a local mock server.

use std::time::Duration;

use futures::StreamExt;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use vera::transport::{
    GeminiTransport, GeminiTransportConfig, ProviderState, ResearchTransport, ResumeToken,
};
use vera::types::{ProgressKind, ResearchError, ResearchRequest};

fn transport(server: &MockServer) -> GeminiTransport {
    let config = GeminiTransportConfig::new("test-key")
        .with_base_url(server.uri())
        .with_request_timeout(Duration::from_secs(5));
    GeminiTransport::new(config).unwrap()
}

#[tokio::test]
async fn test_submit_creates_background_interaction() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/interactions"))
        .and(header("x-goog-api-key", "test-key"))
        .and(body_partial_json(json!({
            "agent": "deep-research",
            "background": true,
            "input": { "query": "state of rust async" },
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "itx-1" })))
        .expect(1)
        .mount(&server)
        .await;

    let task_id = transport(&server)
        .submit(&ResearchRequest::new("state of rust async"))
        .await
        .unwrap();
    assert_eq!(task_id, "itx-1");
}

#[tokio::test]
async fn test_submit_without_interaction_id_is_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/interactions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;

    let err = transport(&server)
        .submit(&ResearchRequest::new("q"))
        .await
        .unwrap_err();
    assert!(matches!(err, ResearchError::ProviderFatal { .. }));
}

#[tokio::test]
async fn test_rejected_credentials_map_to_auth_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/interactions"))
        .respond_with(ResponseTemplate::new(401).set_body_string("API key not valid"))
        .mount(&server)
        .await;

    let err = transport(&server)
        .submit(&ResearchRequest::new("q"))
        .await
        .unwrap_err();
    assert!(matches!(err, ResearchError::Auth(_)));
}

#[tokio::test]
async fn test_poll_status_maps_provider_states() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/interactions/itx-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "in_progress" })))
        .mount(&server)
        .await;

    let status = transport(&server).poll_status("itx-1").await.unwrap();
    assert_eq!(status.state, ProviderState::Running);
}

#[tokio::test]
async fn test_fetch_result_carries_grounding_metadata() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/interactions/itx-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "completed",
            "outputs": {
                "text": "Final report.",
                "groundingMetadata": {
                    "groundingChunks": [
                        { "web": { "uri": "https://example.com/a", "title": "A" } }
                    ],
                    "groundingSupports": [
                        {
                            "segment": { "startIndex": 0, "endIndex": 13, "text": "Final report." },
                            "groundingChunkIndices": [0]
                        }
                    ]
                }
            }
        })))
        .mount(&server)
        .await;

    let raw = transport(&server).fetch_result("itx-1").await.unwrap();
    assert_eq!(raw.text, "Final report.");
    let grounding = raw.grounding.unwrap();
    assert_eq!(grounding.grounding_chunks.len(), 1);
    assert_eq!(grounding.grounding_supports.len(), 1);
}

#[tokio::test]
async fn test_stream_parses_ndjson_events() {
    let server = MockServer::start().await;
    let body = concat!(
        r#"{"eventType":"start","content":"research started","eventId":"evt-1"}"#,
        "\n",
        ": keepalive\n",
        r#"{"eventType":"thought","content":"weighing sources","eventId":"evt-2"}"#,
        "\n",
        r#"{"eventType":"usage","content":"ignored"}"#,
        "\n",
    );
    Mock::given(method("GET"))
        .and(path("/interactions/itx-1:stream"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(&server)
        .await;

    let transport = transport(&server);
    let stream = transport.open_stream("itx-1").await.unwrap();
    let events: Vec<_> = stream.map(|e| e.unwrap()).collect().await;

    assert_eq!(events.len(), 2);
    assert_eq!(events[0].kind, ProgressKind::Started);
    assert_eq!(events[1].kind, ProgressKind::Thought);
    assert_eq!(events[1].cursor.as_ref().unwrap().as_str(), "evt-2");
}

#[tokio::test]
async fn test_resume_sends_last_event_id() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/interactions/itx-1:stream"))
        .and(query_param("lastEventId", "evt-2"))
        .respond_with(ResponseTemplate::new(200).set_body_string(concat!(
            r#"{"eventType":"action","content":"search: rust 2026","eventId":"evt-3"}"#,
            "\n",
        )))
        .expect(1)
        .mount(&server)
        .await;

    let transport = transport(&server);
    let stream = transport
        .resume_stream("itx-1", &ResumeToken::new("evt-2"))
        .await
        .unwrap();
    let events: Vec<_> = stream.map(|e| e.unwrap()).collect().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].content, "search: rust 2026");
}

#[tokio::test]
async fn test_follow_up_references_previous_interaction() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/interactions"))
        .and(body_partial_json(json!({
            "model": "gemini-3-pro-preview",
            "previousInteractionId": "itx-1",
            "input": { "query": "and since 2024?" },
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "completed",
            "outputs": { "text": "concise answer" }
        })))
        .mount(&server)
        .await;

    let answer = transport(&server)
        .follow_up("itx-1", "and since 2024?", "gemini-3-pro-preview")
        .await
        .unwrap();
    assert_eq!(answer, "concise answer");
}
