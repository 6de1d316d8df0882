//! Network-level tests for redirect resolution, backed by a local mock
//! server.

use std::sync::Arc;
use std::time::Duration;

use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use vera::citations::{CitationExtractor, HttpUrlResolver, UrlResolver};
use vera::types::{
    GroundingChunk, GroundingMetadata, GroundingSupport, RawResearchOutput, TextSegment, WebSource,
};

async fn redirecting_server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path("/go"))
        .respond_with(
            ResponseTemplate::new(302)
                .insert_header("Location", format!("{}/landed", server.uri()).as_str()),
        )
        .mount(&server)
        .await;
    Mock::given(method("HEAD"))
        .and(path("/landed"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn test_resolver_follows_redirect_chain() {
    let server = redirecting_server().await;
    let resolver = HttpUrlResolver::new(Duration::from_secs(5)).unwrap();

    let resolved = resolver.resolve(&format!("{}/go", server.uri())).await;
    assert_eq!(resolved, Some(format!("{}/landed", server.uri())));
}

#[tokio::test]
async fn test_resolver_skips_non_http_schemes() {
    let resolver = HttpUrlResolver::new(Duration::from_secs(5)).unwrap();
    assert_eq!(resolver.resolve("ftp://example.com/file").await, None);
    assert_eq!(resolver.resolve("not a url").await, None);
}

#[tokio::test]
async fn test_resolver_returns_none_when_unreachable() {
    // Nothing listens on this port; both attempts fail fast.
    let resolver = HttpUrlResolver::new(Duration::from_millis(200)).unwrap();
    assert_eq!(resolver.resolve("http://127.0.0.1:1/x").await, None);
}

#[tokio::test]
async fn test_extraction_resolves_redirects_end_to_end() {
    let server = redirecting_server().await;
    let output = RawResearchOutput {
        text: "Verified claim.".to_string(),
        grounding: Some(GroundingMetadata {
            grounding_chunks: vec![GroundingChunk {
                web: Some(WebSource {
                    uri: format!("{}/go", server.uri()),
                    title: Some("Source".to_string()),
                }),
            }],
            grounding_supports: vec![GroundingSupport {
                segment: Some(TextSegment {
                    start_index: 0,
                    end_index: 15,
                    text: "Verified claim.".to_string(),
                }),
                grounding_chunk_indices: vec![0],
            }],
        }),
    };

    let extractor =
        CitationExtractor::new(Arc::new(HttpUrlResolver::new(Duration::from_secs(5)).unwrap()));
    let records = extractor.extract(&output).await;

    assert_eq!(records.len(), 1);
    assert_eq!(records[0].url, format!("{}/landed", server.uri()));
    assert_eq!(records[0].title, "Source");
    assert_eq!(records[0].snippet, "Verified claim.");
}
