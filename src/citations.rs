//! Citation extraction from provider grounding metadata.
//!
//! Turns raw provider output into ordered [`CitationRecord`]s mapped to
//! offsets in the final report text, resolving provider redirect URLs to
//! their destinations where possible. Resolution failures degrade to the
//! unresolved URL; they never drop a citation and never fail the task.

use crate::types::{CitationRecord, RawResearchOutput};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Resolves a (possibly redirect/shortened) URL to its final destination.
#[async_trait]
pub trait UrlResolver: Send + Sync {
    /// Returns the final URL, or `None` when resolution is unavailable or
    /// failed. Callers fall back to the input URL on `None`.
    async fn resolve(&self, url: &str) -> Option<String>;
}

/// Network-backed resolver following redirects with bounded retries.
pub struct HttpUrlResolver {
    client: reqwest::Client,
    max_attempts: u32,
}

impl HttpUrlResolver {
    /// Build a resolver with a per-request timeout. Construction only fails
    /// on a broken TLS backend, which is a configuration problem.
    pub fn new(timeout: Duration) -> crate::types::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .map_err(|e| {
                crate::types::ResearchError::Config(format!("http client init failed: {e}"))
            })?;
        Ok(Self {
            client,
            max_attempts: 2,
        })
    }
}

#[async_trait]
impl UrlResolver for HttpUrlResolver {
    async fn resolve(&self, url: &str) -> Option<String> {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return None;
        }

        for attempt in 1..=self.max_attempts {
            match self.client.head(url).send().await {
                Ok(response) => return Some(response.url().to_string()),
                Err(err) => {
                    tracing::debug!(url, attempt, error = %err, "url resolution attempt failed");
                }
            }
        }
        None
    }
}

/// Resolver that never performs network lookups; every citation keeps its
/// provider URL.
pub struct NoopResolver;

#[async_trait]
impl UrlResolver for NoopResolver {
    async fn resolve(&self, _url: &str) -> Option<String> {
        None
    }
}

/// Walks provider grounding metadata and produces normalized citations.
pub struct CitationExtractor {
    resolver: Arc<dyn UrlResolver>,
}

impl CitationExtractor {
    /// Extractor using the given resolver for redirect URLs.
    pub fn new(resolver: Arc<dyn UrlResolver>) -> Self {
        Self { resolver }
    }

    /// Extractor that skips redirect resolution entirely.
    pub fn without_resolution() -> Self {
        Self::new(Arc::new(NoopResolver))
    }

    /// Extract ordered citations from raw provider output.
    ///
    /// Missing or empty grounding metadata yields an empty vec, never an
    /// error. Records follow the order of grounding supports, then the
    /// order of chunk indices within a support. Each distinct URL is
    /// resolved at most once per extraction, so identical input yields
    /// identical records.
    pub async fn extract(&self, output: &RawResearchOutput) -> Vec<CitationRecord> {
        let Some(grounding) = output.grounding.as_ref() else {
            return Vec::new();
        };

        let mut resolved: HashMap<String, String> = HashMap::new();
        let mut records = Vec::new();

        for support in &grounding.grounding_supports {
            let (start, end, snippet) = match support.segment.as_ref() {
                Some(segment) => {
                    let snippet = if segment.text.is_empty() {
                        slice_text(&output.text, segment.start_index, segment.end_index)
                    } else {
                        segment.text.clone()
                    };
                    (segment.start_index, segment.end_index, snippet)
                }
                None => (0, 0, String::new()),
            };

            for &chunk_idx in &support.grounding_chunk_indices {
                let Some(web) = grounding
                    .grounding_chunks
                    .get(chunk_idx)
                    .and_then(|chunk| chunk.web.as_ref())
                else {
                    tracing::debug!(chunk_idx, "grounding support references missing chunk");
                    continue;
                };
                if web.uri.is_empty() {
                    continue;
                }

                let url = match resolved.get(&web.uri) {
                    Some(cached) => cached.clone(),
                    None => {
                        let final_url = self
                            .resolver
                            .resolve(&web.uri)
                            .await
                            .unwrap_or_else(|| web.uri.clone());
                        resolved.insert(web.uri.clone(), final_url.clone());
                        final_url
                    }
                };

                records.push(CitationRecord {
                    title: web.title.clone().unwrap_or_else(|| url.clone()),
                    url,
                    snippet: snippet.clone(),
                    start_offset: start,
                    end_offset: end,
                });
            }
        }

        records
    }
}

/// Byte-offset slice of the report text, empty when the offsets are out of
/// range or split a UTF-8 boundary.
fn slice_text(text: &str, start: usize, end: usize) -> String {
    if start >= end || end > text.len() {
        return String::new();
    }
    text.get(start..end).unwrap_or_default().to_string()
}
