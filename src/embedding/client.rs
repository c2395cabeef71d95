//! Bespoke multi-API embedding client.
//!
//! Speaks the configured embedding API's wire contract directly: a
//! `query_format`/`document_format` template applied per input, a POST body
//! of `{"content": [...]}`, bearer auth, and a response that is either a
//! top-level array or a `{"data": [...]}` wrapper of `{"embedding": [...]}`
//! entries (each `embedding` may itself be wrapped in one more array level —
//! both shapes are accepted). Retries are the caller's responsibility (the
//! updater retries at the batch level); this client fails fast.

use crate::config::ApiConfig;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("embedding protocol error: {0}")]
    Protocol(String),
    #[error("embedding transport error: {0}")]
    Transport(String),
}

impl From<reqwest::Error> for EmbedError {
    fn from(err: reqwest::Error) -> Self {
        EmbedError::Transport(err.to_string())
    }
}

/// Whether a text is a user query or a corpus document; some APIs apply a
/// different template or prefix for each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedKind {
    Query,
    Document,
}

pub struct EmbeddingClient {
    http: reqwest::Client,
    api: ApiConfig,
    vector_dim: usize,
}

impl EmbeddingClient {
    pub fn new(api: ApiConfig, vector_dim: usize, timeout_ms: u64) -> Result<Self, EmbedError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .map_err(|e| EmbedError::Transport(e.to_string()))?;
        Ok(Self { http, api, vector_dim })
    }

    /// Encode `texts` as `kind` (query or document) via the configured API.
    /// Returns one vector per input text, in input order, each of length
    /// `vector_dim`.
    pub async fn encode(&self, texts: &[String], kind: EmbedKind) -> Result<Vec<Vec<f32>>, EmbedError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let format = match kind {
            EmbedKind::Query => &self.api.query_format,
            EmbedKind::Document => &self.api.document_format,
        };
        if !format.contains("{}") {
            return Err(EmbedError::Protocol(format!(
                "embedding API '{}' format template is missing a '{{}}' placeholder",
                self.api.id
            )));
        }

        let formatted: Vec<String> = texts.iter().map(|t| format.replacen("{}", t, 1)).collect();

        let response = self
            .http
            .post(&self.api.api_url)
            .header("Authorization", format!("Bearer {}", self.api.api_key))
            .json(&serde_json::json!({ "content": formatted }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EmbedError::Protocol(format!(
                "embedding API '{}' returned {}: {}",
                self.api.id, status, body
            )));
        }

        let body: serde_json::Value = response.json().await?;
        let vectors = parse_embedding_response(&body, texts.len())?;

        for v in &vectors {
            if v.len() != self.vector_dim {
                return Err(EmbedError::Protocol(format!(
                    "embedding API '{}' returned a {}-dim vector, expected {}",
                    self.api.id,
                    v.len(),
                    self.vector_dim
                )));
            }
        }

        Ok(vectors)
    }

    /// L2 norm self-test hook: not enforced on the hot path, available for
    /// sanity-checking a provider's output during setup or diagnostics.
    pub fn calculate_l2_norm(vec: &[f32]) -> f32 {
        vec.iter().map(|v| v * v).sum::<f32>().sqrt()
    }
}

fn parse_embedding_response(body: &serde_json::Value, expected: usize) -> Result<Vec<Vec<f32>>, EmbedError> {
    let items = if let Some(arr) = body.as_array() {
        arr.iter().collect::<Vec<_>>()
    } else if let Some(arr) = body.get("data").and_then(|d| d.as_array()) {
        arr.iter().collect::<Vec<_>>()
    } else {
        return Err(EmbedError::Protocol("unexpected embedding response format".to_string()));
    };

    if items.len() != expected {
        return Err(EmbedError::Protocol(format!(
            "embedding response had {} entries, expected {}",
            items.len(),
            expected
        )));
    }

    items.iter().map(|item| extract_embedding(item)).collect()
}

fn extract_embedding(item: &serde_json::Value) -> Result<Vec<f32>, EmbedError> {
    let embedding = item
        .get("embedding")
        .and_then(|e| e.as_array())
        .ok_or_else(|| EmbedError::Protocol("missing or invalid 'embedding' field".to_string()))?;

    // Some servers wrap the vector in one more array level (`embedding[0]`).
    let values = match embedding.first() {
        Some(serde_json::Value::Array(inner)) => inner,
        _ => embedding,
    };

    values
        .iter()
        .map(|v| v.as_f64().map(|f| f as f32).ok_or_else(|| EmbedError::Protocol("non-numeric value in embedding data".to_string())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calculate_l2_norm_matches_euclidean_length() {
        let v = vec![3.0f32, 4.0];
        assert!((EmbeddingClient::calculate_l2_norm(&v) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn parses_flat_top_level_array_response() {
        let body = serde_json::json!([
            { "embedding": [0.1, 0.2, 0.3] },
            { "embedding": [0.4, 0.5, 0.6] },
        ]);
        let vectors = parse_embedding_response(&body, 2).unwrap();
        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors[0], vec![0.1, 0.2, 0.3]);
    }

    #[test]
    fn parses_nested_embedding_array() {
        let body = serde_json::json!([
            { "embedding": [[0.1, 0.2]] },
        ]);
        let vectors = parse_embedding_response(&body, 1).unwrap();
        assert_eq!(vectors[0], vec![0.1, 0.2]);
    }

    #[test]
    fn parses_data_wrapper_response() {
        let body = serde_json::json!({ "data": [{ "embedding": [0.5, 0.5] }] });
        let vectors = parse_embedding_response(&body, 1).unwrap();
        assert_eq!(vectors[0], vec![0.5, 0.5]);
    }

    #[test]
    fn rejects_mismatched_entry_count() {
        let body = serde_json::json!([{ "embedding": [0.1] }]);
        let err = parse_embedding_response(&body, 2).unwrap_err();
        assert!(matches!(err, EmbedError::Protocol(_)));
    }

    #[test]
    fn rejects_missing_embedding_field() {
        let body = serde_json::json!([{ "not_embedding": [0.1] }]);
        let err = parse_embedding_response(&body, 1).unwrap_err();
        assert!(matches!(err, EmbedError::Protocol(_)));
    }
}
