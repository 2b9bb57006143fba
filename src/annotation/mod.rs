//! Annotation Store
//!
//! Records that mark events on dashboards, and the sink that stores them.

mod grafana;

pub use grafana::GrafanaClient;

use std::fmt;

use async_trait::async_trait;
use chrono::{Local, SecondsFormat, TimeZone};
use serde::{Deserialize, Serialize};

/// Error type for annotation operations
#[derive(Debug)]
pub enum AnnotationError {
    /// Request could not be sent or the response not read
    Http(reqwest::Error),
    /// Service answered with a non-success status
    Status { status: u16, body: String },
    /// Response body did not have the expected shape
    InvalidResponse(String),
}

impl fmt::Display for AnnotationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnnotationError::Http(e) => write!(f, "HTTP request failed: {}", e),
            AnnotationError::Status { status, body } => {
                write!(f, "unexpected status {}: {}", status, body)
            }
            AnnotationError::InvalidResponse(msg) => write!(f, "invalid response: {}", msg),
        }
    }
}

impl std::error::Error for AnnotationError {}

impl From<reqwest::Error> for AnnotationError {
    fn from(e: reqwest::Error) -> Self {
        AnnotationError::Http(e)
    }
}

/// Payload for creating an annotation; the service stamps the time
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnnotationRequest {
    pub text: String,
    pub tags: Vec<String>,
}

impl AnnotationRequest {
    pub fn new(text: impl Into<String>, tags: Vec<String>) -> Self {
        Self {
            text: text.into(),
            tags,
        }
    }
}

/// Stored annotation
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Annotation {
    #[serde(default)]
    pub id: i64,
    /// Milliseconds since the Unix epoch
    #[serde(default)]
    pub time: i64,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// One listing line: `<RFC3339 local time>: <text> (<tags>)`
pub fn format_annotation(annotation: &Annotation) -> String {
    let time = match Local.timestamp_millis_opt(annotation.time).single() {
        Some(t) => t.to_rfc3339_opts(SecondsFormat::Secs, true),
        None => annotation.time.to_string(),
    };
    format!(
        "{}: {} ({})",
        time,
        annotation.text,
        annotation.tags.join(",")
    )
}

/// Trait for annotation stores
#[async_trait]
pub trait AnnotationSink: Send + Sync {
    /// Store a new annotation, returning its id
    async fn create(&self, request: &AnnotationRequest) -> Result<i64, AnnotationError>;

    /// Annotations carrying every one of `tags`
    async fn list(&self, tags: &[String]) -> Result<Vec<Annotation>, AnnotationError>;
}
