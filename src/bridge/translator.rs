//! Message to annotation translation

use crate::annotation::AnnotationRequest;
use crate::connection::Message;

/// Turns broker messages into annotation requests.
///
/// The text is `"<topic>: <payload>"` with the payload read as UTF-8;
/// invalid sequences become U+FFFD instead of failing. Every request
/// carries the configured tags.
#[derive(Debug, Clone)]
pub struct EventTranslator {
    tags: Vec<String>,
}

impl EventTranslator {
    pub fn new(tags: Vec<String>) -> Self {
        Self { tags }
    }

    pub fn translate(&self, message: &Message) -> AnnotationRequest {
        let payload = String::from_utf8_lossy(&message.payload);
        AnnotationRequest {
            text: format!("{}: {}", message.topic, payload),
            tags: self.tags.clone(),
        }
    }
}
