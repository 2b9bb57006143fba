//! Startup and shutdown markers

use tracing::{error, info};

use crate::annotation::{AnnotationRequest, AnnotationSink};

/// Publishes `"<id> starting up"` and `"<id> shutting down"` annotations,
/// each at most once. Failures are logged, never returned.
#[derive(Debug)]
pub struct LifecycleAnnouncer {
    identity: String,
    tags: Vec<String>,
    started: bool,
    stopped: bool,
}

impl LifecycleAnnouncer {
    pub fn new(identity: impl Into<String>, tags: Vec<String>) -> Self {
        Self {
            identity: identity.into(),
            tags,
            started: false,
            stopped: false,
        }
    }

    pub fn has_started(&self) -> bool {
        self.started
    }

    /// Returns true if this call published the marker
    pub async fn announce_startup<S>(&mut self, sink: &S) -> bool
    where
        S: AnnotationSink + ?Sized,
    {
        if self.started {
            return false;
        }
        self.started = true;
        self.announce(sink, "starting up").await;
        true
    }

    /// Returns true if this call published the marker
    pub async fn announce_shutdown<S>(&mut self, sink: &S) -> bool
    where
        S: AnnotationSink + ?Sized,
    {
        if self.stopped {
            return false;
        }
        self.stopped = true;
        self.announce(sink, "shutting down").await;
        true
    }

    async fn announce<S>(&self, sink: &S, what: &str)
    where
        S: AnnotationSink + ?Sized,
    {
        let text = format!("{} {}", self.identity, what);
        let request = AnnotationRequest::new(text, self.tags.clone());
        info!("Publishing annotation: {} ({})", request.text, request.tags.join(","));
        if let Err(e) = sink.create(&request).await {
            error!("Could not publish {} annotation: {}", what, e);
        }
    }
}
