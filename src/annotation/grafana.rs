//! Grafana HTTP annotation client

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use tracing::debug;

use super::{Annotation, AnnotationError, AnnotationRequest, AnnotationSink};
use crate::config::{ConfigError, GrafanaConfig, GrafanaEndpoint};

const ANNOTATIONS_PATH: &str = "api/annotations";

#[derive(Debug, Clone)]
enum Credentials {
    None,
    Basic {
        username: String,
        password: Option<String>,
    },
    Bearer(String),
}

#[derive(Deserialize)]
struct CreatedAnnotation {
    id: i64,
}

/// Annotation sink backed by the Grafana HTTP API
#[derive(Clone)]
pub struct GrafanaClient {
    http: Client,
    endpoint: GrafanaEndpoint,
    credentials: Credentials,
}

impl GrafanaClient {
    /// Build a client from the `[grafana]` section. An API key takes
    /// precedence over credentials embedded in the URL.
    pub fn from_config(config: &GrafanaConfig) -> Result<Self, ConfigError> {
        let endpoint = config.endpoint()?;

        let credentials = match (&config.api_key, &endpoint.username) {
            (Some(key), _) if !key.is_empty() => Credentials::Bearer(key.clone()),
            (_, Some(username)) => Credentials::Basic {
                username: username.clone(),
                password: endpoint.password.clone(),
            },
            _ => Credentials::None,
        };

        let http = Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ConfigError::Validation(format!("HTTP client setup failed: {}", e)))?;

        Ok(Self {
            http,
            endpoint,
            credentials,
        })
    }

    /// Base URL without credentials, for log lines
    pub fn base_url(&self) -> &str {
        self.endpoint.base.as_str()
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.credentials {
            Credentials::None => request,
            Credentials::Basic { username, password } => {
                request.basic_auth(username, password.as_deref())
            }
            Credentials::Bearer(token) => request.bearer_auth(token),
        }
    }

    async fn check(response: Response) -> Result<Response, AnnotationError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(AnnotationError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl AnnotationSink for GrafanaClient {
    async fn create(&self, request: &AnnotationRequest) -> Result<i64, AnnotationError> {
        let url = self.endpoint.api_url(ANNOTATIONS_PATH);
        let response = self
            .authorize(self.http.post(&url))
            .json(request)
            .send()
            .await?;
        let response = Self::check(response).await?;

        let created: CreatedAnnotation = response
            .json()
            .await
            .map_err(|e| AnnotationError::InvalidResponse(e.to_string()))?;
        debug!("Created annotation {}", created.id);
        Ok(created.id)
    }

    async fn list(&self, tags: &[String]) -> Result<Vec<Annotation>, AnnotationError> {
        let url = self.endpoint.api_url(ANNOTATIONS_PATH);
        let query: Vec<(&str, &str)> = tags.iter().map(|t| ("tags", t.as_str())).collect();
        let response = self
            .authorize(self.http.get(&url))
            .query(&query)
            .send()
            .await?;
        let response = Self::check(response).await?;

        response
            .json()
            .await
            .map_err(|e| AnnotationError::InvalidResponse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    use super::*;

    /// Serve one HTTP exchange and hand back the raw request text
    async fn serve_once(
        status: &'static str,
        body: &'static str,
    ) -> (String, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut chunk = [0u8; 1024];
            loop {
                let n = socket.read(&mut chunk).await.unwrap();
                request.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&request).to_string();
                if let Some(head_end) = text.find("\r\n\r\n") {
                    let content_length = text[..head_end]
                        .lines()
                        .find_map(|l| {
                            let lower = l.to_ascii_lowercase();
                            lower
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap())
                        })
                        .unwrap_or(0);
                    if request.len() >= head_end + 4 + content_length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }

            let response = format!(
                "HTTP/1.1 {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = tx.send(String::from_utf8_lossy(&request).to_string());
        });

        (format!("http://{}", addr), rx)
    }

    fn client(url: &str, api_key: Option<&str>) -> GrafanaClient {
        GrafanaClient::from_config(&GrafanaConfig {
            url: Some(url.to_string()),
            api_key: api_key.map(str::to_string),
            tags: Vec::new(),
            timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_create_posts_json_with_basic_auth() {
        let (base, request) =
            serve_once("200 OK", r#"{"message":"Annotation added","id":42}"#).await;
        let url = base.replace("http://", "http://admin:secret@");
        let grafana = client(&url, None);

        let id = grafana
            .create(&AnnotationRequest::new("a: x", vec!["svc".to_string()]))
            .await
            .unwrap();
        assert_eq!(id, 42);

        let request = request.await.unwrap();
        assert!(request.starts_with("POST /api/annotations HTTP/1.1"));
        // base64("admin:secret")
        assert!(request.contains("YWRtaW46c2VjcmV0"));
        assert!(request.ends_with(r#"{"text":"a: x","tags":["svc"]}"#));
    }

    #[tokio::test]
    async fn test_list_sends_repeated_tags_with_bearer() {
        let (base, request) = serve_once(
            "200 OK",
            r#"[{"id":1,"time":1000,"text":"t","tags":["a","b"]}]"#,
        )
        .await;
        let grafana = client(&base, Some("token-1"));

        let annotations = grafana
            .list(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(annotations.len(), 1);
        assert_eq!(annotations[0].text, "t");

        let request = request.await.unwrap();
        assert!(request.starts_with("GET /api/annotations?tags=a&tags=b HTTP/1.1"));
        assert!(request.to_ascii_lowercase().contains("authorization: bearer token-1"));
    }

    #[tokio::test]
    async fn test_error_status_is_reported() {
        let (base, _request) =
            serve_once("401 Unauthorized", r#"{"message":"Unauthorized"}"#).await;
        let grafana = client(&base, None);

        let err = grafana
            .create(&AnnotationRequest::new("x", Vec::new()))
            .await
            .unwrap_err();
        match err {
            AnnotationError::Status { status, body } => {
                assert_eq!(status, 401);
                assert!(body.contains("Unauthorized"));
            }
            other => panic!("expected status error, got {}", other),
        }
    }

    #[tokio::test]
    async fn test_unreachable_service() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let grafana = client(&format!("http://{}", addr), None);
        let err = grafana.list(&[]).await.unwrap_err();
        assert!(matches!(err, AnnotationError::Http(_)));
    }

    #[test]
    fn test_url_path_prefix_is_kept() {
        let grafana = client("https://grafana.local/monitoring", None);
        assert_eq!(
            grafana.endpoint.api_url(ANNOTATIONS_PATH),
            "https://grafana.local/monitoring/api/annotations"
        );
        assert_eq!(grafana.base_url(), "https://grafana.local/monitoring");
    }
}
