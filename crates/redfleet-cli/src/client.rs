//! Minimal HTTP/1 client for the RedFleet REST API.
//!
//! One connection per request: the CLI issues a handful of calls, so
//! there is nothing to gain from pooling. Every exchange is bounded by
//! the client's request timeout.

use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use bytes::Bytes;
use http::{Method, StatusCode};
use http_body_util::{BodyExt, Full};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use redfleet_reconciler::{CreateRequest, InstanceView};
use redfleet_state::InstanceSpec;

/// The `{ success, data, error }` envelope every endpoint answers with.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: Option<T>,
    error: Option<String>,
}

/// Upper bound on one request, connect through body.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ApiClient {
    authority: String,
    request_timeout: Duration,
}

impl ApiClient {
    /// `endpoint` is a base URL such as `http://127.0.0.1:5656`.
    pub fn new(endpoint: &str) -> anyhow::Result<Self> {
        let uri: http::Uri = endpoint
            .parse()
            .with_context(|| format!("invalid endpoint {endpoint:?}"))?;
        if let Some(scheme) = uri.scheme_str().filter(|s| *s != "http") {
            bail!("unsupported scheme {scheme:?}, only http endpoints are supported");
        }
        let authority = uri
            .authority()
            .ok_or_else(|| anyhow!("endpoint {endpoint:?} has no host"))?
            .to_string();
        Ok(Self {
            authority,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> anyhow::Result<(StatusCode, Bytes)> {
        tokio::time::timeout(self.request_timeout, self.exchange(method, path, body))
            .await
            .map_err(|_| {
                anyhow!(
                    "redfleetd at {} did not answer within {}ms",
                    self.authority,
                    self.request_timeout.as_millis()
                )
            })?
    }

    async fn exchange(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> anyhow::Result<(StatusCode, Bytes)> {
        let stream = tokio::net::TcpStream::connect(&self.authority)
            .await
            .with_context(|| format!("cannot reach redfleetd at {}", self.authority))?;
        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "connection closed with error");
            }
        });

        let mut builder = http::Request::builder()
            .method(method.clone())
            .uri(path)
            .header("host", &self.authority)
            .header("user-agent", concat!("rfl/", env!("CARGO_PKG_VERSION")));
        let body = match body {
            Some(bytes) => {
                builder = builder.header("content-type", "application/json");
                Full::new(Bytes::from(bytes))
            }
            None => Full::new(Bytes::new()),
        };
        let req = builder.body(body)?;

        let resp = sender.send_request(req).await?;
        let status = resp.status();
        let bytes = resp.into_body().collect().await?.to_bytes();
        debug!(%method, path, %status, "api call");
        Ok((status, bytes))
    }

    pub async fn create(&self, req: &CreateRequest) -> anyhow::Result<InstanceSpec> {
        let body = serde_json::to_vec(req)?;
        let (status, bytes) = self
            .send(Method::POST, "/api/v1/instances", Some(body))
            .await?;
        if status != StatusCode::CREATED {
            bail!(rejection(status, &bytes));
        }
        decode(&bytes)
    }

    /// `None` when the instance does not exist.
    pub async fn status(&self, name: &str) -> anyhow::Result<Option<InstanceView>> {
        let path = format!("/api/v1/instances/{name}");
        let (status, bytes) = self.send(Method::GET, &path, None).await?;
        match status {
            StatusCode::OK => decode(&bytes).map(Some),
            StatusCode::NOT_FOUND => Ok(None),
            _ => bail!(rejection(status, &bytes)),
        }
    }

    /// `false` when the instance does not exist.
    pub async fn delete(&self, name: &str) -> anyhow::Result<bool> {
        let path = format!("/api/v1/instances/{name}");
        let (status, bytes) = self.send(Method::DELETE, &path, None).await?;
        match status {
            StatusCode::ACCEPTED => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => bail!(rejection(status, &bytes)),
        }
    }

    pub async fn list(&self) -> anyhow::Result<Vec<InstanceView>> {
        let (status, bytes) = self.send(Method::GET, "/api/v1/instances", None).await?;
        if status != StatusCode::OK {
            bail!(rejection(status, &bytes));
        }
        decode(&bytes)
    }
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> anyhow::Result<T> {
    let envelope: Envelope<T> = serde_json::from_slice(bytes).context("malformed API response")?;
    envelope
        .data
        .ok_or_else(|| anyhow!(envelope.error.unwrap_or_else(|| "response carried no data".into())))
}

/// Human-readable reason for a non-success answer.
fn rejection(status: StatusCode, bytes: &[u8]) -> String {
    let message = serde_json::from_slice::<Envelope<serde_json::Value>>(bytes)
        .ok()
        .and_then(|e| e.error)
        .unwrap_or_else(|| String::from_utf8_lossy(bytes).into_owned());
    format!("{status}: {message}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use redfleet_reconciler::Gateway;
    use redfleet_state::{InstancePhase, StateStore};

    /// Serve the real router on an ephemeral port.
    async fn serve() -> ApiClient {
        let store = StateStore::open_in_memory().unwrap();
        let router = redfleet_api::build_router(Gateway::new(store, "redis:3.0-alpine"));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        ApiClient::new(&format!("http://{addr}")).unwrap()
    }

    fn request(name: &str) -> CreateRequest {
        CreateRequest {
            name: name.to_string(),
            memory_mb: 256,
            slave_count: 2,
        }
    }

    #[test]
    fn endpoint_parsing() {
        let client = ApiClient::new("http://127.0.0.1:5656").unwrap();
        assert_eq!(client.authority(), "127.0.0.1:5656");
        assert!(ApiClient::new("https://example.com").is_err());
        assert!(ApiClient::new("/just/a/path").is_err());
    }

    #[tokio::test]
    async fn create_then_status() {
        let client = serve().await;
        let spec = client.create(&request("cache1")).await.unwrap();
        assert_eq!(spec.slave_count, 2);

        let view = client.status("cache1").await.unwrap().unwrap();
        assert_eq!(view.status.phase, InstancePhase::Pending);
        assert_eq!(client.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_create_carries_server_message() {
        let client = serve().await;
        client.create(&request("cache1")).await.unwrap();
        let err = client.create(&request("cache1")).await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("409"), "{msg}");
        assert!(msg.contains("already exists"), "{msg}");
    }

    #[tokio::test]
    async fn missing_instance() {
        let client = serve().await;
        assert!(client.status("nope").await.unwrap().is_none());
        assert!(!client.delete("nope").await.unwrap());
    }

    #[tokio::test]
    async fn delete_is_accepted() {
        let client = serve().await;
        client.create(&request("cache1")).await.unwrap();
        assert!(client.delete("cache1").await.unwrap());
        let view = client.status("cache1").await.unwrap().unwrap();
        assert_eq!(view.status.phase, InstancePhase::DeleteRequested);
    }

    #[tokio::test]
    async fn silent_daemon_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Accept connections and never answer.
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let client = ApiClient::new(&format!("http://{addr}"))
            .unwrap()
            .with_request_timeout(Duration::from_millis(100));
        let err = tokio::time::timeout(Duration::from_secs(5), client.status("cache1"))
            .await
            .expect("request outlived its timeout")
            .unwrap_err();
        assert!(err.to_string().contains("did not answer"), "{err}");
    }

    #[tokio::test]
    async fn unreachable_daemon_is_an_error() {
        let client = ApiClient::new("http://127.0.0.1:1").unwrap();
        let err = client.list().await.unwrap_err();
        assert!(err.to_string().contains("cannot reach redfleetd"));
    }
}
