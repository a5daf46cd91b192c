//! Clients for calling verbs on runners.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use ftl_core::RefKey;
use http::{HeaderMap, Method, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tracing::debug;

use crate::error::{DispatchError, DispatchResult};
use crate::headers::CallContext;

/// Path prefix runners serve verbs under.
pub const VERB_PATH_PREFIX: &str = "/api/v1/verbs";

#[derive(Debug, Clone)]
pub struct VerbRequest {
    pub verb: RefKey,
    pub body: Vec<u8>,
    pub context: CallContext,
}

/// Calls verbs on one runner endpoint.
#[async_trait]
pub trait VerbClient: Send + Sync + 'static {
    /// Invoke a verb. A verb that ran and failed is [`DispatchError::Verb`];
    /// a runner that could not be reached is [`DispatchError::Unavailable`].
    async fn call(&self, request: VerbRequest) -> DispatchResult<Vec<u8>>;
}

/// Calls a runner over HTTP/1: `POST {endpoint}/api/v1/verbs/{module}/{verb}`
/// with the JSON body and the call context as headers.
pub struct HttpVerbClient {
    endpoint: String,
    client: Client<HttpConnector, Full<Bytes>>,
    timeout: Duration,
}

impl HttpVerbClient {
    pub fn new(endpoint: &str, timeout: Duration) -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            client,
            timeout,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl VerbClient for HttpVerbClient {
    async fn call(&self, request: VerbRequest) -> DispatchResult<Vec<u8>> {
        let uri = format!(
            "{}{VERB_PATH_PREFIX}/{}/{}",
            self.endpoint, request.verb.module, request.verb.name
        );
        let mut headers = HeaderMap::new();
        request.context.write_headers(&mut headers);
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(&uri)
            .header(http::header::CONTENT_TYPE, "application/json");
        if let Some(h) = builder.headers_mut() {
            h.extend(headers);
        }
        let req = builder
            .body(Full::new(Bytes::from(request.body)))
            .map_err(|e| DispatchError::Internal(format!("failed to build request to {uri}: {e}")))?;

        let response = tokio::time::timeout(self.timeout, self.client.request(req))
            .await
            .map_err(|_| DispatchError::Unavailable(format!("call to {uri} timed out")))?
            .map_err(|e| DispatchError::Unavailable(format!("call to {uri} failed: {e}")))?;
        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| DispatchError::Unavailable(format!("reading response from {uri}: {e}")))?
            .to_bytes();
        debug!(%uri, %status, bytes = body.len(), "verb call returned");

        match status {
            s if s.is_success() => Ok(body.to_vec()),
            StatusCode::SERVICE_UNAVAILABLE | StatusCode::BAD_GATEWAY => Err(
                DispatchError::Unavailable(String::from_utf8_lossy(&body).into_owned()),
            ),
            _ => Err(DispatchError::Verb(String::from_utf8_lossy(&body).into_owned())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_lose_trailing_slashes() {
        let client = HttpVerbClient::new("http://127.0.0.1:8893/", Duration::from_secs(1));
        assert_eq!(client.endpoint(), "http://127.0.0.1:8893");
    }

    #[tokio::test]
    async fn unreachable_runners_are_unavailable() {
        // Port 9 (discard) on localhost is not listening in test environments.
        let client = HttpVerbClient::new("http://127.0.0.1:9", Duration::from_secs(2));
        let err = client
            .call(VerbRequest {
                verb: RefKey::new("echo", "echo"),
                body: b"{}".to_vec(),
                context: CallContext::default(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Unavailable(_)), "{err:?}");
    }
}
