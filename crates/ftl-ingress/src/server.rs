//! The ingress HTTP server.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::extract::{ConnectInfo, Request, State};
use axum::response::{IntoResponse, Response};
use http::{HeaderName, HeaderValue, StatusCode};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::response::HttpReply;
use crate::service::{IngressRequest, IngressService};

/// Request bodies larger than this are refused.
pub const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Every path is handed to the ingress service.
pub fn router(service: IngressService) -> Router {
    Router::new().fallback(ingress).with_state(service)
}

/// Serve ingress on `listener` until shutdown is signalled.
pub async fn serve(
    listener: TcpListener,
    service: IngressService,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "ingress server starting");
    axum::serve(
        listener,
        router(service).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = shutdown.changed().await;
    })
    .await?;
    info!("ingress server stopped");
    Ok(())
}

async fn ingress(State(service): State<IngressService>, request: Request) -> Response {
    let remote_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let (parts, body) = request.into_parts();
    let body = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(e) => {
            return (StatusCode::PAYLOAD_TOO_LARGE, format!("failed to read request body: {e}"))
                .into_response();
        }
    };

    let mut headers: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in &parts.headers {
        if let Ok(value) = value.to_str() {
            headers
                .entry(canonical_header(name.as_str()))
                .or_default()
                .push(value.to_string());
        }
    }
    let reply = service
        .handle(IngressRequest {
            method: parts.method.to_string(),
            path: parts.uri.path().to_string(),
            query: parts.uri.query().map(str::to_string),
            headers,
            body: body.to_vec(),
            remote_addr,
        })
        .await;
    into_response(reply)
}

fn into_response(reply: HttpReply) -> Response {
    let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = Response::new(Body::from(reply.body));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    for (name, values) in reply.headers {
        let Ok(name) = HeaderName::try_from(name.as_str()) else {
            warn!(header = %name, "dropping invalid response header");
            continue;
        };
        for value in values {
            match HeaderValue::try_from(value) {
                Ok(value) => {
                    headers.append(name.clone(), value);
                }
                Err(_) => warn!(header = %name, "dropping invalid response header value"),
            }
        }
    }
    response
}

/// `content-type` becomes `Content-Type`, the way verbs see headers.
fn canonical_header(name: &str) -> String {
    name.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_names_are_canonicalised() {
        assert_eq!(canonical_header("content-type"), "Content-Type");
        assert_eq!(canonical_header("x-request-id"), "X-Request-Id");
        assert_eq!(canonical_header("accept"), "Accept");
    }

    #[test]
    fn replies_keep_repeated_headers() {
        let reply = HttpReply {
            status: 201,
            headers: BTreeMap::from([("Set-Cookie".to_string(), vec!["a=1".into(), "b=2".into()])]),
            body: b"ok".to_vec(),
        };
        let response = into_response(reply);
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers().get_all("set-cookie").iter().count(), 2);
    }
}
