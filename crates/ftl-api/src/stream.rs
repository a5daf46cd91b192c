//! Streams over HTTP: newline-delimited JSON both ways.

use axum::body::Body;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use futures_util::{Stream, StreamExt, stream};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tracing::warn;

pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

/// Decode a request body of newline-delimited JSON values. Blank lines are
/// skipped; the last value need not end with a newline.
pub fn ndjson_request<T: DeserializeOwned>(body: Body) -> impl Stream<Item = Result<T, String>> {
    let state = (body.into_data_stream(), Vec::<u8>::new(), false);
    stream::unfold(state, |(mut chunks, mut buf, mut done)| async move {
        loop {
            if let Some(end) = buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buf.drain(..=end).collect();
                if line.trim_ascii().is_empty() {
                    continue;
                }
                let item = decode(line.trim_ascii());
                return Some((item, (chunks, buf, done)));
            }
            if done {
                let rest = std::mem::take(&mut buf);
                if rest.trim_ascii().is_empty() {
                    return None;
                }
                return Some((decode(rest.trim_ascii()), (chunks, buf, done)));
            }
            match chunks.next().await {
                Some(Ok(chunk)) => buf.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    buf.clear();
                    return Some((Err(format!("failed to read stream: {e}")), (chunks, buf, true)));
                }
                None => done = true,
            }
        }
    })
}

fn decode<T: DeserializeOwned>(line: &[u8]) -> Result<T, String> {
    serde_json::from_slice(line).map_err(|e| format!("invalid stream message: {e}"))
}

/// A response that writes each item as one JSON line.
pub fn ndjson_response<T, S>(items: S) -> Response
where
    T: Serialize + Send + 'static,
    S: Stream<Item = T> + Send + 'static,
{
    let lines = items.filter_map(|item| async move {
        match serde_json::to_vec(&item) {
            Ok(mut line) => {
                line.push(b'\n');
                Some(Ok::<_, std::convert::Infallible>(line))
            }
            Err(e) => {
                warn!(error = %e, "dropping unencodable stream message");
                None
            }
        }
    });
    ([(header::CONTENT_TYPE, NDJSON_CONTENT_TYPE)], Body::from_stream(lines)).into_response()
}

/// A stream of what arrives on `rx`, ending when its sender is dropped.
pub fn receiver_stream<T: Send + 'static>(rx: mpsc::Receiver<T>) -> impl Stream<Item = T> + Send {
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) })
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, PartialEq, Deserialize)]
    struct Line {
        n: u32,
    }

    #[tokio::test]
    async fn lines_are_split_and_decoded() {
        let body = Body::from("{\"n\":1}\n\n{\"n\":2}\n{\"n\":3}");
        let lines: Vec<Result<Line, String>> = ndjson_request(body).collect().await;
        assert_eq!(lines, [Ok(Line { n: 1 }), Ok(Line { n: 2 }), Ok(Line { n: 3 })]);
    }

    #[tokio::test]
    async fn bad_lines_are_reported() {
        let body = Body::from("{\"n\":1}\nnope\n");
        let lines: Vec<Result<Line, String>> = ndjson_request(body).collect().await;
        assert_eq!(lines.len(), 2);
        assert!(lines[1].as_ref().unwrap_err().starts_with("invalid stream message"));
    }
}
