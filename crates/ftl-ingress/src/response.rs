//! Turning a verb's `builtin.HttpResponse` into an HTTP response.

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use ftl_schema::{Type, Verb};
use serde::Deserialize;
use serde_json::Value as Json;

use crate::error::{IngressError, IngressResult};

pub const CONTENT_TYPE: &str = "Content-Type";
pub const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";
pub const TEXT_CONTENT_TYPE: &str = "text/plain; charset=utf-8";
const BINARY_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub headers: BTreeMap<String, Vec<String>>,
    pub body: Vec<u8>,
}

impl HttpReply {
    /// A plain-text reply.
    pub fn text(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            headers: BTreeMap::from([(CONTENT_TYPE.to_string(), vec![TEXT_CONTENT_TYPE.to_string()])]),
            body: message.into().into_bytes(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .and_then(|(_, v)| v.first())
            .map(String::as_str)
    }
}

#[derive(Debug, Default, Deserialize)]
struct VerbResponse {
    #[serde(default)]
    status: i64,
    #[serde(default)]
    headers: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    body: Option<Json>,
    #[serde(default)]
    error: Option<Json>,
}

/// The `Body` and `Error` arguments of a verb's response type.
fn response_types(verb: &Verb) -> Option<[&Type; 2]> {
    match verb.response.as_ref() {
        Some(r) if r.module == "builtin" && r.name == "HttpResponse" => match r.type_parameters.as_slice() {
            [body, error] => Some([body, error]),
            _ => None,
        },
        _ => None,
    }
}

/// Unpack the response of `verb`. The status defaults to 200 for a body
/// and 500 for an error. Verbs that do not answer with an HttpResponse are
/// passed through as JSON.
pub fn unpack_response(verb: &Verb, raw: &[u8]) -> IngressResult<HttpReply> {
    let Some([body_type, error_type]) = response_types(verb) else {
        return Ok(HttpReply {
            status: 200,
            headers: BTreeMap::from([(CONTENT_TYPE.to_string(), vec![JSON_CONTENT_TYPE.to_string()])]),
            body: raw.to_vec(),
        });
    };
    let response: VerbResponse = serde_json::from_slice(raw).map_err(|e| {
        IngressError::BadResponse(format!("could not decode response for verb {}: {e}", verb.name))
    })?;

    let body = response.body.filter(|v| !v.is_null());
    let error = response.error.filter(|v| !v.is_null());
    let (typ, value, default_status) = match (body, error) {
        (Some(body), None) => (body_type, body, 200),
        (None, Some(error)) => (error_type, error, 500),
        (None, None) if unwrap_optional(body_type).is_unit() => (body_type, Json::Null, 200),
        _ => {
            return Err(IngressError::BadResponse(
                "response must have either a body or an error".into(),
            ));
        }
    };

    let status = match response.status {
        0 => default_status,
        status => u16::try_from(status)
            .ok()
            .filter(|s| (100..1000).contains(s))
            .ok_or_else(|| IngressError::BadResponse(format!("invalid response status {status}")))?,
    };
    let (body, content_type) = encode_body(typ, value)?;
    let mut headers = response.headers;
    if let Some(content_type) = content_type {
        if !headers.keys().any(|k| k.eq_ignore_ascii_case(CONTENT_TYPE)) {
            headers.insert(CONTENT_TYPE.to_string(), vec![content_type.to_string()]);
        }
    }
    Ok(HttpReply {
        status,
        headers,
        body,
    })
}

fn encode_body(typ: &Type, value: Json) -> IngressResult<(Vec<u8>, Option<&'static str>)> {
    match unwrap_optional(typ) {
        Type::Unit => Ok((Vec::new(), None)),
        Type::String => match value {
            Json::String(text) => Ok((text.into_bytes(), Some(TEXT_CONTENT_TYPE))),
            other => Err(IngressError::BadResponse(format!(
                "HTTP response body is not a valid string: {other}"
            ))),
        },
        Type::Bytes => {
            let Json::String(encoded) = value else {
                return Err(IngressError::BadResponse("HTTP response body is not valid base64".into()));
            };
            let bytes = STANDARD.decode(encoded).map_err(|e| {
                IngressError::BadResponse(format!("failed to decode base64 response body: {e}"))
            })?;
            Ok((bytes, Some(BINARY_CONTENT_TYPE)))
        }
        Type::Int | Type::Float | Type::Bool => Ok((value.to_string().into_bytes(), Some(TEXT_CONTENT_TYPE))),
        _ => {
            let body = serde_json::to_vec(&value)
                .map_err(|e| IngressError::BadResponse(format!("could not encode response body: {e}")))?;
            Ok((body, Some(JSON_CONTENT_TYPE)))
        }
    }
}

fn unwrap_optional(typ: &Type) -> &Type {
    match typ {
        Type::Optional { inner } => unwrap_optional(inner),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verb(response: &str) -> Verb {
        let src = format!(
            "module web {{\n  export data Item {{\n    id Int\n  }}\n\n  export verb v(builtin.HttpRequest<Unit, Unit, Unit>) {response}\n    +ingress http GET /v\n}}\n"
        );
        ftl_schema::parse_module_string("web.ftl", &src)
            .unwrap()
            .verb("v")
            .unwrap()
            .clone()
    }

    #[test]
    fn bodies_default_to_200_and_errors_to_500() {
        let v = verb("builtin.HttpResponse<web.Item, String>");
        let ok = unpack_response(&v, br#"{"body":{"id":1}}"#).unwrap();
        assert_eq!(ok.status, 200);
        assert_eq!(ok.body, br#"{"id":1}"#);
        assert_eq!(ok.header("content-type"), Some(JSON_CONTENT_TYPE));

        let failed = unpack_response(&v, br#"{"error":"nope"}"#).unwrap();
        assert_eq!(failed.status, 500);
        assert_eq!(failed.body, b"nope");
        assert_eq!(failed.header(CONTENT_TYPE), Some(TEXT_CONTENT_TYPE));
    }

    #[test]
    fn verbs_choose_status_and_headers() {
        let v = verb("builtin.HttpResponse<String, String>");
        let reply = unpack_response(
            &v,
            br#"{"status":201,"headers":{"content-type":["text/html"],"X-A":["1","2"]},"body":"<p>"}"#,
        )
        .unwrap();
        assert_eq!(reply.status, 201);
        assert_eq!(reply.body, b"<p>");
        assert_eq!(reply.header(CONTENT_TYPE), Some("text/html"));
        assert_eq!(reply.headers["X-A"], ["1", "2"]);
    }

    #[test]
    fn bytes_are_decoded() {
        let v = verb("builtin.HttpResponse<Bytes, String>");
        let reply = unpack_response(&v, br#"{"body":"AAE="}"#).unwrap();
        assert_eq!(reply.body, [0, 1]);
        assert_eq!(reply.header(CONTENT_TYPE), Some("application/octet-stream"));
    }

    #[test]
    fn a_body_or_an_error_is_required() {
        let v = verb("builtin.HttpResponse<web.Item, String>");
        let err = unpack_response(&v, br#"{"status":200}"#).unwrap_err();
        assert_eq!(err.to_string(), "response must have either a body or an error");
        let err = unpack_response(&v, br#"{"body":{"id":1},"error":"x"}"#).unwrap_err();
        assert_eq!(err.to_string(), "response must have either a body or an error");

        let unit = verb("builtin.HttpResponse<Unit, String>");
        let reply = unpack_response(&unit, br#"{"status":204}"#).unwrap();
        assert_eq!(reply.status, 204);
        assert!(reply.body.is_empty());
    }
}
