//! Call metadata carried between verbs in HTTP headers.
//!
//! - `FTL-Direct`: present and non-empty means the call must not be re-routed
//! - `FTL-Verb`: one value per caller, oldest first
//! - `FTL-Request-ID`: the request key, propagated unchanged across hops
//! - `FTL-Parent-Request-ID`: the request that caused this one, if any

use ftl_core::{RefKey, RequestKey};
use http::{HeaderMap, HeaderValue};

use crate::error::{DispatchError, DispatchResult};

pub const DIRECT_ROUTING_HEADER: &str = "FTL-Direct";
pub const VERB_HEADER: &str = "FTL-Verb";
pub const REQUEST_ID_HEADER: &str = "FTL-Request-ID";
pub const PARENT_REQUEST_ID_HEADER: &str = "FTL-Parent-Request-ID";

/// Who is calling, and on behalf of which request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallContext {
    pub direct: bool,
    pub callers: Vec<RefKey>,
    pub request_key: Option<RequestKey>,
    pub parent_request_key: Option<RequestKey>,
}

impl CallContext {
    pub fn from_headers(headers: &HeaderMap) -> DispatchResult<Self> {
        let direct = headers
            .get(DIRECT_ROUTING_HEADER)
            .is_some_and(|v| !v.as_bytes().is_empty());
        let mut callers = Vec::new();
        for value in headers.get_all(VERB_HEADER) {
            let text = header_str(VERB_HEADER, value)?;
            let caller = text
                .parse::<RefKey>()
                .map_err(|e| DispatchError::InvalidArgument(format!("invalid {VERB_HEADER} header: {e}")))?;
            callers.push(caller);
        }
        Ok(Self {
            direct,
            callers,
            request_key: request_key(headers, REQUEST_ID_HEADER)?,
            parent_request_key: request_key(headers, PARENT_REQUEST_ID_HEADER)?,
        })
    }

    pub fn write_headers(&self, headers: &mut HeaderMap) {
        headers.remove(VERB_HEADER);
        for caller in &self.callers {
            if let Ok(value) = HeaderValue::from_str(&caller.to_string()) {
                headers.append(VERB_HEADER, value);
            }
        }
        set_key(headers, REQUEST_ID_HEADER, self.request_key.as_ref());
        set_key(headers, PARENT_REQUEST_ID_HEADER, self.parent_request_key.as_ref());
        if self.direct {
            headers.insert(DIRECT_ROUTING_HEADER, HeaderValue::from_static("1"));
        } else {
            headers.remove(DIRECT_ROUTING_HEADER);
        }
    }

    /// The most recent caller; `None` for calls from outside.
    pub fn current_caller(&self) -> Option<&RefKey> {
        self.callers.last()
    }

    /// The caller chain with `verb` appended, unless it is already last.
    pub fn with_caller(&self, verb: &RefKey) -> Vec<RefKey> {
        let mut callers = self.callers.clone();
        if callers.last() != Some(verb) {
            callers.push(verb.clone());
        }
        callers
    }
}

fn header_str<'a>(name: &str, value: &'a HeaderValue) -> DispatchResult<&'a str> {
    value
        .to_str()
        .map_err(|_| DispatchError::InvalidArgument(format!("{name} header is not valid text")))
}

fn request_key(headers: &HeaderMap, name: &str) -> DispatchResult<Option<RequestKey>> {
    let Some(value) = headers.get(name) else {
        return Ok(None);
    };
    let text = header_str(name, value)?;
    if text.is_empty() {
        return Ok(None);
    }
    RequestKey::parse(text)
        .map(Some)
        .map_err(|e| DispatchError::InvalidArgument(format!("invalid {name} header: {e}")))
}

fn set_key(headers: &mut HeaderMap, name: &'static str, key: Option<&RequestKey>) {
    match key.and_then(|k| HeaderValue::from_str(&k.to_string()).ok()) {
        Some(value) => {
            headers.insert(name, value);
        }
        None => {
            headers.remove(name);
        }
    }
}
