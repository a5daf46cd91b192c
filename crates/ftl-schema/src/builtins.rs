//! The `builtin` module, injected ahead of every user module.

use std::sync::OnceLock;

use crate::model::{Module, Schema};
use crate::parser::parse_module;

pub const BUILTIN_MODULE: &str = "builtin";

const BUILTINS: &str = r#"// Built-in types for FTL.
builtin module builtin {
  // Empty is a placeholder for a request or response with no data.
  export data Empty {
  }

  // A reference to a declaration in the schema.
  export data Ref {
    module String
    name String
  }

  // CatchRequest is a request structure for catch verbs.
  export data CatchRequest<Req> {
    verb builtin.Ref
    request Req
    requestType String
    error String
  }

  // FailedEvent is used in dead letter topics.
  export data FailedEvent<Event> {
    event Event
    error String
  }

  // HTTP request structure used for HTTP ingress verbs.
  export data HttpRequest<Body, Path, Query> {
    method String
    path String
    pathParameters Path
    query Query
    headers {String: [String]}
    body Body
  }

  // HTTP response structure used for HTTP ingress verbs.
  export data HttpResponse<Body, Error> {
    status Int
    headers {String: [String]}
    // Either "body" or "error" must be present, not both.
    body Body?
    error Error?
  }
}
"#;

/// The parsed builtin module.
pub fn builtins() -> &'static Module {
    static MODULE: OnceLock<Module> = OnceLock::new();
    MODULE.get_or_init(|| match parse_module("builtin.ftl", BUILTINS) {
        Ok(module) => module,
        Err(err) => unreachable!("builtin schema must parse: {err}"),
    })
}

/// A schema holding only the builtin module.
pub fn builtins_schema() -> Schema {
    Schema::new(vec![builtins().clone()])
}
