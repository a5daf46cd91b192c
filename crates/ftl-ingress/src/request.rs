//! Shaping an HTTP request into a verb's `builtin.HttpRequest`.

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use ftl_schema::{Data, Schema, Type, Verb};
use serde_json::{Map, Value as Json, json};

use crate::error::{IngressError, IngressResult};

/// The parts of an HTTP request a verb sees.
#[derive(Debug, Clone)]
pub struct HttpParts<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub query: Option<&'a str>,
    pub headers: &'a BTreeMap<String, Vec<String>>,
    pub body: &'a [u8],
}

/// The `Body`, `Path` and `Query` arguments of a verb's request type.
fn request_types(verb: &Verb) -> IngressResult<[&Type; 3]> {
    match verb.request.as_ref() {
        Some(r) if r.module == "builtin" && r.name == "HttpRequest" => match r.type_parameters.as_slice() {
            [body, path, query] => Ok([body, path, query]),
            _ => Err(not_http(verb)),
        },
        _ => Err(not_http(verb)),
    }
}

fn not_http(verb: &Verb) -> IngressError {
    IngressError::BadRequest(format!(
        "verb {} input must be builtin.HttpRequest, not {}",
        verb.name, verb.request
    ))
}

/// Build the JSON request body for `verb`.
pub fn build_request(
    schema: &Schema,
    verb: &Verb,
    path_parameters: &BTreeMap<String, String>,
    parts: &HttpParts<'_>,
) -> IngressResult<Json> {
    let [body, path, query] = request_types(verb)?;
    Ok(json!({
        "method": parts.method,
        "path": parts.path,
        "pathParameters": shape_path(schema, path, path_parameters),
        "query": shape_query(schema, query, parts.query.unwrap_or_default())?,
        "headers": parts.headers,
        "body": shape_body(schema, body, parts.body)?,
    }))
}

// ── Path parameters ────────────────────────────────────────────────

fn shape_path(schema: &Schema, typ: &Type, params: &BTreeMap<String, String>) -> Json {
    match typ {
        Type::Unit => json!({}),
        Type::Map { .. } => json!(params),
        Type::Ref(r) => match schema.resolve_data(r) {
            Some(Ok(data)) => {
                let object: Map<String, Json> = params
                    .iter()
                    .map(|(name, value)| {
                        let field = find_field(&data, name).map(|f| &f.typ);
                        (name.clone(), field.map_or_else(|| json!(value), |t| scalar(t, value)))
                    })
                    .collect();
                Json::Object(object)
            }
            _ => single(params),
        },
        scalar_type => params
            .values()
            .next()
            .map_or(Json::Null, |value| scalar(scalar_type, value)),
    }
}

fn single(params: &BTreeMap<String, String>) -> Json {
    params.values().next().map_or(Json::Null, |v| json!(v))
}

// ── Query ──────────────────────────────────────────────────────────

const JSON_QUERY: &str = "@json";

fn shape_query(schema: &Schema, typ: &Type, query: &str) -> IngressResult<Json> {
    let mut values: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        values.entry(key.into_owned()).or_default().push(value.into_owned());
    }

    if let Some(encoded) = values.get(JSON_QUERY) {
        if values.len() > 1 {
            return Err(IngressError::BadRequest(
                "only '@json' parameter is allowed, but other parameters were found".into(),
            ));
        }
        let [encoded] = encoded.as_slice() else {
            return Err(IngressError::BadRequest(
                "'@json' parameter must be provided exactly once".into(),
            ));
        };
        return serde_json::from_str(encoded).map_err(|e| {
            IngressError::BadRequest(format!("failed to parse '@json' query parameter: {e}"))
        });
    }

    match unwrap_optional(typ) {
        Type::Unit => Ok(json!({})),
        Type::Map { value, .. } => Ok(match unwrap_optional(value) {
            Type::Array { .. } => json!(values),
            scalar_type => Json::Object(
                values
                    .iter()
                    .filter_map(|(k, v)| Some((k.clone(), scalar(scalar_type, v.last()?))))
                    .collect(),
            ),
        }),
        Type::Ref(r) => match schema.resolve_data(r) {
            Some(Ok(data)) => query_object(&data, &values),
            Some(Err(e)) => Err(IngressError::BadRequest(e)),
            None => Ok(json!(values)),
        },
        _ => Ok(json!(values)),
    }
}

fn query_object(data: &Data, values: &BTreeMap<String, Vec<String>>) -> IngressResult<Json> {
    let mut object = Map::new();
    for (key, list) in values {
        if has_invalid_query_chars(key) {
            return Err(IngressError::BadRequest(format!(
                "complex key {key:?} is not supported, use '@json=' instead"
            )));
        }
        let Some(field) = find_field(data, key) else {
            continue;
        };
        if let Some(bad) = list.iter().find(|v| has_invalid_query_chars(v)) {
            return Err(IngressError::BadRequest(format!(
                "complex value {bad:?} is not supported, use '@json=' instead"
            )));
        }
        let value = match unwrap_optional(&field.typ) {
            Type::Array { element } => Json::Array(list.iter().map(|v| scalar(element, v)).collect()),
            scalar_type => match list.as_slice() {
                [one] => scalar(scalar_type, one),
                _ => {
                    return Err(IngressError::BadRequest(format!(
                        "multiple values for {key:?} are not supported"
                    )));
                }
            },
        };
        object.insert(key.clone(), value);
    }
    Ok(Json::Object(object))
}

fn has_invalid_query_chars(s: &str) -> bool {
    s.contains(['{', '}', '[', ']', '|', '\\', '^', '`'])
}

// ── Body ───────────────────────────────────────────────────────────

fn shape_body(schema: &Schema, typ: &Type, body: &[u8]) -> IngressResult<Json> {
    let text = || String::from_utf8_lossy(body).trim().to_string();
    match typ {
        Type::Unit => Ok(json!({})),
        Type::String => Ok(Json::String(String::from_utf8_lossy(body).into_owned())),
        Type::Bytes => Ok(Json::String(STANDARD.encode(body))),
        Type::Int => text()
            .parse::<i64>()
            .map(Json::from)
            .map_err(|e| IngressError::BadRequest(format!("failed to parse integer from request body: {e}"))),
        Type::Float => text()
            .parse::<f64>()
            .map(Json::from)
            .map_err(|e| IngressError::BadRequest(format!("failed to parse float from request body: {e}"))),
        Type::Bool => text()
            .parse::<bool>()
            .map(Json::from)
            .map_err(|e| IngressError::BadRequest(format!("failed to parse boolean from request body: {e}"))),
        Type::Optional { .. } if body.is_empty() => Ok(Json::Null),
        Type::Optional { inner } => shape_body(schema, inner, body),
        _ if body.iter().all(u8::is_ascii_whitespace) => Ok(json!({})),
        _ => serde_json::from_slice(body)
            .map_err(|e| IngressError::BadRequest(format!("HTTP request body is not valid JSON: {e}"))),
    }
}

// ── Helpers ────────────────────────────────────────────────────────

fn unwrap_optional(typ: &Type) -> &Type {
    match typ {
        Type::Optional { inner } => unwrap_optional(inner),
        other => other,
    }
}

fn find_field<'a>(data: &'a Data, name: &str) -> Option<&'a ftl_schema::Field> {
    data.fields
        .iter()
        .find(|f| f.name == name || f.json_alias() == Some(name))
}

/// A text value as the JSON scalar `typ` expects. Values that do not parse
/// stay strings and are rejected by payload validation.
fn scalar(typ: &Type, text: &str) -> Json {
    match unwrap_optional(typ) {
        Type::Int => text.parse::<i64>().map_or_else(|_| json!(text), Json::from),
        Type::Float => text.parse::<f64>().map_or_else(|_| json!(text), Json::from),
        Type::Bool => text.parse::<bool>().map_or_else(|_| json!(text), Json::from),
        _ => json!(text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCHEMA: &str = r#"
module shop {
  export data Path {
    id Int
    slug String
  }

  export data Query {
    limit Int?
    tags [String]
  }

  export data Item {
    name String
  }

  export verb get(builtin.HttpRequest<Unit, shop.Path, shop.Query>) builtin.HttpResponse<shop.Item, String>
    +ingress http GET /items/{id}/{slug}

  export verb one(builtin.HttpRequest<Unit, Int, {String: [String]}>) builtin.HttpResponse<shop.Item, String>
    +ingress http GET /one/{id}

  export verb raw(builtin.HttpRequest<Bytes, Unit, Unit>) builtin.HttpResponse<String, String>
    +ingress http POST /raw

  export verb text(builtin.HttpRequest<String, Unit, Unit>) builtin.HttpResponse<String, String>
    +ingress http POST /text

  export verb create(builtin.HttpRequest<shop.Item, Unit, Unit>) builtin.HttpResponse<shop.Item, String>
    +ingress http POST /items
}
"#;

    fn schema() -> Schema {
        let module = ftl_schema::parse_module_string("shop.ftl", SCHEMA).unwrap();
        Schema::new(vec![ftl_schema::builtins().clone(), module])
    }

    fn shape(verb: &str, params: &[(&str, &str)], query: Option<&str>, body: &[u8]) -> IngressResult<Json> {
        let schema = schema();
        let verb = schema.module("shop").unwrap().verb(verb).unwrap().clone();
        let params = params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let headers = BTreeMap::from([("Accept".to_string(), vec!["*/*".to_string()])]);
        build_request(
            &schema,
            &verb,
            &params,
            &HttpParts {
                method: "GET",
                path: "/p",
                query,
                headers: &headers,
                body,
            },
        )
    }

    #[test]
    fn data_path_and_query_are_typed() {
        let request = shape(
            "get",
            &[("id", "7"), ("slug", "hat")],
            Some("limit=3&tags=a&tags=b&ignored=x"),
            b"",
        )
        .unwrap();
        assert_eq!(request["method"], "GET");
        assert_eq!(request["pathParameters"], json!({"id": 7, "slug": "hat"}));
        assert_eq!(request["query"], json!({"limit": 3, "tags": ["a", "b"]}));
        assert_eq!(request["headers"], json!({"Accept": ["*/*"]}));
        assert_eq!(request["body"], json!({}));
    }

    #[test]
    fn a_single_scalar_parameter_is_the_value() {
        let request = shape("one", &[("id", "12")], Some("a=1&a=2"), b"").unwrap();
        assert_eq!(request["pathParameters"], json!(12));
        assert_eq!(request["query"], json!({"a": ["1", "2"]}));
    }

    #[test]
    fn bodies_follow_their_type() {
        let raw = shape("raw", &[], None, b"\x00\x01").unwrap();
        assert_eq!(raw["body"], json!("AAE="));
        let text = shape("text", &[], None, b"hello").unwrap();
        assert_eq!(text["body"], json!("hello"));
        let item = shape("create", &[], None, br#"{"name":"hat"}"#).unwrap();
        assert_eq!(item["body"], json!({"name": "hat"}));
        let empty = shape("create", &[], None, b"").unwrap();
        assert_eq!(empty["body"], json!({}));
    }

    #[test]
    fn bad_input_is_reported() {
        let err = shape("create", &[], None, b"{nope").unwrap_err();
        assert!(err.to_string().starts_with("HTTP request body is not valid JSON"));

        let err = shape("get", &[("id", "1"), ("slug", "s")], Some("limit=1&limit=2"), b"").unwrap_err();
        assert_eq!(err.to_string(), "multiple values for \"limit\" are not supported");

        let err = shape("get", &[("id", "1"), ("slug", "s")], Some("tags={x}"), b"").unwrap_err();
        assert!(err.to_string().starts_with("complex value"));
    }

    #[test]
    fn json_queries_replace_parameters() {
        let request = shape(
            "get",
            &[("id", "1"), ("slug", "s")],
            Some("@json=%7B%22tags%22%3A%5B%22x%22%5D%7D"),
            b"",
        )
        .unwrap();
        assert_eq!(request["query"], json!({"tags": ["x"]}));

        let err = shape("get", &[("id", "1"), ("slug", "s")], Some("@json={}&limit=1"), b"").unwrap_err();
        assert!(err.to_string().starts_with("only '@json'"));
    }
}
