//! Checking JSON payloads against schema types.
//!
//! Error paths start at the type being checked and grow with field names,
//! array indices and map keys, e.g. `echo.Order.items[0].price`.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::DateTime;
use serde_json::Value as Json;
use thiserror::Error;

use crate::model::{Data, Decl, Enum, Ref, Schema, Type, Value, Verb};

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Invalid(String),
}

pub type PayloadResult<T> = Result<T, PayloadError>;

/// Decode a verb request body and check it against the verb's request type.
/// An empty body is read as `{}`.
pub fn validate_request_body(schema: &Schema, verb: &Verb, body: &[u8]) -> PayloadResult<Json> {
    let value: Json = if body.is_empty() {
        Json::Object(Default::default())
    } else {
        serde_json::from_slice(body)?
    };
    validate_json_value(
        schema,
        &verb.request,
        &verb.request.to_string(),
        &value,
        verb.lenient_encoding(),
    )?;
    Ok(value)
}

/// Check `value` against `typ`. With `lenient`, data structures may carry
/// fields they do not declare.
pub fn validate_json_value(
    schema: &Schema,
    typ: &Type,
    path: &str,
    value: &Json,
    lenient: bool,
) -> PayloadResult<()> {
    Checker { schema, lenient }
        .check(typ, path, value)
        .map_err(PayloadError::Invalid)
}

struct Checker<'a> {
    schema: &'a Schema,
    lenient: bool,
}

impl Checker<'_> {
    fn check(&self, typ: &Type, path: &str, value: &Json) -> Result<(), String> {
        match (typ, value) {
            (Type::Any, _) => Ok(()),
            (Type::Unit, Json::Object(map)) if map.is_empty() => Ok(()),
            (Type::Unit, _) => Err(format!("{path} must be an empty map")),
            (Type::Optional { .. }, Json::Null) => Ok(()),
            (Type::Optional { inner }, _) => self.check(inner, path, value),
            (Type::Time, Json::String(s)) => DateTime::parse_from_rfc3339(s)
                .map(|_| ())
                .map_err(|_| format!("time {path} must be an RFC3339 formatted string")),
            (Type::Time, _) => Err(format!("time {path} must be an RFC3339 formatted string")),
            (Type::Int, Json::Number(n)) if n.is_i64() || n.is_u64() => Ok(()),
            (Type::Int, Json::String(s)) if s.parse::<i64>().is_ok() => Ok(()),
            (Type::Float, Json::Number(_)) => Ok(()),
            (Type::Float, Json::String(s)) if s.parse::<f64>().is_ok() => Ok(()),
            (Type::Bool, Json::Bool(_)) => Ok(()),
            (Type::Bool, Json::String(s)) if s == "true" || s == "false" => Ok(()),
            (Type::String, Json::String(_)) => Ok(()),
            (Type::Bytes, Json::String(s)) => STANDARD
                .decode(s)
                .map(|_| ())
                .map_err(|_| format!("{path} is not a valid base64 string")),
            (Type::Array { element }, Json::Array(items)) => {
                for (i, item) in items.iter().enumerate() {
                    self.check(element, &format!("{path}[{i}]"), item)?;
                }
                Ok(())
            }
            (Type::Array { .. }, _) => Err(format!("{path} is not a slice")),
            (Type::Map { key, value: element }, Json::Object(map)) => {
                for (k, v) in map {
                    let entry = format!("{path}[{k:?}]");
                    self.check(key, &entry, &Json::String(k.clone()))?;
                    self.check(element, &entry, v)?;
                }
                Ok(())
            }
            (Type::Map { .. }, _) => Err(format!("{path} is not a map")),
            (Type::Ref(r), _) => self.check_ref(r, path, value),
            (expected, found) => Err(format!(
                "{path} has wrong type, expected {expected} found {}",
                json_kind(found)
            )),
        }
    }

    fn check_ref(&self, r: &Ref, path: &str, value: &Json) -> Result<(), String> {
        let decl = self
            .schema
            .module(&r.module)
            .and_then(|m| {
                m.decls.iter().find(|d| {
                    d.name() == r.name
                        && matches!(d, Decl::Data(_) | Decl::Enum(_) | Decl::TypeAlias(_))
                })
            })
            .ok_or_else(|| format!("{path}: unknown type {r}"))?;
        match decl {
            Decl::Data(data) => {
                let data = data.monomorphise(&r.type_parameters)?;
                self.check_data(&data, path, value)
            }
            Decl::TypeAlias(alias) => self.check(&alias.typ, path, value),
            Decl::Enum(e) => self.check_enum(e, r, path, value),
            _ => Err(format!("{path}: {r} is not a type")),
        }
    }

    fn check_data(&self, data: &Data, path: &str, value: &Json) -> Result<(), String> {
        let Json::Object(map) = value else {
            return Err(format!("{path} is not a map"));
        };
        for field in &data.fields {
            let field_path = format!("{path}.{}", field.name);
            let found = field
                .json_alias()
                .and_then(|alias| map.get(alias))
                .or_else(|| map.get(&field.name));
            match found {
                Some(v) => self.check(&field.typ, &field_path, v)?,
                None if may_be_absent(&field.typ) => {}
                None => return Err(format!("{field_path} is required")),
            }
        }
        if !self.lenient {
            for key in map.keys() {
                let known = data
                    .fields
                    .iter()
                    .any(|f| f.name == *key || f.json_alias() == Some(key.as_str()));
                if !known {
                    return Err(format!("{path}.{key} is not a valid field"));
                }
            }
        }
        Ok(())
    }

    fn check_enum(&self, e: &Enum, r: &Ref, path: &str, value: &Json) -> Result<(), String> {
        if e.is_value_enum() {
            let matches = e.variants.iter().any(|variant| match (&variant.value, value) {
                (Value::String(s), Json::String(v)) => s == v,
                (Value::Int(n), Json::Number(v)) => v.as_i64() == Some(*n),
                _ => false,
            });
            if matches {
                return Ok(());
            }
            return Err(format!("{value} is not a valid variant of enum {r}"));
        }
        let variant = value
            .get("name")
            .and_then(Json::as_str)
            .and_then(|name| e.variants.iter().find(|v| v.name == name))
            .ok_or_else(|| format!("{value} is not a valid variant of enum {r}"))?;
        let Value::Type(typ) = &variant.value else {
            return Err(format!("{value} is not a valid variant of enum {r}"));
        };
        let inner = value.get("value").unwrap_or(&Json::Null);
        self.check(typ, &format!("{path}.{}", variant.name), inner)
    }
}

fn may_be_absent(typ: &Type) -> bool {
    matches!(
        typ,
        Type::Optional { .. }
            | Type::Any
            | Type::Array { .. }
            | Type::Map { .. }
            | Type::Bytes
            | Type::Unit
    )
}

fn json_kind(value: &Json) -> &'static str {
    match value {
        Json::Null => "null",
        Json::Bool(_) => "bool",
        Json::Number(_) => "number",
        Json::String(_) => "string",
        Json::Array(_) => "array",
        Json::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::parse_string;

    const SOURCE: &str = r#"
module shop {
  export enum Colour: String {
    Red = "red"
    Blue = "blue"
  }

  export enum Shape {
    Circle Float
    Label String
  }

  export data Item {
    name String +alias json "n"
    price Float
    tags [String]
    colour shop.Colour?
  }

  export data Order {
    id Int
    placed Time
    items [shop.Item]
    blob Bytes
    note String?
    shape shop.Shape?
  }

  export verb place(shop.Order) Unit

  export verb loose(shop.Order) Unit
    +encoding json lenient
}
"#;

    fn schema() -> Schema {
        parse_string("", SOURCE).unwrap()
    }

    fn order_type() -> Type {
        Type::Ref(Ref::new("shop", "Order"))
    }

    fn check(value: Json) -> Result<(), String> {
        validate_json_value(&schema(), &order_type(), "shop.Order", &value, false)
            .map_err(|e| e.to_string())
    }

    fn valid_order() -> Json {
        json!({
            "id": 1,
            "placed": "2024-01-01T10:00:00Z",
            "items": [{"n": "tea", "price": 2.5, "tags": [], "colour": "red"}],
            "blob": "aGVsbG8=",
        })
    }

    #[test]
    fn accepts_a_well_formed_payload() {
        check(valid_order()).unwrap();
    }

    #[test]
    fn reports_nested_paths() {
        let mut order = valid_order();
        order["items"][0]["price"] = json!(true);
        assert_eq!(
            check(order).unwrap_err(),
            "shop.Order.items[0].price has wrong type, expected Float found bool"
        );
    }

    #[test]
    fn required_and_unknown_fields() {
        let mut order = valid_order();
        order.as_object_mut().unwrap().remove("id");
        assert_eq!(check(order).unwrap_err(), "shop.Order.id is required");

        let mut order = valid_order();
        order["extra"] = json!(1);
        assert_eq!(check(order).unwrap_err(), "shop.Order.extra is not a valid field");
    }

    #[test]
    fn scalars_accept_string_forms() {
        let mut order = valid_order();
        order["id"] = json!("42");
        check(order).unwrap();
    }

    #[test]
    fn time_and_bytes_formats() {
        let mut order = valid_order();
        order["placed"] = json!("yesterday");
        assert_eq!(
            check(order).unwrap_err(),
            "time shop.Order.placed must be an RFC3339 formatted string"
        );
        let mut order = valid_order();
        order["blob"] = json!("!!!");
        assert_eq!(
            check(order).unwrap_err(),
            "shop.Order.blob is not a valid base64 string"
        );
    }

    #[test]
    fn enums() {
        let mut order = valid_order();
        order["items"][0]["colour"] = json!("green");
        assert_eq!(
            check(order).unwrap_err(),
            "\"green\" is not a valid variant of enum shop.Colour"
        );
        let mut order = valid_order();
        order["shape"] = json!({"name": "Circle", "value": 1.5});
        check(order).unwrap();
    }

    #[test]
    fn lenient_encoding_allows_unknown_fields() {
        let schema = schema();
        let mut order = valid_order();
        order["extra"] = json!(1);
        let body = serde_json::to_vec(&order).unwrap();
        let strict = schema.resolve_verb(&ftl_core::RefKey::new("shop", "place")).unwrap();
        assert!(validate_request_body(&schema, strict, &body).is_err());
        let loose = schema.resolve_verb(&ftl_core::RefKey::new("shop", "loose")).unwrap();
        validate_request_body(&schema, loose, &body).unwrap();
    }

    #[test]
    fn unit_requires_an_empty_map() {
        let schema = schema();
        validate_json_value(&schema, &Type::Unit, "Unit", &json!({}), false).unwrap();
        assert_eq!(
            validate_json_value(&schema, &Type::Unit, "Unit", &json!([]), false)
                .unwrap_err()
                .to_string(),
            "Unit must be an empty map"
        );
    }
}
