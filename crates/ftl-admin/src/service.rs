//! Config and secret management.
//!
//! Values live in the state store as JSON bytes, either globally or scoped
//! to a module. A module sees the global values overlaid by its own.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use ftl_state::{StateStore, ValueKind};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::info;

use crate::error::{AdminError, AdminResult};

static VALUE_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:([A-Za-z_][A-Za-z0-9_]*)\.)?([A-Za-z_][A-Za-z0-9_]*)$").expect("value ref regex")
});

/// `name` for a global value, `module.name` for a module's.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ValueRef {
    pub module: Option<String>,
    pub name: String,
}

impl ValueRef {
    pub fn global(name: impl Into<String>) -> Self {
        Self {
            module: None,
            name: name.into(),
        }
    }

    pub fn scoped(module: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            module: Some(module.into()),
            name: name.into(),
        }
    }
}

impl fmt::Display for ValueRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.module {
            Some(module) => write!(f, "{module}.{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

impl FromStr for ValueRef {
    type Err = AdminError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = VALUE_REF
            .captures(s)
            .ok_or_else(|| AdminError::InvalidArgument(format!("invalid reference {s:?}")))?;
        Ok(Self {
            module: caps.get(1).map(|m| m.as_str().to_string()),
            name: caps[2].to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListEntry {
    #[serde(rename = "ref")]
    pub reference: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Json>,
}

#[derive(Clone)]
pub struct AdminService {
    store: StateStore,
}

impl AdminService {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    pub fn config_list(&self, module: Option<&str>, include_values: bool) -> AdminResult<Vec<ListEntry>> {
        self.list(ValueKind::Config, module, include_values)
    }

    pub fn config_get(&self, reference: &ValueRef) -> AdminResult<Json> {
        self.get(ValueKind::Config, reference)
    }

    pub fn config_set(&self, reference: &ValueRef, value: &Json) -> AdminResult<()> {
        self.set(ValueKind::Config, reference, value)
    }

    pub fn config_unset(&self, reference: &ValueRef) -> AdminResult<()> {
        self.unset(ValueKind::Config, reference)
    }

    pub fn secrets_list(&self, module: Option<&str>, include_values: bool) -> AdminResult<Vec<ListEntry>> {
        self.list(ValueKind::Secret, module, include_values)
    }

    pub fn secret_get(&self, reference: &ValueRef) -> AdminResult<Json> {
        self.get(ValueKind::Secret, reference)
    }

    pub fn secret_set(&self, reference: &ValueRef, value: &Json) -> AdminResult<()> {
        self.set(ValueKind::Secret, reference, value)
    }

    pub fn secret_unset(&self, reference: &ValueRef) -> AdminResult<()> {
        self.unset(ValueKind::Secret, reference)
    }

    /// Config visible to `module`: globals overlaid by the module's own.
    pub fn map_configs_for_module(&self, module: &str) -> AdminResult<BTreeMap<String, Vec<u8>>> {
        self.map_for_module(ValueKind::Config, module)
    }

    pub fn map_secrets_for_module(&self, module: &str) -> AdminResult<BTreeMap<String, Vec<u8>>> {
        self.map_for_module(ValueKind::Secret, module)
    }

    fn list(
        &self,
        kind: ValueKind,
        module: Option<&str>,
        include_values: bool,
    ) -> AdminResult<Vec<ListEntry>> {
        self.store
            .list_values(kind)?
            .into_iter()
            .filter(|v| module.is_none() || v.module.is_none() || v.module.as_deref() == module)
            .map(|v| {
                let value = if include_values {
                    Some(decode(&v.value)?)
                } else {
                    None
                };
                Ok(ListEntry {
                    reference: v.reference(),
                    value,
                })
            })
            .collect()
    }

    fn get(&self, kind: ValueKind, reference: &ValueRef) -> AdminResult<Json> {
        let bytes = self
            .store
            .get_value(kind, reference.module.as_deref(), &reference.name)?
            .ok_or_else(|| AdminError::NotFound(format!("{} {reference} not found", kind.as_str())))?;
        decode(&bytes)
    }

    fn set(&self, kind: ValueKind, reference: &ValueRef, value: &Json) -> AdminResult<()> {
        let bytes = serde_json::to_vec(value).map_err(|e| AdminError::Encoding(e.to_string()))?;
        self.store
            .put_value(kind, reference.module.as_deref(), &reference.name, &bytes)?;
        info!(kind = kind.as_str(), %reference, "value set");
        Ok(())
    }

    fn unset(&self, kind: ValueKind, reference: &ValueRef) -> AdminResult<()> {
        let existed = self
            .store
            .delete_value(kind, reference.module.as_deref(), &reference.name)?;
        if !existed {
            return Err(AdminError::NotFound(format!("{} {reference} not found", kind.as_str())));
        }
        info!(kind = kind.as_str(), %reference, "value unset");
        Ok(())
    }

    fn map_for_module(&self, kind: ValueKind, module: &str) -> AdminResult<BTreeMap<String, Vec<u8>>> {
        let values = self.store.list_values(kind)?;
        let mut map = BTreeMap::new();
        // Globals are listed first, so module values overwrite them.
        for value in values {
            match value.module.as_deref() {
                None => {
                    map.insert(value.name, value.value);
                }
                Some(m) if m == module => {
                    map.insert(value.name, value.value);
                }
                Some(_) => {}
            }
        }
        Ok(map)
    }
}

fn decode(bytes: &[u8]) -> AdminResult<Json> {
    serde_json::from_slice(bytes).map_err(|e| AdminError::Encoding(e.to_string()))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn admin() -> AdminService {
        AdminService::new(StateStore::open_in_memory().unwrap())
    }

    #[test]
    fn references_parse_with_an_optional_module() {
        assert_eq!("region".parse::<ValueRef>().unwrap(), ValueRef::global("region"));
        assert_eq!(
            "echo.region".parse::<ValueRef>().unwrap(),
            ValueRef::scoped("echo", "region")
        );
        assert_eq!(ValueRef::scoped("echo", "region").to_string(), "echo.region");
        assert!("a.b.c".parse::<ValueRef>().is_err());
        assert!("".parse::<ValueRef>().is_err());
    }

    #[test]
    fn set_get_and_unset() {
        let admin = admin();
        let key = ValueRef::scoped("echo", "greeting");
        admin.config_set(&key, &json!("hello")).unwrap();
        assert_eq!(admin.config_get(&key).unwrap(), json!("hello"));
        // Secrets are a separate namespace.
        assert!(matches!(admin.secret_get(&key), Err(AdminError::NotFound(_))));

        admin.config_unset(&key).unwrap();
        let err = admin.config_get(&key).unwrap_err();
        assert_eq!(err.to_string(), "config echo.greeting not found");
        assert!(matches!(admin.config_unset(&key), Err(AdminError::NotFound(_))));
    }

    #[test]
    fn module_maps_overlay_globals() {
        let admin = admin();
        admin.secret_set(&ValueRef::global("token"), &json!("global")).unwrap();
        admin.secret_set(&ValueRef::global("region"), &json!("eu")).unwrap();
        admin.secret_set(&ValueRef::scoped("echo", "token"), &json!("echo")).unwrap();
        admin.secret_set(&ValueRef::scoped("time", "token"), &json!("time")).unwrap();

        let map = admin.map_secrets_for_module("echo").unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map["token"], b"\"echo\"".to_vec());
        assert_eq!(map["region"], b"\"eu\"".to_vec());
    }

    #[test]
    fn listing_filters_by_module() {
        let admin = admin();
        admin.config_set(&ValueRef::global("region"), &json!("eu")).unwrap();
        admin.config_set(&ValueRef::scoped("echo", "a"), &json!(1)).unwrap();
        admin.config_set(&ValueRef::scoped("time", "b"), &json!(2)).unwrap();

        let refs = |entries: Vec<ListEntry>| -> Vec<String> {
            entries.into_iter().map(|e| e.reference).collect()
        };
        assert_eq!(refs(admin.config_list(None, false).unwrap()), ["region", "echo.a", "time.b"]);
        assert_eq!(refs(admin.config_list(Some("echo"), false).unwrap()), ["region", "echo.a"]);

        let with_values = admin.config_list(Some("time"), true).unwrap();
        assert_eq!(with_values[1].value, Some(json!(2)));
    }
}
