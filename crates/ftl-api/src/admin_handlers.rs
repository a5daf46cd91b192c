//! Config and secret handlers. Both kinds share one set of routes,
//! mounted once under `/config` and once under `/secrets`.

use std::collections::BTreeMap;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use ftl_admin::{AdminResult, AdminService, ListEntry, ValueRef};
use serde::Deserialize;
use serde_json::Value;

use crate::error::{ApiError, ApiResult};
use crate::{ApiResponse, ApiState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Config,
    Secret,
}

impl Kind {
    fn list(self, admin: &AdminService, module: Option<&str>, values: bool) -> AdminResult<Vec<ListEntry>> {
        match self {
            Kind::Config => admin.config_list(module, values),
            Kind::Secret => admin.secrets_list(module, values),
        }
    }

    fn get(self, admin: &AdminService, reference: &ValueRef) -> AdminResult<Value> {
        match self {
            Kind::Config => admin.config_get(reference),
            Kind::Secret => admin.secret_get(reference),
        }
    }

    fn set(self, admin: &AdminService, reference: &ValueRef, value: &Value) -> AdminResult<()> {
        match self {
            Kind::Config => admin.config_set(reference, value),
            Kind::Secret => admin.secret_set(reference, value),
        }
    }

    fn unset(self, admin: &AdminService, reference: &ValueRef) -> AdminResult<()> {
        match self {
            Kind::Config => admin.config_unset(reference),
            Kind::Secret => admin.secret_unset(reference),
        }
    }

    fn map_for_module(self, admin: &AdminService, module: &str) -> AdminResult<BTreeMap<String, Vec<u8>>> {
        match self {
            Kind::Config => admin.map_configs_for_module(module),
            Kind::Secret => admin.map_secrets_for_module(module),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub module: Option<String>,
    #[serde(default)]
    pub include_values: bool,
}

fn value_ref(text: &str) -> ApiResult<ValueRef> {
    Ok(text.parse::<ValueRef>()?)
}

/// GET /api/v1/{config,secrets}
pub async fn list(
    kind: Kind,
    State(state): State<ApiState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Response> {
    let entries = kind.list(&state.admin, query.module.as_deref(), query.include_values)?;
    Ok(ApiResponse::ok(entries).into_response())
}

/// GET /api/v1/{config,secrets}/{ref}
pub async fn get(kind: Kind, State(state): State<ApiState>, Path(name): Path<String>) -> ApiResult<Response> {
    let value = kind.get(&state.admin, &value_ref(&name)?)?;
    Ok(ApiResponse::ok(value).into_response())
}

/// PUT /api/v1/{config,secrets}/{ref}, the JSON value as the body.
pub async fn set(
    kind: Kind,
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(value): Json<Value>,
) -> ApiResult<Response> {
    kind.set(&state.admin, &value_ref(&name)?, &value)?;
    Ok(ApiResponse::ok(()).into_response())
}

/// DELETE /api/v1/{config,secrets}/{ref}
pub async fn unset(kind: Kind, State(state): State<ApiState>, Path(name): Path<String>) -> ApiResult<Response> {
    kind.unset(&state.admin, &value_ref(&name)?)?;
    Ok(ApiResponse::ok(()).into_response())
}

/// GET /api/v1/modules/{module}/{config,secrets}: what the module sees,
/// globals overlaid by its own values.
pub async fn map_for_module(
    kind: Kind,
    State(state): State<ApiState>,
    Path(module): Path<String>,
) -> ApiResult<Response> {
    let mut values = BTreeMap::new();
    for (name, raw) in kind.map_for_module(&state.admin, &module)? {
        let value: Value = serde_json::from_slice(&raw).map_err(|e| {
            ApiError::new(ftl_core::Code::Internal, format!("stored value {name:?} is not JSON: {e}"))
        })?;
        values.insert(name, value);
    }
    Ok(ApiResponse::ok(values).into_response())
}
