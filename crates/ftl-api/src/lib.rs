//! ftl-api: the control plane's services over HTTP.
//!
//! Every handler answers with `{"success": true, "data": ...}` or, on error,
//! `{"success": false, "code": ..., "error": ...}` with the HTTP status of
//! the error's code. Streams are newline-delimited JSON, except the
//! timeline stream which is server-sent events.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/ping` | Liveness |
//! | GET | `/api/v1/status` | Controllers, runners, deployments and routes |
//! | GET | `/api/v1/processes` | One entry per deployment runner |
//! | POST | `/api/v1/deployments` | Create a deployment |
//! | GET | `/api/v1/deployments/{key}` | Get a deployment |
//! | POST | `/api/v1/deployments/{key}/update` | Set min replicas |
//! | POST | `/api/v1/deployments/{key}/replace` | Replace the module's active deployment |
//! | PUT | `/api/v1/deployments/{key}/runtime` | Merge runtime data |
//! | GET | `/api/v1/deployments/{key}/artefacts` | Stream artefact chunks |
//! | GET | `/api/v1/deployments/{key}/context` | Stream deployment contexts |
//! | POST | `/api/v1/artefacts` | Upload an artefact |
//! | POST | `/api/v1/artefacts/diffs` | Digests the store lacks |
//! | POST | `/api/v1/runners/register` | Heartbeat stream |
//! | POST | `/api/v1/logs` | Runner log stream |
//! | GET | `/api/v1/schema` | The current schema |
//! | GET | `/api/v1/schema/pull` | Stream schema changes |
//! | POST | `/api/v1/verbs/{verb}` | Call a verb |
//! | POST | `/api/v1/topics/{topic}/events` | Publish an event |
//! | POST | `/api/v1/subscriptions/{subscription}/reset` | Move a cursor to the head |
//! | GET, PUT, DELETE | `/api/v1/config[/{ref}]` | Config values |
//! | GET, PUT, DELETE | `/api/v1/secrets[/{ref}]` | Secret values |
//! | GET | `/api/v1/modules/{module}/config`, `/secrets` | Values a module sees |
//! | POST | `/api/v1/timeline/query` | Query the timeline |
//! | POST, DELETE | `/api/v1/timeline/events` | Insert or expire events |
//! | GET | `/api/v1/timeline/stream` | Follow the timeline |

pub mod admin_handlers;
pub mod error;
pub mod handlers;
pub mod stream;
pub mod timeline_handlers;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use ftl_admin::AdminService;
use ftl_controller::ControllerService;
use ftl_core::Clock;
use ftl_dispatch::Dispatcher;
use ftl_pubsub::PubSubService;
use ftl_timeline::InMemoryTimeline;
use serde::Serialize;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use crate::admin_handlers::{Kind, ListQuery};

pub use error::{ApiError, ApiResult};

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub controller: ControllerService,
    pub admin: AdminService,
    pub dispatcher: Dispatcher,
    pub pubsub: PubSubService,
    pub timeline: Arc<InMemoryTimeline>,
    pub clock: Arc<dyn Clock>,
}

/// Response wrapper for consistent API format.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            code: None,
            error: None,
        })
    }
}

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/ping", get(handlers::ping))
        .route("/status", get(handlers::status))
        .route("/processes", get(handlers::process_list))
        .route("/deployments", post(handlers::create_deployment))
        .route("/deployments/{key}", get(handlers::get_deployment))
        .route("/deployments/{key}/update", post(handlers::update_deploy))
        .route("/deployments/{key}/replace", post(handlers::replace_deploy))
        .route("/deployments/{key}/runtime", put(handlers::update_deployment_runtime))
        .route("/deployments/{key}/artefacts", get(handlers::deployment_artefacts))
        .route("/deployments/{key}/context", get(handlers::deployment_context))
        .route("/artefacts", post(handlers::upload_artefact))
        .route("/artefacts/diffs", post(handlers::artefact_diffs))
        .route("/runners/register", post(handlers::register_runner))
        .route("/logs", post(handlers::stream_deployment_logs))
        .route("/schema", get(handlers::get_schema))
        .route("/schema/pull", get(handlers::pull_schema))
        .route("/verbs/{verb}", post(handlers::call))
        .route("/topics/{topic}/events", post(handlers::publish_event))
        .route("/subscriptions/{subscription}/reset", post(handlers::reset_subscription))
        .route("/timeline/query", post(timeline_handlers::get_timeline))
        .route(
            "/timeline/events",
            post(timeline_handlers::create_events).delete(timeline_handlers::delete_old_events),
        )
        .route("/timeline/stream", get(timeline_handlers::stream_timeline))
        .merge(admin_routes("config", Kind::Config))
        .merge(admin_routes("secrets", Kind::Secret))
        .with_state(state);

    Router::new().nest("/api/v1", api_routes)
}

fn admin_routes(prefix: &str, kind: Kind) -> Router<ApiState> {
    Router::new()
        .route(
            &format!("/{prefix}"),
            get(move |state: State<ApiState>, query: Query<ListQuery>| admin_handlers::list(kind, state, query)),
        )
        .route(
            &format!("/{prefix}/{{name}}"),
            get(move |state: State<ApiState>, name: Path<String>| admin_handlers::get(kind, state, name))
                .put(
                    move |state: State<ApiState>, name: Path<String>, value: Json<Value>| {
                        admin_handlers::set(kind, state, name, value)
                    },
                )
                .delete(move |state: State<ApiState>, name: Path<String>| {
                    admin_handlers::unset(kind, state, name)
                }),
        )
        .route(
            &format!("/modules/{{module}}/{prefix}"),
            get(move |state: State<ApiState>, module: Path<String>| {
                admin_handlers::map_for_module(kind, state, module)
            }),
        )
}

/// Serve the API on `listener` until shutdown is signalled.
pub async fn serve(
    listener: TcpListener,
    state: ApiState,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "API server starting");
    axum::serve(
        listener,
        build_router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = shutdown.changed().await;
    })
    .await?;
    info!("API server stopped");
    Ok(())
}
