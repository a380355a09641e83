use std::{sync::Arc, time::Duration};

use anyhow::{Error, Result};
use axum::{
    Router,
    extract::{
        DefaultBodyLimit, Path, Query, State,
        rejection::{JsonRejection, PathRejection, QueryRejection},
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json},
    routing::{get, post},
};
use serde_json::json;
use tokio::{net::TcpListener, sync::watch};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    error::EmailServiceError,
    models::{
        context::RequestContext,
        email::{SendEmailRequest, SendEmailResponse},
        outbox::OutboxFilter,
        response::{ApiResponse, PaginationMeta},
        template::{CreateTemplateRequest, UpdateTemplateRequest},
    },
    services::{ingress::IngressService, template::TemplateService},
    workers::shutdown_requested,
};

const CORRELATION_HEADERS: [&str; 2] = ["x-correlation-id", "x-request-id"];
const IDEMPOTENCY_HEADER: &str = "idempotency-key";
const REQUEST_DEADLINE: Duration = Duration::from_secs(10);

pub struct AppState {
    pub ingress: Arc<IngressService>,
    pub templates: Arc<TemplateService>,
}

pub fn router(state: Arc<AppState>, max_request_bytes: usize) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/emails", get(list_emails).post(send_email))
        .route("/emails/{id}", get(get_email).delete(delete_email))
        .route("/templates", post(create_template))
        .route(
            "/templates/{id}",
            get(get_template).put(update_template).delete(delete_template),
        )
        .layer(DefaultBodyLimit::max(max_request_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves `router` until shutdown is requested, then drains in-flight requests.
pub async fn run_api_server(
    listener: TcpListener,
    router: Router,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Error> {
    let addr = listener
        .local_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_default();

    info!(address = %addr, "Ingress API started");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown_requested(&mut shutdown).await;
            info!("Ingress API received shutdown signal");
        })
        .await?;

    info!("Ingress API stopped");
    Ok(())
}

fn request_context(headers: &HeaderMap) -> RequestContext {
    let correlation_id = CORRELATION_HEADERS
        .iter()
        .filter_map(|name| headers.get(*name))
        .filter_map(|value| value.to_str().ok())
        .map(str::trim)
        .find(|value| !value.is_empty());

    match correlation_id {
        Some(id) => RequestContext::new(id),
        None => RequestContext::generate(),
    }
    .with_timeout(REQUEST_DEADLINE)
}

fn bad_request(message: impl Into<String>) -> EmailServiceError {
    EmailServiceError::Validation(message.into())
}

async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let sample = OutboxFilter {
        limit: Some(1),
        ..OutboxFilter::default()
    };

    match state.ingress.list(&sample).await {
        Ok(_) => (StatusCode::OK, Json(json!({ "status": "healthy" }))),
        Err(e) => {
            warn!(error = %e, "Health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "unhealthy" })),
            )
        }
    }
}

async fn send_email(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Result<Json<SendEmailRequest>, JsonRejection>,
) -> Result<impl IntoResponse, EmailServiceError> {
    let Json(mut request) = body.map_err(|e| bad_request(e.body_text()))?;
    let ctx = request_context(&headers);

    if request.idempotency_key.is_none()
        && let Some(key) = headers
            .get(IDEMPOTENCY_HEADER)
            .and_then(|value| value.to_str().ok())
    {
        request.idempotency_key = Some(key.to_string());
    }

    let send_id = state.ingress.submit(&ctx, request).await?;

    Ok((StatusCode::ACCEPTED, Json(SendEmailResponse { send_id })))
}

async fn list_emails(
    State(state): State<Arc<AppState>>,
    query: Result<Query<OutboxFilter>, QueryRejection>,
) -> Result<impl IntoResponse, EmailServiceError> {
    let Query(filter) = query.map_err(|e| bad_request(e.body_text()))?;
    let page = state.ingress.list(&filter).await?;

    let meta = PaginationMeta::new(page.total, filter.page(), filter.limit());
    Ok(Json(
        ApiResponse::success(page.records, "Emails retrieved").with_meta(meta),
    ))
}

async fn get_email(
    State(state): State<Arc<AppState>>,
    id: Result<Path<Uuid>, PathRejection>,
) -> Result<impl IntoResponse, EmailServiceError> {
    let Path(id) = id.map_err(|e| bad_request(e.body_text()))?;
    Ok(Json(state.ingress.detail(id).await?))
}

async fn delete_email(
    State(state): State<Arc<AppState>>,
    id: Result<Path<Uuid>, PathRejection>,
) -> Result<impl IntoResponse, EmailServiceError> {
    let Path(id) = id.map_err(|e| bad_request(e.body_text()))?;
    state.ingress.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn create_template(
    State(state): State<Arc<AppState>>,
    body: Result<Json<CreateTemplateRequest>, JsonRejection>,
) -> Result<impl IntoResponse, EmailServiceError> {
    let Json(request) = body.map_err(|e| bad_request(e.body_text()))?;
    let template = state.templates.create(request).await?;
    Ok((StatusCode::CREATED, Json(template)))
}

async fn get_template(
    State(state): State<Arc<AppState>>,
    id: Result<Path<Uuid>, PathRejection>,
) -> Result<impl IntoResponse, EmailServiceError> {
    let Path(id) = id.map_err(|e| bad_request(e.body_text()))?;
    Ok(Json(state.templates.get(id).await?))
}

async fn update_template(
    State(state): State<Arc<AppState>>,
    id: Result<Path<Uuid>, PathRejection>,
    body: Result<Json<UpdateTemplateRequest>, JsonRejection>,
) -> Result<impl IntoResponse, EmailServiceError> {
    let Path(id) = id.map_err(|e| bad_request(e.body_text()))?;
    let Json(patch) = body.map_err(|e| bad_request(e.body_text()))?;
    Ok(Json(state.templates.update(id, patch).await?))
}

async fn delete_template(
    State(state): State<Arc<AppState>>,
    id: Result<Path<Uuid>, PathRejection>,
) -> Result<impl IntoResponse, EmailServiceError> {
    let Path(id) = id.map_err(|e| bad_request(e.body_text()))?;
    state.templates.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}
