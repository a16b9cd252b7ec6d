//! HTTP surface: the client acquisition API, the blob routes signed upload
//! URLs point at, and the operator management API.
use crate::acquisition::{Acquisition, DeployReport, DownloadReport, UpdateCheckParams};
use crate::blob::BlobStore;
use crate::error::DistributionError;
use crate::lifecycle::{PromoteRequest, ReleaseManager, ReleasePatch, StageRequest};
use crate::registry::Registry;
use crate::types::{Actor, AppId, Permission, PlatformName, ReleaseId};
use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, FromRequestParts, Path, Query, State},
    http::{StatusCode, header, request::Parts},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Header carrying the authenticated operator, set by the auth proxy in
/// front of the management API.
pub const USER_HEADER: &str = "x-ota-user";

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub releases: Arc<ReleaseManager>,
    pub acquisition: Arc<Acquisition>,
    pub blobs: Arc<dyn BlobStore>,
}

pub fn router(state: AppState, max_upload_bytes: usize) -> Router {
    let acquisition = Router::new()
        .route("/update_check", get(update_check))
        .route("/report_status/download", post(report_download))
        .route("/report_status/deploy", post(report_deploy));

    let management = Router::new()
        .route("/apps", post(create_app))
        .route("/apps/{app_id}", get(get_app))
        .route(
            "/apps/{app_id}/deployments",
            get(list_deployments).post(create_deployment),
        )
        .route("/apps/{app_id}/collaborators", get(list_collaborators))
        .route(
            "/apps/{app_id}/collaborators/{user_id}",
            put(add_collaborator).delete(remove_collaborator),
        )
        .route("/deployments/{key}/rotate_key", post(rotate_key))
        .route(
            "/deployments/{key}/releases",
            get(history)
                .post(stage_release)
                .patch(update_metadata)
                .delete(clear_history),
        )
        .route("/deployments/{key}/releases/{release}", delete(delete_release))
        .route(
            "/deployments/{key}/releases/{release}/verify",
            post(verify_release),
        )
        .route("/deployments/{key}/promote/{target}", post(promote))
        .route("/deployments/{key}/rollback", post(rollback))
        .route("/deployments/{key}/rollback/{label}", post(rollback_to))
        .route("/deployments/{key}/metrics", get(deployment_metrics));

    Router::new()
        .nest("/v0.1/public/codepush", acquisition)
        .nest("/v0.1/management", management)
        .route("/blobs/{*key}", get(download_blob).put(upload_blob))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .with_state(state)
}

#[derive(Serialize)]
struct ApiErrorResponse {
    error_message: String,
}

impl IntoResponse for DistributionError {
    fn into_response(self) -> Response {
        let status = match &self {
            DistributionError::Conflict(_) => StatusCode::CONFLICT,
            DistributionError::NotFound(_) => StatusCode::NOT_FOUND,
            DistributionError::Forbidden(_) => StatusCode::FORBIDDEN,
            DistributionError::Validation(_) => StatusCode::BAD_REQUEST,
            DistributionError::NotModified => return StatusCode::NOT_MODIFIED.into_response(),
            DistributionError::Internal(err) => {
                tracing::error!(error = %err, "internal error");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = Json(ApiErrorResponse {
            error_message: self.to_string(),
        });

        (status, body).into_response()
    }
}

type ApiResult<T> = Result<T, DistributionError>;

/// The operator behind a management request.
pub struct Operator(pub Actor);

impl<S: Send + Sync> FromRequestParts<S> for Operator {
    type Rejection = DistributionError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_HEADER)
            .and_then(|value| value.to_str().ok())
            .filter(|user| !user.is_empty())
            .map(|user| Operator(Actor::new(user)))
            .ok_or_else(|| DistributionError::Forbidden(format!("missing {USER_HEADER} header")))
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UpdateCheckResponse {
    update_info: crate::resolver::UpdateDecision,
}

async fn update_check(
    State(state): State<AppState>,
    Query(params): Query<UpdateCheckParams>,
) -> ApiResult<Json<UpdateCheckResponse>> {
    let update_info = state.acquisition.update_check(&params).await?;
    Ok(Json(UpdateCheckResponse { update_info }))
}

async fn report_download(
    State(state): State<AppState>,
    Json(report): Json<DownloadReport>,
) -> ApiResult<StatusCode> {
    state.acquisition.report_download(&report)?;
    Ok(StatusCode::OK)
}

async fn report_deploy(
    State(state): State<AppState>,
    Json(report): Json<DeployReport>,
) -> ApiResult<StatusCode> {
    state.acquisition.report_deploy(&report)?;
    Ok(StatusCode::OK)
}

#[derive(Deserialize)]
struct UploadParams {
    expires: u64,
    signature: String,
}

async fn upload_blob(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(params): Query<UploadParams>,
    body: Bytes,
) -> ApiResult<StatusCode> {
    state
        .blobs
        .signer()
        .verify_upload(&key, params.expires, &params.signature)?;
    // Bundles are write-once; a bad upload is replaced by staging again.
    if state.blobs.head(&key).await?.is_some() {
        return Err(DistributionError::conflict(format!(
            "a bundle was already uploaded to {key}"
        )));
    }
    state.blobs.put(&key, body).await?;
    Ok(StatusCode::OK)
}

async fn download_blob(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let data = state.blobs.get(&key).await?;
    Ok(([(header::CONTENT_TYPE, "application/octet-stream")], data))
}

#[derive(Deserialize)]
struct CreateApp {
    name: String,
}

async fn create_app(
    State(state): State<AppState>,
    Operator(actor): Operator,
    Json(body): Json<CreateApp>,
) -> ApiResult<impl IntoResponse> {
    let app = state.registry.create_app(&actor, &body.name).await?;
    Ok((StatusCode::CREATED, Json(app)))
}

async fn get_app(
    State(state): State<AppState>,
    Operator(actor): Operator,
    Path(app_id): Path<AppId>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.registry.app(&actor, app_id).await?))
}

#[derive(Deserialize)]
struct PlatformFilter {
    platform: Option<PlatformName>,
}

async fn list_deployments(
    State(state): State<AppState>,
    Operator(actor): Operator,
    Path(app_id): Path<AppId>,
    Query(filter): Query<PlatformFilter>,
) -> ApiResult<impl IntoResponse> {
    let deployments = state
        .registry
        .deployments(&actor, app_id, filter.platform)
        .await?;
    Ok(Json(deployments))
}

#[derive(Deserialize)]
struct CreateDeployment {
    platform: PlatformName,
    name: String,
}

async fn create_deployment(
    State(state): State<AppState>,
    Operator(actor): Operator,
    Path(app_id): Path<AppId>,
    Json(body): Json<CreateDeployment>,
) -> ApiResult<impl IntoResponse> {
    let deployment = state
        .registry
        .create_deployment(&actor, app_id, body.platform, &body.name)
        .await?;
    Ok((StatusCode::CREATED, Json(deployment)))
}

async fn list_collaborators(
    State(state): State<AppState>,
    Operator(actor): Operator,
    Path(app_id): Path<AppId>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.registry.collaborators(&actor, app_id).await?))
}

#[derive(Deserialize)]
struct CollaboratorBody {
    permission: Permission,
}

async fn add_collaborator(
    State(state): State<AppState>,
    Operator(actor): Operator,
    Path((app_id, user_id)): Path<(AppId, String)>,
    Json(body): Json<CollaboratorBody>,
) -> ApiResult<StatusCode> {
    state
        .registry
        .add_collaborator(&actor, app_id, &user_id, body.permission)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn remove_collaborator(
    State(state): State<AppState>,
    Operator(actor): Operator,
    Path((app_id, user_id)): Path<(AppId, String)>,
) -> ApiResult<StatusCode> {
    state
        .registry
        .remove_collaborator(&actor, app_id, &user_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn rotate_key(
    State(state): State<AppState>,
    Operator(actor): Operator,
    Path(key): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.registry.rotate_deployment_key(&actor, &key).await?))
}

async fn history(
    State(state): State<AppState>,
    Operator(actor): Operator,
    Path(key): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.releases.history(&actor, &key).await?))
}

async fn stage_release(
    State(state): State<AppState>,
    Operator(actor): Operator,
    Path(key): Path<String>,
    Json(request): Json<StageRequest>,
) -> ApiResult<impl IntoResponse> {
    let staged = state.releases.stage_release(&actor, &key, request).await?;
    Ok((StatusCode::CREATED, Json(staged)))
}

async fn verify_release(
    State(state): State<AppState>,
    Operator(actor): Operator,
    Path((key, release_id)): Path<(String, ReleaseId)>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(
        state
            .releases
            .verify_release(&actor, &key, release_id)
            .await?,
    ))
}

#[derive(Deserialize)]
struct MetadataUpdate {
    /// Release to patch, the latest one if absent.
    label: Option<String>,
    #[serde(flatten)]
    patch: ReleasePatch,
}

async fn update_metadata(
    State(state): State<AppState>,
    Operator(actor): Operator,
    Path(key): Path<String>,
    Json(body): Json<MetadataUpdate>,
) -> ApiResult<impl IntoResponse> {
    let release = state
        .releases
        .update_metadata(&actor, &key, body.label.as_deref(), body.patch)
        .await?;
    Ok(Json(release))
}

async fn delete_release(
    State(state): State<AppState>,
    Operator(actor): Operator,
    Path((key, label)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    state.releases.delete_release(&actor, &key, &label).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn clear_history(
    State(state): State<AppState>,
    Operator(actor): Operator,
    Path(key): Path<String>,
) -> ApiResult<StatusCode> {
    state.releases.clear_history(&actor, &key).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn promote(
    State(state): State<AppState>,
    Operator(actor): Operator,
    Path((key, target)): Path<(String, String)>,
    Json(request): Json<PromoteRequest>,
) -> ApiResult<impl IntoResponse> {
    let release = state
        .releases
        .promote(&actor, &key, &target, request)
        .await?;
    Ok((StatusCode::CREATED, Json(release)))
}

async fn rollback(
    State(state): State<AppState>,
    Operator(actor): Operator,
    Path(key): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let release = state.releases.rollback(&actor, &key, None).await?;
    Ok((StatusCode::CREATED, Json(release)))
}

async fn rollback_to(
    State(state): State<AppState>,
    Operator(actor): Operator,
    Path((key, label)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let release = state.releases.rollback(&actor, &key, Some(&label)).await?;
    Ok((StatusCode::CREATED, Json(release)))
}

async fn deployment_metrics(
    State(state): State<AppState>,
    Operator(actor): Operator,
    Path(key): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.releases.deployment_metrics(&actor, &key).await?))
}
