use std::time::{Duration, Instant};

use axum::{
	Json, Router,
	extract::{FromRequestParts, Path, Query, Request, State},
	http::{HeaderValue, Method, StatusCode, header, request::Parts},
	middleware::{self, Next},
	response::{IntoResponse, Response},
	routing::{delete, get, post, put},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::{
	cors::{AllowOrigin, CorsLayer},
	request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
	timeout::TimeoutLayer,
	trace::TraceLayer,
};
use tracing::info;
use uuid::Uuid;

use pm_service::{
	capture::CaptureRequest,
	entities::{CreateEntityRequest, ListEntitiesRequest, PatchEntityRequest},
	epics::{CreateEpicRequest, ListEpicsRequest, PatchEpicRequest},
	lineage::LineageDirection,
	notes::ListNotesRequest,
	projects::{CreateProjectRequest, ListProjectsRequest, PatchProjectRequest},
	review::{BatchResolveRequest, ListReviewsRequest, ResolveRequest},
	tags::{CreateTagRequest, SetEntityTagsRequest},
	users::{CreateApiKeyRequest, CreateUserRequest},
};

use crate::{sse, state::AppState};

pub fn router(state: AppState) -> Router {
	let request_timeout = Duration::from_secs(state.service.cfg.service.request_timeout_secs);
	let health_timeout = Duration::from_secs(state.service.cfg.service.health_timeout_secs);
	let api = Router::new()
		.route("/notes/capture", post(capture_note))
		.route("/notes", get(list_notes))
		.route("/notes/{id}/reprocess", post(reprocess_note))
		.route("/entities", get(list_entities).post(create_entity))
		.route("/entities/{id}", get(get_entity).patch(patch_entity))
		.route("/entities/{id}/events", get(list_entity_events).post(add_entity_event))
		.route("/entities/{id}/status", post(set_entity_status))
		.route("/entities/{id}/lineage", get(entity_lineage))
		.route("/entities/{id}/tags", put(set_entity_tags))
		.route("/projects", get(list_projects).post(create_project))
		.route("/projects/{id}", delete(delete_project).patch(patch_project))
		.route("/projects/{id}/dashboard", get(project_dashboard))
		.route("/epics", get(list_epics).post(create_epic))
		.route("/epics/{id}", delete(delete_epic).patch(patch_epic))
		.route("/tags", get(list_tags).post(create_tag))
		.route("/review-queue", get(list_reviews))
		.route("/review-queue/count", get(count_reviews))
		.route("/review-queue/{id}/resolve", post(resolve_review))
		.route("/review-queue/resolve-batch", post(resolve_batch))
		.route("/users", get(list_users).post(create_user))
		.route("/api-keys", post(create_api_key))
		.route("/api-keys/{id}", delete(revoke_api_key))
		.layer(TimeoutLayer::new(request_timeout));
	let health = Router::new()
		.route("/health", get(health))
		.layer(TimeoutLayer::new(health_timeout));
	// The event stream outlives any request deadline on purpose.
	let stream = Router::new().route("/sse", get(sse::sse_handler));

	// Layer order is inside-out: the request-id layer runs first so both the
	// propagation layer and the context middleware see an id on every request.
	api.merge(health)
		.merge(stream)
		.layer(middleware::from_fn_with_state(state.clone(), request_context))
		.layer(PropagateRequestIdLayer::x_request_id())
		.layer(TraceLayer::new_for_http())
		.layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
		.layer(cors_layer(&state.service.cfg.service.cors_origins))
		.with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
	let origins: Vec<HeaderValue> =
		origins.iter().filter_map(|origin| origin.parse().ok()).collect();

	CorsLayer::new()
		.allow_origin(AllowOrigin::list(origins))
		.allow_methods([Method::GET, Method::POST, Method::PATCH, Method::PUT, Method::DELETE])
		.allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
}

/// Per-request identity: a request id for log correlation plus the
/// authenticated user, stashed in extensions for handlers to extract.
#[derive(Clone, Debug)]
pub struct ReqCtx {
	pub request_id: String,
	pub user_id: Option<Uuid>,
}

impl<S> FromRequestParts<S> for ReqCtx
where
	S: Send + Sync,
{
	type Rejection = ApiError;

	async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
		parts.extensions.get::<ReqCtx>().cloned().ok_or_else(|| ApiError {
			status: StatusCode::INTERNAL_SERVER_ERROR,
			code: "INTERNAL_ERROR",
			message: "Request context is missing.".to_string(),
			request_id: String::new(),
			details: None,
		})
	}
}

/// Authentication plus the one structured completion record per request.
/// The request id is assigned (and echoed onto the response) by the
/// tower-http request-id layers wrapping this middleware.
async fn request_context(
	State(state): State<AppState>,
	mut req: Request,
	next: Next,
) -> Response {
	let request_id = req
		.headers()
		.get("x-request-id")
		.and_then(|value| value.to_str().ok())
		.unwrap_or_default()
		.to_string();
	let method = req.method().clone();
	let path = req.uri().path().to_string();
	let auth_exempt = path == "/health" || state.service.cfg.auth.disabled;
	let user_id = if auth_exempt {
		None
	} else {
		let token = bearer_token(&req).or_else(|| query_token(&req));
		let Some(token) = token else {
			return unauthorized(&request_id, "Missing API key.");
		};

		match state.service.authenticate_api_key(&token).await {
			Ok(Some(user)) => Some(user.id),
			Ok(None) => return unauthorized(&request_id, "Unknown or revoked API key."),
			Err(err) => return ApiError::from_service(err, &request_id).into_response(),
		}
	};

	req.extensions_mut().insert(ReqCtx { request_id: request_id.clone(), user_id });

	let started = Instant::now();
	let response = next.run(req).await;

	info!(
		request_id = %request_id,
		user_id = ?user_id,
		method = %method,
		path = %path,
		status = response.status().as_u16(),
		duration_ms = started.elapsed().as_millis() as u64,
		"Request finished.",
	);

	response
}

fn bearer_token(req: &Request) -> Option<String> {
	req.headers()
		.get(header::AUTHORIZATION)
		.and_then(|value| value.to_str().ok())
		.and_then(|value| value.strip_prefix("Bearer "))
		.map(str::to_string)
}

/// EventSource clients cannot set headers; the stream endpoint accepts the
/// key as a query parameter instead.
fn query_token(req: &Request) -> Option<String> {
	let query = req.uri().query()?;

	query.split('&').find_map(|pair| {
		pair.strip_prefix("apiKey=").map(str::to_string)
	})
}

fn unauthorized(request_id: &str, message: &str) -> Response {
	ApiError {
		status: StatusCode::UNAUTHORIZED,
		code: "UNAUTHORIZED",
		message: message.to_string(),
		request_id: request_id.to_string(),
		details: None,
	}
	.into_response()
}

#[derive(Debug)]
pub struct ApiError {
	status: StatusCode,
	code: &'static str,
	message: String,
	request_id: String,
	details: Option<Value>,
}

impl ApiError {
	/// Maps the service error taxonomy onto wire codes. Internal detail
	/// (SQL, prompts, stack traces) never leaks; the request id correlates
	/// logs.
	pub fn from_service(err: pm_service::Error, request_id: &str) -> Self {
		let request_id = request_id.to_string();

		match err {
			pm_service::Error::Validation { message, issues } => Self {
				status: StatusCode::UNPROCESSABLE_ENTITY,
				code: "VALIDATION_ERROR",
				message,
				request_id,
				details: (!issues.is_empty()).then(|| serde_json::json!({ "issues": issues })),
			},
			pm_service::Error::NotFound { message } => Self {
				status: StatusCode::NOT_FOUND,
				code: "NOT_FOUND",
				message,
				request_id,
				details: None,
			},
			pm_service::Error::Conflict { message } => Self {
				status: StatusCode::CONFLICT,
				code: "CONFLICT",
				message,
				request_id,
				details: None,
			},
			pm_service::Error::Unauthorized { message } => Self {
				status: StatusCode::UNAUTHORIZED,
				code: "UNAUTHORIZED",
				message,
				request_id,
				details: None,
			},
			pm_service::Error::Upstream { .. } => Self {
				status: StatusCode::BAD_GATEWAY,
				code: "UPSTREAM_ERROR",
				message: "An upstream dependency failed.".to_string(),
				request_id,
				details: None,
			},
			pm_service::Error::Storage { .. } => Self {
				status: StatusCode::INTERNAL_SERVER_ERROR,
				code: "INTERNAL_ERROR",
				message: "Something went wrong.".to_string(),
				request_id,
				details: None,
			},
		}
	}
}

#[derive(Serialize)]
struct ErrorEnvelope {
	error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
	code: &'static str,
	status: u16,
	message: String,
	#[serde(rename = "requestId")]
	request_id: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	details: Option<Value>,
}

impl IntoResponse for ApiError {
	fn into_response(self) -> Response {
		let body = ErrorEnvelope {
			error: ErrorBody {
				code: self.code,
				status: self.status.as_u16(),
				message: self.message,
				request_id: self.request_id,
				details: self.details,
			},
		};

		(self.status, Json(body)).into_response()
	}
}

fn reply<T>(ctx: &ReqCtx, result: pm_service::Result<T>) -> Result<Json<T>, ApiError> {
	result.map(Json).map_err(|err| ApiError::from_service(err, &ctx.request_id))
}

fn created<T>(ctx: &ReqCtx, result: pm_service::Result<T>) -> Result<(StatusCode, Json<T>), ApiError> {
	result
		.map(|value| (StatusCode::CREATED, Json(value)))
		.map_err(|err| ApiError::from_service(err, &ctx.request_id))
}

async fn health() -> StatusCode {
	StatusCode::OK
}

async fn capture_note(
	State(state): State<AppState>,
	ctx: ReqCtx,
	Json(mut payload): Json<CaptureRequest>,
) -> Result<Response, ApiError> {
	if payload.captured_by.is_none() {
		payload.captured_by = ctx.user_id;
	}

	let response = state
		.service
		.capture_note(payload)
		.await
		.map_err(|err| ApiError::from_service(err, &ctx.request_id))?;
	// A replayed capture is a 200 on the existing row, not a new creation.
	let status = if response.deduped { StatusCode::OK } else { StatusCode::CREATED };

	Ok((status, Json(response)).into_response())
}

async fn list_notes(
	State(state): State<AppState>,
	ctx: ReqCtx,
	Query(query): Query<ListNotesRequest>,
) -> Result<Json<pm_service::Page<pm_service::notes::NoteView>>, ApiError> {
	reply(&ctx, state.service.list_notes(query).await)
}

async fn reprocess_note(
	State(state): State<AppState>,
	ctx: ReqCtx,
	Path(id): Path<Uuid>,
) -> Result<Json<pm_service::notes::ReprocessResponse>, ApiError> {
	reply(&ctx, state.service.reprocess_note(id).await)
}

async fn create_entity(
	State(state): State<AppState>,
	ctx: ReqCtx,
	Json(payload): Json<CreateEntityRequest>,
) -> Result<(StatusCode, Json<pm_service::entities::EntityView>), ApiError> {
	created(&ctx, state.service.create_entity(payload, ctx.user_id).await)
}

async fn list_entities(
	State(state): State<AppState>,
	ctx: ReqCtx,
	Query(query): Query<ListEntitiesRequest>,
) -> Result<Json<pm_service::Page<pm_service::entities::EntityView>>, ApiError> {
	reply(&ctx, state.service.list_entities(query).await)
}

async fn get_entity(
	State(state): State<AppState>,
	ctx: ReqCtx,
	Path(id): Path<Uuid>,
) -> Result<Json<pm_service::entities::EntityView>, ApiError> {
	reply(&ctx, state.service.get_entity(id).await)
}

async fn patch_entity(
	State(state): State<AppState>,
	ctx: ReqCtx,
	Path(id): Path<Uuid>,
	Json(payload): Json<PatchEntityRequest>,
) -> Result<Json<pm_service::entities::EntityView>, ApiError> {
	reply(&ctx, state.service.patch_entity(id, payload, ctx.user_id).await)
}

#[derive(Debug, Deserialize)]
struct EventListQuery {
	order: Option<String>,
}

async fn list_entity_events(
	State(state): State<AppState>,
	ctx: ReqCtx,
	Path(id): Path<Uuid>,
	Query(query): Query<EventListQuery>,
) -> Result<Json<Vec<pm_service::entities::EntityEventView>>, ApiError> {
	let ascending = match query.order.as_deref() {
		None | Some("asc") => true,
		Some("desc") => false,
		Some(_) => {
			return Err(ApiError::from_service(
				pm_service::Error::validation("order must be asc or desc."),
				&ctx.request_id,
			));
		},
	};

	reply(&ctx, state.service.list_entity_events(id, ascending).await)
}

#[derive(Debug, Deserialize)]
struct CommentBody {
	#[serde(rename = "type")]
	event_type: String,
	body: String,
	#[serde(default)]
	meta: Option<Value>,
}

async fn add_entity_event(
	State(state): State<AppState>,
	ctx: ReqCtx,
	Path(id): Path<Uuid>,
	Json(payload): Json<CommentBody>,
) -> Result<(StatusCode, Json<pm_service::entities::EntityEventView>), ApiError> {
	if payload.event_type != "comment" {
		return Err(ApiError::from_service(
			pm_service::Error::validation("Only comment events can be posted directly."),
			&ctx.request_id,
		));
	}

	let meta = payload.meta.unwrap_or_else(|| Value::Object(Default::default()));

	created(&ctx, state.service.add_comment(id, &payload.body, meta, ctx.user_id).await)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusBody {
	new_status: String,
}

async fn set_entity_status(
	State(state): State<AppState>,
	ctx: ReqCtx,
	Path(id): Path<Uuid>,
	Json(payload): Json<StatusBody>,
) -> Result<Json<pm_service::entities::EntityView>, ApiError> {
	reply(
		&ctx,
		state.service.transition_entity_status(id, &payload.new_status, ctx.user_id).await,
	)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LineageQuery {
	direction: Option<LineageDirection>,
	max_depth: Option<i32>,
}

async fn entity_lineage(
	State(state): State<AppState>,
	ctx: ReqCtx,
	Path(id): Path<Uuid>,
	Query(query): Query<LineageQuery>,
) -> Result<Json<pm_service::lineage::LineageResponse>, ApiError> {
	let direction = query.direction.unwrap_or(LineageDirection::Both);

	reply(&ctx, state.service.lineage(id, direction, query.max_depth).await)
}

async fn set_entity_tags(
	State(state): State<AppState>,
	ctx: ReqCtx,
	Path(id): Path<Uuid>,
	Json(payload): Json<SetEntityTagsRequest>,
) -> Result<Json<Vec<pm_service::tags::TagView>>, ApiError> {
	reply(&ctx, state.service.set_entity_tags(id, payload).await)
}

async fn create_project(
	State(state): State<AppState>,
	ctx: ReqCtx,
	Json(payload): Json<CreateProjectRequest>,
) -> Result<(StatusCode, Json<pm_service::projects::ProjectView>), ApiError> {
	created(&ctx, state.service.create_project(payload).await)
}

async fn list_projects(
	State(state): State<AppState>,
	ctx: ReqCtx,
	Query(query): Query<ListProjectsRequest>,
) -> Result<Json<pm_service::Page<pm_service::projects::ProjectView>>, ApiError> {
	reply(&ctx, state.service.list_projects(query).await)
}

async fn patch_project(
	State(state): State<AppState>,
	ctx: ReqCtx,
	Path(id): Path<Uuid>,
	Json(payload): Json<PatchProjectRequest>,
) -> Result<Json<pm_service::projects::ProjectView>, ApiError> {
	reply(&ctx, state.service.patch_project(id, payload).await)
}

async fn delete_project(
	State(state): State<AppState>,
	ctx: ReqCtx,
	Path(id): Path<Uuid>,
) -> Result<Json<pm_service::projects::ProjectView>, ApiError> {
	reply(&ctx, state.service.delete_project(id).await)
}

async fn project_dashboard(
	State(state): State<AppState>,
	ctx: ReqCtx,
	Path(id): Path<Uuid>,
) -> Result<Json<pm_service::projects::ProjectDashboard>, ApiError> {
	reply(&ctx, state.service.project_dashboard(id).await)
}

async fn create_epic(
	State(state): State<AppState>,
	ctx: ReqCtx,
	Json(payload): Json<CreateEpicRequest>,
) -> Result<(StatusCode, Json<pm_service::epics::EpicView>), ApiError> {
	created(&ctx, state.service.create_epic(payload).await)
}

async fn list_epics(
	State(state): State<AppState>,
	ctx: ReqCtx,
	Query(query): Query<ListEpicsRequest>,
) -> Result<Json<pm_service::Page<pm_service::epics::EpicView>>, ApiError> {
	reply(&ctx, state.service.list_epics(query).await)
}

async fn patch_epic(
	State(state): State<AppState>,
	ctx: ReqCtx,
	Path(id): Path<Uuid>,
	Json(payload): Json<PatchEpicRequest>,
) -> Result<Json<pm_service::epics::EpicView>, ApiError> {
	reply(&ctx, state.service.patch_epic(id, payload).await)
}

async fn delete_epic(
	State(state): State<AppState>,
	ctx: ReqCtx,
	Path(id): Path<Uuid>,
) -> Result<Json<pm_service::epics::EpicView>, ApiError> {
	reply(&ctx, state.service.delete_epic(id).await)
}

async fn create_tag(
	State(state): State<AppState>,
	ctx: ReqCtx,
	Json(payload): Json<CreateTagRequest>,
) -> Result<(StatusCode, Json<pm_service::tags::TagView>), ApiError> {
	created(&ctx, state.service.create_tag(payload).await)
}

#[derive(Debug, Deserialize)]
struct TagListQuery {
	q: Option<String>,
}

async fn list_tags(
	State(state): State<AppState>,
	ctx: ReqCtx,
	Query(query): Query<TagListQuery>,
) -> Result<Json<Vec<pm_service::tags::TagView>>, ApiError> {
	reply(&ctx, state.service.list_tags(query.q.as_deref()).await)
}

async fn list_reviews(
	State(state): State<AppState>,
	ctx: ReqCtx,
	Query(query): Query<ListReviewsRequest>,
) -> Result<Json<pm_service::Page<pm_service::review::ReviewView>>, ApiError> {
	reply(&ctx, state.service.list_reviews(query).await)
}

#[derive(Serialize)]
struct CountResponse {
	count: i64,
}

async fn count_reviews(
	State(state): State<AppState>,
	ctx: ReqCtx,
	Query(query): Query<ListReviewsRequest>,
) -> Result<Json<CountResponse>, ApiError> {
	let count = state
		.service
		.count_reviews(query)
		.await
		.map_err(|err| ApiError::from_service(err, &ctx.request_id))?;

	Ok(Json(CountResponse { count }))
}

async fn resolve_review(
	State(state): State<AppState>,
	ctx: ReqCtx,
	Path(id): Path<Uuid>,
	Json(payload): Json<ResolveRequest>,
) -> Result<Json<pm_service::review::ReviewView>, ApiError> {
	reply(&ctx, state.service.resolve_review(id, payload, ctx.user_id).await)
}

async fn resolve_batch(
	State(state): State<AppState>,
	ctx: ReqCtx,
	Json(payload): Json<BatchResolveRequest>,
) -> Result<Json<Vec<pm_service::review::BatchOutcome>>, ApiError> {
	reply(&ctx, state.service.resolve_batch(payload, ctx.user_id).await)
}

async fn create_user(
	State(state): State<AppState>,
	ctx: ReqCtx,
	Json(payload): Json<CreateUserRequest>,
) -> Result<(StatusCode, Json<pm_service::users::UserView>), ApiError> {
	created(&ctx, state.service.create_user(payload).await)
}

async fn list_users(
	State(state): State<AppState>,
	ctx: ReqCtx,
) -> Result<Json<Vec<pm_service::users::UserView>>, ApiError> {
	reply(&ctx, state.service.list_users().await)
}

async fn create_api_key(
	State(state): State<AppState>,
	ctx: ReqCtx,
	Json(payload): Json<CreateApiKeyRequest>,
) -> Result<(StatusCode, Json<pm_service::users::ApiKeyCreated>), ApiError> {
	created(&ctx, state.service.create_api_key(payload).await)
}

async fn revoke_api_key(
	State(state): State<AppState>,
	ctx: ReqCtx,
	Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
	state
		.service
		.revoke_api_key(id)
		.await
		.map_err(|err| ApiError::from_service(err, &ctx.request_id))?;

	Ok(StatusCode::NO_CONTENT)
}
