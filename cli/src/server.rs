use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Path, Query, Request, State},
    http::{HeaderValue, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info, warn};

use platescan_core::models::{DiaryDay, NutritionReference, ResolvedFoodItem, ServingHints};
use platescan_core::scan::{ScanError, ScanOutcome, ScanRequest, infer_raw};
use platescan_core::service::PlatescanService;
use platescan_core::vision::{ImageInput, VisionError};

use crate::vision_client::{MAX_IMAGE_BYTES, VisionClient};

// Base64 inflates by a third; leave room for the JSON around it.
const BODY_LIMIT: usize = MAX_IMAGE_BYTES / 3 * 4 + 64 * 1024;

#[derive(Clone)]
struct AppState {
    service: Arc<Mutex<PlatescanService>>,
    vision: Arc<VisionClient>,
    api_key: Option<String>,
    user_id: String,
    default_locale: String,
}

impl AppState {
    fn service(&self) -> MutexGuard<'_, PlatescanService> {
        self.service.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// --- Request / Response types ---

#[derive(Deserialize)]
struct ScanBody {
    image_base64: Option<String>,
    image_url: Option<String>,
    locale: Option<String>,
    #[serde(default)]
    serving_hints: ServingHints,
    meal_type: Option<String>,
    #[serde(default)]
    auto_log: bool,
}

#[derive(Deserialize)]
struct SearchQuery {
    q: String,
    locale: Option<String>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

// --- Error handling ---

enum ApiError {
    NotFound(String),
    BadRequest(String),
    BadGateway(String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
            Self::Internal(err) => {
                error!("internal server error: {err:#}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

impl From<VisionError> for ApiError {
    fn from(err: VisionError) -> Self {
        match err {
            VisionError::Service { status, body } => {
                warn!(status, "vision service error: {body}");
                Self::BadGateway(format!("Vision service returned status {status}"))
            }
            VisionError::InvalidImage(msg) => Self::BadRequest(format!("Invalid image: {msg}")),
            other => Self::Internal(other.into()),
        }
    }
}

impl From<ScanError> for ApiError {
    fn from(err: ScanError) -> Self {
        match err {
            ScanError::Vision(e) => e.into(),
            ScanError::InvalidMealType(msg) => Self::BadRequest(msg),
        }
    }
}

// --- Middleware ---

async fn require_auth(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if let Some(ref expected_key) = state.api_key {
        let authorized = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .is_some_and(|token| token == expected_key);

        if !authorized {
            return (
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse {
                    error: "Invalid or missing API key".to_string(),
                }),
            )
                .into_response();
        }
    }
    next.run(request).await
}

async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        "x-content-type-options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "content-security-policy",
        HeaderValue::from_static("default-src 'none'"),
    );
    response
}

// --- Handlers ---

fn decode_image(body: &ScanBody) -> Result<ImageInput, ApiError> {
    match (&body.image_base64, &body.image_url) {
        (Some(encoded), None) => {
            // Accept data URLs as well as bare base64.
            let payload = encoded
                .split_once(";base64,")
                .map_or(encoded.as_str(), |(_, data)| data);
            let bytes = STANDARD
                .decode(payload.trim())
                .map_err(|e| ApiError::BadRequest(format!("image_base64 is not valid base64: {e}")))?;
            if bytes.is_empty() {
                return Err(ApiError::BadRequest("image_base64 is empty".to_string()));
            }
            Ok(ImageInput::Bytes(bytes))
        }
        (None, Some(url)) if url.starts_with("http://") || url.starts_with("https://") => {
            Ok(ImageInput::Url(url.clone()))
        }
        (None, Some(url)) => Err(ApiError::BadRequest(format!(
            "image_url must be an http(s) URL, got '{url}'"
        ))),
        (Some(_), Some(_)) => Err(ApiError::BadRequest(
            "Provide either image_base64 or image_url, not both".to_string(),
        )),
        (None, None) => Err(ApiError::BadRequest(
            "Missing image: provide image_base64 or image_url".to_string(),
        )),
    }
}

// Vision inference runs without the database lock held.
async fn scan_image(
    State(state): State<AppState>,
    Json(body): Json<ScanBody>,
) -> Result<Json<Vec<ResolvedFoodItem>>, ApiError> {
    let image = decode_image(&body)?;
    let locale = body.locale.as_deref().unwrap_or(&state.default_locale);
    let raw = infer_raw(state.vision.as_ref(), &image, locale).await?;
    let items = state.service().resolve_raw(&raw, locale, &body.serving_hints);
    Ok(Json(items))
}

async fn scan_and_log(
    State(state): State<AppState>,
    Json(body): Json<ScanBody>,
) -> Result<Json<ScanOutcome>, ApiError> {
    let image = decode_image(&body)?;
    let request = ScanRequest {
        image,
        locale: body.locale.unwrap_or_else(|| state.default_locale.clone()),
        meal_type: body.meal_type,
        auto_log: body.auto_log,
        user_id: state.user_id.clone(),
        hints: body.serving_hints,
    };
    request.meal_to_log()?;

    let raw = infer_raw(state.vision.as_ref(), &request.image, &request.locale).await?;
    let outcome = state.service().complete_scan(&raw, &request)?;
    Ok(Json(outcome))
}

async fn search_foods(
    State(state): State<AppState>,
    Query(params): Query<SearchQuery>,
) -> Result<Json<Vec<NutritionReference>>, ApiError> {
    if params.q.trim().is_empty() {
        return Err(ApiError::BadRequest("Query 'q' must not be empty".to_string()));
    }
    let locale = params.locale.as_deref().unwrap_or(&state.default_locale);
    let found = state.service().search_references(&params.q, locale);
    Ok(Json(found))
}

async fn get_diary_day(
    State(state): State<AppState>,
    Path(date_str): Path<String>,
) -> Result<Json<DiaryDay>, ApiError> {
    NaiveDate::parse_from_str(&date_str, "%Y-%m-%d")
        .map_err(|_| ApiError::BadRequest(format!("Invalid date '{date_str}'. Use YYYY-MM-DD")))?;
    let day = state.service().diary_day(&state.user_id, &date_str)?;
    Ok(Json(day))
}

async fn delete_diary_entry(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.service().delete_diary_entry(&id)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("Diary entry {id} not found")))
    }
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/scan", post(scan_image))
        .route("/api/scan/log", post(scan_and_log))
        .route("/api/foods/search", get(search_foods))
        .route("/api/diary/{date}", get(get_diary_day))
        .route("/api/diary/entries/{id}", delete(delete_diary_entry))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT))
        .layer(middleware::from_fn(security_headers))
        .with_state(state)
}

// --- Server startup ---

pub struct ServerOptions {
    pub port: u16,
    pub bind: String,
    pub api_key: Option<String>,
    pub user_id: String,
    pub default_locale: String,
}

pub async fn start_server(
    service: PlatescanService,
    vision: VisionClient,
    opts: ServerOptions,
) -> anyhow::Result<()> {
    if vision.is_stub() {
        eprintln!("Warning: no vision API key configured, scans return a fixed sample response.");
    }

    let ServerOptions {
        port,
        bind,
        api_key,
        user_id,
        default_locale,
    } = opts;

    match api_key {
        Some(ref key) => eprintln!(
            "API key: {}... (see api_key file in data directory)",
            key.chars().take(4).collect::<String>(),
        ),
        None => {
            eprintln!("Warning: Authentication disabled (--no-auth). API is open to anyone.");
            if bind != "127.0.0.1" && bind != "localhost" {
                eprintln!(
                    "Warning: Listening on {bind} with no authentication. Any device on your network can access this API."
                );
            }
        }
    }

    let state = AppState {
        service: Arc::new(Mutex::new(service)),
        vision: Arc::new(vision),
        api_key,
        user_id,
        default_locale,
    };
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(format!("{bind}:{port}")).await?;
    info!("listening on http://{bind}:{port}");
    eprintln!("Listening on http://{bind}:{port}");
    axum::serve(listener, app).await?;

    Ok(())
}
