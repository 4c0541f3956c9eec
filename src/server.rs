use crate::assistant::{Assistant, AssistantError};
use crate::config::AppConfig;
use crate::export::{self, ExportFormat};
use crate::filter::{DemographicFilter, GeographicFilter};
use crate::normalize::Normalizer;
use crate::render::{self, ChartKind, ChartOptions};
use crate::session::{
    self, Access, IdentityProvider, LocalIdentityProvider, Page, RolePolicy, Session, UserProfile,
};
use crate::state::{DashboardState, DashboardView};
use crate::storage::{self, DatasetCatalog, DatasetEntry, LocalBlobStore};
use crate::types::CensusRecord;
use anyhow::Result;
use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

const SESSION_TTL_HOURS: i64 = 24;
const ACTIVITY_LOG_CAPACITY: usize = 100;
const UPLOAD_LIMIT_BYTES: usize = 50 * 1024 * 1024;

#[derive(Debug)]
pub enum ApiError {
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    BadRequest(String),
    Internal(String),
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiError::Unauthorized(msg)
            | ApiError::Forbidden(msg)
            | ApiError::NotFound(msg)
            | ApiError::BadRequest(msg)
            | ApiError::Internal(msg) => write!(f, "{}", msg),
        }
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn login_required() -> Self {
        ApiError::Unauthorized("Debes iniciar sesión para acceder.".to_string())
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        error!(error = %format!("{:#}", err), "request failed");
        ApiError::Internal(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct Body {
            error: String,
        }
        (self.status(), Json(Body { error: self.to_string() })).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

fn lock<T>(mutex: &Mutex<T>) -> ApiResult<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| ApiError::Internal("server state lock poisoned".to_string()))
}

#[derive(Debug, Clone, Serialize)]
pub struct ActivityEntry {
    pub at: DateTime<Utc>,
    pub message: String,
}

/// Bounded administrator log, newest first.
#[derive(Default)]
pub struct ActivityLog {
    entries: Mutex<VecDeque<ActivityEntry>>,
}

impl ActivityLog {
    pub fn record(&self, message: impl Into<String>) {
        let entry = ActivityEntry { at: Utc::now(), message: message.into() };
        info!(activity = %entry.message);
        if let Ok(mut entries) = self.entries.lock() {
            entries.push_front(entry);
            entries.truncate(ACTIVITY_LOG_CAPACITY);
        }
    }

    pub fn entries(&self) -> Vec<ActivityEntry> {
        self.entries
            .lock()
            .map(|e| e.iter().cloned().collect())
            .unwrap_or_default()
    }
}

struct LoadedDataset {
    entry: Option<DatasetEntry>,
    records: Arc<[CensusRecord]>,
}

struct ActiveSession {
    session: Session,
    issued_at: DateTime<Utc>,
    dashboard: DashboardState,
}

impl ActiveSession {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now - self.issued_at > Duration::hours(SESSION_TTL_HOURS)
    }
}

pub struct AppState {
    pub config: AppConfig,
    store: LocalBlobStore,
    catalog: DatasetCatalog,
    identity: Box<dyn IdentityProvider>,
    normalizer: Normalizer,
    assistant: Option<Assistant>,
    dataset: RwLock<LoadedDataset>,
    sessions: Mutex<HashMap<String, ActiveSession>>,
    pub activity: ActivityLog,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        let store = LocalBlobStore::new(&config.storage.root);
        let catalog = DatasetCatalog::in_store(&store);
        let policy = RolePolicy::new(&config.auth.admin_emails);
        let identity = Box::new(LocalIdentityProvider::new(&config.storage.users_file, policy));
        let assistant = match Assistant::from_config(&config.assistant) {
            Ok(a) => Some(a),
            Err(e) => {
                warn!(error = %e, "assistant disabled");
                None
            }
        };
        Self::with_parts(config, store, catalog, identity, assistant)
    }

    pub fn with_parts(
        config: AppConfig,
        store: LocalBlobStore,
        catalog: DatasetCatalog,
        identity: Box<dyn IdentityProvider>,
        assistant: Option<Assistant>,
    ) -> Self {
        let normalizer = Normalizer::new(config.columns.clone());
        Self {
            config,
            store,
            catalog,
            identity,
            normalizer,
            assistant,
            dataset: RwLock::new(LoadedDataset { entry: None, records: Arc::from(Vec::new()) }),
            sessions: Mutex::new(HashMap::new()),
            activity: ActivityLog::default(),
        }
    }

    /// Replace the shared dataset with the most recent catalog entry.
    pub async fn reload_dataset(&self) -> Result<Option<DatasetEntry>> {
        let Some((entry, records)) =
            storage::load_latest(&self.store, &self.catalog, &self.normalizer).await?
        else {
            return Ok(None);
        };
        let mut dataset = self
            .dataset
            .write()
            .map_err(|_| anyhow::anyhow!("dataset lock poisoned"))?;
        dataset.entry = Some(entry.clone());
        dataset.records = Arc::from(records);
        Ok(Some(entry))
    }

    fn current(&self) -> ApiResult<(Option<DatasetEntry>, Arc<[CensusRecord]>)> {
        let dataset = self
            .dataset
            .read()
            .map_err(|_| ApiError::Internal("dataset lock poisoned".to_string()))?;
        Ok((dataset.entry.clone(), dataset.records.clone()))
    }

    fn open_session(&self, session: Session) -> ApiResult<String> {
        let (_, records) = self.current()?;
        let dashboard = DashboardState::new(
            records,
            self.config.dashboard.rows_per_page,
            self.config.dashboard.filter_mode,
        );
        let token = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let mut sessions = lock(&self.sessions)?;
        sessions.retain(|_, active| !active.is_expired(now));
        sessions.insert(token.clone(), ActiveSession { session, issued_at: now, dashboard });
        Ok(token)
    }

    /// Run `f` on the caller's session, bringing its dashboard up to the
    /// current dataset first.
    fn with_session<T>(
        &self,
        headers: &HeaderMap,
        f: impl FnOnce(&mut ActiveSession) -> T,
    ) -> ApiResult<T> {
        let token = bearer(headers).ok_or_else(ApiError::login_required)?;
        let (_, records) = self.current()?;
        let mut sessions = lock(&self.sessions)?;

        let expired = match sessions.get(token) {
            None => return Err(ApiError::login_required()),
            Some(active) => active.is_expired(Utc::now()),
        };
        if expired {
            sessions.remove(token);
            return Err(ApiError::login_required());
        }

        let active = sessions.get_mut(token).ok_or_else(ApiError::login_required)?;
        if !Arc::ptr_eq(active.dashboard.dataset(), &records) {
            active.dashboard.reload(records);
        }
        Ok(f(active))
    }

    fn session(&self, headers: &HeaderMap) -> ApiResult<Session> {
        self.with_session(headers, |a| a.session.clone())
    }

    fn admin(&self, headers: &HeaderMap) -> ApiResult<Session> {
        let session = self.session(headers)?;
        if !session.is_admin() {
            return Err(ApiError::Forbidden(
                "Acceso denegado. Solo el administrador puede acceder.".to_string(),
            ));
        }
        Ok(session)
    }

    fn dashboard_view(&self, headers: &HeaderMap, f: impl FnOnce(&mut DashboardState)) -> ApiResult<DashboardResponse> {
        let (dataset, _) = self.current()?;
        let view = self.with_session(headers, |a| {
            f(&mut a.dashboard);
            a.dashboard.view()
        })?;
        Ok(DashboardResponse { dataset, view })
    }
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

#[derive(Deserialize)]
struct RegisterRequest {
    #[serde(default)]
    name: String,
    email: String,
    password: String,
}

#[derive(Deserialize)]
struct LoginRequest {
    email: String,
    password: String,
}

#[derive(Serialize)]
struct LoginResponse {
    token: String,
    session: Session,
    landing: Page,
}

#[derive(Serialize)]
struct DashboardResponse {
    dataset: Option<DatasetEntry>,
    #[serde(flatten)]
    view: DashboardView,
}

#[derive(Deserialize)]
struct AskRequest {
    #[serde(default)]
    query: String,
}

#[derive(Serialize)]
struct AskResponse {
    reply: String,
}

#[derive(Deserialize)]
struct ExportParams {
    chart: Option<ChartKind>,
}

#[derive(Deserialize)]
struct UploadParams {
    name: String,
}

pub fn router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/api/register", post(register_handler))
        .route("/api/login", post(login_handler))
        .route("/api/logout", post(logout_handler))
        .route("/api/gate/:page", get(gate_handler))
        .route("/api/dashboard", get(dashboard_handler))
        .route("/api/filter/geographic", post(geographic_handler))
        .route("/api/filter/demographic", post(demographic_handler))
        .route("/api/filter/clear", post(clear_handler))
        .route("/api/page/next", post(next_page_handler))
        .route("/api/page/prev", post(prev_page_handler))
        .route("/api/charts/:kind", get(chart_handler))
        .route("/api/export/:format", get(export_handler))
        .route("/api/assistant", post(assistant_handler))
        .route("/api/admin/users", get(users_handler))
        .route("/api/admin/datasets", get(datasets_handler))
        .route("/api/admin/logs", get(logs_handler))
        .route(
            "/api/admin/upload",
            post(upload_handler).layer(DefaultBodyLimit::max(UPLOAD_LIMIT_BYTES)),
        )
        .route("/api/reload", post(reload_handler));

    let app = match &state.config.server.static_dir {
        Some(dir) => api.fallback_service(ServeDir::new(dir)),
        None => api,
    };

    app.layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn start_server(config: AppConfig) -> Result<()> {
    let state = Arc::new(AppState::new(config));

    match state.reload_dataset().await {
        Ok(Some(entry)) => info!(title = %entry.title, "serving dataset"),
        Ok(None) => warn!("starting without a dataset; upload one from the admin page"),
        Err(e) => error!(error = %format!("{:#}", e), "failed to load dataset"),
    }

    let addr = SocketAddr::from(([127, 0, 0, 1], state.config.server.port));
    info!("Starting server on http://{}", addr);

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn register_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<Json<LoginResponse>> {
    let idp = state.clone();
    let session = tokio::task::spawn_blocking(move || idp.identity.sign_up(&req.name, &req.email, &req.password))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    issue(&state, session)
}

async fn login_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> ApiResult<Json<LoginResponse>> {
    let idp = state.clone();
    let session = tokio::task::spawn_blocking(move || idp.identity.sign_in(&req.email, &req.password))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .map_err(|e| ApiError::Unauthorized(e.to_string()))?;
    issue(&state, session)
}

fn issue(state: &AppState, session: Session) -> ApiResult<Json<LoginResponse>> {
    let landing = session::landing_page(&session);
    let token = state.open_session(session.clone())?;
    info!(email = %session.claims.email, role = ?session.role, "signed in");
    Ok(Json(LoginResponse { token, session, landing }))
}

async fn logout_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult<StatusCode> {
    if let Some(token) = bearer(&headers) {
        lock(&state.sessions)?.remove(token);
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn gate_handler(
    State(state): State<Arc<AppState>>,
    Path(page): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<Access>> {
    let page: Page = page.parse().map_err(|e: anyhow::Error| ApiError::NotFound(e.to_string()))?;
    let session = match state.session(&headers) {
        Ok(s) => Some(s),
        Err(ApiError::Unauthorized(_)) => None,
        Err(e) => return Err(e),
    };
    Ok(Json(session::gate(page, session.as_ref())))
}

async fn dashboard_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<DashboardResponse>> {
    Ok(Json(state.dashboard_view(&headers, |_| {})?))
}

async fn geographic_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(filter): Json<GeographicFilter>,
) -> ApiResult<Json<DashboardResponse>> {
    Ok(Json(state.dashboard_view(&headers, |d| d.apply_geographic(filter))?))
}

async fn demographic_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(filter): Json<DemographicFilter>,
) -> ApiResult<Json<DashboardResponse>> {
    Ok(Json(state.dashboard_view(&headers, |d| d.apply_demographic(filter))?))
}

async fn clear_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<DashboardResponse>> {
    Ok(Json(state.dashboard_view(&headers, DashboardState::reset)?))
}

async fn next_page_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<DashboardResponse>> {
    Ok(Json(state.dashboard_view(&headers, |d| {
        d.next_page();
    })?))
}

async fn prev_page_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<DashboardResponse>> {
    Ok(Json(state.dashboard_view(&headers, |d| {
        d.prev_page();
    })?))
}

async fn chart_handler(
    State(state): State<Arc<AppState>>,
    Path(kind): Path<ChartKind>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let charts = state.with_session(&headers, |a| a.dashboard.charts())?;
    let png = tokio::task::spawn_blocking(move || render::render_png(kind, &charts, ChartOptions::default()))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))??;
    Ok(([(header::CONTENT_TYPE, "image/png")], png).into_response())
}

async fn export_handler(
    State(state): State<Arc<AppState>>,
    Path(format): Path<String>,
    Query(params): Query<ExportParams>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let format: ExportFormat = format
        .parse()
        .map_err(|e: anyhow::Error| ApiError::NotFound(e.to_string()))?;

    let bytes = match format {
        ExportFormat::Csv | ExportFormat::Xlsx => {
            let rows: Vec<CensusRecord> =
                state.with_session(&headers, |a| a.dashboard.active().into_iter().cloned().collect())?;
            if format == ExportFormat::Csv {
                export::to_csv(&rows)?
            } else {
                export::to_xlsx(&rows)?
            }
        }
        ExportFormat::Png => {
            let charts = state.with_session(&headers, |a| a.dashboard.charts())?;
            let kind = params.chart.unwrap_or(ChartKind::Pyramid);
            tokio::task::spawn_blocking(move || export::to_png(kind, &charts, ChartOptions::default()))
                .await
                .map_err(|e| ApiError::Internal(e.to_string()))??
        }
        ExportFormat::Pdf => {
            let charts = state.with_session(&headers, |a| a.dashboard.charts())?;
            let kinds = match params.chart {
                Some(kind) => vec![kind],
                None => ChartKind::ALL.to_vec(),
            };
            tokio::task::spawn_blocking(move || export::to_pdf(&charts, &kinds, ChartOptions::default()))
                .await
                .map_err(|e| ApiError::Internal(e.to_string()))??
        }
    };

    let disposition = format!("attachment; filename=\"{}\"", format.default_file_name());
    Ok((
        [
            (header::CONTENT_TYPE, format.content_type().to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    )
        .into_response())
}

async fn assistant_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<AskRequest>,
) -> ApiResult<Json<AskResponse>> {
    state.session(&headers)?;
    let assistant = state.assistant.as_ref().ok_or_else(|| {
        ApiError::Internal(AssistantError::Config(String::new()).user_message().to_string())
    })?;
    match assistant.ask(&req.query).await {
        Ok(reply) => Ok(Json(AskResponse { reply })),
        Err(AssistantError::EmptyQuery) => {
            Err(ApiError::BadRequest(AssistantError::EmptyQuery.user_message().to_string()))
        }
        Err(e) => {
            error!(error = %e, "assistant failed");
            Err(ApiError::Internal(e.user_message().to_string()))
        }
    }
}

async fn users_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<UserProfile>>> {
    state.admin(&headers)?;
    let idp = state.clone();
    let users = tokio::task::spawn_blocking(move || idp.identity.list_users())
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))??;
    state.activity.record(format!("Usuarios listados: {}", users.len()));
    Ok(Json(users))
}

async fn datasets_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<DatasetEntry>>> {
    state.admin(&headers)?;
    let catalog = state.clone();
    let entries = tokio::task::spawn_blocking(move || catalog.catalog.list())
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))??;
    Ok(Json(entries))
}

async fn logs_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<ActivityEntry>>> {
    state.admin(&headers)?;
    Ok(Json(state.activity.entries()))
}

async fn upload_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<UploadParams>,
    body: Bytes,
) -> ApiResult<Json<DatasetEntry>> {
    let admin = state.admin(&headers)?;
    if body.is_empty() {
        return Err(ApiError::BadRequest("Selecciona un archivo primero.".to_string()));
    }

    let uploader = state.clone();
    let name = params.name.clone();
    let uploaded = tokio::task::spawn_blocking(move || {
        storage::upload_dataset(&uploader.store, &uploader.catalog, &name, &body, &admin.claims.email)
    })
    .await
    .map_err(|e| ApiError::Internal(e.to_string()))?;

    let entry = match uploaded {
        Ok(entry) => entry,
        Err(e) => {
            state.activity.record(format!("Error al subir {}: {:#}", params.name, e));
            return Err(ApiError::BadRequest(format!("{:#}", e)));
        }
    };
    state.activity.record(format!("Archivo subido: {}", entry.title));

    if let Err(e) = state.reload_dataset().await {
        error!(error = %format!("{:#}", e), "reload after upload failed");
    }
    Ok(Json(entry))
}

async fn reload_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<Option<DatasetEntry>>> {
    state.admin(&headers)?;
    let entry = state.reload_dataset().await?;
    state.activity.record(match &entry {
        Some(e) => format!("Dataset recargado: {}", e.title),
        None => "No hay datasets registrados".to_string(),
    });
    Ok(Json(entry))
}
