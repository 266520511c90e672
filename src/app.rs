use crate::alerts::AlertPublisher;
use crate::audit::AuditStore;
use crate::auth::AuthState;
use crate::budget::BudgetStore;
use crate::config::Config;
use crate::db::Db;
use crate::error::{AppError, AppResult};
use crate::keys::ApiKeyStore;
use crate::users::UserProfileStore;
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::{Arc, Once, OnceLock};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static METRICS_ERROR: OnceLock<AppError> = OnceLock::new();
static METRICS_INIT: Once = Once::new();

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db: Db,
    pub http: reqwest::Client,
    pub auth: AuthState,
    pub keys: ApiKeyStore,
    pub budgets: BudgetStore,
    pub audits: AuditStore,
    pub profiles: UserProfileStore,
    pub alerts: AlertPublisher,
    pub metrics: PrometheusHandle,
    pub started_at: std::time::Instant,
}

pub async fn load_state() -> AppResult<AppState> {
    load_state_with_config(Config::from_env()?).await
}

pub async fn load_state_with_config(config: Config) -> AppResult<AppState> {
    let http = reqwest::Client::builder()
        .user_agent(concat!("dynamo-gate/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|err| {
            AppError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "http_client_init_failed",
                err.to_string(),
            )
        })?;

    let db = Db::connect(config.database_url.as_deref())
        .await
        .map_err(|err| {
            AppError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "database_init_failed",
                err,
            )
        })?;

    let metrics = init_metrics()?;
    let auth = AuthState::new(&config);
    let alerts = AlertPublisher::new(http.clone(), config.alert_topic_url.clone());

    Ok(AppState {
        config: Arc::new(config),
        keys: ApiKeyStore::new(db.clone()),
        budgets: BudgetStore::new(db.clone()),
        audits: AuditStore::new(db.clone()),
        profiles: UserProfileStore::new(db.clone()),
        db,
        http,
        auth,
        alerts,
        metrics,
        started_at: std::time::Instant::now(),
    })
}

// The recorder is process-global; installing twice (tests build several
// states) must hand back the first handle instead of erroring.
fn init_metrics() -> AppResult<PrometheusHandle> {
    METRICS_INIT.call_once(|| {
        match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                let _ = METRICS_HANDLE.set(handle);
            }
            Err(err) => {
                let _ = METRICS_ERROR.set(AppError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "metrics_init_failed",
                    err.to_string(),
                ));
            }
        }
    });
    if let Some(handle) = METRICS_HANDLE.get() {
        return Ok(handle.clone());
    }
    Err(METRICS_ERROR.get().cloned().unwrap_or_else(|| {
        AppError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "metrics_init_failed",
            "metrics recorder not available",
        )
    }))
}

pub fn build_app(state: AppState) -> Router {
    let cors = if state.config.cors_origin == "*" {
        CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any)
    } else {
        match state.config.cors_origin.parse() {
            Ok(origin) => CorsLayer::new()
                .allow_origin(AllowOrigin::exact(origin))
                .allow_methods(Any)
                .allow_headers(Any),
            Err(_) => CorsLayer::new(),
        }
    };

    Router::new()
        .route("/v1/chat/completions", post(crate::handlers::chat_completions))
        .route("/v1/messages", post(crate::handlers::messages))
        .route("/v1/models", get(crate::handlers::list_models))
        .route(
            "/v1/budget/admin/summary",
            get(crate::handlers::admin_budget_summary),
        )
        .route("/v1/budget/{user_id}", get(crate::handlers::get_budget))
        .route("/v1/admin/api-keys", post(crate::handlers::create_api_key))
        .route("/v1/admin/api-keys", get(crate::handlers::list_api_keys))
        .route(
            "/v1/admin/api-keys/{id}",
            delete(crate::handlers::revoke_api_key),
        )
        .route(
            "/v1/admin/api-keys/{id}/rotate",
            post(crate::handlers::rotate_api_key),
        )
        .route("/health", get(crate::handlers::health))
        .route("/metrics", get(crate::handlers::metrics))
        .with_state(state)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}
