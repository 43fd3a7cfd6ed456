use axum::{
    Router,
    http::HeaderValue,
    middleware,
    routing::{MethodRouter, delete, get, patch, post},
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::state::SharedState;

mod api_keys;
mod audit_logs;
pub mod auth;
mod backups;
mod config_transfer;
mod error;
pub mod events;
mod ldap_servers;
mod observability;
mod restores;
mod schedules;
mod settings;
mod system;
mod types;
mod validation;

pub use auth::AuthContext;
pub use error::ApiError;
pub use types::*;

use tokio::sync::RwLock;

use crate::domain::events::JobEvent;
use crate::services::AuthService;
use metrics_exporter_prometheus::PrometheusHandle;

#[derive(Clone)]
pub struct AppState {
    pub shared: Arc<SharedState>,

    pub start_time: std::time::Instant,

    pub prometheus_handle: Option<PrometheusHandle>,
}

impl AppState {
    #[must_use]
    pub fn config(&self) -> &Arc<RwLock<Config>> {
        &self.shared.config
    }

    #[must_use]
    pub fn store(&self) -> &crate::db::Store {
        &self.shared.store
    }

    #[must_use]
    pub fn event_bus(&self) -> &tokio::sync::broadcast::Sender<JobEvent> {
        &self.shared.event_bus
    }

    #[must_use]
    pub fn auth(&self) -> &Arc<dyn AuthService> {
        &self.shared.auth_service
    }
}

#[must_use]
pub fn create_app_state(
    shared: Arc<SharedState>,
    prometheus_handle: Option<PrometheusHandle>,
) -> Arc<AppState> {
    Arc::new(AppState {
        shared,
        start_time: std::time::Instant::now(),
        prometheus_handle,
    })
}

pub async fn create_app_state_from_config(
    config: Config,
    prometheus_handle: Option<PrometheusHandle>,
) -> anyhow::Result<Arc<AppState>> {
    let shared = Arc::new(SharedState::new(config).await?);
    Ok(create_app_state(shared, prometheus_handle))
}

pub async fn router(state: Arc<AppState>) -> Router {
    let cors_origins = state.config().read().await.server.cors_allowed_origins.clone();

    let protected_routes = create_protected_router(state.clone());

    let api_router = Router::new()
        .merge(protected_routes)
        .route("/auth/login", post(auth::login))
        .route("/health", get(system::health))
        .with_state(state);

    let cors_layer = if cors_origins.contains(&"*".to_string()) {
        CorsLayer::new().allow_origin(Any)
    } else {
        let origins: Vec<HeaderValue> =
            cors_origins.iter().filter_map(|s| s.parse().ok()).collect();
        CorsLayer::new().allow_origin(origins)
    };

    Router::new()
        .nest("/api", api_router)
        .layer(cors_layer.allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(observability::security_headers_middleware))
        .layer(middleware::from_fn(observability::logging_middleware))
}

/// Registers a collection route both with and without the trailing slash.
fn collection(
    router: Router<Arc<AppState>>,
    path: &str,
    methods: MethodRouter<Arc<AppState>>,
) -> Router<Arc<AppState>> {
    router
        .route(path, methods.clone())
        .route(&format!("{path}/"), methods)
}

fn create_protected_router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    let mut router = Router::new()
        .route("/auth/me", get(auth::me))
        .route("/auth/change-password", post(auth::change_password))
        .route(
            "/auth/users/{id}",
            get(auth::get_user)
                .put(auth::update_user)
                .delete(auth::delete_user),
        )
        .route(
            "/auth/users/{id}/reset-password",
            post(auth::reset_password),
        )
        .route("/ldap-servers/test", post(ldap_servers::test_connection))
        .route(
            "/ldap-servers/{id}",
            get(ldap_servers::get_server)
                .put(ldap_servers::update_server)
                .delete(ldap_servers::delete_server),
        )
        .route("/ldap-servers/{id}/test", post(ldap_servers::test_stored_server))
        .route("/backups/batch-delete", post(backups::batch_delete))
        .route(
            "/backups/{id}",
            get(backups::get_backup).delete(backups::delete_backup),
        )
        .route("/backups/{id}/cancel", post(backups::cancel_backup))
        .route("/backups/{id}/transitions", get(backups::list_transitions))
        .route("/restores/{id}", get(restores::get_restore))
        .route("/restores/{id}/cancel", post(restores::cancel_restore))
        .route(
            "/restores/{id}/transitions",
            get(restores::list_transitions),
        )
        .route(
            "/scheduled-backups/{id}",
            get(schedules::get_schedule)
                .put(schedules::update_schedule)
                .delete(schedules::delete_schedule),
        )
        .route("/scheduled-backups/{id}/run", post(schedules::run_schedule))
        .route("/api-keys/{id}", delete(api_keys::delete_api_key))
        .route("/api-keys/{id}/revoke", patch(api_keys::revoke_api_key))
        .route("/audit-logs/{id}", get(audit_logs::get_audit_log))
        .route("/settings/batch", post(settings::batch_update))
        .route(
            "/settings/{key}",
            get(settings::get_setting).delete(settings::delete_setting),
        )
        .route("/config/export", get(config_transfer::export_config))
        .route("/config/import", post(config_transfer::import_config))
        .route("/metrics", get(observability::get_metrics))
        .merge(events::router());

    router = collection(
        router,
        "/auth/users",
        get(auth::list_users).post(auth::create_user),
    );
    router = collection(
        router,
        "/ldap-servers",
        get(ldap_servers::list_servers).post(ldap_servers::create_server),
    );
    router = collection(
        router,
        "/backups",
        get(backups::list_backups).post(backups::create_backup),
    );
    router = collection(
        router,
        "/restores",
        get(restores::list_restores).post(restores::create_restore),
    );
    router = collection(
        router,
        "/scheduled-backups",
        get(schedules::list_schedules).post(schedules::create_schedule),
    );
    router = collection(
        router,
        "/api-keys",
        get(api_keys::list_api_keys).post(api_keys::create_api_key),
    );
    router = collection(router, "/audit-logs", get(audit_logs::list_audit_logs));
    router = collection(
        router,
        "/settings",
        get(settings::list_settings)
            .post(settings::upsert_setting)
            .put(settings::upsert_setting),
    );

    router.route_layer(middleware::from_fn_with_state(state, auth::auth_middleware))
}
