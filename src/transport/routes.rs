//! HTTP routes: health check and the two query endpoints.

use crate::db::executor::{DirectConnectionExecutor, PooledSessionExecutor, ReadOnlyExecutor};
use crate::db::pool::ConnectionProvider;
use crate::error::{GatewayError, GatewayResult};
use crate::gate::RequestGate;
use crate::models::{DatabaseType, ResultSet, SqlQueryParams};
use crate::sql_validator::validate_readonly;
use axum::Json;
use axum::Router;
use axum::extract::rejection::QueryRejection;
use axum::extract::{ConnectInfo, FromRequestParts, Query, State};
use axum::http::HeaderMap;
use axum::http::request::Parts;
use axum::routing::get;
use serde::Serialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::debug;

pub const POOLED_PATH: &str = "/sqlquery_alchemy/";
pub const DIRECT_PATH: &str = "/sqlquery_direct/";

/// Shared state for all handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    provider: Arc<ConnectionProvider>,
    gate: RequestGate,
    pooled: Arc<PooledSessionExecutor>,
    direct: Arc<DirectConnectionExecutor>,
    /// Dialect for the static pre-check, when enabled
    precheck: Option<DatabaseType>,
    service_name: Arc<str>,
    trust_forwarded_for: bool,
}

impl AppState {
    pub fn new(provider: Arc<ConnectionProvider>, gate: RequestGate, query_timeout: Duration) -> Self {
        Self {
            pooled: Arc::new(PooledSessionExecutor::new(
                Arc::clone(&provider),
                query_timeout,
            )),
            direct: Arc::new(DirectConnectionExecutor::new(
                Arc::clone(&provider),
                query_timeout,
            )),
            provider,
            gate,
            precheck: None,
            service_name: Arc::from(crate::config::DEFAULT_SERVICE_NAME),
            trust_forwarded_for: false,
        }
    }

    /// Enable the static read-only pre-check.
    pub fn with_precheck(mut self, enabled: bool) -> Self {
        self.precheck = enabled.then_some(self.provider.db_type());
        self
    }

    pub fn with_service_name(mut self, name: impl AsRef<str>) -> Self {
        self.service_name = Arc::from(name.as_ref());
        self
    }

    pub fn with_trust_forwarded_for(mut self, trust: bool) -> Self {
        self.trust_forwarded_for = trust;
        self
    }

    pub fn provider(&self) -> &Arc<ConnectionProvider> {
        &self.provider
    }
}

/// Build the application router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(health))
        .route(POOLED_PATH, get(sqlquery_pooled))
        .route(POOLED_PATH.trim_end_matches('/'), get(sqlquery_pooled))
        .route(DIRECT_PATH, get(sqlquery_direct))
        .route(DIRECT_PATH.trim_end_matches('/'), get(sqlquery_direct))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Address used to identify the caller for rate limiting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientAddr(pub String);

impl FromRequestParts<AppState> for ClientAddr {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        if state.trust_forwarded_for
            && let Some(ip) = forwarded_for(&parts.headers)
        {
            return Ok(Self(ip));
        }

        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string());
        Ok(Self(peer.unwrap_or_else(|| "unknown".to_string())))
    }
}

/// First entry of `X-Forwarded-For`, if present and non-empty.
fn forwarded_for(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")?
        .to_str()
        .ok()?
        .split(',')
        .next()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    name: Arc<str>,
    version: &'static str,
}

async fn health(State(state): State<AppState>) -> Json<Health> {
    Json(Health {
        status: "ok",
        name: Arc::clone(&state.service_name),
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn sqlquery_pooled(
    State(state): State<AppState>,
    ClientAddr(client): ClientAddr,
    params: Result<Query<SqlQueryParams>, QueryRejection>,
) -> GatewayResult<Json<ResultSet>> {
    let params = query_params(params)?;
    run_gated(&state, state.pooled.as_ref(), &client, params).await
}

async fn sqlquery_direct(
    State(state): State<AppState>,
    ClientAddr(client): ClientAddr,
    params: Result<Query<SqlQueryParams>, QueryRejection>,
) -> GatewayResult<Json<ResultSet>> {
    let params = query_params(params)?;
    run_gated(&state, state.direct.as_ref(), &client, params).await
}

/// Malformed query strings (duplicate or undecodable parameters) get the
/// same JSON error body as every other input error.
fn query_params(
    params: Result<Query<SqlQueryParams>, QueryRejection>,
) -> GatewayResult<SqlQueryParams> {
    params
        .map(|Query(params)| params)
        .map_err(|rejection| GatewayError::invalid_input(rejection.body_text()))
}

/// Validate input, gate the request, then run it on `executor`.
async fn run_gated<E: ReadOnlyExecutor>(
    state: &AppState,
    executor: &E,
    client: &str,
    params: SqlQueryParams,
) -> GatewayResult<Json<ResultSet>> {
    let sql = params
        .sqlquery
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| GatewayError::invalid_input("Missing required query parameter: sqlquery"))?;

    state
        .gate
        .admit(executor.kind(), params.api_key.as_deref(), client)?;

    debug!(route = %executor.kind(), client, sql = %sql, "Received query");

    if let Some(db_type) = state.precheck {
        validate_readonly(&sql, db_type)?;
    }

    executor.execute(&sql).await.map(Json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_forwarded_for_first_entry() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        );
        assert_eq!(forwarded_for(&headers), Some("203.0.113.7".to_string()));
    }

    #[test]
    fn test_forwarded_for_missing_or_blank() {
        let mut headers = HeaderMap::new();
        assert_eq!(forwarded_for(&headers), None);
        headers.insert("x-forwarded-for", HeaderValue::from_static(" , 10.0.0.1"));
        assert_eq!(forwarded_for(&headers), None);
    }

    #[test]
    fn test_paths() {
        assert_eq!(POOLED_PATH, "/sqlquery_alchemy/");
        assert_eq!(DIRECT_PATH, "/sqlquery_direct/");
    }
}
