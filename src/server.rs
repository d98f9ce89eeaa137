use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::get;
use axum::{Form, Json, Router};
use chrono::FixedOffset;
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::auth::{tier_for, Authenticator, Credentials, SessionKeys, SqliteAuthenticator};
use crate::config::Config;
use crate::history::{
    current_by_board, run_query, HistoryPolicy, HistoryQuery, Interval, QueryError,
};
use crate::ingest::scheduler::{Schedule, Scheduler};
use crate::ingest::Pipeline;
use crate::output::html::{render_index, render_login};
use crate::snapshot::store::SnapshotStore;
use crate::snapshot::{now_in, to_display, Snapshot};

#[derive(Clone)]
pub struct AppState {
    store: SnapshotStore,
    offset: FixedOffset,
    boards: Arc<Vec<String>>,
    policy: Arc<HistoryPolicy>,
    require_auth: bool,
    sessions: SessionKeys,
    authenticator: Arc<dyn Authenticator>,
}

impl AppState {
    pub fn new(
        config: &Config,
        store: SnapshotStore,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        Self {
            offset: store.offset(),
            store,
            boards: Arc::new(config.boards.iter().map(|b| b.id.clone()).collect()),
            policy: Arc::new(HistoryPolicy::from_config(config)),
            require_auth: config.history.require_auth,
            sessions: SessionKeys::new(
                &config.server.session_secret,
                config.server.session_ttl_hours,
            ),
            authenticator,
        }
    }
}

#[derive(Debug, Serialize)]
struct ApiErrorBody {
    ok: bool,
    error: String,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn unauthorized() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: "authentication required".to_string(),
        }
    }

    /// Logs the cause; the caller only sees a generic body.
    fn internal(error: impl std::fmt::Display) -> Self {
        error!("request failed: {error}");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "internal server error".to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ApiErrorBody {
            ok: false,
            error: self.message,
        });
        (self.status, body).into_response()
    }
}

impl From<QueryError> for ApiError {
    fn from(value: QueryError) -> Self {
        Self::internal(value)
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
    version: &'static str,
}

#[derive(Debug, Serialize)]
struct CurrentCandidate {
    name: String,
    percent: f64,
}

#[derive(Debug, Serialize)]
struct CurrentPayload {
    last_update: Option<String>,
    candidates: Vec<CurrentCandidate>,
}

impl From<Snapshot> for CurrentPayload {
    fn from(snapshot: Snapshot) -> Self {
        Self {
            last_update: Some(to_display(&snapshot.timestamp)),
            candidates: snapshot
                .candidates
                .into_iter()
                .map(|c| CurrentCandidate {
                    name: c.name,
                    percent: c.percent,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Default, PartialEq)]
struct HistoryParams {
    interval: Interval,
    board: Option<String>,
    candidates: Vec<String>,
    limit: Option<usize>,
}

/// Accepts both `candidates=` and `candidates[]=`, repeated.
fn parse_history_params(pairs: &[(String, String)]) -> Result<HistoryParams, ApiError> {
    let mut params = HistoryParams::default();
    for (key, value) in pairs {
        match key.as_str() {
            "interval" => params.interval = Interval::parse_or_default(Some(value)),
            "board" if !value.trim().is_empty() => params.board = Some(value.trim().to_string()),
            "candidates" | "candidates[]" if !value.trim().is_empty() => {
                params.candidates.push(value.trim().to_string())
            }
            "limit" if !value.trim().is_empty() => {
                let limit = value
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| ApiError::bad_request(format!("invalid limit: {value}")))?;
                params.limit = Some(limit);
            }
            _ => {}
        }
    }
    Ok(params)
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/api/vote-data", get(vote_data))
        .route("/api/history", get(history))
        .route("/login", get(login_page).post(login))
        .route("/logout", get(logout))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run_server(config: Config, bind: SocketAddr) -> Result<()> {
    config.validate()?;
    let offset = config.canonical_offset()?;
    let db_path = config.resolved_db_path();
    let store = SnapshotStore::open(&db_path, offset)
        .with_context(|| format!("failed opening store: {}", db_path.display()))?;
    if config.server.session_secret == "change-me" {
        warn!("server.session_secret is the default value; set VOTE_TRACKER_SECRET");
    }

    if config.ingestion.enabled {
        let pipeline = Pipeline::from_config(&config, store.clone())?;
        let schedule = Schedule::from_config(&config.ingestion, offset);
        Scheduler::new(Arc::new(pipeline), schedule).spawn(true);
    } else {
        info!("scheduled ingestion disabled; serving stored data only");
    }

    let authenticator = SqliteAuthenticator::new(store.clone());
    let warm = authenticator.clone();
    tokio::task::spawn_blocking(move || warm.prepare()).await?;
    let app = router(AppState::new(&config, store, Arc::new(authenticator)));

    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("vote tracker listening on http://{bind}");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn index(State(state): State<AppState>, headers: HeaderMap) -> Html<String> {
    let identity = state.sessions.current_identity(&headers);
    Html(render_index(identity.is_some()))
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// A single configured board answers with its snapshot directly; several
/// boards answer with a map keyed by board id.
async fn vote_data(State(state): State<AppState>) -> Result<Response, ApiError> {
    let store = state.store.clone();
    let boards = state.boards.clone();
    let current = tokio::task::spawn_blocking(move || current_by_board(&store, &boards))
        .await
        .map_err(|err| QueryError::Worker(err.to_string()))??;

    if let [only] = state.boards.as_slice() {
        let payload = current
            .get(only)
            .cloned()
            .flatten()
            .map(CurrentPayload::from)
            .unwrap_or(CurrentPayload {
                last_update: None,
                candidates: Vec::new(),
            });
        return Ok(Json(payload).into_response());
    }

    let by_board: BTreeMap<String, Option<CurrentPayload>> = current
        .into_iter()
        .map(|(board, snapshot)| (board, snapshot.map(CurrentPayload::from)))
        .collect();
    Ok(Json(by_board).into_response())
}

async fn history(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Result<Json<Vec<Snapshot>>, ApiError> {
    let identity = state.sessions.current_identity(&headers);
    if state.require_auth && identity.is_none() {
        return Err(ApiError::unauthorized());
    }
    let params = parse_history_params(&pairs)?;
    let board = match params.board {
        Some(board) if state.boards.contains(&board) => board,
        Some(board) => return Err(ApiError::bad_request(format!("unknown board: {board}"))),
        None => state
            .boards
            .first()
            .cloned()
            .ok_or_else(|| ApiError::internal("no boards configured"))?,
    };

    let query = HistoryQuery {
        interval: params.interval,
        board: Some(board),
        candidates: params.candidates,
        limit: params.limit,
        tier: tier_for(identity.as_ref()),
    };
    let store = state.store.clone();
    let policy = state.policy.clone();
    let now = now_in(state.offset);
    let snapshots = tokio::task::spawn_blocking(move || run_query(&store, &policy, &query, now))
        .await
        .map_err(|err| QueryError::Worker(err.to_string()))??;
    Ok(Json(snapshots))
}

async fn login_page(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if state.sessions.current_identity(&headers).is_some() {
        return Redirect::to("/").into_response();
    }
    Html(render_login(None)).into_response()
}

async fn login(
    State(state): State<AppState>,
    Form(credentials): Form<Credentials>,
) -> Result<Response, ApiError> {
    let identity = state
        .authenticator
        .verify(&credentials)
        .await
        .map_err(ApiError::internal)?;
    let Some(identity) = identity else {
        warn!("failed login attempt");
        let page = Html(render_login(Some("Invalid username or password")));
        return Ok((StatusCode::UNAUTHORIZED, page).into_response());
    };

    let token = state.sessions.issue(&identity).map_err(ApiError::internal)?;
    info!("user {} signed in", identity.username);
    Ok((
        [(header::SET_COOKIE, state.sessions.session_cookie(&token))],
        Redirect::to("/"),
    )
        .into_response())
}

async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if state.sessions.current_identity(&headers).is_none() {
        return Redirect::to("/login").into_response();
    }
    (
        [(header::SET_COOKIE, SessionKeys::clear_cookie())],
        Redirect::to("/"),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use reqwest::redirect::Policy;
    use serde_json::Value;
    use tempfile::TempDir;

    use super::*;
    use crate::config::BoardConfig;
    use crate::snapshot::VoteObservation;
    use crate::source::CandidateRatio;

    struct TestServer {
        _dir: TempDir,
        base: String,
        store: SnapshotStore,
        client: reqwest::Client,
    }

    fn config(boards: &[&str], require_auth: bool) -> Config {
        let mut config = Config::default();
        config.boards = boards
            .iter()
            .map(|id| BoardConfig {
                id: id.to_string(),
                url: format!("http://upstream.invalid/{id}"),
                name_path: "name".to_string(),
                ratio_path: "ratio".to_string(),
            })
            .collect();
        config.history.require_auth = require_auth;
        config.history.anonymous_cap = 3;
        config.server.session_secret = "test-secret".to_string();
        config
    }

    async fn start(config: Config) -> TestServer {
        let dir = tempfile::tempdir().expect("tempdir");
        let offset = config.canonical_offset().expect("offset");
        let store = SnapshotStore::open(&dir.path().join("votes.db"), offset).expect("store");
        let authenticator = SqliteAuthenticator::new(store.clone()).with_dummy_cost(4);
        authenticator
            .create_user("admin", "hunter2", 4)
            .expect("user");
        let app = router(AppState::new(&config, store.clone(), Arc::new(authenticator)));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        TestServer {
            _dir: dir,
            base: format!("http://{addr}"),
            store,
            client: reqwest::Client::builder()
                .redirect(Policy::none())
                .build()
                .expect("client"),
        }
    }

    fn seed(store: &SnapshotStore, board: &str, minutes_ago: &[i64]) {
        let now = now_in(store.offset());
        for minutes in minutes_ago {
            let ts = now - Duration::minutes(*minutes);
            store
                .insert_batch(&[
                    VoteObservation::from_ratio(
                        ts,
                        board,
                        &CandidateRatio {
                            name: "A".to_string(),
                            ratio: 12.345,
                        },
                    ),
                    VoteObservation::from_ratio(
                        ts,
                        board,
                        &CandidateRatio {
                            name: "B".to_string(),
                            ratio: 7.0,
                        },
                    ),
                ])
                .expect("seed");
        }
    }

    async fn sign_in(server: &TestServer) -> String {
        let res = server
            .client
            .post(format!("{}/login", server.base))
            .form(&[("username", "admin"), ("password", "hunter2")])
            .send()
            .await
            .expect("login");
        assert_eq!(res.status(), StatusCode::SEE_OTHER);
        let cookie = res
            .headers()
            .get(header::SET_COOKIE)
            .and_then(|v| v.to_str().ok())
            .expect("set-cookie")
            .to_string();
        cookie.split(';').next().expect("pair").to_string()
    }

    async fn get_json(
        server: &TestServer,
        path: &str,
        cookie: Option<&str>,
    ) -> (StatusCode, Value) {
        let mut request = server.client.get(format!("{}{path}", server.base));
        if let Some(cookie) = cookie {
            request = request.header(header::COOKIE, cookie);
        }
        let res = request.send().await.expect("request");
        let status = res.status();
        (status, res.json().await.expect("json body"))
    }

    #[tokio::test]
    async fn vote_data_for_single_board() {
        let server = start(config(&["main"], false)).await;
        let (status, body) = get_json(&server, "/api/vote-data", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["last_update"], Value::Null);
        assert_eq!(body["candidates"], Value::Array(Vec::new()));

        seed(&server.store, "main", &[1]);
        let (_, body) = get_json(&server, "/api/vote-data", None).await;
        assert_eq!(body["candidates"][0]["name"], "A");
        assert_eq!(body["candidates"][0]["percent"], 12.35);
        assert!(body["candidates"][0].get("real_percent").is_none());
    }

    #[tokio::test]
    async fn vote_data_maps_every_board() {
        let server = start(config(&["A", "B", "C"], false)).await;
        seed(&server.store, "A", &[1]);
        let (_, body) = get_json(&server, "/api/vote-data", None).await;
        assert!(body["A"]["last_update"].is_string());
        assert_eq!(body["B"], Value::Null);
        assert_eq!(body["C"], Value::Null);
    }

    #[tokio::test]
    async fn anonymous_history_is_capped_without_real_percent() {
        let server = start(config(&["main"], false)).await;
        seed(&server.store, "main", &[1, 2, 3, 4, 5, 6]);
        let (status, body) =
            get_json(&server, "/api/history?interval=1h&limit=100&candidates[]=A", None).await;
        assert_eq!(status, StatusCode::OK);
        let snapshots = body.as_array().expect("array");
        assert_eq!(snapshots.len(), 3);
        assert_eq!(snapshots[0]["candidates"].as_array().map(Vec::len), Some(1));
        assert!(snapshots[0]["candidates"][0].get("real_percent").is_none());
    }

    #[tokio::test]
    async fn authenticated_history_honours_limit_and_real_percent() {
        let server = start(config(&["main"], false)).await;
        seed(&server.store, "main", &[1, 2, 3, 4, 5, 6]);
        let cookie = sign_in(&server).await;
        let cookie = Some(cookie.as_str());
        let (_, body) = get_json(&server, "/api/history?interval=1h&limit=5", cookie).await;
        let snapshots = body.as_array().expect("array");
        assert_eq!(snapshots.len(), 5);
        assert_eq!(snapshots[0]["candidates"][0]["real_percent"], 12.345);
    }

    #[tokio::test]
    async fn history_rejects_bad_input_and_enforces_auth() {
        let server = start(config(&["main"], true)).await;
        let (status, _) = get_json(&server, "/api/history", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let cookie = sign_in(&server).await;
        let cookie = Some(cookie.as_str());
        let (status, body) = get_json(&server, "/api/history?limit=ten", cookie).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["ok"], false);
        let (status, _) = get_json(&server, "/api/history?board=nope", cookie).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, body) = get_json(&server, "/api/history?interval=7d", cookie).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Value::Array(Vec::new()));
    }

    #[tokio::test]
    async fn store_failures_answer_500_not_empty_data() {
        let server = start(config(&["main"], false)).await;
        seed(&server.store, "main", &[1]);
        server
            .store
            .pool()
            .get()
            .expect("conn")
            .execute_batch("DROP TABLE vote_observations;")
            .expect("drop");

        for path in ["/api/history?interval=1h", "/api/vote-data"] {
            let (status, body) = get_json(&server, path, None).await;
            assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR, "{path}");
            assert_eq!(body["ok"], false);
            assert_eq!(body["error"], "internal server error");
        }
    }

    #[tokio::test]
    async fn failed_login_sets_no_session() {
        let server = start(config(&["main"], false)).await;
        let res = server
            .client
            .post(format!("{}/login", server.base))
            .form(&[("username", "admin"), ("password", "nope")])
            .send()
            .await
            .expect("login");
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
        assert!(res.headers().get(header::SET_COOKIE).is_none());
        let page = res.text().await.expect("body");
        assert!(page.contains("Invalid username or password"));
    }

    #[tokio::test]
    async fn index_reflects_session_and_logout_clears_it() {
        let server = start(config(&["main"], false)).await;
        let anonymous = server
            .client
            .get(format!("{}/", server.base))
            .send()
            .await
            .expect("index")
            .text()
            .await
            .expect("body");
        assert!(anonymous.contains("IS_AUTHENTICATED = false"));

        let cookie = sign_in(&server).await;
        let signed_in = server
            .client
            .get(format!("{}/", server.base))
            .header(header::COOKIE, &cookie)
            .send()
            .await
            .expect("index")
            .text()
            .await
            .expect("body");
        assert!(signed_in.contains("IS_AUTHENTICATED = true"));

        let res = server
            .client
            .get(format!("{}/logout", server.base))
            .header(header::COOKIE, &cookie)
            .send()
            .await
            .expect("logout");
        let cleared = res
            .headers()
            .get(header::SET_COOKIE)
            .and_then(|v| v.to_str().ok())
            .expect("set-cookie");
        assert!(cleared.contains("Max-Age=0"));
    }

    #[test]
    fn query_errors_map_to_generic_500() {
        let err = ApiError::from(QueryError::Worker("task panicked".to_string()));
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.message, "internal server error");
    }

    #[test]
    fn parses_history_params() {
        let pairs = vec![
            ("interval".to_string(), "5h".to_string()),
            ("candidates".to_string(), "A".to_string()),
            ("candidates[]".to_string(), "B".to_string()),
            ("limit".to_string(), "20".to_string()),
            ("unknown".to_string(), "x".to_string()),
        ];
        let params = parse_history_params(&pairs).expect("params");
        assert_eq!(params.interval, Interval::FiveHours);
        assert_eq!(params.candidates, vec!["A".to_string(), "B".to_string()]);
        assert_eq!(params.limit, Some(20));
        assert_eq!(params.board, None);

        let fallback = parse_history_params(&[("interval".to_string(), "2w".to_string())])
            .expect("params");
        assert_eq!(fallback.interval, Interval::OneDay);
    }
}
