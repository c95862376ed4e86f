//! HTTP front end.
//!
//! Thin validation and auth layer over the channel core. Every parameter is
//! checked against the wire alphabet before anything touches channel state,
//! and every state change is dispatched onto the engine's job queue; the
//! handlers themselves never mutate a channel directly.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Instant;

use axum::Router;
use axum::extract::{ConnectInfo, FromRequestParts, Query, Request, State};
use axum::http::request::Parts;
use axum::http::{StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use regex::Regex;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};

use crate::auth::SYSTEM_USER;
use crate::error::OperationError;
use crate::message::{
    Body, Message, Name, RE_DISPLAY_NAME, RE_EXTRA, RE_TEXT, RE_UNIQUE, RE_USER_CHANNEL,
};
use crate::now_ms;
use crate::server::App;

static USER_CHANNEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!("^{RE_USER_CHANNEL}$")).expect("regex"));
static DISPLAY_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!("^{RE_DISPLAY_NAME}$")).expect("regex"));
static EXTRA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!("^{RE_EXTRA}$")).expect("regex"));
static TEXT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!("^{RE_TEXT}$")).expect("regex"));
static UNIQUE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!("^{RE_UNIQUE}$")).expect("regex"));

pub fn router(app: Arc<App>) -> Router {
    Router::new()
        .route("/say", get(say))
        .route("/wait", get(wait))
        .route("/poll", get(poll))
        .route("/leave", get(leave))
        .route("/ban", get(ban))
        .route("/recent", get(recent))
        .route("/names", get(names))
        .layer(middleware::from_fn_with_state(Arc::clone(&app), track_time))
        .with_state(app)
}

async fn track_time(State(app): State<Arc<App>>, request: Request, next: Next) -> Response {
    let name = request.uri().path().trim_start_matches('/').to_string();
    let started = Instant::now();
    let response = next.run(request).await;
    app.stats
        .update_time_statistic(&name, started.elapsed().as_millis() as u64);
    response
}

impl IntoResponse for OperationError {
    fn into_response(self) -> Response {
        let status = match self {
            OperationError::Auth(_) | OperationError::Banned(_) => StatusCode::FORBIDDEN,
            OperationError::InvalidParameter { .. } => StatusCode::BAD_REQUEST,
            OperationError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        };
        let body = json!({
            "error": self.code(),
            "detail": self.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

fn invalid(name: &str, detail: &str) -> OperationError {
    OperationError::InvalidParameter {
        name: name.to_string(),
        detail: detail.to_string(),
    }
}

fn require(regex: &Regex, name: &str, value: &str) -> Result<(), OperationError> {
    if regex.is_match(value) {
        Ok(())
    } else {
        Err(invalid(name, "contains characters outside the allowed set"))
    }
}

/// Query extractor whose rejection is the usual JSON error payload rather
/// than axum's plain-text default, so clients can always parse a response.
struct Params<T>(T);

impl<S, T> FromRequestParts<S> for Params<T>
where
    S: Send + Sync,
    T: serde::de::DeserializeOwned,
{
    type Rejection = OperationError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Query(value) = Query::<T>::from_request_parts(parts, state)
            .await
            .map_err(|rejection| invalid("query", &rejection.body_text()))?;
        Ok(Self(value))
    }
}

/// Parameters shared by every endpoint: the identity tuple plus its
/// capability key.
#[derive(Deserialize)]
struct AuthParams {
    channel: String,
    user: String,
    displayname: String,
    extra: String,
    keytime: i64,
    key: String,
}

impl AuthParams {
    /// Validate the identity fields and the capability key. Returns whether
    /// the caller is trusted (holds a key for the reserved system user).
    fn check(&self, app: &App) -> Result<bool, OperationError> {
        require(&USER_CHANNEL, "channel", &self.channel)?;
        let trusted = self.user == SYSTEM_USER;
        if !trusted {
            require(&USER_CHANNEL, "user", &self.user)?;
        }
        require(&DISPLAY_NAME, "displayname", &self.displayname)?;
        require(&EXTRA, "extra", &self.extra)?;

        if self.keytime + (app.config.key_expiry_ms as i64) < now_ms() {
            return Err(OperationError::Auth("key has expired".into()));
        }
        let expected = app.keys.key(
            &self.channel,
            &self.user,
            &self.displayname,
            &self.extra,
            self.keytime,
        );
        if expected != self.key {
            return Err(OperationError::Auth("invalid key".into()));
        }
        Ok(trusted)
    }

    fn name(&self, app: &App) -> Name {
        Name::new(&app.keys, &self.user, &self.displayname, &self.extra)
    }

    fn check_ban(&self, app: &App) -> Result<(), OperationError> {
        if app
            .channels
            .get(&self.channel)
            .is_banned(&self.user, now_ms())
        {
            return Err(OperationError::Banned(self.user.clone()));
        }
        Ok(())
    }
}

/// Run a closure as an engine job and await its result.
async fn dispatch<T, F>(app: &App, f: F) -> Result<T, OperationError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    app.engine.add_event(Box::new(move || {
        let _ = tx.send(f());
    }));
    rx.await.map_err(|_| OperationError::ShuttingDown)
}

// ── endpoints ──

#[derive(Deserialize)]
struct SayParams {
    message: String,
    unique: String,
}

async fn say(
    State(app): State<Arc<App>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Params(auth): Params<AuthParams>,
    Params(params): Params<SayParams>,
) -> Result<Json<Value>, OperationError> {
    auth.check(&app)?;
    require(&TEXT, "message", &params.message)?;
    require(&UNIQUE, "unique", &params.unique)?;
    auth.check_ban(&app)?;

    let message = Message {
        time: now_ms(),
        channel: auth.channel.clone(),
        ip: addr.ip().to_string(),
        from: auth.name(&app),
        body: Body::Say {
            text: params.message,
            unique: params.unique,
        },
    };
    let channel = app.channels.get(&auth.channel);
    dispatch(&app, move || channel.message(message, false)).await?;
    Ok(Json(json!({"ok": true})))
}

#[derive(Deserialize)]
struct WaitParams {
    id: String,
    lasttime: i64,
}

async fn wait(
    State(app): State<Arc<App>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Params(auth): Params<AuthParams>,
    Params(params): Params<WaitParams>,
) -> Result<Response, OperationError> {
    let trusted = auth.check(&app)?;
    require(&UNIQUE, "id", &params.id)?;
    auth.check_ban(&app)?;

    let (tx, mut rx) = mpsc::channel(1);
    let channel = app.channels.get(&auth.channel);
    let name = auth.name(&app);
    let ip = addr.ip().to_string();
    dispatch(&app, move || {
        channel.wait(&params.id, name, &ip, params.lasttime, trusted, tx)
    })
    .await?;

    // Resolved by a message batch or by the wait timeout job.
    let body = rx.recv().await.ok_or(OperationError::ShuttingDown)?;
    Ok(([(header::CONTENT_TYPE, "application/json")], body).into_response())
}

#[derive(Deserialize)]
struct PollParams {
    lasttime: i64,
}

async fn poll(
    State(app): State<Arc<App>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Params(auth): Params<AuthParams>,
    Params(params): Params<PollParams>,
) -> Result<Json<Value>, OperationError> {
    let trusted = auth.check(&app)?;
    auth.check_ban(&app)?;

    let channel = app.channels.get(&auth.channel);
    let name = auth.name(&app);
    let ip = addr.ip().to_string();
    let response = dispatch(&app, move || {
        channel.poll(&name, &ip, params.lasttime, trusted)
    })
    .await?;
    Ok(Json(response))
}

async fn leave(
    State(app): State<Arc<App>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Params(auth): Params<AuthParams>,
) -> Result<Json<Value>, OperationError> {
    auth.check(&app)?;

    let message = Message {
        time: now_ms(),
        channel: auth.channel.clone(),
        ip: addr.ip().to_string(),
        from: auth.name(&app),
        body: Body::Leave { timeout: false },
    };
    let channel = app.channels.get(&auth.channel);
    dispatch(&app, move || channel.message(message, false)).await?;
    Ok(Json(json!({"ok": true})))
}

#[derive(Deserialize)]
struct BanParams {
    ban: String,
    bandisplayname: String,
    banextra: String,
    until: i64,
    unique: String,
}

async fn ban(
    State(app): State<Arc<App>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Params(auth): Params<AuthParams>,
    Params(params): Params<BanParams>,
) -> Result<Json<Value>, OperationError> {
    auth.check(&app)?;
    require(&USER_CHANNEL, "ban", &params.ban)?;
    require(&DISPLAY_NAME, "bandisplayname", &params.bandisplayname)?;
    require(&EXTRA, "banextra", &params.banextra)?;
    require(&UNIQUE, "unique", &params.unique)?;

    let message = Message {
        time: now_ms(),
        channel: auth.channel.clone(),
        ip: addr.ip().to_string(),
        from: auth.name(&app),
        body: Body::Ban {
            target: Name::new(
                &app.keys,
                &params.ban,
                &params.bandisplayname,
                &params.banextra,
            ),
            until: params.until,
            unique: params.unique,
        },
    };
    let channel = app.channels.get(&auth.channel);
    dispatch(&app, move || channel.message(message, false)).await?;
    Ok(Json(json!({"ok": true})))
}

#[derive(Deserialize)]
struct RecentParams {
    maxage: i64,
    maxnumber: Option<usize>,
    #[serde(default)]
    sayonly: bool,
}

async fn recent(
    State(app): State<Arc<App>>,
    Params(auth): Params<AuthParams>,
    Params(params): Params<RecentParams>,
) -> Result<Json<Value>, OperationError> {
    let trusted = auth.check(&app)?;
    if params.maxage <= 0 {
        return Err(invalid("maxage", "must be positive"));
    }

    let channel = app.channels.get(&auth.channel);
    let messages = dispatch(&app, move || {
        channel.recent(params.maxage, params.maxnumber, params.sayonly, trusted)
    })
    .await?;
    Ok(Json(json!({"messages": messages})))
}

#[derive(Deserialize)]
struct NamesParams {
    maxnumber: Option<usize>,
}

async fn names(
    State(app): State<Arc<App>>,
    Params(auth): Params<AuthParams>,
    Params(params): Params<NamesParams>,
) -> Result<Json<Value>, OperationError> {
    let trusted = auth.check(&app)?;

    let channel = app.channels.get(&auth.channel);
    let names = dispatch(&app, move || channel.get_names(params.maxnumber, trusted)).await?;
    Ok(Json(json!({"names": names})))
}
