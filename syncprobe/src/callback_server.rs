use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::extract::{RawQuery, State};
use axum::http::header::ACCESS_CONTROL_ALLOW_ORIGIN;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::probe::correlate::{Correlator, timestamp_from_millis};

const CORS_ANY: [(axum::http::HeaderName, &str); 1] = [(ACCESS_CONTROL_ALLOW_ORIGIN, "*")];

/// Flags raised by the browser script.
#[derive(Debug, Default)]
pub struct BrowserFlags {
    pinged: AtomicBool,
    ready: AtomicBool,
    empty: AtomicBool,
}

impl BrowserFlags {
    pub fn is_pinged(&self) -> bool {
        self.pinged.load(Ordering::SeqCst)
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.empty.load(Ordering::SeqCst)
    }

    /// Forgets a previous `/ready` so the next script attachment can be awaited.
    pub fn rearm_ready(&self) {
        self.ready.store(false, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct CallbackState {
    flags: Arc<BrowserFlags>,
    correlator: Correlator,
}

impl CallbackState {
    pub fn new(flags: Arc<BrowserFlags>, correlator: Correlator) -> Self {
        Self { flags, correlator }
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
struct SyncParams {
    file_name: Option<String>,
    ts: Option<String>,
}

impl SyncParams {
    /// Lenient query parsing: the first occurrence of a key wins and
    /// anything undecodable is replaced rather than rejected.
    fn from_query(raw: Option<&str>) -> Self {
        let mut params = Self::default();
        let Some(raw) = raw else {
            return params;
        };
        for (key, value) in url::form_urlencoded::parse(raw.as_bytes()) {
            match key.as_ref() {
                "fileName" if params.file_name.is_none() => {
                    params.file_name = Some(value.into_owned())
                }
                "ts" if params.ts.is_none() => params.ts = Some(value.into_owned()),
                _ => {}
            }
        }
        params
    }
}

pub fn router(state: CallbackState) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/ready", get(ready))
        .route("/empty", get(empty))
        .route("/sync", get(sync))
        .with_state(state)
}

/// Serves the callback routes until `cancel` fires.
pub fn spawn(
    listener: TcpListener,
    state: CallbackState,
    cancel: CancellationToken,
) -> JoinHandle<std::io::Result<()>> {
    tokio::spawn(async move {
        axum::serve(listener, router(state))
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await
    })
}

async fn ping(State(state): State<CallbackState>) {
    info!("ping received by callback server");
    state.flags.pinged.store(true, Ordering::SeqCst);
}

async fn ready(State(state): State<CallbackState>) -> impl IntoResponse {
    info!("browser script attached");
    state.flags.ready.store(true, Ordering::SeqCst);
    CORS_ANY
}

async fn empty(State(state): State<CallbackState>) -> impl IntoResponse {
    info!("browser reports an empty file list");
    state.flags.empty.store(true, Ordering::SeqCst);
    CORS_ANY
}

async fn sync(
    State(state): State<CallbackState>,
    RawQuery(query): RawQuery,
) -> impl IntoResponse {
    state.flags.empty.store(false, Ordering::SeqCst);
    let params = SyncParams::from_query(query.as_deref());
    let file_name = params.file_name.unwrap_or_default();
    let observed_at = params
        .ts
        .as_deref()
        .and_then(|raw| raw.trim().parse::<i64>().ok())
        .and_then(timestamp_from_millis);
    if observed_at.is_none() {
        warn!(file_name = %file_name, ts = ?params.ts, "sync callback without a usable timestamp");
    }
    state.correlator.absorb(&file_name, observed_at);
    CORS_ANY
}
