use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::{
    async_trait,
    extract::{Extension, Query},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::{
    ConnectEvent, ConnectWidget, ErrorPayload, EventReceiver, LifecycleEvent, SdkLoader,
    SessionState, SuccessPayload, WidgetConfig, WidgetError,
};

static PAGE: &str = r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>CaixaHub - Conectar banco</title></head>
<body></body>
<script src="/sdk.js"></script>
<script>
  const post = (kind, body) => fetch(`/callback/${kind}?state=__STATE__`, {
    method: 'POST',
    headers: { 'content-type': 'application/json' },
    body: JSON.stringify(body || {}),
  });
  const connect = new PluggyConnect(Object.assign(__CONFIG__, {
    onSuccess: (data) => post('success', data),
    onError: (error) => post('error', error),
    onEvent: (event) => post('event', event),
  }));
  connect.init();
</script>
</html>
"#;

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_session_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!(
        "{:x}-{}",
        nanos,
        SESSION_COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

fn render_page(config: &WidgetConfig, state: &SessionState) -> Result<String, WidgetError> {
    Ok(PAGE
        .replace("__CONFIG__", &serde_json::to_string(config)?)
        .replace("__STATE__", &state.to_opaque()?))
}

#[derive(Clone)]
struct SessionContext {
    state: SessionState,
    page: Arc<String>,
    script: Arc<String>,
    events: mpsc::UnboundedSender<ConnectEvent>,
}

impl SessionContext {
    fn accepts(&self, query: &CallbackQuery) -> bool {
        match SessionState::from_opaque(&query.state) {
            Ok(state) => state == self.state,
            Err(err) => {
                debug!(error = %err, "rejecting callback with unreadable state");
                false
            }
        }
    }

    fn forward(&self, event: ConnectEvent) -> Response {
        if self.events.send(event).is_err() {
            debug!(session = %self.state.session_id, "connect session listener is gone");
        }
        StatusCode::NO_CONTENT.into_response()
    }
}

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    state: String,
}

struct ActiveSession {
    id: String,
    url: String,
    shutdown: oneshot::Sender<()>,
}

/// BrowserWidget hosts the Connect page on a local address and relays the
/// widget callbacks posted by that page.
pub struct BrowserWidget {
    loader: Arc<SdkLoader>,
    addr: SocketAddr,
    session_timeout: Duration,
    active: Arc<Mutex<Option<ActiveSession>>>,
}

impl BrowserWidget {
    pub fn new(loader: Arc<SdkLoader>, addr: SocketAddr, session_timeout: Duration) -> Self {
        Self {
            loader,
            addr,
            session_timeout,
            active: Arc::new(Mutex::new(None)),
        }
    }

    /// Address of the page for the currently open session.
    pub fn session_url(&self) -> Option<String> {
        self.active
            .lock()
            .ok()
            .and_then(|active| active.as_ref().map(|s| s.url.clone()))
    }

    fn take_active(&self) -> Option<ActiveSession> {
        match self.active.lock() {
            Ok(mut active) => active.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}

/// Forgets the session once its server is gone, unless a newer session
/// already replaced it.
fn release(active: &Mutex<Option<ActiveSession>>, session_id: &str) {
    let mut active = match active.lock() {
        Ok(active) => active,
        Err(poisoned) => poisoned.into_inner(),
    };
    if active.as_ref().map_or(false, |s| s.id == session_id) {
        active.take();
    }
}

#[async_trait]
impl ConnectWidget for BrowserWidget {
    async fn open(&self, config: WidgetConfig) -> Result<EventReceiver, WidgetError> {
        if self.session_url().is_some() {
            return Err(WidgetError::SessionOpen);
        }

        let script = self.loader.load().await?;
        let state = SessionState {
            session_id: next_session_id(),
            update_item: config.update_item.clone(),
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = SessionContext {
            page: Arc::new(render_page(&config, &state)?),
            state: state.clone(),
            script,
            events: tx,
        };

        let router = Router::new()
            .route("/connect", get(connect_page))
            .route("/sdk.js", get(sdk_script))
            .route("/callback/success", post(on_success))
            .route("/callback/error", post(on_error))
            .route("/callback/event", post(on_event))
            .layer(Extension(ctx));

        let server = axum::Server::try_bind(&self.addr)
            .map_err(|e| WidgetError::Bind(e.to_string()))?
            .serve(router.into_make_service());
        let addr = server.local_addr();

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let timeout = self.session_timeout;
        let session_id = state.session_id.clone();
        let server = server.with_graceful_shutdown(async move {
            tokio::select! {
                _ = shutdown_rx => {},
                _ = tokio::time::sleep(timeout) => {
                    warn!(session = %session_id, "connect session timed out");
                },
            }
        });

        let url = format!("http://{}/connect", addr);
        info!(
            update = config.is_update(),
            "Visit {} to connect your bank account.", url
        );

        {
            let mut active = self.active.lock().map_err(|_| WidgetError::SessionOpen)?;
            *active = Some(ActiveSession {
                id: state.session_id.clone(),
                url,
                shutdown: shutdown_tx,
            });
        }

        let active = Arc::clone(&self.active);
        let session_id = state.session_id;
        tokio::spawn(async move {
            if let Err(err) = server.await {
                error!(error = %err, "connect server failed");
            }
            release(&active, &session_id);
        });

        Ok(rx)
    }

    async fn close(&self) {
        if let Some(session) = self.take_active() {
            debug!(session = %session.id, "closing connect session");
            let _ = session.shutdown.send(());
        }
    }

    fn is_sdk_loaded(&self) -> bool {
        self.loader.is_loaded()
    }
}

async fn connect_page(Extension(ctx): Extension<SessionContext>) -> impl IntoResponse {
    Html(ctx.page.as_str().to_owned())
}

async fn sdk_script(Extension(ctx): Extension<SessionContext>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "application/javascript")],
        ctx.script.as_str().to_owned(),
    )
}

async fn on_success(
    Extension(ctx): Extension<SessionContext>,
    Query(query): Query<CallbackQuery>,
    Json(payload): Json<SuccessPayload>,
) -> Response {
    if !ctx.accepts(&query) {
        return (StatusCode::BAD_REQUEST, "unknown session").into_response();
    }
    ctx.forward(ConnectEvent::Success(payload))
}

async fn on_error(
    Extension(ctx): Extension<SessionContext>,
    Query(query): Query<CallbackQuery>,
    Json(payload): Json<ErrorPayload>,
) -> Response {
    if !ctx.accepts(&query) {
        return (StatusCode::BAD_REQUEST, "unknown session").into_response();
    }
    ctx.forward(ConnectEvent::Error(payload))
}

async fn on_event(
    Extension(ctx): Extension<SessionContext>,
    Query(query): Query<CallbackQuery>,
    Json(payload): Json<LifecycleEvent>,
) -> Response {
    if !ctx.accepts(&query) {
        return (StatusCode::BAD_REQUEST, "unknown session").into_response();
    }
    ctx.forward(ConnectEvent::Event(payload))
}
