//! Drives the Pluggy Connect widget for linking a new bank or repairing an
//! existing item.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use pluggy_connect::{
    ConnectEvent, ConnectWidget, ErrorPayload, EventKind, EventReceiver, LifecycleEvent,
    SuccessPayload, WidgetConfig, WidgetError, WidgetErrorCode,
};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::api::{ApiError, BankingApi};
use crate::error::error_display;
use crate::notify::{Notifier, Toast};

const GENERIC_ERROR: &str = "Erro ao conectar com o banco";

type Callback = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Clone)]
pub struct ConnectOptions {
    pub locale: String,
    pub theme: String,
    /// Receives the id of the linked item once the backend stored it.
    pub on_success: Option<Callback>,
    /// Receives the user facing error message.
    pub on_error: Option<Callback>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            locale: "pt".to_string(),
            theme: "light".to_string(),
            on_success: None,
            on_error: None,
        }
    }
}

impl ConnectOptions {
    pub fn on_success(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_success = Some(Arc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectParams {
    /// Item to repair instead of creating a new one.
    pub item_id: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("failed to obtain connect token: {0}")]
    Token(#[from] ApiError),
    #[error(transparent)]
    Widget(#[from] WidgetError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectAttempt {
    Opened,
    AlreadyInProgress,
}

pub fn widget_error_message(payload: &ErrorPayload) -> String {
    match payload.code() {
        WidgetErrorCode::UserCancelled => "Conexão cancelada pelo usuário".to_string(),
        WidgetErrorCode::InvalidCredentials => {
            "Credenciais inválidas. Verifique seus dados e tente novamente.".to_string()
        }
        WidgetErrorCode::InstitutionUnavailable => {
            "Instituição temporariamente indisponível. Tente novamente mais tarde.".to_string()
        }
        WidgetErrorCode::Other(_) => payload
            .raw_message()
            .unwrap_or(GENERIC_ERROR)
            .to_string(),
    }
}

struct Inner {
    api: Arc<dyn BankingApi>,
    widget: Arc<dyn ConnectWidget>,
    notifier: Arc<dyn Notifier>,
    options: ConnectOptions,
    connecting: AtomicBool,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    async fn finish(&self) {
        self.connecting.store(false, Ordering::Release);
        self.widget.close().await;
    }

    fn fail(&self, message: &str) {
        if let Some(on_error) = &self.options.on_error {
            on_error(message);
        }
    }

    /// Returns true once the session is over.
    async fn handle_event(&self, event: ConnectEvent) -> bool {
        match event {
            ConnectEvent::Success(payload) => {
                self.handle_success(payload).await;
                true
            }
            ConnectEvent::Error(payload) => {
                self.handle_error(payload).await;
                true
            }
            ConnectEvent::Event(event) => self.handle_lifecycle(event).await,
        }
    }

    async fn handle_success(&self, payload: SuccessPayload) {
        let item_id = match payload.item_id() {
            Some(id) => id.to_string(),
            None => {
                error!("connect widget reported success without an item id");
                self.notifier
                    .notify(Toast::error("Erro na conexão", GENERIC_ERROR));
                self.finish().await;
                self.fail(GENERIC_ERROR);
                return;
            }
        };

        info!(item = %item_id, "connect widget succeeded");
        let stored = self.api.pluggy_callback(&item_id).await;
        self.finish().await;

        match stored {
            Ok(res) => {
                let message = res
                    .message
                    .unwrap_or_else(|| "Conta conectada com sucesso!".to_string());
                self.notifier.notify(Toast::success("Banco conectado", message));
                if let Some(on_success) = &self.options.on_success {
                    on_success(&item_id);
                }
            }
            Err(err) => {
                warn!(item = %item_id, error = %err, "failed to store connected item");
                let message = error_display(&err.banking_error()).message;
                self.notifier
                    .notify(Toast::error("Erro ao salvar conexão", message.clone()));
                self.fail(&message);
            }
        }
    }

    async fn handle_error(&self, payload: ErrorPayload) {
        let message = widget_error_message(&payload);
        match payload.code() {
            WidgetErrorCode::UserCancelled => {
                debug!("connect cancelled by user");
                self.notifier.notify(Toast::info("Conexão cancelada", message.clone()));
            }
            code => {
                warn!(?code, raw = ?payload.raw_message(), "connect widget error");
                self.notifier.notify(Toast::error("Erro na conexão", message.clone()));
            }
        }
        self.finish().await;
        self.fail(&message);
    }

    async fn handle_lifecycle(&self, event: LifecycleEvent) -> bool {
        debug!(event = ?event.event, "connect widget event");
        if event.event == EventKind::Exit {
            self.finish().await;
            return true;
        }
        false
    }
}

async fn listen(inner: Arc<Inner>, mut events: EventReceiver) {
    while let Some(event) = events.recv().await {
        if inner.handle_event(event).await {
            return;
        }
    }
    debug!("connect widget closed its event stream");
    inner.finish().await;
}

#[derive(Clone)]
pub struct PluggyConnect {
    inner: Arc<Inner>,
}

impl PluggyConnect {
    pub fn new(
        api: Arc<dyn BankingApi>,
        widget: Arc<dyn ConnectWidget>,
        notifier: Arc<dyn Notifier>,
        options: ConnectOptions,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                api,
                widget,
                notifier,
                options,
                connecting: AtomicBool::new(false),
                listener: Mutex::new(None),
            }),
        }
    }

    pub fn is_connecting(&self) -> bool {
        self.inner.connecting.load(Ordering::Acquire)
    }

    pub fn is_sdk_loaded(&self) -> bool {
        self.inner.widget.is_sdk_loaded()
    }

    /// Opens the widget. Failures are also surfaced as toasts and always
    /// leave the flow ready to be opened again.
    #[tracing::instrument(skip(self))]
    pub async fn open_connect(&self, params: ConnectParams) -> Result<ConnectAttempt, ConnectError> {
        let inner = &self.inner;
        if inner.connecting.swap(true, Ordering::AcqRel) {
            warn!("connect flow already in progress");
            return Ok(ConnectAttempt::AlreadyInProgress);
        }

        let token = match inner.api.connect_token(params.item_id.as_deref()).await {
            Ok(token) => token,
            Err(err) => {
                let message = error_display(&err.banking_error()).message;
                warn!(error = %err, "failed to obtain connect token");
                inner
                    .notifier
                    .notify(Toast::error("Erro ao iniciar conexão", message));
                inner.connecting.store(false, Ordering::Release);
                return Err(err.into());
            }
        };

        let mut config = WidgetConfig::new(token.connect_token);
        config.include_sandbox = token.sandbox_mode;
        config.language = inner.options.locale.clone();
        config.theme = inner.options.theme.clone();
        config.update_item = params.item_id.or(token.item_id);

        info!(update = ?config.update_item, "opening connect widget");
        let events = match inner.widget.open(config).await {
            Ok(events) => events,
            Err(err) => {
                error!(error = %err, "failed to open connect widget");
                inner.notifier.notify(Toast::error(
                    "Erro na conexão",
                    "Não foi possível abrir o widget de conexão.",
                ));
                inner.connecting.store(false, Ordering::Release);
                return Err(err.into());
            }
        };

        let handle = tokio::spawn(listen(Arc::clone(inner), events));
        let previous = inner
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
        Ok(ConnectAttempt::Opened)
    }

    /// Reopens the widget against an existing item so it is repaired rather
    /// than duplicated.
    pub async fn update_connection(&self, item_id: &str) -> Result<ConnectAttempt, ConnectError> {
        self.open_connect(ConnectParams {
            item_id: Some(item_id.to_string()),
        })
        .await
    }

    pub async fn close_connect(&self) {
        let listener = self
            .inner
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(listener) = listener {
            listener.abort();
        }
        self.inner.finish().await;
    }

    /// Resolves once the current listener, if any, is done.
    pub async fn wait(&self) {
        let listener = self
            .inner
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(listener) = listener {
            let _ = listener.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::SocketAddr;
    use std::time::Duration;

    use pluggy_connect::{BrowserWidget, ErrorData, ErrorDetail, ItemRef, SdkLoader};

    use crate::error::BankingError;
    use crate::model::ConnectToken;
    use crate::notify::{RecordingNotifier, ToastLevel};
    use crate::testing::{FakeApi, FakeWidget};

    struct Harness {
        api: Arc<FakeApi>,
        widget: Arc<FakeWidget>,
        notifier: Arc<RecordingNotifier>,
        successes: Arc<Mutex<Vec<String>>>,
        errors: Arc<Mutex<Vec<String>>>,
        connect: PluggyConnect,
    }

    fn harness() -> Harness {
        let api = Arc::new(FakeApi::default());
        let widget = Arc::new(FakeWidget::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let successes = Arc::new(Mutex::new(vec![]));
        let errors = Arc::new(Mutex::new(vec![]));

        let options = ConnectOptions::default()
            .on_success({
                let successes = successes.clone();
                move |id| successes.lock().unwrap().push(id.to_string())
            })
            .on_error({
                let errors = errors.clone();
                move |msg| errors.lock().unwrap().push(msg.to_string())
            });

        let connect = PluggyConnect::new(api.clone(), widget.clone(), notifier.clone(), options);
        Harness {
            api,
            widget,
            notifier,
            successes,
            errors,
            connect,
        }
    }

    fn success(id: Option<&str>) -> ConnectEvent {
        ConnectEvent::Success(SuccessPayload {
            item: Some(ItemRef {
                id: id.map(str::to_string),
                ..ItemRef::default()
            }),
        })
    }

    #[tokio::test]
    async fn successful_connection_is_stored() {
        let h = harness();

        assert_eq!(
            h.connect.open_connect(ConnectParams::default()).await.unwrap(),
            ConnectAttempt::Opened
        );
        assert!(h.connect.is_connecting());
        assert_eq!(h.widget.last_config().unwrap().update_item, None);

        h.widget.emit(success(Some("item_42")));
        h.connect.wait().await;

        assert_eq!(h.api.callbacks(), vec!["item_42"]);
        assert_eq!(*h.successes.lock().unwrap(), vec!["item_42"]);
        assert!(!h.connect.is_connecting());
        assert_eq!(h.widget.closed(), 1);
        assert_eq!(h.notifier.count(ToastLevel::Success), 1);
    }

    #[tokio::test]
    async fn second_open_is_rejected_while_connecting() {
        let h = harness();
        h.connect.open_connect(ConnectParams::default()).await.unwrap();

        assert_eq!(
            h.connect.open_connect(ConnectParams::default()).await.unwrap(),
            ConnectAttempt::AlreadyInProgress
        );
        assert_eq!(h.widget.opened(), 1);
    }

    #[tokio::test]
    async fn update_connection_targets_the_item() {
        let h = harness();
        h.connect.update_connection("item_9").await.unwrap();

        let config = h.widget.last_config().unwrap();
        assert_eq!(config.update_item.as_deref(), Some("item_9"));
        assert_eq!(h.api.token_requests(), vec![Some("item_9".to_string())]);
    }

    #[tokio::test]
    async fn token_item_is_used_when_params_omit_it() {
        let h = harness();
        h.api.set_connect_token(ConnectToken {
            connect_token: "tok".into(),
            sandbox_mode: true,
            item_id: Some("item_3".into()),
        });

        h.connect.open_connect(ConnectParams::default()).await.unwrap();

        let config = h.widget.last_config().unwrap();
        assert_eq!(config.update_item.as_deref(), Some("item_3"));
        assert!(config.include_sandbox);
    }

    #[tokio::test]
    async fn missing_item_id_is_an_error() {
        let h = harness();
        h.connect.open_connect(ConnectParams::default()).await.unwrap();

        h.widget.emit(success(None));
        h.connect.wait().await;

        assert!(h.api.callbacks().is_empty());
        assert!(h.successes.lock().unwrap().is_empty());
        assert_eq!(h.errors.lock().unwrap().len(), 1);
        assert!(!h.connect.is_connecting());
    }

    #[tokio::test]
    async fn widget_errors_are_localized() {
        let h = harness();
        h.connect.open_connect(ConnectParams::default()).await.unwrap();

        h.widget.emit(ConnectEvent::Error(ErrorPayload {
            code: None,
            message: None,
            data: Some(ErrorData {
                item: None,
                error: Some(ErrorDetail {
                    code: Some("INVALID_CREDENTIALS".into()),
                    message: Some("raw".into()),
                }),
            }),
        }));
        h.connect.wait().await;

        assert_eq!(
            *h.errors.lock().unwrap(),
            vec!["Credenciais inválidas. Verifique seus dados e tente novamente."]
        );
        assert!(!h.connect.is_connecting());
        assert_eq!(h.widget.closed(), 1);
    }

    #[test]
    fn unknown_widget_errors_fall_back() {
        let raw = ErrorPayload {
            code: Some("WEIRD".into()),
            message: Some("Something odd".into()),
            data: None,
        };
        assert_eq!(widget_error_message(&raw), "Something odd");
        assert_eq!(widget_error_message(&ErrorPayload::default()), GENERIC_ERROR);
    }

    #[tokio::test]
    async fn exit_event_clears_connecting() {
        let h = harness();
        h.connect.open_connect(ConnectParams::default()).await.unwrap();

        h.widget
            .emit(ConnectEvent::Event(LifecycleEvent::new(EventKind::SelectedInstitution)));
        h.widget.emit(ConnectEvent::Event(LifecycleEvent::new(EventKind::Exit)));
        h.connect.wait().await;

        assert!(!h.connect.is_connecting());
        assert!(h.api.callbacks().is_empty());
        assert_eq!(h.widget.closed(), 1);

        h.connect.update_connection("item_9").await.unwrap();
        assert_eq!(h.widget.opened(), 2);
    }

    #[tokio::test]
    async fn ended_stream_closes_the_session() {
        let h = harness();
        h.connect.open_connect(ConnectParams::default()).await.unwrap();

        h.widget.end_stream();
        h.connect.wait().await;

        assert!(!h.connect.is_connecting());
        assert_eq!(h.widget.closed(), 1);
        assert_eq!(
            h.connect.open_connect(ConnectParams::default()).await.unwrap(),
            ConnectAttempt::Opened
        );
    }

    #[tokio::test]
    async fn browser_widget_reopens_after_exit() -> Result<(), Box<dyn std::error::Error>> {
        let mut sdk = mockito::Server::new_async().await;
        let _sdk = sdk
            .mock("GET", "/pluggy-connect.js")
            .with_status(200)
            .with_body("window.PluggyConnect = function () {};")
            .create_async()
            .await;

        let loader = Arc::new(SdkLoader::new(format!("{}/pluggy-connect.js", sdk.url())));
        let widget = Arc::new(BrowserWidget::new(
            loader,
            SocketAddr::from(([127, 0, 0, 1], 0)),
            Duration::from_secs(30),
        ));
        let connect = PluggyConnect::new(
            Arc::new(FakeApi::default()),
            widget.clone(),
            Arc::new(RecordingNotifier::default()),
            ConnectOptions::default(),
        );

        connect.open_connect(ConnectParams::default()).await?;
        let url = widget.session_url().ok_or("session is not open")?;
        let client = reqwest::Client::new();
        let page = client.get(&url).send().await?.text().await?;
        let start = page.find("state=").ok_or("page has no state")? + "state=".len();
        let end = page[start..].find('`').ok_or("state is not terminated")? + start;

        let resp = client
            .post(format!(
                "{}/callback/event?state={}",
                url.trim_end_matches("/connect"),
                &page[start..end]
            ))
            .json(&serde_json::json!({ "event": "EXIT" }))
            .send()
            .await?;
        assert_eq!(resp.status(), 204);
        connect.wait().await;

        assert!(!connect.is_connecting());
        assert!(widget.session_url().is_none());
        assert_eq!(
            connect.update_connection("item_9").await?,
            ConnectAttempt::Opened
        );
        connect.close_connect().await;

        Ok(())
    }

    #[tokio::test]
    async fn token_failure_resets_state() {
        let h = harness();
        h.api.fail_next(
            "connect_token",
            ApiError::banking(BankingError::new("rate_limit_exceeded", "slow down")),
        );

        let attempt = h.connect.open_connect(ConnectParams::default()).await;

        assert!(matches!(attempt, Err(ConnectError::Token(_))));
        assert!(!h.connect.is_connecting());
        assert_eq!(h.widget.opened(), 0);
        assert_eq!(h.notifier.count(ToastLevel::Error), 1);
    }

    #[tokio::test]
    async fn widget_open_failure_resets_state() {
        let h = harness();
        h.widget.fail_open();

        let attempt = h.connect.open_connect(ConnectParams::default()).await;

        assert!(matches!(attempt, Err(ConnectError::Widget(_))));
        assert!(!h.connect.is_connecting());
    }

    #[tokio::test]
    async fn close_is_safe_without_a_session() {
        let h = harness();
        h.connect.close_connect().await;
        h.connect.close_connect().await;
        assert!(!h.connect.is_connecting());
    }
}
