//! Bridge to the Pluggy Connect widget.
//!
//! The widget itself is a third-party browser script. This crate owns the
//! pieces a native client needs around it: the widget configuration, the
//! callback payloads it reports, a memoized loader for the SDK script and a
//! [`ConnectWidget`] implementation that hosts the widget page locally and
//! relays its callbacks back into a channel.

mod loader;
mod server;

use std::collections::HashMap;

use axum::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

pub use loader::SdkLoader;
pub use server::BrowserWidget;

pub static DEFAULT_SDK_URL: &str = "https://cdn.pluggy.ai/pluggy-connect/v2.7.0/pluggy-connect.js";

#[derive(Debug, Error)]
pub enum WidgetError {
    #[error("failed to load connect sdk: {0}")]
    SdkLoad(String),
    #[error("connect sdk request failed")]
    SdkRequest(#[from] reqwest::Error),
    #[error("unable to start connect server: {0}")]
    Bind(String),
    #[error("a connect session is already open")]
    SessionOpen,
    #[error("unable to parse argument")]
    ParseError(#[from] serde_json::Error),
    #[error("failed to decode base64 argument")]
    DecodeError(#[from] base64::DecodeError),
    #[error("invalid string source")]
    BadRequest(#[from] std::string::FromUtf8Error),
}

/// Options handed to the widget when it is initialized.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WidgetConfig {
    pub connect_token: String,
    pub include_sandbox: bool,
    pub language: String,
    pub theme: String,
    /// Item to repair. When absent the widget creates a brand new item, so
    /// every reconnect flow must set it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_item: Option<String>,
}

impl WidgetConfig {
    pub fn new(connect_token: impl Into<String>) -> Self {
        Self {
            connect_token: connect_token.into(),
            include_sandbox: false,
            language: "pt".to_string(),
            theme: "light".to_string(),
            update_item: None,
        }
    }

    pub fn is_update(&self) -> bool {
        self.update_item.is_some()
    }
}

/// SessionState is carried through the hosted page so callbacks from a stale
/// page can be told apart from the current session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionState {
    pub session_id: String,
    pub update_item: Option<String>,
}

impl SessionState {
    pub fn to_opaque(&self) -> Result<String, serde_json::Error> {
        Ok(base64::encode_config(
            serde_json::to_string(self)?.as_bytes(),
            base64::URL_SAFE,
        ))
    }

    pub fn from_opaque(token: &str) -> Result<Self, WidgetError> {
        let raw = String::from_utf8(base64::decode_config(token.as_bytes(), base64::URL_SAFE)?)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ConnectorRef {
    pub id: Option<serde_json::Value>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ItemRef {
    pub id: Option<String>,
    pub status: Option<String>,
    pub connector: Option<ConnectorRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SuccessPayload {
    pub item: Option<ItemRef>,
}

impl SuccessPayload {
    /// The id of the created or repaired item, if the widget reported one.
    pub fn item_id(&self) -> Option<&str> {
        self.item
            .as_ref()
            .and_then(|item| item.id.as_deref())
            .filter(|id| !id.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ErrorDetail {
    pub code: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ErrorData {
    pub item: Option<ItemRef>,
    pub error: Option<ErrorDetail>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ErrorPayload {
    pub code: Option<String>,
    pub message: Option<String>,
    pub data: Option<ErrorData>,
}

impl ErrorPayload {
    pub fn code(&self) -> WidgetErrorCode {
        let raw = self.code.as_deref().or_else(|| {
            self.data
                .as_ref()
                .and_then(|d| d.error.as_ref())
                .and_then(|e| e.code.as_deref())
        });

        match raw {
            Some(code) => WidgetErrorCode::from(code),
            None => WidgetErrorCode::Other(String::new()),
        }
    }

    /// The raw message reported by the widget, preferring the nested detail.
    pub fn raw_message(&self) -> Option<&str> {
        self.data
            .as_ref()
            .and_then(|d| d.error.as_ref())
            .and_then(|e| e.message.as_deref())
            .or(self.message.as_deref())
            .filter(|m| !m.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WidgetErrorCode {
    UserCancelled,
    InvalidCredentials,
    InstitutionUnavailable,
    Other(String),
}

impl From<&str> for WidgetErrorCode {
    fn from(code: &str) -> Self {
        match code.to_ascii_uppercase().as_str() {
            "USER_CANCELLED" | "USER_CANCELED" => WidgetErrorCode::UserCancelled,
            "INVALID_CREDENTIALS" => WidgetErrorCode::InvalidCredentials,
            "INSTITUTION_UNAVAILABLE" | "CONNECTOR_UNAVAILABLE" => {
                WidgetErrorCode::InstitutionUnavailable
            }
            _ => WidgetErrorCode::Other(code.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Open,
    SelectedInstitution,
    SubmittedConsent,
    SubmittedLogin,
    SubmittedMfa,
    LoginSuccess,
    LoginMfaSuccess,
    LoginStepCompleted,
    ItemResponse,
    Exit,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LifecycleEvent {
    pub event: EventKind,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl LifecycleEvent {
    pub fn new(event: EventKind) -> Self {
        Self {
            event,
            extra: HashMap::new(),
        }
    }
}

/// Everything the widget can report back while a session is open.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectEvent {
    Success(SuccessPayload),
    Error(ErrorPayload),
    Event(LifecycleEvent),
}

pub type EventReceiver = mpsc::UnboundedReceiver<ConnectEvent>;

/// A host able to open the Connect widget with a given configuration.
#[async_trait]
pub trait ConnectWidget: Send + Sync {
    /// Opens the widget, returning the stream of callbacks it reports.
    async fn open(&self, config: WidgetConfig) -> Result<EventReceiver, WidgetError>;

    /// Tears down the current widget instance. A no-op when none is open.
    async fn close(&self);

    fn is_sdk_loaded(&self) -> bool;
}
