//! Translation of banking errors into what the user gets to see.
//!
//! Everything in here is pure: a [`BankingError`] goes in, display metadata,
//! a retry delay or remediation steps come out.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

const GENERIC_CODE: &str = "unknown_error";
const GENERIC_MESSAGE: &str = "Ocorreu um erro inesperado. Tente novamente.";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorHelp {
    #[serde(default)]
    pub steps: Vec<String>,
    #[serde(default)]
    pub url: Option<String>,
}

/// Structured error as the backend reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BankingError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub help: Option<ErrorHelp>,
}

impl BankingError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            item_id: None,
            account_id: None,
            retry_after: None,
            help: None,
        }
    }

    pub fn unexpected() -> Self {
        Self::new(GENERIC_CODE, GENERIC_MESSAGE)
    }

    pub fn kind(&self) -> ErrorCode {
        ErrorCode::from(self.code.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    InvalidCredentials,
    MfaRequired,
    RateLimitExceeded,
    InstitutionUnavailable,
    SyncError,
    AccountNotFound,
    PluggyConnectionError,
    Unknown,
}

impl ErrorCode {
    pub const KNOWN: [ErrorCode; 7] = [
        ErrorCode::InvalidCredentials,
        ErrorCode::MfaRequired,
        ErrorCode::RateLimitExceeded,
        ErrorCode::InstitutionUnavailable,
        ErrorCode::SyncError,
        ErrorCode::AccountNotFound,
        ErrorCode::PluggyConnectionError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidCredentials => "invalid_credentials",
            ErrorCode::MfaRequired => "mfa_required",
            ErrorCode::RateLimitExceeded => "rate_limit_exceeded",
            ErrorCode::InstitutionUnavailable => "institution_unavailable",
            ErrorCode::SyncError => "sync_error",
            ErrorCode::AccountNotFound => "account_not_found",
            ErrorCode::PluggyConnectionError => "pluggy_connection_error",
            ErrorCode::Unknown => GENERIC_CODE,
        }
    }
}

impl From<&str> for ErrorCode {
    fn from(code: &str) -> Self {
        match code {
            "invalid_credentials" => ErrorCode::InvalidCredentials,
            "mfa_required" => ErrorCode::MfaRequired,
            "rate_limit_exceeded" => ErrorCode::RateLimitExceeded,
            "institution_unavailable" => ErrorCode::InstitutionUnavailable,
            "sync_error" => ErrorCode::SyncError,
            "account_not_found" => ErrorCode::AccountNotFound,
            "pluggy_connection_error" => ErrorCode::PluggyConnectionError,
            _ => ErrorCode::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Reconnect,
    Wait,
    Retry,
    ContactSupport,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorAction {
    pub kind: ActionKind,
    pub label: String,
}

impl ErrorAction {
    fn new(kind: ActionKind, label: &str) -> Self {
        Self {
            kind,
            label: label.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorDisplay {
    pub title: String,
    pub message: String,
    pub action: Option<ErrorAction>,
    pub severity: Severity,
}

pub fn error_display(error: &BankingError) -> ErrorDisplay {
    let (title, message, action, severity) = match error.kind() {
        ErrorCode::InvalidCredentials => (
            "Credenciais inválidas",
            "Suas credenciais bancárias estão incorretas ou expiraram. Reconecte a conta para continuar sincronizando.".to_string(),
            Some(ErrorAction::new(ActionKind::Reconnect, "Reconectar conta")),
            Severity::Error,
        ),
        ErrorCode::MfaRequired => (
            "Autenticação necessária",
            "Seu banco solicitou uma verificação adicional. Complete a autenticação para continuar.".to_string(),
            Some(ErrorAction::new(ActionKind::Reconnect, "Completar autenticação")),
            Severity::Warning,
        ),
        ErrorCode::RateLimitExceeded => (
            "Muitas tentativas",
            format!(
                "Limite de requisições atingido. Aguarde {} antes de tentar novamente.",
                describe_delay(retry_delay(error))
            ),
            Some(ErrorAction::new(ActionKind::Wait, "Aguardar")),
            Severity::Warning,
        ),
        ErrorCode::InstitutionUnavailable => (
            "Banco indisponível",
            "O banco está temporariamente indisponível. Tente novamente mais tarde.".to_string(),
            Some(ErrorAction::new(ActionKind::Retry, "Tentar novamente")),
            Severity::Warning,
        ),
        ErrorCode::SyncError => (
            "Erro na sincronização",
            "Não foi possível sincronizar os dados da conta.".to_string(),
            Some(ErrorAction::new(ActionKind::Retry, "Tentar novamente")),
            Severity::Error,
        ),
        ErrorCode::AccountNotFound => (
            "Conta não encontrada",
            "A conta solicitada não foi encontrada ou foi removida.".to_string(),
            None,
            Severity::Error,
        ),
        ErrorCode::PluggyConnectionError => (
            "Erro de conexão",
            "Não foi possível conectar ao serviço de integração bancária.".to_string(),
            Some(ErrorAction::new(ActionKind::Retry, "Tentar novamente")),
            Severity::Error,
        ),
        ErrorCode::Unknown => (
            "Erro",
            if error.message.trim().is_empty() {
                GENERIC_MESSAGE.to_string()
            } else {
                error.message.clone()
            },
            Some(ErrorAction::new(ActionKind::ContactSupport, "Falar com o suporte")),
            Severity::Error,
        ),
    };

    ErrorDisplay {
        title: title.to_string(),
        message,
        action,
        severity,
    }
}

pub fn requires_reconnection(error: &BankingError) -> bool {
    matches!(
        error.kind(),
        ErrorCode::InvalidCredentials | ErrorCode::MfaRequired
    )
}

pub fn is_retryable(error: &BankingError) -> bool {
    matches!(
        error_display(error).action.map(|a| a.kind),
        Some(ActionKind::Retry) | Some(ActionKind::Wait)
    )
}

pub fn retry_delay(error: &BankingError) -> Duration {
    if let Some(secs) = error.retry_after {
        return Duration::from_millis(secs.saturating_mul(1000));
    }

    match error.kind() {
        ErrorCode::RateLimitExceeded => Duration::from_secs(5 * 60),
        ErrorCode::InstitutionUnavailable => Duration::from_secs(30 * 60),
        ErrorCode::SyncError => Duration::from_secs(60),
        _ => Duration::from_secs(30),
    }
}

fn describe_delay(delay: Duration) -> String {
    let secs = delay.as_secs();
    match secs {
        s if s >= 120 => format!("{} minutos", s / 60),
        s if s >= 60 => "1 minuto".to_string(),
        s => format!("{} segundos", s),
    }
}

pub fn help_steps(error: &BankingError) -> Vec<String> {
    if let Some(help) = &error.help {
        if !help.steps.is_empty() {
            return help.steps.clone();
        }
    }

    let steps: &[&str] = match error.kind() {
        ErrorCode::InvalidCredentials => &[
            "Verifique se usuário e senha estão corretos",
            "Confirme se sua senha não foi alterada recentemente",
            "Reconecte a conta usando as credenciais atualizadas",
        ],
        ErrorCode::MfaRequired => &[
            "Abra o aplicativo do seu banco",
            "Aprove a solicitação de acesso ou informe o código recebido",
            "Conclua a autenticação em até 1 minuto",
        ],
        ErrorCode::RateLimitExceeded => &[
            "Aguarde alguns minutos",
            "Evite sincronizar a mesma conta repetidamente",
        ],
        ErrorCode::InstitutionUnavailable => &[
            "O banco pode estar em manutenção",
            "Tente novamente em alguns minutos",
            "Verifique o status do banco em seus canais oficiais",
        ],
        ErrorCode::SyncError => &[
            "Tente sincronizar novamente",
            "Se o erro persistir, reconecte a conta",
        ],
        ErrorCode::AccountNotFound => &[
            "Atualize a lista de contas",
            "A conta pode ter sido desconectada",
        ],
        ErrorCode::PluggyConnectionError => &[
            "Verifique sua conexão com a internet",
            "Tente novamente em alguns instantes",
        ],
        ErrorCode::Unknown => &[
            "Tente novamente mais tarde",
            "Se o problema continuar, entre em contato com o suporte",
        ],
    };

    steps.iter().map(|s| s.to_string()).collect()
}

/// Normalizes the error shapes the backend and transport produce: a bare
/// error object, an `{"error": {...}}` wrapper, a client response wrapper
/// (`{"response": {"data": ...}}`), a `{"detail": ...}` body or a plain
/// string.
pub fn parse_api_error(value: &Value) -> BankingError {
    parse_value(value, 0).unwrap_or_else(BankingError::unexpected)
}

fn parse_value(value: &Value, depth: usize) -> Option<BankingError> {
    if depth > 4 {
        return None;
    }

    match value {
        Value::String(s) if !s.trim().is_empty() => Some(BankingError::new(GENERIC_CODE, s.trim())),
        Value::Object(map) => {
            if let Some(code) = map.get("code").and_then(Value::as_str) {
                let mut error: BankingError = serde_json::from_value(value.clone())
                    .unwrap_or_else(|_| BankingError::new(code, ""));
                if error.message.trim().is_empty() {
                    error.message = map
                        .get("detail")
                        .and_then(Value::as_str)
                        .unwrap_or(GENERIC_MESSAGE)
                        .to_string();
                }
                return Some(error);
            }

            for wrapper in ["error", "response", "data"] {
                if let Some(inner) = map.get(wrapper) {
                    if let Some(error) = parse_value(inner, depth + 1) {
                        return Some(error);
                    }
                }
            }

            ["message", "detail"]
                .iter()
                .filter_map(|k| map.get(*k).and_then(Value::as_str))
                .find(|s| !s.trim().is_empty())
                .map(|s| BankingError::new(GENERIC_CODE, s.trim()))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn every_known_code_has_display_text() {
        for code in ErrorCode::KNOWN {
            let display = error_display(&BankingError::new(code.as_str(), ""));
            assert!(!display.title.is_empty(), "{:?}", code);
            assert!(!display.message.is_empty(), "{:?}", code);
        }
    }

    #[test]
    fn table_maps_codes_to_severity_and_action() {
        let tests = vec![
            ("invalid_credentials", Severity::Error, Some(ActionKind::Reconnect)),
            ("mfa_required", Severity::Warning, Some(ActionKind::Reconnect)),
            ("rate_limit_exceeded", Severity::Warning, Some(ActionKind::Wait)),
            ("institution_unavailable", Severity::Warning, Some(ActionKind::Retry)),
            ("sync_error", Severity::Error, Some(ActionKind::Retry)),
            ("account_not_found", Severity::Error, None),
            ("pluggy_connection_error", Severity::Error, Some(ActionKind::Retry)),
            ("something_else", Severity::Error, Some(ActionKind::ContactSupport)),
        ];

        for (code, severity, action) in tests {
            let display = error_display(&BankingError::new(code, "x"));
            assert_eq!(display.severity, severity, "{}", code);
            assert_eq!(display.action.map(|a| a.kind), action, "{}", code);
        }
    }

    #[test]
    fn unrecognized_code_falls_back_to_support() {
        let display = error_display(&BankingError::new("weird", ""));
        assert_eq!(display.title, "Erro");
        assert_eq!(display.message, GENERIC_MESSAGE);
        assert_eq!(display.action.unwrap().kind, ActionKind::ContactSupport);
    }

    #[test]
    fn only_credential_errors_require_reconnection() {
        assert!(requires_reconnection(&BankingError::new("invalid_credentials", "")));
        assert!(requires_reconnection(&BankingError::new("mfa_required", "")));
        assert!(!requires_reconnection(&BankingError::new("sync_error", "")));
        assert!(!requires_reconnection(&BankingError::unexpected()));
    }

    #[test]
    fn retry_delay_prefers_server_hint() {
        let mut error = BankingError::new("rate_limit_exceeded", "");
        assert_eq!(retry_delay(&error), Duration::from_secs(300));

        error.retry_after = Some(12);
        assert_eq!(retry_delay(&error), Duration::from_millis(12_000));

        assert_eq!(
            retry_delay(&BankingError::new("institution_unavailable", "")),
            Duration::from_secs(1800)
        );
        assert_eq!(
            retry_delay(&BankingError::new("sync_error", "")),
            Duration::from_secs(60)
        );
        assert_eq!(
            retry_delay(&BankingError::new("account_not_found", "")),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn parses_known_shapes() {
        let structured = parse_api_error(&json!({
            "code": "mfa_required",
            "message": "MFA",
            "item_id": "item_9",
        }));
        assert_eq!(structured.kind(), ErrorCode::MfaRequired);
        assert_eq!(structured.item_id.as_deref(), Some("item_9"));

        let wrapped = parse_api_error(&json!({
            "response": { "data": { "error": { "code": "sync_error", "message": "boom" } } }
        }));
        assert_eq!(wrapped.kind(), ErrorCode::SyncError);
        assert_eq!(wrapped.message, "boom");

        let plain = parse_api_error(&json!("Servidor fora do ar"));
        assert_eq!(plain.message, "Servidor fora do ar");
        assert_eq!(plain.kind(), ErrorCode::Unknown);

        let detail = parse_api_error(&json!({ "detail": "Não encontrado." }));
        assert_eq!(detail.message, "Não encontrado.");
    }

    #[test]
    fn unrecognizable_input_is_unexpected() {
        assert_eq!(parse_api_error(&json!(null)), BankingError::unexpected());
        assert_eq!(parse_api_error(&json!({ "foo": 1 })), BankingError::unexpected());
        assert_eq!(parse_api_error(&json!(42)), BankingError::unexpected());
    }

    #[test]
    fn help_steps_prefer_server_guidance() {
        let mut error = BankingError::new("invalid_credentials", "");
        assert_eq!(help_steps(&error).len(), 3);

        error.help = Some(ErrorHelp {
            steps: vec!["Faça login no internet banking".into()],
            url: None,
        });
        assert_eq!(help_steps(&error), vec!["Faça login no internet banking"]);
    }
}
