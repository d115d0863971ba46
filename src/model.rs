use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Status of an item as reported by the aggregator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ItemStatus {
    LoginInProgress,
    Updating,
    Updated,
    LoginError,
    WaitingUserInput,
    Outdated,
    Error,
    Unknown(String),
}

impl ItemStatus {
    pub fn as_str(&self) -> &str {
        match self {
            ItemStatus::LoginInProgress => "LOGIN_IN_PROGRESS",
            ItemStatus::Updating => "UPDATING",
            ItemStatus::Updated => "UPDATED",
            ItemStatus::LoginError => "LOGIN_ERROR",
            ItemStatus::WaitingUserInput => "WAITING_USER_INPUT",
            ItemStatus::Outdated => "OUTDATED",
            ItemStatus::Error => "ERROR",
            ItemStatus::Unknown(s) => s.as_str(),
        }
    }

    pub fn needs_user_action(&self) -> bool {
        matches!(self, ItemStatus::WaitingUserInput | ItemStatus::LoginError)
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self,
            ItemStatus::LoginError | ItemStatus::Error | ItemStatus::Outdated
        )
    }

    pub fn is_syncing(&self) -> bool {
        matches!(self, ItemStatus::LoginInProgress | ItemStatus::Updating)
    }

    pub fn label(&self) -> &str {
        match self {
            ItemStatus::LoginInProgress => "Conectando",
            ItemStatus::Updating => "Atualizando",
            ItemStatus::Updated => "Atualizado",
            ItemStatus::LoginError => "Erro de login",
            ItemStatus::WaitingUserInput => "Aguardando autenticação",
            ItemStatus::Outdated => "Desatualizado",
            ItemStatus::Error => "Erro",
            ItemStatus::Unknown(_) => "Desconhecido",
        }
    }
}

impl From<String> for ItemStatus {
    fn from(value: String) -> ItemStatus {
        match value.to_ascii_uppercase().as_str() {
            "LOGIN_IN_PROGRESS" => ItemStatus::LoginInProgress,
            "UPDATING" => ItemStatus::Updating,
            "UPDATED" => ItemStatus::Updated,
            "LOGIN_ERROR" => ItemStatus::LoginError,
            "WAITING_USER_INPUT" => ItemStatus::WaitingUserInput,
            "OUTDATED" => ItemStatus::Outdated,
            "ERROR" => ItemStatus::Error,
            _ => ItemStatus::Unknown(value),
        }
    }
}

impl From<ItemStatus> for String {
    fn from(status: ItemStatus) -> String {
        status.as_str().to_string()
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A bank or institution available through the aggregator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connector {
    pub id: i64,
    #[serde(default)]
    pub pluggy_id: Option<i64>,
    pub name: String,
    #[serde(default)]
    pub institution_url: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub primary_color: Option<String>,
    #[serde(default)]
    pub logo_url: Option<String>,
    #[serde(default, rename = "type")]
    pub connector_type: Option<String>,
    #[serde(default)]
    pub has_mfa: bool,
    #[serde(default)]
    pub is_open_finance: bool,
    #[serde(default)]
    pub is_sandbox: bool,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub products: Vec<String>,
}

/// Client side narrowing of the connector catalog.
#[derive(Debug, Clone, Default)]
pub struct ConnectorFilter {
    pub search: Option<String>,
    pub include_sandbox: bool,
    pub requires_mfa: Option<bool>,
    pub open_finance: Option<bool>,
}

impl ConnectorFilter {
    pub fn matches(&self, connector: &Connector) -> bool {
        if !connector.is_active || (connector.is_sandbox && !self.include_sandbox) {
            return false;
        }
        if let Some(mfa) = self.requires_mfa {
            if connector.has_mfa != mfa {
                return false;
            }
        }
        if let Some(of) = self.open_finance {
            if connector.is_open_finance != of {
                return false;
            }
        }
        match &self.search {
            Some(q) if !q.trim().is_empty() => connector
                .name
                .to_lowercase()
                .contains(&q.trim().to_lowercase()),
            _ => true,
        }
    }

    pub fn apply<'a>(&self, connectors: &'a [Connector]) -> Vec<&'a Connector> {
        connectors.iter().filter(|c| self.matches(c)).collect()
    }
}

/// One linkage between the user and an institution ("item").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    #[serde(default)]
    pub pluggy_item_id: Option<String>,
    #[serde(default)]
    pub connector: Option<Connector>,
    pub status: ItemStatus,
    #[serde(default)]
    pub execution_status: Option<String>,
    #[serde(default)]
    pub last_successful_update: Option<DateTime<Utc>>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl Item {
    pub fn institution_name(&self) -> &str {
        self.connector
            .as_ref()
            .map(|c| c.name.as_str())
            .unwrap_or("Banco")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountType {
    Checking,
    Savings,
    CreditCard,
    Investment,
    Loan,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    #[serde(default, alias = "item")]
    pub item_id: Option<String>,
    #[serde(rename = "type")]
    pub account_type: AccountType,
    #[serde(default)]
    pub subtype: Option<String>,
    pub name: String,
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub number: Option<String>,
    pub balance: Decimal,
    #[serde(default = "default_currency")]
    pub currency_code: String,
    #[serde(default)]
    pub institution_name: Option<String>,
    #[serde(default)]
    pub last_synced_at: Option<DateTime<Utc>>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

impl Account {
    pub fn display_name(&self) -> &str {
        self.nickname.as_deref().unwrap_or(&self.name)
    }

    pub fn is_credit_card(&self) -> bool {
        self.account_type == AccountType::CreditCard
    }

    /// Credit card balances are stored negative and shown as the positive
    /// amount of the current bill.
    pub fn display_balance(&self) -> Decimal {
        if self.is_credit_card() {
            -self.balance
        } else {
            self.balance
        }
    }

    pub fn masked_number(&self) -> Option<String> {
        self.number.as_ref().map(|n| {
            let digits: Vec<char> = n.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
            let tail: String = digits[digits.len().saturating_sub(4)..].iter().collect();
            format!("•••• {}", tail)
        })
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AccountUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    Credit,
    Debit,
}

/// A ledger entry. Amount, date and type are external facts and never
/// change locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    #[serde(alias = "account")]
    pub account_id: String,
    #[serde(rename = "type")]
    pub transaction_type: TransactionType,
    pub amount: Decimal,
    pub description: String,
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub category_name: Option<String>,
    #[serde(default)]
    pub merchant_name: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Transaction {
    pub fn is_income(&self) -> bool {
        self.transaction_type == TransactionType::Credit
    }

    pub fn day(&self) -> NaiveDate {
        self.date.date_naive()
    }
}

/// The only mutable fields of a transaction.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TransactionUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionFilters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_type: Option<TransactionType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_amount: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_amount: Option<Decimal>,
}

impl TransactionFilters {
    /// Overlays the fields set in `update` on top of the current filters.
    pub fn merge(&mut self, update: TransactionFilters) {
        macro_rules! overlay {
            ($($field:ident),*) => {
                $(if update.$field.is_some() { self.$field = update.$field; })*
            };
        }
        overlay!(
            account_id,
            category_id,
            transaction_type,
            start_date,
            end_date,
            search,
            min_amount,
            max_amount
        );
    }

    pub fn to_query(&self) -> Vec<(&'static str, String)> {
        let mut query = vec![];
        if let Some(v) = &self.account_id {
            query.push(("account_id", v.clone()));
        }
        if let Some(v) = &self.category_id {
            query.push(("category_id", v.clone()));
        }
        if let Some(v) = self.transaction_type {
            let v = match v {
                TransactionType::Credit => "credit",
                TransactionType::Debit => "debit",
            };
            query.push(("type", v.to_string()));
        }
        if let Some(v) = self.start_date {
            query.push(("start_date", v.format("%Y-%m-%d").to_string()));
        }
        if let Some(v) = self.end_date {
            query.push(("end_date", v.format("%Y-%m-%d").to_string()));
        }
        if let Some(v) = &self.search {
            query.push(("search", v.clone()));
        }
        if let Some(v) = self.min_amount {
            query.push(("min_amount", v.to_string()));
        }
        if let Some(v) = self.max_amount {
            query.push(("max_amount", v.to_string()));
        }
        query
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CategoryType {
    Income,
    Expense,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(rename = "type")]
    pub category_type: CategoryType,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub is_system: bool,
    #[serde(default)]
    pub order: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct CategoryInput {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(rename = "type")]
    pub category_type: CategoryType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_active: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order: Option<i32>,
}

/// A page of results in the backend's list format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub count: u64,
    #[serde(default)]
    pub next: Option<String>,
    #[serde(default)]
    pub previous: Option<String>,
    pub results: Vec<T>,
}

/// List endpoints answer either a bare array or a page.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ListResponse<T> {
    Page(Page<T>),
    List(Vec<T>),
}

impl<T> ListResponse<T> {
    pub fn into_vec(self) -> Vec<T> {
        match self {
            ListResponse::Page(page) => page.results,
            ListResponse::List(list) => list,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub page: u32,
    pub page_size: u32,
    pub total_count: u64,
    pub total_pages: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: 50,
            total_count: 0,
            total_pages: 0,
        }
    }
}

impl Pagination {
    pub fn with_total(self, total_count: u64) -> Self {
        let size = u64::from(self.page_size.max(1));
        Self {
            total_count,
            total_pages: ((total_count + size - 1) / size) as u32,
            ..self
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub transactions_synced: u32,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub reconnection_required: bool,
    #[serde(default)]
    pub item_id: Option<String>,
}

impl SyncResponse {
    pub fn requires_reconnect(&self) -> bool {
        self.reconnection_required
            || matches!(
                self.error_code.as_deref(),
                Some("invalid_credentials") | Some("mfa_required")
            )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectToken {
    pub connect_token: String,
    #[serde(default)]
    pub sandbox_mode: bool,
    #[serde(default)]
    pub item_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallbackResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub item_id: Option<String>,
    #[serde(default)]
    pub accounts: Vec<Account>,
    #[serde(default)]
    pub created: bool,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountStatus {
    pub account_id: String,
    #[serde(default)]
    pub item_id: Option<String>,
    pub item_status: ItemStatus,
    #[serde(default)]
    pub requires_action: bool,
    #[serde(default)]
    pub last_update: Option<DateTime<Utc>>,
    #[serde(default)]
    pub message: Option<String>,
}

/// An item the aggregator reports as waiting for the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitingItem {
    pub id: String,
    pub status: ItemStatus,
    #[serde(default, alias = "institution_name")]
    pub connector_name: Option<String>,
    #[serde(default)]
    pub status_detail: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BulkCategorizeResponse {
    #[serde(default)]
    pub updated: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Csv,
    Xlsx,
}

impl ExportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Xlsx => "xlsx",
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_currency() -> String {
    "BRL".to_string()
}
