//! In-memory fakes shared by unit tests.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use pluggy_connect::{ConnectEvent, ConnectWidget, EventReceiver, WidgetConfig, WidgetError};
use rust_decimal::Decimal;
use tokio::sync::mpsc;

use crate::api::{ApiError, BankingApi, Result};
use crate::model::*;

pub fn account(id: &str, item_id: &str) -> Account {
    Account {
        id: id.to_string(),
        item_id: Some(item_id.to_string()),
        account_type: AccountType::Checking,
        subtype: None,
        name: format!("Conta {}", id),
        nickname: None,
        number: Some(format!("0001-{}", id)),
        balance: Decimal::new(100_000, 2),
        currency_code: "BRL".to_string(),
        institution_name: Some("Banco Inter".to_string()),
        last_synced_at: None,
        is_active: true,
    }
}

pub fn item(id: &str, status: ItemStatus) -> Item {
    Item {
        id: id.to_string(),
        pluggy_item_id: None,
        connector: None,
        status,
        execution_status: None,
        last_successful_update: None,
        is_active: true,
        error_code: None,
        error_message: None,
    }
}

pub fn transaction(id: &str, account_id: &str, amount: Decimal) -> Transaction {
    Transaction {
        id: id.to_string(),
        account_id: account_id.to_string(),
        transaction_type: if amount.is_sign_negative() {
            TransactionType::Debit
        } else {
            TransactionType::Credit
        },
        amount,
        description: format!("Lançamento {}", id),
        date: Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap(),
        category: None,
        category_name: None,
        merchant_name: None,
        notes: None,
        tags: vec![],
    }
}

pub fn category(id: &str, name: &str) -> Category {
    Category {
        id: id.to_string(),
        name: name.to_string(),
        color: None,
        icon: None,
        category_type: CategoryType::Expense,
        is_active: true,
        is_system: false,
        order: 0,
    }
}

pub fn connector(id: i64, name: &str) -> Connector {
    Connector {
        id,
        pluggy_id: Some(id),
        name: name.to_string(),
        institution_url: None,
        country: Some("BR".to_string()),
        primary_color: None,
        logo_url: None,
        connector_type: Some("PERSONAL_BANK".to_string()),
        has_mfa: false,
        is_open_finance: false,
        is_sandbox: false,
        is_active: true,
        products: vec![],
    }
}

#[derive(Default)]
struct FakeState {
    connectors: Vec<Connector>,
    items: Vec<Item>,
    accounts: Vec<Account>,
    transactions: Vec<Transaction>,
    categories: Vec<Category>,
    waiting_items: Vec<WaitingItem>,
    connect_token: Option<ConnectToken>,
    sync_results: HashMap<String, std::result::Result<SyncResponse, ApiError>>,
    sync_delay: Option<Duration>,
    failures: HashMap<&'static str, ApiError>,
    calls: HashMap<&'static str, usize>,
    transactions_queries: Vec<(TransactionFilters, u32)>,
    callbacks: Vec<String>,
    token_requests: Vec<Option<String>>,
    next_id: u32,
}

/// Scriptable [`BankingApi`]. Each method counts its calls and returns the
/// configured data, or an error queued with [`FakeApi::fail_next`].
#[derive(Default)]
pub struct FakeApi {
    state: Mutex<FakeState>,
}

impl FakeApi {
    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    fn enter(&self, name: &'static str) -> Result<()> {
        let mut state = self.state();
        *state.calls.entry(name).or_insert(0) += 1;
        match state.failures.remove(name) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn fail_next(&self, name: &'static str, err: ApiError) {
        self.state().failures.insert(name, err);
    }

    pub fn calls(&self, name: &str) -> usize {
        self.state().calls.get(name).copied().unwrap_or(0)
    }

    pub fn set_connectors(&self, connectors: Vec<Connector>) {
        self.state().connectors = connectors;
    }

    pub fn set_items(&self, items: Vec<Item>) {
        self.state().items = items;
    }

    pub fn set_accounts(&self, accounts: Vec<Account>) {
        self.state().accounts = accounts;
    }

    pub fn set_transactions(&self, transactions: Vec<Transaction>) {
        self.state().transactions = transactions;
    }

    pub fn set_categories(&self, categories: Vec<Category>) {
        self.state().categories = categories;
    }

    pub fn set_waiting_items(&self, items: Vec<WaitingItem>) {
        self.state().waiting_items = items;
    }

    pub fn set_connect_token(&self, token: ConnectToken) {
        self.state().connect_token = Some(token);
    }

    pub fn set_sync_result(&self, account_id: &str, result: std::result::Result<SyncResponse, ApiError>) {
        self.state().sync_results.insert(account_id.to_string(), result);
    }

    pub fn set_sync_delay(&self, delay: Duration) {
        self.state().sync_delay = Some(delay);
    }

    pub fn last_transactions_query(&self) -> Option<(TransactionFilters, u32)> {
        self.state().transactions_queries.last().cloned()
    }

    pub fn callbacks(&self) -> Vec<String> {
        self.state().callbacks.clone()
    }

    pub fn token_requests(&self) -> Vec<Option<String>> {
        self.state().token_requests.clone()
    }

    fn next_id(&self, prefix: &str) -> String {
        let mut state = self.state();
        state.next_id += 1;
        format!("{}_{}", prefix, state.next_id)
    }
}

#[async_trait]
impl BankingApi for FakeApi {
    async fn connectors(&self) -> Result<Vec<Connector>> {
        self.enter("connectors")?;
        Ok(self.state().connectors.clone())
    }

    async fn items(&self) -> Result<Vec<Item>> {
        self.enter("items")?;
        Ok(self.state().items.clone())
    }

    async fn item(&self, id: &str) -> Result<Item> {
        self.enter("item")?;
        let found = self.state().items.iter().find(|i| i.id == id).cloned();
        found.ok_or_else(|| ApiError::Decode(format!("no item {}", id)))
    }

    async fn disconnect_item(&self, _id: &str) -> Result<()> {
        self.enter("disconnect_item")
    }

    async fn accounts(&self) -> Result<Vec<Account>> {
        self.enter("accounts")?;
        Ok(self.state().accounts.clone())
    }

    async fn account(&self, id: &str) -> Result<Account> {
        self.enter("account")?;
        let found = self.state().accounts.iter().find(|a| a.id == id).cloned();
        found.ok_or_else(|| ApiError::Decode(format!("no account {}", id)))
    }

    async fn update_account(&self, id: &str, update: &AccountUpdate) -> Result<Account> {
        self.enter("update_account")?;
        let mut account = self.account(id).await?;
        if let Some(nickname) = &update.nickname {
            account.nickname = Some(nickname.clone());
        }
        if let Some(active) = update.is_active {
            account.is_active = active;
        }
        Ok(account)
    }

    async fn sync_account(&self, id: &str) -> Result<SyncResponse> {
        self.enter("sync_account")?;
        let (delay, result) = {
            let state = self.state();
            (state.sync_delay, state.sync_results.get(id).cloned())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        result.unwrap_or_else(|| {
            Ok(SyncResponse {
                success: true,
                ..SyncResponse::default()
            })
        })
    }

    async fn disconnect_account(&self, _id: &str) -> Result<()> {
        self.enter("disconnect_account")
    }

    async fn account_status(&self, id: &str) -> Result<AccountStatus> {
        self.enter("account_status")?;
        Ok(AccountStatus {
            account_id: id.to_string(),
            item_id: None,
            item_status: ItemStatus::Updated,
            requires_action: false,
            last_update: None,
            message: None,
        })
    }

    async fn waiting_items(&self) -> Result<Vec<WaitingItem>> {
        self.enter("waiting_items")?;
        Ok(self.state().waiting_items.clone())
    }

    async fn transactions(
        &self,
        filters: &TransactionFilters,
        page: u32,
        _page_size: u32,
    ) -> Result<Page<Transaction>> {
        self.enter("transactions")?;
        let mut state = self.state();
        state.transactions_queries.push((filters.clone(), page));
        Ok(Page {
            count: state.transactions.len() as u64,
            next: None,
            previous: None,
            results: state.transactions.clone(),
        })
    }

    async fn update_transaction(&self, id: &str, update: &TransactionUpdate) -> Result<Transaction> {
        self.enter("update_transaction")?;
        let found = self.state().transactions.iter().find(|t| t.id == id).cloned();
        let mut txn = found.ok_or_else(|| ApiError::Decode(format!("no transaction {}", id)))?;
        if let Some(category) = &update.category {
            txn.category = category.clone();
        }
        if let Some(notes) = &update.notes {
            txn.notes = Some(notes.clone());
        }
        if let Some(tags) = &update.tags {
            txn.tags = tags.clone();
        }
        Ok(txn)
    }

    async fn bulk_categorize(&self, ids: &[String], _category_id: &str) -> Result<BulkCategorizeResponse> {
        self.enter("bulk_categorize")?;
        Ok(BulkCategorizeResponse {
            updated: ids.len() as u32,
        })
    }

    async fn export_transactions(&self, _filters: &TransactionFilters, format: ExportFormat) -> Result<Vec<u8>> {
        self.enter("export_transactions")?;
        Ok(format!("export.{}", format.as_str()).into_bytes())
    }

    async fn categories(&self) -> Result<Vec<Category>> {
        self.enter("categories")?;
        Ok(self.state().categories.clone())
    }

    async fn create_category(&self, input: &CategoryInput) -> Result<Category> {
        self.enter("create_category")?;
        let mut created = category(&self.next_id("cat"), &input.name);
        created.category_type = input.category_type;
        created.order = input.order.unwrap_or_default();
        self.state().categories.push(created.clone());
        Ok(created)
    }

    async fn update_category(&self, id: &str, input: &CategoryInput) -> Result<Category> {
        self.enter("update_category")?;
        let mut updated = category(id, &input.name);
        updated.category_type = input.category_type;
        Ok(updated)
    }

    async fn delete_category(&self, id: &str) -> Result<()> {
        self.enter("delete_category")?;
        self.state().categories.retain(|c| c.id != id);
        Ok(())
    }

    async fn connect_token(&self, item_id: Option<&str>) -> Result<ConnectToken> {
        self.enter("connect_token")?;
        let mut state = self.state();
        state.token_requests.push(item_id.map(str::to_string));
        Ok(state.connect_token.clone().unwrap_or(ConnectToken {
            connect_token: "connect-token".to_string(),
            sandbox_mode: false,
            item_id: None,
        }))
    }

    async fn pluggy_callback(&self, item_id: &str) -> Result<CallbackResponse> {
        self.enter("pluggy_callback")?;
        self.state().callbacks.push(item_id.to_string());
        Ok(CallbackResponse {
            success: true,
            item_id: Some(item_id.to_string()),
            ..CallbackResponse::default()
        })
    }
}

#[derive(Default)]
struct WidgetState {
    configs: Vec<WidgetConfig>,
    sender: Option<mpsc::UnboundedSender<ConnectEvent>>,
    active: bool,
    closed: usize,
    fail_open: bool,
}

/// Widget double that records configurations and lets tests inject callbacks.
#[derive(Default)]
pub struct FakeWidget {
    state: Mutex<WidgetState>,
}

impl FakeWidget {
    fn state(&self) -> MutexGuard<'_, WidgetState> {
        self.state.lock().unwrap()
    }

    pub fn emit(&self, event: ConnectEvent) {
        if let Some(sender) = &self.state().sender {
            sender.send(event).unwrap();
        }
    }

    /// Ends the event stream the way a timed out session does, without
    /// closing the session.
    pub fn end_stream(&self) {
        self.state().sender = None;
    }

    pub fn fail_open(&self) {
        self.state().fail_open = true;
    }

    pub fn last_config(&self) -> Option<WidgetConfig> {
        self.state().configs.last().cloned()
    }

    pub fn opened(&self) -> usize {
        self.state().configs.len()
    }

    pub fn closed(&self) -> usize {
        self.state().closed
    }
}

#[async_trait]
impl ConnectWidget for FakeWidget {
    async fn open(&self, config: WidgetConfig) -> std::result::Result<EventReceiver, WidgetError> {
        let mut state = self.state();
        if state.fail_open {
            return Err(WidgetError::SdkLoad("unavailable".into()));
        }
        if state.active {
            return Err(WidgetError::SessionOpen);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.configs.push(config);
        state.sender = Some(tx);
        state.active = true;
        Ok(rx)
    }

    async fn close(&self) {
        let mut state = self.state();
        state.sender = None;
        if state.active {
            state.active = false;
            state.closed += 1;
        }
    }

    fn is_sdk_loaded(&self) -> bool {
        true
    }
}
