//! Single source of truth for banking collections.
//!
//! Every mutation goes through a [`BankingStore`] method; each new state is
//! published on a watch channel so consumers can re-render on change.

mod scope;

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::api::{ApiError, BankingApi};
use crate::error::error_display;
use crate::model::*;

pub use scope::Scope;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("sync failed: {0}")]
    Sync(String),
}

impl StoreError {
    pub fn requires_reconnection(&self) -> bool {
        matches!(self, StoreError::Api(err) if err.requires_reconnection())
    }
}

pub type Result<T> = ::std::result::Result<T, StoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    Connectors,
    Items,
    Accounts,
    Transactions,
    Categories,
}

/// An account whose last sync failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncError {
    pub account_id: String,
    pub item_id: Option<String>,
    pub code: Option<String>,
    pub message: String,
    pub requires_reconnect: bool,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Synced { transactions: u32 },
    ReconnectRequired { item_id: Option<String> },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectModal {
    pub open: bool,
    /// Set when the modal repairs an existing item.
    pub item_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct BankingState {
    pub connectors: Vec<Connector>,
    pub items: Vec<Item>,
    pub accounts: Vec<Account>,
    pub transactions: Vec<Transaction>,
    pub categories: Vec<Category>,

    pub selected_account_id: Option<String>,
    pub transaction_filters: TransactionFilters,
    pub connect_modal: ConnectModal,

    pub loading: HashSet<Resource>,
    pub errors: HashMap<Resource, String>,
    pub syncing_accounts: HashSet<String>,
    pub sync_errors: Vec<SyncError>,
    pub pagination: Pagination,
}

impl BankingState {
    pub fn is_loading(&self, resource: Resource) -> bool {
        self.loading.contains(&resource)
    }

    pub fn error(&self, resource: Resource) -> Option<&str> {
        self.errors.get(&resource).map(String::as_str)
    }

    pub fn is_syncing(&self, account_id: &str) -> bool {
        self.syncing_accounts.contains(account_id)
    }

    pub fn sync_error(&self, account_id: &str) -> Option<&SyncError> {
        self.sync_errors.iter().find(|e| e.account_id == account_id)
    }

    pub fn account(&self, id: &str) -> Option<&Account> {
        self.accounts.iter().find(|a| a.id == id)
    }

    pub fn item(&self, id: &str) -> Option<&Item> {
        self.items.iter().find(|i| i.id == id)
    }

    pub fn accounts_for_item(&self, item_id: &str) -> Vec<&Account> {
        self.accounts
            .iter()
            .filter(|a| a.item_id.as_deref() == Some(item_id))
            .collect()
    }

    fn record_sync_error(&mut self, error: SyncError) {
        self.sync_errors.retain(|e| e.account_id != error.account_id);
        self.sync_errors.push(error);
    }
}

/// Removes an account from the syncing set however the sync ends.
struct Syncing<'a> {
    state: &'a watch::Sender<BankingState>,
    account_id: &'a str,
}

impl Drop for Syncing<'_> {
    fn drop(&mut self) {
        self.state.send_modify(|s| {
            s.syncing_accounts.remove(self.account_id);
        });
    }
}

pub struct BankingStore {
    api: Arc<dyn BankingApi>,
    state: watch::Sender<BankingState>,
    generations: Mutex<HashMap<Resource, u64>>,
}

impl BankingStore {
    pub fn new(api: Arc<dyn BankingApi>) -> Self {
        let (state, _) = watch::channel(BankingState::default());
        Self {
            api,
            state,
            generations: Mutex::new(HashMap::new()),
        }
    }

    pub fn api(&self) -> &Arc<dyn BankingApi> {
        &self.api
    }

    pub fn subscribe(&self) -> watch::Receiver<BankingState> {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> BankingState {
        self.state.borrow().clone()
    }

    pub fn read<R>(&self, f: impl FnOnce(&BankingState) -> R) -> R {
        f(&self.state.borrow())
    }

    fn modify(&self, f: impl FnOnce(&mut BankingState)) {
        self.state.send_modify(f);
    }

    fn begin(&self, resource: Resource) -> u64 {
        let ticket = {
            let mut generations = self
                .generations
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let gen = generations.entry(resource).or_insert(0);
            *gen += 1;
            *gen
        };

        self.modify(|s| {
            s.loading.insert(resource);
            s.errors.remove(&resource);
        });
        ticket
    }

    fn is_current(&self, resource: Resource, ticket: u64) -> bool {
        self.generations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&resource)
            .copied()
            == Some(ticket)
    }

    /// Runs a fetch and replaces the collection with its result, unless a
    /// newer fetch of the same resource started meanwhile or `scope` closed.
    async fn load<T, Fut>(
        &self,
        resource: Resource,
        scope: &Scope,
        fetch: Fut,
        apply: impl FnOnce(&mut BankingState, T),
    ) -> Result<()>
    where
        Fut: Future<Output = ::std::result::Result<T, ApiError>>,
    {
        let ticket = self.begin(resource);
        let result = fetch.await;

        if !self.is_current(resource, ticket) {
            debug!(?resource, "discarding superseded response");
            return Ok(());
        }

        if !scope.is_open() {
            debug!(?resource, "discarding response for closed scope");
            self.modify(|s| {
                s.loading.remove(&resource);
            });
            return Ok(());
        }

        match result {
            Ok(value) => {
                self.modify(|s| {
                    apply(s, value);
                    s.loading.remove(&resource);
                });
                Ok(())
            }
            Err(err) => {
                warn!(?resource, error = %err, "fetch failed");
                let message = error_display(&err.banking_error()).message;
                self.modify(|s| {
                    s.loading.remove(&resource);
                    s.errors.insert(resource, message);
                });
                Err(err.into())
            }
        }
    }

    pub async fn fetch_connectors(&self) -> Result<()> {
        self.fetch_connectors_for(&Scope::root()).await
    }

    pub async fn fetch_connectors_for(&self, scope: &Scope) -> Result<()> {
        self.load(Resource::Connectors, scope, self.api.connectors(), |s, v| {
            s.connectors = v
        })
        .await
    }

    pub async fn fetch_items(&self) -> Result<()> {
        self.fetch_items_for(&Scope::root()).await
    }

    pub async fn fetch_items_for(&self, scope: &Scope) -> Result<()> {
        self.load(Resource::Items, scope, self.api.items(), |s, v| s.items = v)
            .await
    }

    pub async fn fetch_accounts(&self) -> Result<()> {
        self.fetch_accounts_for(&Scope::root()).await
    }

    pub async fn fetch_accounts_for(&self, scope: &Scope) -> Result<()> {
        self.load(Resource::Accounts, scope, self.api.accounts(), |s, v| {
            s.accounts = v
        })
        .await
    }

    pub async fn fetch_categories(&self) -> Result<()> {
        self.fetch_categories_for(&Scope::root()).await
    }

    pub async fn fetch_categories_for(&self, scope: &Scope) -> Result<()> {
        self.load(Resource::Categories, scope, self.api.categories(), |s, mut v| {
            v.sort_by_key(|c| c.order);
            s.categories = v
        })
        .await
    }

    pub async fn fetch_transactions(&self) -> Result<()> {
        self.fetch_transactions_for(&Scope::root()).await
    }

    pub async fn fetch_transactions_for(&self, scope: &Scope) -> Result<()> {
        let (filters, pagination) =
            self.read(|s| (s.transaction_filters.clone(), s.pagination));

        let api = Arc::clone(&self.api);
        let fetch = async move {
            api.transactions(&filters, pagination.page, pagination.page_size)
                .await
        };

        self.load(Resource::Transactions, scope, fetch, move |s, page| {
            s.pagination = pagination.with_total(page.count);
            s.transactions = page.results;
        })
        .await
    }

    pub async fn fetch_transactions_page(&self, page: u32) -> Result<()> {
        self.modify(|s| s.pagination.page = page.max(1));
        self.fetch_transactions().await
    }

    /// Syncs one account. A sync that needs the user to reconnect is
    /// recorded in `sync_errors` and reported as an outcome, not an error.
    #[tracing::instrument(skip(self))]
    pub async fn sync_account(&self, account_id: &str) -> Result<SyncOutcome> {
        self.modify(|s| {
            s.syncing_accounts.insert(account_id.to_string());
        });
        let _syncing = Syncing {
            state: &self.state,
            account_id,
        };

        let item_id = self.read(|s| s.account(account_id).and_then(|a| a.item_id.clone()));

        match self.api.sync_account(account_id).await {
            Ok(res) if res.requires_reconnect() => {
                info!(account = account_id, "sync requires reconnection");
                let item_id = res.item_id.clone().or(item_id);
                self.modify(|s| {
                    s.record_sync_error(SyncError {
                        account_id: account_id.to_string(),
                        item_id: item_id.clone(),
                        code: res.error_code.clone(),
                        message: res
                            .message
                            .clone()
                            .unwrap_or_else(|| "Reconexão necessária".to_string()),
                        requires_reconnect: true,
                        occurred_at: Utc::now(),
                    })
                });
                Ok(SyncOutcome::ReconnectRequired { item_id })
            }
            Ok(res) if !res.success => {
                let message = res
                    .message
                    .clone()
                    .unwrap_or_else(|| "Erro ao sincronizar conta".to_string());
                self.modify(|s| {
                    s.record_sync_error(SyncError {
                        account_id: account_id.to_string(),
                        item_id,
                        code: res.error_code.clone(),
                        message: message.clone(),
                        requires_reconnect: false,
                        occurred_at: Utc::now(),
                    })
                });
                Err(StoreError::Sync(message))
            }
            Ok(res) => {
                info!(
                    account = account_id,
                    transactions = res.transactions_synced,
                    "account synced"
                );
                self.modify(|s| s.sync_errors.retain(|e| e.account_id != account_id));

                if res.transactions_synced > 0 {
                    let (accounts, transactions) =
                        tokio::join!(self.fetch_accounts(), self.fetch_transactions());
                    if let Err(err) = accounts.and(transactions) {
                        warn!(error = %err, "refresh after sync failed");
                    }
                }
                Ok(SyncOutcome::Synced {
                    transactions: res.transactions_synced,
                })
            }
            Err(err) => {
                let banking = err.banking_error();
                let reconnect = err.requires_reconnection();
                self.modify(|s| {
                    s.record_sync_error(SyncError {
                        account_id: account_id.to_string(),
                        item_id: banking.item_id.clone().or(item_id.clone()),
                        code: Some(banking.code.clone()),
                        message: error_display(&banking).message,
                        requires_reconnect: reconnect,
                        occurred_at: Utc::now(),
                    })
                });

                if reconnect {
                    Ok(SyncOutcome::ReconnectRequired {
                        item_id: banking.item_id.or(item_id),
                    })
                } else {
                    Err(err.into())
                }
            }
        }
    }

    pub fn clear_sync_error(&self, account_id: &str) {
        self.modify(|s| s.sync_errors.retain(|e| e.account_id != account_id));
    }

    pub fn clear_sync_errors(&self) {
        self.modify(|s| s.sync_errors.clear());
    }

    /// Removes the item and its accounts right away, restoring them if the
    /// backend refuses the disconnect.
    #[tracing::instrument(skip(self))]
    pub async fn disconnect_item(&self, item_id: &str) -> Result<()> {
        let mut removed_item = None;
        let mut removed_accounts = vec![];
        self.modify(|s| {
            if let Some(pos) = s.items.iter().position(|i| i.id == item_id) {
                removed_item = Some((pos, s.items.remove(pos)));
            }
            let (gone, kept): (Vec<_>, Vec<_>) = s
                .accounts
                .drain(..)
                .partition(|a| a.item_id.as_deref() == Some(item_id));
            s.accounts = kept;
            removed_accounts = gone;
        });

        match self.api.disconnect_item(item_id).await {
            Ok(()) => {
                info!(item = item_id, "item disconnected");
                self.forget_accounts(removed_accounts.into_iter().map(|a| a.id).collect());
                Ok(())
            }
            Err(err) => {
                warn!(item = item_id, error = %err, "disconnect failed, restoring item");
                self.modify(|s| {
                    if let Some((pos, item)) = removed_item {
                        if s.item(&item.id).is_none() {
                            let pos = pos.min(s.items.len());
                            s.items.insert(pos, item);
                        }
                    }
                    for account in removed_accounts {
                        if s.account(&account.id).is_none() {
                            s.accounts.push(account);
                        }
                    }
                });
                Err(err.into())
            }
        }
    }

    /// Removes a single account right away, restoring it if the backend
    /// refuses the disconnect.
    #[tracing::instrument(skip(self))]
    pub async fn disconnect_account(&self, account_id: &str) -> Result<()> {
        let mut removed = None;
        self.modify(|s| {
            if let Some(pos) = s.accounts.iter().position(|a| a.id == account_id) {
                removed = Some((pos, s.accounts.remove(pos)));
            }
        });

        match self.api.disconnect_account(account_id).await {
            Ok(()) => {
                info!(account = account_id, "account disconnected");
                self.forget_accounts(HashSet::from([account_id.to_string()]));
                Ok(())
            }
            Err(err) => {
                warn!(account = account_id, error = %err, "disconnect failed, restoring account");
                self.modify(|s| {
                    if let Some((pos, account)) = removed {
                        if s.account(&account.id).is_none() {
                            let pos = pos.min(s.accounts.len());
                            s.accounts.insert(pos, account);
                        }
                    }
                });
                Err(err.into())
            }
        }
    }

    fn forget_accounts(&self, ids: HashSet<String>) {
        self.modify(|s| {
            s.sync_errors.retain(|e| !ids.contains(&e.account_id));
            s.transactions.retain(|t| !ids.contains(&t.account_id));
            if s
                .selected_account_id
                .as_ref()
                .map_or(false, |id| ids.contains(id))
            {
                s.selected_account_id = None;
            }
        });
    }

    /// Patches only the `category` of the given transactions once the
    /// backend confirms, without refetching.
    pub async fn bulk_categorize_transactions(&self, ids: &[String], category_id: &str) -> Result<u32> {
        let res = self.api.bulk_categorize(ids, category_id).await?;
        let targets: HashSet<&str> = ids.iter().map(String::as_str).collect();

        self.modify(|s| {
            for txn in s
                .transactions
                .iter_mut()
                .filter(|t| targets.contains(t.id.as_str()))
            {
                txn.category = Some(category_id.to_string());
            }
        });
        Ok(res.updated)
    }

    pub async fn update_transaction(&self, id: &str, update: &TransactionUpdate) -> Result<Transaction> {
        let updated = self.api.update_transaction(id, update).await?;
        self.modify(|s| {
            if let Some(txn) = s.transactions.iter_mut().find(|t| t.id == id) {
                txn.category = updated.category.clone();
                txn.category_name = updated.category_name.clone();
                txn.notes = updated.notes.clone();
                txn.tags = updated.tags.clone();
            }
        });
        Ok(updated)
    }

    pub async fn export_transactions(&self, format: ExportFormat) -> Result<Vec<u8>> {
        let filters = self.read(|s| s.transaction_filters.clone());
        Ok(self.api.export_transactions(&filters, format).await?)
    }

    pub async fn update_account(&self, id: &str, update: &AccountUpdate) -> Result<Account> {
        let account = self.api.update_account(id, update).await?;
        self.modify(|s| {
            if let Some(existing) = s.accounts.iter_mut().find(|a| a.id == id) {
                *existing = account.clone();
            }
        });
        Ok(account)
    }

    /// Merges `update` into the filters and reloads page one.
    pub async fn set_transaction_filters(&self, update: TransactionFilters) -> Result<()> {
        self.modify(|s| {
            s.transaction_filters.merge(update);
            s.pagination.page = 1;
        });
        self.fetch_transactions().await
    }

    pub async fn clear_transaction_filters(&self) -> Result<()> {
        self.modify(|s| {
            s.transaction_filters = TransactionFilters::default();
            s.selected_account_id = None;
            s.pagination.page = 1;
        });
        self.fetch_transactions().await
    }

    pub async fn select_account(&self, account_id: Option<&str>) -> Result<()> {
        self.modify(|s| s.selected_account_id = account_id.map(str::to_string));

        match account_id {
            Some(id) => {
                self.set_transaction_filters(TransactionFilters {
                    account_id: Some(id.to_string()),
                    ..TransactionFilters::default()
                })
                .await
            }
            None => Ok(()),
        }
    }

    pub async fn create_category(&self, input: &CategoryInput) -> Result<Category> {
        let category = self.api.create_category(input).await?;
        self.modify(|s| {
            s.categories.push(category.clone());
            s.categories.sort_by_key(|c| c.order);
        });
        Ok(category)
    }

    pub async fn update_category(&self, id: &str, input: &CategoryInput) -> Result<Category> {
        let category = self.api.update_category(id, input).await?;
        self.modify(|s| {
            match s.categories.iter().position(|c| c.id == id) {
                Some(pos) => s.categories[pos] = category.clone(),
                None => s.categories.push(category.clone()),
            }
            s.categories.sort_by_key(|c| c.order);
        });
        Ok(category)
    }

    pub async fn delete_category(&self, id: &str) -> Result<()> {
        self.api.delete_category(id).await?;
        self.modify(|s| {
            s.categories.retain(|c| c.id != id);
            for txn in s.transactions.iter_mut().filter(|t| t.category.as_deref() == Some(id)) {
                txn.category = None;
                txn.category_name = None;
            }
        });
        Ok(())
    }

    /// Applies a status observed out of band (poller, push channel).
    pub fn apply_item_status(&self, item_id: &str, status: ItemStatus) {
        self.modify(|s| {
            if let Some(item) = s.items.iter_mut().find(|i| i.id == item_id) {
                debug!(item = item_id, from = %item.status, to = %status, "item status changed");
                item.status = status;
            }
        });
    }

    /// Reloads one item, replacing the local copy or adding it when unseen.
    pub async fn refresh_item(&self, item_id: &str) -> Result<Item> {
        let item = self.api.item(item_id).await?;
        self.modify(|s| match s.items.iter_mut().find(|i| i.id == item.id) {
            Some(existing) => *existing = item.clone(),
            None => s.items.push(item.clone()),
        });
        Ok(item)
    }

    pub async fn refresh_account_status(&self, account_id: &str) -> Result<AccountStatus> {
        let status = self.api.account_status(account_id).await?;
        let item_id = status
            .item_id
            .clone()
            .or_else(|| self.read(|s| s.account(account_id).and_then(|a| a.item_id.clone())));

        match item_id {
            Some(item_id) => self.apply_item_status(&item_id, status.item_status.clone()),
            None => debug!(account = account_id, "status without a known item"),
        }
        Ok(status)
    }

    pub fn open_connect_modal(&self, item_id: Option<&str>) {
        self.modify(|s| {
            s.connect_modal = ConnectModal {
                open: true,
                item_id: item_id.map(str::to_string),
            }
        });
    }

    pub fn close_connect_modal(&self) {
        self.modify(|s| s.connect_modal = ConnectModal::default());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rust_decimal_macros::dec;

    use crate::error::BankingError;
    use crate::testing::{account, category, item, transaction, FakeApi};

    fn store(api: &Arc<FakeApi>) -> BankingStore {
        BankingStore::new(api.clone())
    }

    #[tokio::test]
    async fn fetch_replaces_the_whole_collection() {
        let api = Arc::new(FakeApi::default());
        api.set_accounts(vec![account("1", "item_1"), account("2", "item_1")]);
        let store = store(&api);

        store.fetch_accounts().await.unwrap();
        assert_eq!(store.read(|s| s.accounts.len()), 2);

        api.set_accounts(vec![account("3", "item_2")]);
        store.fetch_accounts().await.unwrap();

        let ids: Vec<String> = store.read(|s| s.accounts.iter().map(|a| a.id.clone()).collect());
        assert_eq!(ids, vec!["3"]);
        assert!(!store.read(|s| s.is_loading(Resource::Accounts)));
    }

    #[tokio::test]
    async fn failed_fetch_keeps_previous_collection() {
        let api = Arc::new(FakeApi::default());
        api.set_items(vec![item("item_1", ItemStatus::Updated)]);
        let store = store(&api);
        store.fetch_items().await.unwrap();

        api.fail_next("items", ApiError::banking(BankingError::new("sync_error", "x")));
        assert!(store.fetch_items().await.is_err());

        store.read(|s| {
            assert_eq!(s.items.len(), 1);
            assert!(!s.is_loading(Resource::Items));
            assert!(s.error(Resource::Items).is_some());
        });

        store.fetch_items().await.unwrap();
        assert!(store.read(|s| s.error(Resource::Items).is_none()));
    }

    #[tokio::test]
    async fn closed_scope_discards_response() {
        let api = Arc::new(FakeApi::default());
        api.set_accounts(vec![account("1", "item_1")]);
        let store = store(&api);

        let scope = Scope::new();
        scope.close();
        store.fetch_accounts_for(&scope).await.unwrap();

        store.read(|s| {
            assert!(s.accounts.is_empty());
            assert!(!s.is_loading(Resource::Accounts));
        });
    }

    #[tokio::test]
    async fn reconnect_sync_is_recorded_once() {
        let api = Arc::new(FakeApi::default());
        api.set_accounts(vec![account("1", "item_1")]);
        api.set_sync_result(
            "1",
            Err(ApiError::banking(BankingError::new(
                "invalid_credentials",
                "bad creds",
            ))),
        );
        let store = store(&api);
        store.fetch_accounts().await.unwrap();

        let outcome = store.sync_account("1").await.unwrap();
        assert_eq!(
            outcome,
            SyncOutcome::ReconnectRequired {
                item_id: Some("item_1".into())
            }
        );

        store.sync_account("1").await.unwrap();

        store.read(|s| {
            assert_eq!(s.sync_errors.len(), 1);
            assert_eq!(s.sync_errors[0].account_id, "1");
            assert!(s.sync_errors[0].requires_reconnect);
            assert!(!s.is_syncing("1"));
        });
    }

    #[tokio::test]
    async fn unexpected_sync_failure_is_rethrown() {
        let api = Arc::new(FakeApi::default());
        api.set_sync_result(
            "1",
            Err(ApiError::banking(BankingError::new("sync_error", "boom"))),
        );
        let store = store(&api);

        assert!(store.sync_account("1").await.is_err());

        store.read(|s| {
            let err = s.sync_error("1").unwrap();
            assert!(!err.requires_reconnect);
            assert!(!s.is_syncing("1"));
        });
    }

    #[tokio::test]
    async fn successful_sync_refreshes_data() {
        let api = Arc::new(FakeApi::default());
        api.set_accounts(vec![account("1", "item_1")]);
        api.set_transactions(vec![transaction("t1", "1", dec!(10))]);
        api.set_sync_result(
            "1",
            Ok(SyncResponse {
                success: true,
                transactions_synced: 3,
                ..SyncResponse::default()
            }),
        );
        let store = store(&api);

        let outcome = store.sync_account("1").await.unwrap();

        assert_eq!(outcome, SyncOutcome::Synced { transactions: 3 });
        assert_eq!(api.calls("accounts"), 1);
        assert_eq!(api.calls("transactions"), 1);
        store.read(|s| {
            assert_eq!(s.transactions.len(), 1);
            assert!(s.syncing_accounts.is_empty());
        });
    }

    #[tokio::test]
    async fn syncing_flags_are_tracked_per_account() {
        let api = Arc::new(FakeApi::default());
        api.set_sync_delay(std::time::Duration::from_millis(20));
        let store = Arc::new(store(&api));
        let mut rx = store.subscribe();

        let a = tokio::spawn({
            let store = store.clone();
            async move { store.sync_account("1").await }
        });
        let b = tokio::spawn({
            let store = store.clone();
            async move { store.sync_account("2").await }
        });

        rx.wait_for(|s| s.syncing_accounts.len() == 2).await.unwrap();
        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        assert!(a.is_ok() && b.is_ok());
        assert!(store.read(|s| s.syncing_accounts.is_empty()));
    }

    #[tokio::test]
    async fn disconnect_removes_item_and_accounts() {
        let api = Arc::new(FakeApi::default());
        api.set_items(vec![item("item_1", ItemStatus::Updated), item("item_2", ItemStatus::Updated)]);
        api.set_accounts(vec![account("1", "item_1"), account("2", "item_2")]);
        let store = store(&api);
        store.fetch_items().await.unwrap();
        store.fetch_accounts().await.unwrap();

        store.disconnect_item("item_1").await.unwrap();

        store.read(|s| {
            assert!(s.item("item_1").is_none());
            assert!(s.account("1").is_none());
            assert!(s.account("2").is_some());
        });
    }

    #[tokio::test]
    async fn disconnect_account_drops_its_transactions() {
        let api = Arc::new(FakeApi::default());
        api.set_accounts(vec![account("1", "item_1"), account("2", "item_1")]);
        api.set_transactions(vec![transaction("t1", "1", dec!(-10)), transaction("t2", "2", dec!(-20))]);
        let store = store(&api);
        store.fetch_accounts().await.unwrap();
        store.fetch_transactions().await.unwrap();
        store.select_account(Some("1")).await.unwrap();

        store.disconnect_account("1").await.unwrap();

        store.read(|s| {
            assert!(s.account("1").is_none());
            assert!(s.account("2").is_some());
            assert!(s.transactions.iter().all(|t| t.account_id != "1"));
            assert_eq!(s.selected_account_id, None);
        });
    }

    #[tokio::test]
    async fn failed_account_disconnect_rolls_back() {
        let api = Arc::new(FakeApi::default());
        api.set_accounts(vec![account("1", "item_1"), account("2", "item_1")]);
        api.fail_next(
            "disconnect_account",
            ApiError::banking(BankingError::new("pluggy_connection_error", "down")),
        );
        let store = store(&api);
        store.fetch_accounts().await.unwrap();

        assert!(store.disconnect_account("1").await.is_err());

        let ids: Vec<String> = store.read(|s| s.accounts.iter().map(|a| a.id.clone()).collect());
        assert_eq!(ids, vec!["1", "2"]);
    }

    #[tokio::test]
    async fn refresh_item_replaces_the_local_copy() {
        let api = Arc::new(FakeApi::default());
        api.set_items(vec![item("item_1", ItemStatus::Updating)]);
        let store = store(&api);
        store.fetch_items().await.unwrap();

        api.set_items(vec![
            item("item_1", ItemStatus::LoginError),
            item("item_2", ItemStatus::Updated),
        ]);
        let refreshed = store.refresh_item("item_1").await.unwrap();
        store.refresh_item("item_2").await.unwrap();

        assert_eq!(refreshed.status, ItemStatus::LoginError);
        store.read(|s| {
            assert_eq!(s.items.len(), 2);
            assert_eq!(s.item("item_1").unwrap().status, ItemStatus::LoginError);
        });
    }

    #[tokio::test]
    async fn failed_disconnect_rolls_back() {
        let api = Arc::new(FakeApi::default());
        api.set_items(vec![item("item_1", ItemStatus::Updated)]);
        api.set_accounts(vec![account("1", "item_1")]);
        api.fail_next(
            "disconnect_item",
            ApiError::banking(BankingError::new("pluggy_connection_error", "down")),
        );
        let store = store(&api);
        store.fetch_items().await.unwrap();
        store.fetch_accounts().await.unwrap();

        assert!(store.disconnect_item("item_1").await.is_err());

        store.read(|s| {
            assert!(s.item("item_1").is_some());
            assert!(s.account("1").is_some());
        });
    }

    #[tokio::test]
    async fn bulk_categorize_only_touches_targets() {
        let api = Arc::new(FakeApi::default());
        api.set_transactions(vec![
            transaction("1", "a", dec!(10)),
            transaction("2", "a", dec!(20)),
            transaction("3", "a", dec!(30)),
        ]);
        let store = store(&api);
        store.fetch_transactions().await.unwrap();
        let before = store.read(|s| s.transactions.clone());

        store
            .bulk_categorize_transactions(&["1".to_string(), "2".to_string()], "catX")
            .await
            .unwrap();

        store.read(|s| {
            assert_eq!(s.transactions[0].category.as_deref(), Some("catX"));
            assert_eq!(s.transactions[1].category.as_deref(), Some("catX"));
            assert_eq!(s.transactions[2], before[2]);
            assert_eq!(s.transactions[0].amount, before[0].amount);
        });
        assert_eq!(api.calls("transactions"), 1);
    }

    #[tokio::test]
    async fn filters_reset_pagination_and_refetch() {
        let api = Arc::new(FakeApi::default());
        let store = store(&api);
        store.fetch_transactions_page(3).await.unwrap();
        assert_eq!(api.last_transactions_query().unwrap().1, 3);

        store
            .set_transaction_filters(TransactionFilters {
                search: Some("mercado".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        let (filters, page) = api.last_transactions_query().unwrap();
        assert_eq!(page, 1);
        assert_eq!(filters.search.as_deref(), Some("mercado"));
        assert_eq!(store.read(|s| s.pagination.page), 1);

        store.select_account(Some("1")).await.unwrap();
        let (filters, _) = api.last_transactions_query().unwrap();
        assert_eq!(filters.account_id.as_deref(), Some("1"));
        assert_eq!(filters.search.as_deref(), Some("mercado"));
        assert_eq!(store.read(|s| s.selected_account_id.clone()), Some("1".into()));

        store.clear_transaction_filters().await.unwrap();
        assert_eq!(api.last_transactions_query().unwrap().0, TransactionFilters::default());
    }

    #[tokio::test]
    async fn category_mutations_wait_for_the_backend() {
        let api = Arc::new(FakeApi::default());
        let store = store(&api);

        let input = CategoryInput {
            name: "Mercado".into(),
            color: None,
            icon: None,
            category_type: CategoryType::Expense,
            is_active: None,
            order: None,
        };

        api.fail_next("create_category", ApiError::Decode("bad".into()));
        assert!(store.create_category(&input).await.is_err());
        assert!(store.read(|s| s.categories.is_empty()));

        let created = store.create_category(&input).await.unwrap();
        assert_eq!(store.read(|s| s.categories.len()), 1);

        store.delete_category(&created.id).await.unwrap();
        assert!(store.read(|s| s.categories.is_empty()));
    }

    #[tokio::test]
    async fn deleting_a_category_clears_references() {
        let api = Arc::new(FakeApi::default());
        let mut txn = transaction("1", "a", dec!(10));
        txn.category = Some("c1".into());
        api.set_transactions(vec![txn]);
        api.set_categories(vec![category("c1", "Mercado")]);
        let store = store(&api);
        store.fetch_transactions().await.unwrap();
        store.fetch_categories().await.unwrap();

        store.delete_category("c1").await.unwrap();

        assert_eq!(store.read(|s| s.transactions[0].category.clone()), None);
    }
}
