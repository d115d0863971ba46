//! Query-cache adapters over the [`BankingStore`].
//!
//! Each hook reads from the shared store, remembers which queries are fresh
//! in a [`QueryCache`] and, after a successful mutation, invalidates every
//! family of queries the mutation could have changed. Loading and error
//! flags are read from the store rather than tracked here.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

use crate::connect::ConnectOptions;
use crate::model::*;
use crate::store::{self, BankingStore, Resource, Scope, SyncError, SyncOutcome};
use crate::summary::{summarize, DateRange, Summary};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryFamily {
    Connectors,
    Items,
    Accounts,
    Transactions,
    Categories,
    Summary,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey {
    pub family: QueryFamily,
    pub params: Option<String>,
}

impl QueryKey {
    pub fn of(family: QueryFamily) -> Self {
        Self {
            family,
            params: None,
        }
    }

    pub fn with_params(family: QueryFamily, params: &impl Serialize) -> Self {
        Self {
            family,
            params: Some(serde_json::to_string(params).unwrap_or_default()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    /// How long an ordinary query stays fresh.
    pub stale_after: Duration,
    pub connectors_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(30),
            connectors_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

#[derive(Debug)]
struct CacheEntry {
    fetched_at: Instant,
    ttl: Duration,
}

/// Tracks when each query was last fetched.
#[derive(Debug, Default)]
pub struct QueryCache {
    config: CacheConfig,
    entries: Mutex<HashMap<QueryKey, CacheEntry>>,
}

impl QueryCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<QueryKey, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_fresh(&self, key: &QueryKey) -> bool {
        self.entries()
            .get(key)
            .map_or(false, |e| e.fetched_at.elapsed() < e.ttl)
    }

    pub fn mark_fresh(&self, key: QueryKey, ttl: Duration) {
        self.entries().insert(
            key,
            CacheEntry {
                fetched_at: Instant::now(),
                ttl,
            },
        );
    }

    pub fn invalidate(&self, key: &QueryKey) {
        self.entries().remove(key);
    }

    pub fn invalidate_family(&self, family: QueryFamily) {
        self.invalidate_families(&[family]);
    }

    pub fn invalidate_families(&self, families: &[QueryFamily]) {
        debug!(?families, "invalidating queries");
        self.entries().retain(|key, _| !families.contains(&key.family));
    }

    pub fn clear(&self) {
        self.entries().clear();
    }
}

struct Pending<'a>(&'a AtomicUsize);

impl<'a> Pending<'a> {
    fn enter(count: &'a AtomicUsize) -> Self {
        count.fetch_add(1, Ordering::AcqRel);
        Pending(count)
    }
}

impl Drop for Pending<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// State shared by every hook: the store, the cache and the hook's own
/// scope, closed when the hook is dropped.
struct Hook {
    store: Arc<BankingStore>,
    cache: Arc<QueryCache>,
    scope: Scope,
    pending: AtomicUsize,
}

impl Hook {
    fn new(store: Arc<BankingStore>, cache: Arc<QueryCache>) -> Self {
        Self {
            store,
            cache,
            scope: Scope::new(),
            pending: AtomicUsize::new(0),
        }
    }

    /// Runs `fetch` unless `key` is still fresh.
    async fn query<Fut>(&self, key: QueryKey, ttl: Duration, fetch: Fut) -> store::Result<()>
    where
        Fut: Future<Output = store::Result<()>>,
    {
        if self.cache.is_fresh(&key) {
            return Ok(());
        }
        fetch.await?;
        self.cache.mark_fresh(key, ttl);
        Ok(())
    }

    async fn mutate<T, Fut>(&self, invalidates: &[QueryFamily], mutation: Fut) -> store::Result<T>
    where
        Fut: Future<Output = store::Result<T>>,
    {
        let _pending = Pending::enter(&self.pending);
        let result = mutation.await;
        if result.is_ok() {
            self.cache.invalidate_families(invalidates);
        }
        result
    }

    fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire) > 0
    }

    fn stale_after(&self) -> Duration {
        self.cache.config().stale_after
    }
}

impl Drop for Hook {
    fn drop(&mut self) {
        self.scope.close();
    }
}

const AFTER_SYNC: &[QueryFamily] = &[
    QueryFamily::Accounts,
    QueryFamily::Transactions,
    QueryFamily::Summary,
];
const AFTER_CONNECTION_CHANGE: &[QueryFamily] = &[
    QueryFamily::Items,
    QueryFamily::Accounts,
    QueryFamily::Transactions,
    QueryFamily::Summary,
];
const AFTER_CATEGORIZE: &[QueryFamily] = &[QueryFamily::Transactions, QueryFamily::Summary];
const AFTER_CATEGORY_CHANGE: &[QueryFamily] = &[
    QueryFamily::Categories,
    QueryFamily::Transactions,
    QueryFamily::Summary,
];

pub struct BankAccounts {
    hook: Hook,
}

impl BankAccounts {
    pub fn new(store: Arc<BankingStore>, cache: Arc<QueryCache>) -> Self {
        Self {
            hook: Hook::new(store, cache),
        }
    }

    pub fn scope(&self) -> &Scope {
        &self.hook.scope
    }

    pub async fn load(&self) -> store::Result<()> {
        let store = &self.hook.store;
        self.hook
            .query(
                QueryKey::of(QueryFamily::Accounts),
                self.hook.stale_after(),
                store.fetch_accounts_for(&self.hook.scope),
            )
            .await
    }

    pub fn accounts(&self) -> Vec<Account> {
        self.hook.store.read(|s| s.accounts.clone())
    }

    pub fn is_loading(&self) -> bool {
        self.hook.store.read(|s| s.is_loading(Resource::Accounts))
    }

    pub fn error(&self) -> Option<String> {
        self.hook
            .store
            .read(|s| s.error(Resource::Accounts).map(str::to_string))
    }

    pub fn is_pending(&self) -> bool {
        self.hook.is_pending()
    }

    pub fn is_syncing(&self, account_id: &str) -> bool {
        self.hook.store.read(|s| s.is_syncing(account_id))
    }

    pub fn sync_error(&self, account_id: &str) -> Option<SyncError> {
        self.hook.store.read(|s| s.sync_error(account_id).cloned())
    }

    pub async fn sync(&self, account_id: &str) -> store::Result<SyncOutcome> {
        self.hook
            .mutate(AFTER_SYNC, self.hook.store.sync_account(account_id))
            .await
    }

    pub async fn disconnect(&self, account_id: &str) -> store::Result<()> {
        self.hook
            .mutate(
                AFTER_CONNECTION_CHANGE,
                self.hook.store.disconnect_account(account_id),
            )
            .await
    }

    pub async fn update(&self, account_id: &str, update: &AccountUpdate) -> store::Result<Account> {
        self.hook
            .mutate(
                &[QueryFamily::Accounts, QueryFamily::Summary],
                self.hook.store.update_account(account_id, update),
            )
            .await
    }
}

pub struct BankConnections {
    hook: Hook,
}

impl BankConnections {
    pub fn new(store: Arc<BankingStore>, cache: Arc<QueryCache>) -> Self {
        Self {
            hook: Hook::new(store, cache),
        }
    }

    pub fn scope(&self) -> &Scope {
        &self.hook.scope
    }

    /// Loads the connector catalog, kept for a day since it rarely changes.
    pub async fn load_connectors(&self) -> store::Result<()> {
        self.hook
            .query(
                QueryKey::of(QueryFamily::Connectors),
                self.hook.cache.config().connectors_ttl,
                self.hook.store.fetch_connectors_for(&self.hook.scope),
            )
            .await
    }

    pub fn connectors(&self, filter: &ConnectorFilter) -> Vec<Connector> {
        self.hook
            .store
            .read(|s| filter.apply(&s.connectors).into_iter().cloned().collect())
    }

    pub async fn load(&self) -> store::Result<()> {
        self.hook
            .query(
                QueryKey::of(QueryFamily::Items),
                self.hook.stale_after(),
                self.hook.store.fetch_items_for(&self.hook.scope),
            )
            .await
    }

    pub fn items(&self) -> Vec<Item> {
        self.hook.store.read(|s| s.items.clone())
    }

    /// Items the user has to act on, such as failed logins or MFA prompts.
    pub fn items_needing_action(&self) -> Vec<Item> {
        self.hook.store.read(|s| {
            s.items
                .iter()
                .filter(|i| i.status.needs_user_action() || i.status.is_error())
                .cloned()
                .collect()
        })
    }

    pub fn is_loading(&self) -> bool {
        self.hook.store.read(|s| s.is_loading(Resource::Items))
    }

    pub fn error(&self) -> Option<String> {
        self.hook
            .store
            .read(|s| s.error(Resource::Items).map(str::to_string))
    }

    pub fn is_pending(&self) -> bool {
        self.hook.is_pending()
    }

    pub async fn disconnect(&self, item_id: &str) -> store::Result<()> {
        self.hook
            .mutate(
                AFTER_CONNECTION_CHANGE,
                self.hook.store.disconnect_item(item_id),
            )
            .await
    }

    pub async fn refresh_item(&self, item_id: &str) -> store::Result<Item> {
        self.hook
            .mutate(&[QueryFamily::Items], self.hook.store.refresh_item(item_id))
            .await
    }

    pub async fn refresh_status(&self, account_id: &str) -> store::Result<AccountStatus> {
        self.hook
            .mutate(
                &[QueryFamily::Items],
                self.hook.store.refresh_account_status(account_id),
            )
            .await
    }

    /// Wraps `options` so a completed connection invalidates everything it
    /// could have added.
    pub fn connect_options(&self, mut options: ConnectOptions) -> ConnectOptions {
        let cache = Arc::clone(&self.hook.cache);
        let next = options.on_success.take();
        options.on_success = Some(Arc::new(move |item_id: &str| {
            cache.invalidate_families(AFTER_CONNECTION_CHANGE);
            if let Some(next) = &next {
                next(item_id);
            }
        }));
        options
    }
}

/// Transactions are cached per filter set and page.
fn transactions_key(store: &BankingStore) -> QueryKey {
    let params = store.read(|s| {
        (
            s.transaction_filters.clone(),
            s.pagination.page,
            s.pagination.page_size,
        )
    });
    QueryKey::with_params(QueryFamily::Transactions, &params)
}

pub struct Transactions {
    hook: Hook,
}

impl Transactions {
    pub fn new(store: Arc<BankingStore>, cache: Arc<QueryCache>) -> Self {
        Self {
            hook: Hook::new(store, cache),
        }
    }

    pub fn scope(&self) -> &Scope {
        &self.hook.scope
    }

    fn key(&self) -> QueryKey {
        transactions_key(&self.hook.store)
    }

    pub async fn load(&self) -> store::Result<()> {
        self.hook
            .query(
                self.key(),
                self.hook.stale_after(),
                self.hook.store.fetch_transactions_for(&self.hook.scope),
            )
            .await
    }

    pub fn transactions(&self) -> Vec<Transaction> {
        self.hook.store.read(|s| s.transactions.clone())
    }

    pub fn pagination(&self) -> Pagination {
        self.hook.store.read(|s| s.pagination)
    }

    pub fn filters(&self) -> TransactionFilters {
        self.hook.store.read(|s| s.transaction_filters.clone())
    }

    pub fn is_loading(&self) -> bool {
        self.hook.store.read(|s| s.is_loading(Resource::Transactions))
    }

    pub fn error(&self) -> Option<String> {
        self.hook
            .store
            .read(|s| s.error(Resource::Transactions).map(str::to_string))
    }

    pub fn is_pending(&self) -> bool {
        self.hook.is_pending()
    }

    pub async fn set_filters(&self, update: TransactionFilters) -> store::Result<()> {
        self.hook.store.set_transaction_filters(update).await?;
        self.hook.cache.mark_fresh(self.key(), self.hook.stale_after());
        Ok(())
    }

    pub async fn clear_filters(&self) -> store::Result<()> {
        self.hook.store.clear_transaction_filters().await?;
        self.hook.cache.mark_fresh(self.key(), self.hook.stale_after());
        Ok(())
    }

    pub async fn select_account(&self, account_id: Option<&str>) -> store::Result<()> {
        self.hook.store.select_account(account_id).await?;
        self.hook.cache.mark_fresh(self.key(), self.hook.stale_after());
        Ok(())
    }

    pub async fn go_to_page(&self, page: u32) -> store::Result<()> {
        self.hook.store.fetch_transactions_page(page).await?;
        self.hook.cache.mark_fresh(self.key(), self.hook.stale_after());
        Ok(())
    }

    pub async fn bulk_categorize(&self, ids: &[String], category_id: &str) -> store::Result<u32> {
        self.hook
            .mutate(
                AFTER_CATEGORIZE,
                self.hook.store.bulk_categorize_transactions(ids, category_id),
            )
            .await
    }

    pub async fn update(&self, id: &str, update: &TransactionUpdate) -> store::Result<Transaction> {
        self.hook
            .mutate(AFTER_CATEGORIZE, self.hook.store.update_transaction(id, update))
            .await
    }

    pub async fn export(&self, format: ExportFormat) -> store::Result<Vec<u8>> {
        self.hook.store.export_transactions(format).await
    }
}

pub struct Categories {
    hook: Hook,
}

impl Categories {
    pub fn new(store: Arc<BankingStore>, cache: Arc<QueryCache>) -> Self {
        Self {
            hook: Hook::new(store, cache),
        }
    }

    pub async fn load(&self) -> store::Result<()> {
        self.hook
            .query(
                QueryKey::of(QueryFamily::Categories),
                self.hook.stale_after(),
                self.hook.store.fetch_categories_for(&self.hook.scope),
            )
            .await
    }

    pub fn categories(&self) -> Vec<Category> {
        self.hook.store.read(|s| s.categories.clone())
    }

    pub fn is_pending(&self) -> bool {
        self.hook.is_pending()
    }

    pub async fn create(&self, input: &CategoryInput) -> store::Result<Category> {
        self.hook
            .mutate(&[QueryFamily::Categories], self.hook.store.create_category(input))
            .await
    }

    pub async fn update(&self, id: &str, input: &CategoryInput) -> store::Result<Category> {
        self.hook
            .mutate(AFTER_CATEGORY_CHANGE, self.hook.store.update_category(id, input))
            .await
    }

    pub async fn delete(&self, id: &str) -> store::Result<()> {
        self.hook
            .mutate(AFTER_CATEGORY_CHANGE, self.hook.store.delete_category(id))
            .await
    }
}

pub struct FinancialSummary {
    hook: Hook,
    range: DateRange,
}

impl FinancialSummary {
    pub fn new(store: Arc<BankingStore>, cache: Arc<QueryCache>, range: DateRange) -> Self {
        Self {
            hook: Hook::new(store, cache),
            range,
        }
    }

    pub fn range(&self) -> DateRange {
        self.range
    }

    /// Makes sure the accounts, transactions and categories the summary is
    /// computed from are loaded. Only the transactions currently in the store
    /// (the active filters and page) are counted.
    pub async fn load(&self) -> store::Result<()> {
        let key = QueryKey::with_params(QueryFamily::Summary, &self.range);
        if self.hook.cache.is_fresh(&key) {
            return Ok(());
        }

        let store = &self.hook.store;
        let scope = &self.hook.scope;
        let ttl = self.hook.stale_after();

        tokio::try_join!(
            self.hook.query(
                QueryKey::of(QueryFamily::Accounts),
                ttl,
                store.fetch_accounts_for(scope)
            ),
            self.hook.query(
                transactions_key(store),
                ttl,
                store.fetch_transactions_for(scope)
            ),
            self.hook.query(
                QueryKey::of(QueryFamily::Categories),
                ttl,
                store.fetch_categories_for(scope)
            ),
        )?;
        self.hook.cache.mark_fresh(key, ttl);
        Ok(())
    }

    pub fn summary(&self) -> Summary {
        self.hook.store.read(|s| {
            summarize(&s.accounts, &s.transactions, &s.categories, &self.range)
        })
    }

    pub fn is_loading(&self) -> bool {
        self.hook.store.read(|s| {
            s.is_loading(Resource::Accounts) || s.is_loading(Resource::Transactions)
        })
    }
}
