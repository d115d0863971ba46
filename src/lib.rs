//! Client core for the CaixaHub banking backend: bank connections through
//! Pluggy Connect, MFA countdowns, account sync and transaction state.

pub mod api;
pub mod connect;
pub mod display;
pub mod error;
pub mod hooks;
pub mod mfa;
pub mod model;
pub mod notify;
pub mod request;
pub mod settings;
pub mod store;
pub mod summary;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use crate::api::{ApiClient, ApiError, BankingApi};
use crate::hooks::{CacheConfig, QueryCache};
use crate::notify::{Notifier, TracingNotifier};
use crate::request::RequestConfig;
use crate::settings::Settings;
use crate::store::BankingStore;

pub static CLIENT_NAME: &str = "caixahub";

/// The pieces every consumer shares: one client, one store, one cache.
#[derive(Clone)]
pub struct Banking {
    pub api: Arc<dyn BankingApi>,
    pub store: Arc<BankingStore>,
    pub cache: Arc<QueryCache>,
    pub notifier: Arc<dyn Notifier>,
}

impl Banking {
    pub fn new(api: Arc<dyn BankingApi>, cache: CacheConfig, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            store: Arc::new(BankingStore::new(Arc::clone(&api))),
            cache: Arc::new(QueryCache::new(cache)),
            api,
            notifier,
        }
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, ApiError> {
        let client = ApiClient::new(&settings.api, RequestConfig::from(&settings.requests))?;
        Ok(Self::new(
            Arc::new(client),
            CacheConfig::from(&settings.cache),
            Arc::new(TracingNotifier),
        ))
    }
}
