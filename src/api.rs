use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::{self, parse_api_error, BankingError};
use crate::model::*;
use crate::request::{RequestConfig, RequestManager, RequestOptions};
use crate::settings::ApiSettings;

#[derive(Debug, Clone, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Transport(Arc<reqwest::Error>),
    #[error("{}", .error.message)]
    Banking { status: u16, error: BankingError },
    #[error("unexpected response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        ApiError::Transport(Arc::new(err))
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::Decode(err.to_string())
    }
}

impl ApiError {
    pub fn banking(error: BankingError) -> Self {
        ApiError::Banking { status: 400, error }
    }

    /// The structured view of this error, synthesized for transport and
    /// decoding failures.
    pub fn banking_error(&self) -> BankingError {
        match self {
            ApiError::Banking { error, .. } => error.clone(),
            ApiError::Transport(err) if err.is_timeout() || err.is_connect() => BankingError::new(
                "pluggy_connection_error",
                "Não foi possível se comunicar com o servidor.",
            ),
            _ => BankingError::unexpected(),
        }
    }

    pub fn requires_reconnection(&self) -> bool {
        match self {
            ApiError::Banking { error, .. } => error::requires_reconnection(error),
            _ => false,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Banking { status, .. } => Some(*status),
            ApiError::Transport(err) => err.status().map(|s| s.as_u16()),
            ApiError::Decode(_) => None,
        }
    }
}

pub type Result<T> = ::std::result::Result<T, ApiError>;

/// Every backend operation the banking core depends on.
#[async_trait]
pub trait BankingApi: Send + Sync {
    async fn connectors(&self) -> Result<Vec<Connector>>;

    async fn items(&self) -> Result<Vec<Item>>;
    async fn item(&self, id: &str) -> Result<Item>;
    async fn disconnect_item(&self, id: &str) -> Result<()>;

    async fn accounts(&self) -> Result<Vec<Account>>;
    async fn account(&self, id: &str) -> Result<Account>;
    async fn update_account(&self, id: &str, update: &AccountUpdate) -> Result<Account>;
    async fn sync_account(&self, id: &str) -> Result<SyncResponse>;
    async fn disconnect_account(&self, id: &str) -> Result<()>;
    async fn account_status(&self, id: &str) -> Result<AccountStatus>;
    async fn waiting_items(&self) -> Result<Vec<WaitingItem>>;

    async fn transactions(
        &self,
        filters: &TransactionFilters,
        page: u32,
        page_size: u32,
    ) -> Result<Page<Transaction>>;
    async fn update_transaction(&self, id: &str, update: &TransactionUpdate) -> Result<Transaction>;
    async fn bulk_categorize(&self, ids: &[String], category_id: &str) -> Result<BulkCategorizeResponse>;
    async fn export_transactions(&self, filters: &TransactionFilters, format: ExportFormat) -> Result<Vec<u8>>;

    async fn categories(&self) -> Result<Vec<Category>>;
    async fn create_category(&self, input: &CategoryInput) -> Result<Category>;
    async fn update_category(&self, id: &str, input: &CategoryInput) -> Result<Category>;
    async fn delete_category(&self, id: &str) -> Result<()>;

    async fn connect_token(&self, item_id: Option<&str>) -> Result<ConnectToken>;
    async fn pluggy_callback(&self, item_id: &str) -> Result<CallbackResponse>;
}

/// HTTP client for the CaixaHub REST backend.
pub struct ApiClient {
    client: Client,
    base_url: String,
    token: Option<String>,
    requests: RequestManager<Value, ApiError>,
}

impl ApiClient {
    pub fn new(settings: &ApiSettings, requests: RequestConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .connect_timeout(Duration::from_secs(5))
            .build()?;

        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            token: settings.token.clone(),
            requests: RequestManager::new(requests),
        })
    }

    pub fn requests(&self) -> &RequestManager<Value, ApiError> {
        &self.requests
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let req = self
            .client
            .request(method, url)
            .header("accept", "application/json");
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: Vec<(&'static str, String)>) -> Result<T> {
        let url = self.url(path);
        let key = format!("GET {} {}", url, serde_json::to_string(&query)?);
        let req = self.request(Method::GET, &url).query(&query);

        let value = self
            .requests
            .execute(&key, move || send_json(req), RequestOptions::default())
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn send<T: DeserializeOwned>(&self, method: Method, path: &str, body: Option<Value>) -> Result<T> {
        let url = self.url(path);
        let key = format!("{} {}", method, url);
        let mut req = self.request(method, &url);
        if let Some(body) = body {
            req = req.json(&body);
        }

        let value = self
            .requests
            .execute(&key, move || send_json(req), RequestOptions::fresh())
            .await?;
        Ok(serde_json::from_value(value)?)
    }
}

async fn error_from_response(res: reqwest::Response) -> ApiError {
    let status = res.status();
    let body = res.text().await.unwrap_or_default();
    let value = serde_json::from_str::<Value>(&body).unwrap_or(Value::String(body));

    let mut error = parse_api_error(&value);
    if error.kind() == error::ErrorCode::Unknown && status.as_u16() == 429 {
        error.code = error::ErrorCode::RateLimitExceeded.as_str().to_string();
    }

    warn!(status = status.as_u16(), code = %error.code, "backend returned an error");
    ApiError::Banking {
        status: status.as_u16(),
        error,
    }
}

async fn send_json(req: RequestBuilder) -> Result<Value> {
    let res = req.send().await?;
    if !res.status().is_success() {
        return Err(error_from_response(res).await);
    }

    let bytes = res.bytes().await?;
    if bytes.is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_slice(&bytes)?)
}

#[async_trait]
impl BankingApi for ApiClient {
    async fn connectors(&self) -> Result<Vec<Connector>> {
        let list: ListResponse<Connector> = self.get("banking/connectors/", vec![]).await?;
        Ok(list.into_vec())
    }

    async fn items(&self) -> Result<Vec<Item>> {
        let list: ListResponse<Item> = self.get("banking/items/", vec![]).await?;
        Ok(list.into_vec())
    }

    async fn item(&self, id: &str) -> Result<Item> {
        self.get(&format!("banking/items/{}/", id), vec![]).await
    }

    async fn disconnect_item(&self, id: &str) -> Result<()> {
        self.send::<Value>(Method::POST, &format!("banking/items/{}/disconnect/", id), None)
            .await?;
        Ok(())
    }

    async fn accounts(&self) -> Result<Vec<Account>> {
        let list: ListResponse<Account> = self.get("banking/accounts/", vec![]).await?;
        Ok(list.into_vec())
    }

    async fn account(&self, id: &str) -> Result<Account> {
        self.get(&format!("banking/accounts/{}/", id), vec![]).await
    }

    async fn update_account(&self, id: &str, update: &AccountUpdate) -> Result<Account> {
        self.send(
            Method::PATCH,
            &format!("banking/accounts/{}/", id),
            Some(serde_json::to_value(update)?),
        )
        .await
    }

    async fn sync_account(&self, id: &str) -> Result<SyncResponse> {
        debug!(account = id, "requesting account sync");
        self.send(Method::POST, &format!("banking/accounts/{}/sync/", id), None)
            .await
    }

    async fn disconnect_account(&self, id: &str) -> Result<()> {
        self.send::<Value>(
            Method::POST,
            &format!("banking/accounts/{}/disconnect/", id),
            None,
        )
        .await?;
        Ok(())
    }

    async fn account_status(&self, id: &str) -> Result<AccountStatus> {
        self.get(&format!("banking/pluggy/accounts/{}/status/", id), vec![])
            .await
    }

    async fn waiting_items(&self) -> Result<Vec<WaitingItem>> {
        let list: ListResponse<WaitingItem> =
            self.get("banking/pluggy/waiting-items/", vec![]).await?;
        Ok(list.into_vec())
    }

    async fn transactions(
        &self,
        filters: &TransactionFilters,
        page: u32,
        page_size: u32,
    ) -> Result<Page<Transaction>> {
        let mut query = filters.to_query();
        query.push(("page", page.to_string()));
        query.push(("page_size", page_size.to_string()));

        match self.get("banking/transactions/", query).await? {
            ListResponse::Page(page) => Ok(page),
            ListResponse::List(results) => Ok(Page {
                count: results.len() as u64,
                next: None,
                previous: None,
                results,
            }),
        }
    }

    async fn update_transaction(&self, id: &str, update: &TransactionUpdate) -> Result<Transaction> {
        self.send(
            Method::PATCH,
            &format!("banking/transactions/{}/", id),
            Some(serde_json::to_value(update)?),
        )
        .await
    }

    async fn bulk_categorize(&self, ids: &[String], category_id: &str) -> Result<BulkCategorizeResponse> {
        self.send(
            Method::POST,
            "banking/transactions/bulk-categorize/",
            Some(json!({ "transaction_ids": ids, "category_id": category_id })),
        )
        .await
    }

    async fn export_transactions(&self, filters: &TransactionFilters, format: ExportFormat) -> Result<Vec<u8>> {
        let mut query = filters.to_query();
        query.push(("format", format.as_str().to_string()));

        let res = self
            .request(Method::GET, &self.url("banking/transactions/export/"))
            .query(&query)
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(error_from_response(res).await);
        }
        Ok(res.bytes().await?.to_vec())
    }

    async fn categories(&self) -> Result<Vec<Category>> {
        let list: ListResponse<Category> = self.get("banking/categories/", vec![]).await?;
        Ok(list.into_vec())
    }

    async fn create_category(&self, input: &CategoryInput) -> Result<Category> {
        self.send(
            Method::POST,
            "banking/categories/",
            Some(serde_json::to_value(input)?),
        )
        .await
    }

    async fn update_category(&self, id: &str, input: &CategoryInput) -> Result<Category> {
        self.send(
            Method::PATCH,
            &format!("banking/categories/{}/", id),
            Some(serde_json::to_value(input)?),
        )
        .await
    }

    async fn delete_category(&self, id: &str) -> Result<()> {
        self.send::<Value>(Method::DELETE, &format!("banking/categories/{}/", id), None)
            .await?;
        Ok(())
    }

    async fn connect_token(&self, item_id: Option<&str>) -> Result<ConnectToken> {
        let body = match item_id {
            Some(id) => json!({ "item_id": id }),
            None => json!({}),
        };
        self.send(Method::POST, "banking/connect/token/", Some(body))
            .await
    }

    async fn pluggy_callback(&self, item_id: &str) -> Result<CallbackResponse> {
        self.send(
            Method::POST,
            "banking/pluggy/callback/",
            Some(json!({ "item_id": item_id })),
        )
        .await
    }
}
