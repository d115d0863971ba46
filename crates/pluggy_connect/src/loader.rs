use std::sync::Arc;
use std::time::Duration;

use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::WidgetError;

/// SdkLoader fetches the widget script at most once per process.
///
/// Concurrent callers share the same in-flight fetch. A failed fetch leaves
/// the loader empty so a later call may try again.
#[derive(Debug)]
pub struct SdkLoader {
    url: String,
    client: reqwest::Client,
    script: OnceCell<Arc<String>>,
}

impl SdkLoader {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(15))
                .build()
                .unwrap_or_default(),
            script: OnceCell::new(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_loaded(&self) -> bool {
        self.script.initialized()
    }

    pub async fn load(&self) -> Result<Arc<String>, WidgetError> {
        self.script
            .get_or_try_init(|| async {
                debug!(url = %self.url, "loading connect sdk");
                let res = self.client.get(&self.url).send().await.map_err(|e| {
                    warn!(url = %self.url, error = %e, "connect sdk request failed");
                    WidgetError::SdkRequest(e)
                })?;

                let status = res.status();
                if !status.is_success() {
                    warn!(url = %self.url, %status, "connect sdk unavailable");
                    return Err(WidgetError::SdkLoad(format!(
                        "{} returned {}",
                        self.url, status
                    )));
                }

                let body = res.text().await?;
                if body.trim().is_empty() {
                    return Err(WidgetError::SdkLoad(format!("{} returned an empty script", self.url)));
                }

                Ok(Arc::new(body))
            })
            .await
            .map(Arc::clone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn loads_script_once() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/pluggy-connect.js")
            .with_status(200)
            .with_header("content-type", "application/javascript")
            .with_body("window.PluggyConnect = function () {};")
            .expect(1)
            .create_async()
            .await;

        let loader = SdkLoader::new(format!("{}/pluggy-connect.js", server.url()));
        assert!(!loader.is_loaded());

        let (a, b) = tokio::join!(loader.load(), loader.load());
        assert_eq!(a.unwrap(), b.unwrap());
        loader.load().await.unwrap();

        assert!(loader.is_loaded());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn failed_load_leaves_flag_unset() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/pluggy-connect.js")
            .with_status(503)
            .create_async()
            .await;

        let loader = SdkLoader::new(format!("{}/pluggy-connect.js", server.url()));
        let err = loader.load().await.unwrap_err();

        assert!(matches!(err, WidgetError::SdkLoad(_)));
        assert!(!loader.is_loaded());
    }
}
