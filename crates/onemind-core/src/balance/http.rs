//! reqwest implementation of [`BalanceBackend`].

use super::backend::{
    ApiEnvelope, BalanceBackend, DeductRequest, ImportRequest, ResetRequest, UpdateBalanceRequest,
};
use super::model::BalanceRecord;
use crate::config::TrackerConfig;
use crate::error::{BalanceError, BalanceResult};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use std::fs;
use std::path::{Path, PathBuf};
use url::Url;

const BALANCES_PATH: &str = "balances";

pub struct HttpBalanceBackend {
    base_url: Url,
    client: Client,
}

impl HttpBalanceBackend {
    pub fn new(config: &TrackerConfig) -> BalanceResult<Self> {
        let base_url = Url::parse(config.base_url.trim())?;
        if base_url.cannot_be_a_base() {
            return Err(BalanceError::Config(format!(
                "base URL cannot carry a path: {}",
                config.base_url
            )));
        }

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("onemind-balance/", env!("CARGO_PKG_VERSION"))),
        );

        let mut builder = Client::builder().default_headers(headers);
        if let Some(timeout) = config.request_timeout() {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| BalanceError::Config(format!("Failed to build HTTP client: {e}")))?;

        log::debug!("[BalanceApi] Using backend {base_url}");
        Ok(Self { base_url, client })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// `{base}/balances/{segments...}`, each segment percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().push(BALANCES_PATH).extend(segments);
        }
        url
    }

    async fn read_body(response: Response, operation: &str) -> BalanceResult<(u16, bool, String)> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| BalanceError::Network(format!("Failed to read {operation} response: {e}")))?;
        Ok((status.as_u16(), status.is_success(), body))
    }

    /// A failed envelope wins over the HTTP status so the backend's own message survives.
    async fn read_envelope<T: DeserializeOwned>(
        response: Response,
        operation: &str,
    ) -> BalanceResult<ApiEnvelope<T>> {
        let (status, ok, body) = Self::read_body(response, operation).await?;
        let parsed = serde_json::from_str::<ApiEnvelope<T>>(&body);

        if ok {
            return parsed.map_err(|e| {
                BalanceError::Parse(format!("Failed to parse {operation} response: {e}"))
            });
        }
        match parsed {
            Ok(envelope) if !envelope.success => Ok(envelope),
            _ => Err(BalanceError::Http { status, body }),
        }
    }
}

#[async_trait]
impl BalanceBackend for HttpBalanceBackend {
    async fn list(&self) -> BalanceResult<Vec<BalanceRecord>> {
        let response = self
            .client
            .get(self.endpoint(&[]))
            .send()
            .await
            .map_err(|e| BalanceError::Network(format!("Failed to list balances: {e}")))?;
        Self::read_envelope(response, "list").await?.into_result("list")
    }

    async fn update(
        &self,
        provider: &str,
        request: &UpdateBalanceRequest,
    ) -> BalanceResult<BalanceRecord> {
        let response = self
            .client
            .put(self.endpoint(&[provider]))
            .json(request)
            .send()
            .await
            .map_err(|e| BalanceError::Network(format!("Failed to update {provider}: {e}")))?;
        Self::read_envelope(response, "update").await?.into_result("update")
    }

    async fn deduct(&self, request: &DeductRequest) -> BalanceResult<BalanceRecord> {
        let response = self
            .client
            .post(self.endpoint(&["deduct"]))
            .json(request)
            .send()
            .await
            .map_err(|e| {
                BalanceError::Network(format!("Failed to deduct from {}: {e}", request.provider))
            })?;
        Self::read_envelope(response, "deduct").await?.into_result("deduct")
    }

    async fn reset(&self, provider: &str, request: &ResetRequest) -> BalanceResult<()> {
        let response = self
            .client
            .post(self.endpoint(&["reset", provider]))
            .json(request)
            .send()
            .await
            .map_err(|e| BalanceError::Network(format!("Failed to reset {provider}: {e}")))?;
        // Reset may answer without data; only the success flag counts.
        let envelope = Self::read_envelope::<serde_json::Value>(response, "reset").await?;
        if envelope.success {
            Ok(())
        } else {
            Err(BalanceError::Api(
                envelope
                    .error
                    .unwrap_or_else(|| "reset reported failure".to_string()),
            ))
        }
    }

    async fn import_csv(&self, request: &ImportRequest) -> BalanceResult<Vec<BalanceRecord>> {
        let response = self
            .client
            .post(self.endpoint(&["import"]))
            .json(request)
            .send()
            .await
            .map_err(|e| BalanceError::Network(format!("Failed to import CSV: {e}")))?;
        Self::read_envelope(response, "import").await?.into_result("import")
    }

    async fn export_csv(&self, dir: &Path) -> BalanceResult<PathBuf> {
        let response = self
            .client
            .get(self.endpoint(&["export"]))
            .header(ACCEPT, "text/csv")
            .send()
            .await
            .map_err(|e| BalanceError::Network(format!("Failed to export CSV: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|e| format!("<unreadable export response: {e}>"));
            return Err(BalanceError::Http {
                status: status.as_u16(),
                body,
            });
        }
        let content = response.bytes().await?;

        fs::create_dir_all(dir)
            .map_err(|e| BalanceError::Io(format!("Failed to create {}: {e}", dir.display())))?;
        let path = dir.join(export_file_name());
        fs::write(&path, &content)
            .map_err(|e| BalanceError::Io(format!("Failed to write {}: {e}", path.display())))?;

        log::info!("[BalanceApi] Exported {} bytes to {}", content.len(), path.display());
        Ok(path)
    }

    fn export_url(&self) -> String {
        self.endpoint(&["export"]).to_string()
    }
}

fn export_file_name() -> String {
    format!(
        "onemind-balances-{}.csv",
        chrono::Local::now().format("%Y%m%d-%H%M%S")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(base: &str) -> HttpBalanceBackend {
        HttpBalanceBackend::new(&TrackerConfig {
            base_url: base.to_string(),
            ..TrackerConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn endpoints_hang_off_the_base_path() {
        let backend = backend("http://localhost:3001/api");
        assert_eq!(
            backend.endpoint(&[]).as_str(),
            "http://localhost:3001/api/balances"
        );
        assert_eq!(
            backend.endpoint(&["reset", "openai"]).as_str(),
            "http://localhost:3001/api/balances/reset/openai"
        );
    }

    #[test]
    fn trailing_slash_in_base_is_tolerated() {
        let backend = backend("http://localhost:3001/api/");
        assert_eq!(
            backend.export_url(),
            "http://localhost:3001/api/balances/export"
        );
    }

    #[test]
    fn provider_is_a_single_encoded_segment() {
        let backend = backend("http://localhost:3001/api");
        assert_eq!(
            backend.endpoint(&["azure/openai east"]).as_str(),
            "http://localhost:3001/api/balances/azure%2Fopenai%20east"
        );
    }

    #[test]
    fn rejects_unusable_base_urls() {
        let config = |base: &str| TrackerConfig {
            base_url: base.to_string(),
            ..TrackerConfig::default()
        };
        assert!(HttpBalanceBackend::new(&config("localhost api")).is_err());
        assert!(HttpBalanceBackend::new(&config("mailto:ops@example.com")).is_err());
    }

    #[test]
    fn export_file_name_is_csv() {
        let name = export_file_name();
        assert!(name.starts_with("onemind-balances-"));
        assert!(name.ends_with(".csv"));
    }
}
