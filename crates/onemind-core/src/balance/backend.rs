//! Backend seam
//!
//! The balance service owns storage; the tracker only sees this trait.

use super::model::BalanceRecord;
use crate::error::{BalanceError, BalanceResult};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Body of `PUT /balances/{provider}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdateBalanceRequest {
    #[serde(with = "rust_decimal::serde::float")]
    pub current_balance: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Body of `POST /balances/deduct`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeductRequest {
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine: Option<String>,
    #[serde(with = "rust_decimal::serde::float")]
    pub cost: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_in: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_out: Option<u64>,
}

/// Body of `POST /balances/reset/{provider}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResetRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine: Option<String>,
}

/// Body of `POST /balances/import`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImportRequest {
    #[serde(rename = "csvContent")]
    pub csv_content: String,
}

/// Response wrapper used by every JSON endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiEnvelope<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> ApiEnvelope<T> {
    /// `success: false` or a missing payload become `BalanceError::Api`.
    pub fn into_result(self, operation: &str) -> BalanceResult<T> {
        if !self.success {
            return Err(BalanceError::Api(
                self.error
                    .unwrap_or_else(|| format!("{operation} reported failure")),
            ));
        }
        self.data
            .ok_or_else(|| BalanceError::Api(format!("{operation} returned no data")))
    }
}

#[async_trait]
pub trait BalanceBackend: Send + Sync {
    async fn list(&self) -> BalanceResult<Vec<BalanceRecord>>;

    async fn update(
        &self,
        provider: &str,
        request: &UpdateBalanceRequest,
    ) -> BalanceResult<BalanceRecord>;

    async fn deduct(&self, request: &DeductRequest) -> BalanceResult<BalanceRecord>;

    /// Only success or failure matters to the tracker; any payload is ignored.
    async fn reset(&self, provider: &str, request: &ResetRequest) -> BalanceResult<()>;

    async fn import_csv(&self, request: &ImportRequest) -> BalanceResult<Vec<BalanceRecord>>;

    /// Download the CSV export into `dir`, returning the written path.
    async fn export_csv(&self, dir: &Path) -> BalanceResult<PathBuf>;

    /// Absolute URL of the export endpoint.
    fn export_url(&self) -> String;
}
