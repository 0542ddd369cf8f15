use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};

/// One balance row per (provider, engine) pair.
///
/// Missing keys and `null` values both decode as the field default, since the
/// CSV store writes empty cells as `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceRecord {
    pub provider: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub engine: String,
    #[serde(
        default,
        serialize_with = "rust_decimal::serde::float::serialize",
        deserialize_with = "decimal_or_zero"
    )]
    pub initial_balance: Decimal,
    #[serde(
        default,
        serialize_with = "rust_decimal::serde::float::serialize",
        deserialize_with = "decimal_or_zero"
    )]
    pub current_balance: Decimal,
    #[serde(
        default,
        serialize_with = "rust_decimal::serde::float::serialize",
        deserialize_with = "decimal_or_zero"
    )]
    pub total_spent: Decimal,
    #[serde(default, deserialize_with = "null_as_default")]
    pub tokens_in: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub tokens_out: u64,
    /// ISO 8601 timestamp as stored by the backend.
    #[serde(default, deserialize_with = "null_as_default")]
    pub last_updated: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub currency: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub notes: String,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn decimal_or_zero<'de, D>(deserializer: D) -> Result<Decimal, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(rust_decimal::serde::float_option::deserialize(deserializer)?.unwrap_or_default())
}

impl BalanceRecord {
    /// Zero-balance record stamped with the current time.
    pub fn zeroed(provider: &str, engine: &str, currency: &str, notes: &str) -> Self {
        Self {
            provider: provider.to_string(),
            engine: engine.to_string(),
            initial_balance: Decimal::ZERO,
            current_balance: Decimal::ZERO,
            total_spent: Decimal::ZERO,
            tokens_in: 0,
            tokens_out: 0,
            last_updated: now_iso8601(),
            currency: currency.to_string(),
            notes: notes.to_string(),
        }
    }

    pub fn status(&self) -> BalanceStatus {
        BalanceStatus::classify(self.initial_balance, self.current_balance)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BalanceStatus {
    Free,
    Empty,
    Low,
    Good,
}

impl BalanceStatus {
    /// First match wins: free, then empty, then low (< 20% left), else good.
    pub fn classify(initial: Decimal, current: Decimal) -> Self {
        if initial.is_zero() {
            BalanceStatus::Free
        } else if current <= Decimal::ZERO {
            BalanceStatus::Empty
        } else if current < initial * low_balance_ratio() {
            BalanceStatus::Low
        } else {
            BalanceStatus::Good
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BalanceStatus::Free => "free",
            BalanceStatus::Empty => "empty",
            BalanceStatus::Low => "low",
            BalanceStatus::Good => "good",
        }
    }
}

impl std::fmt::Display for BalanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn low_balance_ratio() -> Decimal {
    Decimal::new(2, 1)
}

/// Per-record view with a computed status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceSummary {
    pub provider: String,
    pub engine: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub initial_balance: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub current_balance: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub total_spent: Decimal,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub currency: String,
    pub status: BalanceStatus,
}

impl From<&BalanceRecord> for BalanceSummary {
    fn from(record: &BalanceRecord) -> Self {
        Self {
            provider: record.provider.clone(),
            engine: record.engine.clone(),
            initial_balance: record.initial_balance,
            current_balance: record.current_balance,
            total_spent: record.total_spent,
            tokens_in: record.tokens_in,
            tokens_out: record.tokens_out,
            currency: record.currency.clone(),
            status: record.status(),
        }
    }
}

const DEFAULT_PROVIDERS: [(&str, &str, &str); 9] = [
    ("openai", "gpt-4o", "OpenAI API credits"),
    ("anthropic", "claude-3-5-sonnet", "Anthropic API credits"),
    ("gemini", "gemini-1.5-pro", "Google AI Studio free tier"),
    ("deepseek", "deepseek-chat", "DeepSeek prepaid balance"),
    ("mistral", "mistral-large-latest", "Mistral La Plateforme credits"),
    ("perplexity", "sonar-pro", "Perplexity API credits"),
    ("kimi", "moonshot-v1-8k", "Moonshot AI prepaid balance"),
    ("xai", "grok-2", "xAI API credits"),
    ("groq", "llama-3.1-70b-versatile", "Groq free tier"),
];

/// Stub rows shown when the backend is unreachable and nothing is cached.
pub fn default_balances() -> Vec<BalanceRecord> {
    DEFAULT_PROVIDERS
        .iter()
        .map(|(provider, engine, notes)| BalanceRecord::zeroed(provider, engine, "USD", notes))
        .collect()
}

pub(crate) fn now_iso8601() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
