use colored::Colorize;
use onemind_core::{BalanceRecord, BalanceStatus, BalanceSummary};
use tabled::settings::Style;
use tabled::{Table, Tabled};

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Format {
    Table,
    Json,
}

impl Format {
    pub fn from_str(s: &str) -> Self {
        match s {
            "json" => Format::Json,
            _ => Format::Table,
        }
    }
}

#[derive(Tabled)]
struct RecordRow {
    #[tabled(rename = "Provider")]
    provider: String,
    #[tabled(rename = "Engine")]
    engine: String,
    #[tabled(rename = "Balance")]
    balance: String,
    #[tabled(rename = "Initial")]
    initial: String,
    #[tabled(rename = "Spent")]
    spent: String,
    #[tabled(rename = "Tokens in/out")]
    tokens: String,
    #[tabled(rename = "Updated")]
    updated: String,
    #[tabled(rename = "Notes")]
    notes: String,
}

#[derive(Tabled)]
struct SummaryRow {
    #[tabled(rename = "Provider")]
    provider: String,
    #[tabled(rename = "Engine")]
    engine: String,
    #[tabled(rename = "Balance")]
    balance: String,
    #[tabled(rename = "Spent")]
    spent: String,
    #[tabled(rename = "Status")]
    status: String,
}

fn money(amount: rust_decimal::Decimal, currency: &str) -> String {
    format!("{} {}", amount.round_dp(4).normalize(), currency)
}

fn paint(status: BalanceStatus) -> String {
    match status {
        BalanceStatus::Free => status.as_str().cyan().to_string(),
        BalanceStatus::Empty => status.as_str().red().bold().to_string(),
        BalanceStatus::Low => status.as_str().yellow().to_string(),
        BalanceStatus::Good => status.as_str().green().to_string(),
    }
}

pub fn render_records(records: &[BalanceRecord], format: Format) -> String {
    if format == Format::Json {
        return serde_json::to_string_pretty(records).unwrap_or_else(|_| "[]".to_string());
    }

    let rows = records.iter().map(|r| RecordRow {
        provider: r.provider.clone(),
        engine: r.engine.clone(),
        balance: money(r.current_balance, &r.currency),
        initial: money(r.initial_balance, &r.currency),
        spent: money(r.total_spent, &r.currency),
        tokens: format!("{}/{}", r.tokens_in, r.tokens_out),
        updated: r.last_updated.clone(),
        notes: r.notes.clone(),
    });
    Table::new(rows).with(Style::rounded()).to_string()
}

pub fn render_summaries(summaries: &[BalanceSummary], format: Format) -> String {
    if format == Format::Json {
        return serde_json::to_string_pretty(summaries).unwrap_or_else(|_| "[]".to_string());
    }

    let rows = summaries.iter().map(|s| SummaryRow {
        provider: s.provider.clone(),
        engine: s.engine.clone(),
        balance: format!(
            "{} / {}",
            money(s.current_balance, &s.currency),
            money(s.initial_balance, &s.currency)
        ),
        spent: money(s.total_spent, &s.currency),
        status: paint(s.status),
    });
    Table::new(rows).with(Style::rounded()).to_string()
}
