//! Subcommand execution over the balance tracker

use crate::args::{Cli, Command};
use crate::output::{self, Format};
use anyhow::{anyhow, bail, Context, Result};
use onemind_core::{BalanceTracker, HttpBalanceBackend, TrackerConfig};
use std::io::Read;
use std::path::Path;
use std::sync::{Arc, Mutex};

type LastFailure = Arc<Mutex<Option<String>>>;

fn take_failure(last: &LastFailure) -> Option<String> {
    last.lock().unwrap_or_else(|e| e.into_inner()).take()
}

/// The tracker absorbs failures; the CLI turns the last one back into an error.
fn failed(last: &LastFailure, fallback: &str) -> anyhow::Error {
    anyhow!(take_failure(last).unwrap_or_else(|| fallback.to_string()))
}

pub fn read_csv_input(file: &Path) -> Result<String> {
    if file.as_os_str() == "-" {
        let mut content = String::new();
        std::io::stdin()
            .read_to_string(&mut content)
            .context("Failed to read CSV from stdin")?;
        return Ok(content);
    }
    std::fs::read_to_string(file).with_context(|| format!("Failed to read {}", file.display()))
}

pub async fn run(cli: Cli, config: TrackerConfig) -> Result<()> {
    let format = Format::from_str(&cli.format);
    let last: LastFailure = Arc::new(Mutex::new(None));
    let sink = last.clone();

    let backend = HttpBalanceBackend::new(&config).context("Invalid balance API configuration")?;
    let tracker = BalanceTracker::builder(Arc::new(backend))
        .config(config)
        .on_failure(move |failure| {
            *sink.lock().unwrap_or_else(|e| e.into_inner()) =
                Some(format!("{} failed: {}", failure.operation, failure.error));
        })
        .build()?;

    match cli.command {
        Command::List => {
            let rows = tracker.load_balances_async().await;
            if let Some(err) = take_failure(&last) {
                eprintln!("warning: {err}; showing cached or default balances");
            }
            println!("{}", output::render_records(&rows, format));
        }
        Command::Summary => {
            tracker.load_balances_async().await;
            if let Some(err) = take_failure(&last) {
                eprintln!("warning: {err}; showing cached or default balances");
            }
            println!(
                "{}",
                output::render_summaries(&tracker.get_all_balances_summary(), format)
            );
        }
        Command::Set {
            provider,
            amount,
            engine,
            notes,
        } => {
            let record = tracker
                .set_balance_async(&provider, amount, engine.as_deref(), notes.as_deref())
                .await
                .ok_or_else(|| failed(&last, "update failed"))?;
            println!("{}", output::render_records(&[record], format));
        }
        Command::Deduct {
            provider,
            cost,
            engine,
            tokens_in,
            tokens_out,
        } => {
            let record = tracker
                .deduct_from_balance_async(&provider, cost, engine.as_deref(), tokens_in, tokens_out)
                .await
                .ok_or_else(|| failed(&last, "deduction failed"))?;
            println!("{}", output::render_records(&[record], format));
        }
        Command::Reset { provider, engine } => {
            if !tracker.reset_balance_async(&provider, engine.as_deref()).await {
                return Err(failed(&last, "reset failed"));
            }
            println!("Reset {provider} to its initial balance");
        }
        Command::Import { file } => {
            let content = read_csv_input(&file)?;
            let rows = tracker.import_from_csv_async(&content).await;
            if let Some(err) = take_failure(&last) {
                bail!(err);
            }
            println!("{}", output::render_records(&rows, format));
        }
        Command::Export => {
            let path = tracker
                .export_to_csv_async()
                .await
                .ok_or_else(|| failed(&last, "export failed"))?;
            println!("Exported balances to {}", path.display());
        }
    }
    Ok(())
}
