// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use coin_ledger::journal::read_records;
use coin_ledger::{AccountId, Engine, IdempotencyKey, LedgerConfig, LedgerError, Operation, api};
use csv::{ReaderBuilder, Trim, Writer};
use serde::Deserialize;
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Coin Ledger - append-only ledger for an in-app coin currency
#[derive(Parser, Debug)]
#[command(name = "coin-ledger")]
#[command(about = "Idempotent coin transfers with an auditable transaction log", long_about = None)]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "COIN_LEDGER_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP API
    Serve(ServeArgs),

    /// Apply a CSV of operations and print the resulting balances
    ///
    /// Expected format: op,account,counterparty,amount,key,memo
    /// Example: coin-ledger replay operations.csv > balances.csv
    Replay {
        #[arg(value_name = "FILE")]
        input: PathBuf,

        #[command(flatten)]
        limits: LimitArgs,
    },

    /// Rebuild the ledger from a journal and verify every account
    Audit {
        #[arg(long, env = "COIN_LEDGER_JOURNAL")]
        journal: PathBuf,
    },
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Address to listen on
    #[arg(long, env = "COIN_LEDGER_BIND", default_value = "127.0.0.1:3000")]
    bind: String,

    /// JSON-lines journal; replayed on start and appended to afterwards
    #[arg(long, env = "COIN_LEDGER_JOURNAL")]
    journal: Option<PathBuf>,

    #[command(flatten)]
    limits: LimitArgs,
}

#[derive(Args, Debug)]
struct LimitArgs {
    /// Largest amount a transfer, earn or spend may move
    #[arg(long, env = "COIN_LEDGER_MAX_TRANSFER", default_value_t = LedgerConfig::DEFAULT_MAX_TRANSFER_AMOUNT)]
    max_transfer: u64,

    /// Wait per account lock before backing off
    #[arg(long, env = "COIN_LEDGER_LOCK_TIMEOUT_MS", default_value_t = 50)]
    lock_timeout_ms: u64,

    /// Lock attempts before an operation fails with a conflict
    #[arg(long, env = "COIN_LEDGER_MAX_ATTEMPTS", default_value_t = 8)]
    max_attempts: u32,
}

impl LimitArgs {
    fn config(&self) -> LedgerConfig {
        LedgerConfig {
            max_transfer_amount: self.max_transfer,
            lock_timeout: Duration::from_millis(self.lock_timeout_ms),
            max_attempts: self.max_attempts,
            ..LedgerConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    coin_ledger::logging::init(cli.log_json);

    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Replay { input, limits } => {
            let file = File::open(&input)
                .with_context(|| format!("opening '{}'", input.display()))?;
            let engine = process_operations(limits.config(), BufReader::new(file))
                .context("processing operations")?;
            write_accounts(&engine, std::io::stdout()).context("writing balances")?;
            Ok(())
        }
        Command::Audit { journal } => audit(&journal),
    }
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let config = args.limits.config();
    let engine = match &args.journal {
        Some(path) => Engine::open(config, path)
            .with_context(|| format!("opening journal '{}'", path.display()))?,
        None => Engine::with_config(config),
    };

    let app = api::router(Arc::new(engine));
    let listener = TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("binding {}", args.bind))?;
    info!(addr = %args.bind, journal = ?args.journal, "coin ledger listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await
        .context("serving HTTP")?;
    Ok(())
}

fn audit(path: &Path) -> anyhow::Result<()> {
    let file =
        File::open(path).with_context(|| format!("opening journal '{}'", path.display()))?;
    let records = read_records(BufReader::new(file))?;

    let engine = Engine::new();
    engine.replay(records)?;

    let mismatches = engine.audit_all();
    for report in &mismatches {
        warn!(
            account = %report.account_id,
            cached = report.cached_balance,
            derived = %report.derived_balance,
            "inconsistent account"
        );
    }
    info!(
        accounts = engine.store().len(),
        entries = engine.log().len(),
        mismatches = mismatches.len(),
        "audit finished"
    );
    write_accounts(&engine, std::io::stdout())?;

    if !mismatches.is_empty() {
        bail!("{} account(s) failed the audit", mismatches.len());
    }
    Ok(())
}

/// Raw CSV record matching the input format.
///
/// Fields: `op, account, counterparty, amount, key, memo`
#[derive(Debug, Deserialize)]
struct CsvRecord {
    op: String,
    account: String,
    #[serde(default)]
    counterparty: Option<String>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    amount: Option<i64>,
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    memo: Option<String>,
}

/// A parsed CSV row.
#[derive(Debug)]
enum Row {
    Open(AccountId),
    Deactivate(AccountId),
    Apply(Operation),
}

impl CsvRecord {
    /// Converts a CSV record into a ledger action.
    ///
    /// Returns `None` for unknown ops or missing required fields. Rows
    /// without a key get one derived from their position in the file.
    fn into_row(self, row_number: u64) -> Option<Row> {
        let account = non_empty(Some(self.account)).map(AccountId)?;
        let idempotency_key = IdempotencyKey(
            non_empty(self.key).unwrap_or_else(|| format!("csv-row-{row_number}")),
        );
        let memo = non_empty(self.memo);

        match self.op.to_lowercase().as_str() {
            "open" => Some(Row::Open(account)),
            "deactivate" => Some(Row::Deactivate(account)),
            "transfer" => Some(Row::Apply(Operation::Transfer {
                from: account,
                to: non_empty(self.counterparty).map(AccountId)?,
                amount: self.amount?,
                idempotency_key,
                message: memo,
            })),
            "earn" => Some(Row::Apply(Operation::Earn {
                account,
                amount: self.amount?,
                reason: memo,
                idempotency_key,
            })),
            "spend" => Some(Row::Apply(Operation::Spend {
                account,
                amount: self.amount?,
                reason: memo,
                idempotency_key,
            })),
            "adjust" => Some(Row::Apply(Operation::Adjust {
                account,
                delta: self.amount?,
                reason: memo,
                idempotency_key,
            })),
            _ => None,
        }
    }
}

fn non_empty(field: Option<String>) -> Option<String> {
    field.filter(|value| !value.is_empty())
}

/// Applies operations from a CSV reader to a fresh engine.
///
/// Rows are streamed, so input size is not bounded by memory. Malformed rows
/// and rejected operations are logged and skipped.
///
/// # CSV Format
///
/// Expected columns: `op, account, counterparty, amount, key, memo`
/// - `op`: open, deactivate, earn, spend, adjust or transfer
/// - `counterparty`: recipient of a transfer, empty otherwise
/// - `amount`: integer coins; signed for adjust, empty for open/deactivate
/// - `key`: idempotency key; repeated keys are replays
///
/// # Example
///
/// ```csv
/// op,account,counterparty,amount,key,memo
/// open,alice,,,,
/// open,bob,,,,
/// earn,alice,,100,r-1,task reward
/// transfer,alice,bob,40,t-1,thanks
/// ```
///
/// # Errors
///
/// Returns a CSV error if the reader fails.
pub fn process_operations<R: Read>(config: LedgerConfig, reader: R) -> Result<Engine, csv::Error> {
    let engine = Engine::with_config(config);

    let mut rdr = ReaderBuilder::new()
        .trim(Trim::All)
        .flexible(true)
        .has_headers(true)
        .from_reader(reader);

    for (index, result) in rdr.deserialize::<CsvRecord>().enumerate() {
        let row_number = index as u64 + 1;
        let record = match result {
            Ok(record) => record,
            Err(e) => {
                warn!(row = row_number, error = %e, "skipping malformed row");
                continue;
            }
        };

        let Some(row) = record.into_row(row_number) else {
            warn!(row = row_number, "skipping invalid row");
            continue;
        };

        let outcome = match row {
            Row::Open(account) => engine.ensure_account(&account).map(|_| ()),
            Row::Deactivate(account) => engine.deactivate(&account).map(|_| ()),
            Row::Apply(operation) => engine.process(operation).map(|_| ()),
        };
        if let Err(e) = outcome {
            warn!(row = row_number, error = %e, "skipping rejected row");
        }
    }

    Ok(engine)
}

/// Writes account balances to a CSV writer, ordered by account id.
///
/// # CSV Format
///
/// Columns: `account, balance, active`
///
/// ```csv
/// account,balance,active
/// alice,60,true
/// bob,40,true
/// ```
pub fn write_accounts<W: Write>(engine: &Engine, writer: W) -> Result<(), csv::Error> {
    let mut wtr = Writer::from_writer(writer);

    for id in engine.store().ids() {
        match engine.store().get(&id) {
            Ok(account) => wtr.serialize(&*account)?,
            Err(LedgerError::NotFound) => continue,
            Err(e) => warn!(account = %id, error = %e, "skipping account"),
        }
    }

    wtr.flush()?;
    Ok(())
}
