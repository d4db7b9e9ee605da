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

//! # Coin Ledger
//!
//! This library provides an append-only ledger for an in-app coin currency:
//! user-to-user transfers, system earn/spend credits and corrections, all
//! idempotent and safe under concurrent requests.
//!
//! ## Core Components
//!
//! - [`Engine`]: The only writer of balances; validates, locks and commits operations
//! - [`AccountStore`]: Accounts and their cached balances
//! - [`TransactionLog`]: Append-only source of truth, indexed by idempotency key and account
//! - [`Journal`]: Optional JSON-lines file the log is persisted to
//! - [`LedgerError`]: Error types for rejected operations
//!
//! ## Example
//!
//! ```
//! use coin_ledger::{AccountId, Engine, IdempotencyKey};
//!
//! let engine = Engine::new();
//! let alice = AccountId::new("alice");
//! let bob = AccountId::new("bob");
//! engine.ensure_account(&alice).unwrap();
//! engine.ensure_account(&bob).unwrap();
//!
//! engine
//!     .earn(alice.clone(), 100, Some("task reward".into()), IdempotencyKey::new("r-1"))
//!     .unwrap();
//! engine
//!     .transfer(alice.clone(), bob.clone(), 40, IdempotencyKey::new("t-1"), None)
//!     .unwrap();
//!
//! // Retrying with the same key returns the original entry.
//! let retry = engine
//!     .transfer(alice.clone(), bob.clone(), 40, IdempotencyKey::new("t-1"), None)
//!     .unwrap();
//! assert!(retry.replayed);
//!
//! assert_eq!(engine.get_balance(&alice).unwrap(), 60);
//! assert_eq!(engine.get_balance(&bob).unwrap(), 40);
//! ```
//!
//! ## Thread Safety
//!
//! The engine locks only the accounts an operation touches, so operations on
//! disjoint accounts proceed in parallel.

pub mod account;
mod account_store;
pub mod api;
mod base;
mod config;
mod engine;
pub mod error;
pub mod journal;
pub mod logging;
mod query;
mod transaction;
mod transaction_log;
mod view;

pub use account::{Account, AccountSnapshot};
pub use account_store::AccountStore;
pub use base::{AccountId, EntryId, IdempotencyKey};
pub use config::LedgerConfig;
pub use engine::{Engine, Receipt};
pub use error::LedgerError;
pub use journal::{Journal, JournalError, JournalRecord};
pub use query::AuditReport;
pub use transaction::{Operation, TransactionEntry, TransactionKind};
pub use transaction_log::{HistoryPage, TransactionLog};
pub use view::OptimisticBalance;
