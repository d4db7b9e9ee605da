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

//! Ledger engine.
//!
//! The [`Engine`] is the only component allowed to change a balance. Every
//! operation follows the same commit path:
//!
//! 1. Return the committed entry unchanged if the idempotency key is known.
//! 2. Validate the amount and resolve the accounts.
//! 3. Lock the involved accounts in ascending id order, waiting at most
//!    `lock_timeout` per lock; on timeout release everything, back off and
//!    retry, up to `max_attempts`, then fail with [`LedgerError::Conflict`].
//! 4. Under the locks, re-check the key and the balance, append the entry to
//!    the log, then write the new cached balances.
//!
//! Nothing that can fail runs after the append, so a transfer is either fully
//! applied (one entry, both balances) or not applied at all.
//!
//! # Thread Safety
//!
//! Operations on disjoint accounts run in parallel. Operations sharing an
//! account serialize on that account's mutex.

use crate::LedgerError;
use crate::account::{Account, AccountData};
use crate::account_store::AccountStore;
use crate::base::{AccountId, IdempotencyKey};
use crate::config::LedgerConfig;
use crate::journal::{Journal, JournalError, JournalRecord};
use crate::transaction::{Operation, TransactionEntry, TransactionKind};
use crate::transaction_log::TransactionLog;
use chrono::Utc;
use crossbeam::utils::Backoff;
use parking_lot::MutexGuard;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of a successful balance-changing operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub entry: Arc<TransactionEntry>,
    /// `true` when the idempotency key had already been committed and the
    /// original entry is returned without applying anything.
    pub replayed: bool,
}

/// A validated operation, ready to be committed.
struct Posting {
    debit: Option<Arc<Account>>,
    credit: Option<Arc<Account>>,
    amount: u64,
    kind: TransactionKind,
    message: Option<String>,
    idempotency_key: IdempotencyKey,
    require_active: bool,
}

/// Ledger engine managing accounts and the transaction log.
///
/// # Invariants
///
/// - Every account balance equals the signed sum of the log entries that
///   reference it.
/// - Balances never go below zero.
/// - An idempotency key is committed at most once.
pub struct Engine {
    pub(crate) config: LedgerConfig,
    pub(crate) accounts: AccountStore,
    pub(crate) log: TransactionLog,
}

impl Engine {
    /// Creates an in-memory engine with default limits.
    pub fn new() -> Self {
        Self::with_config(LedgerConfig::default())
    }

    pub fn with_config(config: LedgerConfig) -> Self {
        Self {
            config,
            accounts: AccountStore::new(),
            log: TransactionLog::new(),
        }
    }

    /// Creates an empty engine that journals every commit.
    pub fn with_journal(config: LedgerConfig, journal: Journal) -> Self {
        Self {
            config,
            accounts: AccountStore::new(),
            log: TransactionLog::with_journal(journal),
        }
    }

    /// Opens the journal at `path`, replays it and keeps appending to it.
    ///
    /// Balances are rebuilt from the replayed entries only.
    pub fn open(config: LedgerConfig, path: impl AsRef<Path>) -> Result<Self, JournalError> {
        let (journal, records) = Journal::open(path)?;
        let engine = Self::with_journal(config, journal);
        engine.replay(records)?;
        Ok(engine)
    }

    /// Applies journal records without validation or journaling.
    pub fn replay(
        &self,
        records: impl IntoIterator<Item = JournalRecord>,
    ) -> Result<(), JournalError> {
        let mut replayed = 0usize;
        for record in records {
            match record {
                JournalRecord::AccountOpened { account } => {
                    self.accounts.ensure_account(&account);
                }
                JournalRecord::AccountDeactivated { account } => {
                    self.accounts.ensure_account(&account);
                    let _ = self.accounts.deactivate(&account);
                }
                JournalRecord::Entry(entry) => {
                    self.replay_entry(entry)?;
                    replayed += 1;
                }
            }
        }
        info!(
            entries = replayed,
            accounts = self.accounts.len(),
            "journal replayed"
        );
        Ok(())
    }

    fn replay_entry(&self, entry: TransactionEntry) -> Result<(), JournalError> {
        let id = entry.id;
        let fail = |source| JournalError::Replay { entry: id, source };

        let mut sides = Vec::with_capacity(2);
        if let Some(from) = &entry.from_account {
            self.accounts.ensure_account(from);
            sides.push((self.accounts.get(from).map_err(fail)?, false));
        }
        if let Some(to) = &entry.to_account {
            self.accounts.ensure_account(to);
            sides.push((self.accounts.get(to).map_err(fail)?, true));
        }

        let amount = entry.amount;
        self.log.restore(entry).map_err(fail)?;
        for (account, is_credit) in sides {
            let mut data = account.lock();
            if is_credit {
                data.credit(amount).map_err(fail)?;
            } else {
                data.debit(amount).map_err(fail)?;
            }
        }
        Ok(())
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn store(&self) -> &AccountStore {
        &self.accounts
    }

    pub fn log(&self) -> &TransactionLog {
        &self.log
    }

    /// Creates a zero-balance account if absent.
    ///
    /// Returns `true` when the account was created by this call.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::SystemUnavailable`] if the journal write failed.
    pub fn ensure_account(&self, account: &AccountId) -> Result<bool, LedgerError> {
        if self.accounts.contains(account) {
            return Ok(false);
        }
        self.log.record_event(&JournalRecord::AccountOpened {
            account: account.clone(),
        })?;
        Ok(self.accounts.ensure_account(account))
    }

    /// Soft-deletes an account. Its balance and history stay readable.
    ///
    /// Returns `true` if the account was active before this call.
    pub fn deactivate(&self, account_id: &AccountId) -> Result<bool, LedgerError> {
        let account = self.accounts.get(account_id)?;
        let mut data = account.lock();
        if !data.is_active() {
            return Ok(false);
        }
        self.log.record_event(&JournalRecord::AccountDeactivated {
            account: account_id.clone(),
        })?;
        data.deactivate();
        info!(account = %account_id, balance = data.balance(), "account deactivated");
        Ok(true)
    }

    /// Moves coins between two accounts.
    pub fn transfer(
        &self,
        from: AccountId,
        to: AccountId,
        amount: i64,
        idempotency_key: IdempotencyKey,
        message: Option<String>,
    ) -> Result<Receipt, LedgerError> {
        self.process(Operation::Transfer {
            from,
            to,
            amount,
            idempotency_key,
            message,
        })
    }

    /// Credits an account from the system, e.g. a task completion reward.
    pub fn earn(
        &self,
        account: AccountId,
        amount: i64,
        reason: Option<String>,
        idempotency_key: IdempotencyKey,
    ) -> Result<Receipt, LedgerError> {
        self.process(Operation::Earn {
            account,
            amount,
            reason,
            idempotency_key,
        })
    }

    /// Debits an account back to the system.
    pub fn spend(
        &self,
        account: AccountId,
        amount: i64,
        reason: Option<String>,
        idempotency_key: IdempotencyKey,
    ) -> Result<Receipt, LedgerError> {
        self.process(Operation::Spend {
            account,
            amount,
            reason,
            idempotency_key,
        })
    }

    /// Records a signed system correction.
    pub fn adjust(
        &self,
        account: AccountId,
        delta: i64,
        reason: Option<String>,
        idempotency_key: IdempotencyKey,
    ) -> Result<Receipt, LedgerError> {
        self.process(Operation::Adjust {
            account,
            delta,
            reason,
            idempotency_key,
        })
    }

    /// Validates and commits an operation.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::InvalidAmount`] - Amount is not positive or exceeds the configured maximum.
    /// - [`LedgerError::SelfTransfer`] - Sender and recipient are the same.
    /// - [`LedgerError::NotFound`] - An account does not exist.
    /// - [`LedgerError::AccountDeactivated`] - An account was deactivated.
    /// - [`LedgerError::InsufficientBalance`] - The debited balance does not cover the amount.
    /// - [`LedgerError::Conflict`] - Locks could not be acquired within the retry budget.
    /// - [`LedgerError::SystemUnavailable`] - The journal write failed.
    ///
    /// A known idempotency key is never an error: the original entry is
    /// returned with [`Receipt::replayed`] set.
    pub fn process(&self, operation: Operation) -> Result<Receipt, LedgerError> {
        if let Some(entry) = self.log.get_by_key(operation.idempotency_key()) {
            return Ok(replayed(&operation, entry));
        }

        let posting = self.plan(&operation)?;
        let backoff = Backoff::new();

        for attempt in 1..=self.config.max_attempts.max(1) {
            if let Some(receipt) = self.try_commit(&operation, &posting)? {
                return Ok(receipt);
            }
            debug!(
                key = %posting.idempotency_key,
                attempt,
                "account lock contended, backing off"
            );
            backoff.snooze();
        }

        warn!(
            key = %posting.idempotency_key,
            attempts = self.config.max_attempts,
            "giving up after lock contention"
        );
        Err(LedgerError::Conflict)
    }

    fn plan(&self, operation: &Operation) -> Result<Posting, LedgerError> {
        let posting = match operation {
            Operation::Transfer {
                from,
                to,
                amount,
                idempotency_key,
                message,
            } => {
                let amount = self.checked_amount(*amount)?;
                if from == to {
                    return Err(LedgerError::SelfTransfer);
                }
                Posting {
                    debit: Some(self.accounts.get(from)?),
                    credit: Some(self.accounts.get(to)?),
                    amount,
                    kind: TransactionKind::Transfer,
                    message: message.clone(),
                    idempotency_key: idempotency_key.clone(),
                    require_active: true,
                }
            }
            Operation::Earn {
                account,
                amount,
                reason,
                idempotency_key,
            } => Posting {
                amount: self.checked_amount(*amount)?,
                debit: None,
                credit: Some(self.accounts.get(account)?),
                kind: TransactionKind::Earned,
                message: reason.clone(),
                idempotency_key: idempotency_key.clone(),
                require_active: true,
            },
            Operation::Spend {
                account,
                amount,
                reason,
                idempotency_key,
            } => Posting {
                amount: self.checked_amount(*amount)?,
                debit: Some(self.accounts.get(account)?),
                credit: None,
                kind: TransactionKind::Spent,
                message: reason.clone(),
                idempotency_key: idempotency_key.clone(),
                require_active: true,
            },
            Operation::Adjust {
                account,
                delta,
                reason,
                idempotency_key,
            } => {
                if *delta == 0 {
                    return Err(LedgerError::InvalidAmount);
                }
                let target = self.accounts.get(account)?;
                let (debit, credit) = if *delta > 0 {
                    (None, Some(target))
                } else {
                    (Some(target), None)
                };
                Posting {
                    debit,
                    credit,
                    amount: delta.unsigned_abs(),
                    kind: TransactionKind::SystemAdjustment,
                    message: reason.clone(),
                    idempotency_key: idempotency_key.clone(),
                    require_active: false,
                }
            }
        };
        Ok(posting)
    }

    fn checked_amount(&self, amount: i64) -> Result<u64, LedgerError> {
        let amount = u64::try_from(amount).map_err(|_| LedgerError::InvalidAmount)?;
        if amount == 0 || amount > self.config.max_transfer_amount {
            return Err(LedgerError::InvalidAmount);
        }
        Ok(amount)
    }

    /// One locked commit attempt. `Ok(None)` means a lock timed out.
    fn try_commit(
        &self,
        operation: &Operation,
        posting: &Posting,
    ) -> Result<Option<Receipt>, LedgerError> {
        let timeout = self.config.lock_timeout;

        let (mut debit, mut credit): (
            Option<MutexGuard<'_, AccountData>>,
            Option<MutexGuard<'_, AccountData>>,
        ) = match (&posting.debit, &posting.credit) {
            (Some(from), Some(to)) if from.id() < to.id() => {
                let Some(from_guard) = from.try_lock_for(timeout) else {
                    return Ok(None);
                };
                let Some(to_guard) = to.try_lock_for(timeout) else {
                    return Ok(None);
                };
                (Some(from_guard), Some(to_guard))
            }
            (Some(from), Some(to)) => {
                let Some(to_guard) = to.try_lock_for(timeout) else {
                    return Ok(None);
                };
                let Some(from_guard) = from.try_lock_for(timeout) else {
                    return Ok(None);
                };
                (Some(from_guard), Some(to_guard))
            }
            (Some(from), None) => {
                let Some(guard) = from.try_lock_for(timeout) else {
                    return Ok(None);
                };
                (Some(guard), None)
            }
            (None, Some(to)) => {
                let Some(guard) = to.try_lock_for(timeout) else {
                    return Ok(None);
                };
                (None, Some(guard))
            }
            (None, None) => return Err(LedgerError::NotFound),
        };

        // A concurrent request with the same key may have committed while we
        // waited for the locks.
        if let Some(entry) = self.log.get_by_key(&posting.idempotency_key) {
            return Ok(Some(replayed(operation, entry)));
        }

        if posting.require_active {
            for data in debit.iter().chain(credit.iter()) {
                data.ensure_active()?;
            }
        }

        let new_debit_balance = match &debit {
            Some(data) => {
                data.ensure_covers(posting.amount)?;
                Some(data.balance() - posting.amount)
            }
            None => None,
        };
        let new_credit_balance = match &credit {
            Some(data) => Some(
                data.balance()
                    .checked_add(posting.amount)
                    .ok_or(LedgerError::InvalidAmount)?,
            ),
            None => None,
        };

        let entry = TransactionEntry {
            id: self.log.next_entry_id(),
            from_account: posting.debit.as_ref().map(|a| a.id().clone()),
            to_account: posting.credit.as_ref().map(|a| a.id().clone()),
            amount: posting.amount,
            kind: posting.kind,
            timestamp: Utc::now(),
            idempotency_key: posting.idempotency_key.clone(),
            message: posting.message.clone(),
        };

        match self.log.append(entry.clone()) {
            Ok(_) => {}
            Err(LedgerError::DuplicateIdempotencyKey) => {
                // Lost the race for the key to a request on other accounts.
                let original = self
                    .log
                    .get_by_key(&posting.idempotency_key)
                    .ok_or(LedgerError::DuplicateIdempotencyKey)?;
                return Ok(Some(replayed(operation, original)));
            }
            Err(e) => return Err(e),
        }

        if let (Some(data), Some(balance)) = (debit.as_mut(), new_debit_balance) {
            data.set_balance(balance);
        }
        if let (Some(data), Some(balance)) = (credit.as_mut(), new_credit_balance) {
            data.set_balance(balance);
        }

        debug!(
            entry = %entry.id,
            kind = ?entry.kind,
            from = ?entry.from_account,
            to = ?entry.to_account,
            amount = entry.amount,
            "entry committed"
        );

        Ok(Some(Receipt {
            entry: Arc::new(entry),
            replayed: false,
        }))
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

fn replayed(operation: &Operation, entry: Arc<TransactionEntry>) -> Receipt {
    if !operation.matches(&entry) {
        warn!(
            key = %entry.idempotency_key,
            entry = %entry.id,
            "idempotency key reused with different parameters, returning original entry"
        );
    }
    Receipt {
        entry,
        replayed: true,
    }
}
