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

//! Read side of the ledger: balances, history and audits.
//!
//! Operations return only after both cached balances were written, so a
//! caller always reads its own writes. History reads never take account
//! locks and may trail concurrent writers by an entry.

use crate::LedgerError;
use crate::account::AccountSnapshot;
use crate::base::AccountId;
use crate::engine::Engine;
use crate::transaction_log::HistoryPage;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

/// Cached balance compared with the balance implied by the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditReport {
    pub account_id: AccountId,
    pub cached_balance: u64,
    pub derived_balance: i128,
    pub entries: usize,
}

impl AuditReport {
    pub fn is_consistent(&self) -> bool {
        i128::from(self.cached_balance) == self.derived_balance
    }
}

impl Engine {
    /// Current balance of an account.
    pub fn get_balance(&self, account: &AccountId) -> Result<u64, LedgerError> {
        self.accounts.get_balance(account)
    }

    /// A page of the account's history, newest first.
    ///
    /// `page_size` defaults to the configured page size and is clamped to the
    /// configured maximum.
    pub fn get_history(
        &self,
        account: &AccountId,
        page_size: Option<usize>,
        page_token: Option<&str>,
    ) -> Result<HistoryPage, LedgerError> {
        if !self.accounts.contains(account) {
            return Err(LedgerError::NotFound);
        }
        self.log
            .list_for(account, self.config.page_size(page_size), page_token)
    }

    /// Snapshot of every account, ordered by id.
    pub fn accounts(&self) -> Vec<AccountSnapshot> {
        self.accounts.snapshots()
    }

    /// Compares an account's cached balance with its log.
    ///
    /// Holds the account lock while summing, so no commit touching the
    /// account can interleave.
    pub fn audit(&self, account_id: &AccountId) -> Result<AuditReport, LedgerError> {
        let account = self.accounts.get(account_id)?;
        let data = account.lock();
        let entries = self.log.entries_for(account_id);
        let derived_balance = entries
            .iter()
            .map(|entry| entry.signed_amount_for(account_id))
            .sum();

        let report = AuditReport {
            account_id: account_id.clone(),
            cached_balance: data.balance(),
            derived_balance,
            entries: entries.len(),
        };
        if !report.is_consistent() {
            warn!(
                account = %account_id,
                cached = report.cached_balance,
                derived = %report.derived_balance,
                "cached balance diverged from log"
            );
        }
        Ok(report)
    }

    /// Audits every account and returns the inconsistent ones.
    pub fn audit_all(&self) -> Vec<AuditReport> {
        self.accounts
            .ids()
            .iter()
            .filter_map(|id| self.audit(id).ok())
            .filter(|report| !report.is_consistent())
            .collect()
    }

    /// Resets an account's cached balance to the value implied by its log.
    ///
    /// Returns the report taken before the repair.
    pub fn reconcile(&self, account_id: &AccountId) -> Result<AuditReport, LedgerError> {
        let account = self.accounts.get(account_id)?;
        let mut data = account.lock();
        let entries = self.log.entries_for(account_id);
        let derived_balance: i128 = entries
            .iter()
            .map(|entry| entry.signed_amount_for(account_id))
            .sum();

        let report = AuditReport {
            account_id: account_id.clone(),
            cached_balance: data.balance(),
            derived_balance,
            entries: entries.len(),
        };
        if !report.is_consistent() {
            match u64::try_from(derived_balance) {
                Ok(balance) => {
                    warn!(
                        account = %account_id,
                        from = report.cached_balance,
                        to = balance,
                        "reconciled cached balance from log"
                    );
                    data.set_balance(balance);
                }
                Err(_) => {
                    error!(
                        account = %account_id,
                        derived = %derived_balance,
                        "log implies an unrepresentable balance, leaving cache untouched"
                    );
                }
            }
        }
        Ok(report)
    }
}
