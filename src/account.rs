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

//! Account state.
//!
//! The balance held here is a cache derived from the transaction log. It is
//! only changed by the engine while it holds the account lock, right after
//! the matching entry was appended.
//!
//! # Example
//!
//! ```
//! use coin_ledger::{Account, AccountId};
//!
//! let account = Account::new(AccountId::new("alice"));
//! assert_eq!(account.balance(), 0);
//! assert!(account.is_active());
//! ```

use crate::LedgerError;
use crate::base::AccountId;
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use serde::ser::{SerializeStruct, Serializer};
use std::time::Duration;

//  Active ──deactivate──► Deactivated
//
// Deactivated accounts keep their balance and history but reject transfers,
// earn and spend. System adjustments still apply.
#[derive(Debug)]
pub(crate) struct AccountData {
    balance: u64,
    active: bool,
}

impl AccountData {
    fn new() -> Self {
        Self {
            balance: 0,
            active: true,
        }
    }

    pub(crate) fn balance(&self) -> u64 {
        self.balance
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active
    }

    pub(crate) fn ensure_active(&self) -> Result<(), LedgerError> {
        if !self.active {
            return Err(LedgerError::AccountDeactivated);
        }
        Ok(())
    }

    /// Fails unless the balance covers `amount`.
    pub(crate) fn ensure_covers(&self, amount: u64) -> Result<(), LedgerError> {
        if self.balance < amount {
            return Err(LedgerError::InsufficientBalance);
        }
        Ok(())
    }

    /// Increases the cached balance.
    pub(crate) fn credit(&mut self, amount: u64) -> Result<(), LedgerError> {
        if amount == 0 {
            return Err(LedgerError::InvalidAmount);
        }
        self.balance = self
            .balance
            .checked_add(amount)
            .ok_or(LedgerError::InvalidAmount)?;
        Ok(())
    }

    /// Decreases the cached balance.
    pub(crate) fn debit(&mut self, amount: u64) -> Result<(), LedgerError> {
        if amount == 0 {
            return Err(LedgerError::InvalidAmount);
        }
        self.ensure_covers(amount)?;
        self.balance -= amount;
        Ok(())
    }

    /// Overwrites the cached balance. Callers hold the lock and have already
    /// logged the entry that justifies the new value.
    pub(crate) fn set_balance(&mut self, balance: u64) {
        self.balance = balance;
    }

    pub(crate) fn deactivate(&mut self) -> bool {
        std::mem::replace(&mut self.active, false)
    }
}

/// Ledger account.
#[derive(Debug)]
pub struct Account {
    id: AccountId,
    inner: Mutex<AccountData>,
}

impl Account {
    pub fn new(id: AccountId) -> Self {
        Self {
            id,
            inner: Mutex::new(AccountData::new()),
        }
    }

    pub fn id(&self) -> &AccountId {
        &self.id
    }

    pub fn balance(&self) -> u64 {
        self.inner.lock().balance
    }

    pub fn is_active(&self) -> bool {
        self.inner.lock().active
    }

    /// Copies balance and status under a single lock.
    pub fn snapshot(&self) -> AccountSnapshot {
        let data = self.inner.lock();
        AccountSnapshot {
            account_id: self.id.clone(),
            balance: data.balance,
            active: data.active,
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, AccountData> {
        self.inner.lock()
    }

    pub(crate) fn try_lock_for(&self, timeout: Duration) -> Option<MutexGuard<'_, AccountData>> {
        self.inner.try_lock_for(timeout)
    }
}

impl Serialize for Account {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let data = self.inner.lock();
        let mut state = serializer.serialize_struct("Account", 3)?;
        state.serialize_field("account", &self.id)?;
        state.serialize_field("balance", &data.balance)?;
        state.serialize_field("active", &data.active)?;
        state.end()
    }
}

/// Point-in-time copy of an account, safe to hand out to readers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountSnapshot {
    pub account_id: AccountId,
    pub balance: u64,
    pub active: bool,
}
