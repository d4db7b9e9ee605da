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

//! Concurrent account registry.

use crate::LedgerError;
use crate::account::{Account, AccountSnapshot};
use crate::base::AccountId;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use tracing::info;

/// Accounts indexed by id.
///
/// Accounts are handed out as [`Arc`] so callers can drop the map guard
/// before taking the account lock. Holding a [`DashMap`] shard guard while
/// waiting on an account mutex could otherwise block unrelated inserts.
#[derive(Debug, Default)]
pub struct AccountStore {
    accounts: DashMap<AccountId, Arc<Account>>,
}

impl AccountStore {
    pub fn new() -> Self {
        Self {
            accounts: DashMap::new(),
        }
    }

    /// Creates a zero-balance account if absent.
    ///
    /// Returns `true` when the account was created by this call.
    pub fn ensure_account(&self, id: &AccountId) -> bool {
        match self.accounts.entry(id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(Account::new(id.clone())));
                info!(account = %id, "account created");
                true
            }
        }
    }

    /// Looks up an account.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::NotFound`] if no account exists for `id`.
    pub fn get(&self, id: &AccountId) -> Result<Arc<Account>, LedgerError> {
        self.accounts
            .get(id)
            .map(|account| Arc::clone(account.value()))
            .ok_or(LedgerError::NotFound)
    }

    /// Marks an account as deactivated without journaling.
    ///
    /// Returns `true` if the account was active before this call.
    pub fn deactivate(&self, id: &AccountId) -> Result<bool, LedgerError> {
        Ok(self.get(id)?.lock().deactivate())
    }

    pub fn get_balance(&self, id: &AccountId) -> Result<u64, LedgerError> {
        Ok(self.get(id)?.balance())
    }

    pub fn contains(&self, id: &AccountId) -> bool {
        self.accounts.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    /// Snapshots of every account, ordered by id.
    pub fn snapshots(&self) -> Vec<AccountSnapshot> {
        let accounts: Vec<Arc<Account>> = self
            .accounts
            .iter()
            .map(|account| Arc::clone(account.value()))
            .collect();
        let mut snapshots: Vec<AccountSnapshot> =
            accounts.iter().map(|account| account.snapshot()).collect();
        snapshots.sort_by(|a, b| a.account_id.cmp(&b.account_id));
        snapshots
    }

    pub fn ids(&self) -> Vec<AccountId> {
        let mut ids: Vec<AccountId> = self.accounts.iter().map(|a| a.key().clone()).collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_account_is_idempotent() {
        let store = AccountStore::new();
        let id = AccountId::new("alice");

        assert!(store.ensure_account(&id));
        store.get(&id).unwrap().lock().credit(10).unwrap();
        assert!(!store.ensure_account(&id));

        assert_eq!(store.len(), 1);
        assert_eq!(store.get_balance(&id), Ok(10));
    }

    #[test]
    fn unknown_account_is_not_found() {
        let store = AccountStore::new();
        let id = AccountId::new("ghost");
        assert_eq!(store.get_balance(&id), Err(LedgerError::NotFound));
        assert!(store.get(&id).is_err());
        assert!(!store.contains(&id));
    }

    #[test]
    fn deactivate_keeps_balance() {
        let store = AccountStore::new();
        let id = AccountId::new("alice");
        store.ensure_account(&id);
        store.get(&id).unwrap().lock().credit(5).unwrap();

        assert_eq!(store.deactivate(&id), Ok(true));
        assert_eq!(store.deactivate(&id), Ok(false));
        assert_eq!(store.get_balance(&id), Ok(5));
        assert_eq!(
            store.deactivate(&AccountId::new("ghost")),
            Err(LedgerError::NotFound)
        );
    }

    #[test]
    fn snapshots_are_sorted_by_id() {
        let store = AccountStore::new();
        for id in ["carol", "alice", "bob"] {
            store.ensure_account(&AccountId::new(id));
        }

        let ids: Vec<String> = store
            .snapshots()
            .into_iter()
            .map(|s| s.account_id.0)
            .collect();
        assert_eq!(ids, vec!["alice", "bob", "carol"]);
        assert_eq!(store.ids().len(), 3);
    }
}
