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

//! Client-side balance with optimistic updates.
//!
//! A front end shows the effect of a transfer before the ledger confirms it.
//! [`OptimisticBalance`] keeps that guess apart from the confirmed value:
//!
//! ```text
//!   submit ──► Pending ──confirm──► folded into confirmed
//!                 │
//!                 └────reject────► dropped
//! ```
//!
//! `reconcile` replaces the confirmed value with the ledger's answer, which
//! always wins over local bookkeeping.

use crate::base::{AccountId, IdempotencyKey};
use crate::transaction::TransactionEntry;
use std::collections::{BTreeMap, HashSet};

/// Balance as shown to one account holder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptimisticBalance {
    account: AccountId,
    confirmed: u64,
    pending: BTreeMap<IdempotencyKey, i64>,
}

impl OptimisticBalance {
    pub fn new(account: AccountId, confirmed: u64) -> Self {
        Self {
            account,
            confirmed,
            pending: BTreeMap::new(),
        }
    }

    /// Last balance reported by the ledger, plus confirmed local changes.
    pub fn confirmed(&self) -> u64 {
        self.confirmed
    }

    /// What the UI should display: confirmed plus every pending delta,
    /// floored at zero.
    pub fn display(&self) -> u64 {
        let pending: i128 = self.pending.values().map(|d| i128::from(*d)).sum();
        let shown = i128::from(self.confirmed) + pending;
        u64::try_from(shown.max(0)).unwrap_or(u64::MAX)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, key: &IdempotencyKey) -> bool {
        self.pending.contains_key(key)
    }

    /// Records a request sent to the ledger. Resubmitting a key replaces its
    /// delta rather than stacking it.
    pub fn submit(&mut self, key: &IdempotencyKey, delta: i64) {
        self.pending.insert(key.clone(), delta);
    }

    /// Applies the ledger's confirmation of a pending request.
    ///
    /// The confirmed delta is taken from the entry, not from the local guess.
    /// Entries that do not touch this account only clear the pending item.
    pub fn confirm(&mut self, entry: &TransactionEntry) {
        if self.pending.remove(&entry.idempotency_key).is_none() {
            return;
        }
        let delta = entry.signed_amount_for(&self.account);
        let updated = (i128::from(self.confirmed) + delta).max(0);
        self.confirmed = u64::try_from(updated).unwrap_or(u64::MAX);
    }

    /// Drops a pending request the ledger refused.
    pub fn reject(&mut self, key: &IdempotencyKey) -> bool {
        self.pending.remove(key).is_some()
    }

    /// Adopts the authoritative balance.
    ///
    /// `committed` are idempotency keys the ledger reports as committed
    /// (e.g. from the newest history page); they are already included in
    /// `authoritative` and stop being pending.
    pub fn reconcile<'a>(
        &mut self,
        authoritative: u64,
        committed: impl IntoIterator<Item = &'a IdempotencyKey>,
    ) {
        let committed: HashSet<&IdempotencyKey> = committed.into_iter().collect();
        self.pending.retain(|key, _| !committed.contains(key));
        self.confirmed = authoritative;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::EntryId;
    use crate::transaction::TransactionKind;
    use chrono::Utc;

    fn transfer(key: &str, from: &str, to: &str, amount: u64) -> TransactionEntry {
        TransactionEntry {
            id: EntryId(1),
            from_account: Some(AccountId::new(from)),
            to_account: Some(AccountId::new(to)),
            amount,
            kind: TransactionKind::Transfer,
            timestamp: Utc::now(),
            idempotency_key: IdempotencyKey::new(key),
            message: None,
        }
    }

    #[test]
    fn pending_transfer_is_displayed_before_confirmation() {
        let mut view = OptimisticBalance::new(AccountId::new("alice"), 100);
        view.submit(&"t1".into(), -40);

        assert_eq!(view.display(), 60);
        assert_eq!(view.confirmed(), 100);
        assert!(view.is_pending(&"t1".into()));
    }

    #[test]
    fn confirm_uses_the_committed_amount() {
        let mut view = OptimisticBalance::new(AccountId::new("alice"), 100);
        view.submit(&"t1".into(), -40);
        view.confirm(&transfer("t1", "alice", "bob", 40));

        assert_eq!(view.confirmed(), 60);
        assert_eq!(view.display(), 60);
        assert_eq!(view.pending_count(), 0);
    }

    #[test]
    fn reject_restores_confirmed_value() {
        let mut view = OptimisticBalance::new(AccountId::new("alice"), 100);
        view.submit(&"t1".into(), -400);
        assert_eq!(view.display(), 0);

        assert!(view.reject(&"t1".into()));
        assert_eq!(view.display(), 100);
    }

    #[test]
    fn resubmitting_a_key_does_not_double_count() {
        let mut view = OptimisticBalance::new(AccountId::new("alice"), 100);
        view.submit(&"t1".into(), -10);
        view.submit(&"t1".into(), -10);
        assert_eq!(view.display(), 90);
    }

    #[test]
    fn reconcile_adopts_server_balance_and_clears_committed() {
        let mut view = OptimisticBalance::new(AccountId::new("alice"), 100);
        view.submit(&"t1".into(), -40);
        view.submit(&"t2".into(), -10);

        let committed = [IdempotencyKey::new("t1")];
        view.reconcile(60, committed.iter());

        assert_eq!(view.confirmed(), 60);
        assert!(!view.is_pending(&"t1".into()));
        assert!(view.is_pending(&"t2".into()));
        assert_eq!(view.display(), 50);
    }

    #[test]
    fn unknown_confirmation_is_ignored() {
        let mut view = OptimisticBalance::new(AccountId::new("alice"), 100);
        view.confirm(&transfer("other", "alice", "bob", 40));
        assert_eq!(view.confirmed(), 100);
    }
}
