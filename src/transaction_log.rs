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

//! Append-only transaction log with idempotency-key deduplication.
//!
//! The log is the source of truth: account balances are caches that must
//! always equal the signed sum of the entries referencing the account.
//!
//! Entries for an account are kept in commit order, so a history page is a
//! slice of that sequence read backwards. Page tokens are positions in the
//! sequence; appends only grow it, so a token never goes stale.

use crate::LedgerError;
use crate::base::{AccountId, EntryId, IdempotencyKey};
use crate::journal::{Journal, JournalRecord};
use crate::transaction::TransactionEntry;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// One page of an account's history, newest entry first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPage {
    pub entries: Vec<TransactionEntry>,
    /// Token for the next (older) page, `None` on the last page.
    pub next_page_token: Option<String>,
}

/// Thread-safe append-only log.
///
/// Combines a [`DashMap`] keyed by idempotency key for atomic duplicate
/// detection with a per-account index preserving commit order.
#[derive(Debug)]
pub struct TransactionLog {
    /// Committed entries by idempotency key.
    by_key: DashMap<IdempotencyKey, Arc<TransactionEntry>>,

    /// Entries referencing each account, oldest first.
    by_account: DashMap<AccountId, Vec<Arc<TransactionEntry>>>,

    next_id: AtomicU64,
    len: AtomicUsize,
    journal: Option<Journal>,
}

impl TransactionLog {
    /// Creates an empty, memory-only log.
    pub fn new() -> Self {
        Self {
            by_key: DashMap::new(),
            by_account: DashMap::new(),
            next_id: AtomicU64::new(1),
            len: AtomicUsize::new(0),
            journal: None,
        }
    }

    /// Creates an empty log that writes every appended entry to `journal`.
    pub fn with_journal(journal: Journal) -> Self {
        Self {
            journal: Some(journal),
            ..Self::new()
        }
    }

    /// Reserves the next entry id.
    ///
    /// Ids are unique and increasing. Ids reserved by operations that end up
    /// failing are simply skipped.
    pub fn next_entry_id(&self) -> EntryId {
        EntryId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Appends a committed entry.
    ///
    /// The journal write, when configured, happens while the idempotency slot
    /// is held, so a failed write leaves no trace.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::DuplicateIdempotencyKey`] if the key was already committed.
    /// - [`LedgerError::SystemUnavailable`] if the journal write failed.
    pub fn append(&self, entry: TransactionEntry) -> Result<EntryId, LedgerError> {
        let id = entry.id;

        // Entry API for atomic check-and-insert across concurrent retries
        match self.by_key.entry(entry.idempotency_key.clone()) {
            Entry::Occupied(_) => Err(LedgerError::DuplicateIdempotencyKey),
            Entry::Vacant(slot) => {
                if let Some(journal) = &self.journal {
                    journal.record(&JournalRecord::Entry(entry.clone()))?;
                }
                let entry = Arc::new(entry);
                slot.insert(Arc::clone(&entry));
                self.index(entry);
                Ok(id)
            }
        }
    }

    /// Writes an account lifecycle record to the journal, if there is one.
    pub(crate) fn record_event(&self, record: &JournalRecord) -> Result<(), LedgerError> {
        match &self.journal {
            Some(journal) => journal.record(record),
            None => Ok(()),
        }
    }

    /// Re-inserts an entry loaded from a journal, bypassing the journal.
    pub fn restore(&self, entry: TransactionEntry) -> Result<EntryId, LedgerError> {
        let id = entry.id;
        match self.by_key.entry(entry.idempotency_key.clone()) {
            Entry::Occupied(_) => Err(LedgerError::DuplicateIdempotencyKey),
            Entry::Vacant(slot) => {
                let entry = Arc::new(entry);
                slot.insert(Arc::clone(&entry));
                self.index(entry);
                self.next_id.fetch_max(id.0 + 1, Ordering::SeqCst);
                Ok(id)
            }
        }
    }

    fn index(&self, entry: Arc<TransactionEntry>) {
        for account in [&entry.from_account, &entry.to_account].into_iter().flatten() {
            self.by_account
                .entry(account.clone())
                .or_default()
                .push(Arc::clone(&entry));
        }
        self.len.fetch_add(1, Ordering::SeqCst);
    }

    /// Returns the entry committed under `key`, if any.
    pub fn get_by_key(&self, key: &IdempotencyKey) -> Option<Arc<TransactionEntry>> {
        self.by_key.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Lists an account's entries, newest first.
    ///
    /// Without a token the listing starts at the newest entry. `page_size` is
    /// treated as at least 1.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InvalidPageToken`] if the token is not one this
    /// log handed out for the account.
    pub fn list_for(
        &self,
        account: &AccountId,
        page_size: usize,
        page_token: Option<&str>,
    ) -> Result<HistoryPage, LedgerError> {
        let page_size = page_size.max(1);
        let Some(entries) = self.by_account.get(account) else {
            return match page_token {
                None => Ok(HistoryPage {
                    entries: Vec::new(),
                    next_page_token: None,
                }),
                Some(_) => Err(LedgerError::InvalidPageToken),
            };
        };

        let end = match page_token {
            None => entries.len(),
            Some(token) => decode_token(token, entries.len())?,
        };
        let start = end.saturating_sub(page_size);

        let page: Vec<TransactionEntry> = entries[start..end]
            .iter()
            .rev()
            .map(|entry| TransactionEntry::clone(entry))
            .collect();
        let next_page_token = (start > 0).then(|| encode_token(start));

        Ok(HistoryPage {
            entries: page,
            next_page_token,
        })
    }

    /// All entries referencing `account`, oldest first.
    pub fn entries_for(&self, account: &AccountId) -> Vec<Arc<TransactionEntry>> {
        self.by_account
            .get(account)
            .map(|entries| entries.value().clone())
            .unwrap_or_default()
    }

    /// Balance implied by the log: credits minus debits.
    pub fn derived_balance(&self, account: &AccountId) -> i128 {
        self.by_account
            .get(account)
            .map(|entries| entries.iter().map(|e| e.signed_amount_for(account)).sum())
            .unwrap_or(0)
    }

    /// Number of committed entries.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TransactionLog {
    fn default() -> Self {
        Self::new()
    }
}

fn encode_token(position: usize) -> String {
    position.to_string()
}

fn decode_token(token: &str, len: usize) -> Result<usize, LedgerError> {
    let position: usize = token.parse().map_err(|_| LedgerError::InvalidPageToken)?;
    if position == 0 || position > len {
        return Err(LedgerError::InvalidPageToken);
    }
    Ok(position)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::TransactionKind;
    use chrono::Utc;

    fn earned(log: &TransactionLog, account: &str, amount: u64, key: &str) -> TransactionEntry {
        TransactionEntry {
            id: log.next_entry_id(),
            from_account: None,
            to_account: Some(AccountId::new(account)),
            amount,
            kind: TransactionKind::Earned,
            timestamp: Utc::now(),
            idempotency_key: IdempotencyKey::new(key),
            message: None,
        }
    }

    #[test]
    fn duplicate_key_is_rejected() {
        let log = TransactionLog::new();
        log.append(earned(&log, "alice", 10, "k1")).unwrap();

        let result = log.append(earned(&log, "alice", 99, "k1"));
        assert_eq!(result, Err(LedgerError::DuplicateIdempotencyKey));
        assert_eq!(log.len(), 1);
        assert_eq!(log.get_by_key(&"k1".into()).unwrap().amount, 10);
    }

    #[test]
    fn entry_ids_increase() {
        let log = TransactionLog::new();
        let first = log.append(earned(&log, "alice", 1, "a")).unwrap();
        let second = log.append(earned(&log, "alice", 1, "b")).unwrap();
        assert!(second > first);
    }

    #[test]
    fn history_pages_are_newest_first_and_restartable() {
        let log = TransactionLog::new();
        let alice = AccountId::new("alice");
        for amount in 1..=5 {
            log.append(earned(&log, "alice", amount, &format!("k{amount}")))
                .unwrap();
        }

        let first = log.list_for(&alice, 2, None).unwrap();
        let amounts: Vec<u64> = first.entries.iter().map(|e| e.amount).collect();
        assert_eq!(amounts, vec![5, 4]);
        let token = first.next_page_token.unwrap();

        // New entries do not shift older pages
        log.append(earned(&log, "alice", 6, "k6")).unwrap();

        let second = log.list_for(&alice, 2, Some(&token)).unwrap();
        let amounts: Vec<u64> = second.entries.iter().map(|e| e.amount).collect();
        assert_eq!(amounts, vec![3, 2]);

        // Same token, same page
        let again = log.list_for(&alice, 2, Some(&token)).unwrap();
        assert_eq!(again, second);

        let last = log
            .list_for(&alice, 2, second.next_page_token.as_deref())
            .unwrap();
        let amounts: Vec<u64> = last.entries.iter().map(|e| e.amount).collect();
        assert_eq!(amounts, vec![1]);
        assert_eq!(last.next_page_token, None);
    }

    #[test]
    fn bad_tokens_are_rejected() {
        let log = TransactionLog::new();
        let alice = AccountId::new("alice");
        log.append(earned(&log, "alice", 1, "a")).unwrap();

        for token in ["x", "0", "2", "-1"] {
            assert_eq!(
                log.list_for(&alice, 10, Some(token)),
                Err(LedgerError::InvalidPageToken),
                "token {token:?}"
            );
        }
        assert_eq!(
            log.list_for(&AccountId::new("bob"), 10, Some("1")),
            Err(LedgerError::InvalidPageToken)
        );
    }

    #[test]
    fn empty_history_for_account_without_entries() {
        let log = TransactionLog::new();
        let page = log.list_for(&AccountId::new("bob"), 10, None).unwrap();
        assert!(page.entries.is_empty());
        assert_eq!(page.next_page_token, None);
    }

    #[test]
    fn restore_advances_id_counter() {
        let log = TransactionLog::new();
        let mut entry = earned(&log, "alice", 5, "restored");
        entry.id = EntryId(41);
        log.restore(entry).unwrap();

        assert_eq!(log.next_entry_id(), EntryId(42));
        assert_eq!(log.derived_balance(&AccountId::new("alice")), 5);
    }
}
