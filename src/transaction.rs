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

//! Ledger entries and the operations that produce them.
//!
//! An [`Operation`] is a request; a [`TransactionEntry`] is what the log
//! records once the request commits. A `None` side of an entry is the system
//! account:
//!
//! | Kind | from | to |
//! |------|------|----|
//! | [`Transfer`](TransactionKind::Transfer) | account | account |
//! | [`Earned`](TransactionKind::Earned) | system | account |
//! | [`Spent`](TransactionKind::Spent) | account | system |
//! | [`SystemAdjustment`](TransactionKind::SystemAdjustment) | either | either |

use crate::base::{AccountId, EntryId, IdempotencyKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum TransactionKind {
    Transfer,
    Earned,
    Spent,
    SystemAdjustment,
}

/// An immutable, committed ledger entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TransactionEntry {
    pub id: EntryId,
    /// Debited account, `None` for system mints.
    pub from_account: Option<AccountId>,
    /// Credited account, `None` when coins return to the system.
    pub to_account: Option<AccountId>,
    pub amount: u64,
    pub kind: TransactionKind,
    pub timestamp: DateTime<Utc>,
    pub idempotency_key: IdempotencyKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl TransactionEntry {
    /// Whether this entry debits or credits `account`.
    pub fn involves(&self, account: &AccountId) -> bool {
        self.from_account.as_ref() == Some(account) || self.to_account.as_ref() == Some(account)
    }

    /// Signed effect of this entry on `account`'s balance.
    pub fn signed_amount_for(&self, account: &AccountId) -> i128 {
        let mut delta = 0i128;
        if self.to_account.as_ref() == Some(account) {
            delta += i128::from(self.amount);
        }
        if self.from_account.as_ref() == Some(account) {
            delta -= i128::from(self.amount);
        }
        delta
    }
}

/// A balance-changing request submitted to the [`Engine`](crate::Engine).
///
/// Amounts are signed so that negative input reaches validation and fails
/// with [`InvalidAmount`](crate::LedgerError::InvalidAmount) instead of being
/// rejected by a parser.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Operation {
    Transfer {
        from: AccountId,
        to: AccountId,
        amount: i64,
        idempotency_key: IdempotencyKey,
        message: Option<String>,
    },
    Earn {
        account: AccountId,
        amount: i64,
        reason: Option<String>,
        idempotency_key: IdempotencyKey,
    },
    Spend {
        account: AccountId,
        amount: i64,
        reason: Option<String>,
        idempotency_key: IdempotencyKey,
    },
    /// Signed correction: positive credits, negative debits.
    Adjust {
        account: AccountId,
        delta: i64,
        reason: Option<String>,
        idempotency_key: IdempotencyKey,
    },
}

impl Operation {
    pub fn idempotency_key(&self) -> &IdempotencyKey {
        match self {
            Self::Transfer { idempotency_key, .. } => idempotency_key,
            Self::Earn { idempotency_key, .. } => idempotency_key,
            Self::Spend { idempotency_key, .. } => idempotency_key,
            Self::Adjust { idempotency_key, .. } => idempotency_key,
        }
    }

    pub fn kind(&self) -> TransactionKind {
        match self {
            Self::Transfer { .. } => TransactionKind::Transfer,
            Self::Earn { .. } => TransactionKind::Earned,
            Self::Spend { .. } => TransactionKind::Spent,
            Self::Adjust { .. } => TransactionKind::SystemAdjustment,
        }
    }

    /// Whether `entry` records the same request as `self`.
    ///
    /// Used to flag idempotency keys reused with different parameters.
    pub fn matches(&self, entry: &TransactionEntry) -> bool {
        if entry.kind != self.kind() {
            return false;
        }
        match self {
            Self::Transfer {
                from, to, amount, ..
            } => {
                entry.from_account.as_ref() == Some(from)
                    && entry.to_account.as_ref() == Some(to)
                    && i128::from(entry.amount) == i128::from(*amount)
            }
            Self::Earn {
                account, amount, ..
            } => {
                entry.to_account.as_ref() == Some(account)
                    && i128::from(entry.amount) == i128::from(*amount)
            }
            Self::Spend {
                account, amount, ..
            } => {
                entry.from_account.as_ref() == Some(account)
                    && i128::from(entry.amount) == i128::from(*amount)
            }
            Self::Adjust { account, delta, .. } => {
                entry.signed_amount_for(account) == i128::from(*delta)
            }
        }
    }
}
