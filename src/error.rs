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

//! Error types for ledger operations.

use thiserror::Error;

/// Ledger operation errors.
///
/// Validation errors are returned verbatim and must not be retried
/// automatically. Only [`LedgerError::Conflict`] and
/// [`LedgerError::SystemUnavailable`] are safe to retry, with the same
/// idempotency key.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Referenced account does not exist
    #[error("account not found")]
    NotFound,

    /// Amount is zero, negative or above the configured maximum
    #[error("invalid amount")]
    InvalidAmount,

    /// Debit would take the balance below zero
    #[error("insufficient balance")]
    InsufficientBalance,

    /// Idempotency key was already committed by an earlier operation
    #[error("duplicate idempotency key")]
    DuplicateIdempotencyKey,

    /// Could not acquire the account locks within the retry budget
    #[error("conflicting concurrent update, retry with the same idempotency key")]
    Conflict,

    /// The journal could not be written
    #[error("ledger storage unavailable")]
    SystemUnavailable,

    /// Sender and recipient are the same account
    #[error("cannot transfer to the same account")]
    SelfTransfer,

    /// Account was deactivated and no longer sends or receives coins
    #[error("account is deactivated")]
    AccountDeactivated,

    /// History page token is malformed or out of range
    #[error("invalid page token")]
    InvalidPageToken,
}

impl LedgerError {
    /// Whether a caller may retry the same request (with the same key).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict | Self::SystemUnavailable)
    }
}
