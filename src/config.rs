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

//! Engine tuning knobs.

use std::time::Duration;

/// Limits and contention settings for the [`Engine`](crate::Engine).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerConfig {
    /// Largest amount a single transfer, earn or spend may move.
    pub max_transfer_amount: u64,
    /// How long one attempt waits for each account lock.
    pub lock_timeout: Duration,
    /// Lock attempts before an operation fails with `Conflict`.
    pub max_attempts: u32,
    pub default_page_size: usize,
    pub max_page_size: usize,
}

impl LedgerConfig {
    pub const DEFAULT_MAX_TRANSFER_AMOUNT: u64 = 1000;

    /// Resolves a requested history page size into `1..=max_page_size`.
    pub fn page_size(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.default_page_size)
            .clamp(1, self.max_page_size.max(1))
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_transfer_amount: Self::DEFAULT_MAX_TRANSFER_AMOUNT,
            lock_timeout: Duration::from_millis(50),
            max_attempts: 8,
            default_page_size: 20,
            max_page_size: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = LedgerConfig::default();
        assert_eq!(config.max_transfer_amount, 1000);
        assert_eq!(config.max_attempts, 8);
        assert_eq!(config.lock_timeout, Duration::from_millis(50));
    }

    #[test]
    fn page_size_is_clamped() {
        let config = LedgerConfig::default();
        assert_eq!(config.page_size(None), 20);
        assert_eq!(config.page_size(Some(0)), 1);
        assert_eq!(config.page_size(Some(50)), 50);
        assert_eq!(config.page_size(Some(10_000)), 100);
    }
}
