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

//! REST API over the ledger engine.
//!
//! ## Endpoints
//!
//! - `POST /transfers` - Move coins between accounts
//! - `GET /accounts` - List all accounts
//! - `PUT /accounts/{id}` - Open an account (idempotent)
//! - `DELETE /accounts/{id}` - Deactivate an account
//! - `GET /accounts/{id}/balance` - Current balance
//! - `GET /accounts/{id}/history?pageSize=&pageToken=` - History, newest first
//! - `POST /accounts/{id}/earn` - System credit
//! - `POST /accounts/{id}/spend` - System debit
//! - `POST /accounts/{id}/adjust` - Signed system correction
//! - `GET /accounts/{id}/audit` - Cached balance vs. log
//!
//! Committed entries are returned with `201 Created`; a replayed idempotency
//! key returns the original entry with `200 OK`.
//!
//! ## Example Usage
//!
//! ```bash
//! curl -X PUT http://localhost:3000/accounts/alice
//! curl -X POST http://localhost:3000/accounts/alice/earn \
//!   -H "Content-Type: application/json" \
//!   -d '{"amount": 100, "reason": "welcome bonus", "idempotencyKey": "signup-alice"}'
//! curl -X POST http://localhost:3000/transfers \
//!   -H "Content-Type: application/json" \
//!   -d '{"from": "alice", "to": "bob", "amount": 40, "idempotencyKey": "t-1"}'
//! curl http://localhost:3000/accounts/alice/history?pageSize=10
//! ```
//!
//! Callers are trusted: the account ids in paths and bodies come from an
//! upstream identity provider.

use crate::LedgerError;
use crate::account::AccountSnapshot;
use crate::base::{AccountId, IdempotencyKey};
use crate::engine::{Engine, Receipt};
use crate::query::AuditReport;
use crate::transaction::{Operation, TransactionEntry};
use crate::transaction_log::HistoryPage;
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

// === Request/Response DTOs ===

/// Request body for `POST /transfers`.
///
/// ```json
/// {"from": "alice", "to": "bob", "amount": 40, "idempotencyKey": "t-1", "message": "thanks!"}
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRequest {
    pub from: String,
    pub to: String,
    pub amount: i64,
    pub idempotency_key: String,
    #[serde(default)]
    pub message: Option<String>,
}

impl TransferRequest {
    fn into_operation(self) -> Operation {
        Operation::Transfer {
            from: AccountId(self.from),
            to: AccountId(self.to),
            amount: self.amount,
            idempotency_key: IdempotencyKey(self.idempotency_key),
            message: self.message,
        }
    }
}

/// Request body for `earn` and `spend`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditRequest {
    pub amount: i64,
    #[serde(default)]
    pub reason: Option<String>,
    pub idempotency_key: String,
}

/// Request body for `adjust`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdjustRequest {
    pub delta: i64,
    #[serde(default)]
    pub reason: Option<String>,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceResponse {
    pub account_id: String,
    pub balance: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQuery {
    pub page_size: Option<usize>,
    pub page_token: Option<String>,
}

/// Response body for errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

// === Application State ===

/// Shared application state containing the ledger engine.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

impl AppState {
    /// Runs an engine write on the blocking pool.
    ///
    /// Writes may wait on account locks and sync the journal, which must not
    /// park the async workers serving reads.
    async fn write<T, F>(&self, f: F) -> Result<T, AppError>
    where
        F: FnOnce(&Engine) -> Result<T, LedgerError> + Send + 'static,
        T: Send + 'static,
    {
        let engine = Arc::clone(&self.engine);
        tokio::task::spawn_blocking(move || f(&engine))
            .await
            .map_err(|e| {
                error!(error = %e, "engine task failed");
                AppError(LedgerError::SystemUnavailable)
            })?
            .map_err(AppError)
    }
}

// === Error Handling ===

/// Wrapper for converting [`LedgerError`] into HTTP responses.
pub struct AppError(LedgerError);

impl From<LedgerError> for AppError {
    fn from(err: LedgerError) -> Self {
        AppError(err)
    }
}

impl AppError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match &self.0 {
            LedgerError::NotFound => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            LedgerError::InvalidAmount => (StatusCode::BAD_REQUEST, "INVALID_AMOUNT"),
            LedgerError::InsufficientBalance => {
                (StatusCode::UNPROCESSABLE_ENTITY, "INSUFFICIENT_BALANCE")
            }
            // Replays are successes; the engine does not return this.
            LedgerError::DuplicateIdempotencyKey => {
                (StatusCode::CONFLICT, "DUPLICATE_IDEMPOTENCY_KEY")
            }
            LedgerError::Conflict => (StatusCode::CONFLICT, "CONFLICT"),
            LedgerError::SystemUnavailable => {
                (StatusCode::SERVICE_UNAVAILABLE, "SYSTEM_UNAVAILABLE")
            }
            LedgerError::SelfTransfer => (StatusCode::BAD_REQUEST, "SELF_TRANSFER"),
            LedgerError::AccountDeactivated => (StatusCode::FORBIDDEN, "ACCOUNT_DEACTIVATED"),
            LedgerError::InvalidPageToken => (StatusCode::BAD_REQUEST, "INVALID_PAGE_TOKEN"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if self.0.is_retryable() {
            warn!(code, "request failed with retryable error");
        }

        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
                code: code.to_string(),
            }),
        )
            .into_response()
    }
}

fn committed(receipt: Receipt) -> (StatusCode, Json<TransactionEntry>) {
    let status = if receipt.replayed {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    (status, Json(Arc::unwrap_or_clone(receipt.entry)))
}

// === Handlers ===

/// POST /transfers
async fn create_transfer(
    State(state): State<AppState>,
    Json(request): Json<TransferRequest>,
) -> Result<(StatusCode, Json<TransactionEntry>), AppError> {
    let operation = request.into_operation();
    let receipt = state.write(move |engine| engine.process(operation)).await?;
    Ok(committed(receipt))
}

/// GET /accounts
async fn list_accounts(State(state): State<AppState>) -> Json<Vec<AccountSnapshot>> {
    Json(state.engine.accounts())
}

/// PUT /accounts/{id}
async fn open_account(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<AccountSnapshot>), AppError> {
    let (created, snapshot) = state
        .write(move |engine| {
            let account_id = AccountId(id);
            let created = engine.ensure_account(&account_id)?;
            Ok((created, engine.store().get(&account_id)?.snapshot()))
        })
        .await?;
    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(snapshot)))
}

/// DELETE /accounts/{id}
async fn deactivate_account(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    state
        .write(move |engine| engine.deactivate(&AccountId(id)))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /accounts/{id}/balance
async fn get_balance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<BalanceResponse>, AppError> {
    let balance = state.engine.get_balance(&AccountId(id.clone()))?;
    Ok(Json(BalanceResponse {
        account_id: id,
        balance,
    }))
}

/// GET /accounts/{id}/history
async fn get_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryPage>, AppError> {
    let page = state.engine.get_history(
        &AccountId(id),
        query.page_size,
        query.page_token.as_deref(),
    )?;
    Ok(Json(page))
}

/// POST /accounts/{id}/earn
async fn earn(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<CreditRequest>,
) -> Result<(StatusCode, Json<TransactionEntry>), AppError> {
    let operation = Operation::Earn {
        account: AccountId(id),
        amount: request.amount,
        reason: request.reason,
        idempotency_key: IdempotencyKey(request.idempotency_key),
    };
    let receipt = state.write(move |engine| engine.process(operation)).await?;
    Ok(committed(receipt))
}

/// POST /accounts/{id}/spend
async fn spend(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<CreditRequest>,
) -> Result<(StatusCode, Json<TransactionEntry>), AppError> {
    let operation = Operation::Spend {
        account: AccountId(id),
        amount: request.amount,
        reason: request.reason,
        idempotency_key: IdempotencyKey(request.idempotency_key),
    };
    let receipt = state.write(move |engine| engine.process(operation)).await?;
    Ok(committed(receipt))
}

/// POST /accounts/{id}/adjust
async fn adjust(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<AdjustRequest>,
) -> Result<(StatusCode, Json<TransactionEntry>), AppError> {
    let operation = Operation::Adjust {
        account: AccountId(id),
        delta: request.delta,
        reason: request.reason,
        idempotency_key: IdempotencyKey(request.idempotency_key),
    };
    let receipt = state.write(move |engine| engine.process(operation)).await?;
    Ok(committed(receipt))
}

/// GET /accounts/{id}/audit
async fn audit(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<AuditReport>, AppError> {
    Ok(Json(state.engine.audit(&AccountId(id))?))
}

// === Router ===

/// Builds the API router around a shared engine.
pub fn router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/transfers", post(create_transfer))
        .route("/accounts", get(list_accounts))
        .route(
            "/accounts/{id}",
            put(open_account).delete(deactivate_account),
        )
        .route("/accounts/{id}/balance", get(get_balance))
        .route("/accounts/{id}/history", get(get_history))
        .route("/accounts/{id}/earn", post(earn))
        .route("/accounts/{id}/spend", post(spend))
        .route("/accounts/{id}/adjust", post(adjust))
        .route("/accounts/{id}/audit", get(audit))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { engine })
}
