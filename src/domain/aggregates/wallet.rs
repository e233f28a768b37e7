//! Wallet Aggregate
//!
//! A wallet's balance is a materialised view of its ledger: it must always equal
//! the sum of the wallet's `Completed` transactions, credits positive and debits
//! negative. Pending, failed and reversed rows never touch the balance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;
use crate::domain::events::{DomainEvent, WalletEvent};
use crate::domain::value_objects::Money;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind { Credit, Debit }

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus { Pending, Completed, Failed, Reversed }

impl TransactionKind {
    pub fn as_str(&self) -> &'static str { match self { Self::Credit => "credit", Self::Debit => "debit" } }
    pub fn opposite(&self) -> Self { match self { Self::Credit => Self::Debit, Self::Debit => Self::Credit } }
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self { Self::Pending => "pending", Self::Completed => "completed", Self::Failed => "failed", Self::Reversed => "reversed" }
    }
}

impl FromStr for TransactionKind {
    type Err = WalletError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s { "credit" => Ok(Self::Credit), "debit" => Ok(Self::Debit), other => Err(WalletError::UnknownValue(other.to_string())) }
    }
}

impl FromStr for TransactionStatus {
    type Err = WalletError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "reversed" => Ok(Self::Reversed),
            other => Err(WalletError::UnknownValue(other.to_string())),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Wallet {
    pub id: Uuid,
    pub user_id: Uuid,
    pub balance: Money,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// How a posting treats a balance that would go below zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Overdraft { Reject, Allow }

impl Wallet {
    pub fn open(user_id: Uuid) -> Self {
        let now = Utc::now();
        Self { id: Uuid::new_v4(), user_id, balance: Money::ZERO, created_at: now, updated_at: now }
    }

    /// Applies a completed posting to the balance.
    pub fn post(&mut self, kind: TransactionKind, amount: Money, overdraft: Overdraft) -> Result<(), WalletError> {
        if !amount.is_positive() { return Err(WalletError::NonPositiveAmount); }
        match kind {
            TransactionKind::Credit => self.balance += amount,
            TransactionKind::Debit => {
                if overdraft == Overdraft::Reject && self.balance < amount {
                    return Err(WalletError::InsufficientFunds { balance: self.balance, requested: amount });
                }
                self.balance -= amount;
            }
        }
        self.updated_at = Utc::now();
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WalletTransaction {
    pub id: Uuid,
    pub wallet_id: Uuid,
    pub kind: TransactionKind,
    pub amount: Money,
    pub status: TransactionStatus,
    pub description: String,
    pub order_id: Option<Uuid>,
    pub reference: String,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

impl WalletTransaction {
    pub fn completed(wallet_id: Uuid, kind: TransactionKind, amount: Money, description: impl Into<String>, order_id: Option<Uuid>, reference: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(), wallet_id, kind, amount, status: TransactionStatus::Completed,
            description: description.into(), order_id, reference: reference.into(), created_at: now, settled_at: Some(now),
        }
    }

    pub fn pending(wallet_id: Uuid, kind: TransactionKind, amount: Money, description: impl Into<String>, reference: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(), wallet_id, kind, amount, status: TransactionStatus::Pending,
            description: description.into(), order_id: None, reference: reference.into(), created_at: Utc::now(), settled_at: None,
        }
    }

    /// Only a pending row may be settled, and only once.
    pub fn settle(&mut self, outcome: TransactionStatus) -> Result<(), WalletError> {
        if self.status != TransactionStatus::Pending { return Err(WalletError::NotPending(self.status)); }
        if outcome == TransactionStatus::Pending { return Err(WalletError::InvalidOutcome); }
        self.status = outcome;
        self.settled_at = Some(Utc::now());
        Ok(())
    }

    /// Contribution to the balance; zero unless completed.
    pub fn signed_amount(&self) -> Money {
        match (self.status, self.kind) {
            (TransactionStatus::Completed, TransactionKind::Credit) => self.amount,
            (TransactionStatus::Completed, TransactionKind::Debit) => Money::ZERO - self.amount,
            _ => Money::ZERO,
        }
    }

    pub fn event(&self, balance: Money) -> DomainEvent {
        let (wallet_id, transaction_id, amount) = (self.wallet_id, self.id, self.amount);
        DomainEvent::Wallet(match self.kind {
            TransactionKind::Credit => WalletEvent::Credited { wallet_id, transaction_id, amount, balance },
            TransactionKind::Debit => WalletEvent::Debited { wallet_id, transaction_id, amount, balance },
        })
    }
}

/// Balance implied by a ledger.
pub fn ledger_balance<'a>(transactions: impl IntoIterator<Item = &'a WalletTransaction>) -> Money {
    transactions.into_iter().map(WalletTransaction::signed_amount).sum()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalletError { NonPositiveAmount, InsufficientFunds { balance: Money, requested: Money }, NotPending(TransactionStatus), InvalidOutcome, UnknownValue(String) }
impl std::error::Error for WalletError {}
impl std::fmt::Display for WalletError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NonPositiveAmount => write!(f, "Amount must be positive"),
            Self::InsufficientFunds { balance, requested } => write!(f, "Insufficient funds: balance {balance}, requested {requested}"),
            Self::NotPending(status) => write!(f, "Transaction already settled as {}", status.as_str()),
            Self::InvalidOutcome => write!(f, "A transaction cannot be settled as pending"),
            Self::UnknownValue(v) => write!(f, "Unknown ledger value '{v}'"),
        }
    }
}
