use serde::Serialize;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::Engine;
use crate::domain::aggregates::{Overdraft, TransactionKind, TransactionStatus, Wallet, WalletError, WalletTransaction};
use crate::domain::events::DomainEvent;
use crate::domain::value_objects::Money;
use crate::store::{Store, UnitOfWork};
use crate::{CommerceError, Result};

pub const MAX_PAGE_SIZE: u32 = 100;

#[derive(Clone, Debug, Serialize)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub total: u64,
    pub page: u32,
}

/// Stored balance against the balance implied by the completed ledger rows.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Reconciliation {
    pub wallet_id: Uuid,
    pub balance: Money,
    pub ledger: Money,
    pub drift: Money,
}

impl Reconciliation {
    pub fn is_consistent(&self) -> bool { self.drift.is_zero() }
}

/// A completed ledger posting to apply to a wallet.
pub(super) struct Posting {
    pub kind: TransactionKind,
    pub amount: Money,
    pub description: String,
    pub order_id: Option<Uuid>,
    pub reference: String,
}

impl<S: Store> Engine<S> {
    /// Returns the user's wallet, creating an empty one on first access.
    #[instrument(skip(self))]
    pub async fn get_or_create_wallet(&self, user_id: Uuid) -> Result<Wallet> {
        let mut tx = self.store.begin().await?;
        let wallet = tx.wallet_for_update(user_id).await?;
        tx.commit().await?;
        Ok(wallet)
    }

    /// Zero for users who never had a wallet.
    pub async fn wallet_balance(&self, user_id: Uuid) -> Result<Money> {
        let mut tx = self.store.begin().await?;
        Ok(tx.wallet(user_id).await?.map(|w| w.balance).unwrap_or(Money::ZERO))
    }

    /// Newest first. `page` starts at 1; `limit` is clamped to `1..=100`.
    #[instrument(skip(self))]
    pub async fn wallet_transactions(&self, user_id: Uuid, page: u32, limit: u32) -> Result<Page<WalletTransaction>> {
        if page == 0 { return Err(CommerceError::InvalidInput("page starts at 1".into())); }
        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        let mut tx = self.store.begin().await?;
        let Some(wallet) = tx.wallet(user_id).await? else {
            return Ok(Page { data: vec![], total: 0, page });
        };
        let offset = u64::from(page - 1) * u64::from(limit);
        let (data, total) = tx.wallet_transactions(wallet.id, offset, u64::from(limit)).await?;
        Ok(Page { data, total, page })
    }

    /// Records a pending top-up credit. The balance moves only once the payment
    /// is verified through [`Engine::verify_top_up`].
    #[instrument(skip(self))]
    pub async fn top_up(&self, user_id: Uuid, amount: Money) -> Result<WalletTransaction> {
        let amount = amount.round2();
        if !amount.is_positive() { return Err(WalletError::NonPositiveAmount.into()); }
        let mut tx = self.store.begin().await?;
        let wallet = tx.wallet_for_update(user_id).await?;
        let reference = format!("TOPUP-{}", Uuid::now_v7().simple());
        let entry = WalletTransaction::pending(wallet.id, TransactionKind::Credit, amount, "Wallet top-up", reference);
        tx.insert_wallet_transaction(&entry).await?;
        tx.commit().await?;
        info!(%user_id, reference = %entry.reference, "top-up initiated");
        Ok(entry)
    }

    /// Settles a pending top-up. Only `Completed` credits the balance.
    #[instrument(skip(self))]
    pub async fn verify_top_up(&self, user_id: Uuid, reference: &str, outcome: TransactionStatus) -> Result<WalletTransaction> {
        let mut tx = self.store.begin().await?;
        let mut wallet = tx.wallet_for_update(user_id).await?;
        let mut entry = tx
            .wallet_transaction_by_reference(wallet.id, reference)
            .await?
            .ok_or_else(|| CommerceError::not_found("wallet transaction", reference))?;
        entry.settle(outcome)?;
        let mut events = Vec::new();
        if outcome == TransactionStatus::Completed {
            wallet.post(entry.kind, entry.amount, Overdraft::Reject)?;
            tx.update_wallet_balance(&wallet).await?;
            events.push(entry.event(wallet.balance));
        }
        tx.update_wallet_transaction_status(&entry).await?;
        tx.commit().await?;
        info!(%user_id, reference, status = entry.status.as_str(), balance = %wallet.balance, "top-up settled");
        self.publish(events).await;
        Ok(entry)
    }

    /// Completed debit; fails with `InsufficientFunds` and leaves the balance
    /// untouched if it would go negative.
    #[instrument(skip(self))]
    pub async fn debit_wallet(&self, user_id: Uuid, amount: Money, description: &str) -> Result<WalletTransaction> {
        let mut tx = self.store.begin().await?;
        let posting = Posting {
            kind: TransactionKind::Debit,
            amount,
            description: description.to_string(),
            order_id: None,
            reference: format!("DEBIT-{}", Uuid::now_v7().simple()),
        };
        let (entry, event) = self.post_in(&mut tx, user_id, posting, Overdraft::Reject).await?;
        tx.commit().await?;
        self.publish(vec![event]).await;
        Ok(entry)
    }

    /// Appends a compensating entry of the opposite kind. The compensation may
    /// take the balance below zero; each transaction is reversed at most once.
    #[instrument(skip(self))]
    pub async fn reverse_transaction(&self, user_id: Uuid, transaction_id: Uuid, reason: &str) -> Result<WalletTransaction> {
        let reason = reason.trim();
        if reason.is_empty() { return Err(CommerceError::InvalidInput("a reversal reason is required".into())); }
        let mut tx = self.store.begin().await?;
        let wallet = tx.wallet_for_update(user_id).await?;
        let original = tx
            .wallet_transaction(transaction_id)
            .await?
            .filter(|t| t.wallet_id == wallet.id)
            .ok_or_else(|| CommerceError::not_found("wallet transaction", transaction_id))?;
        if original.status != TransactionStatus::Completed {
            return Err(CommerceError::Conflict(format!("only completed transactions can be reversed (status {})", original.status.as_str())));
        }
        if original.reference.starts_with(REVERSAL_PREFIX) {
            return Err(CommerceError::Conflict("a reversal cannot itself be reversed".into()));
        }
        let reference = format!("{REVERSAL_PREFIX}{}", original.id);
        if tx.wallet_transaction_by_reference(wallet.id, &reference).await?.is_some() {
            warn!(%user_id, %transaction_id, "transaction already reversed");
            return Err(CommerceError::Conflict(format!("transaction {transaction_id} is already reversed")));
        }
        let posting = Posting {
            kind: original.kind.opposite(),
            amount: original.amount,
            description: format!("Reversal of {}: {reason}", original.reference),
            order_id: original.order_id,
            reference,
        };
        let (entry, event) = self.post_in(&mut tx, user_id, posting, Overdraft::Allow).await?;
        tx.commit().await?;
        self.publish(vec![event]).await;
        Ok(entry)
    }

    /// Compares the stored balance with the sum of completed ledger rows.
    #[instrument(skip(self))]
    pub async fn reconcile_wallet(&self, user_id: Uuid) -> Result<Reconciliation> {
        let mut tx = self.store.begin().await?;
        let wallet = tx.wallet(user_id).await?.ok_or_else(|| CommerceError::not_found("wallet for user", user_id))?;
        let ledger = tx.completed_ledger_sum(wallet.id).await?;
        let report = Reconciliation { wallet_id: wallet.id, balance: wallet.balance, ledger, drift: wallet.balance - ledger };
        if !report.is_consistent() {
            warn!(%user_id, balance = %report.balance, ledger = %report.ledger, "wallet balance drifted from ledger");
        }
        Ok(report)
    }

    /// Locks the wallet, moves the balance and appends the ledger row in the
    /// caller's unit of work.
    pub(super) async fn post_in(&self, tx: &mut S::Tx, user_id: Uuid, posting: Posting, overdraft: Overdraft) -> Result<(WalletTransaction, DomainEvent)> {
        let amount = posting.amount.round2();
        let mut wallet = tx.wallet_for_update(user_id).await?;
        if let Err(e) = wallet.post(posting.kind, amount, overdraft) {
            warn!(%user_id, kind = posting.kind.as_str(), %amount, error = %e, "wallet posting rejected");
            return Err(e.into());
        }
        let entry = WalletTransaction::completed(wallet.id, posting.kind, amount, posting.description, posting.order_id, posting.reference);
        tx.insert_wallet_transaction(&entry).await?;
        tx.update_wallet_balance(&wallet).await?;
        info!(%user_id, kind = posting.kind.as_str(), %amount, balance = %wallet.balance, reference = %entry.reference, "wallet posted");
        let event = entry.event(wallet.balance);
        Ok((entry, event))
    }
}

const REVERSAL_PREFIX: &str = "REVERSAL-";
