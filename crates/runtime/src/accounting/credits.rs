//! Credit accounting
//!
//! Atomic per-user reserve/charge/refund over a balance row plus an
//! append-only transaction ledger. All mutations for one user are
//! serialized by a per-user async lock; refunds are idempotent keyed by
//! reference id.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::store::CreditStore;
use crate::types::{
    first_of_next_month, CreditBalance, CreditError, CreditTransaction, OperationType,
    SubscriptionTier, TransactionKind, UserId,
};

/// Cost of each operation per subscription tier.
#[derive(Debug, Clone)]
pub struct CreditCostTable {
    costs: HashMap<(OperationType, SubscriptionTier), u64>,
}

impl Default for CreditCostTable {
    fn default() -> Self {
        use OperationType::*;
        use SubscriptionTier::*;
        let mut costs = HashMap::new();
        for tier in [Free, Basic, Pro] {
            // The pro tier gets a discounted full pipeline.
            let full = if tier == Pro { 24 } else { 30 };
            costs.insert((FullPipelineProcessing, tier), full);
            costs.insert((PaperTextExtraction, tier), 5);
            costs.insert((MetadataEnhancement, tier), 2);
            costs.insert((ContentSummarization, tier), 5);
            costs.insert((ConceptExplanation, tier), 4);
            costs.insert((QualityCheck, tier), 4);
            costs.insert((CitationFormatting, tier), 2);
            costs.insert((CitationVerification, tier), 2);
            costs.insert((ExternalResearch, tier), 4);
            costs.insert((RelatedPaperDiscovery, tier), 2);
        }
        Self { costs }
    }
}

impl CreditCostTable {
    pub fn cost(&self, operation: OperationType, tier: SubscriptionTier) -> u64 {
        self.costs.get(&(operation, tier)).copied().unwrap_or(0)
    }
}

/// Atomic credit operations per user.
pub struct CreditService {
    store: Arc<dyn CreditStore>,
    cost_table: CreditCostTable,
    user_locks: DashMap<UserId, Arc<Mutex<()>>>,
}

impl CreditService {
    pub fn new(store: Arc<dyn CreditStore>, cost_table: CreditCostTable) -> Self {
        Self {
            store,
            cost_table,
            user_locks: DashMap::new(),
        }
    }

    fn lock_for(&self, user_id: &UserId) -> Arc<Mutex<()>> {
        self.user_locks
            .entry(user_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn load_or_new(&self, user_id: &UserId) -> Result<CreditBalance, CreditError> {
        Ok(self
            .store
            .get_balance(user_id)
            .await?
            .unwrap_or_else(|| CreditBalance::new(user_id.clone())))
    }

    async fn commit(
        &self,
        balance: CreditBalance,
        kind: TransactionKind,
        amount: u64,
        operation_type: Option<OperationType>,
        reference_id: Option<String>,
    ) -> Result<(), CreditError> {
        let transaction = CreditTransaction {
            id: Uuid::new_v4(),
            user_id: balance.user_id.clone(),
            kind,
            amount,
            balance_after: balance.balance,
            operation_type,
            reference_id,
            created_at: Utc::now(),
        };
        self.store.put_balance(balance).await?;
        self.store.append_transaction(transaction).await?;
        Ok(())
    }

    /// Grant credits, creating the balance row when absent.
    pub async fn add_credits(
        &self,
        user_id: &UserId,
        amount: u64,
        reference_id: Option<String>,
    ) -> Result<CreditBalance, CreditError> {
        let lock = self.lock_for(user_id);
        let _guard = lock.lock().await;

        let mut balance = self.load_or_new(user_id).await?;
        balance.balance += amount;
        balance.total_earned += amount;
        let committed = balance.clone();
        self.commit(balance, TransactionKind::Add, amount, None, reference_id)
            .await?;
        Ok(committed)
    }

    /// Whether the user can afford `operation` at their tier.
    pub async fn has_credits(
        &self,
        user_id: &UserId,
        operation: OperationType,
        tier: SubscriptionTier,
    ) -> Result<bool, CreditError> {
        let cost = self.cost_table.cost(operation, tier);
        let balance = self.store.get_balance(user_id).await?;
        Ok(balance.map(|b| b.balance >= cost).unwrap_or(cost == 0))
    }

    /// Deduct `amount` immediately, recording a DEDUCT.
    pub async fn reserve(
        &self,
        user_id: &UserId,
        amount: u64,
        reference_id: Option<String>,
    ) -> Result<CreditBalance, CreditError> {
        self.deduct(user_id, amount, None, reference_id).await
    }

    /// Deduct the cost of `operation`, recording operation metadata.
    pub async fn charge(
        &self,
        user_id: &UserId,
        operation: OperationType,
        tier: SubscriptionTier,
        reference_id: Option<String>,
    ) -> Result<CreditBalance, CreditError> {
        let amount = self.cost_table.cost(operation, tier);
        self.deduct(user_id, amount, Some(operation), reference_id)
            .await
    }

    async fn deduct(
        &self,
        user_id: &UserId,
        amount: u64,
        operation_type: Option<OperationType>,
        reference_id: Option<String>,
    ) -> Result<CreditBalance, CreditError> {
        let lock = self.lock_for(user_id);
        let _guard = lock.lock().await;

        let mut balance = self.load_or_new(user_id).await?;
        if balance.balance < amount {
            return Err(CreditError::Insufficient {
                user_id: user_id.clone(),
                required: amount,
                available: balance.balance,
            });
        }
        balance.balance -= amount;
        balance.used_this_period += amount;
        balance.total_used += amount;
        let committed = balance.clone();
        self.commit(
            balance,
            TransactionKind::Deduct,
            amount,
            operation_type,
            reference_id,
        )
        .await?;
        Ok(committed)
    }

    /// Return `amount` to the user. Idempotent: a second refund with the
    /// same `reference_id` leaves the balance unchanged.
    pub async fn refund(
        &self,
        user_id: &UserId,
        amount: u64,
        reference_id: &str,
    ) -> Result<CreditBalance, CreditError> {
        let lock = self.lock_for(user_id);
        let _guard = lock.lock().await;

        if self.store.refund_exists(user_id, reference_id).await? {
            tracing::debug!(user_id = %user_id, reference_id, "refund already applied");
            return self
                .store
                .get_balance(user_id)
                .await?
                .ok_or_else(|| CreditError::UnknownUser {
                    user_id: user_id.clone(),
                });
        }

        let mut balance = self
            .store
            .get_balance(user_id)
            .await?
            .ok_or_else(|| CreditError::UnknownUser {
                user_id: user_id.clone(),
            })?;
        balance.balance += amount;
        balance.total_used = balance.total_used.saturating_sub(amount);
        balance.used_this_period = balance.used_this_period.saturating_sub(amount);
        let committed = balance.clone();
        self.commit(
            balance,
            TransactionKind::Refund,
            amount,
            None,
            Some(reference_id.to_string()),
        )
        .await?;
        Ok(committed)
    }

    /// Zero the period usage and schedule the next reset for the first of
    /// the coming month.
    pub async fn reset_monthly(&self, user_id: &UserId) -> Result<CreditBalance, CreditError> {
        let lock = self.lock_for(user_id);
        let _guard = lock.lock().await;

        let mut balance = self
            .store
            .get_balance(user_id)
            .await?
            .ok_or_else(|| CreditError::UnknownUser {
                user_id: user_id.clone(),
            })?;
        let cleared = balance.used_this_period;
        balance.used_this_period = 0;
        balance.next_reset_at = first_of_next_month(Utc::now());
        let committed = balance.clone();
        self.commit(balance, TransactionKind::Reset, cleared, None, None)
            .await?;
        Ok(committed)
    }

    pub async fn balance(&self, user_id: &UserId) -> Result<Option<CreditBalance>, CreditError> {
        self.store.get_balance(user_id).await
    }

    pub async fn transactions(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<CreditTransaction>, CreditError> {
        self.store.transactions_for_user(user_id).await
    }

    pub fn cost_of(&self, operation: OperationType, tier: SubscriptionTier) -> u64 {
        self.cost_table.cost(operation, tier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryCreditStore;

    fn service() -> CreditService {
        CreditService::new(Arc::new(InMemoryCreditStore::new()), CreditCostTable::default())
    }

    #[tokio::test]
    async fn ledger_matches_balance_invariant() {
        let service = service();
        let user = UserId::from("u1");

        service.add_credits(&user, 100, None).await.unwrap();
        service.reserve(&user, 30, Some("run-1".into())).await.unwrap();
        service.refund(&user, 10, "run-1").await.unwrap();

        let balance = service.balance(&user).await.unwrap().unwrap();
        assert_eq!(balance.balance, 80);
        assert_eq!(balance.total_earned, 100);
        assert_eq!(balance.total_used, 20);
        assert_eq!(balance.balance, balance.total_earned - balance.total_used);

        let ledger = service.transactions(&user).await.unwrap();
        let adds: u64 = ledger
            .iter()
            .filter(|t| t.kind == TransactionKind::Add)
            .map(|t| t.amount)
            .sum();
        let deducts: u64 = ledger
            .iter()
            .filter(|t| t.kind == TransactionKind::Deduct)
            .map(|t| t.amount)
            .sum();
        let refunds: u64 = ledger
            .iter()
            .filter(|t| t.kind == TransactionKind::Refund)
            .map(|t| t.amount)
            .sum();
        assert_eq!(balance.balance, adds - deducts + refunds);
    }

    #[tokio::test]
    async fn reserve_rejects_insufficient_balance() {
        let service = service();
        let user = UserId::from("u1");
        service.add_credits(&user, 10, None).await.unwrap();

        let result = service.reserve(&user, 30, None).await;
        assert!(matches!(
            result,
            Err(CreditError::Insufficient {
                required: 30,
                available: 10,
                ..
            })
        ));
        // Nothing was recorded.
        let balance = service.balance(&user).await.unwrap().unwrap();
        assert_eq!(balance.balance, 10);
        assert_eq!(service.transactions(&user).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn refund_is_idempotent_by_reference() {
        let service = service();
        let user = UserId::from("u1");
        service.add_credits(&user, 100, None).await.unwrap();
        service.reserve(&user, 30, Some("run-9".into())).await.unwrap();

        let first = service.refund(&user, 30, "run-9").await.unwrap();
        let second = service.refund(&user, 30, "run-9").await.unwrap();
        assert_eq!(first.balance, 100);
        assert_eq!(second.balance, 100);

        let refunds = service
            .transactions(&user)
            .await
            .unwrap()
            .into_iter()
            .filter(|t| t.kind == TransactionKind::Refund)
            .count();
        assert_eq!(refunds, 1);
    }

    #[tokio::test]
    async fn charge_records_operation_metadata() {
        let service = service();
        let user = UserId::from("u1");
        service.add_credits(&user, 50, None).await.unwrap();

        service
            .charge(
                &user,
                OperationType::FullPipelineProcessing,
                SubscriptionTier::Free,
                Some("run-2".into()),
            )
            .await
            .unwrap();

        let ledger = service.transactions(&user).await.unwrap();
        let deduct = ledger
            .iter()
            .find(|t| t.kind == TransactionKind::Deduct)
            .unwrap();
        assert_eq!(deduct.amount, 30);
        assert_eq!(
            deduct.operation_type,
            Some(OperationType::FullPipelineProcessing)
        );
        assert_eq!(deduct.reference_id.as_deref(), Some("run-2"));
    }

    #[tokio::test]
    async fn has_credits_uses_tier_cost() {
        let service = service();
        let user = UserId::from("u1");
        service.add_credits(&user, 25, None).await.unwrap();

        assert!(!service
            .has_credits(&user, OperationType::FullPipelineProcessing, SubscriptionTier::Free)
            .await
            .unwrap());
        assert!(service
            .has_credits(&user, OperationType::FullPipelineProcessing, SubscriptionTier::Pro)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn monthly_reset_clears_period_usage_only() {
        let service = service();
        let user = UserId::from("u1");
        service.add_credits(&user, 100, None).await.unwrap();
        service.reserve(&user, 40, None).await.unwrap();

        let balance = service.reset_monthly(&user).await.unwrap();
        assert_eq!(balance.used_this_period, 0);
        assert_eq!(balance.balance, 60);
        assert_eq!(balance.total_used, 40);
        assert!(balance.next_reset_at > Utc::now());
    }

    #[tokio::test]
    async fn concurrent_deducts_serialize_per_user() {
        let service = Arc::new(service());
        let user = UserId::from("u1");
        service.add_credits(&user, 100, None).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..10 {
            let service = service.clone();
            let user = user.clone();
            handles.push(tokio::spawn(async move {
                service.reserve(&user, 10, None).await
            }));
        }
        let mut ok = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                ok += 1;
            }
        }
        assert_eq!(ok, 10);
        let balance = service.balance(&user).await.unwrap().unwrap();
        assert_eq!(balance.balance, 0);
        assert_eq!(balance.total_used, 100);
    }
}
