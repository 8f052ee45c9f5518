use uuid::Uuid;

use crate::engine::Ledger;
use crate::error::LedgerError;
use crate::model::{Posting, TransactionType};

impl Ledger {
    /// Credits (positive) or debits (negative) a user's wallet outside of any
    /// round. The admin check runs against the caller's own profile, not the
    /// target's.
    #[tracing::instrument(name = "Adjusting balance", skip(self, description))]
    pub async fn adjust_balance(
        &self,
        caller: Uuid,
        user_id: Uuid,
        amount: i64,
        description: &str,
    ) -> Result<i64, LedgerError> {
        self.require_admin(caller, "adjust balances").await?;
        if amount == 0 {
            return Err(LedgerError::Validation(
                "adjustment amount must not be zero".into(),
            ));
        }

        let transaction_type = if amount >= 0 {
            TransactionType::Deposit
        } else {
            TransactionType::Withdrawal
        };
        let description = match description.trim() {
            "" => "Administrative adjustment",
            text => text,
        };
        let posting = Posting::new(user_id, amount, transaction_type, description)
            .allow_negative(self.policy.allow_negative_adjustments);

        let balance = self.store.post(&posting).await?;
        tracing::info!(%caller, %user_id, amount, balance, "Balance adjusted");
        self.announce_balance(user_id, balance, posting.transaction_id);

        Ok(balance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_support::{admin, balance, funded_user, ledger};
    use crate::error::StoreError;
    use crate::store::LedgerStore;

    #[tokio::test]
    async fn admins_can_credit_and_debit() {
        let (ledger, store) = ledger().await;
        let moderator = admin(&store).await;
        let user = funded_user(&store, 100).await;

        assert_eq!(
            ledger
                .adjust_balance(moderator, user, 25, "goodwill")
                .await
                .unwrap(),
            125
        );
        assert_eq!(
            ledger
                .adjust_balance(moderator, user, -5, "chargeback")
                .await
                .unwrap(),
            120
        );

        let deposits = store
            .transactions(user, Some(TransactionType::Deposit))
            .await
            .unwrap();
        assert_eq!(deposits.last().unwrap().description, "goodwill");
        let withdrawals = store
            .transactions(user, Some(TransactionType::Withdrawal))
            .await
            .unwrap();
        assert_eq!(withdrawals.len(), 1);
        assert_eq!(withdrawals[0].amount, -5);
    }

    #[tokio::test]
    async fn negative_adjustments_may_overdraw_the_wallet() {
        let (ledger, store) = ledger().await;
        let moderator = admin(&store).await;
        let user = funded_user(&store, 30).await;

        let balance_after = ledger
            .adjust_balance(moderator, user, -80, "correction")
            .await
            .unwrap();

        assert_eq!(balance_after, -50);
        assert_eq!(balance(&store, user).await, -50);
    }

    #[tokio::test]
    async fn the_caller_must_be_admin_not_the_target() {
        let (ledger, store) = ledger().await;
        let moderator = admin(&store).await;
        let user = funded_user(&store, 30).await;

        assert!(matches!(
            ledger.adjust_balance(user, moderator, 10, "self-serve").await,
            Err(LedgerError::Forbidden(_))
        ));
        assert!(matches!(
            ledger.adjust_balance(user, user, 10, "self-serve").await,
            Err(LedgerError::Forbidden(_))
        ));
        assert_eq!(balance(&store, user).await, 30);
    }

    #[tokio::test]
    async fn unknown_wallets_and_zero_amounts_are_rejected() {
        let (ledger, store) = ledger().await;
        let moderator = admin(&store).await;
        let stranger = Uuid::new_v4();

        assert!(matches!(
            ledger.adjust_balance(moderator, stranger, 10, "").await,
            Err(LedgerError::Store(StoreError::MissingWallet(id))) if id == stranger
        ));
        assert!(matches!(
            ledger.adjust_balance(moderator, moderator, 0, "").await,
            Err(LedgerError::Validation(_))
        ));
    }
}
