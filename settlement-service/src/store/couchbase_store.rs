//! Couchbase-backed ledger store.
//!
//! Couchbase only guarantees atomicity per document, so multi-document units
//! are written as idempotent steps keyed by the posting's transaction id:
//!
//! 1. the wallet document is replaced under its CAS only if the transaction id
//!    is in neither the transaction collection nor the wallet's recent
//!    `applied` window, and the id joins the window in the same write;
//! 2. the transaction document is inserted under that id;
//! 3. the bet status is moved with a `WHERE status = 'pending'` guard.
//!
//! Writes that need the round to be open carry an `EXISTS` guard on the round
//! document. A wager refused by that guard after its debit is refunded with a
//! keyed compensating posting.
//!
//! A run interrupted between steps is completed by running it again.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use couchbase::{
    Cluster, Collection, CouchbaseError, GetOptions, InsertOptions, QueryOptions,
    QueryScanConsistency, ReplaceOptions, UpsertOptions,
};
use futures::StreamExt;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::Instrument;
use uuid::Uuid;

use crate::configuration::DatabaseSettings;
use crate::error::StoreError;
use crate::model::{
    Bet, BetPlacement, BetResolution, BetStatus, Posting, Profile, ResolveOutcome, Round,
    Transaction, TransactionType, Wallet,
};
use crate::store::LedgerStore;

const PROFILES: &str = "profiles";
const WALLETS: &str = "wallets";
const TRANSACTIONS: &str = "transactions";
const ROUNDS: &str = "rounds";
const BETS: &str = "bets";

/// Transaction ids kept on a wallet document. The transaction documents are the
/// lasting record; the window only covers the step between the wallet update
/// and the transaction insert.
const APPLIED_WINDOW: usize = 256;
const WALLET_UPDATE_ATTEMPTS: usize = 5;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WalletDocument {
    user_id: Uuid,
    balance: i64,
    updated_at: DateTime<Utc>,
    /// Most recent transaction ids applied to `balance`, oldest first.
    #[serde(default)]
    applied: Vec<Uuid>,
}

impl WalletDocument {
    /// Applies the posting to the document. Returns `false` when the posting
    /// is already in the window and nothing changed.
    fn apply(&mut self, posting: &Posting, now: DateTime<Utc>) -> Result<bool, StoreError> {
        if self.applied.contains(&posting.transaction_id) {
            return Ok(false);
        }

        let balance = self
            .balance
            .checked_add(posting.amount)
            .ok_or(StoreError::AmountOverflow {
                what: "balance",
                id: posting.user_id,
            })?;
        if balance < 0 && posting.amount < 0 && !posting.allow_negative {
            return Err(StoreError::InsufficientBalance {
                available: self.balance,
                required: posting.amount.saturating_neg(),
            });
        }

        self.balance = balance;
        self.updated_at = now;
        self.applied.push(posting.transaction_id);
        if self.applied.len() > APPLIED_WINDOW {
            let excess = self.applied.len() - APPLIED_WINDOW;
            self.applied.drain(..excess);
        }
        Ok(true)
    }
}

impl From<WalletDocument> for Wallet {
    fn from(doc: WalletDocument) -> Wallet {
        Wallet {
            user_id: doc.user_id,
            balance: doc.balance,
            updated_at: doc.updated_at,
        }
    }
}

fn backend(e: CouchbaseError) -> StoreError {
    StoreError::Backend(e.to_string())
}

pub struct CouchbaseStore {
    cluster: Cluster,
    bucket_name: String,
    scope_name: String,
}

impl CouchbaseStore {
    #[tracing::instrument(name = "Connecting to couchbase", skip(settings))]
    pub async fn connect(settings: &DatabaseSettings) -> Result<CouchbaseStore, StoreError> {
        let cluster = Cluster::connect(
            settings.connection_string(),
            settings.username.clone(),
            settings.password.clone(),
        );
        let store = CouchbaseStore {
            cluster,
            bucket_name: settings.bucket_name.clone(),
            scope_name: settings.scope_name.clone(),
        };

        // Fails fast when the cluster or keyspace is unreachable.
        store
            .query::<Value>(
                format!("SELECT RAW 1 FROM {} LIMIT 1", store.keyspace(ROUNDS)),
                json!({}),
            )
            .await?;

        Ok(store)
    }

    fn keyspace(&self, collection: &str) -> String {
        format!(
            "`{}`.`{}`.`{}`",
            self.bucket_name, self.scope_name, collection
        )
    }

    fn collection(&self, collection: &str) -> Collection {
        self.cluster
            .bucket(&self.bucket_name)
            .scope(&self.scope_name)
            .collection(collection)
    }

    async fn query<T: DeserializeOwned>(
        &self,
        statement: String,
        parameters: Value,
    ) -> Result<Vec<T>, StoreError> {
        let query_span = tracing::debug_span!("Running couchbase query", %statement);
        let options = QueryOptions::default()
            .named_parameters(parameters)
            .scan_consistency(QueryScanConsistency::RequestPlus);

        let mut result = self
            .cluster
            .query(statement, options)
            .instrument(query_span)
            .await
            .map_err(backend)?;

        let mut rows = result.rows::<T>();
        let mut response_rows = Vec::new();
        while let Some(row) = rows.next().await {
            response_rows.push(row.map_err(backend)?);
        }

        Ok(response_rows)
    }

    async fn get<T: DeserializeOwned>(
        &self,
        collection: &str,
        id: Uuid,
    ) -> Result<Option<T>, StoreError> {
        match self
            .collection(collection)
            .get(id.to_string(), GetOptions::default())
            .await
        {
            Ok(result) => Ok(Some(result.content::<T>().map_err(backend)?)),
            Err(CouchbaseError::DocumentNotFound { .. }) => Ok(None),
            Err(e) => Err(backend(e)),
        }
    }

    /// Inserts a document, treating an existing one as success.
    async fn insert_once<T: Serialize>(
        &self,
        collection: &str,
        id: Uuid,
        content: &T,
    ) -> Result<bool, StoreError> {
        match self
            .collection(collection)
            .insert(id.to_string(), content, InsertOptions::default())
            .await
        {
            Ok(_) => Ok(true),
            Err(CouchbaseError::DocumentExists { .. }) => Ok(false),
            Err(e) => Err(backend(e)),
        }
    }

    async fn wallet_document(&self, user_id: Uuid) -> Result<Option<WalletDocument>, StoreError> {
        self.get::<WalletDocument>(WALLETS, user_id).await
    }

    async fn wallet_with_cas(&self, user_id: Uuid) -> Result<(WalletDocument, u64), StoreError> {
        match self
            .collection(WALLETS)
            .get(user_id.to_string(), GetOptions::default())
            .await
        {
            Ok(result) => Ok((result.content().map_err(backend)?, result.cas())),
            Err(CouchbaseError::DocumentNotFound { .. }) => Err(StoreError::MissingWallet(user_id)),
            Err(e) => Err(backend(e)),
        }
    }

    async fn apply_posting(&self, posting: &Posting) -> Result<i64, StoreError> {
        let user_id = posting.user_id;
        let mut attempt = 0;
        let balance = loop {
            attempt += 1;
            let (mut wallet, cas) = self.wallet_with_cas(user_id).await?;
            if self.has_transaction(posting.transaction_id).await?
                || !wallet.apply(posting, Utc::now())?
            {
                break wallet.balance;
            }

            match self
                .collection(WALLETS)
                .replace(
                    user_id.to_string(),
                    &wallet,
                    ReplaceOptions::default().cas(cas),
                )
                .await
            {
                Ok(_) => break wallet.balance,
                Err(CouchbaseError::CasMismatch { .. }) if attempt < WALLET_UPDATE_ATTEMPTS => {
                    tracing::debug!(%user_id, attempt, "Wallet changed while posting");
                }
                Err(e) => return Err(backend(e)),
            }
        };

        self.insert_once(
            TRANSACTIONS,
            posting.transaction_id,
            &posting.to_transaction(Utc::now()),
        )
        .await?;

        Ok(balance)
    }

    async fn expect_open(&self, round_id: Uuid, cycle: u32) -> Result<(), StoreError> {
        let round = self.round(round_id).await?.ok_or(StoreError::NotFound {
            entity: "round",
            id: round_id,
        })?;
        if !round.accepts_bets(cycle) {
            return Err(StoreError::RoundNotOpen(round_id));
        }
        Ok(())
    }

    /// Condition that holds while round `$round` takes bets in cycle `$cycle`.
    fn round_open(&self) -> String {
        format!(
            "EXISTS (SELECT RAW 1 FROM {} AS r USE KEYS $round \
             WHERE r.bettingLocked = false AND r.winningOption IS NOT VALUED \
               AND r.cycle = $cycle)",
            self.keyspace(ROUNDS)
        )
    }

    async fn pending_bet(&self, placement: &BetPlacement) -> Result<Option<Bet>, StoreError> {
        let bets: Vec<Bet> = self
            .query(
                format!(
                    "SELECT RAW b FROM {} AS b \
                     WHERE b.roundId = $round AND b.cycle = $cycle \
                       AND b.userId = $user AND b.status = 'pending' \
                     LIMIT 1",
                    self.keyspace(BETS)
                ),
                json!({
                    "round": placement.round_id,
                    "cycle": placement.cycle,
                    "user": placement.user_id,
                }),
            )
            .await?;
        Ok(bets.into_iter().next())
    }

    /// Adds the stake to the user's pending bet while the round is open.
    async fn top_up_bet(
        &self,
        bet_id: Uuid,
        placement: &BetPlacement,
    ) -> Result<Option<Bet>, StoreError> {
        let updated: Vec<Bet> = self
            .query(
                format!(
                    "UPDATE {} AS b USE KEYS $id \
                     SET b.amount = b.amount + $amount, b.option = $option, b.updatedAt = $now \
                     WHERE b.status = 'pending' AND {} \
                     RETURNING RAW b",
                    self.keyspace(BETS),
                    self.round_open()
                ),
                json!({
                    "id": bet_id.to_string(),
                    "amount": placement.amount,
                    "option": placement.option,
                    "now": Utc::now(),
                    "round": placement.round_id.to_string(),
                    "cycle": placement.cycle,
                }),
            )
            .await?;
        Ok(updated.into_iter().next())
    }

    /// Inserts a new pending bet while the round is open.
    async fn insert_bet(&self, placement: &BetPlacement) -> Result<Option<Bet>, StoreError> {
        let now = Utc::now();
        let bet = Bet {
            id: Uuid::new_v4(),
            round_id: placement.round_id,
            cycle: placement.cycle,
            user_id: placement.user_id,
            option: placement.option.clone(),
            amount: placement.amount,
            status: BetStatus::Pending,
            created_at: now,
            updated_at: now,
        };

        let inserted: Vec<Uuid> = self
            .query(
                format!(
                    "INSERT INTO {} (KEY k, VALUE v) \
                     SELECT $id AS k, $bet AS v FROM {} AS r USE KEYS $round \
                     WHERE r.bettingLocked = false AND r.winningOption IS NOT VALUED \
                       AND r.cycle = $cycle \
                     RETURNING RAW META().id",
                    self.keyspace(BETS),
                    self.keyspace(ROUNDS)
                ),
                json!({
                    "id": bet.id.to_string(),
                    "bet": bet,
                    "round": placement.round_id.to_string(),
                    "cycle": placement.cycle,
                }),
            )
            .await?;

        Ok((!inserted.is_empty()).then(|| bet))
    }

    /// Gives back the debit of a wager the round no longer accepted.
    async fn refund_refused_wager(&self, debit: &Posting, round_id: Uuid) -> Result<(), StoreError> {
        let refund = Posting::new(
            debit.user_id,
            debit.amount.saturating_neg(),
            TransactionType::Refund,
            format!("Wager refused, round {} closed", round_id),
        )
        .keyed(&format!("bet_refused:{}", debit.transaction_id))
        .referencing(round_id);

        self.apply_posting(&refund).await?;
        tracing::warn!(%round_id, user_id = %debit.user_id, "Wager refused after debit, refunded");
        Ok(())
    }

    /// Moves a pending bet to its resolved status, guarded on the round when
    /// `open_cycle` is set.
    async fn move_bet_status(
        &self,
        bet: &Bet,
        resolution: &BetResolution,
    ) -> Result<Option<Bet>, StoreError> {
        let guard = match resolution.open_cycle {
            Some(_) => format!(" AND {}", self.round_open()),
            None => String::new(),
        };
        let updated: Vec<Bet> = self
            .query(
                format!(
                    "UPDATE {} AS b USE KEYS $id \
                     SET b.status = $status, b.updatedAt = $now \
                     WHERE b.status = 'pending'{} \
                     RETURNING RAW b",
                    self.keyspace(BETS),
                    guard
                ),
                json!({
                    "id": resolution.bet_id.to_string(),
                    "status": resolution.status,
                    "now": Utc::now(),
                    "round": bet.round_id.to_string(),
                    "cycle": resolution.open_cycle,
                }),
            )
            .await?;
        Ok(updated.into_iter().next())
    }

    /// Outcome for a bet that already left `pending`. A bet that reached the
    /// requested status without its credit gets the credit now.
    async fn finish_resolution(
        &self,
        bet: Bet,
        resolution: &BetResolution,
    ) -> Result<ResolveOutcome, StoreError> {
        let posting = match &resolution.credit {
            Some(posting) if bet.status == resolution.status => posting,
            _ => return Ok(ResolveOutcome::AlreadyResolved(bet)),
        };
        if self.has_transaction(posting.transaction_id).await? {
            return Ok(ResolveOutcome::AlreadyResolved(bet));
        }

        let balance = self.apply_posting(posting).await?;
        Ok(ResolveOutcome::Applied {
            bet,
            balance: Some(balance),
        })
    }

    async fn required_bet(&self, bet_id: Uuid) -> Result<Bet, StoreError> {
        self.bet(bet_id).await?.ok_or(StoreError::NotFound {
            entity: "bet",
            id: bet_id,
        })
    }
}

#[async_trait]
impl LedgerStore for CouchbaseStore {
    async fn insert_profile(&self, profile: &Profile) -> Result<Wallet, StoreError> {
        self.collection(PROFILES)
            .upsert(profile.user_id.to_string(), profile, UpsertOptions::default())
            .await
            .map_err(backend)?;

        let empty = WalletDocument {
            user_id: profile.user_id,
            balance: 0,
            updated_at: Utc::now(),
            applied: Vec::new(),
        };
        self.insert_once(WALLETS, profile.user_id, &empty).await?;

        self.wallet(profile.user_id)
            .await?
            .ok_or(StoreError::MissingWallet(profile.user_id))
    }

    async fn profile(&self, user_id: Uuid) -> Result<Option<Profile>, StoreError> {
        self.get(PROFILES, user_id).await
    }

    async fn wallet(&self, user_id: Uuid) -> Result<Option<Wallet>, StoreError> {
        Ok(self.wallet_document(user_id).await?.map(Wallet::from))
    }

    async fn transactions(
        &self,
        user_id: Uuid,
        transaction_type: Option<TransactionType>,
    ) -> Result<Vec<Transaction>, StoreError> {
        let filter = if transaction_type.is_some() {
            " AND t.type = $type"
        } else {
            ""
        };
        let statement = format!(
            "SELECT RAW t FROM {} AS t WHERE t.userId = $user{} ORDER BY t.createdAt",
            self.keyspace(TRANSACTIONS),
            filter
        );

        self.query(
            statement,
            json!({
                "user": user_id,
                "type": transaction_type.map(|t| t.to_string()),
            }),
        )
        .await
    }

    async fn has_transaction(&self, transaction_id: Uuid) -> Result<bool, StoreError> {
        Ok(self
            .get::<Transaction>(TRANSACTIONS, transaction_id)
            .await?
            .is_some())
    }

    async fn post(&self, posting: &Posting) -> Result<i64, StoreError> {
        self.apply_posting(posting).await
    }

    async fn insert_round(&self, round: &Round) -> Result<(), StoreError> {
        if self.insert_once(ROUNDS, round.id, round).await? {
            Ok(())
        } else {
            Err(StoreError::AlreadyExists {
                entity: "round",
                id: round.id,
            })
        }
    }

    async fn round(&self, round_id: Uuid) -> Result<Option<Round>, StoreError> {
        self.get(ROUNDS, round_id).await
    }

    async fn update_round(&self, round: &Round) -> Result<Round, StoreError> {
        let updated: Vec<Round> = self
            .query(
                format!(
                    "UPDATE {} AS r USE KEYS $id \
                     SET r.title = $title, \
                         r.options = $options, \
                         r.cycle = $cycle, \
                         r.bettingLocked = $betting_locked, \
                         r.winningOption = $winning_option, \
                         r.pendingTotal = $pending_total, \
                         r.version = r.version + 1 \
                     WHERE r.version = $version \
                     RETURNING RAW r",
                    self.keyspace(ROUNDS)
                ),
                json!({
                    "id": round.id.to_string(),
                    "title": round.title,
                    "options": round.options,
                    "cycle": round.cycle,
                    "betting_locked": round.betting_locked,
                    "winning_option": round.winning_option,
                    "pending_total": round.pending_total,
                    "version": round.version,
                }),
            )
            .await?;

        match updated.into_iter().next() {
            Some(stored) => Ok(stored),
            None if self.round(round.id).await?.is_some() => {
                Err(StoreError::VersionConflict(round.id))
            }
            None => Err(StoreError::NotFound {
                entity: "round",
                id: round.id,
            }),
        }
    }

    async fn bet(&self, bet_id: Uuid) -> Result<Option<Bet>, StoreError> {
        self.get(BETS, bet_id).await
    }

    async fn round_bets(&self, round_id: Uuid, cycle: u32) -> Result<Vec<Bet>, StoreError> {
        self.query(
            format!(
                "SELECT RAW b FROM {} AS b \
                 WHERE b.roundId = $round AND b.cycle = $cycle \
                 ORDER BY b.createdAt, b.id",
                self.keyspace(BETS)
            ),
            json!({ "round": round_id, "cycle": cycle }),
        )
        .await
    }

    async fn place_bet(
        &self,
        placement: &BetPlacement,
        debit: &Posting,
    ) -> Result<(Bet, i64), StoreError> {
        self.expect_open(placement.round_id, placement.cycle).await?;
        let existing = self.pending_bet(placement).await?;
        if let Some(bet) = &existing {
            bet.amount
                .checked_add(placement.amount)
                .ok_or(StoreError::AmountOverflow {
                    what: "bet",
                    id: bet.id,
                })?;
        }

        let balance = self.apply_posting(debit).await?;

        let topped_up = match &existing {
            Some(bet) => self.top_up_bet(bet.id, placement).await?,
            None => None,
        };
        let bet = match topped_up {
            Some(bet) => Some(bet),
            None => self.insert_bet(placement).await?,
        };

        match bet {
            Some(bet) => Ok((bet, balance)),
            None => {
                self.refund_refused_wager(debit, placement.round_id).await?;
                Err(StoreError::RoundNotOpen(placement.round_id))
            }
        }
    }

    async fn resolve_bet(&self, resolution: &BetResolution) -> Result<ResolveOutcome, StoreError> {
        let bet = self.required_bet(resolution.bet_id).await?;
        if !bet.status.can_transition_to(resolution.status) {
            return self.finish_resolution(bet, resolution).await;
        }

        // A round-guarded resolution claims the bet before crediting, so a
        // refused claim moves no money. Unguarded ones credit first and are
        // completed by running them again.
        if let Some(cycle) = resolution.open_cycle {
            self.expect_open(bet.round_id, cycle).await?;
            return match self.move_bet_status(&bet, resolution).await? {
                Some(moved) => {
                    let balance = match &resolution.credit {
                        Some(posting) => Some(self.apply_posting(posting).await?),
                        None => None,
                    };
                    Ok(ResolveOutcome::Applied {
                        bet: moved,
                        balance,
                    })
                }
                None => {
                    let current = self.required_bet(resolution.bet_id).await?;
                    if current.status == BetStatus::Pending {
                        Err(StoreError::RoundNotOpen(current.round_id))
                    } else {
                        self.finish_resolution(current, resolution).await
                    }
                }
            };
        }

        let balance = match &resolution.credit {
            Some(posting) => Some(self.apply_posting(posting).await?),
            None => None,
        };

        match self.move_bet_status(&bet, resolution).await? {
            Some(bet) => Ok(ResolveOutcome::Applied { bet, balance }),
            None => Ok(ResolveOutcome::AlreadyResolved(
                self.required_bet(resolution.bet_id).await?,
            )),
        }
    }
}
