use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{DecodeError, TrackerResult};
use crate::order_key::{KeyShape, OrderKey};
use crate::registry::Registry;
use crate::store::StoredValue;
use crate::types::{
    BidType, Marketplace, NormalizedOffer, OrderRecord, ProgressReport, TaskConfig, wei_to_eth,
};

/// Live offers of one marketplace plus what was dropped on the way.
#[derive(Debug, Default)]
struct MarketplaceSlice {
    offers: Vec<NormalizedOffer>,
    decode_errors: usize,
    discarded: usize,
    unreadable: usize,
}

/// Turns registry membership plus record state into the live offer list.
///
/// Read-only: nothing is written or pruned while reconciling.
#[derive(Clone)]
pub struct ReconcileEngine {
    registry: Registry,
    deadline: Duration,
}

impl ReconcileEngine {
    pub fn new(registry: Registry, deadline: Duration) -> Self {
        Self { registry, deadline }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Reconcile every marketplace for `task` concurrently.
    ///
    /// Marketplaces that miss the deadline or fail are listed in the report
    /// and contribute no offers; the others are returned as usual.
    pub async fn get_progress(&self, task: &TaskConfig) -> ProgressReport {
        let started = Instant::now();
        let deadline = started + self.deadline;
        let now = Utc::now();
        let [first, second, third] = Marketplace::ALL;

        let (a, b, c) = tokio::join!(
            tokio::time::timeout_at(deadline, self.reconcile_marketplace(task, first, now)),
            tokio::time::timeout_at(deadline, self.reconcile_marketplace(task, second, now)),
            tokio::time::timeout_at(deadline, self.reconcile_marketplace(task, third, now)),
        );

        let mut report = ProgressReport {
            task_id: task.task_id.clone(),
            bid_type: task.bid_type,
            generated_at: now,
            offers: Vec::new(),
            decode_errors: 0,
            discarded: 0,
            unreadable: 0,
            timed_out: Vec::new(),
            failed: Vec::new(),
        };

        for (marketplace, outcome) in [(first, a), (second, b), (third, c)] {
            match outcome {
                Ok(Ok(slice)) => {
                    report.decode_errors += slice.decode_errors;
                    report.discarded += slice.discarded;
                    report.unreadable += slice.unreadable;
                    report.offers.extend(slice.offers);
                }
                Ok(Err(err)) => {
                    warn!(task_id = %task.task_id, %marketplace, error = %err, "marketplace read failed");
                    report.failed.push(marketplace);
                }
                Err(_) => {
                    warn!(
                        task_id = %task.task_id,
                        %marketplace,
                        deadline_ms = self.deadline.as_millis() as u64,
                        "marketplace read timed out"
                    );
                    report.timed_out.push(marketplace);
                }
            }
        }

        // Trait tasks surface the soonest-to-expire bids first; the others
        // keep marketplace grouping. The sort is stable.
        if task.bid_type == BidType::Trait {
            report.offers.sort_by_key(|o| o.remaining_ttl_secs);
        }

        info!(
            task_id = %task.task_id,
            offers = report.offers.len(),
            decode_errors = report.decode_errors,
            discarded = report.discarded,
            unreadable = report.unreadable,
            partial = report.is_partial(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "progress reconciled"
        );
        report
    }

    async fn reconcile_marketplace(
        &self,
        task: &TaskConfig,
        marketplace: Marketplace,
        now: DateTime<Utc>,
    ) -> TrackerResult<MarketplaceSlice> {
        let candidates = self
            .registry
            .list_candidate_keys(&task.task_id, marketplace)
            .await?;

        let mut slice = MarketplaceSlice {
            decode_errors: candidates.undecodable.len(),
            ..MarketplaceSlice::default()
        };
        for err in &candidates.undecodable {
            warn!(task_id = %task.task_id, %marketplace, error = %err, "skipping registry entry");
        }
        if candidates.keys.is_empty() {
            return Ok(slice);
        }

        let records = self.registry.fetch_records(&candidates.keys).await?;
        for (key, read) in candidates.keys.into_iter().zip(records) {
            let stored = match read {
                Ok(Some(stored)) => stored,
                Ok(None) => {
                    slice.discarded += 1;
                    continue;
                }
                Err(err) => {
                    warn!(task_id = %task.task_id, %marketplace, key = %key, error = %err, "order record unreadable");
                    slice.unreadable += 1;
                    continue;
                }
            };
            if expected_shape(task.bid_type) != key.shape() {
                debug!(task_id = %task.task_id, key = %key, "key shape differs from task bid type");
            }
            match shape_offer(key, stored, now) {
                Ok(Some(offer)) => slice.offers.push(offer),
                Ok(None) => slice.discarded += 1,
                Err(err) => {
                    warn!(task_id = %task.task_id, %marketplace, error = %err, "skipping order record");
                    slice.decode_errors += 1;
                }
            }
        }
        slice.offers.sort_by_key(|o| o.order_key.sequence);
        Ok(slice)
    }
}

fn expected_shape(bid_type: BidType) -> KeyShape {
    match bid_type {
        BidType::Trait => KeyShape::Trait,
        BidType::Token | BidType::Collection => KeyShape::Flat,
    }
}

/// Build the dashboard view of one record. `Ok(None)` when its TTL has run
/// out or it never had one.
fn shape_offer(
    key: OrderKey,
    stored: StoredValue,
    now: DateTime<Utc>,
) -> Result<Option<NormalizedOffer>, DecodeError> {
    if stored.ttl_ms <= 0 {
        return Ok(None);
    }
    let record: OrderRecord = serde_json::from_str(&stored.value).map_err(|e| {
        DecodeError::new(&key.encode(), format!("invalid order record: {e}"))
    })?;
    let ttl_ms = stored.ttl_ms as u64;
    Ok(Some(NormalizedOffer {
        marketplace: key.marketplace,
        scope: key.scope.clone(),
        remaining_ttl_secs: ttl_ms.div_ceil(1000),
        expires_at: now + chrono::Duration::milliseconds(stored.ttl_ms),
        payload: record.payload,
        offer_price: record.offer_price,
        offer_price_eth: wei_to_eth(record.offer_price),
        order_key: key,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use rust_decimal_macros::dec;
    use serde_json::json;

    use crate::order_key::OfferScope;
    use crate::registry::registry_key;
    use crate::store::{KvStore, MemoryStore};

    const ETH: u128 = 1_000_000_000_000_000_000;

    fn engine() -> (ReconcileEngine, MemoryStore) {
        let store = MemoryStore::new();
        let registry = Registry::new(Arc::new(store.clone()));
        (ReconcileEngine::new(registry, Duration::from_secs(2)), store)
    }

    fn task(task_id: &str, bid_type: BidType) -> TaskConfig {
        TaskConfig {
            task_id: task_id.to_string(),
            bid_type,
            selected_marketplaces: Marketplace::ALL.to_vec(),
        }
    }

    fn trait_scope(value: &str) -> OfferScope {
        OfferScope::Trait {
            trait_type: "Hat".to_string(),
            trait_value: value.to_string(),
        }
    }

    async fn place(
        engine: &ReconcileEngine,
        key: &OrderKey,
        price: u128,
        ttl_secs: u64,
    ) {
        let record = OrderRecord {
            payload: json!({"orderHash": format!("0x{}", key.sequence)}),
            offer_price: price,
        };
        engine
            .registry()
            .register_order(key, &record, Duration::from_secs(ttl_secs))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn collection_task_single_offer() {
        let (engine, _) = engine();
        let key = OrderKey::new("T1", 1, Marketplace::OpenSea, OfferScope::Collection);
        place(&engine, &key, ETH / 2, 120).await;

        let report = engine.get_progress(&task("T1", BidType::Collection)).await;
        assert_eq!(report.offers.len(), 1);
        let offer = &report.offers[0];
        assert_eq!(offer.marketplace, Marketplace::OpenSea);
        assert_eq!(offer.scope, OfferScope::Collection);
        assert_eq!(offer.offer_price, ETH / 2);
        assert_eq!(offer.offer_price_eth, Some(dec!(0.5)));
        assert!(offer.remaining_ttl_secs <= 120 && offer.remaining_ttl_secs > 0);
        assert_eq!(offer.payload, json!({"orderHash": "0x1"}));
        assert_eq!(offer.order_key, key);
        assert!(!report.is_partial());
        assert_eq!(report.offers_for(Marketplace::Blur).count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn trait_task_sorts_by_remaining_ttl() {
        let (engine, _) = engine();
        let blue = OrderKey::new("T2", 1, Marketplace::OpenSea, trait_scope("Blue"));
        let red = OrderKey::new("T2", 2, Marketplace::Blur, trait_scope("Red"));
        place(&engine, &blue, ETH, 90).await;
        place(&engine, &red, ETH, 30).await;

        let report = engine.get_progress(&task("T2", BidType::Trait)).await;
        let values: Vec<_> = report
            .offers
            .iter()
            .map(|o| match &o.scope {
                OfferScope::Trait { trait_value, .. } => trait_value.as_str(),
                _ => "",
            })
            .collect();
        assert_eq!(values, vec!["Red", "Blue"]);
        assert_eq!(report.offers[0].remaining_ttl_secs, 30);
        assert_eq!(report.offers[1].remaining_ttl_secs, 90);
    }

    #[tokio::test(start_paused = true)]
    async fn flat_tasks_keep_marketplace_grouping() {
        let (engine, _) = engine();
        let token = |m, seq| {
            OrderKey::new(
                "T3",
                seq,
                m,
                OfferScope::Token {
                    token_id: "42".to_string(),
                },
            )
        };
        place(&engine, &token(Marketplace::MagicEden, 1), 1, 10).await;
        place(&engine, &token(Marketplace::OpenSea, 2), 1, 300).await;
        place(&engine, &token(Marketplace::Blur, 3), 1, 60).await;

        let report = engine.get_progress(&task("T3", BidType::Token)).await;
        let order: Vec<_> = report.offers.iter().map(|o| o.marketplace).collect();
        assert_eq!(
            order,
            vec![Marketplace::OpenSea, Marketplace::Blur, Marketplace::MagicEden]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn expired_records_are_dropped_silently() {
        let (engine, _) = engine();
        let stale = OrderKey::new("T4", 1, Marketplace::OpenSea, OfferScope::Collection);
        let live = OrderKey::new("T4", 2, Marketplace::OpenSea, OfferScope::Collection);
        place(&engine, &stale, 1, 5).await;
        place(&engine, &live, 1, 500).await;

        tokio::time::advance(Duration::from_secs(6)).await;
        let report = engine.get_progress(&task("T4", BidType::Collection)).await;
        assert_eq!(report.offers.len(), 1);
        assert_eq!(report.offers[0].order_key, live);
        assert_eq!(report.discarded, 1);
        assert_eq!(report.decode_errors, 0);
        assert!(!report.is_partial());

        // The stale key is still indexed; reconciliation does not prune.
        let candidates = engine
            .registry()
            .list_candidate_keys("T4", Marketplace::OpenSea)
            .await
            .unwrap();
        assert_eq!(candidates.keys.len(), 2);
    }

    #[tokio::test]
    async fn records_without_ttl_are_not_live() {
        let (engine, store) = engine();
        let key = OrderKey::new("T5", 1, Marketplace::Blur, OfferScope::Collection);
        store.insert_raw(&key.encode(), r#"{"payload":"x","offerPrice":"1"}"#, None);
        store
            .set_add(registry_key("T5", Marketplace::Blur), key.encode())
            .await
            .unwrap();

        let report = engine.get_progress(&task("T5", BidType::Collection)).await;
        assert!(report.offers.is_empty());
        assert_eq!(report.discarded, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn decode_failures_are_contained() {
        let (engine, store) = engine();
        let good = OrderKey::new("T6", 1, Marketplace::OpenSea, OfferScope::Collection);
        place(&engine, &good, 7, 60).await;

        let set = registry_key("T6", Marketplace::OpenSea);
        store.set_add(set.clone(), "T6:1:opensea".into()).await.unwrap();
        let bad_record = OrderKey::new("T6", 2, Marketplace::OpenSea, OfferScope::Collection);
        store.insert_raw(&bad_record.encode(), "not json", Some(Duration::from_secs(60)));
        store.set_add(set, bad_record.encode()).await.unwrap();

        let report = engine.get_progress(&task("T6", BidType::Collection)).await;
        assert_eq!(report.offers.len(), 1);
        assert_eq!(report.offers[0].order_key, good);
        assert_eq!(report.decode_errors, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_marketplace_yields_partial_report() {
        let (engine, store) = engine();
        place(
            &engine,
            &OrderKey::new("T7", 1, Marketplace::OpenSea, OfferScope::Collection),
            1,
            60,
        )
        .await;
        place(
            &engine,
            &OrderKey::new("T7", 2, Marketplace::Blur, OfferScope::Collection),
            1,
            60,
        )
        .await;
        place(
            &engine,
            &OrderKey::new("T7", 3, Marketplace::MagicEden, OfferScope::Collection),
            1,
            60,
        )
        .await;
        store.stall_keys_matching(":blur");
        store.fail_keys_matching(":magiceden");

        let started = Instant::now();
        let report = engine.get_progress(&task("T7", BidType::Collection)).await;
        assert!(started.elapsed() <= Duration::from_secs(3));
        assert_eq!(report.timed_out, vec![Marketplace::Blur]);
        assert_eq!(report.failed, vec![Marketplace::MagicEden]);
        assert_eq!(report.offers.len(), 1);
        assert_eq!(report.offers[0].marketplace, Marketplace::OpenSea);
        assert!(report.is_partial());
    }

    #[tokio::test(start_paused = true)]
    async fn one_node_down_only_loses_its_own_keys() {
        use crate::cluster::key_slot;

        let (engine, store) = engine();
        let mut keys = Vec::new();
        for (i, marketplace) in Marketplace::ALL.into_iter().enumerate() {
            for n in 1..=4 {
                let key = OrderKey::new(
                    "T9",
                    (i * 10 + n) as u64,
                    marketplace,
                    OfferScope::Collection,
                );
                place(&engine, &key, 1, 60).await;
                keys.push(key);
            }
        }
        // Middle third of a three-primary cluster.
        let down = 5_461..=10_922;
        store.fail_slots(down.clone());
        let on_down_node = |key: &str| down.contains(&key_slot(key));

        let report = engine.get_progress(&task("T9", BidType::Collection)).await;

        let failed: Vec<_> = Marketplace::ALL
            .into_iter()
            .filter(|m| on_down_node(&registry_key("T9", *m)))
            .collect();
        assert_eq!(report.failed, failed);
        assert!(failed.len() < Marketplace::ALL.len());
        assert!(report.timed_out.is_empty());

        let reachable: Vec<_> = keys
            .iter()
            .filter(|k| !failed.contains(&k.marketplace))
            .collect();
        let expected: Vec<_> = reachable
            .iter()
            .filter(|k| !on_down_node(&k.encode()))
            .map(|k| (*k).clone())
            .collect();
        let got: Vec<_> = report.offers.iter().map(|o| o.order_key.clone()).collect();
        assert_eq!(got, expected);
        assert!(!got.is_empty());
        assert_eq!(report.unreadable, reachable.len() - expected.len());
        assert!(report.is_partial());
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_calls_agree() {
        let (engine, _) = engine();
        for seq in 0..4 {
            let m = Marketplace::ALL[seq as usize % 3];
            place(
                &engine,
                &OrderKey::new("T8", seq, m, trait_scope(&format!("v{seq}"))),
                seq as u128,
                60 + seq,
            )
            .await;
        }
        let t = task("T8", BidType::Trait);
        let first = engine.get_progress(&t).await;
        let second = engine.get_progress(&t).await;
        let keys = |r: &ProgressReport| {
            r.offers
                .iter()
                .map(|o| (o.order_key.clone(), o.offer_price, o.remaining_ttl_secs))
                .collect::<Vec<_>>()
        };
        assert_eq!(keys(&first), keys(&second));
        assert_eq!(first.offers.len(), 4);
    }

    #[tokio::test]
    async fn unknown_task_is_empty_not_an_error() {
        let (engine, _) = engine();
        let report = engine.get_progress(&task("nobody", BidType::Collection)).await;
        assert!(report.offers.is_empty());
        assert!(!report.is_partial());
        assert_eq!(report.discarded, 0);
    }

    #[test]
    fn shape_offer_rounds_ttl_up() {
        let key = OrderKey::new("T", 1, Marketplace::OpenSea, OfferScope::Collection);
        let stored = StoredValue {
            value: r#"{"payload":null,"offerPrice":"5"}"#.to_string(),
            ttl_ms: 1_001,
        };
        let now = Utc::now();
        let offer = shape_offer(key.clone(), stored, now).unwrap().unwrap();
        assert_eq!(offer.remaining_ttl_secs, 2);
        assert_eq!(offer.expires_at, now + chrono::Duration::milliseconds(1_001));

        let gone = StoredValue {
            value: "{}".to_string(),
            ttl_ms: -2,
        };
        assert_eq!(shape_offer(key, gone, now), Ok(None));
    }
}
