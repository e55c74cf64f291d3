//! End-to-end resolution cycles.
//!
//! Seeds a store with markets, agents and open predictions, scripts the
//! feed, and checks what a cycle leaves behind.

use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;

use arena::engine::classifier::ResolutionPolicy;
use arena::engine::resolver::{Resolver, ResolverConfig};
use arena::engine::settlement::SettlementCalculator;
use arena::feed::{FeedError, RetryConfig};
use arena::storage::memory::MemoryStore;
use arena::storage::sqlite::SqliteStore;
use arena::storage::ResolutionStore;
use arena::types::{Agent, ArenaError, Market, MarketSnapshot, Prediction, Side};

use crate::flaky_store::FlakyStore;
use crate::mock_feed::MockFeed;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// A market that ended `hours_ago` hours ago. Its external id is `ext-<id>`.
fn market(id: &str, hours_ago: i64) -> Market {
    Market {
        id: id.to_string(),
        external_id: format!("ext-{id}"),
        slug: id.to_string(),
        question: format!("Will {id} happen?"),
        end_date: Utc::now() - Duration::hours(hours_ago),
        resolved: false,
        outcome: None,
        resolved_at: None,
        yes_price: 0.5,
        no_price: 0.5,
        volume: 25_000.0,
    }
}

fn prediction(
    id: &str,
    agent_id: &str,
    market_id: &str,
    side: Side,
    price: Decimal,
    research_cost: Decimal,
) -> Prediction {
    Prediction {
        id: id.to_string(),
        agent_id: agent_id.to_string(),
        market_id: market_id.to_string(),
        side,
        confidence: 0.65,
        price_at_prediction: price,
        research_cost,
        created_at: Utc::now() - Duration::days(3),
        settlement: None,
    }
}

fn quick_config() -> ResolverConfig {
    ResolverConfig {
        fetch_delay: std::time::Duration::ZERO,
        retry: RetryConfig::none(),
        ..ResolverConfig::default()
    }
}

fn resolver(store: Arc<dyn ResolutionStore>, feed: &MockFeed) -> Resolver {
    Resolver::new(
        store,
        Arc::new(feed.clone()),
        SettlementCalculator::default(),
        quick_config(),
    )
}

/// One market, two agents on opposite sides, resolving YES.
fn two_sided_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store.insert_market(market("m1", 1));
    store.insert_agent(Agent::new("alpha", "Alpha"));
    store.insert_agent(Agent::new("beta", "Beta"));
    store.insert_prediction(prediction("p1", "alpha", "m1", Side::Yes, dec!(0.40), dec!(0.10)));
    store.insert_prediction(prediction("p2", "beta", "m1", Side::No, dec!(0.60), dec!(0.10)));
    store
}

// ---------------------------------------------------------------------------
// Happy path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_cycle_settles_both_sides_of_a_market() {
    let store = two_sided_store();
    let feed = MockFeed::new();
    feed.closed("ext-m1", 0.99, 0.01);

    let report = resolver(store.clone(), &feed).run_cycle().await.unwrap();
    assert_eq!(report.markets_checked, 1);
    assert_eq!(report.markets_resolved, 1);
    assert_eq!(report.predictions_settled, 2);
    assert_eq!(report.agents_updated, 2);
    assert!(report.errors.is_empty());

    let m1 = store.market("m1").unwrap();
    assert!(m1.resolved);
    assert_eq!(m1.outcome, Some(Side::Yes));
    assert!(m1.resolved_at.is_some());

    let won = store.prediction("p1").unwrap().settlement.unwrap();
    assert!(won.correct);
    assert_eq!(won.outcome, Side::Yes);
    assert_eq!(won.profit_loss, dec!(14.90));

    let lost = store.prediction("p2").unwrap().settlement.unwrap();
    assert!(!lost.correct);
    assert_eq!(lost.profit_loss, dec!(-10.10));

    let beta = store.get_agent("beta").await.unwrap().unwrap();
    assert_eq!(beta.stats.resolved_predictions, 1);
    assert_eq!(beta.stats.accuracy, 0.0);
    assert_eq!(beta.stats.current_streak, 0);
}

#[tokio::test]
async fn test_agent_stats_across_three_markets() {
    let store = Arc::new(MemoryStore::new());
    // Oldest end date resolves first: loss, then two wins.
    store.insert_market(market("m3", 3));
    store.insert_market(market("m1", 2));
    store.insert_market(market("m2", 1));
    store.insert_agent(Agent::new("alpha", "Alpha"));
    store.insert_prediction(prediction("p1", "alpha", "m3", Side::Yes, dec!(0.40), Decimal::ZERO));
    store.insert_prediction(prediction("p2", "alpha", "m1", Side::Yes, dec!(0.40), Decimal::ZERO));
    store.insert_prediction(prediction("p3", "alpha", "m2", Side::No, dec!(0.40), Decimal::ZERO));

    let feed = MockFeed::new();
    feed.closed("ext-m3", 0.01, 0.99);
    feed.closed("ext-m1", 0.995, 0.005);
    feed.closed("ext-m2", 0.0, 1.0);

    let report = resolver(store.clone(), &feed).run_cycle().await.unwrap();
    assert_eq!(report.markets_resolved, 3);
    assert_eq!(report.predictions_settled, 3);
    assert_eq!(feed.calls(), vec!["ext-m3", "ext-m1", "ext-m2"]);

    let alpha = store.get_agent("alpha").await.unwrap().unwrap();
    assert_eq!(alpha.total_predictions, 3);
    assert_eq!(alpha.stats.resolved_predictions, 3);
    assert_eq!(alpha.stats.correct_predictions, 2);
    assert_eq!(alpha.stats.total_profit_loss, dec!(20));
    assert_eq!(alpha.stats.accuracy, 66.67);
    assert_eq!(alpha.stats.roi, 66.67);
    assert_eq!(alpha.stats.current_streak, 2);
    assert_eq!(alpha.stats.longest_streak, 2);
}

#[tokio::test]
async fn test_second_cycle_is_a_no_op() {
    let store = two_sided_store();
    let feed = MockFeed::new();
    feed.closed("ext-m1", 0.99, 0.01);
    let resolver = resolver(store.clone(), &feed);

    resolver.run_cycle().await.unwrap();
    let before = store.predictions();

    let again = resolver.run_cycle().await.unwrap();
    assert_eq!(again.markets_checked, 0);
    assert_eq!(again.markets_resolved, 0);
    assert_eq!(again.markets_recovered, 0);
    assert_eq!(again.predictions_settled, 0);
    assert_eq!(feed.calls().len(), 1);

    let after = store.predictions();
    for (b, a) in before.iter().zip(after.iter()) {
        assert_eq!(b.settlement, a.settlement);
    }
}

#[tokio::test]
async fn test_open_market_waits_for_close() {
    let store = two_sided_store();
    let feed = MockFeed::new();
    feed.open("ext-m1", 0.97, 0.03);
    let resolver = resolver(store.clone(), &feed);

    let first = resolver.run_cycle().await.unwrap();
    assert_eq!(first.markets_checked, 1);
    assert_eq!(first.markets_resolved, 0);
    assert!(!store.market("m1").unwrap().resolved);

    feed.closed("ext-m1", 0.02, 0.98);
    let second = resolver.run_cycle().await.unwrap();
    assert_eq!(second.markets_resolved, 1);
    assert_eq!(store.market("m1").unwrap().outcome, Some(Side::No));
}

#[tokio::test]
async fn test_closed_without_extreme_prices_stays_open() {
    let store = two_sided_store();
    let feed = MockFeed::new();
    feed.closed("ext-m1", 0.5, 0.5);

    let report = resolver(store.clone(), &feed).run_cycle().await.unwrap();
    assert_eq!(report.markets_resolved, 0);
    assert!(report.errors.is_empty());
    assert!(!store.market("m1").unwrap().resolved);
}

#[tokio::test]
async fn test_label_policy_reads_resolution_field() {
    let store = two_sided_store();
    let feed = MockFeed::new();
    feed.set(MarketSnapshot {
        external_id: "ext-m1".to_string(),
        closed: true,
        outcome_label: Some("No".to_string()),
        outcome_prices: Some((0.5, 0.5)),
        ..Default::default()
    });

    let config = ResolverConfig {
        policy: ResolutionPolicy::Label,
        ..quick_config()
    };
    let resolver = Resolver::new(
        store.clone(),
        Arc::new(feed.clone()),
        SettlementCalculator::default(),
        config,
    );

    let report = resolver.run_cycle().await.unwrap();
    assert_eq!(report.markets_resolved, 1);
    assert_eq!(store.market("m1").unwrap().outcome, Some(Side::No));
    assert!(store.prediction("p2").unwrap().settlement.unwrap().correct);
}

#[tokio::test]
async fn test_future_markets_are_not_fetched() {
    let store = Arc::new(MemoryStore::new());
    store.insert_market(market("later", -24));
    let feed = MockFeed::new();

    let report = resolver(store, &feed).run_cycle().await.unwrap();
    assert_eq!(report.markets_checked, 0);
    assert!(feed.calls().is_empty());
}

// ---------------------------------------------------------------------------
// Failures and recovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_feed_outage_defers_market() {
    let store = two_sided_store();
    let feed = MockFeed::new();
    feed.closed("ext-m1", 0.99, 0.01);
    feed.set_error(FeedError::Http {
        status: 503,
        body: "unavailable".into(),
    });
    let resolver = resolver(store.clone(), &feed);

    let first = resolver.run_cycle().await.unwrap();
    assert_eq!(first.markets_resolved, 0);
    assert_eq!(first.error_count(), 1);
    assert!(!store.market("m1").unwrap().resolved);

    feed.clear_error();
    let second = resolver.run_cycle().await.unwrap();
    assert_eq!(second.markets_resolved, 1);
    assert_eq!(second.predictions_settled, 2);
}

#[tokio::test]
async fn test_one_bad_market_does_not_block_others() {
    let store = Arc::new(MemoryStore::new());
    store.insert_market(market("gone", 2));
    store.insert_market(market("ok", 1));
    store.insert_agent(Agent::new("alpha", "Alpha"));
    store.insert_prediction(prediction("p1", "alpha", "ok", Side::Yes, dec!(0.5), Decimal::ZERO));

    let feed = MockFeed::new();
    feed.closed("ext-ok", 1.0, 0.0);

    let report = resolver(store.clone(), &feed).run_cycle().await.unwrap();
    assert_eq!(report.markets_checked, 2);
    assert_eq!(report.markets_resolved, 1);
    assert_eq!(report.error_count(), 1);
    assert!(report.errors[0].contains("gone"));
    assert_eq!(
        store.prediction("p1").unwrap().settlement.unwrap().profit_loss,
        dec!(10)
    );
}

#[tokio::test]
async fn test_candidate_load_failure_aborts_cycle() {
    let flaky = Arc::new(FlakyStore::new(two_sided_store()));
    flaky.fail_candidates(true);
    let feed = MockFeed::new();

    let result = resolver(flaky, &feed).run_cycle().await;
    assert!(matches!(result, Err(ArenaError::Store(_))));
    assert!(feed.calls().is_empty());
}

#[tokio::test]
async fn test_settle_failure_is_recovered_next_cycle() {
    let memory = two_sided_store();
    let flaky = Arc::new(FlakyStore::new(memory.clone()));
    flaky.fail_settle("p2");
    let feed = MockFeed::new();
    feed.closed("ext-m1", 0.99, 0.01);
    let resolver = resolver(flaky.clone(), &feed);

    let first = resolver.run_cycle().await.unwrap();
    assert_eq!(first.markets_resolved, 1);
    assert_eq!(first.predictions_settled, 1);
    assert_eq!(first.agents_updated, 1);
    assert_eq!(first.error_count(), 1);
    assert!(memory.prediction("p2").unwrap().settlement.is_none());

    // Still failing: the market is retried but not counted as recovered.
    let stuck = resolver.run_cycle().await.unwrap();
    assert_eq!(stuck.markets_recovered, 0);
    assert_eq!(stuck.predictions_settled, 0);
    assert_eq!(stuck.agents_updated, 0);
    assert_eq!(stuck.error_count(), 1);

    flaky.heal();
    let second = resolver.run_cycle().await.unwrap();
    assert_eq!(second.markets_checked, 0);
    assert_eq!(second.markets_recovered, 1);
    assert_eq!(second.predictions_settled, 1);
    assert_eq!(second.agents_updated, 1);
    assert!(second.errors.is_empty());

    let p2 = memory.prediction("p2").unwrap().settlement.unwrap();
    assert_eq!(p2.outcome, Side::Yes);
    assert_eq!(p2.profit_loss, dec!(-10.10));
    let beta = memory.get_agent("beta").await.unwrap().unwrap();
    assert_eq!(beta.stats.resolved_predictions, 1);

    // Nothing was fetched for the recovered market.
    assert_eq!(feed.calls().len(), 1);
}

#[tokio::test]
async fn test_agent_update_failure_is_isolated() {
    let memory = two_sided_store();
    let flaky = Arc::new(FlakyStore::new(memory.clone()));
    flaky.fail_agent_update("beta");
    let feed = MockFeed::new();
    feed.closed("ext-m1", 0.99, 0.01);
    let resolver = resolver(flaky.clone(), &feed);

    let report = resolver.run_cycle().await.unwrap();
    assert_eq!(report.predictions_settled, 2);
    assert_eq!(report.agents_updated, 1);
    assert_eq!(report.error_count(), 1);
    assert!(report.errors[0].contains("beta"));

    let beta = memory.get_agent("beta").await.unwrap().unwrap();
    assert_eq!(beta.stats.resolved_predictions, 0);

    // The next cycle has nothing to settle but still repairs beta.
    flaky.heal();
    let next = resolver.run_cycle().await.unwrap();
    assert_eq!(next.predictions_settled, 0);
    assert_eq!(next.agents_updated, 1);
    assert!(next.errors.is_empty());

    let beta = memory.get_agent("beta").await.unwrap().unwrap();
    assert_eq!(beta.stats.resolved_predictions, 1);
    assert_eq!(beta.stats.total_profit_loss, dec!(-10.10));

    let settled = resolver.run_cycle().await.unwrap();
    assert_eq!(settled.agents_updated, 0);
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_overlapping_cycles_never_double_settle() {
    let store = Arc::new(MemoryStore::new());
    let feed = MockFeed::new();
    for i in 0..5 {
        let id = format!("m{i}");
        store.insert_market(market(&id, 1));
        feed.closed(&format!("ext-{id}"), 0.99, 0.01);
        for agent in ["alpha", "beta"] {
            store.insert_prediction(prediction(
                &format!("{id}-{agent}"),
                agent,
                &id,
                Side::Yes,
                dec!(0.5),
                Decimal::ZERO,
            ));
        }
    }
    store.insert_agent(Agent::new("alpha", "Alpha"));
    store.insert_agent(Agent::new("beta", "Beta"));

    let a = Arc::new(resolver(store.clone(), &feed));
    let b = Arc::new(resolver(store.clone(), &feed));
    let (ra, rb) = tokio::join!(
        tokio::spawn({
            let a = a.clone();
            async move { a.run_cycle().await }
        }),
        tokio::spawn({
            let b = b.clone();
            async move { b.run_cycle().await }
        }),
    );
    let ra = ra.unwrap().unwrap();
    let rb = rb.unwrap().unwrap();

    assert_eq!(ra.markets_resolved + rb.markets_resolved, 5);
    assert_eq!(ra.predictions_settled + rb.predictions_settled, 10);
    assert!(store.predictions().iter().all(|p| p.is_settled()));

    for id in ["alpha", "beta"] {
        let agent = store.get_agent(id).await.unwrap().unwrap();
        assert_eq!(agent.stats.resolved_predictions, 5);
        assert_eq!(agent.stats.correct_predictions, 5);
        assert_eq!(agent.stats.total_profit_loss, dec!(50));
    }
}

#[tokio::test]
async fn test_slow_stats_write_does_not_overwrite_newer_stats() {
    let memory = Arc::new(MemoryStore::new());
    memory.insert_market(market("m1", 2));
    memory.insert_market(market("m2", 1));
    memory.insert_agent(Agent::new("alpha", "Alpha"));
    memory.insert_prediction(prediction("p1", "alpha", "m1", Side::Yes, dec!(0.5), Decimal::ZERO));
    memory.insert_prediction(prediction("p2", "alpha", "m2", Side::Yes, dec!(0.5), Decimal::ZERO));
    let flaky = Arc::new(FlakyStore::new(memory.clone()));
    let feed = MockFeed::new();
    feed.closed("ext-m1", 0.99, 0.01);
    feed.closed("ext-m2", 0.99, 0.01);

    // Cycle A settles m1, reads alpha's one-prediction history and stalls.
    let (paused, release) = flaky.pause_history_once("alpha");
    let slow = Arc::new(resolver(flaky.clone(), &feed));
    let handle = tokio::spawn({
        let slow = slow.clone();
        async move { slow.run_cycle().await }
    });
    paused.notified().await;
    assert!(memory.prediction("p1").unwrap().is_settled());
    assert!(!memory.prediction("p2").unwrap().is_settled());

    // Cycle B settles m2 and stores stats covering both predictions.
    let fast = resolver(flaky.clone(), &feed).run_cycle().await.unwrap();
    assert_eq!(fast.markets_resolved, 1);
    assert_eq!(fast.predictions_settled, 1);
    let alpha = memory.get_agent("alpha").await.unwrap().unwrap();
    assert_eq!(alpha.stats.resolved_predictions, 2);

    // A's stale snapshot lands last and must not win.
    release.notify_one();
    let late = handle.await.unwrap().unwrap();
    assert_eq!(late.predictions_settled, 1);

    let alpha = memory.get_agent("alpha").await.unwrap().unwrap();
    assert_eq!(alpha.stats.resolved_predictions, 2);
    assert_eq!(alpha.stats.correct_predictions, 2);
    assert_eq!(alpha.stats.total_profit_loss, dec!(20));
}

// ---------------------------------------------------------------------------
// SQLite backend
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_cycle_against_sqlite() {
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    store.upsert_market(&market("m1", 1)).await.unwrap();
    store.upsert_agent(&Agent::new("alpha", "Alpha")).await.unwrap();
    store.upsert_agent(&Agent::new("beta", "Beta")).await.unwrap();
    store
        .insert_prediction(&prediction("p1", "alpha", "m1", Side::Yes, dec!(0.40), dec!(0.10)))
        .await
        .unwrap();
    store
        .insert_prediction(&prediction("p2", "beta", "m1", Side::No, dec!(0.60), dec!(0.10)))
        .await
        .unwrap();

    let feed = MockFeed::new();
    feed.closed("ext-m1", 0.99, 0.01);
    let resolver = resolver(store.clone(), &feed);

    let report = resolver.run_cycle().await.unwrap();
    assert_eq!(report.markets_resolved, 1);
    assert_eq!(report.predictions_settled, 2);
    assert_eq!(report.agents_updated, 2);

    let alpha = store.get_agent("alpha").await.unwrap().unwrap();
    assert_eq!(alpha.stats.total_profit_loss, dec!(14.90));
    assert_eq!(alpha.stats.accuracy, 100.0);
    assert_eq!(alpha.stats.roi, 149.0);

    let again = resolver.run_cycle().await.unwrap();
    assert_eq!(again.markets_resolved, 0);
    assert_eq!(again.predictions_settled, 0);

    let leaderboard = store.list_agents().await.unwrap();
    assert_eq!(leaderboard.len(), 2);
}
