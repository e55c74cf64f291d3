//! Mock market feed for integration testing.
//!
//! Provides a deterministic `MarketFeed` whose per-market snapshots are
//! set from test code, and which counts every request it serves.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use arena::feed::{FeedError, MarketFeed};
use arena::types::MarketSnapshot;

/// A scripted market feed. Unknown ids answer `NotFound`.
#[derive(Clone, Default)]
pub struct MockFeed {
    snapshots: Arc<Mutex<HashMap<String, MarketSnapshot>>>,
    calls: Arc<Mutex<Vec<String>>>,
    /// If set, every fetch returns this error.
    force_error: Arc<Mutex<Option<FeedError>>>,
}

impl MockFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve a closed market with the given final prices.
    pub fn closed(&self, external_id: &str, yes: f64, no: f64) {
        self.set(MarketSnapshot {
            external_id: external_id.to_string(),
            closed: true,
            outcome_prices: Some((yes, no)),
            ..Default::default()
        });
    }

    /// Serve a market that is still trading.
    pub fn open(&self, external_id: &str, yes: f64, no: f64) {
        self.set(MarketSnapshot {
            external_id: external_id.to_string(),
            closed: false,
            outcome_prices: Some((yes, no)),
            ..Default::default()
        });
    }

    pub fn set(&self, snapshot: MarketSnapshot) {
        self.snapshots
            .lock()
            .unwrap()
            .insert(snapshot.external_id.clone(), snapshot);
    }

    /// Force all subsequent fetches to return an error.
    pub fn set_error(&self, error: FeedError) {
        *self.force_error.lock().unwrap() = Some(error);
    }

    pub fn clear_error(&self) {
        *self.force_error.lock().unwrap() = None;
    }

    /// External ids requested so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

fn clone_error(e: &FeedError) -> FeedError {
    match e {
        FeedError::Network(m) => FeedError::Network(m.clone()),
        FeedError::Http { status, body } => FeedError::Http {
            status: *status,
            body: body.clone(),
        },
        FeedError::NotFound(m) => FeedError::NotFound(m.clone()),
        FeedError::Parse(m) => FeedError::Parse(m.clone()),
    }
}

#[async_trait]
impl MarketFeed for MockFeed {
    async fn fetch_market(&self, external_id: &str) -> Result<MarketSnapshot, FeedError> {
        self.calls.lock().unwrap().push(external_id.to_string());

        if let Some(e) = self.force_error.lock().unwrap().as_ref() {
            return Err(clone_error(e));
        }

        self.snapshots
            .lock()
            .unwrap()
            .get(external_id)
            .cloned()
            .ok_or_else(|| FeedError::NotFound(external_id.to_string()))
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

#[tokio::test]
async fn test_mock_feed_serves_and_counts() {
    let feed = MockFeed::new();
    feed.closed("ext-1", 0.99, 0.01);

    let snap = feed.fetch_market("ext-1").await.unwrap();
    assert!(snap.closed);
    assert!(matches!(
        feed.fetch_market("missing").await,
        Err(FeedError::NotFound(_))
    ));
    assert_eq!(feed.calls(), vec!["ext-1", "missing"]);
}

#[tokio::test]
async fn test_mock_feed_forced_error() {
    let feed = MockFeed::new();
    feed.closed("ext-1", 0.99, 0.01);
    feed.set_error(FeedError::Network("down".into()));
    assert!(feed.fetch_market("ext-1").await.is_err());

    feed.clear_error();
    assert!(feed.fetch_market("ext-1").await.is_ok());
}
