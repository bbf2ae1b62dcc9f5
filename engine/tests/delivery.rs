//! End-to-end delivery tests for approver-engine
//!
//! These tests drive a full [`Engine`] against an in-process transport and
//! check what reaches the endpoint.

use approver_engine::{
    Attributes, DispatchState, Engine, EngineConfig, Error, Transport, TransportError,
    UploadRequest, UploadResponse,
};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Endpoint double: fails while its script says so, acknowledges the whole
/// batch otherwise, and remembers every request.
#[derive(Default)]
struct Endpoint {
    failures: Mutex<VecDeque<TransportError>>,
    always_fail: bool,
    /// Reject requests whose records or identity belong to another app than
    /// the bearer, like the collector does
    check_app_ids: bool,
    requests: Mutex<Vec<UploadRequest>>,
}

impl Endpoint {
    fn healthy() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn failing_first(count: usize) -> Arc<Self> {
        let failures = (0..count)
            .map(|_| TransportError::Network("connection reset".into()))
            .collect();
        Arc::new(Self {
            failures: Mutex::new(failures),
            ..Self::default()
        })
    }

    fn authorizing() -> Arc<Self> {
        Arc::new(Self {
            check_app_ids: true,
            ..Self::default()
        })
    }

    fn down() -> Arc<Self> {
        Arc::new(Self {
            always_fail: true,
            ..Self::default()
        })
    }

    fn requests(&self) -> Vec<UploadRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn delivered_sequences(&self) -> Vec<u64> {
        let mut sequences: Vec<u64> = self
            .requests()
            .iter()
            .flat_map(|r| r.records.iter().map(|rec| rec.sequence))
            .collect();
        sequences.sort_unstable();
        sequences.dedup();
        sequences
    }
}

#[async_trait]
impl Transport for Endpoint {
    async fn send(&self, request: &UploadRequest) -> Result<UploadResponse, TransportError> {
        self.requests.lock().unwrap().push(request.clone());
        if self.always_fail {
            return Err(TransportError::Status {
                status: 500,
                body: "internal error".into(),
            });
        }
        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        if self.check_app_ids {
            let bearer = request.app_id().unwrap_or_default();
            let foreign = request
                .records
                .iter()
                .map(|r| &r.identity)
                .chain(request.identity.as_ref())
                .any(|identity| identity.app_id != bearer);
            if foreign {
                return Err(TransportError::Status {
                    status: 403,
                    body: format!("records of another app uploaded by app {bearer}"),
                });
            }
        }
        let acked_through = request.records.iter().map(|r| r.sequence).max().unwrap_or(0);
        Ok(UploadResponse { acked_through })
    }
}

fn config() -> EngineConfig {
    EngineConfig {
        device_id: Some("device-1".into()),
        flush_interval_ms: 3_600_000,
        backoff_base_ms: 100,
        backoff_max_ms: 1_000,
        ..EngineConfig::default()
    }
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(600), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "condition not reached");
}

async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(600), future)
        .await
        .expect("timed out")
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test(start_paused = true)]
async fn failure_then_success_retries_once() {
    let endpoint = Endpoint::failing_first(1);
    let engine = Engine::open(config(), endpoint.clone()).unwrap();

    engine.initialize("app-1").unwrap();
    let sku = Attributes::from([("sku".to_string(), "x".to_string())]);
    assert_eq!(engine.log_event("purchase", sku), Ok(1));
    engine.flush();

    eventually(|| engine.dispatch_stats().records_acked == 1).await;

    let stats = engine.dispatch_stats();
    assert_eq!(stats.retries, 1);
    assert_eq!(stats.batches_acked, 1);
    assert_eq!(stats.acked_through, 1);
    assert_eq!(stats.consecutive_failures, 0);
    assert_eq!(engine.buffer_stats().queued + engine.buffer_stats().in_flight, 0);

    let requests = endpoint.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].records, requests[1].records);

    engine.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn reinitialized_app_id_still_delivers_older_records() {
    let endpoint = Endpoint::authorizing();
    let engine = Engine::open(config(), endpoint.clone()).unwrap();

    engine.initialize("app-1").unwrap();
    engine.log_event("a", Attributes::new()).unwrap();
    engine.initialize("app-2").unwrap();
    engine.log_event("b", Attributes::new()).unwrap();
    engine.log_user_info(Attributes::new()).unwrap();
    engine.flush();

    eventually(|| engine.dispatch_stats().records_acked == 3).await;

    let stats = engine.dispatch_stats();
    assert_eq!(stats.retries, 0);
    assert_eq!(stats.dead_lettered, 0);
    assert!(engine.dead_letters().unwrap().is_empty());
    assert_eq!(endpoint.delivered_sequences(), vec![1, 2, 3]);

    // One batch per app ID, each sent under the app its records were logged in
    let requests = endpoint.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].app_id(), Some("app-2"));
    assert_eq!(requests[0].records.len(), 2);
    assert_eq!(requests[1].app_id(), Some("app-1"));
    assert!(requests[1].identity.is_none());

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn log_before_initialize_changes_nothing() {
    let engine = Engine::open(config(), Endpoint::healthy()).unwrap();
    let before = engine.buffer_stats();

    let sku = Attributes::from([("sku".to_string(), "x".to_string())]);
    assert_eq!(engine.log_event("purchase", sku), Err(Error::NotInitialized));
    assert_eq!(engine.log_push(&serde_json::json!({"aps": {}})), Err(Error::NotInitialized));
    assert_eq!(engine.buffer_stats(), before);
}

#[tokio::test(start_paused = true)]
async fn every_logged_record_is_delivered() {
    let endpoint = Endpoint::failing_first(2);
    let engine = Engine::open(
        EngineConfig {
            max_batch_records: 7,
            ..config()
        },
        endpoint.clone(),
    )
    .unwrap();
    engine.initialize("app-1").unwrap();

    for i in 0..40 {
        if i % 9 == 0 {
            engine
                .log_user_info(Attributes::from([("n".to_string(), i.to_string())]))
                .unwrap();
        } else {
            engine.log_event(&format!("e{i}"), Attributes::new()).unwrap();
        }
    }
    engine.flush();

    eventually(|| engine.dispatch_stats().records_acked == 40).await;

    assert_eq!(endpoint.delivered_sequences(), (1..=40).collect::<Vec<_>>());
    assert_eq!(engine.buffer_stats().queued, 0);
    assert_eq!(engine.dispatch_stats().state, DispatchState::Idle);

    engine.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn immediate_record_overtakes_queued_events() {
    let endpoint = Endpoint::healthy();
    let engine = Engine::open(config(), endpoint.clone()).unwrap();
    engine.initialize("app-1").unwrap();

    for i in 0..10 {
        engine.log_event(&format!("e{i}"), Attributes::new()).unwrap();
    }
    let sequence = engine.log_user("ada@example.com", Some("u-1")).unwrap();
    assert_eq!(sequence, 11);

    eventually(|| !endpoint.requests().is_empty()).await;

    let first = &endpoint.requests()[0];
    assert_eq!(first.records[0].sequence, 11);
    assert_eq!(first.records.len(), 11);
    assert_eq!(
        first.identity.as_ref().and_then(|i| i.user_email.as_deref()),
        Some("ada@example.com")
    );

    engine.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn normal_events_wait_for_flush_interval() {
    let endpoint = Endpoint::healthy();
    let engine = Engine::open(
        EngineConfig {
            flush_interval_ms: 30_000,
            ..config()
        },
        endpoint.clone(),
    )
    .unwrap();
    engine.initialize("app-1").unwrap();
    engine.log_event("open", Attributes::new()).unwrap();

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(endpoint.requests().is_empty());

    tokio::time::sleep(Duration::from_secs(25)).await;
    assert_eq!(endpoint.delivered_sequences(), vec![1]);

    engine.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn exhausted_records_are_dead_lettered_and_reported() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::open(
        EngineConfig {
            storage_dir: Some(dir.path().to_path_buf()),
            max_retries: 1,
            ..config()
        },
        Endpoint::down(),
    )
    .unwrap();
    let mut diagnostics = engine.subscribe();

    engine.initialize("app-1").unwrap();
    engine
        .log_user_info(Attributes::from([("plan".to_string(), "pro".to_string())]))
        .unwrap();

    let reported = within(async {
        loop {
            match diagnostics.recv().await {
                Ok(error @ Error::DeadLettered { .. }) => break error,
                Ok(_) => continue,
                Err(e) => panic!("diagnostics closed: {e}"),
            }
        }
    })
    .await;
    assert_eq!(
        reported,
        Error::DeadLettered {
            count: 1,
            first: 1,
            last: 1
        }
    );

    let dead = engine.dead_letters().unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].record.sequence, 1);
    assert_eq!(dead[0].failures, 2);
    assert_eq!(engine.buffer_stats().queued, 0);
    assert!(dir.path().join("dead_letters.jsonl").exists());

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn restart_resumes_pending_records() {
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig {
        storage_dir: Some(dir.path().to_path_buf()),
        device_id: None,
        ..config()
    };

    let device_id = {
        let engine = Engine::open(config.clone(), Endpoint::down()).unwrap();
        engine.initialize("app-1").unwrap();
        for name in ["a", "b", "c"] {
            engine.log_event(name, Attributes::new()).unwrap();
        }
        engine.shutdown().await.unwrap();
        engine.device_id().clone()
    };

    let endpoint = Endpoint::healthy();
    let engine = Engine::open(config, endpoint.clone()).unwrap();
    assert_eq!(engine.device_id(), &device_id);
    assert_eq!(engine.buffer_stats().queued, 3);
    assert_eq!(engine.buffer_stats().next_sequence, 4);

    engine.initialize("app-1").unwrap();
    assert_eq!(engine.log_event("d", Attributes::new()), Ok(4));
    engine.flush();

    eventually(|| engine.dispatch_stats().records_acked == 4).await;
    assert_eq!(endpoint.delivered_sequences(), vec![1, 2, 3, 4]);
    assert!(endpoint
        .requests()
        .iter()
        .all(|r| r.device_id == device_id));

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn concurrent_callers_get_unique_sequences() {
    let engine = Arc::new(Engine::open(config(), Endpoint::healthy()).unwrap());
    engine.initialize("app-1").unwrap();

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let engine = Arc::clone(&engine);
            std::thread::spawn(move || {
                (0..25)
                    .map(|i| {
                        engine
                            .log_event(&format!("t{t}-{i}"), Attributes::new())
                            .unwrap()
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut sequences: Vec<u64> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    sequences.sort_unstable();
    assert_eq!(sequences, (1..=200).collect::<Vec<_>>());

    engine.shutdown().await.unwrap();
}
