//! End-to-end polling tests against the in-process store.
//!
//! Due-times are wall-clock, so these tests run on real timers with
//! generous windows rather than tokio's paused clock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use timecapsule_core::{
    Capsule, CapsuleError, CapsuleStore, MemoryBackend, MemoryStore, Result, Store,
};
use timecapsule_digger::{Digger, DiggerOptions};
use tokio::time::sleep;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

type Deliveries = Arc<Mutex<Vec<String>>>;

fn recording_handler(deliveries: &Deliveries) -> impl Fn(&Digger<String>, &Capsule<String>) {
    let deliveries = Arc::clone(deliveries);
    move |_digger: &Digger<String>, capsule: &Capsule<String>| {
        deliveries.lock().unwrap().push(capsule.payload.clone());
    }
}

#[tokio::test]
async fn buried_payload_is_delivered_exactly_once() {
    init_tracing();

    let backend = MemoryBackend::new();
    let store: Arc<dyn Store<String>> = Arc::new(CapsuleStore::new(backend.clone()));
    let digger = Digger::new(store, Duration::from_millis(250));

    let deliveries: Deliveries = Arc::default();
    digger.set_handler(recording_handler(&deliveries));

    digger
        .bury_for("hello".to_string(), Duration::from_secs(1))
        .await
        .unwrap();
    digger.start();
    sleep(Duration::from_secs(2)).await;
    digger.stop();

    assert_eq!(*deliveries.lock().unwrap(), vec!["hello".to_string()]);
    assert!(backend.is_empty());
}

#[tokio::test]
async fn nothing_is_delivered_before_the_due_time() {
    let backend = MemoryBackend::new();
    let store: Arc<dyn Store<String>> = Arc::new(CapsuleStore::new(backend.clone()));
    let digger = Digger::new(store, Duration::from_millis(20));

    let deliveries: Deliveries = Arc::default();
    digger.set_handler(recording_handler(&deliveries));

    digger
        .bury_for("patience".to_string(), Duration::from_secs(30))
        .await
        .unwrap();
    digger.start();
    sleep(Duration::from_millis(300)).await;
    digger.stop();

    assert!(deliveries.lock().unwrap().is_empty());
    assert_eq!(backend.len(), 1);
}

#[tokio::test]
async fn concurrent_diggers_deliver_each_payload_once() {
    init_tracing();

    let backend = MemoryBackend::new();
    let counts: Arc<Mutex<HashMap<String, u32>>> = Arc::default();

    let mut diggers = Vec::new();
    for _ in 0..4 {
        let store: Arc<dyn Store<String>> = Arc::new(CapsuleStore::new(backend.clone()));
        let digger = Digger::new(store, Duration::from_millis(10));
        let counts = Arc::clone(&counts);
        digger.set_handler(move |_: &Digger<String>, capsule: &Capsule<String>| {
            *counts
                .lock()
                .unwrap()
                .entry(capsule.payload.clone())
                .or_default() += 1;
        });
        digger.start();
        diggers.push(digger);
    }

    let producer: MemoryStore<String> = CapsuleStore::new(backend.clone());
    for i in 0..20 {
        producer
            .bury_for(format!("payload-{i}"), Duration::from_millis(5))
            .await
            .unwrap();
    }

    sleep(Duration::from_secs(1)).await;
    for digger in &diggers {
        digger.stop();
    }

    let counts = counts.lock().unwrap();
    assert_eq!(counts.len(), 20, "every payload delivered: {counts:?}");
    for (payload, count) in counts.iter() {
        assert_eq!(*count, 1, "{payload} delivered more than once");
    }
    assert!(backend.is_empty());
}

#[tokio::test]
async fn stop_is_idempotent_and_halts_delivery() {
    let backend = MemoryBackend::new();
    let store: Arc<dyn Store<String>> = Arc::new(CapsuleStore::new(backend.clone()));
    let digger = Digger::new(store, Duration::from_millis(20));

    let deliveries: Deliveries = Arc::default();
    digger.set_handler(recording_handler(&deliveries));

    digger
        .bury_until("first".to_string(), timecapsule_core::now_millis())
        .await
        .unwrap();
    digger.start();
    sleep(Duration::from_millis(300)).await;

    digger.stop();
    digger.stop();
    sleep(Duration::from_millis(100)).await;
    assert!(!digger.is_running());

    let delivered_before = deliveries.lock().unwrap().len();
    assert_eq!(delivered_before, 1);

    // New due work must not be picked up after stop.
    digger
        .bury_until("second".to_string(), timecapsule_core::now_millis())
        .await
        .unwrap();
    sleep(Duration::from_millis(200)).await;
    assert_eq!(deliveries.lock().unwrap().len(), delivered_before);
}

/// Delegates to a real in-process store but fails the first N digs.
struct FlakyDigStore {
    inner: MemoryStore<String>,
    dig_failures_left: AtomicU32,
}

#[async_trait]
impl Store<String> for FlakyDigStore {
    fn kind(&self) -> &'static str {
        "flaky"
    }

    async fn bury_for(&self, payload: String, delay: Duration) -> Result<()> {
        self.inner.bury_for(payload, delay).await
    }

    async fn bury_until(&self, payload: String, due_at_ms: i64) -> Result<()> {
        self.inner.bury_until(payload, due_at_ms).await
    }

    async fn dig(&self) -> Result<Option<Capsule<String>>> {
        if self
            .dig_failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(CapsuleError::Transport("injected dig failure".into()));
        }
        self.inner.dig().await
    }

    async fn destroy(&self, capsule: &Capsule<String>) -> Result<()> {
        self.inner.destroy(capsule).await
    }

    async fn destroy_all(&self) -> Result<()> {
        self.inner.destroy_all().await
    }
}

#[tokio::test]
async fn polling_survives_transport_errors() {
    init_tracing();

    let backend = MemoryBackend::new();
    let store: Arc<dyn Store<String>> = Arc::new(FlakyDigStore {
        inner: CapsuleStore::new(backend.clone()),
        dig_failures_left: AtomicU32::new(3),
    });
    let digger = Digger::new(store, Duration::from_millis(10));

    let deliveries: Deliveries = Arc::default();
    digger.set_handler(recording_handler(&deliveries));

    digger
        .bury_until("resilient".to_string(), timecapsule_core::now_millis())
        .await
        .unwrap();
    digger.start();
    sleep(Duration::from_millis(500)).await;
    digger.stop();

    assert_eq!(*deliveries.lock().unwrap(), vec!["resilient".to_string()]);
}

/// Delegates to a real in-process store but refuses every destroy.
struct StickyStore {
    inner: MemoryStore<String>,
}

#[async_trait]
impl Store<String> for StickyStore {
    fn kind(&self) -> &'static str {
        "sticky"
    }

    async fn bury_for(&self, payload: String, delay: Duration) -> Result<()> {
        self.inner.bury_for(payload, delay).await
    }

    async fn bury_until(&self, payload: String, due_at_ms: i64) -> Result<()> {
        self.inner.bury_until(payload, due_at_ms).await
    }

    async fn dig(&self) -> Result<Option<Capsule<String>>> {
        self.inner.dig().await
    }

    async fn destroy(&self, _capsule: &Capsule<String>) -> Result<()> {
        Err(CapsuleError::Transport("injected destroy failure".into()))
    }

    async fn destroy_all(&self) -> Result<()> {
        self.inner.destroy_all().await
    }
}

#[tokio::test]
async fn destroy_failures_are_not_fatal_to_the_loop() {
    init_tracing();

    let backend = MemoryBackend::new();
    let store: Arc<dyn Store<String>> = Arc::new(StickyStore {
        inner: CapsuleStore::new(backend.clone()),
    });
    let digger = Digger::with_options(
        store,
        Duration::from_millis(20),
        DiggerOptions {
            retry_limit: 2,
            retry_interval: Duration::from_millis(1),
            op_timeout: Duration::from_secs(1),
        },
    );

    let deliveries: Deliveries = Arc::default();
    digger.set_handler(recording_handler(&deliveries));

    digger
        .bury_until("first".to_string(), timecapsule_core::now_millis())
        .await
        .unwrap();
    digger.start();
    sleep(Duration::from_millis(300)).await;
    assert_eq!(*deliveries.lock().unwrap(), vec!["first".to_string()]);

    // Exhausted destroy retries are logged, not propagated — later work
    // still gets picked up.
    digger
        .bury_until("second".to_string(), timecapsule_core::now_millis())
        .await
        .unwrap();
    sleep(Duration::from_millis(300)).await;
    digger.stop();

    assert_eq!(
        *deliveries.lock().unwrap(),
        vec!["first".to_string(), "second".to_string()]
    );
}

#[tokio::test]
async fn handler_is_set_exactly_once() {
    let backend = MemoryBackend::new();
    let store: Arc<dyn Store<String>> = Arc::new(CapsuleStore::new(backend.clone()));
    let digger = Digger::new(store, Duration::from_millis(20));

    let first: Deliveries = Arc::default();
    let second: Deliveries = Arc::default();
    digger.set_handler(recording_handler(&first));
    digger.set_handler(recording_handler(&second));

    digger
        .bury_until("winner".to_string(), timecapsule_core::now_millis())
        .await
        .unwrap();
    digger.start();
    sleep(Duration::from_millis(300)).await;
    digger.stop();

    assert_eq!(*first.lock().unwrap(), vec!["winner".to_string()]);
    assert!(second.lock().unwrap().is_empty());
}
