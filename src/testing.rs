//! Test support: fault injection, recording collaborators, log setup

use crate::family::{InviteNotification, InviteNotifier, NotifyError};
use crate::store::{
    Document, DocumentStore, Filter, IncrementOutcome, MemoryBlobStore, MemoryDocumentStore, OnceKey,
    Query,
    StoreError,
};
use crate::{KeepsakeConfig, KeepsakeCore};

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StoreOp {
    Get,
    Query,
    Create,
    Put,
    Update,
    UpdateIf,
    Delete,
    Increment,
}

struct FailRule {
    op: StoreOp,
    collection: String,
    id: Option<String>,
    skip: usize,
    times: usize,
}

/// In-memory store that fails selected calls on demand
#[derive(Default)]
pub(crate) struct FlakyStore {
    inner: MemoryDocumentStore,
    rules: Mutex<Vec<FailRule>>,
}

impl FlakyStore {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next `times` calls of `op` against `collection`
    pub(crate) fn fail(&self, op: StoreOp, collection: &str, times: usize) {
        self.fail_after(op, collection, None, 0, times);
    }

    /// Let `skip` matching calls through, then fail the next `times`
    pub(crate) fn fail_after(
        &self,
        op: StoreOp,
        collection: &str,
        id: Option<&str>,
        skip: usize,
        times: usize,
    ) {
        self.rules.lock().push(FailRule {
            op,
            collection: collection.to_string(),
            id: id.map(str::to_owned),
            skip,
            times,
        });
    }

    pub(crate) fn heal(&self) {
        self.rules.lock().clear();
    }

    fn check(&self, op: StoreOp, collection: &str, id: Option<&str>) -> Result<(), StoreError> {
        let mut rules = self.rules.lock();
        for rule in rules.iter_mut() {
            let id_matches = match (&rule.id, id) {
                (None, _) => true,
                (Some(want), Some(got)) => want == got,
                (Some(_), None) => false,
            };
            if rule.op != op || rule.collection != collection || !id_matches || rule.times == 0 {
                continue;
            }
            if rule.skip > 0 {
                rule.skip -= 1;
                continue;
            }
            rule.times -= 1;
            return Err(StoreError::Unavailable(format!(
                "injected {:?} failure on {}",
                op, collection
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for FlakyStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        self.check(StoreOp::Get, collection, Some(id))?;
        self.inner.get(collection, id).await
    }

    async fn query(&self, collection: &str, query: &Query) -> Result<Vec<Document>, StoreError> {
        self.check(StoreOp::Query, collection, None)?;
        self.inner.query(collection, query).await
    }

    async fn create(&self, collection: &str, id: &str, fields: Document) -> Result<(), StoreError> {
        self.check(StoreOp::Create, collection, Some(id))?;
        self.inner.create(collection, id, fields).await
    }

    async fn put(&self, collection: &str, id: &str, fields: Document) -> Result<(), StoreError> {
        self.check(StoreOp::Put, collection, Some(id))?;
        self.inner.put(collection, id, fields).await
    }

    async fn update(&self, collection: &str, id: &str, fields: Document) -> Result<(), StoreError> {
        self.check(StoreOp::Update, collection, Some(id))?;
        self.inner.update(collection, id, fields).await
    }

    async fn update_if(
        &self,
        collection: &str,
        id: &str,
        precondition: &[Filter],
        fields: Document,
    ) -> Result<bool, StoreError> {
        self.check(StoreOp::UpdateIf, collection, Some(id))?;
        self.inner.update_if(collection, id, precondition, fields).await
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool, StoreError> {
        self.check(StoreOp::Delete, collection, Some(id))?;
        self.inner.delete(collection, id).await
    }

    async fn atomic_increment(
        &self,
        collection: &str,
        id: &str,
        deltas: &[(&str, i64)],
        once: Option<OnceKey<'_>>,
    ) -> Result<IncrementOutcome, StoreError> {
        self.check(StoreOp::Increment, collection, Some(id))?;
        self.inner.atomic_increment(collection, id, deltas, once).await
    }
}

/// Notifier that keeps every invitation it was asked to send
#[derive(Default)]
pub(crate) struct RecordingNotifier {
    sent: Mutex<Vec<InviteNotification>>,
    failing: AtomicBool,
}

impl RecordingNotifier {
    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub(crate) fn sent(&self) -> Vec<InviteNotification> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl InviteNotifier for RecordingNotifier {
    async fn send_invite(&self, notification: &InviteNotification) -> Result<(), NotifyError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(NotifyError::Dispatch("mail relay unreachable".into()));
        }
        self.sent.lock().push(notification.clone());
        Ok(())
    }
}

/// Fully wired core over a flaky store, with handles to every collaborator
pub(crate) struct Harness {
    pub core: KeepsakeCore,
    pub store: Arc<FlakyStore>,
    pub blobs: Arc<MemoryBlobStore>,
    pub notifier: Arc<RecordingNotifier>,
}

pub(crate) fn harness() -> Harness {
    harness_with(KeepsakeConfig::default())
}

pub(crate) fn harness_with(config: KeepsakeConfig) -> Harness {
    init_tracing();
    let store = FlakyStore::new();
    let blobs = Arc::new(MemoryBlobStore::new(config.blob_base_url.clone()));
    let notifier = Arc::new(RecordingNotifier::default());
    let core = KeepsakeCore::new(store.clone(), blobs.clone(), notifier.clone(), config)
        .expect("valid test config");
    Harness {
        core,
        store,
        blobs,
        notifier,
    }
}
