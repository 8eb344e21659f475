//! In-memory implementations of the external collaborators.
//!
//! [`MemoryBackend`] plays the shared remote document store. Each device
//! talks to it through its own [`MemoryRemote`] client, which has an
//! independent network toggle and failure injection, so multi-device
//! scenarios can run inside one process.

use crate::error::{LocalStoreError, RemoteError};
use crate::store::{
    AuthSession, ChangeKind, ChangeStream, DocumentChange, LocalStore, Query, RemoteStore,
};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::channel::mpsc;
use futures::StreamExt;
use serde_json::Value;
use squad_engine::{EntityType, Group, Record, RecordId, UserId};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Local store
// ============================================================================

/// A local store backed by a concurrent map.
#[derive(Debug, Default)]
pub struct MemoryLocalStore {
    records: DashMap<(EntityType, RecordId), Record>,
}

impl MemoryLocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of stored records across all kinds.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl LocalStore for MemoryLocalStore {
    async fn get(&self, entity: EntityType, id: &str) -> Result<Option<Record>, LocalStoreError> {
        Ok(self
            .records
            .get(&(entity, id.to_string()))
            .map(|r| r.value().clone()))
    }

    async fn get_all(&self, entity: EntityType) -> Result<Vec<Record>, LocalStoreError> {
        let mut records: Vec<Record> = self
            .records
            .iter()
            .filter(|entry| entry.key().0 == entity)
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_by(|a, b| a.id().cmp(b.id()));
        Ok(records)
    }

    async fn save(&self, record: Record) -> Result<(), LocalStoreError> {
        record.validate()?;
        self.records
            .insert((record.entity_type(), record.id().clone()), record);
        Ok(())
    }

    async fn delete(&self, entity: EntityType, id: &str) -> Result<bool, LocalStoreError> {
        Ok(self.records.remove(&(entity, id.to_string())).is_some())
    }

    async fn group_by_invite_code(&self, code: &str) -> Result<Option<Group>, LocalStoreError> {
        Ok(self.records.iter().find_map(|entry| match entry.value() {
            Record::Group(group) if group.invite_code == code => Some(group.clone()),
            _ => None,
        }))
    }

    async fn scoped_to_group(
        &self,
        entity: EntityType,
        group_id: &str,
    ) -> Result<Vec<Record>, LocalStoreError> {
        if !entity.is_group_scoped() {
            return Ok(Vec::new());
        }
        let mut records: Vec<Record> = self
            .records
            .iter()
            .filter(|entry| {
                entry.key().0 == entity
                    && entry.value().group_scope().map(String::as_str) == Some(group_id)
            })
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_by(|a, b| a.id().cmp(b.id()));
        Ok(records)
    }
}

// ============================================================================
// Remote backend
// ============================================================================

type ChangeSender = mpsc::UnboundedSender<Result<Vec<DocumentChange>, RemoteError>>;

struct Subscriber {
    client: u64,
    query: Query,
    sender: ChangeSender,
}

#[derive(Default)]
struct BackendState {
    collections: HashMap<String, BTreeMap<String, Value>>,
    subscribers: Vec<Subscriber>,
}

#[derive(Default)]
struct BackendInner {
    state: Mutex<BackendState>,
    /// Clients currently online; offline clients miss deliveries.
    online: DashMap<u64, bool>,
    next_client: AtomicU64,
}

/// The shared remote document store.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<BackendInner>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect a new device client. Clients start online.
    pub fn client(&self) -> Arc<MemoryRemote> {
        let id = self.inner.next_client.fetch_add(1, Ordering::SeqCst);
        self.inner.online.insert(id, true);
        Arc::new(MemoryRemote {
            backend: self.inner.clone(),
            client: id,
            failures: Mutex::new(VecDeque::new()),
            persistent_failure: Mutex::new(None),
            fail_ordered: AtomicBool::new(false),
            writes: AtomicUsize::new(0),
            cache_clears: AtomicUsize::new(0),
        })
    }

    /// Read a document directly, bypassing any client.
    pub fn document(&self, collection: &str, id: &str) -> Option<Value> {
        lock(&self.inner.state)
            .collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned()
    }

    /// All documents of a collection, ordered by id.
    pub fn documents(&self, collection: &str) -> Vec<Value> {
        lock(&self.inner.state)
            .collections
            .get(collection)
            .map(|docs| docs.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Live subscriptions across all clients.
    pub fn subscription_count(&self) -> usize {
        let mut state = lock(&self.inner.state);
        state.subscribers.retain(|s| !s.sender.is_closed());
        state.subscribers.len()
    }

    /// Write a document as if another client did it.
    pub fn seed(&self, collection: &str, id: &str, data: Value) {
        self.inner.put(collection, id, Some(data), false);
    }
}

impl BackendInner {
    /// Store (or delete, with `None`) a document and fan out the change.
    ///
    /// Limited subscriptions see window changes: a document pushed out of
    /// the window is reported as removed even though it still exists.
    fn put(&self, collection: &str, id: &str, data: Option<Value>, merge: bool) {
        let mut state = lock(&self.state);
        state.subscribers.retain(|s| !s.sender.is_closed());
        let windows_before: Vec<Option<BTreeMap<String, Value>>> = {
            let snapshot: &BackendState = &state;
            snapshot
                .subscribers
                .iter()
                .map(|s| {
                    (s.query.collection == collection && s.query.limit.is_some())
                        .then(|| snapshot.window(&s.query))
                })
                .collect()
        };

        let docs = state.collections.entry(collection.to_string()).or_default();
        let before = docs.get(id).cloned();

        let after = match (data, &before) {
            (None, _) => None,
            (Some(Value::Object(patch)), Some(Value::Object(existing))) if merge => {
                let mut merged = existing.clone();
                merged.extend(patch);
                Some(Value::Object(merged))
            }
            (Some(value), _) => Some(value),
        };

        match &after {
            Some(value) => {
                docs.insert(id.to_string(), value.clone());
            }
            None => {
                docs.remove(id);
            }
        }

        let state: &BackendState = &state;
        for (subscriber, window_before) in state.subscribers.iter().zip(windows_before) {
            if subscriber.query.collection != collection {
                continue;
            }
            if !self.online.get(&subscriber.client).is_some_and(|on| *on) {
                continue;
            }
            let changes = match window_before {
                Some(previous) => window_changes(id, &previous, &state.window(&subscriber.query)),
                None => document_change(&subscriber.query, id, before.as_ref(), after.as_ref())
                    .into_iter()
                    .collect(),
            };
            if !changes.is_empty() {
                let _ = subscriber.sender.unbounded_send(Ok(changes));
            }
        }
    }

    fn query(&self, query: &Query) -> Vec<Value> {
        lock(&self.state).query(query)
    }
}

impl BackendState {
    fn query(&self, query: &Query) -> Vec<Value> {
        let docs = self
            .collections
            .get(&query.collection)
            .map(|docs| docs.values().filter(|d| query.matches(d)).cloned().collect())
            .unwrap_or_default();
        query.arrange(docs)
    }

    /// The documents a limited query currently returns, keyed by id.
    fn window(&self, query: &Query) -> BTreeMap<String, Value> {
        let Some(docs) = self.collections.get(&query.collection) else {
            return BTreeMap::new();
        };
        let mut matching: Vec<(&String, &Value)> =
            docs.iter().filter(|(_, d)| query.matches(d)).collect();
        matching.sort_by(|a, b| query.compare(a.1, b.1));
        matching.truncate(query.limit.unwrap_or(usize::MAX));
        matching
            .into_iter()
            .map(|(id, doc)| (id.clone(), doc.clone()))
            .collect()
    }
}

/// Change seen by an unlimited subscription when document `id` goes from
/// `before` to `after`.
fn document_change(
    query: &Query,
    id: &str,
    before: Option<&Value>,
    after: Option<&Value>,
) -> Option<DocumentChange> {
    let was = before.is_some_and(|d| query.matches(d));
    match after {
        Some(doc) if query.matches(doc) => Some(DocumentChange {
            kind: if was { ChangeKind::Modified } else { ChangeKind::Added },
            id: id.to_string(),
            data: doc.clone(),
        }),
        _ if was => Some(DocumentChange {
            kind: ChangeKind::Removed,
            id: id.to_string(),
            data: before.cloned().unwrap_or(Value::Null),
        }),
        _ => None,
    }
}

/// Changes seen by a limited subscription whose window moved from
/// `previous` to `current` after a write to `id`.
fn window_changes(
    id: &str,
    previous: &BTreeMap<String, Value>,
    current: &BTreeMap<String, Value>,
) -> Vec<DocumentChange> {
    let mut changes: Vec<DocumentChange> = previous
        .iter()
        .filter(|(key, _)| !current.contains_key(*key))
        .map(|(key, doc)| DocumentChange {
            kind: ChangeKind::Removed,
            id: key.clone(),
            data: doc.clone(),
        })
        .collect();
    for (key, doc) in current {
        let kind = match previous.get(key) {
            None => ChangeKind::Added,
            Some(old) if key == id && old != doc => ChangeKind::Modified,
            Some(_) => continue,
        };
        changes.push(DocumentChange {
            kind,
            id: key.clone(),
            data: doc.clone(),
        });
    }
    changes
}

/// One device's client handle to a [`MemoryBackend`].
pub struct MemoryRemote {
    backend: Arc<BackendInner>,
    client: u64,
    failures: Mutex<VecDeque<RemoteError>>,
    persistent_failure: Mutex<Option<RemoteError>>,
    fail_ordered: AtomicBool,
    writes: AtomicUsize,
    cache_clears: AtomicUsize,
}

impl MemoryRemote {
    /// Fail the next `count` remote calls with `error`.
    pub fn fail_next(&self, count: usize, error: RemoteError) {
        let mut failures = lock(&self.failures);
        failures.extend(std::iter::repeat(error).take(count));
    }

    /// Fail every remote call until cleared with `None`.
    pub fn fail_always(&self, error: Option<RemoteError>) {
        *lock(&self.persistent_failure) = error;
    }

    /// Reject subscriptions that request server-side ordering.
    pub fn fail_ordered_subscriptions(&self, fail: bool) {
        self.fail_ordered.store(fail, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.backend
            .online
            .get(&self.client)
            .is_some_and(|on| *on)
    }

    /// Successful document writes made through this client.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn cache_clear_count(&self) -> usize {
        self.cache_clears.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), RemoteError> {
        if !self.is_online() {
            return Err(RemoteError::Unavailable("client is offline".into()));
        }
        if let Some(error) = lock(&self.persistent_failure).clone() {
            return Err(error);
        }
        if let Some(error) = lock(&self.failures).pop_front() {
            return Err(error);
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn write(
        &self,
        collection: &str,
        id: &str,
        data: Value,
        merge: bool,
    ) -> Result<(), RemoteError> {
        self.check()?;
        if !data.is_object() {
            return Err(RemoteError::InvalidData(format!(
                "{collection}/{id} is not an object"
            )));
        }
        self.backend.put(collection, id, Some(data), merge);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn read(&self, collection: &str, id: &str) -> Result<Option<Value>, RemoteError> {
        self.check()?;
        Ok(lock(&self.backend.state)
            .collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned())
    }

    async fn query_where(&self, query: &Query) -> Result<Vec<Value>, RemoteError> {
        self.check()?;
        Ok(self.backend.query(query))
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), RemoteError> {
        self.check()?;
        self.backend.put(collection, id, None, false);
        Ok(())
    }

    async fn subscribe(&self, query: &Query) -> Result<ChangeStream, RemoteError> {
        if query.is_ordered() && self.fail_ordered.load(Ordering::SeqCst) {
            return Err(RemoteError::FailedPrecondition(format!(
                "ordered query on {} requires an index",
                query.collection
            )));
        }

        let (sender, receiver) = mpsc::unbounded();
        // Snapshot and registration happen under one lock so no write slips between them.
        let mut state = lock(&self.backend.state);
        let initial: Vec<DocumentChange> = state
            .query(query)
            .into_iter()
            .map(|doc| DocumentChange {
                kind: ChangeKind::Added,
                id: doc
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                data: doc,
            })
            .collect();
        if !initial.is_empty() && self.is_online() {
            let _ = sender.unbounded_send(Ok(initial));
        }

        state.subscribers.push(Subscriber {
            client: self.client,
            query: query.clone(),
            sender,
        });
        Ok(receiver.boxed())
    }

    async fn set_network_enabled(&self, enabled: bool) -> Result<(), RemoteError> {
        self.backend.online.insert(self.client, enabled);
        Ok(())
    }

    async fn clear_cache(&self) -> Result<(), RemoteError> {
        self.cache_clears.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// Auth session
// ============================================================================

/// A session whose user is set explicitly.
#[derive(Debug)]
pub struct StaticSession {
    user: watch::Sender<Option<UserId>>,
}

impl StaticSession {
    pub fn new(user: Option<UserId>) -> Arc<Self> {
        let (user, _) = watch::channel(user);
        Arc::new(Self { user })
    }

    pub fn signed_in(user_id: impl Into<UserId>) -> Arc<Self> {
        Self::new(Some(user_id.into()))
    }

    pub fn sign_in(&self, user_id: impl Into<UserId>) {
        self.user.send_replace(Some(user_id.into()));
    }

    pub fn sign_out(&self) {
        self.user.send_replace(None);
    }
}

impl AuthSession for StaticSession {
    fn current_user_id(&self) -> Option<UserId> {
        self.user.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<Option<UserId>> {
        self.user.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use squad_engine::Player;

    fn player(id: &str, group_id: &str) -> Record {
        Record::Player(Player {
            id: id.into(),
            group_id: group_id.into(),
            name: "Ada".into(),
            nickname: None,
            active: true,
            last_modified: 1,
        })
    }

    #[tokio::test]
    async fn local_store_scoping() {
        let store = MemoryLocalStore::new();
        store.save(player("p-2", "g-1")).await.unwrap();
        store.save(player("p-1", "g-1")).await.unwrap();
        store.save(player("p-3", "g-2")).await.unwrap();

        let scoped = store.scoped_to_group(EntityType::Player, "g-1").await.unwrap();
        let ids: Vec<_> = scoped.iter().map(|r| r.id().as_str()).collect();
        assert_eq!(ids, vec!["p-1", "p-2"]);

        assert!(store.delete(EntityType::Player, "p-1").await.unwrap());
        assert!(!store.delete(EntityType::Player, "p-1").await.unwrap());
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn local_store_rejects_invalid_records() {
        let store = MemoryLocalStore::new();
        let err = store.save(player("", "g-1")).await.unwrap_err();
        assert!(matches!(err, LocalStoreError::Invalid(_)));
    }

    #[tokio::test]
    async fn subscriptions_receive_initial_snapshot_and_changes() {
        let backend = MemoryBackend::new();
        backend.seed("players", "p-1", json!({"id": "p-1", "groupId": "g-1"}));
        let remote = backend.client();

        let query = Query::collection("players").where_eq("groupId", "g-1");
        let mut stream = remote.subscribe(&query).await.unwrap();

        let initial = stream.next().await.unwrap().unwrap();
        assert_eq!(initial.len(), 1);
        assert_eq!(initial[0].kind, ChangeKind::Added);

        remote
            .write("players", "p-1", json!({"name": "Ada"}), true)
            .await
            .unwrap();
        let modified = stream.next().await.unwrap().unwrap();
        assert_eq!(modified[0].kind, ChangeKind::Modified);
        assert_eq!(modified[0].data["groupId"], "g-1");
        assert_eq!(modified[0].data["name"], "Ada");

        remote
            .write("players", "p-1", json!({"id": "p-1", "groupId": "g-2"}), false)
            .await
            .unwrap();
        let removed = stream.next().await.unwrap().unwrap();
        assert_eq!(removed[0].kind, ChangeKind::Removed);
    }

    #[tokio::test]
    async fn limited_subscriptions_report_window_changes() {
        let backend = MemoryBackend::new();
        backend.seed("matches", "m-1", json!({"id": "m-1", "playedAt": 1}));
        backend.seed("matches", "m-2", json!({"id": "m-2", "playedAt": 2}));
        let remote = backend.client();

        let query = Query::collection("matches")
            .order_by("playedAt", crate::store::Direction::Descending)
            .limit(2);
        let mut stream = remote.subscribe(&query).await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap().len(), 2);

        remote
            .write("matches", "m-3", json!({"id": "m-3", "playedAt": 3}), false)
            .await
            .unwrap();
        let mut changes = stream.next().await.unwrap().unwrap();
        changes.sort_by(|a, b| a.id.cmp(&b.id));
        let summary: Vec<_> = changes.iter().map(|c| (c.id.as_str(), c.kind)).collect();
        assert_eq!(summary, vec![("m-1", ChangeKind::Removed), ("m-3", ChangeKind::Added)]);
        assert!(backend.document("matches", "m-1").is_some());

        // Deleting inside the window pulls the older match back in.
        remote.delete("matches", "m-3").await.unwrap();
        let mut changes = stream.next().await.unwrap().unwrap();
        changes.sort_by(|a, b| a.id.cmp(&b.id));
        let summary: Vec<_> = changes.iter().map(|c| (c.id.as_str(), c.kind)).collect();
        assert_eq!(summary, vec![("m-1", ChangeKind::Added), ("m-3", ChangeKind::Removed)]);
    }

    #[tokio::test]
    async fn offline_clients_fail_and_miss_deliveries() {
        let backend = MemoryBackend::new();
        let a = backend.client();
        let b = backend.client();
        let mut stream = b.subscribe(&Query::collection("groups")).await.unwrap();

        b.set_network_enabled(false).await.unwrap();
        assert!(matches!(
            b.read("groups", "g-1").await,
            Err(RemoteError::Unavailable(_))
        ));

        a.write("groups", "g-1", json!({"id": "g-1"}), false)
            .await
            .unwrap();
        b.set_network_enabled(true).await.unwrap();
        a.write("groups", "g-2", json!({"id": "g-2"}), false)
            .await
            .unwrap();

        let delivered = stream.next().await.unwrap().unwrap();
        assert_eq!(delivered[0].id, "g-2");
    }

    #[tokio::test]
    async fn failure_injection() {
        let backend = MemoryBackend::new();
        let remote = backend.client();
        remote.fail_next(2, RemoteError::Timeout);

        assert_eq!(
            remote.delete("players", "p-1").await,
            Err(RemoteError::Timeout)
        );
        assert_eq!(
            remote.delete("players", "p-1").await,
            Err(RemoteError::Timeout)
        );
        assert!(remote.delete("players", "p-1").await.is_ok());

        remote.fail_ordered_subscriptions(true);
        let ordered = Query::collection("players").order_by("name", crate::store::Direction::Ascending);
        assert!(matches!(
            remote.subscribe(&ordered).await,
            Err(RemoteError::FailedPrecondition(_))
        ));
        assert!(remote.subscribe(&ordered.unordered()).await.is_ok());
    }

    #[tokio::test]
    async fn dropped_streams_unsubscribe() {
        let backend = MemoryBackend::new();
        let remote = backend.client();
        let stream = remote.subscribe(&Query::collection("users")).await.unwrap();
        assert_eq!(backend.subscription_count(), 1);
        drop(stream);
        assert_eq!(backend.subscription_count(), 0);
    }

    #[test]
    fn static_session_broadcasts_changes() {
        let session = StaticSession::signed_in("u-1");
        let mut rx = session.subscribe();
        assert_eq!(session.current_user_id().as_deref(), Some("u-1"));

        session.sign_out();
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), None);
    }
}
