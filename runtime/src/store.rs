//! External collaborators the runtime consumes.
//!
//! The local store, remote document store and auth session are owned by the
//! host application. The runtime only sees them through these traits; the
//! [`crate::memory`] module provides in-memory implementations.

use crate::error::{LocalStoreError, RemoteError};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;
use squad_engine::{EntityType, Group, Record, UserId};
use std::cmp::Ordering;
use tokio::sync::watch;

/// Durable local persistence keyed by entity id.
#[async_trait]
pub trait LocalStore: Send + Sync {
    async fn get(&self, entity: EntityType, id: &str) -> Result<Option<Record>, LocalStoreError>;

    async fn get_all(&self, entity: EntityType) -> Result<Vec<Record>, LocalStoreError>;

    async fn save(&self, record: Record) -> Result<(), LocalStoreError>;

    /// Returns whether a record was removed.
    async fn delete(&self, entity: EntityType, id: &str) -> Result<bool, LocalStoreError>;

    /// The group using a (normalized) invite code.
    async fn group_by_invite_code(&self, code: &str) -> Result<Option<Group>, LocalStoreError>;

    /// Players or matches belonging to a group.
    async fn scoped_to_group(
        &self,
        entity: EntityType,
        group_id: &str,
    ) -> Result<Vec<Record>, LocalStoreError>;
}

/// A query predicate on one document field.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String, Value),
    ArrayContains(String, Value),
    In(String, Vec<Value>),
    /// Numeric greater-or-equal
    Gte(String, Value),
}

impl Filter {
    /// Whether a document satisfies the predicate.
    pub fn matches(&self, doc: &Value) -> bool {
        match self {
            Filter::Eq(field, value) => doc.get(field) == Some(value),
            Filter::ArrayContains(field, value) => doc
                .get(field)
                .and_then(Value::as_array)
                .is_some_and(|items| items.contains(value)),
            Filter::In(field, values) => doc.get(field).is_some_and(|v| values.contains(v)),
            Filter::Gte(field, value) => match (doc.get(field).and_then(Value::as_f64), value.as_f64()) {
                (Some(actual), Some(min)) => actual >= min,
                _ => false,
            },
        }
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

/// A collection query, used both for one-shot reads and subscriptions.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub collection: String,
    pub filters: Vec<Filter>,
    pub order_by: Option<(String, Direction)>,
    pub limit: Option<usize>,
}

impl Query {
    /// Every document of a collection.
    pub fn collection(name: impl Into<String>) -> Self {
        Self {
            collection: name.into(),
            filters: Vec::new(),
            order_by: None,
            limit: None,
        }
    }

    pub fn where_eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Eq(field.to_string(), value.into()));
        self
    }

    pub fn array_contains(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.filters
            .push(Filter::ArrayContains(field.to_string(), value.into()));
        self
    }

    pub fn where_in(mut self, field: &str, values: Vec<Value>) -> Self {
        self.filters.push(Filter::In(field.to_string(), values));
        self
    }

    pub fn where_gte(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Gte(field.to_string(), value.into()));
        self
    }

    pub fn order_by(mut self, field: &str, direction: Direction) -> Self {
        self.order_by = Some((field.to_string(), direction));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether the query asks the server for an ordering.
    pub fn is_ordered(&self) -> bool {
        self.order_by.is_some()
    }

    /// The same filters without server-side ordering or limit.
    pub fn unordered(&self) -> Self {
        Self {
            collection: self.collection.clone(),
            filters: self.filters.clone(),
            order_by: None,
            limit: None,
        }
    }

    /// Whether a document passes every filter.
    pub fn matches(&self, doc: &Value) -> bool {
        self.filters.iter().all(|f| f.matches(doc))
    }

    /// Relative order of two documents under this query's ordering.
    pub fn compare(&self, a: &Value, b: &Value) -> Ordering {
        let Some((field, direction)) = &self.order_by else {
            return Ordering::Equal;
        };
        let ordering = compare_fields(a.get(field), b.get(field));
        match direction {
            Direction::Ascending => ordering,
            Direction::Descending => ordering.reverse(),
        }
    }

    /// Apply ordering and limit to a set of matching documents.
    pub fn arrange(&self, mut docs: Vec<Value>) -> Vec<Value> {
        if self.order_by.is_some() {
            docs.sort_by(|a, b| self.compare(a, b));
        }
        if let Some(limit) = self.limit {
            docs.truncate(limit);
        }
        docs
    }
}

fn compare_fields(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        _ => Ordering::Equal,
    }
}

/// How a document changed relative to a subscription's result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

/// One change delivered by a subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChange {
    pub kind: ChangeKind,
    pub id: String,
    pub data: Value,
}

/// A live subscription. Dropping the stream unsubscribes.
pub type ChangeStream = BoxStream<'static, Result<Vec<DocumentChange>, RemoteError>>;

/// Remote document persistence with query and change-subscription support.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Write a document. With `merge`, fields are merged into an existing one.
    async fn write(&self, collection: &str, id: &str, data: Value, merge: bool)
        -> Result<(), RemoteError>;

    async fn read(&self, collection: &str, id: &str) -> Result<Option<Value>, RemoteError>;

    async fn query_where(&self, query: &Query) -> Result<Vec<Value>, RemoteError>;

    /// Deleting a missing document succeeds.
    async fn delete(&self, collection: &str, id: &str) -> Result<(), RemoteError>;

    /// Subscribe to a query. The first batch is the current result set.
    ///
    /// Setup failures (such as a missing index for an ordered query) are
    /// returned here; later failures arrive as `Err` items on the stream.
    async fn subscribe(&self, query: &Query) -> Result<ChangeStream, RemoteError>;

    /// Toggle the client's network access.
    async fn set_network_enabled(&self, enabled: bool) -> Result<(), RemoteError>;

    /// Drop locally cached protocol state (pending-write bookkeeping, caches).
    async fn clear_cache(&self) -> Result<(), RemoteError>;
}

/// Authentication session.
pub trait AuthSession: Send + Sync {
    fn current_user_id(&self) -> Option<UserId>;

    /// Sign-in and sign-out events as a watch channel of the current user.
    fn subscribe(&self) -> watch::Receiver<Option<UserId>>;
}
