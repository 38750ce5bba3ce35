//! Copy-on-write mirror of server collections.
//!
//! [`Collections`] is an immutable snapshot: every mutation returns a new
//! value sharing all untouched collections and documents with the previous
//! one. Holders of an older snapshot keep seeing exactly what they captured.
//!
//! # Structure
//!
//! ```text
//! Collections ── Arc<map> ──┬── "todos" ── Arc<map> ──┬── "1" ── Arc<Value>
//!                           │                         └── "2" ── Arc<Value>
//!                           └── "lists" ── Arc<map> ──── ...
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde_json::{Map, Value};

// ============================================================================
// Types
// ============================================================================

/// A transformed document.
pub type Document = Arc<Value>;

/// Documents of one collection keyed by id.
pub type Collection = Arc<FxHashMap<String, Document>>;

/// Pure function turning raw fields (including `_id`) into a document.
pub type Transform = Arc<dyn Fn(Value) -> Value + Send + Sync>;

// ============================================================================
// Transforms
// ============================================================================

/// Per-collection document transforms.
///
/// Collections without a transform (and no fallback) are not mirrored.
#[derive(Clone, Default)]
pub struct Transforms {
    by_collection: FxHashMap<String, Transform>,
    fallback: Option<Transform>,
}

impl Transforms {
    /// Creates an empty registry: nothing is mirrored.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mirrors `collection` with documents stored as received.
    pub fn insert_identity(&mut self, collection: impl Into<String>) {
        self.insert(collection, Arc::new(|doc| doc));
    }

    /// Mirrors `collection` through `transform`.
    pub fn insert(&mut self, collection: impl Into<String>, transform: Transform) {
        self.by_collection.insert(collection.into(), transform);
    }

    /// Mirrors every collection without an explicit transform as received.
    pub fn mirror_all(&mut self) {
        self.fallback = Some(Arc::new(|doc| doc));
    }

    /// Returns the transform for `collection`, if it is mirrored.
    #[must_use]
    pub fn get(&self, collection: &str) -> Option<&Transform> {
        self.by_collection.get(collection).or(self.fallback.as_ref())
    }
}

impl fmt::Debug for Transforms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.by_collection.keys().collect();
        names.sort();
        f.debug_struct("Transforms")
            .field("collections", &names)
            .field("mirror_all", &self.fallback.is_some())
            .finish()
    }
}

// ============================================================================
// Collections
// ============================================================================

/// Point-in-time snapshot of every mirrored collection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Collections {
    inner: Arc<FxHashMap<String, Collection>>,
}

// ============================================================================
// Collections - Read API
// ============================================================================

impl Collections {
    /// Creates an empty snapshot.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the documents of `collection`.
    #[inline]
    #[must_use]
    pub fn get(&self, collection: &str) -> Option<&FxHashMap<String, Document>> {
        self.inner.get(collection).map(|c| c.as_ref())
    }

    /// Returns a single document.
    #[inline]
    #[must_use]
    pub fn document(&self, collection: &str, id: &str) -> Option<&Document> {
        self.inner.get(collection).and_then(|c| c.get(id))
    }

    /// Iterates collection names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.inner.keys().map(String::as_str)
    }

    /// Returns the number of collections.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if no collection is mirrored.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Returns `true` if both snapshots are the same allocation.
    #[inline]
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

// ============================================================================
// Collections - Mutations
// ============================================================================

impl Collections {
    /// Applies an `added` frame.
    #[must_use]
    pub(crate) fn added(
        &self,
        transform: &Transform,
        collection: &str,
        id: &str,
        fields: Map<String, Value>,
    ) -> Self {
        let mut raw = Map::with_capacity(fields.len() + 1);
        raw.insert("_id".to_string(), Value::from(id));
        raw.extend(fields);
        self.with_document(collection, id, Arc::new(transform(Value::Object(raw))))
    }

    /// Applies a `changed` frame.
    ///
    /// A missing document is treated as an implicit add of the given fields.
    #[must_use]
    pub(crate) fn changed(
        &self,
        transform: &Transform,
        collection: &str,
        id: &str,
        fields: Map<String, Value>,
        cleared: &[String],
    ) -> Self {
        let mut raw = Map::new();
        raw.insert("_id".to_string(), Value::from(id));
        if let Some(existing) = self.document(collection, id)
            && let Value::Object(previous) = existing.as_ref()
        {
            raw.extend(previous.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        raw.extend(fields);
        for key in cleared {
            raw.remove(key);
        }
        self.with_document(collection, id, Arc::new(transform(Value::Object(raw))))
    }

    /// Applies a `removed` frame.
    #[must_use]
    pub(crate) fn removed(&self, collection: &str, id: &str) -> Self {
        let documents = match self.inner.get(collection) {
            Some(existing) => {
                let mut documents = existing.as_ref().clone();
                documents.remove(id);
                documents
            }
            None => FxHashMap::default(),
        };
        self.with_collection(collection, Arc::new(documents))
    }

    fn with_document(&self, collection: &str, id: &str, document: Document) -> Self {
        let mut documents = self
            .inner
            .get(collection)
            .map(|c| c.as_ref().clone())
            .unwrap_or_default();
        documents.insert(id.to_string(), document);
        self.with_collection(collection, Arc::new(documents))
    }

    fn with_collection(&self, collection: &str, documents: Collection) -> Self {
        let mut inner = self.inner.as_ref().clone();
        inner.insert(collection.to_string(), documents);
        Self {
            inner: Arc::new(inner),
        }
    }
}

// ============================================================================
// Reconciliation
// ============================================================================

impl Collections {
    /// Merges a pre-disconnect snapshot with the post-restore one.
    ///
    /// The result has the content of `new`, but every document, collection
    /// or whole snapshot that is deep-equal to its counterpart in `old` is
    /// the `old` allocation. If nothing changed, the result is `old` itself.
    #[must_use]
    pub fn reconcile(old: &Self, new: &Self) -> Self {
        let mut changed = old.inner.len() != new.inner.len();
        let mut merged = FxHashMap::with_capacity_and_hasher(new.inner.len(), Default::default());

        for (name, fresh) in new.inner.iter() {
            let documents = match old.inner.get(name) {
                Some(previous) => {
                    let documents = reconcile_collection(previous, fresh);
                    changed |= !Arc::ptr_eq(previous, &documents);
                    documents
                }
                None => {
                    changed = true;
                    Arc::clone(fresh)
                }
            };
            merged.insert(name.clone(), documents);
        }

        if changed {
            Self {
                inner: Arc::new(merged),
            }
        } else {
            old.clone()
        }
    }
}

fn reconcile_collection(old: &Collection, new: &Collection) -> Collection {
    let mut changed = old.len() != new.len();
    let mut merged = FxHashMap::with_capacity_and_hasher(new.len(), Default::default());

    for (id, fresh) in new.iter() {
        let document = match old.get(id) {
            Some(previous) if previous == fresh => Arc::clone(previous),
            _ => {
                changed = true;
                Arc::clone(fresh)
            }
        };
        merged.insert(id.clone(), document);
    }

    if changed { Arc::new(merged) } else { Arc::clone(old) }
}

// ============================================================================
// Tests
// ============================================================================
