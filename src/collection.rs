/*!
 * @file collection.rs
 * @brief External collaborator interfaces
 *
 * The engine never touches storage directly. A host application hands it
 * a `CollectionProvider` to resolve `$lookup`/`$graphLookup`/`$unionWith`
 * targets and, for `$out`, a write sink — and a `FilterMatcher` so
 * `$match`'s query-language predicates (a separate subsystem this engine
 * treats as a black box) can be evaluated without this crate knowing their
 * grammar.
 */

use crate::error::Result;
use async_trait::async_trait;
use bson::Document;

/// Evaluates a MongoDB-style query filter document against one row.
/// Implemented by the host's query/filter-matching subsystem.
pub trait FilterMatcher: Send + Sync {
    fn matches(&self, filter: &Document, doc: &Document) -> Result<bool>;
}

/// A named, already-materialized or lazily-fetchable document sequence —
/// the abstraction `$lookup`, `$graphLookup`, and `$unionWith` read from.
#[async_trait]
pub trait CollectionHandle: Send + Sync {
    async fn all(&self) -> Result<Vec<Document>>;
}

/// Resolves collection names to handles and, for `$out`, accepts a whole-
/// collection replacement. Storage, indexing, and transactional semantics
/// live entirely on the other side of this trait.
#[async_trait]
pub trait CollectionProvider: Send + Sync {
    async fn collection(&self, name: &str) -> Result<Box<dyn CollectionHandle>>;

    async fn replace_collection(&self, name: &str, docs: Vec<Document>) -> Result<()>;
}

/// An in-memory `CollectionHandle`/`CollectionProvider` pair, useful for
/// embedding this engine against data that's already resident (tests,
/// small scripts, or a caller that already did its own fetch).
pub struct InMemoryCollection {
    pub docs: Vec<Document>,
}

#[async_trait]
impl CollectionHandle for InMemoryCollection {
    async fn all(&self) -> Result<Vec<Document>> {
        Ok(self.docs.clone())
    }
}

#[derive(Default)]
pub struct InMemoryProvider {
    pub collections: std::collections::HashMap<String, Vec<Document>>,
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_collection(mut self, name: impl Into<String>, docs: Vec<Document>) -> Self {
        self.collections.insert(name.into(), docs);
        self
    }
}

#[async_trait]
impl CollectionProvider for InMemoryProvider {
    async fn collection(&self, name: &str) -> Result<Box<dyn CollectionHandle>> {
        let docs = self.collections.get(name).cloned().unwrap_or_default();
        Ok(Box::new(InMemoryCollection { docs }))
    }

    async fn replace_collection(&self, _name: &str, _docs: Vec<Document>) -> Result<()> {
        // An in-memory provider built purely for read-side tests has no
        // mutation story; a real embedder supplies its own provider.
        Err(crate::error::DocPipeError::Environment(
            "InMemoryProvider does not support $out/$merge".to_string(),
        ))
    }
}

/// A `FilterMatcher` that accepts only `{}` and simple top-level equality
/// documents — enough for unit tests that don't want to pull in a real
/// query engine.
pub struct SimpleEqualityMatcher;

impl FilterMatcher for SimpleEqualityMatcher {
    fn matches(&self, filter: &Document, doc: &Document) -> Result<bool> {
        for (key, expected) in filter {
            let actual = crate::value::get_path(doc, key).into_bson_or_null();
            if !crate::bson_order::eq_bson(&actual, expected) {
                return Ok(false);
            }
        }
        Ok(true)
    }
}
