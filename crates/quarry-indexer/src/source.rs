//! Pipeline seams: where entities come from and where documents go

use quarry_common::config::CacheMode;
use quarry_common::{EntityId, Result};
use quarry_index::Document;

/// Iterator over the identifiers of one entity type
pub type IdentifierStream<'a> = Box<dyn Iterator<Item = Result<EntityId>> + Send + 'a>;

/// A type of entity that can be mass indexed
///
/// Implementations are shared by every worker of a pipeline.
pub trait EntitySource: Send + Sync {
    /// Loaded entity
    type Entity: Send;

    /// Name of the entity type, used in logs and errors
    fn entity_type(&self) -> &str;

    /// Every identifier to index
    fn identifiers(&self) -> Result<IdentifierStream<'_>>;

    /// Load a batch of entities
    ///
    /// Identifiers whose entity no longer exists are skipped.
    fn load(&self, ids: &[EntityId], cache_mode: CacheMode) -> Result<Vec<Self::Entity>>;

    /// Identifier of a loaded entity
    fn entity_id(&self, entity: &Self::Entity) -> EntityId;

    /// Turn an entity into a document
    fn build_document(&self, entity: &Self::Entity) -> Result<Document>;
}

/// A document ready for the backend
#[derive(Clone, Debug)]
pub struct DocumentWork {
    pub entity_type: String,
    pub id: EntityId,
    /// Index of the document building worker that produced it
    pub producer: usize,
    pub document: Document,
}

/// Receives built documents
pub trait IndexingBackend: Send + Sync {
    fn apply(&self, work: DocumentWork) -> Result<()>;

    /// Make everything applied so far durable
    fn flush(&self) -> Result<()>;

    /// Make the documents of one entity type durable
    fn flush_entity_type(&self, _entity_type: &str) -> Result<()> {
        self.flush()
    }

    /// Drop pending documents of an entity type whose pipeline failed
    fn discard(&self, _entity_type: &str) -> Result<()> {
        Ok(())
    }
}
