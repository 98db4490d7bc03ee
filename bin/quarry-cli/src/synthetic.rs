//! Generated entities for exercising the indexing pipeline

use quarry_common::config::CacheMode;
use quarry_common::{EntityId, Error, Result};
use quarry_index::{Document, Field};
use quarry_indexer::{EntitySource, IdentifierStream};

const WORDS: &[&str] = &[
    "granite", "basalt", "quartz", "shale", "marble", "slate", "flint", "chalk", "gneiss",
    "obsidian", "pumice", "schist",
];

/// A generated entity
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sample {
    pub id: u64,
    pub title: String,
    pub body: String,
}

/// `count` entities whose field lengths vary with the id
#[derive(Debug)]
pub struct SyntheticSource {
    entity_type: String,
    count: u64,
}

impl SyntheticSource {
    pub fn new(entity_type: impl Into<String>, count: u64) -> Self {
        Self {
            entity_type: entity_type.into(),
            count,
        }
    }

    fn words(seed: u64, len: usize) -> String {
        (0..len)
            .map(|i| WORDS[(seed as usize).wrapping_mul(31).wrapping_add(i * 7) % WORDS.len()])
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn sample(id: u64) -> Sample {
        Sample {
            id,
            title: Self::words(id, (id % 4 + 1) as usize),
            body: Self::words(id + 1, (id % 37 + 3) as usize),
        }
    }
}

impl EntitySource for SyntheticSource {
    type Entity = Sample;

    fn entity_type(&self) -> &str {
        &self.entity_type
    }

    fn identifiers(&self) -> Result<IdentifierStream<'_>> {
        Ok(Box::new((0..self.count).map(|id| Ok(EntityId::from(id)))))
    }

    fn load(&self, ids: &[EntityId], _cache_mode: CacheMode) -> Result<Vec<Sample>> {
        ids.iter()
            .map(|id| {
                let id: u64 = id
                    .as_str()
                    .parse()
                    .map_err(|_| Error::format(format!("bad synthetic id {id}")))?;
                Ok(Self::sample(id))
            })
            .collect()
    }

    fn entity_id(&self, entity: &Sample) -> EntityId {
        EntityId::from(entity.id)
    }

    fn build_document(&self, entity: &Sample) -> Result<Document> {
        Ok(Document::new()
            .with_field(Field::keyword("id", entity.id.to_string()))
            .with_field(Field::text("title", entity.title.clone()).with_boost(2.0))
            .with_field(Field::text("body", entity.body.clone())))
    }
}
