//! Documents produced by the indexing pipeline

use serde::{Deserialize, Serialize};

/// One field of a document
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub value: String,
    /// Tokenized and searchable
    pub indexed: bool,
    /// Skip the per-document norm for this field
    pub omit_norms: bool,
    /// Index-time boost folded into the norm
    pub boost: f32,
}

impl Field {
    /// Indexed field with norms and no boost
    pub fn text(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            indexed: true,
            omit_norms: false,
            boost: 1.0,
        }
    }

    /// Indexed field without norms (ids, keywords)
    pub fn keyword(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            omit_norms: true,
            ..Self::text(name, value)
        }
    }

    /// Stored-only field
    pub fn stored(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            indexed: false,
            omit_norms: true,
            ..Self::text(name, value)
        }
    }

    #[must_use]
    pub const fn with_boost(mut self, boost: f32) -> Self {
        self.boost = boost;
        self
    }

    /// Whether this field contributes a norm
    pub const fn has_norms(&self) -> bool {
        self.indexed && !self.omit_norms
    }

    /// Number of whitespace separated terms in the value
    pub fn num_terms(&self) -> usize {
        self.value.split_whitespace().count()
    }
}

/// A document: an ordered list of fields
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub fields: Vec<Field>,
}

impl Document {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    pub fn add(&mut self, field: Field) {
        self.fields.push(field);
    }

    /// First field with `name`
    pub fn get(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}
