//! Field registry for a segment
//!
//! Field numbers are assigned in order of first appearance and never change
//! within a segment. A field omits norms only if every document that
//! contained it omitted them; one document with norms turns them on.

use crate::document::Field;
use quarry_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// What the segment knows about one field
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldInfo {
    pub name: String,
    pub number: u32,
    pub indexed: bool,
    pub omit_norms: bool,
}

impl FieldInfo {
    pub const fn has_norms(&self) -> bool {
        self.indexed && !self.omit_norms
    }
}

/// Fields of a segment, indexed by number and by name
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FieldInfos {
    by_number: Vec<FieldInfo>,
    by_name: HashMap<String, u32>,
}

impl FieldInfos {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from a list in field-number order
    pub fn from_infos(infos: Vec<FieldInfo>) -> Result<Self> {
        let mut by_name = HashMap::with_capacity(infos.len());
        for (expected, info) in infos.iter().enumerate() {
            if info.number as usize != expected {
                return Err(Error::format(format!(
                    "field {} has number {}, expected {expected}",
                    info.name, info.number
                )));
            }
            if by_name.insert(info.name.clone(), info.number).is_some() {
                return Err(Error::format(format!("duplicate field {}", info.name)));
            }
        }
        Ok(Self {
            by_number: infos,
            by_name,
        })
    }

    /// Register or merge a field, returning its number
    pub fn add(&mut self, name: &str, indexed: bool, omit_norms: bool) -> u32 {
        if let Some(&number) = self.by_name.get(name) {
            let info = &mut self.by_number[number as usize];
            info.indexed |= indexed;
            info.omit_norms &= omit_norms;
            return number;
        }
        let number = u32::try_from(self.by_number.len()).unwrap_or(u32::MAX);
        self.by_number.push(FieldInfo {
            name: name.to_string(),
            number,
            indexed,
            omit_norms,
        });
        self.by_name.insert(name.to_string(), number);
        number
    }

    /// Register a document field
    pub fn add_field(&mut self, field: &Field) -> u32 {
        self.add(&field.name, field.indexed, field.omit_norms)
    }

    /// Fold another registry into this one, keeping this one's numbering
    pub fn merge(&mut self, other: &Self) {
        for info in other.iter() {
            self.add(&info.name, info.indexed, info.omit_norms);
        }
    }

    pub fn by_name(&self, name: &str) -> Option<&FieldInfo> {
        self.by_name
            .get(name)
            .and_then(|n| self.by_number.get(*n as usize))
    }

    pub fn by_number(&self, number: u32) -> Option<&FieldInfo> {
        self.by_number.get(number as usize)
    }

    /// Fields in field-number order
    pub fn iter(&self) -> impl Iterator<Item = &FieldInfo> {
        self.by_number.iter()
    }

    /// Fields that carry norms, in field-number order
    pub fn normed(&self) -> impl Iterator<Item = &FieldInfo> {
        self.by_number.iter().filter(|f| f.has_norms())
    }

    pub fn has_norms(&self) -> bool {
        self.normed().next().is_some()
    }

    pub fn len(&self) -> usize {
        self.by_number.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_number.is_empty()
    }

    /// Infos in number order, for persistence
    pub fn to_vec(&self) -> Vec<FieldInfo> {
        self.by_number.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numbers_follow_first_sight() {
        let mut infos = FieldInfos::new();
        assert_eq!(infos.add("title", true, false), 0);
        assert_eq!(infos.add("id", true, true), 1);
        assert_eq!(infos.add("title", true, false), 0);
        assert_eq!(infos.len(), 2);
        assert_eq!(infos.by_number(1).unwrap().name, "id");
    }

    #[test]
    fn test_norms_win_on_merge() {
        let mut infos = FieldInfos::new();
        infos.add("tag", true, true);
        assert!(!infos.by_name("tag").unwrap().has_norms());
        infos.add("tag", true, false);
        assert!(infos.by_name("tag").unwrap().has_norms());
        infos.add("tag", true, true);
        assert!(infos.by_name("tag").unwrap().has_norms());
    }

    #[test]
    fn test_merge_keeps_numbering() {
        let mut a = FieldInfos::new();
        a.add("title", true, false);
        let mut b = FieldInfos::new();
        b.add("body", true, false);
        b.add("title", true, false);
        a.merge(&b);
        assert_eq!(a.by_name("title").unwrap().number, 0);
        assert_eq!(a.by_name("body").unwrap().number, 1);
    }

    #[test]
    fn test_from_infos_validates_numbers() {
        let mut infos = FieldInfos::new();
        infos.add("a", true, false);
        infos.add("b", false, true);
        let rebuilt = FieldInfos::from_infos(infos.to_vec()).unwrap();
        assert_eq!(rebuilt, infos);

        let mut broken = infos.to_vec();
        broken[1].number = 5;
        assert!(matches!(FieldInfos::from_infos(broken), Err(Error::Format(_))));
    }
}
