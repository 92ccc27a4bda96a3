use std::collections::HashMap;
use std::fs;
use std::path::Path;

use log::debug;

use crate::Result;

/// Ordered mapping from class id to class name, in order of first appearance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClassMapping {
    entries: Vec<(u32, String)>,
    lookup: HashMap<u32, usize>,
}

impl ClassMapping {
    /// Read and parse a label file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let mapping = Self::parse(&contents);

        debug!(
            "Loaded {} classes from {}",
            mapping.len(),
            path.display()
        );

        Ok(mapping)
    }

    pub fn parse(contents: &str) -> Self {
        let mut mapping = ClassMapping::default();

        for line in contents.lines() {
            let mut parts = line.split_whitespace();

            let id = match parts.next().and_then(parse_id) {
                Some(id) => id,
                None => continue,
            };

            let name = parts.collect::<Vec<_>>().join(" ");
            if name.is_empty() {
                continue;
            }

            mapping.insert(id, name);
        }

        mapping
    }

    /// A repeated id keeps its first position but takes the newer name.
    fn insert(&mut self, id: u32, name: String) {
        match self.lookup.get(&id) {
            Some(&pos) => self.entries[pos].1 = name,
            None => {
                self.lookup.insert(id, self.entries.len());
                self.entries.push((id, name));
            }
        }
    }

    pub fn name(&self, id: u32) -> Option<&str> {
        self.lookup
            .get(&id)
            .map(|&pos| self.entries[pos].1.as_str())
    }

    pub fn ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.entries.iter().map(|(id, _)| *id)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.entries.iter().map(|(_, name)| name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &str)> + '_ {
        self.entries.iter().map(|(id, name)| (*id, name.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn parse_id(token: &str) -> Option<u32> {
    if !token.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    token.parse().ok()
}

/// Translates a model output position to the class id at that position.
///
/// Positions are assigned by enumerating the ids of a [`ClassMapping`], so the
/// index has to be rebuilt from the same label file the model was trained on.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassIndex {
    ids: Vec<u32>,
    positions: HashMap<u32, usize>,
}

impl ClassIndex {
    pub fn from_mapping(mapping: &ClassMapping) -> Self {
        let ids: Vec<u32> = mapping.ids().collect();
        let positions = ids.iter().enumerate().map(|(pos, id)| (*id, pos)).collect();

        ClassIndex { ids, positions }
    }

    pub fn class_id(&self, position: usize) -> Option<u32> {
        self.ids.get(position).copied()
    }

    pub fn position(&self, id: u32) -> Option<usize> {
        self.positions.get(&id).copied()
    }

    pub fn ids(&self) -> &[u32] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}
