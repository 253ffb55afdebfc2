use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// A replicated table, identified by schema and name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TableRef {
    pub schema: String,
    pub table: String,
}

impl TableRef {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }

    /// Parse `schema.table`. A bare `table` is placed in `public`.
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        let (schema, table) = text.split_once('.').unwrap_or(("public", text));

        if schema.is_empty() || table.is_empty() || table.contains('.') {
            return Err(Error::InvalidTableRef(text.to_string()));
        }

        Ok(Self::new(schema, table))
    }

    pub fn matches(&self, schema: &str, table: &str) -> bool {
        self.schema == schema && self.table == table
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

impl FromStr for TableRef {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for TableRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TableRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        TableRef::parse(&text).map_err(serde::de::Error::custom)
    }
}

/// An ordered set of tables.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableSet(BTreeSet<TableRef>);

impl TableSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, table: TableRef) -> bool {
        self.0.insert(table)
    }

    pub fn contains(&self, table: &TableRef) -> bool {
        self.0.contains(table)
    }

    /// Membership test without allocating a `TableRef`.
    pub fn contains_table(&self, schema: &str, table: &str) -> bool {
        self.0.iter().any(|t| t.matches(schema, table))
    }

    pub fn is_subset(&self, other: &TableSet) -> bool {
        self.0.is_subset(&other.0)
    }

    /// Tables in `self` that are missing from `other`.
    pub fn difference<'a>(&'a self, other: &'a TableSet) -> impl Iterator<Item = &'a TableRef> {
        self.0.difference(&other.0)
    }

    pub fn extend(&mut self, other: &TableSet) {
        self.0.extend(other.iter().cloned());
    }

    pub fn iter(&self) -> impl Iterator<Item = &TableRef> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<TableRef> for TableSet {
    fn from_iter<I: IntoIterator<Item = TableRef>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a TableSet {
    type Item = &'a TableRef;
    type IntoIter = std::collections::btree_set::Iter<'a, TableRef>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
