//! Table definitions and their creation order.
//!
//! Rules enforced before a bootstrap touches the backend:
//! 1. Table names are plain SQL identifiers.
//! 2. Table names are unique.  Unquoted identifiers fold to lower case, so
//!    `Products` and `products` are the same table.
//! 3. Foreign-key references between the given tables are acyclic.
//!
//! Returns the tables with every referenced table ahead of the tables that
//! reference it.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::ExecutorError;

/// Longest identifier the backend keeps without truncating.
pub const MAX_IDENTIFIER_LEN: usize = 63;

// ---------------------------------------------------------------------------
// TableDefinition
// ---------------------------------------------------------------------------

/// `FOREIGN KEY (column) REFERENCES table(references)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub column: String,
    pub table: String,
    pub references: String,
}

/// One idempotent `CREATE TABLE IF NOT EXISTS` statement, kept structured so
/// bootstrap can see which tables it depends on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDefinition {
    pub name: String,
    /// Column definitions as SQL fragments, e.g. `"salary DECIMAL(10,2)"`.
    pub columns: Vec<String>,
    /// Table-level primary key; leave empty when a column declares it inline.
    #[serde(default)]
    pub primary_key: Vec<String>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKey>,
}

impl TableDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            primary_key: Vec::new(),
            foreign_keys: Vec::new(),
        }
    }

    pub fn column(mut self, definition: impl Into<String>) -> Self {
        self.columns.push(definition.into());
        self
    }

    pub fn primary_key<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary_key = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn foreign_key(
        mut self,
        column: impl Into<String>,
        table: impl Into<String>,
        references: impl Into<String>,
    ) -> Self {
        self.foreign_keys.push(ForeignKey {
            column: column.into(),
            table: table.into(),
            references: references.into(),
        });
        self
    }

    /// Names of the tables this one references.
    pub fn references(&self) -> impl Iterator<Item = &str> {
        self.foreign_keys.iter().map(|fk| fk.table.as_str())
    }

    pub fn create_statement(&self) -> String {
        let mut clauses = self.columns.clone();
        if !self.primary_key.is_empty() {
            clauses.push(format!("PRIMARY KEY ({})", self.primary_key.join(", ")));
        }
        for fk in &self.foreign_keys {
            clauses.push(format!(
                "FOREIGN KEY ({}) REFERENCES {}({})",
                fk.column, fk.table, fk.references
            ));
        }
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
            self.name,
            clauses.join(",\n    ")
        )
    }
}

/// `true` for a non-empty ASCII identifier that needs no quoting.
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let valid_start = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_');
    valid_start
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && name.len() <= MAX_IDENTIFIER_LEN
}

// ---------------------------------------------------------------------------
// Ordering
// ---------------------------------------------------------------------------

/// Validate `tables` and return them in creation order.
///
/// Tables with no ordering constraint between them keep their input order.
/// Self-references and references to tables outside `tables` are assumed to
/// be satisfied already.
///
/// # Errors
/// - [`ExecutorError::InvalidTableName`] for a table or referenced name that
///   is not a plain identifier.
/// - [`ExecutorError::DuplicateTable`] if two tables share a name.
/// - [`ExecutorError::ReferenceCycle`] if the references cannot be ordered.
pub fn bootstrap_order(tables: &[TableDefinition]) -> Result<Vec<&TableDefinition>, ExecutorError> {
    let mut index: HashMap<String, usize> = HashMap::with_capacity(tables.len());
    for (i, table) in tables.iter().enumerate() {
        if !is_identifier(&table.name) {
            return Err(ExecutorError::InvalidTableName(table.name.clone()));
        }
        if index.insert(table.name.to_ascii_lowercase(), i).is_some() {
            return Err(ExecutorError::DuplicateTable(table.name.clone()));
        }
    }

    for referenced in tables.iter().flat_map(|t| t.references()) {
        if !is_identifier(referenced) {
            return Err(ExecutorError::InvalidTableName(referenced.to_owned()));
        }
    }

    // Kahn's algorithm with edges from referenced table to referencing table.
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); tables.len()];
    let mut in_degree: Vec<usize> = vec![0; tables.len()];

    for (i, table) in tables.iter().enumerate() {
        let mut seen: HashSet<usize> = HashSet::new();
        for referenced in table.references() {
            let Some(&j) = index.get(&referenced.to_ascii_lowercase()) else {
                continue;
            };
            if j == i || !seen.insert(j) {
                continue;
            }
            dependents[j].push(i);
            in_degree[i] += 1;
        }
    }

    // Lowest input position first among the ready tables.
    let mut ready: BinaryHeap<Reverse<usize>> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, &d)| d == 0)
        .map(|(i, _)| Reverse(i))
        .collect();

    let mut sorted: Vec<&TableDefinition> = Vec::with_capacity(tables.len());

    while let Some(Reverse(i)) = ready.pop() {
        sorted.push(&tables[i]);
        for &dependent in &dependents[i] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                ready.push(Reverse(dependent));
            }
        }
    }

    if sorted.len() != tables.len() {
        let unresolved = tables
            .iter()
            .zip(&in_degree)
            .filter(|(_, &d)| d > 0)
            .map(|(t, _)| t.name.clone())
            .collect();
        return Err(ExecutorError::ReferenceCycle(unresolved));
    }

    Ok(sorted)
}
