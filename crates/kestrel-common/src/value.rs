//! Typed column values and key comparators.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// A typed column value.
///
/// The engine never interprets SQL types beyond ordering; arithmetic and
/// coercion belong to the excluded type-system layer. Columns compared by
/// an index are expected to hold a single variant (plus `Null`).
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i64),
    Double(f64),
    Text(String),
    Binary(Vec<u8>),
}

impl Value {
    /// Type tag used for cross-variant ordering and serialization.
    pub fn type_tag(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Boolean(_) => 1,
            Value::Integer(_) => 2,
            Value::Double(_) => 3,
            Value::Text(_) => 4,
            Value::Binary(_) => 5,
        }
    }

    /// Returns true if this value is SQL NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Approximate in-memory footprint in bytes, used for cache accounting.
    pub fn storage_size(&self) -> usize {
        match self {
            Value::Null => 1,
            Value::Boolean(_) => 2,
            Value::Integer(_) => 9,
            Value::Double(_) => 9,
            Value::Text(s) => 5 + s.len(),
            Value::Binary(b) => 5 + b.len(),
        }
    }

    /// Total 3-way ordering between two non-null values.
    ///
    /// Same-variant values compare naturally (`Double` via `total_cmp`);
    /// mixed variants order by type tag so the comparison is still total.
    /// Null handling is the comparator's job, not this method's.
    pub fn compare_to(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
            (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
            (Value::Double(a), Value::Double(b)) => a.total_cmp(b),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (Value::Binary(a), Value::Binary(b)) => a.cmp(b),
            _ => self.type_tag().cmp(&other.type_tag()),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Boolean(v) => write!(f, "{}", v),
            Value::Integer(v) => write!(f, "{}", v),
            Value::Double(v) => write!(f, "{}", v),
            Value::Text(v) => write!(f, "'{}'", v),
            Value::Binary(v) => write!(f, "x'{}v'", v.len()),
        }
    }
}

/// Sort direction for one key column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
}

/// Where NULL sorts relative to non-null values.
///
/// The policy is absolute: NULLS FIRST means null compares low regardless
/// of the column's sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NullOrdering {
    #[default]
    NullsFirst,
    NullsLast,
}

/// One key column of an index: which row column, and its direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    /// Index of the column within the row tuple.
    pub column: usize,
    /// Sort direction for this column.
    pub direction: SortDirection,
}

impl ColumnSpec {
    /// Ascending key on the given row column.
    pub fn asc(column: usize) -> Self {
        Self {
            column,
            direction: SortDirection::Ascending,
        }
    }

    /// Descending key on the given row column.
    pub fn desc(column: usize) -> Self {
        Self {
            column,
            direction: SortDirection::Descending,
        }
    }
}

/// 3-way comparator over the key columns of an index.
///
/// Supplied by the table layer at index creation; the index itself never
/// interprets column types.
#[derive(Debug, Clone)]
pub struct RowComparator {
    columns: Vec<ColumnSpec>,
    null_ordering: NullOrdering,
}

impl RowComparator {
    /// Creates a comparator over the given key columns.
    pub fn new(columns: Vec<ColumnSpec>, null_ordering: NullOrdering) -> Self {
        Self {
            columns,
            null_ordering,
        }
    }

    /// Ascending comparator over the given row columns with nulls first.
    pub fn ascending(columns: &[usize]) -> Self {
        Self::new(
            columns.iter().map(|&c| ColumnSpec::asc(c)).collect(),
            NullOrdering::NullsFirst,
        )
    }

    /// Number of key columns.
    pub fn key_len(&self) -> usize {
        self.columns.len()
    }

    /// The key column specs.
    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    /// Compares the first `match_count` key columns of two row tuples.
    ///
    /// `match_count` is clamped to the key length, so passing
    /// `usize::MAX` compares the full key.
    pub fn compare(&self, a: &[Value], b: &[Value], match_count: usize) -> Ordering {
        let count = match_count.min(self.columns.len());
        for spec in &self.columns[..count] {
            let va = &a[spec.column];
            let vb = &b[spec.column];

            let ord = match (va.is_null(), vb.is_null()) {
                (true, true) => Ordering::Equal,
                (true, false) => match self.null_ordering {
                    NullOrdering::NullsFirst => Ordering::Less,
                    NullOrdering::NullsLast => Ordering::Greater,
                },
                (false, true) => match self.null_ordering {
                    NullOrdering::NullsFirst => Ordering::Greater,
                    NullOrdering::NullsLast => Ordering::Less,
                },
                (false, false) => {
                    let natural = va.compare_to(vb);
                    match spec.direction {
                        SortDirection::Ascending => natural,
                        SortDirection::Descending => natural.reverse(),
                    }
                }
            };

            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }

    /// Compares the full key of two row tuples.
    pub fn compare_full(&self, a: &[Value], b: &[Value]) -> Ordering {
        self.compare(a, b, self.columns.len())
    }
}
