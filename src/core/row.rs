//! Purpose: Define the text-normalized tabular model produced by the materializer.
//! Exports: `Cell`, `Row`, `ResultSet`.
//! Role: The only contract between the source, the payload codecs, and the relay.
//! Invariants: Every value is text or null; null never collapses into "".
//! Invariants: A well-formed result set has every row as wide as its column list.

use crate::core::error::{Error, ErrorKind};

/// A single column value after text normalization.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum Cell {
    Null,
    Text(String),
}

impl Cell {
    pub fn text(value: impl Into<String>) -> Self {
        Cell::Text(value.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Cell::Null => None,
            Cell::Text(value) => Some(value.as_str()),
        }
    }
}

impl From<Option<String>> for Cell {
    fn from(value: Option<String>) -> Self {
        value.map(Cell::Text).unwrap_or(Cell::Null)
    }
}

impl From<Option<&str>> for Cell {
    fn from(value: Option<&str>) -> Self {
        value.map(Cell::text).unwrap_or(Cell::Null)
    }
}

impl From<&str> for Cell {
    fn from(value: &str) -> Self {
        Cell::text(value)
    }
}

pub type Row = Vec<Cell>;

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ResultSet {
    columns: Vec<String>,
    rows: Vec<Row>,
}

impl ResultSet {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Builds a result set, rejecting rows whose width disagrees with `columns`.
    pub fn from_rows(columns: Vec<String>, rows: Vec<Row>) -> Result<Self, Error> {
        let mut set = Self::new(columns);
        for row in rows {
            set.push(row)?;
        }
        Ok(set)
    }

    pub fn push(&mut self, row: Row) -> Result<(), Error> {
        if row.len() != self.columns.len() {
            return Err(Error::new(ErrorKind::Internal).with_message(format!(
                "row {} has {} values but the result has {} columns",
                self.rows.len(),
                row.len(),
                self.columns.len()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn into_parts(self) -> (Vec<String>, Vec<Row>) {
        (self.columns, self.rows)
    }

    /// Index of the first row whose width differs from the column count.
    pub(crate) fn first_ragged_row(&self) -> Option<usize> {
        self.rows
            .iter()
            .position(|row| row.len() != self.columns.len())
    }

    #[cfg(test)]
    pub(crate) fn from_parts_unchecked(columns: Vec<String>, rows: Vec<Row>) -> Self {
        Self { columns, rows }
    }
}

#[cfg(test)]
mod tests {
    use super::{Cell, ResultSet};

    fn columns(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[test]
    fn null_is_distinct_from_empty_text() {
        assert_ne!(Cell::Null, Cell::text(""));
        assert_eq!(Cell::text("").as_str(), Some(""));
        assert_eq!(Cell::Null.as_str(), None);
        assert!(Cell::from(None::<String>).is_null());
    }

    #[test]
    fn push_rejects_ragged_rows() {
        let mut set = ResultSet::new(columns(&["id", "name"]));
        set.push(vec![Cell::text("1"), Cell::text("Alice")])
            .expect("push");
        let err = set.push(vec![Cell::text("2")]).expect_err("ragged");
        assert!(err.message().unwrap_or_default().contains("row 1"));
        assert_eq!(set.row_count(), 1);
    }

    #[test]
    fn ragged_detection_reports_first_offender() {
        let set = ResultSet::from_parts_unchecked(
            columns(&["a"]),
            vec![vec![Cell::Null], vec![], vec![Cell::Null, Cell::Null]],
        );
        assert_eq!(set.first_ragged_row(), Some(1));
    }
}
