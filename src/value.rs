//! Decoded row data.

use crate::types::SqlType;

/// A single decoded column value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    I64(i64),
    F64(f64),
    Str(String),
    Bool(bool),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I64(v) => Some(*v),
            Value::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::F64(v) => Some(*v),
            Value::I64(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::I64(v) => Some(*v != 0),
            _ => None,
        }
    }
}

/// Describes one column of a result set.
#[derive(Debug, Clone)]
pub struct Field {
    pub name: String,
    pub sql_type: SqlType,
}

/// A single row, positional by column index.
#[derive(Debug, Clone, Default)]
pub struct Row {
    pub values: Vec<Value>,
}

impl Row {
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }
}

/// The accumulator populated by the default query handler: field descriptors plus every row
/// seen before `end_results`.
#[derive(Debug, Clone, Default)]
pub struct ResultSet {
    pub fields: Vec<Field>,
    pub rows: Vec<Row>,
}

impl ResultSet {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn get(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.field_index(column)?;
        self.rows.get(row)?.get(idx)
    }
}

/// The accumulator for `Update`, `Begin`, `Commit`, `Rollback` and `Close` requests that report
/// an affected row count (MySQL reports one for all of these; PostgreSQL only for DML).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateResult {
    pub rows_affected: u64,
    pub last_insert_id: Option<u64>,
}
