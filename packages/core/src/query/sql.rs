//! Parameterized SQL assembly

use serde_json::Value;

/// SQL text with positional bindings kept in step
///
/// Every [`bind`](Self::bind) appends a `?` placeholder and records its value,
/// so fragments can be concatenated in any order without renumbering.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SqlBuilder {
    sql: String,
    bindings: Vec<Value>,
}

impl SqlBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, text: &str) -> &mut Self {
        self.sql.push_str(text);
        self
    }

    pub fn bind(&mut self, value: impl Into<Value>) -> &mut Self {
        self.sql.push('?');
        self.bindings.push(value.into());
        self
    }

    /// `?, ?, ?` for every value
    pub fn bind_list<I, V>(&mut self, values: I) -> &mut Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        for (position, value) in values.into_iter().enumerate() {
            if position > 0 {
                self.sql.push_str(", ");
            }
            self.bind(value);
        }
        self
    }

    pub fn append(&mut self, other: SqlBuilder) -> &mut Self {
        self.sql.push_str(&other.sql);
        self.bindings.extend(other.bindings);
        self
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn bindings(&self) -> &[Value] {
        &self.bindings
    }

    pub fn is_empty(&self) -> bool {
        self.sql.is_empty()
    }

    pub fn into_parts(self) -> (String, Vec<Value>) {
        (self.sql, self.bindings)
    }
}
