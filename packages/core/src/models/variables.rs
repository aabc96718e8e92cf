//! Ruleset variables and usage tracking
//!
//! Rules may read named variables while they are evaluated. A data source only
//! records the subset it actually read (its *related variables*), and a cached
//! data source is reused for any variable set that agrees on that subset.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};

/// Named rule-evaluation inputs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RulesetVariables(BTreeMap<String, Value>);

impl RulesetVariables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style setter
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// Value of `name`, treating a missing variable as `null`
    pub fn value_of(&self, name: &str) -> Value {
        self.0.get(name).cloned().unwrap_or(Value::Null)
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Project onto `names`; missing variables are recorded as `null`
    pub fn subset<'a>(&self, names: impl IntoIterator<Item = &'a String>) -> Self {
        Self(
            names
                .into_iter()
                .map(|name| (name.clone(), self.value_of(name)))
                .collect(),
        )
    }

    /// Whether every entry of `other` is present here with the same value
    pub fn contains(&self, other: &RulesetVariables) -> bool {
        other
            .0
            .iter()
            .all(|(name, value)| self.0.get(name) == Some(value))
    }

    /// Whether these (current) variables agree with a stored related set
    pub fn matches(&self, stored: &RulesetVariables) -> bool {
        stored
            .0
            .iter()
            .all(|(name, value)| &self.value_of(name) == value)
    }

    /// Union with `other`; values from `other` win
    pub fn merged(&self, other: &RulesetVariables) -> Self {
        let mut merged = self.0.clone();
        for (name, value) in &other.0 {
            merged.insert(name.clone(), value.clone());
        }
        Self(merged)
    }

    /// Canonical JSON form (keys sorted)
    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.0).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for RulesetVariables {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Variables handed to rule and expression evaluation that remember which
/// names were read
#[derive(Debug, Default)]
pub struct TrackedVariables {
    values: RulesetVariables,
    used: RefCell<BTreeSet<String>>,
}

impl TrackedVariables {
    pub fn new(values: RulesetVariables) -> Self {
        Self {
            values,
            used: RefCell::new(BTreeSet::new()),
        }
    }

    /// Read a variable and record the access
    pub fn get(&self, name: &str) -> Value {
        self.used.borrow_mut().insert(name.to_string());
        self.values.value_of(name)
    }

    /// Truthiness of a variable: `true`, non-zero numbers and non-empty strings
    pub fn is_set(&self, name: &str) -> bool {
        match self.get(name) {
            Value::Bool(value) => value,
            Value::Number(number) => number.as_f64().map(|n| n != 0.0).unwrap_or(false),
            Value::String(value) => !value.is_empty(),
            Value::Null => false,
            Value::Array(items) => !items.is_empty(),
            Value::Object(map) => !map.is_empty(),
        }
    }

    pub fn values(&self) -> &RulesetVariables {
        &self.values
    }

    pub fn used_names(&self) -> BTreeSet<String> {
        self.used.borrow().clone()
    }
}
