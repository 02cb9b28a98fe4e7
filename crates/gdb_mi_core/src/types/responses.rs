use serde::Serialize;
use std::collections::BTreeMap;

use super::{Message, Record, Value};

/// Reply to a token-correlated exchange.
#[derive(Debug, Clone, Serialize)]
pub struct Response {
    /// Index of the record carrying the token within `message`.
    pub index: usize,
    pub message: Message,
    /// Records of every turn seen while waiting that did not carry the token.
    pub skipped: Vec<Vec<Record>>,
    /// Oldest skipped batches discarded once the retention cap was hit.
    pub dropped: usize,
}

impl Response {
    pub fn record(&self) -> &Record {
        &self.message.records[self.index]
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FrameInfo {
    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
    pub variables: Vec<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThreadInfo {
    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
    pub stack: Vec<FrameInfo>,
}

impl ThreadInfo {
    pub fn id(&self) -> Option<&str> {
        self.fields.get("id").and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ThreadSnapshot {
    pub threads: Vec<ThreadInfo>,
    pub skipped: Vec<Vec<Record>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FrameVariables {
    pub variables: Vec<Value>,
    pub skipped: Vec<Vec<Record>>,
}
