use serde::Serialize;
use std::collections::BTreeMap;

use crate::parser::{self, ParseError};

/// Record kind, taken from the single character that precedes the body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Nature {
    Result,
    ExecAsync,
    StatusAsync,
    NotifyAsync,
    ConsoleStream,
    TargetStream,
    LogStream,
}

impl Nature {
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            '^' => Some(Self::Result),
            '*' => Some(Self::ExecAsync),
            '+' => Some(Self::StatusAsync),
            '=' => Some(Self::NotifyAsync),
            '~' => Some(Self::ConsoleStream),
            '@' => Some(Self::TargetStream),
            '&' => Some(Self::LogStream),
            _ => None,
        }
    }

    pub fn is_stream(self) -> bool {
        matches!(
            self,
            Self::ConsoleStream | Self::TargetStream | Self::LogStream
        )
    }
}

/// A value in a result or async record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    String(String),
    Tuple(BTreeMap<String, Value>),
    List(Vec<Value>),
    /// List whose entries are `name=value` results, e.g. `stack=[frame={..},frame={..}]`.
    Results(Vec<NamedValue>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NamedValue {
    pub name: String,
    pub value: Value,
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_tuple(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Self::Tuple(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_results(&self) -> Option<&[NamedValue]> {
        match self {
            Self::Results(r) => Some(r),
            _ => None,
        }
    }

    /// Field lookup on a tuple.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.as_tuple().and_then(|t| t.get(name))
    }

    /// `[]` parses as an empty value list, whichever form the producer meant.
    pub fn is_empty_list(&self) -> bool {
        match self {
            Self::List(l) => l.is_empty(),
            Self::Results(r) => r.is_empty(),
            _ => false,
        }
    }
}

/// One parsed line of MI output.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Record {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub nature: Option<Nature>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub class: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parse_error: Option<ParseError>,
    /// The raw line, kept when parsing failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_data: Option<String>,
}

impl Record {
    pub fn has_token(&self, token: &str) -> bool {
        self.token.as_deref() == Some(token)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.data.get(name)
    }

    pub fn is_error(&self) -> bool {
        self.nature == Some(Nature::Result) && self.class == "error"
    }
}

/// Execution state reported by the first exec-async record of a turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecState {
    pub class: String,
    pub reason: Option<String>,
}

/// All records received between two prompts, plus the raw text.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Message {
    pub records: Vec<Record>,
    pub raw: String,
}

impl Message {
    pub fn parse(raw: String) -> Self {
        Self {
            records: parser::parse_output(&raw),
            raw,
        }
    }

    pub fn token_index(&self, token: &str) -> Option<usize> {
        self.records.iter().position(|r| r.has_token(token))
    }

    pub fn exec_state(&self) -> Option<ExecState> {
        self.records
            .iter()
            .find(|r| r.nature == Some(Nature::ExecAsync))
            .map(|r| ExecState {
                class: r.class.clone(),
                reason: r.get("reason").and_then(Value::as_str).map(str::to_string),
            })
    }
}
