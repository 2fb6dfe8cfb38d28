use std::collections::BTreeMap;
use std::fmt;

use crate::error::{DbError, DbResult};

/// A literal argument value in a PQL call.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    Uint(u64),
    Str(String),
    Bool(bool),
    UintList(Vec<u64>),
    StrList(Vec<String>),
}

impl fmt::Display for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgValue::Uint(v) => write!(f, "{}", v),
            ArgValue::Str(s) => write!(f, "\"{}\"", s),
            ArgValue::Bool(b) => write!(f, "{}", b),
            ArgValue::UintList(vs) => {
                write!(f, "[")?;
                for (i, v) in vs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "]")
            }
            ArgValue::StrList(vs) => {
                write!(f, "[")?;
                for (i, v) in vs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "\"{}\"", v)?;
                }
                write!(f, "]")
            }
        }
    }
}

/// One function call in a query: children first, then named arguments.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Call {
    pub name: String,
    pub children: Vec<Call>,
    pub args: BTreeMap<String, ArgValue>,
}

impl Call {
    pub fn new(name: &str) -> Call {
        Call {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn arg(&self, name: &str) -> Option<&ArgValue> {
        self.args.get(name)
    }

    pub fn arg_u64(&self, name: &str) -> Option<u64> {
        match self.args.get(name) {
            Some(ArgValue::Uint(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn required_u64(&self, name: &str) -> DbResult<u64> {
        self.arg_u64(name)
            .ok_or_else(|| DbError::InvalidQuery(format!("{}() requires {}=<uint>", self.name, name)))
    }

    pub fn arg_str(&self, name: &str) -> Option<&str> {
        match self.args.get(name) {
            Some(ArgValue::Str(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn required_str(&self, name: &str) -> DbResult<&str> {
        self.arg_str(name)
            .ok_or_else(|| DbError::InvalidQuery(format!("{}() requires {}=<name>", self.name, name)))
    }

    pub fn arg_uint_list(&self, name: &str) -> Option<&[u64]> {
        match self.args.get(name) {
            Some(ArgValue::UintList(vs)) => Some(vs.as_slice()),
            _ => None,
        }
    }

    pub fn arg_str_list(&self, name: &str) -> Option<&[String]> {
        match self.args.get(name) {
            Some(ArgValue::StrList(vs)) => Some(vs.as_slice()),
            _ => None,
        }
    }

    /// Calls that mutate state and replicate to every shard owner.
    pub fn is_write(&self) -> bool {
        matches!(
            self.name.as_str(),
            "setBit" | "clearBit" | "setRowAttrs" | "setColumnAttrs"
        )
    }

    /// Calls whose per-shard results are bitmaps unioned by the reducer.
    pub fn returns_bitmap(&self) -> bool {
        matches!(
            self.name.as_str(),
            "row" | "union" | "intersect" | "difference"
        )
    }
}

impl fmt::Display for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        let mut first = true;
        for child in &self.children {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{}", child)?;
            first = false;
        }
        for (key, value) in &self.args {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{}={}", key, value)?;
            first = false;
        }
        write!(f, ")")
    }
}

/// A parsed request: one or more calls producing an ordered result array.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Query {
    pub calls: Vec<Call>,
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, call) in self.calls.iter().enumerate() {
            if i > 0 {
                write!(f, "\n")?;
            }
            write!(f, "{}", call)?;
        }
        Ok(())
    }
}
