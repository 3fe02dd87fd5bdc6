//! Update operators and the descriptors that carry them.
//!
//! An [`UpdateDescriptor`] is what a request handler hands to
//! [`DataCollection::apply_op_by_id`](crate::DataCollection::apply_op_by_id). The very same descriptor is sent to the
//! persistence adapter and replayed against the cached copy, so the semantics below are the contract both sides must
//! follow:
//!
//! | Operator | Accepted names | Effect |
//! | -------- | -------------- | ------ |
//! | [`Unset`](UpdateOp::Unset) | `unset` | remove the attribute; no-op when absent |
//! | [`Set`](UpdateOp::Set) | `set` | assign, creating intermediate mappings |
//! | [`Inc`](UpdateOp::Inc) | `inc` | numeric increment, absent counts as 0 |
//! | [`Add`](UpdateOp::Add) | `add`, `addToSet` | append elements not already present (set union) |
//! | [`Push`](UpdateOp::Push) | `push`, `pushOnto` | append elements unconditionally |
//! | [`Pull`](UpdateOp::Pull) | `pull` | remove every occurrence of the elements |
//!
//! Operators always run in the order of the table, whatever order the descriptor was written in. An array operand of
//! `add`, `push` or `pull` stands for its elements.

use std::fmt::Display;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Number;
use serde_json::Value;
use strum::EnumIter;
use strum::EnumString;

use crate::error::Error;
use crate::error::Result;
use crate::path;
use crate::path::Path;
use crate::types::Document;
use crate::types::ID_FIELD;

/// Operator names. Declaration order is application order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, strum::Display, EnumString, EnumIter)]
#[strum(serialize_all = "camelCase")]
pub enum OpKind {
    Unset,
    Set,
    Inc,
    #[strum(to_string = "add", serialize = "addToSet")]
    Add,
    #[strum(to_string = "push", serialize = "pushOnto")]
    Push,
    Pull,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOp {
    Unset { path: Path },
    Set { path: Path, value: Value },
    Inc { path: Path, by: Number },
    Add { path: Path, values: Vec<Value> },
    Push { path: Path, values: Vec<Value> },
    Pull { path: Path, values: Vec<Value> },
}

impl UpdateOp {
    pub fn new(kind: OpKind, path: Path, operand: Value) -> Result<Self> {
        if path.root() == ID_FIELD {
            return Err(Error::InvalidOperator(format!(
                "'{ID_FIELD}' is immutable and cannot be the target of '{kind}'"
            )));
        }

        Ok(match kind {
            OpKind::Unset => Self::Unset { path },
            OpKind::Set => Self::Set { path, value: operand },
            OpKind::Inc => match operand {
                Value::Number(by) => Self::Inc { path, by },
                other => {
                    return Err(Error::InvalidOperator(format!(
                        "'inc' of '{path}' needs a number, got {}",
                        path::kind_of(&other)
                    )))
                }
            },
            OpKind::Add => Self::Add {
                path,
                values: elements(operand),
            },
            OpKind::Push => Self::Push {
                path,
                values: elements(operand),
            },
            OpKind::Pull => Self::Pull {
                path,
                values: elements(operand),
            },
        })
    }

    pub fn kind(&self) -> OpKind {
        match self {
            Self::Unset { .. } => OpKind::Unset,
            Self::Set { .. } => OpKind::Set,
            Self::Inc { .. } => OpKind::Inc,
            Self::Add { .. } => OpKind::Add,
            Self::Push { .. } => OpKind::Push,
            Self::Pull { .. } => OpKind::Pull,
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            Self::Unset { path }
            | Self::Set { path, .. }
            | Self::Inc { path, .. }
            | Self::Add { path, .. }
            | Self::Push { path, .. }
            | Self::Pull { path, .. } => path,
        }
    }

    // May leave `doc` half-updated on error; UpdateDescriptor::apply works on a scratch copy for that reason.
    fn apply(&self, doc: &mut Document) -> Result<()> {
        match self {
            Self::Unset { path } => {
                path::unset(doc, path);
            }
            Self::Set { path, value } => {
                path::set(doc, path, value.clone())?;
            }
            Self::Inc { path, by } => {
                let next = match path::get(doc, path) {
                    None => by.clone(),
                    Some(Value::Number(current)) => sum(path, current, by)?,
                    Some(other) => return Err(mismatch(path, "number", other)),
                };
                path::set(doc, path, Value::Number(next))?;
            }
            Self::Add { path, values } => {
                let seq = sequence_at(doc, path)?;
                for value in values {
                    if !seq.contains(value) {
                        seq.push(value.clone());
                    }
                }
            }
            Self::Push { path, values } => {
                sequence_at(doc, path)?.extend(values.iter().cloned());
            }
            Self::Pull { path, values } => match path::get_mut(doc, path) {
                None => (),
                Some(Value::Array(seq)) => seq.retain(|v| !values.contains(v)),
                Some(other) => return Err(mismatch(path, "array", other)),
            },
        }
        Ok(())
    }
}

fn elements(operand: Value) -> Vec<Value> {
    match operand {
        Value::Array(values) => values,
        single => vec![single],
    }
}

fn mismatch(path: &Path, expected: &'static str, found: &Value) -> Error {
    Error::TypeMismatch {
        path: path.to_string(),
        expected,
        found: path::kind_of(found),
    }
}

// Integers stay integers unless they overflow; anything involving a float is a float.
fn sum(path: &Path, a: &Number, b: &Number) -> Result<Number> {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        if let Some(s) = x.checked_add(y) {
            return Ok(Number::from(s));
        }
    }
    let (Some(x), Some(y)) = (a.as_f64(), b.as_f64())
    else {
        return Err(Error::InvalidOperator(format!("cannot increment '{path}' by {b}")));
    };
    Number::from_f64(x + y).ok_or_else(|| Error::InvalidOperator(format!("increment of '{path}' is not finite")))
}

fn sequence_at<'a>(doc: &'a mut Document, path: &Path) -> Result<&'a mut Vec<Value>> {
    if path::get(doc, path).is_none() {
        path::set(doc, path, Value::Array(Vec::new()))?;
    }
    match path::get_mut(doc, path) {
        Some(Value::Array(seq)) => Ok(seq),
        Some(other) => Err(mismatch(path, "array", other)),
        None => Err(Error::InvalidOperator(format!("cannot create a sequence at '{path}'"))),
    }
}

/// A partial update: a list of operators kept in application order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct UpdateDescriptor {
    ops: Vec<UpdateOp>,
}

impl UpdateDescriptor {
    pub fn new() -> Self {
        Self::default()
    }

    /// A top-level `set` of every attribute.
    pub fn set_attributes(attributes: Document) -> Result<Self> {
        let mut update = Self::new();
        for (name, value) in attributes {
            update.push_op(UpdateOp::new(OpKind::Set, Path::parse(&name)?, value)?);
        }
        Ok(update)
    }

    pub fn from_json(value: &Value) -> Result<Self> {
        let Value::Object(body) = value
        else {
            return Err(Error::InvalidOperator(format!(
                "update descriptor must be an object, got {}",
                path::kind_of(value)
            )));
        };

        let mut update = Self::new();
        for (name, operands) in body {
            let kind = OpKind::from_str(name.strip_prefix('$').unwrap_or(name))
                .map_err(|_| Error::InvalidOperator(format!("unknown operator '{name}'")))?;
            let Value::Object(operands) = operands
            else {
                return Err(Error::InvalidOperator(format!(
                    "'{kind}' expects an object of path/operand pairs, got {}",
                    path::kind_of(operands)
                )));
            };
            for (raw_path, operand) in operands {
                update.push_op(UpdateOp::new(kind, Path::parse(raw_path)?, operand.clone())?);
            }
        }
        Ok(update)
    }

    /// Inserts `op` after every operator that runs before or together with it.
    pub fn push_op(&mut self, op: UpdateOp) {
        let at = self.ops.partition_point(|o| o.kind() <= op.kind());
        self.ops.insert(at, op);
    }

    pub fn with(mut self, kind: OpKind, path: &str, operand: impl Into<Value>) -> Result<Self> {
        self.push_op(UpdateOp::new(kind, Path::parse(path)?, operand.into())?);
        Ok(self)
    }

    pub fn set(self, path: &str, value: impl Into<Value>) -> Result<Self> {
        self.with(OpKind::Set, path, value)
    }

    pub fn unset(self, path: &str) -> Result<Self> {
        self.with(OpKind::Unset, path, Value::Bool(true))
    }

    pub fn inc(self, path: &str, by: impl Into<Value>) -> Result<Self> {
        self.with(OpKind::Inc, path, by)
    }

    pub fn add(self, path: &str, value: impl Into<Value>) -> Result<Self> {
        self.with(OpKind::Add, path, value)
    }

    pub fn push(self, path: &str, value: impl Into<Value>) -> Result<Self> {
        self.with(OpKind::Push, path, value)
    }

    pub fn pull(self, path: &str, value: impl Into<Value>) -> Result<Self> {
        self.with(OpKind::Pull, path, value)
    }

    pub fn ops(&self) -> &[UpdateOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Applies all operators to `doc`. Either all of them take effect or, on error, none does.
    pub fn apply(&self, doc: &mut Document) -> Result<()> {
        let mut scratch = doc.clone();
        for op in &self.ops {
            op.apply(&mut scratch)?;
        }
        *doc = scratch;
        Ok(())
    }

    /// The descriptor in its JSON form: `{"set": {"a.b": 1}, "pull": {"list": [4]}}`.
    pub fn to_json(&self) -> Value {
        let mut body = Document::new();
        for op in &self.ops {
            let operands = body
                .entry(op.kind().to_string())
                .or_insert_with(|| Value::Object(Document::new()));
            let Value::Object(operands) = operands
            else {
                continue;
            };
            let key = op.path().to_string();
            match op {
                UpdateOp::Unset { .. } => {
                    operands.insert(key, Value::Bool(true));
                }
                UpdateOp::Set { value, .. } => {
                    operands.insert(key, value.clone());
                }
                UpdateOp::Inc { path, by } => {
                    let total = match operands.get(&key) {
                        Some(Value::Number(prev)) => sum(path, prev, by).unwrap_or_else(|_| by.clone()),
                        _ => by.clone(),
                    };
                    operands.insert(key, Value::Number(total));
                }
                UpdateOp::Add { values, .. } | UpdateOp::Push { values, .. } | UpdateOp::Pull { values, .. } => {
                    match operands.entry(key).or_insert_with(|| Value::Array(Vec::new())) {
                        Value::Array(all) => all.extend(values.iter().cloned()),
                        other => *other = Value::Array(values.clone()),
                    }
                }
            }
        }
        Value::Object(body)
    }
}

impl TryFrom<Value> for UpdateDescriptor {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        Self::from_json(&value)
    }
}

impl From<UpdateDescriptor> for Value {
    fn from(update: UpdateDescriptor) -> Self {
        update.to_json()
    }
}

impl Display for UpdateDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_json())
    }
}
