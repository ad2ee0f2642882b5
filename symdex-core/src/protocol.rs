//! Wire format between the host proxy and the worker process
//!
//! Every message is one line of JSON. A request names an operation and
//! carries positional `args` plus keyword `kwargs`; the response carries
//! either `{"ok": value}` or `{"err": {"kind", "message"}}`. Both sides
//! stamp `v` with [`PROTOCOL_VERSION`] and reject anything else.

use crate::error::{ErrorEnvelope, SymdexError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::io::{BufRead, Write};

pub const PROTOCOL_VERSION: u32 = 1;

/// The closed set of operations a worker serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    SetDatabases,
    BeginFileProcessing,
    EndFileProcessing,
    ProcessFile,
    QueryOccurrences,
    QueryMembers,
    QueryPackages,
    Commit,
}

impl Operation {
    pub const ALL: [Operation; 8] = [
        Operation::SetDatabases,
        Operation::BeginFileProcessing,
        Operation::EndFileProcessing,
        Operation::ProcessFile,
        Operation::QueryOccurrences,
        Operation::QueryMembers,
        Operation::QueryPackages,
        Operation::Commit,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Operation::SetDatabases => "set_databases",
            Operation::BeginFileProcessing => "begin_file_processing",
            Operation::EndFileProcessing => "end_file_processing",
            Operation::ProcessFile => "process_file",
            Operation::QueryOccurrences => "query_occurrences",
            Operation::QueryMembers => "query_members",
            Operation::QueryPackages => "query_packages",
            Operation::Commit => "commit",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.name() == name)
    }

    /// Parameter names in positional order
    pub fn params(self) -> &'static [&'static str] {
        match self {
            Operation::SetDatabases => &["paths"],
            Operation::BeginFileProcessing => &["dbi"],
            Operation::EndFileProcessing => &["dbi", "prune"],
            Operation::ProcessFile => &["dbi", "path", "force"],
            Operation::QueryOccurrences => &["symbol"],
            Operation::QueryMembers => &["package", "prefix"],
            Operation::QueryPackages => &["prefix"],
            Operation::Commit => &[],
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Messages that carry a protocol version
pub trait Message: Serialize + DeserializeOwned {
    fn version(&self) -> u32;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub v: u32,
    /// Operation name; kept as text so unknown names can be answered
    pub op: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub kwargs: Map<String, Value>,
}

impl Message for Request {
    fn version(&self) -> u32 {
        self.v
    }
}

impl Request {
    pub fn new(op: Operation, args: Vec<Value>) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            op: op.name().to_string(),
            args,
            kwargs: Map::new(),
        }
    }

    pub fn with_kwarg(mut self, name: &str, value: Value) -> Self {
        self.kwargs.insert(name.to_string(), value);
        self
    }

    /// Resolve the operation and check the arguments fit its parameters
    pub fn operation(&self) -> crate::Result<Operation> {
        let op = Operation::from_name(&self.op)
            .ok_or_else(|| SymdexError::UnknownOperation(self.op.clone()))?;
        let params = op.params();

        if self.args.len() > params.len() {
            return Err(invalid(
                op,
                format!(
                    "takes at most {} positional arguments, got {}",
                    params.len(),
                    self.args.len()
                ),
            ));
        }
        for name in self.kwargs.keys() {
            match params.iter().position(|p| *p == name.as_str()) {
                None => return Err(invalid(op, format!("unexpected keyword argument '{}'", name))),
                Some(i) if i < self.args.len() => {
                    return Err(invalid(op, format!("argument '{}' given twice", name)))
                }
                Some(_) => {}
            }
        }
        Ok(op)
    }

    fn lookup(&self, op: Operation, name: &str) -> Option<&Value> {
        let index = op.params().iter().position(|p| *p == name)?;
        self.args.get(index).or_else(|| self.kwargs.get(name))
    }

    /// Required argument `name`, positional or keyword
    pub fn get<T: DeserializeOwned>(&self, op: Operation, name: &str) -> crate::Result<T> {
        self.get_opt(op, name)?
            .ok_or_else(|| invalid(op, format!("missing argument '{}'", name)))
    }

    /// Optional argument `name`; absent and `null` both yield `None`
    pub fn get_opt<T: DeserializeOwned>(&self, op: Operation, name: &str) -> crate::Result<Option<T>> {
        match self.lookup(op, name) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| invalid(op, format!("argument '{}': {}", name, e))),
        }
    }
}

fn invalid(op: Operation, message: String) -> SymdexError {
    SymdexError::InvalidArguments {
        operation: op.name().to_string(),
        message,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Ok(Value),
    Err(ErrorEnvelope),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub v: u32,
    pub result: Outcome,
}

impl Message for Response {
    fn version(&self) -> u32 {
        self.v
    }
}

impl Response {
    pub fn ok(value: Value) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            result: Outcome::Ok(value),
        }
    }

    pub fn err(error: &SymdexError) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            result: Outcome::Err(error.to_envelope()),
        }
    }

    /// The result value, or the remote failure rebuilt as a [`SymdexError`]
    pub fn into_result(self) -> crate::Result<Value> {
        match self.result {
            Outcome::Ok(value) => Ok(value),
            Outcome::Err(envelope) => Err(SymdexError::from_envelope(envelope)),
        }
    }
}

/// Encode one message as a single line without the terminator
pub fn encode<T: Message>(message: &T) -> crate::Result<String> {
    Ok(serde_json::to_string(message)?)
}

/// Decode one line (terminator already stripped) and check its version
pub fn decode<T: Message>(line: &str) -> crate::Result<T> {
    let message: T = serde_json::from_str(line)
        .map_err(|e| SymdexError::ProtocolCorruption(format!("malformed message: {}", e)))?;
    if message.version() != PROTOCOL_VERSION {
        return Err(SymdexError::ProtocolCorruption(format!(
            "protocol version {} (expected {})",
            message.version(),
            PROTOCOL_VERSION
        )));
    }
    Ok(message)
}

/// Write one message and flush it
pub fn write_message<W: Write, T: Message>(writer: &mut W, message: &T) -> crate::Result<()> {
    let mut line = encode(message)?;
    line.push('\n');
    writer.write_all(line.as_bytes())?;
    writer.flush()?;
    Ok(())
}

/// Read one message.
///
/// `Ok(None)` means the peer closed the stream cleanly between messages.
/// A stream ending mid-line, bytes that are not UTF-8, or JSON that does
/// not decode are all [`SymdexError::ProtocolCorruption`].
pub fn read_message<R: BufRead, T: Message>(reader: &mut R) -> crate::Result<Option<T>> {
    let mut buf = Vec::new();
    if reader.read_until(b'\n', &mut buf)? == 0 {
        return Ok(None);
    }
    if buf.pop() != Some(b'\n') {
        return Err(SymdexError::ProtocolCorruption(format!(
            "stream ended inside a message after {} bytes",
            buf.len() + 1
        )));
    }
    let line = std::str::from_utf8(&buf)
        .map_err(|e| SymdexError::ProtocolCorruption(format!("message is not UTF-8: {}", e)))?;
    decode(line).map(Some)
}
