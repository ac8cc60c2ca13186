//! Shared wire protocol for the session worker boundary.
//!
//! Requests and responses cross a process-local duplex channel as
//! length-prefixed JSON frames. The shapes here are the single source of
//! truth for both ends; they must stay bit-for-bit reproducible.

use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const SESSION_FILE_NAME: &str = "session.json";
pub const CONTRACT_STATE_DIR: &str = "contract_state";
pub const RUN_STATE_DIR: &str = "run_state";

pub const SHUTDOWN_COMMAND: &str = "__shutdown__";

pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

pub const DEFAULT_SIGNER: &str = "demo";

/// Environment keys the session service recognizes, in display order.
pub const ENVIRONMENT_KEYS: [&str; 4] = ["signer", "now", "block_num", "block_hash"];

pub fn default_environment() -> Map<String, Value> {
    let mut env = Map::new();
    env.insert("signer".to_string(), Value::from(DEFAULT_SIGNER));
    env.insert("now".to_string(), Value::from("2024-02-01T12:30:00"));
    env.insert("block_num".to_string(), Value::from("100"));
    env.insert("block_hash".to_string(), Value::from("0xabc..."));
    env
}

/// One command invocation: `(command, positional args, keyword args)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request(String, Vec<Value>, Map<String, Value>);

impl Request {
    pub fn new(
        command: impl Into<String>,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Self {
        Request(command.into(), args, kwargs)
    }

    pub fn shutdown() -> Self {
        Request(SHUTDOWN_COMMAND.to_string(), Vec::new(), Map::new())
    }

    pub fn command(&self) -> &str {
        &self.0
    }

    pub fn args(&self) -> &[Value] {
        &self.1
    }

    pub fn kwargs(&self) -> &Map<String, Value> {
        &self.2
    }

    pub fn is_shutdown(&self) -> bool {
        self.0 == SHUTDOWN_COMMAND
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    Error,
}

/// One command result: `(status, payload)`. On `error` the payload is a
/// [`RemoteExceptionPayload`] in its raw JSON form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response(Status, Value);

impl Response {
    pub fn ok(payload: Value) -> Self {
        Response(Status::Ok, payload)
    }

    pub fn error(payload: &RemoteExceptionPayload) -> Self {
        let raw = serde_json::to_value(payload).unwrap_or_else(|_| {
            Value::String(format!("{}: {}", payload.exc_type, payload.message))
        });
        Response(Status::Error, raw)
    }

    pub fn status(&self) -> Status {
        self.0
    }

    pub fn payload(&self) -> &Value {
        &self.1
    }

    pub fn into_payload(self) -> Value {
        self.1
    }
}

/// Serializable snapshot of a failure raised inside a worker. Owns no
/// reference into the worker process; stays valid after the worker dies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteExceptionPayload {
    pub exc_type: String,
    #[serde(default)]
    pub exc_module: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub traceback: String,
}

impl RemoteExceptionPayload {
    pub fn new(
        exc_type: impl Into<String>,
        exc_module: impl Into<String>,
        message: impl Into<String>,
        traceback: impl Into<String>,
    ) -> Self {
        RemoteExceptionPayload {
            exc_type: exc_type.into(),
            exc_module: exc_module.into(),
            message: message.into(),
            traceback: traceback.into(),
        }
    }

    /// Decode an error payload defensively. Accepts the canonical object
    /// form, the legacy `[type, message]` pair, and falls back to
    /// stringifying anything else.
    pub fn from_raw(raw: &Value) -> Self {
        if let Value::Object(map) = raw {
            let field = |key: &str| -> String {
                match map.get(key) {
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                    None => String::new(),
                }
            };
            let exc_type = match map.get("exc_type") {
                Some(Value::String(s)) if !s.is_empty() => s.clone(),
                _ => "Exception".to_string(),
            };
            return RemoteExceptionPayload {
                exc_type,
                exc_module: field("exc_module"),
                message: field("message"),
                traceback: field("traceback"),
            };
        }

        if let Value::Array(items) = raw {
            if items.len() == 2 {
                let text = |v: &Value| -> String {
                    match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    }
                };
                return RemoteExceptionPayload {
                    exc_type: text(&items[0]),
                    exc_module: String::new(),
                    message: text(&items[1]),
                    traceback: String::new(),
                };
            }
        }

        let message = match raw {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        RemoteExceptionPayload {
            exc_type: "Exception".to_string(),
            exc_module: String::new(),
            message,
            traceback: String::new(),
        }
    }

    /// The remote traceback, or a synthesized `Type: message` line when the
    /// worker sent none.
    pub fn pretty_traceback(&self) -> String {
        if self.traceback.is_empty() {
            format!("{}: {}", self.exc_type, self.message)
        } else {
            self.traceback.clone()
        }
    }
}

/// Export metadata for one deployed contract function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportInfo {
    pub name: String,
    #[serde(default)]
    pub docstring: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractDetails {
    pub name: String,
    pub source: String,
    pub exports: Vec<ExportInfo>,
}

pub fn write_frame(writer: &mut impl Write, payload: &[u8]) -> io::Result<()> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "frame too large"));
    }
    let len: u32 = payload
        .len()
        .try_into()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "frame too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(payload)?;
    writer.flush()
}

/// Read one frame. Returns `Ok(None)` on a clean EOF between frames; EOF
/// inside a frame is an error.
pub fn read_frame(reader: &mut impl Read) -> io::Result<Option<Vec<u8>>> {
    let mut header = [0u8; 4];
    if !read_exact_or_eof(reader, &mut header)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "frame too large"));
    }
    let mut payload = vec![0u8; len];
    if len != 0 {
        reader.read_exact(&mut payload)?;
    }
    Ok(Some(payload))
}

fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    let mut off = 0usize;
    while off < buf.len() {
        let n = reader.read(&mut buf[off..])?;
        if n == 0 {
            if off == 0 {
                return Ok(false);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "unexpected EOF inside frame",
            ));
        }
        off += n;
    }
    Ok(true)
}

pub fn write_message<T: Serialize>(writer: &mut impl Write, message: &T) -> io::Result<()> {
    let payload = serde_json::to_vec(message)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    write_frame(writer, &payload)
}

pub fn read_message<T: for<'de> Deserialize<'de>>(
    reader: &mut impl Read,
) -> io::Result<Option<T>> {
    let Some(payload) = read_frame(reader)? else {
        return Ok(None);
    };
    let message = serde_json::from_slice(&payload)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    Ok(Some(message))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_wire_shape_is_a_three_tuple() {
        let mut kwargs = Map::new();
        kwargs.insert("show_internal".to_string(), Value::Bool(true));
        let req = Request::new("dump_state", vec![Value::from("x")], kwargs);
        let encoded = serde_json::to_string(&req).unwrap();
        assert_eq!(encoded, r#"["dump_state",["x"],{"show_internal":true}]"#);

        let decoded: Request = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.command(), "dump_state");
        assert_eq!(decoded.args(), &[Value::from("x")]);
    }

    #[test]
    fn shutdown_request_round_trip() {
        let encoded = serde_json::to_string(&Request::shutdown()).unwrap();
        assert_eq!(encoded, r#"["__shutdown__",[],{}]"#);
        let decoded: Request = serde_json::from_str(&encoded).unwrap();
        assert!(decoded.is_shutdown());
    }

    #[test]
    fn response_wire_shape_is_a_two_tuple() {
        let ok = serde_json::to_string(&Response::ok(Value::Null)).unwrap();
        assert_eq!(ok, r#"["ok",null]"#);

        let payload = RemoteExceptionPayload::new("ValueError", "service", "boom", "");
        let err = serde_json::to_value(Response::error(&payload)).unwrap();
        assert_eq!(err[0], "error");
        assert_eq!(err[1]["exc_type"], "ValueError");
        assert_eq!(err[1]["message"], "boom");
    }

    #[test]
    fn from_raw_accepts_canonical_object() {
        let raw = serde_json::json!({
            "exc_type": "ValueError",
            "exc_module": "service",
            "message": "boom",
            "traceback": "trace",
        });
        let payload = RemoteExceptionPayload::from_raw(&raw);
        assert_eq!(payload.exc_type, "ValueError");
        assert_eq!(payload.exc_module, "service");
        assert_eq!(payload.message, "boom");
        assert_eq!(payload.pretty_traceback(), "trace");
    }

    #[test]
    fn from_raw_accepts_legacy_pair() {
        let raw = serde_json::json!(["AttributeError", "Unknown command 'frobnicate'"]);
        let payload = RemoteExceptionPayload::from_raw(&raw);
        assert_eq!(payload.exc_type, "AttributeError");
        assert_eq!(payload.message, "Unknown command 'frobnicate'");
        assert_eq!(payload.traceback, "");
    }

    #[test]
    fn from_raw_stringifies_unknown_shapes() {
        let payload = RemoteExceptionPayload::from_raw(&Value::from(42));
        assert_eq!(payload.exc_type, "Exception");
        assert_eq!(payload.message, "42");
    }

    #[test]
    fn pretty_traceback_synthesizes_when_absent() {
        let payload = RemoteExceptionPayload::new("Exception", "", "boom", "");
        assert_eq!(payload.pretty_traceback(), "Exception: boom");
    }

    #[test]
    fn frame_round_trip() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"hello").unwrap();
        write_frame(&mut buf, b"").unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        assert_eq!(read_frame(&mut cursor).unwrap().unwrap(), b"hello");
        assert_eq!(read_frame(&mut cursor).unwrap().unwrap(), b"");
        assert!(read_frame(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn oversized_frame_is_rejected_on_read() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_FRAME_LEN as u32 + 1).to_le_bytes());
        let mut cursor = std::io::Cursor::new(buf);
        let err = read_frame(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn eof_inside_frame_is_an_error() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&8u32.to_le_bytes());
        buf.extend_from_slice(b"abc");
        let mut cursor = std::io::Cursor::new(buf);
        let err = read_frame(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn message_round_trip() {
        let mut buf = Vec::new();
        write_message(&mut buf, &Request::new("list_contracts", vec![], Map::new())).unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let decoded: Request = read_message(&mut cursor).unwrap().unwrap();
        assert_eq!(decoded.command(), "list_contracts");
    }

    #[test]
    fn default_environment_covers_the_allow_list() {
        let env = default_environment();
        for key in ENVIRONMENT_KEYS {
            assert!(env.contains_key(key), "missing default for {key}");
        }
        assert_eq!(env["signer"], DEFAULT_SIGNER);
    }
}
