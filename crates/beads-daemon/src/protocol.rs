//! Wire protocol: length-prefixed JSON frames over a local socket.
//!
//! Each frame is a little-endian `u32` byte length followed by one JSON
//! object. Requests and responses use the same framing in both
//! directions.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Upper bound on a single frame. Guards the daemon against a garbage
/// length prefix.
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// Default audit attribution when a request names no actor.
pub const DEFAULT_ACTOR: &str = "daemon";

/// A client request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Dispatch key.
    pub operation: String,

    /// Operation-specific payload.
    #[serde(default)]
    pub args: Value,

    /// Audit attribution; defaults to "daemon" when absent.
    #[serde(default)]
    pub actor: String,

    /// Optional correlation token echoed in the response.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub request_id: String,

    /// Caller working directory, for discovery.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cwd: String,

    /// Caller semantic version.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub client_version: String,

    /// Absolute database path the caller believes it is talking to.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub expected_db: String,
}

impl Request {
    /// Builds a minimal request for an operation (tests and batch use).
    pub fn new(operation: impl Into<String>, args: Value) -> Self {
        Self {
            operation: operation.into(),
            args,
            actor: String::new(),
            request_id: String::new(),
            cwd: String::new(),
            client_version: String::new(),
            expected_db: String::new(),
        }
    }

    /// The actor to attribute mutations to.
    pub fn actor(&self) -> &str {
        if self.actor.is_empty() {
            DEFAULT_ACTOR
        } else {
            &self.actor
        }
    }
}

/// Error payload surfaced to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseError {
    /// Stable error kind (e.g. "validation", "cycle", "mismatch").
    pub kind: String,
    /// Human-readable message.
    pub message: String,
}

/// A server response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub success: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub request_id: String,
}

impl Response {
    /// A successful response carrying `data`.
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            request_id: String::new(),
        }
    }

    /// A failed response with an error kind and message.
    pub fn err(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ResponseError {
                kind: kind.into(),
                message: message.into(),
            }),
            request_id: String::new(),
        }
    }

    /// Attaches the request's correlation token.
    pub fn with_request_id(mut self, request_id: &str) -> Self {
        self.request_id = request_id.to_string();
        self
    }
}

/// Writes one length-prefixed JSON frame.
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, value: &T) -> std::io::Result<()> {
    let buf = serde_json::to_vec(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    writer.write_all(&(buf.len() as u32).to_le_bytes())?;
    writer.write_all(&buf)?;
    writer.flush()?;
    Ok(())
}

/// Reads one length-prefixed JSON frame. Returns `Ok(None)` on a clean
/// EOF at a frame boundary.
pub fn read_frame<R: Read, T: for<'de> Deserialize<'de>>(
    reader: &mut R,
) -> std::io::Result<Option<T>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }

    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf)?;
    let value = serde_json::from_slice(&buf)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn frame_roundtrip() {
        let req = Request {
            operation: "create".into(),
            args: json!({"title": "New issue"}),
            actor: "alice".into(),
            request_id: "r-1".into(),
            cwd: "/work".into(),
            client_version: "1.2.3".into(),
            expected_db: "/work/.beads/beads.db".into(),
        };

        let mut buf = Vec::new();
        write_frame(&mut buf, &req).unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let back: Request = read_frame(&mut cursor).unwrap().unwrap();
        assert_eq!(back.operation, "create");
        assert_eq!(back.actor, "alice");
        assert_eq!(back.client_version, "1.2.3");

        // Clean EOF after the only frame.
        let end: Option<Request> = read_frame(&mut cursor).unwrap();
        assert!(end.is_none());
    }

    #[test]
    fn multiple_frames_in_sequence() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Response::ok(json!({"n": 1}))).unwrap();
        write_frame(&mut buf, &Response::err("validation", "bad")).unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let first: Response = read_frame(&mut cursor).unwrap().unwrap();
        let second: Response = read_frame(&mut cursor).unwrap().unwrap();
        assert!(first.success);
        assert!(!second.success);
        assert_eq!(second.error.unwrap().kind, "validation");
    }

    #[test]
    fn oversized_frame_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_FRAME_LEN + 1).to_le_bytes());
        let mut cursor = std::io::Cursor::new(buf);
        let err = read_frame::<_, Request>(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn default_actor() {
        let req = Request::new("ping", Value::Null);
        assert_eq!(req.actor(), "daemon");
        let mut named = Request::new("ping", Value::Null);
        named.actor = "worker-3".into();
        assert_eq!(named.actor(), "worker-3");
    }
}
