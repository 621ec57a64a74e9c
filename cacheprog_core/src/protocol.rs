//! Wire types for the cache protocol.
//!
//! The build tool writes a stream of [`Request`] JSON values to the cache
//! program's stdin and reads [`Response`] values from its stdout. Byte arrays
//! travel as base64 strings.

use crate::hash::HashId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Commands advertised in the handshake.
pub const KNOWN_COMMANDS: [&str; 3] = ["get", "put", "close"];

/// A request verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    Get,
    Put,
    Close,
    /// Any verb this backend does not implement.
    #[default]
    #[serde(other)]
    Unknown,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Get => "get",
            Command::Put => "put",
            Command::Close => "close",
            Command::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request from the build tool.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Request {
    #[serde(rename = "ID", alias = "id")]
    pub id: i64,

    #[serde(rename = "Command", alias = "command", default)]
    pub command: Command,

    #[serde(rename = "ActionID", alias = "action_id", default)]
    pub action_id: Option<HashId>,

    /// Only set for `put`.
    #[serde(rename = "OutputID", alias = "output_id", default)]
    pub output_id: Option<HashId>,

    /// Length of the body value that follows a `put`, if positive.
    #[serde(rename = "BodySize", alias = "body_size", default)]
    pub body_size: i64,

    /// Filled in by the decoder from the value following the request.
    #[serde(skip)]
    pub body: Vec<u8>,
}

impl Request {
    /// Whether a body value follows this request on the stream.
    pub fn expects_body(&self) -> bool {
        self.command == Command::Put && self.body_size > 0
    }
}

/// A response to the build tool.
///
/// Empty fields are omitted from the JSON, apart from `ID`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Response {
    #[serde(rename = "ID")]
    pub id: i64,

    #[serde(rename = "Err", skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,

    /// Only set on the handshake.
    #[serde(rename = "KnownCommands", skip_serializing_if = "Vec::is_empty")]
    pub known_commands: Vec<String>,

    #[serde(rename = "Miss", skip_serializing_if = "is_false")]
    pub miss: bool,

    #[serde(rename = "OutputID", skip_serializing_if = "Option::is_none")]
    pub output_id: Option<HashId>,

    #[serde(rename = "Size", skip_serializing_if = "is_zero")]
    pub size: u64,

    #[serde(rename = "Time", skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,

    /// Absolute path of the blob, for clients that read it directly.
    #[serde(rename = "DiskPath", skip_serializing_if = "Option::is_none")]
    pub disk_path: Option<String>,
}

impl Response {
    /// The first message of every session.
    pub fn handshake() -> Self {
        Self {
            known_commands: KNOWN_COMMANDS.iter().map(|c| c.to_string()).collect(),
            ..Self::default()
        }
    }

    /// An empty response answering request `id`.
    pub fn for_request(id: i64) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}

fn is_zero(n: &u64) -> bool {
    *n == 0
}
