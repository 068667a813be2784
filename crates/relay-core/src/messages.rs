//! Wire message types.
//!
//! Text frames carry a JSON envelope discriminated by a kebab-case `kind`
//! field. Requests always carry a positive `id`; responses carry an optional
//! `requestId` that ties them back to the originating request. Binary frames
//! have no envelope at all: the correlation lives on [`BinaryResponse`] and
//! never reaches the wire.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::ids::RequestId;

/// `requestId` used for notifications that must not correlate to anything.
pub const BAD_REQUEST_ID: i64 = -1;

// ─────────────────────────────────────────────────────────────────────────────
// Requests
// ─────────────────────────────────────────────────────────────────────────────

/// A decoded client request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// Client-assigned id, unique among the client's outstanding calls.
    pub id: RequestId,
    /// Kind discriminator plus kind-specific fields.
    #[serde(flatten)]
    pub kind: RequestKind,
}

/// Request kinds understood by the relay.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum RequestKind {
    /// Liveness probe answered with [`ResponseBody::Pong`].
    Ping,
    /// List the roots the daemon is watching.
    ListWatches,
    /// List the entries of a directory below a watched root.
    ListFiles {
        /// Watched root.
        root: String,
        /// Relative directory inside the root.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prefix: Option<String>,
    },
    /// Fetch a file's contents as a binary frame.
    GetFile {
        /// Watched root.
        root: String,
        /// Relative file path inside the root.
        path: String,
    },
}

impl RequestKind {
    /// Every `kind` value accepted on the wire.
    pub const KINDS: &'static [&'static str] = &["ping", "list-watches", "list-files", "get-file"];

    /// Wire name of this kind.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::ListWatches => "list-watches",
            Self::ListFiles { .. } => "list-files",
            Self::GetFile { .. } => "get-file",
        }
    }
}

impl Request {
    /// Build a request.
    #[must_use]
    pub fn new(id: RequestId, kind: RequestKind) -> Self {
        Self { id, kind }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Responses
// ─────────────────────────────────────────────────────────────────────────────

/// A directory entry in a [`ResponseBody::FileList`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    /// Entry name (no directory component).
    pub name: String,
    /// Whether the entry is a directory.
    pub is_dir: bool,
    /// Size in bytes (0 for directories).
    pub size: u64,
}

/// A text response produced by business logic.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Originating request id. Absent or `<= 0` means "no originating request".
    #[serde(rename = "requestId", default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<i64>,
    /// Kind discriminator plus kind-specific fields.
    #[serde(flatten)]
    pub body: ResponseBody,
}

/// Response kinds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ResponseBody {
    /// Answer to [`RequestKind::Ping`].
    Pong,
    /// Watched roots.
    WatchList {
        /// Root paths.
        watches: Vec<String>,
    },
    /// Directory listing.
    FileList {
        /// Root the listing belongs to.
        root: String,
        /// Entries, sorted by name.
        files: Vec<FileEntry>,
    },
    /// Announces the binary frame that follows for the same request.
    FileInfo {
        /// Relative path of the file.
        path: String,
        /// Size of the binary frame in bytes.
        size: u64,
    },
    /// Request-specific failure.
    Error {
        /// Human-readable reason.
        message: String,
    },
    /// Unsolicited, system-wide notice.
    Notification {
        /// Human-readable text.
        message: String,
    },
    /// The client sent something that could not be decoded.
    BadRequest {
        /// Human-readable reason.
        message: String,
    },
}

impl Response {
    /// Response to a specific request.
    #[must_use]
    pub fn reply(request_id: RequestId, body: ResponseBody) -> Self {
        Self {
            request_id: Some(request_id.get()),
            body,
        }
    }

    /// Response with no originating request; delivered to every client.
    #[must_use]
    pub fn broadcast(body: ResponseBody) -> Self {
        Self {
            request_id: None,
            body,
        }
    }

    /// Notification for an undecodable inbound frame. Carries the sentinel
    /// [`BAD_REQUEST_ID`], so it never correlates.
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            request_id: Some(BAD_REQUEST_ID),
            body: ResponseBody::BadRequest {
                message: message.into(),
            },
        }
    }

    /// The request this response answers, if any.
    ///
    /// `None` when `requestId` is absent or not positive.
    #[must_use]
    pub fn correlation(&self) -> Option<RequestId> {
        self.request_id.and_then(RequestId::new)
    }

    /// Wire name of the body kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self.body {
            ResponseBody::Pong => "pong",
            ResponseBody::WatchList { .. } => "watch-list",
            ResponseBody::FileList { .. } => "file-list",
            ResponseBody::FileInfo { .. } => "file-info",
            ResponseBody::Error { .. } => "error",
            ResponseBody::Notification { .. } => "notification",
            ResponseBody::BadRequest { .. } => "bad-request",
        }
    }
}

/// Raw bytes destined for the connection that sent `request_id`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BinaryResponse {
    /// Originating request. Binary payloads are never broadcast.
    pub request_id: RequestId,
    /// Frame payload.
    pub data: Bytes,
}

impl BinaryResponse {
    /// Build a binary response.
    #[must_use]
    pub fn new(request_id: RequestId, data: impl Into<Bytes>) -> Self {
        Self {
            request_id,
            data: data.into(),
        }
    }
}

/// Anything business logic hands back to the transport.
#[derive(Clone, Debug, PartialEq)]
pub enum Outbound {
    /// Serialized into a text frame.
    Text(Response),
    /// Sent verbatim as a binary frame.
    Binary(BinaryResponse),
}

impl From<Response> for Outbound {
    fn from(response: Response) -> Self {
        Self::Text(response)
    }
}

impl From<BinaryResponse> for Outbound {
    fn from(response: BinaryResponse) -> Self {
        Self::Binary(response)
    }
}
