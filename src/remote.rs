//! Remote authority client (JSON over HTTP)
//!
//! Each server capability is one method returning a [`RemoteOutcome`].
//! Every method checks connectivity first and returns
//! [`RemoteOutcome::Unreachable`] without touching the network when the link
//! is down, so offline captures fall back to the cache and the queue
//! immediately instead of waiting out a connect timeout.
//!
//! The HTTP stack itself sits behind [`Transport`]; the firmware provides one
//! built on `EspHttpConnection`.

use core::fmt;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::event_log::AttendanceRecord;
use crate::mapping::MappingEntry;
use crate::{PrimaryId, SlotId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Get => f.write_str("GET"),
            Method::Post => f.write_str("POST"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub body: Vec<u8>,
}

impl Response {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// The request could not be completed at the transport level
#[derive(Debug, thiserror::Error)]
#[error("transport failure: {0}")]
pub struct TransportError(pub String);

/// Blocking HTTP request/response with a connectivity check
pub trait Transport {
    fn is_connected(&self) -> bool;

    /// Perform one request; `path` includes any query string
    fn request(
        &mut self,
        method: Method,
        path: &str,
        body: Option<&[u8]>,
    ) -> Result<Response, TransportError>;
}

/// Why the server refused a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionKind {
    /// The request itself is bad; retrying will not help
    Validation,
    /// Server-side or rate-limit failure; retry later
    Transient,
    /// Status was fine but the body could not be understood
    Malformed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejection {
    pub status: Option<u16>,
    pub kind: RejectionKind,
}

impl Rejection {
    fn from_status(status: u16) -> Self {
        let kind = match status {
            408 | 429 => RejectionKind::Transient,
            400..=499 => RejectionKind::Validation,
            _ => RejectionKind::Transient,
        };
        Self {
            status: Some(status),
            kind,
        }
    }

    fn malformed(status: u16) -> Self {
        Self {
            status: Some(status),
            kind: RejectionKind::Malformed,
        }
    }

    pub fn is_permanent(&self) -> bool {
        self.kind == RejectionKind::Validation
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "{:?} (HTTP {})", self.kind, status),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

/// Tri-state result of one remote call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteOutcome<T> {
    Success(T),
    Rejected(Rejection),
    Unreachable,
}

impl<T> RemoteOutcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, RemoteOutcome::Success(_))
    }

    pub fn success(self) -> Option<T> {
        match self {
            RemoteOutcome::Success(value) => Some(value),
            _ => None,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResolveBody {
    #[serde(default)]
    primary_user_id: Option<i64>,
}

/// `/next-id` answers either a bare array or `{"usedIds": [...]}`
#[derive(Deserialize)]
#[serde(untagged)]
enum UsedIdsBody {
    Bare(Vec<i64>),
    #[serde(rename_all = "camelCase")]
    Wrapped { used_ids: Vec<i64> },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AttendanceBody {
    fingerprint_id: PrimaryId,
    timestamp: i64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EnrollmentBody<'a> {
    primary_user_id: PrimaryId,
    enrolled_sensor_ids: &'a [SlotId],
    timestamp: i64,
}

pub struct RemoteClient<T> {
    transport: T,
}

impl<T: Transport> RemoteClient<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Full slot -> identity table
    pub fn fetch_mapping(&mut self) -> RemoteOutcome<Vec<MappingEntry>> {
        self.call_json(Method::Get, "/mapping", None)
    }

    /// Identity owning `slot`; `Success(None)` when the server has none
    pub fn resolve_primary_id(&mut self, slot: SlotId) -> RemoteOutcome<Option<PrimaryId>> {
        let path = format!("/mapping?sensorId={slot}");
        let response = match self.send(Method::Get, &path, None) {
            Ok(response) => response,
            Err(outcome) => return outcome,
        };
        if response.status == 404 {
            return RemoteOutcome::Success(None);
        }
        if !response.is_success() {
            return RemoteOutcome::Rejected(Rejection::from_status(response.status));
        }
        match serde_json::from_slice::<ResolveBody>(&response.body) {
            // zero and negative ids are the server's "nobody"
            Ok(body) => RemoteOutcome::Success(
                body.primary_user_id
                    .filter(|id| *id > 0)
                    .and_then(|id| PrimaryId::try_from(id).ok()),
            ),
            Err(e) => {
                warn!("unreadable resolve response: {}", e);
                RemoteOutcome::Rejected(Rejection::malformed(response.status))
            }
        }
    }

    /// Lowest free id in `1..capacity`; `Success(None)` when all are used
    pub fn allocate_primary_id(&mut self, capacity: u16) -> RemoteOutcome<Option<PrimaryId>> {
        match self.call_json::<UsedIdsBody>(Method::Get, "/next-id", None) {
            RemoteOutcome::Success(body) => {
                let used = match body {
                    UsedIdsBody::Bare(ids) | UsedIdsBody::Wrapped { used_ids: ids } => ids,
                };
                RemoteOutcome::Success(first_free_id(&used, capacity))
            }
            RemoteOutcome::Rejected(r) => RemoteOutcome::Rejected(r),
            RemoteOutcome::Unreachable => RemoteOutcome::Unreachable,
        }
    }

    pub fn push_attendance(&mut self, record: &AttendanceRecord) -> RemoteOutcome<()> {
        let body = AttendanceBody {
            fingerprint_id: record.primary,
            timestamp: record.timestamp,
        };
        self.post("/attendance", &body)
    }

    pub fn push_enrollment_complete(
        &mut self,
        primary: PrimaryId,
        slots: &[SlotId],
        timestamp: i64,
    ) -> RemoteOutcome<()> {
        let body = EnrollmentBody {
            primary_user_id: primary,
            enrolled_sensor_ids: slots,
            timestamp,
        };
        self.post("/enrollment", &body)
    }

    /// Ask the server to forget all mappings and attendance
    pub fn request_full_erase(&mut self) -> RemoteOutcome<()> {
        match self.send(Method::Post, "/clear", None) {
            Ok(response) if response.is_success() => RemoteOutcome::Success(()),
            Ok(response) => RemoteOutcome::Rejected(Rejection::from_status(response.status)),
            Err(outcome) => outcome,
        }
    }

    fn post<B: Serialize>(&mut self, path: &str, body: &B) -> RemoteOutcome<()> {
        let bytes = match serde_json::to_vec(body) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("could not encode {} body: {}", path, e);
                return RemoteOutcome::Rejected(Rejection {
                    status: None,
                    kind: RejectionKind::Validation,
                });
            }
        };
        match self.send(Method::Post, path, Some(&bytes)) {
            Ok(response) if response.is_success() => RemoteOutcome::Success(()),
            Ok(response) => RemoteOutcome::Rejected(Rejection::from_status(response.status)),
            Err(outcome) => outcome,
        }
    }

    fn call_json<R: serde::de::DeserializeOwned>(
        &mut self,
        method: Method,
        path: &str,
        body: Option<&[u8]>,
    ) -> RemoteOutcome<R> {
        let response = match self.send(method, path, body) {
            Ok(response) => response,
            Err(outcome) => return outcome,
        };
        if !response.is_success() {
            return RemoteOutcome::Rejected(Rejection::from_status(response.status));
        }
        match serde_json::from_slice(&response.body) {
            Ok(value) => RemoteOutcome::Success(value),
            Err(e) => {
                warn!("unreadable {} response: {}", path, e);
                RemoteOutcome::Rejected(Rejection::malformed(response.status))
            }
        }
    }

    /// Connectivity gate shared by every call
    fn send<R>(
        &mut self,
        method: Method,
        path: &str,
        body: Option<&[u8]>,
    ) -> Result<Response, RemoteOutcome<R>> {
        if !self.transport.is_connected() {
            debug!("{} {} skipped: offline", method, path);
            return Err(RemoteOutcome::Unreachable);
        }
        match self.transport.request(method, path, body) {
            Ok(response) => {
                debug!("{} {} -> {}", method, path, response.status);
                Ok(response)
            }
            Err(e) => {
                warn!("{} {} failed: {}", method, path, e);
                Err(RemoteOutcome::Unreachable)
            }
        }
    }
}

fn first_free_id(used: &[i64], capacity: u16) -> Option<PrimaryId> {
    (1..capacity)
        .map(PrimaryId::from)
        .find(|id| !used.contains(&i64::from(*id)))
}
