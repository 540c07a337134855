//! Manual requests
//!
//! Operators (CLI, UI) ask for an immediate reconcile, diff, deploy, prune or
//! validate by writing a JSON [`ManualRequest`] into the annotation of the
//! matching [`RequestKind`]. The controller never removes these annotations.
//! Instead it remembers the last handled token per kind in the status and
//! only acts when the annotation carries a different token.
//!
//! Tokens are compared by identity, never by order. The status also keeps a
//! short history of earlier tokens, so an older token replayed after a newer
//! one was handled is still recognized as handled.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Number of earlier tokens remembered per channel
pub const HANDLED_TOKEN_HISTORY: usize = 10;

/// The five independent request channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RequestKind {
    Reconcile,
    Diff,
    Deploy,
    Prune,
    Validate,
}

impl RequestKind {
    /// All kinds in the order they are processed within one reconcile
    pub const ALL: [RequestKind; 5] = [
        RequestKind::Reconcile,
        RequestKind::Diff,
        RequestKind::Deploy,
        RequestKind::Prune,
        RequestKind::Validate,
    ];

    /// Annotation carrying requests of this kind
    pub fn annotation(self) -> &'static str {
        match self {
            RequestKind::Reconcile => "kluctl.io/request-reconcile",
            RequestKind::Diff => "kluctl.io/request-diff",
            RequestKind::Deploy => "kluctl.io/request-deploy",
            RequestKind::Prune => "kluctl.io/request-prune",
            RequestKind::Validate => "kluctl.io/request-validate",
        }
    }

    /// Lower-case name, as used in logs and results
    pub fn as_str(self) -> &'static str {
        match self {
            RequestKind::Reconcile => "reconcile",
            RequestKind::Diff => "diff",
            RequestKind::Deploy => "deploy",
            RequestKind::Prune => "prune",
            RequestKind::Validate => "validate",
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request envelope stored in the annotation value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ManualRequest {
    /// Unique token identifying this request
    pub request_value: String,

    /// Optional patch applied to the deployment's args for this run only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "results::schema::preserve_unknown_fields")]
    pub overrides_patch: Option<serde_json::Value>,
}

impl ManualRequest {
    /// Request with only a token
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            request_value: token.into(),
            overrides_patch: None,
        }
    }

    /// JSON form as written into the annotation
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Outcome of a handled request, stored in the matching status field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ManualRequestResult {
    /// The handled request; its token marks the channel as handled
    pub request: ManualRequest,

    pub start_time: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,

    /// Id of the reconcile that handled the request
    #[serde(default)]
    pub reconcile_id: String,

    /// Id of the command result the request produced, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_id: Option<String>,

    /// Error message when the command failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_error: Option<String>,

    /// Tokens handled before this one, most recent first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub previous_request_values: Vec<String>,
}

/// Annotation value that could not be decoded
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Value is not a JSON request object
    #[error("malformed request: {0}")]
    Malformed(String),

    /// Request carries no token
    #[error("request has an empty requestValue")]
    EmptyToken,
}

/// Decodes an annotation value into a request
pub fn decode_request(value: &str) -> Result<ManualRequest, DecodeError> {
    let request: ManualRequest =
        serde_json::from_str(value).map_err(|e| DecodeError::Malformed(e.to_string()))?;
    if request.request_value.is_empty() {
        return Err(DecodeError::EmptyToken);
    }
    Ok(request)
}

/// True when `token` is the last handled token of the channel or one of the
/// remembered earlier ones
pub fn has_been_handled(token: &str, last: Option<&ManualRequestResult>) -> bool {
    last.is_some_and(|l| {
        l.request.request_value == token || l.previous_request_values.iter().any(|t| t == token)
    })
}

/// Builds the status entry for a handled request, carrying the token history
/// of `previous` forward
pub fn record_handled(
    previous: Option<&ManualRequestResult>,
    request: ManualRequest,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    reconcile_id: &str,
    result_id: Option<String>,
    command_error: Option<String>,
) -> ManualRequestResult {
    let mut previous_request_values = Vec::new();
    if let Some(p) = previous {
        previous_request_values.push(p.request.request_value.clone());
        previous_request_values.extend(p.previous_request_values.iter().cloned());
        previous_request_values.retain(|t| *t != request.request_value);
        previous_request_values.truncate(HANDLED_TOKEN_HISTORY);
    }
    ManualRequestResult {
        request,
        start_time,
        end_time: Some(end_time),
        reconcile_id: reconcile_id.to_string(),
        result_id,
        command_error,
        previous_request_values,
    }
}

/// State of one request channel as seen by a reconcile
#[derive(Debug, Clone, PartialEq)]
pub enum PendingRequest {
    /// No annotation, or its token was already handled
    None,
    /// A request with a token that was not handled yet
    New(ManualRequest),
    /// A value that does not decode and was not reported yet
    Invalid { raw: String, error: DecodeError },
}

/// Evaluates one channel against the last handled result.
///
/// Malformed values are reported once: the caller records them with the raw
/// value as token, after which they count as handled.
pub fn pending_request(
    kind: RequestKind,
    annotations: Option<&BTreeMap<String, String>>,
    last: Option<&ManualRequestResult>,
) -> PendingRequest {
    let Some(raw) = annotations.and_then(|a| a.get(kind.annotation())) else {
        return PendingRequest::None;
    };
    if raw.trim().is_empty() {
        return PendingRequest::None;
    }
    match decode_request(raw) {
        Ok(request) => {
            if has_been_handled(&request.request_value, last) {
                PendingRequest::None
            } else {
                PendingRequest::New(request)
            }
        }
        Err(error) => {
            if has_been_handled(raw, last) {
                PendingRequest::None
            } else {
                PendingRequest::Invalid {
                    raw: raw.clone(),
                    error,
                }
            }
        }
    }
}
