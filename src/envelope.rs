//! JSON-RPC 2.0 envelopes carried on the queue between pipeline stages.
//!
//! Two shapes: a dispatch [`Request`] and a result [`Response`]. The `id`
//! field correlates a dispatch to its eventual result and is the decimal
//! string of the task id. Encoding is serde_json over BTreeMap params, so
//! encode/decode round-trips are identity in both directions.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chaos::SyntheticFault;
use crate::task::KvMap;

const PROTOCOL_VERSION: &str = "2.0";

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported protocol version {0:?}")]
    Version(String),
    #[error("response must carry exactly one of result/error")]
    AmbiguousOutcome,
    #[error("invalid correlation id {0:?}")]
    InvalidCorrelationId(String),
    #[error(transparent)]
    Chaos(#[from] SyntheticFault),
}

fn default_protocol() -> String {
    PROTOCOL_VERSION.to_string()
}

/// A dispatch packet: "run `method` with `params`".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    #[serde(rename = "jsonrpc", default = "default_protocol")]
    pub protocol: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub method: String,
    pub params: KvMap,
}

impl Request {
    pub fn new(id: impl Into<String>, method: impl Into<String>, params: KvMap) -> Self {
        Self {
            protocol: default_protocol(),
            id: id.into(),
            method: method.into(),
            params,
        }
    }

    pub fn encode(&self) -> Result<String, EnvelopeError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(body: &str) -> Result<Self, EnvelopeError> {
        let request: Self = serde_json::from_str(body)?;
        if request.protocol != PROTOCOL_VERSION {
            return Err(EnvelopeError::Version(request.protocol));
        }
        Ok(request)
    }
}

/// A result packet: exactly one of `result`/`error` is present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    #[serde(rename = "jsonrpc", default = "default_protocol")]
    pub protocol: String,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<KvMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<KvMap>,
}

impl Response {
    pub fn success(id: impl Into<String>, result: KvMap) -> Self {
        Self {
            protocol: default_protocol(),
            id: id.into(),
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: impl Into<String>, error: KvMap) -> Self {
        Self {
            protocol: default_protocol(),
            id: id.into(),
            result: None,
            error: Some(error),
        }
    }

    pub fn encode(&self) -> Result<String, EnvelopeError> {
        self.check_outcome()?;
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(body: &str) -> Result<Self, EnvelopeError> {
        let response: Self = serde_json::from_str(body)?;
        if response.protocol != PROTOCOL_VERSION {
            return Err(EnvelopeError::Version(response.protocol));
        }
        response.check_outcome()?;
        Ok(response)
    }

    /// Parse the correlation id back into a task id.
    pub fn task_id(&self) -> Result<i64, EnvelopeError> {
        self.id
            .parse()
            .map_err(|_| EnvelopeError::InvalidCorrelationId(self.id.clone()))
    }

    fn check_outcome(&self) -> Result<(), EnvelopeError> {
        match (&self.result, &self.error) {
            (Some(_), None) | (None, Some(_)) => Ok(()),
            _ => Err(EnvelopeError::AmbiguousOutcome),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> KvMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn request_roundtrip_is_identity() {
        let request = Request::new("42", "EXPORT", params(&[("objectID", "42"), ("attempt", "1")]));
        let encoded = request.encode().expect("encode");
        let decoded = Request::decode(&encoded).expect("decode");
        assert_eq!(decoded, request);
        // decode then encode is also identity
        assert_eq!(decoded.encode().expect("re-encode"), encoded);
    }

    #[test]
    fn response_roundtrip_is_identity() {
        let response = Response::success("42", params(&[("result", "success"), ("attempt", "1")]));
        let encoded = response.encode().expect("encode");
        let decoded = Response::decode(&encoded).expect("decode");
        assert_eq!(decoded, response);
        assert_eq!(decoded.encode().expect("re-encode"), encoded);
    }

    #[test]
    fn wire_shape_matches_protocol() {
        let request = Request::new("7", "EXPORT", params(&[("objectID", "7")]));
        let encoded = request.encode().expect("encode");
        let value: serde_json::Value = serde_json::from_str(&encoded).expect("json");
        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["id"], "7");
        assert_eq!(value["method"], "EXPORT");
        assert_eq!(value["params"]["objectID"], "7");
    }

    #[test]
    fn response_requires_exactly_one_outcome() {
        let both = r#"{"jsonrpc":"2.0","id":"1","result":{},"error":{}}"#;
        assert!(matches!(
            Response::decode(both),
            Err(EnvelopeError::AmbiguousOutcome)
        ));
        let neither = r#"{"jsonrpc":"2.0","id":"1"}"#;
        assert!(matches!(
            Response::decode(neither),
            Err(EnvelopeError::AmbiguousOutcome)
        ));
    }

    #[test]
    fn rejects_wrong_protocol_version() {
        let body = r#"{"jsonrpc":"1.0","id":"1","method":"DUMMY","params":{}}"#;
        assert!(matches!(
            Request::decode(body),
            Err(EnvelopeError::Version(_))
        ));
    }

    #[test]
    fn correlation_id_parses_to_task_id() {
        let response = Response::success("1234", KvMap::new());
        assert_eq!(response.task_id().expect("task id"), 1234);
        let broken = Response::success("not-a-task", KvMap::new());
        assert!(matches!(
            broken.task_id(),
            Err(EnvelopeError::InvalidCorrelationId(_))
        ));
    }
}
