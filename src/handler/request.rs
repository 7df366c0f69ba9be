use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::handler::HandlerError;

/// Handlers in this crate are written for one request per batch.
pub const SUPPORTED_BATCH_SIZE: usize = 1;

/// A request payload as delivered by the daemon: raw bytes off the wire or
/// input the frontend already decoded.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Bytes(Vec<u8>),
    Json(Value),
}

impl Payload {
    /// Falsy payloads (`null`, `false`, zero, empty string, array, object or
    /// bytes) count as absent.
    fn is_empty(&self) -> bool {
        match self {
            Payload::Bytes(bytes) => bytes.is_empty(),
            Payload::Json(Value::Null) => true,
            Payload::Json(Value::Bool(b)) => !b,
            Payload::Json(Value::Number(n)) => n.as_f64() == Some(0.),
            Payload::Json(Value::String(s)) => s.is_empty(),
            Payload::Json(Value::Array(a)) => a.is_empty(),
            Payload::Json(Value::Object(o)) => o.is_empty(),
        }
    }
}

/// One entry of a batch. The payload is looked up under `data` first, then `body`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestItem {
    pub data: Option<Payload>,
    pub body: Option<Payload>,
}

impl RequestItem {
    pub fn from_body(bytes: Vec<u8>) -> Self {
        Self {
            data: None,
            body: Some(Payload::Bytes(bytes)),
        }
    }

    pub fn from_json(value: Value) -> Self {
        Self {
            data: Some(Payload::Json(value)),
            body: None,
        }
    }

    pub fn payload(&self) -> Option<&Payload> {
        self.data
            .as_ref()
            .filter(|p| !p.is_empty())
            .or(self.body.as_ref())
    }

    /// Decodes the payload into `T`, accepting UTF-8 bytes, a JSON string or
    /// structured JSON.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        let payload = self
            .payload()
            .ok_or_else(|| HandlerError::InvalidPayload("request has no data or body".into()))?;

        let parsed = match payload {
            Payload::Bytes(bytes) => {
                let text = std::str::from_utf8(bytes)
                    .map_err(|e| HandlerError::InvalidPayload(format!("body is not UTF-8: {e}")))?;
                serde_json::from_str(text)
            }
            Payload::Json(Value::String(text)) => serde_json::from_str(text),
            Payload::Json(value) => T::deserialize(value),
        };
        parsed.map_err(|e| HandlerError::InvalidPayload(e.to_string()))
    }
}

/// Returns the only request of a batch, rejecting any other batch size.
pub fn single_request(requests: &[RequestItem]) -> Result<&RequestItem, HandlerError> {
    match requests {
        [request] => Ok(request),
        _ => Err(HandlerError::BatchSize {
            expected: SUPPORTED_BATCH_SIZE,
            actual: requests.len(),
        }),
    }
}
