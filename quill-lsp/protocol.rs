use serde::Deserialize;
use serde_json::{
  Value,
  json,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
  #[error("failed to decode json-rpc payload: {0}")]
  Decode(#[from] serde_json::Error),
  #[error("json-rpc payload is not an object")]
  NotAnObject,
  #[error("json-rpc payload is neither request, response nor notification")]
  UnknownShape,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ResponseError {
  pub code:    i64,
  pub message: String,
  #[serde(default)]
  pub data:    Option<Value>,
}

/// A response to one of our outbound requests. The id is kept raw; only
/// numeric ids can match the pending table.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
  pub id:     Value,
  pub result: Option<Value>,
  pub error:  Option<ResponseError>,
}

impl Response {
  pub fn numeric_id(&self) -> Option<u64> {
    self.id.as_u64()
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
  pub method: String,
  pub params: Option<Value>,
}

/// A server-initiated request. We answer every one of these with a null
/// result rather than leaving the server hanging.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerRequest {
  pub id:     Value,
  pub method: String,
  pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
  Response(Response),
  Notification(Notification),
  ServerRequest(ServerRequest),
}

/// Classify a raw inbound payload:
/// a `method` with an `id` is a server request, a `method` without an `id`
/// is a notification, an `id` with `result` or `error` is a response.
pub fn classify(raw: &str) -> Result<Incoming, ProtocolError> {
  let value: Value = serde_json::from_str(raw)?;
  let Value::Object(object) = value else {
    return Err(ProtocolError::NotAnObject);
  };

  let id = object.get("id").cloned();
  let method = object
    .get("method")
    .and_then(Value::as_str)
    .map(str::to_owned);

  if let Some(method) = method {
    let params = object.get("params").cloned();
    return Ok(match id {
      Some(id) => Incoming::ServerRequest(ServerRequest { id, method, params }),
      None => Incoming::Notification(Notification { method, params }),
    });
  }

  let Some(id) = id else {
    return Err(ProtocolError::UnknownShape);
  };
  if !object.contains_key("result") && !object.contains_key("error") {
    return Err(ProtocolError::UnknownShape);
  }

  let error = match object.get("error") {
    Some(error) if !error.is_null() => Some(serde_json::from_value(error.clone())?),
    _ => None,
  };

  Ok(Incoming::Response(Response {
    id,
    result: object.get("result").cloned(),
    error,
  }))
}

pub fn request_payload(id: u64, method: &str, params: Option<Value>) -> String {
  let mut message = json!({
    "jsonrpc": "2.0",
    "id": id,
    "method": method,
  });
  if let (Some(params), Some(object)) = (params, message.as_object_mut()) {
    object.insert("params".into(), params);
  }
  message.to_string()
}

pub fn notification_payload(method: &str, params: Option<Value>) -> String {
  let mut message = json!({
    "jsonrpc": "2.0",
    "method": method,
  });
  if let (Some(params), Some(object)) = (params, message.as_object_mut()) {
    object.insert("params".into(), params);
  }
  message.to_string()
}

/// The `{id, result: null}` acknowledgement for inbound server requests.
pub fn ack_payload(id: &Value) -> String {
  json!({
    "jsonrpc": "2.0",
    "id": id,
    "result": Value::Null,
  })
  .to_string()
}

pub fn cancel_params(id: u64) -> Value {
  json!({ "id": id })
}
