use std::{
  collections::HashMap,
  sync::{
    Arc,
    Mutex,
    atomic::{
      AtomicU64,
      Ordering,
    },
  },
};

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticSeverity {
  Error,
  Warning,
  Information,
  Hint,
}

impl DiagnosticSeverity {
  pub fn from_lsp_code(code: u8) -> Option<Self> {
    match code {
      1 => Some(Self::Error),
      2 => Some(Self::Warning),
      3 => Some(Self::Information),
      4 => Some(Self::Hint),
      _ => None,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiagnosticPosition {
  pub line:      u32,
  pub character: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiagnosticRange {
  pub start: DiagnosticPosition,
  pub end:   DiagnosticPosition,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelatedInformation {
  pub uri:     String,
  pub range:   DiagnosticRange,
  pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
  pub range:    DiagnosticRange,
  pub severity: Option<DiagnosticSeverity>,
  pub code:     Option<String>,
  pub source:   Option<String>,
  pub message:  String,
  pub related:  Vec<RelatedInformation>,
}

#[derive(Debug, Error)]
pub enum PublishDiagnosticsError {
  #[error("publishDiagnostics carried no params")]
  MissingParams,
  #[error("publishDiagnostics params decode failed: {0}")]
  Decode(#[from] serde_json::Error),
}

pub fn parse_publish_diagnostics(
  params: Option<&Value>,
) -> Result<(String, Vec<Diagnostic>), PublishDiagnosticsError> {
  let Some(params) = params else {
    return Err(PublishDiagnosticsError::MissingParams);
  };
  let payload: PublishDiagnosticsPayload = serde_json::from_value(params.clone())?;
  let diagnostics = payload
    .diagnostics
    .into_iter()
    .map(DiagnosticPayload::into_diagnostic)
    .collect();
  Ok((payload.uri, diagnostics))
}

#[derive(Debug, Deserialize)]
struct PublishDiagnosticsPayload {
  uri:         String,
  #[serde(default)]
  diagnostics: Vec<DiagnosticPayload>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DiagnosticPayload {
  range:               RangePayload,
  severity:            Option<u8>,
  code:                Option<DiagnosticCodePayload>,
  source:              Option<String>,
  message:             String,
  #[serde(default)]
  related_information: Vec<RelatedInformationPayload>,
}

impl DiagnosticPayload {
  fn into_diagnostic(self) -> Diagnostic {
    Diagnostic {
      range:    self.range.into_range(),
      severity: self.severity.and_then(DiagnosticSeverity::from_lsp_code),
      code:     self.code.map(DiagnosticCodePayload::into_string),
      source:   self.source,
      message:  self.message,
      related:  self
        .related_information
        .into_iter()
        .map(RelatedInformationPayload::into_related)
        .collect(),
    }
  }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DiagnosticCodePayload {
  String(String),
  Number(i64),
}

impl DiagnosticCodePayload {
  fn into_string(self) -> String {
    match self {
      Self::String(value) => value,
      Self::Number(value) => value.to_string(),
    }
  }
}

#[derive(Debug, Deserialize)]
struct RelatedInformationPayload {
  location: LocationPayload,
  message:  String,
}

impl RelatedInformationPayload {
  fn into_related(self) -> RelatedInformation {
    RelatedInformation {
      uri:     self.location.uri,
      range:   self.location.range.into_range(),
      message: self.message,
    }
  }
}

#[derive(Debug, Deserialize)]
struct LocationPayload {
  uri:   String,
  range: RangePayload,
}

#[derive(Debug, Deserialize)]
struct RangePayload {
  start: PositionPayload,
  end:   PositionPayload,
}

impl RangePayload {
  fn into_range(self) -> DiagnosticRange {
    DiagnosticRange {
      start: self.start.into_position(),
      end:   self.end.into_position(),
    }
  }
}

#[derive(Debug, Deserialize)]
struct PositionPayload {
  line:      u32,
  character: u32,
}

impl PositionPayload {
  fn into_position(self) -> DiagnosticPosition {
    DiagnosticPosition {
      line:      self.line,
      character: self.character,
    }
  }
}

pub type DiagnosticCallback = Box<dyn Fn(&str, &[Diagnostic]) + Send + Sync>;

/// Observer set for `publishDiagnostics` fan-out. Subscribers get a handle
/// back instead of access to the list, and drop out through it.
#[derive(Clone, Default)]
pub struct DiagnosticListeners {
  inner:   Arc<Mutex<HashMap<u64, Arc<DiagnosticCallback>>>>,
  next_id: Arc<AtomicU64>,
}

impl DiagnosticListeners {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn subscribe(&self, callback: DiagnosticCallback) -> DiagnosticsSubscription {
    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    self
      .inner
      .lock()
      .unwrap_or_else(|err| err.into_inner())
      .insert(id, Arc::new(callback));
    DiagnosticsSubscription {
      id,
      inner: Arc::clone(&self.inner),
    }
  }

  /// Deliver to every live listener. Callbacks run outside the set's lock so
  /// a listener may unsubscribe (itself included) mid-delivery.
  pub fn publish(&self, uri: &str, diagnostics: &[Diagnostic]) {
    let callbacks: Vec<_> = self
      .inner
      .lock()
      .unwrap_or_else(|err| err.into_inner())
      .values()
      .cloned()
      .collect();
    for callback in callbacks {
      callback(uri, diagnostics);
    }
  }

  pub fn clear(&self) {
    self
      .inner
      .lock()
      .unwrap_or_else(|err| err.into_inner())
      .clear();
  }

  #[cfg(test)]
  fn len(&self) -> usize {
    self
      .inner
      .lock()
      .unwrap_or_else(|err| err.into_inner())
      .len()
  }
}

pub struct DiagnosticsSubscription {
  id:    u64,
  inner: Arc<Mutex<HashMap<u64, Arc<DiagnosticCallback>>>>,
}

impl DiagnosticsSubscription {
  pub fn unsubscribe(self) {
    self
      .inner
      .lock()
      .unwrap_or_else(|err| err.into_inner())
      .remove(&self.id);
  }
}
