use serde_json::Value;

/// Features the client issues through a capability gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeatureCapability {
  Completion,
  Hover,
  Definition,
  TypeDefinition,
  References,
}

impl FeatureCapability {
  fn provider_key(self) -> &'static str {
    match self {
      Self::Completion => "completionProvider",
      Self::Hover => "hoverProvider",
      Self::Definition => "definitionProvider",
      Self::TypeDefinition => "typeDefinitionProvider",
      Self::References => "referencesProvider",
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncKind {
  None,
  Full,
  Incremental,
}

impl SyncKind {
  fn from_lsp_code(code: i64) -> Option<Self> {
    match code {
      0 => Some(Self::None),
      1 => Some(Self::Full),
      2 => Some(Self::Incremental),
      _ => None,
    }
  }
}

/// Normalized view of the `ServerCapabilities` a handshake returned. Built
/// once when the `initialize` response arrives; everything downstream reads
/// this record instead of poking at the raw JSON again.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerCapabilitiesSnapshot {
  raw:               Value,
  sync_kind:         SyncKind,
  save_include_text: bool,
}

impl ServerCapabilitiesSnapshot {
  pub fn from_raw(raw: Value) -> Self {
    let (sync_kind, save_include_text) = parse_text_document_sync(&raw);
    Self {
      raw,
      sync_kind,
      save_include_text,
    }
  }

  pub fn raw(&self) -> &Value {
    &self.raw
  }

  pub fn sync_kind(&self) -> SyncKind {
    self.sync_kind
  }

  pub fn save_include_text(&self) -> bool {
    self.save_include_text
  }

  /// `true`/object providers count as supported; `false`/`null`/absent do not.
  pub fn supports(&self, capability: FeatureCapability) -> bool {
    match self.raw.get(capability.provider_key()) {
      Some(Value::Bool(enabled)) => *enabled,
      Some(Value::Null) | None => false,
      Some(_) => true,
    }
  }
}

/// `textDocumentSync` is a number or an object whose `change` field holds the
/// kind. Anything unrecognized falls back to Full.
fn parse_text_document_sync(raw: &Value) -> (SyncKind, bool) {
  match raw.get("textDocumentSync") {
    Some(Value::Number(number)) => {
      let kind = number
        .as_i64()
        .and_then(SyncKind::from_lsp_code)
        .unwrap_or(SyncKind::Full);
      (kind, false)
    },
    Some(Value::Object(object)) => {
      let kind = object
        .get("change")
        .and_then(Value::as_i64)
        .and_then(SyncKind::from_lsp_code)
        .unwrap_or(SyncKind::Full);
      let save_include_text = match object.get("save") {
        Some(Value::Object(save)) => {
          save
            .get("includeText")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        },
        _ => false,
      };
      (kind, save_include_text)
    },
    _ => (SyncKind::Full, false),
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  #[test]
  fn numeric_sync_kind_is_used_directly() {
    let snapshot = ServerCapabilitiesSnapshot::from_raw(json!({ "textDocumentSync": 2 }));
    assert_eq!(snapshot.sync_kind(), SyncKind::Incremental);
  }

  #[test]
  fn object_sync_kind_reads_the_change_field() {
    let snapshot = ServerCapabilitiesSnapshot::from_raw(json!({
      "textDocumentSync": { "openClose": true, "change": 1, "save": { "includeText": true } }
    }));
    assert_eq!(snapshot.sync_kind(), SyncKind::Full);
    assert!(snapshot.save_include_text());
  }

  #[test]
  fn absent_sync_defaults_to_full() {
    let snapshot = ServerCapabilitiesSnapshot::from_raw(json!({}));
    assert_eq!(snapshot.sync_kind(), SyncKind::Full);
    assert!(!snapshot.save_include_text());
  }

  #[test]
  fn provider_objects_and_booleans_gate_features() {
    let snapshot = ServerCapabilitiesSnapshot::from_raw(json!({
      "hoverProvider": true,
      "completionProvider": { "triggerCharacters": ["."] },
      "definitionProvider": false,
      "referencesProvider": null,
    }));
    assert!(snapshot.supports(FeatureCapability::Hover));
    assert!(snapshot.supports(FeatureCapability::Completion));
    assert!(!snapshot.supports(FeatureCapability::Definition));
    assert!(!snapshot.supports(FeatureCapability::References));
    assert!(!snapshot.supports(FeatureCapability::TypeDefinition));
  }
}
