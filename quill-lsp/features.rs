use serde::Deserialize;
use serde_json::{
  Value,
  json,
};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
  pub line:      u32,
  pub character: u32,
}

impl Position {
  pub fn new(line: u32, character: u32) -> Self {
    Self { line, character }
  }

  fn as_json(self) -> Value {
    json!({
      "line": self.line,
      "character": self.character,
    })
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
  pub start: Position,
  pub end:   Position,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
  pub uri:   String,
  pub range: Range,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionItem {
  pub label:         String,
  pub kind:          Option<u32>,
  pub detail:        Option<String>,
  pub documentation: Option<String>,
  pub sort_text:     Option<String>,
  pub filter_text:   Option<String>,
  pub insert_text:   Option<String>,
}

#[derive(Debug, Error)]
pub enum FeatureParseError {
  #[error("unexpected lsp result shape for {0}")]
  InvalidShape(&'static str),
  #[error("failed to decode lsp feature payload: {0}")]
  Decode(#[from] serde_json::Error),
}

pub fn completion_params(uri: &str, position: Position) -> Value {
  text_document_position_params(uri, position)
}

pub fn hover_params(uri: &str, position: Position) -> Value {
  text_document_position_params(uri, position)
}

pub fn definition_params(uri: &str, position: Position) -> Value {
  text_document_position_params(uri, position)
}

pub fn type_definition_params(uri: &str, position: Position) -> Value {
  text_document_position_params(uri, position)
}

pub fn references_params(uri: &str, position: Position) -> Value {
  json!({
    "textDocument": { "uri": uri },
    "position": position.as_json(),
    "context": { "includeDeclaration": true },
  })
}

fn text_document_position_params(uri: &str, position: Position) -> Value {
  json!({
    "textDocument": { "uri": uri },
    "position": position.as_json(),
  })
}

/// Completion results arrive as `CompletionItem[]` or as a `CompletionList`
/// with an `items` field.
pub fn parse_completion_response(
  result: Option<&Value>,
) -> Result<Vec<CompletionItem>, FeatureParseError> {
  let Some(result) = result else {
    return Ok(Vec::new());
  };
  if result.is_null() {
    return Ok(Vec::new());
  }

  let items = if let Some(items) = result.as_array() {
    items.clone()
  } else if let Some(items) = result.get("items").and_then(Value::as_array) {
    items.clone()
  } else {
    return Err(FeatureParseError::InvalidShape("completion"));
  };

  items
    .into_iter()
    .map(|item| {
      let payload: CompletionItemPayload = serde_json::from_value(item)?;
      Ok(payload.into_item())
    })
    .collect()
}

/// Hover contents come as a string, a `{kind, value}` markup object, a
/// `{language, value}` pair, or an array of those; the first non-empty line
/// of the flattened text is kept.
pub fn parse_hover_response(result: Option<&Value>) -> Result<Option<String>, FeatureParseError> {
  let Some(result) = result else {
    return Ok(None);
  };
  if result.is_null() {
    return Ok(None);
  }

  let contents = result
    .get("contents")
    .ok_or(FeatureParseError::InvalidShape("hover"))?;
  let Some(text) = hover_contents_to_text(contents) else {
    return Err(FeatureParseError::InvalidShape("hover"));
  };
  Ok(first_meaningful_line(&text))
}

/// `Location | Location[] | LocationLink[]`, all normalized to locations.
pub fn parse_locations_response(
  result: Option<&Value>,
) -> Result<Vec<Location>, FeatureParseError> {
  let Some(result) = result else {
    return Ok(Vec::new());
  };
  if result.is_null() {
    return Ok(Vec::new());
  }

  if let Ok(location) = serde_json::from_value::<LocationPayload>(result.clone()) {
    return Ok(vec![location.into_location()]);
  }

  if let Ok(locations) = serde_json::from_value::<Vec<LocationPayload>>(result.clone()) {
    return Ok(
      locations
        .into_iter()
        .map(LocationPayload::into_location)
        .collect(),
    );
  }

  if let Ok(links) = serde_json::from_value::<Vec<LocationLinkPayload>>(result.clone()) {
    return Ok(
      links
        .into_iter()
        .map(LocationLinkPayload::into_location)
        .collect(),
    );
  }

  Err(FeatureParseError::InvalidShape("locations"))
}

fn hover_contents_to_text(value: &Value) -> Option<String> {
  if let Some(text) = value.as_str() {
    return Some(text.to_string());
  }

  if let Some(array) = value.as_array() {
    let joined = array
      .iter()
      .filter_map(hover_contents_to_text)
      .collect::<Vec<_>>()
      .join("\n");
    if joined.is_empty() {
      return None;
    }
    return Some(joined);
  }

  value
    .as_object()?
    .get("value")
    .and_then(Value::as_str)
    .map(ToOwned::to_owned)
}

fn first_meaningful_line(text: &str) -> Option<String> {
  text
    .lines()
    .map(str::trim)
    .find(|line| !line.is_empty() && !line.starts_with("```"))
    .map(ToOwned::to_owned)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CompletionItemPayload {
  label:         String,
  kind:          Option<u32>,
  detail:        Option<String>,
  documentation: Option<DocumentationPayload>,
  sort_text:     Option<String>,
  filter_text:   Option<String>,
  insert_text:   Option<String>,
}

impl CompletionItemPayload {
  fn into_item(self) -> CompletionItem {
    CompletionItem {
      label:         self.label,
      kind:          self.kind,
      detail:        self.detail,
      documentation: self.documentation.map(DocumentationPayload::into_text),
      sort_text:     self.sort_text,
      filter_text:   self.filter_text,
      insert_text:   self.insert_text,
    }
  }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DocumentationPayload {
  Plain(String),
  Markup { value: String },
}

impl DocumentationPayload {
  fn into_text(self) -> String {
    match self {
      Self::Plain(value) | Self::Markup { value } => value,
    }
  }
}

#[derive(Debug, Deserialize)]
struct PositionPayload {
  line:      u32,
  character: u32,
}

impl PositionPayload {
  fn into_position(self) -> Position {
    Position {
      line:      self.line,
      character: self.character,
    }
  }
}

#[derive(Debug, Deserialize)]
struct RangePayload {
  start: PositionPayload,
  end:   PositionPayload,
}

impl RangePayload {
  fn into_range(self) -> Range {
    Range {
      start: self.start.into_position(),
      end:   self.end.into_position(),
    }
  }
}

#[derive(Debug, Deserialize)]
struct LocationPayload {
  uri:   String,
  range: RangePayload,
}

impl LocationPayload {
  fn into_location(self) -> Location {
    Location {
      uri:   self.uri,
      range: self.range.into_range(),
    }
  }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LocationLinkPayload {
  target_uri:             String,
  target_range:           RangePayload,
  target_selection_range: Option<RangePayload>,
}

impl LocationLinkPayload {
  fn into_location(self) -> Location {
    let range = self
      .target_selection_range
      .unwrap_or(self.target_range)
      .into_range();
    Location {
      uri: self.target_uri,
      range,
    }
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  #[test]
  fn references_params_include_declaration() {
    let params = references_params("file:///w/a.ts", Position::new(2, 7));
    assert_eq!(params["context"]["includeDeclaration"], json!(true));
    assert_eq!(params["position"]["line"], json!(2));
  }

  #[test]
  fn parses_bare_item_array_and_completion_list() {
    let bare = json!([{ "label": "foo" }, { "label": "bar", "kind": 3 }]);
    let items = parse_completion_response(Some(&bare)).expect("bare array parses");
    assert_eq!(items.len(), 2);
    assert_eq!(items[1].kind, Some(3));

    let list = json!({
      "isIncomplete": false,
      "items": [{
        "label": "println!",
        "detail": "macro_rules!",
        "documentation": { "kind": "markdown", "value": "Prints to stdout." },
        "insertText": "println!($0)"
      }]
    });
    let items = parse_completion_response(Some(&list)).expect("list parses");
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].documentation.as_deref(), Some("Prints to stdout."));
    assert_eq!(items[0].insert_text.as_deref(), Some("println!($0)"));
  }

  #[test]
  fn hover_text_skips_code_fences() {
    let value = json!({
      "contents": {
        "kind": "markdown",
        "value": "```rust\nfn test() -> u32\n```"
      }
    });
    let hover = parse_hover_response(Some(&value)).expect("hover parses");
    assert_eq!(hover.as_deref(), Some("fn test() -> u32"));
  }

  #[test]
  fn hover_accepts_a_plain_string() {
    let value = json!({ "contents": "number" });
    let hover = parse_hover_response(Some(&value)).expect("hover parses");
    assert_eq!(hover.as_deref(), Some("number"));
  }

  #[test]
  fn null_results_are_empty_not_errors() {
    assert_eq!(
      parse_hover_response(Some(&Value::Null)).expect("null hover"),
      None
    );
    assert!(
      parse_locations_response(Some(&Value::Null))
        .expect("null locations")
        .is_empty()
    );
    assert!(
      parse_completion_response(Some(&Value::Null))
        .expect("null completion")
        .is_empty()
    );
  }

  #[test]
  fn location_links_fall_back_to_target_range() {
    let value = json!([{
      "targetUri": "file:///w/lib.rs",
      "targetRange": {
        "start": { "line": 4, "character": 0 },
        "end": { "line": 9, "character": 1 }
      }
    }]);
    let locations = parse_locations_response(Some(&value)).expect("links parse");
    assert_eq!(locations.len(), 1);
    assert_eq!(locations[0].uri, "file:///w/lib.rs");
    assert_eq!(locations[0].range.start.line, 4);
  }
}
