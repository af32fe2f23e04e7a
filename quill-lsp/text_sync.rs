use percent_encoding::{
  AsciiSet,
  CONTROLS,
  percent_decode_str,
  utf8_percent_encode,
};
use ropey::Rope;
use serde_json::{
  Value,
  json,
};

/// Bytes escaped when a path becomes a `file://` URI. Slashes and the drive
/// colon stay literal so the URI keeps its path shape.
const PATH_ESCAPES: &AsciiSet = &CONTROLS
  .add(b' ')
  .add(b'"')
  .add(b'#')
  .add(b'%')
  .add(b'<')
  .add(b'>')
  .add(b'?')
  .add(b'`')
  .add(b'{')
  .add(b'}');

/// A single edit against a document, in character indices of the pre-edit
/// text. `start..end` is replaced by `text`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextEdit {
  pub start: usize,
  pub end:   usize,
  pub text:  String,
}

/// Backslashes normalize to forward slashes; a drive-letter prefix gets the
/// three-slash form, everything else the two-slash form.
pub fn path_to_uri(path: &str) -> String {
  let normalized = path.replace('\\', "/");
  let prefix = if has_drive_letter(&normalized) {
    "file:///"
  } else {
    "file://"
  };
  format!(
    "{prefix}{}",
    utf8_percent_encode(&normalized, PATH_ESCAPES)
  )
}

/// Inverse of [`path_to_uri`]: strips either prefix form and percent-decodes.
/// Returns `None` for non-`file:` URIs.
pub fn uri_to_path(uri: &str) -> Option<String> {
  let rest = uri.strip_prefix("file://")?;
  let rest = match rest.as_bytes() {
    // file:///C:/… carries an extra slash in front of the drive letter.
    [b'/', drive, b':', ..] if drive.is_ascii_alphabetic() => &rest[1..],
    _ => rest,
  };
  Some(percent_decode_str(rest).decode_utf8_lossy().into_owned())
}

/// The normalized form of a path that URI round-trips preserve.
pub fn normalize_path(path: &str) -> String {
  path.replace('\\', "/")
}

fn has_drive_letter(path: &str) -> bool {
  matches!(path.as_bytes(), [drive, b':', ..] if drive.is_ascii_alphabetic())
}

pub fn did_open_params(uri: &str, language_id: &str, version: i32, text: &str) -> Value {
  json!({
    "textDocument": {
      "uri": uri,
      "languageId": language_id,
      "version": version,
      "text": text,
    }
  })
}

pub fn did_change_params(uri: &str, version: i32, content_changes: Vec<Value>) -> Value {
  json!({
    "textDocument": {
      "uri": uri,
      "version": version,
    },
    "contentChanges": content_changes,
  })
}

/// The single whole-document change entry used under Full sync.
pub fn full_content_change(text: &Rope) -> Vec<Value> {
  vec![json!({ "text": text.to_string() })]
}

/// Per-edit change entries under Incremental sync. Ranges are computed
/// against the pre-edit text, which is what the server expects.
pub fn incremental_content_changes(pre_edit: &Rope, edits: &[TextEdit]) -> Vec<Value> {
  edits
    .iter()
    .map(|edit| {
      let (start_line, start_character) = char_idx_to_utf16_position(pre_edit, edit.start);
      let (end_line, end_character) = char_idx_to_utf16_position(pre_edit, edit.end);
      json!({
        "range": {
          "start": { "line": start_line, "character": start_character },
          "end": { "line": end_line, "character": end_character },
        },
        "text": edit.text,
      })
    })
    .collect()
}

pub fn did_save_params(uri: &str, text: Option<&str>) -> Value {
  match text {
    Some(text) => {
      json!({
        "textDocument": { "uri": uri },
        "text": text,
      })
    },
    None => {
      json!({
        "textDocument": { "uri": uri },
      })
    },
  }
}

pub fn did_close_params(uri: &str) -> Value {
  json!({
    "textDocument": {
      "uri": uri,
    }
  })
}

pub fn char_idx_to_utf16_position(text: &Rope, char_idx: usize) -> (u32, u32) {
  let char_idx = char_idx.min(text.len_chars());
  let line = text.char_to_line(char_idx);
  let line_start = text.line_to_char(line);
  let character = text
    .slice(line_start..char_idx)
    .chars()
    .map(|ch| ch.len_utf16() as u32)
    .sum::<u32>();
  (line as u32, character)
}

pub fn utf16_position_to_char_idx(text: &Rope, line: u32, character: u32) -> usize {
  if text.len_chars() == 0 {
    return 0;
  }

  let line = (line as usize).min(text.len_lines().saturating_sub(1));
  let line_start = text.line_to_char(line);
  let line_end = if line + 1 < text.len_lines() {
    text.line_to_char(line + 1)
  } else {
    text.len_chars()
  };

  let mut utf16_count = 0u32;
  let mut char_idx = line_start;
  for ch in text.slice(line_start..line_end).chars() {
    let next = utf16_count.saturating_add(ch.len_utf16() as u32);
    if next > character {
      break;
    }
    utf16_count = next;
    char_idx = char_idx.saturating_add(1);
  }

  char_idx
}
