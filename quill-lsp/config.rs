use std::collections::HashMap;

use serde::Deserialize;
use thiserror::Error;

/// Default server bindings shipped with the crate.
const BUILTIN_SERVERS: &str = include_str!("languages.toml");

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("failed to parse server config: {0}")]
  Parse(#[from] toml::de::Error),
  #[error("server config for {0:?} has an empty command")]
  EmptyCommand(String),
}

/// One language's server binding.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerConfig {
  pub name:       String,
  pub command:    String,
  #[serde(default)]
  pub args:       Vec<String>,
  #[serde(default)]
  pub extensions: Vec<String>,
  #[serde(default = "enabled_default")]
  pub enabled:    bool,
}

fn enabled_default() -> bool {
  true
}

/// Partial per-language override applied by `update_configs`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerOverride {
  pub command:    Option<String>,
  pub args:       Option<Vec<String>>,
  pub extensions: Option<Vec<String>>,
  pub enabled:    Option<bool>,
}

#[derive(Debug, Deserialize)]
struct ServersFile {
  #[serde(default)]
  server: Vec<ServerConfig>,
}

/// The server bindings plus the extension index derived from them. Only
/// enabled servers participate in the index.
#[derive(Debug, Clone)]
pub struct ServerRegistry {
  servers:         HashMap<String, ServerConfig>,
  extension_index: HashMap<String, String>,
}

impl ServerRegistry {
  pub fn builtin() -> Result<Self, ConfigError> {
    Self::from_toml(BUILTIN_SERVERS)
  }

  pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
    let file: ServersFile = toml::from_str(text)?;
    let mut servers = HashMap::new();
    for server in file.server {
      if server.command.is_empty() {
        return Err(ConfigError::EmptyCommand(server.name));
      }
      servers.insert(server.name.clone(), server);
    }

    let mut registry = Self {
      servers,
      extension_index: HashMap::new(),
    };
    registry.rebuild_index();
    Ok(registry)
  }

  pub fn get(&self, language: &str) -> Option<&ServerConfig> {
    self.servers.get(language)
  }

  /// The language bound to a path's extension: the substring after the last
  /// dot, lowercased. Paths without an extension are not LSP-tracked.
  pub fn language_for_path(&self, path: &str) -> Option<&str> {
    let extension = path.rsplit_once('.')?.1.to_ascii_lowercase();
    self.extension_index.get(&extension).map(String::as_str)
  }

  pub fn apply_overrides(&mut self, overrides: &HashMap<String, ServerOverride>) {
    for (language, update) in overrides {
      let Some(server) = self.servers.get_mut(language) else {
        continue;
      };
      if let Some(command) = &update.command {
        server.command = command.clone();
      }
      if let Some(args) = &update.args {
        server.args = args.clone();
      }
      if let Some(extensions) = &update.extensions {
        server.extensions = extensions.clone();
      }
      if let Some(enabled) = update.enabled {
        server.enabled = enabled;
      }
    }
    self.rebuild_index();
  }

  fn rebuild_index(&mut self) {
    self.extension_index.clear();
    for server in self.servers.values() {
      if !server.enabled {
        continue;
      }
      for extension in &server.extensions {
        self
          .extension_index
          .insert(extension.to_ascii_lowercase(), server.name.clone());
      }
    }
  }
}

/// Internal language tags translated to the `languageId` values the wire
/// expects. Unknown tags pass through unchanged.
pub fn lsp_language_id(tag: &str) -> &str {
  match tag {
    "typescript" => "typescript",
    "javascript" => "javascript",
    "rust" => "rust",
    "python" => "python",
    "c" | "cpp" => "cpp",
    other => other,
  }
}
