use std::{
  collections::{
    HashMap,
    HashSet,
  },
  path::{
    Path,
    PathBuf,
  },
  sync::{
    Arc,
    Mutex,
    MutexGuard,
    mpsc::{
      Receiver,
      Sender,
      TryRecvError,
      channel,
    },
  },
};

use tracing::{
  debug,
  warn,
};

use crate::{
  client::{
    ClientOptions,
    CommandTransportFactory,
    LanguageClient,
    TransportFactory,
  },
  config::{
    ConfigError,
    ServerConfig,
    ServerOverride,
    ServerRegistry,
    lsp_language_id,
  },
  event::LspEvent,
  features::{
    CompletionItem,
    Location,
    Position,
  },
  text_sync::{
    TextEdit,
    path_to_uri,
  },
};

/// Builds the transport factory for a language's client. The default spawns
/// the configured command in the workspace root; tests plug in fake servers.
pub type TransportConnector =
  Arc<dyn Fn(&ServerConfig, &Path) -> Arc<dyn TransportFactory> + Send + Sync>;

struct OpenDocument {
  language: String,
  text:     String,
}

struct ManagerState {
  registry:       ServerRegistry,
  documents:      HashMap<String, OpenDocument>,
  clients:        HashMap<String, Arc<LanguageClient>>,
  starting:       HashSet<String>,
  /// Languages whose server failed to come up. Left alone until a config
  /// update, so a broken binary is reported once instead of per open.
  failed:         HashSet<String>,
  workspace_root: Option<String>,
}

/// Process-wide coordinator mapping open files onto language clients.
/// Clients start lazily on the first open of their language and stop when
/// their last document closes.
pub struct LspManager {
  state:     Arc<Mutex<ManagerState>>,
  options:   ClientOptions,
  connector: TransportConnector,
  events_tx: Sender<LspEvent>,
  events_rx: Mutex<Receiver<LspEvent>>,
}

impl LspManager {
  pub fn new() -> Result<Self, ConfigError> {
    Self::with_connector(
      ClientOptions::default(),
      Arc::new(|config: &ServerConfig, root: &Path| {
        Arc::new(CommandTransportFactory {
          command: config.command.clone(),
          args:    config.args.clone(),
          cwd:     PathBuf::from(root),
        }) as Arc<dyn TransportFactory>
      }),
    )
  }

  pub fn with_connector(
    options: ClientOptions,
    connector: TransportConnector,
  ) -> Result<Self, ConfigError> {
    let (events_tx, events_rx) = channel();
    Ok(Self {
      state: Arc::new(Mutex::new(ManagerState {
        registry:       ServerRegistry::builtin()?,
        documents:      HashMap::new(),
        clients:        HashMap::new(),
        starting:       HashSet::new(),
        failed:         HashSet::new(),
        workspace_root: None,
      })),
      options,
      connector,
      events_tx,
      events_rx: Mutex::new(events_rx),
    })
  }

  /// The host-provided explorer path the root URI derives from. Without it
  /// no client starts.
  pub fn set_workspace_root(&self, path: &str) {
    self.lock_state().workspace_root = Some(path.to_string());
  }

  /// Apply partial config overrides, rebuild the extension index, and give
  /// previously failed languages another chance. A language disabled by the
  /// update has its running client stopped.
  pub fn update_configs(&self, overrides: &HashMap<String, ServerOverride>) {
    let stopped = {
      let mut state = self.lock_state();
      state.registry.apply_overrides(overrides);
      state.failed.clear();
      let disabled: Vec<String> = state
        .clients
        .keys()
        .filter(|language| {
          state
            .registry
            .get(language)
            .is_none_or(|config| !config.enabled)
        })
        .cloned()
        .collect();
      disabled
        .into_iter()
        .filter_map(|language| state.clients.remove(&language))
        .collect::<Vec<_>>()
    };
    for client in stopped {
      client.stop();
      self.emit_stopped(&client);
    }
  }

  /// The language a path resolves to through the extension index, if any.
  pub fn tracked_language(&self, path: &str) -> Option<String> {
    self
      .lock_state()
      .registry
      .language_for_path(path)
      .map(str::to_owned)
  }

  pub fn document_opened(&self, path: &str, content: &str) {
    let Some(language) = self.tracked_language(path) else {
      return;
    };
    let uri = path_to_uri(path);
    self.lock_state().documents.insert(uri.clone(), OpenDocument {
      language: language.clone(),
      text:     content.to_string(),
    });

    let Some((client, freshly_started)) = self.ensure_client(&language) else {
      return;
    };
    // A fresh client already replayed every tracked document of its
    // language, this one included.
    if !freshly_started {
      client.did_open(&uri, lsp_language_id(&language), content);
    }
  }

  pub fn document_changed(&self, path: &str, edits: &[TextEdit], new_text: &str) {
    let uri = path_to_uri(path);
    let client = {
      let mut state = self.lock_state();
      let Some(document) = state.documents.get_mut(&uri) else {
        return;
      };
      document.text = new_text.to_string();
      let language = document.language.clone();
      state.clients.get(&language).cloned()
    };
    if let Some(client) = client {
      client.did_change(&uri, edits, new_text);
    }
  }

  pub fn document_saved(&self, path: &str, text: Option<&str>) {
    let uri = path_to_uri(path);
    let client = {
      let state = self.lock_state();
      let Some(document) = state.documents.get(&uri) else {
        return;
      };
      state.clients.get(&document.language).cloned()
    };
    if let Some(client) = client {
      client.did_save(&uri, text);
    }
  }

  /// Close a document; when it was its language's last one, the client goes
  /// down with it.
  pub fn document_closed(&self, path: &str) {
    let uri = path_to_uri(path);
    let (client, language_idle) = {
      let mut state = self.lock_state();
      let Some(document) = state.documents.remove(&uri) else {
        return;
      };
      let language = document.language;
      let client = state.clients.get(&language).cloned();
      let language_idle = !state
        .documents
        .values()
        .any(|document| document.language == language);
      if language_idle {
        state.clients.remove(&language);
      }
      (client, language_idle)
    };

    let Some(client) = client else {
      return;
    };
    client.did_close(&uri);
    if language_idle {
      debug!(server = client.server_id(), "last document closed, stopping client");
      client.stop();
      self.emit_stopped(&client);
    }
  }

  pub fn client_for_path(&self, path: &str) -> Option<Arc<LanguageClient>> {
    self.lookup(path).map(|(client, _)| client)
  }

  pub fn completion_at(&self, path: &str, position: Position) -> Option<Vec<CompletionItem>> {
    let (client, uri) = self.lookup(path)?;
    client.completion(&uri, position)
  }

  pub fn hover_at(&self, path: &str, position: Position) -> Option<String> {
    let (client, uri) = self.lookup(path)?;
    client.hover(&uri, position)
  }

  pub fn definition_at(&self, path: &str, position: Position) -> Option<Vec<Location>> {
    let (client, uri) = self.lookup(path)?;
    client.definition(&uri, position)
  }

  pub fn type_definition_at(&self, path: &str, position: Position) -> Option<Vec<Location>> {
    let (client, uri) = self.lookup(path)?;
    client.type_definition(&uri, position)
  }

  pub fn references_at(&self, path: &str, position: Position) -> Option<Vec<Location>> {
    let (client, uri) = self.lookup(path)?;
    client.references(&uri, position)
  }

  pub fn try_recv_event(&self) -> Option<LspEvent> {
    let rx = self.events_rx.lock().unwrap_or_else(|err| err.into_inner());
    match rx.try_recv() {
      Ok(event) => Some(event),
      Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
    }
  }

  /// Stop every client and drop all tracked state.
  pub fn dispose(&self) {
    let clients: Vec<_> = {
      let mut state = self.lock_state();
      state.documents.clear();
      state.starting.clear();
      state.failed.clear();
      state.clients.drain().map(|(_, client)| client).collect()
    };
    for client in clients {
      client.stop();
      self.emit_stopped(&client);
    }
  }

  fn lookup(&self, path: &str) -> Option<(Arc<LanguageClient>, String)> {
    let uri = path_to_uri(path);
    let client = {
      let state = self.lock_state();
      let document = state.documents.get(&uri)?;
      state.clients.get(&document.language).cloned()
    }?;
    Some((client, uri))
  }

  /// Return the language's client, lazily starting it on first use. The
  /// bool is true when this call brought the client up (and therefore
  /// already replayed `didOpen` for the language's tracked documents).
  /// Returns `None` while a concurrent start is in flight.
  fn ensure_client(&self, language: &str) -> Option<(Arc<LanguageClient>, bool)> {
    let (config, workspace_root) = {
      let mut state = self.lock_state();
      if let Some(client) = state.clients.get(language) {
        return client.is_initialized().then(|| (Arc::clone(client), false));
      }
      if state.starting.contains(language) || state.failed.contains(language) {
        return None;
      }
      let config = state.registry.get(language)?.clone();
      if !config.enabled {
        return None;
      }
      let workspace_root = state.workspace_root.clone()?;
      state.starting.insert(language.to_string());
      (config, workspace_root)
    };

    // The handshake blocks; the manager lock is not held across it so other
    // documents keep flowing meanwhile.
    let root_uri = path_to_uri(&workspace_root);
    let factory = (self.connector)(&config, Path::new(&workspace_root));
    let server_id = format!("lsp-{language}");
    let client = match LanguageClient::new(
      server_id.clone(),
      factory,
      self.options.clone(),
      self.events_tx.clone(),
    ) {
      Ok(client) => Arc::new(client),
      Err(err) => {
        warn!(language, error = %err, "failed to build language client");
        let _ = self.events_tx.send(LspEvent::SpawnFailed {
          server_id,
          error: err.to_string(),
        });
        let mut state = self.lock_state();
        state.starting.remove(language);
        state.failed.insert(language.to_string());
        return None;
      },
    };

    match client.start(&root_uri) {
      Ok(()) => {
        self.install_restart_hook(&client, language);
        let replay: Vec<(String, String)> = {
          let mut state = self.lock_state();
          state.starting.remove(language);
          state
            .clients
            .insert(language.to_string(), Arc::clone(&client));
          state
            .documents
            .iter()
            .filter(|(_, document)| document.language == language)
            .map(|(uri, document)| (uri.clone(), document.text.clone()))
            .collect()
        };
        let language_id = lsp_language_id(language);
        for (uri, text) in replay {
          client.did_open(&uri, language_id, &text);
        }
        debug!(server = client.server_id(), "language client started");
        Some((client, true))
      },
      Err(err) => {
        warn!(language, error = %err, "language server failed to start");
        self.lock_state().starting.remove(language);
        self.lock_state().failed.insert(language.to_string());
        client.stop();
        None
      },
    }
  }

  /// After a supervised restart the server has an empty view of the world;
  /// replay `didOpen` for everything the manager still tracks against it.
  fn install_restart_hook(&self, client: &Arc<LanguageClient>, language: &str) {
    let state = Arc::clone(&self.state);
    let language = language.to_string();
    let weak = Arc::downgrade(client);
    client.set_restart_hook(move || {
      let Some(client) = weak.upgrade() else {
        return;
      };
      let replay: Vec<(String, String)> = {
        let state = state.lock().unwrap_or_else(|err| err.into_inner());
        state
          .documents
          .iter()
          .filter(|(_, document)| document.language == language)
          .map(|(uri, document)| (uri.clone(), document.text.clone()))
          .collect()
      };
      let language_id = lsp_language_id(&language);
      for (uri, text) in replay {
        client.did_open(&uri, language_id, &text);
      }
    });
  }

  fn emit_stopped(&self, client: &LanguageClient) {
    let _ = self.events_tx.send(LspEvent::ClientStopped {
      server_id: client.server_id().to_string(),
    });
  }

  fn lock_state(&self) -> MutexGuard<'_, ManagerState> {
    self.state.lock().unwrap_or_else(|err| err.into_inner())
  }
}

impl Drop for LspManager {
  fn drop(&mut self) {
    self.dispose();
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn untracked_extensions_are_ignored() {
    let manager = LspManager::new().expect("manager builds");
    manager.set_workspace_root("/w");
    manager.document_opened("/w/notes.txt", "hello");
    assert!(manager.client_for_path("/w/notes.txt").is_none());
    assert_eq!(manager.tracked_language("/w/notes.txt"), None);
  }

  #[test]
  fn no_workspace_root_means_no_client() {
    let manager = LspManager::new().expect("manager builds");
    // Tracked extension, but nothing to derive a root URI from.
    manager.document_opened("/w/lib.rs", "fn main() {}");
    assert!(manager.client_for_path("/w/lib.rs").is_none());
    assert_eq!(manager.tracked_language("/w/lib.rs").as_deref(), Some("rust"));
  }
}
