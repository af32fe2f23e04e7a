use std::{
  collections::HashMap,
  path::PathBuf,
  sync::{
    Arc,
    Mutex,
    MutexGuard,
    atomic::{
      AtomicU64,
      Ordering,
    },
    mpsc::{
      Receiver,
      RecvTimeoutError,
      Sender,
      TryRecvError,
      channel,
    },
  },
  thread::{
    self,
    JoinHandle,
  },
  time::{
    Duration,
    Instant,
  },
};

use ropey::Rope;
use serde_json::{
  Value,
  json,
};
use thiserror::Error;
use tracing::{
  debug,
  warn,
};

use crate::{
  capabilities::{
    FeatureCapability,
    ServerCapabilitiesSnapshot,
    SyncKind,
  },
  diagnostics::{
    DiagnosticCallback,
    DiagnosticListeners,
    DiagnosticsSubscription,
    parse_publish_diagnostics,
  },
  event::{
    LogMessageKind,
    LspEvent,
  },
  features::{
    CompletionItem,
    Location,
    Position,
    completion_params,
    definition_params,
    hover_params,
    parse_completion_response,
    parse_hover_response,
    parse_locations_response,
    references_params,
    type_definition_params,
  },
  protocol::{
    self,
    Incoming,
    Notification,
    Response,
    ServerRequest,
  },
  text_sync::{
    self,
    TextEdit,
  },
  transport::{
    MessageSender,
    ServerTransport,
    TransportError,
    TransportEvent,
  },
};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
const FULL_SYNC_DEBOUNCE: Duration = Duration::from_millis(50);
const MAX_RESTARTS: u32 = 3;
const WORKER_TICK: Duration = Duration::from_millis(16);
/// Slack on top of the worker-enforced deadline before a blocked caller
/// gives up on its responder channel.
const RESPONDER_GRACE: Duration = Duration::from_secs(1);

/// Where a session's transports come from. Production connects by spawning
/// the configured command; tests connect to a scripted fake server.
pub trait TransportFactory: Send + Sync + 'static {
  fn connect(&self) -> Result<ServerTransport, TransportError>;

  /// Shown in telemetry when a server comes up.
  fn describe(&self) -> String;
}

pub struct CommandTransportFactory {
  pub command: String,
  pub args:    Vec<String>,
  pub cwd:     PathBuf,
}

impl TransportFactory for CommandTransportFactory {
  fn connect(&self) -> Result<ServerTransport, TransportError> {
    ServerTransport::spawn(&self.command, &self.args, &self.cwd)
  }

  fn describe(&self) -> String {
    self.command.clone()
  }
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
  pub initialize_timeout: Duration,
  /// Base of the restart ladder; attempt n waits `base × 2^(n-1)`.
  pub restart_backoff:    Duration,
}

impl Default for ClientOptions {
  fn default() -> Self {
    Self {
      initialize_timeout: Duration::from_secs(15),
      restart_backoff:    Duration::from_secs(2),
    }
  }
}

/// The supersedable feature requests. Each slot holds at most one in-flight
/// request id; issuing a new one cancels its predecessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeatureSlot {
  Completion,
  Hover,
  Definition,
  TypeDefinition,
  References,
}

impl FeatureSlot {
  fn method(self) -> &'static str {
    match self {
      Self::Completion => "textDocument/completion",
      Self::Hover => "textDocument/hover",
      Self::Definition => "textDocument/definition",
      Self::TypeDefinition => "textDocument/typeDefinition",
      Self::References => "textDocument/references",
    }
  }

  fn capability(self) -> FeatureCapability {
    match self {
      Self::Completion => FeatureCapability::Completion,
      Self::Hover => FeatureCapability::Hover,
      Self::Definition => FeatureCapability::Definition,
      Self::TypeDefinition => FeatureCapability::TypeDefinition,
      Self::References => FeatureCapability::References,
    }
  }

  fn timeout(self) -> Duration {
    match self {
      Self::References => Duration::from_secs(10),
      _ => Duration::from_secs(5),
    }
  }
}

#[derive(Debug, Error)]
pub enum ClientError {
  #[error("client is already running")]
  AlreadyRunning,
  #[error(transparent)]
  Spawn(#[from] TransportError),
  #[error("failed to spawn client worker thread")]
  WorkerSpawn,
  #[error("initialize failed: {0}")]
  Initialize(String),
  #[error("initialize timed out after {0} ms")]
  InitializeTimeout(u128),
  #[error("server exited during handshake")]
  HandshakeAborted,
  #[error("client stopped")]
  Stopped,
  #[error("client worker is gone")]
  WorkerGone,
}

#[derive(Debug)]
enum RequestFailure {
  TimedOut(Duration),
  Cancelled,
  Stopped,
  Rejected(protocol::ResponseError),
}

struct PendingRequest {
  method:    &'static str,
  deadline:  Instant,
  timeout:   Duration,
  responder: Sender<Result<Value, RequestFailure>>,
  slot:      Option<FeatureSlot>,
  uri:       Option<String>,
}

struct DocumentState {
  version: i32,
  text:    Rope,
}

/// Everything the invariants in the session depend on lives behind one lock:
/// the pending, document, slot and debounce tables move together.
struct SessionState {
  sender:       Option<MessageSender>,
  capabilities: Option<ServerCapabilitiesSnapshot>,
  initialized:  bool,
  pending:      HashMap<u64, PendingRequest>,
  documents:    HashMap<String, DocumentState>,
  slots:        HashMap<FeatureSlot, u64>,
  debounce:     HashMap<String, Instant>,
  restarts:     u32,
}

impl SessionState {
  fn new() -> Self {
    Self {
      sender:       None,
      capabilities: None,
      initialized:  false,
      pending:      HashMap::new(),
      documents:    HashMap::new(),
      slots:        HashMap::new(),
      debounce:     HashMap::new(),
      restarts:     0,
    }
  }

  fn remove_pending(&mut self, id: u64) -> Option<PendingRequest> {
    let pending = self.pending.remove(&id)?;
    // A later request that already took the slot keeps it.
    if let Some(slot) = pending.slot
      && self.slots.get(&slot) == Some(&id)
    {
      self.slots.remove(&slot);
    }
    Some(pending)
  }

  fn reject_all_pending(&mut self, failure: impl Fn() -> RequestFailure) {
    for (_, pending) in self.pending.drain() {
      let _ = pending.responder.send(Err(failure()));
    }
    self.slots.clear();
  }
}

enum Command {
  Start {
    root_uri: String,
    reply:    Sender<Result<(), ClientError>>,
  },
  Stop {
    reply: Sender<()>,
  },
}

type RestartHook = Arc<dyn Fn() + Send + Sync>;

/// One LSP session: owns its transport generations, keeps the wire honest
/// (ids, versions, slots) and restarts the server when it dies.
pub struct LanguageClient {
  server_id:       String,
  options:         ClientOptions,
  state:           Arc<Mutex<SessionState>>,
  next_request_id: Arc<AtomicU64>,
  command_tx:      Sender<Command>,
  worker:          Mutex<Option<JoinHandle<()>>>,
  listeners:       DiagnosticListeners,
  restart_hook:    Arc<Mutex<Option<RestartHook>>>,
}

impl LanguageClient {
  pub fn new(
    server_id: impl Into<String>,
    factory: Arc<dyn TransportFactory>,
    options: ClientOptions,
    events: Sender<LspEvent>,
  ) -> Result<Self, ClientError> {
    let server_id = server_id.into();
    let state = Arc::new(Mutex::new(SessionState::new()));
    let next_request_id = Arc::new(AtomicU64::new(1));
    let listeners = DiagnosticListeners::new();
    let restart_hook: Arc<Mutex<Option<RestartHook>>> = Arc::new(Mutex::new(None));

    let (command_tx, command_rx) = channel();
    let worker = Worker {
      server_id: server_id.clone(),
      factory,
      options: options.clone(),
      state: Arc::clone(&state),
      next_request_id: Arc::clone(&next_request_id),
      command_rx,
      events,
      listeners: listeners.clone(),
      restart_hook: Arc::clone(&restart_hook),
      transport: None,
      handshake: None,
      stopping: None,
      restart_at: None,
      root_uri: None,
    };
    let handle = thread::Builder::new()
      .name(format!("{server_id}-worker"))
      .spawn(move || worker.run())
      .map_err(|_| ClientError::WorkerSpawn)?;

    Ok(Self {
      server_id,
      options,
      state,
      next_request_id,
      command_tx,
      worker: Mutex::new(Some(handle)),
      listeners,
      restart_hook,
    })
  }

  pub fn server_id(&self) -> &str {
    &self.server_id
  }

  pub fn is_initialized(&self) -> bool {
    self.lock_state().initialized
  }

  pub fn capabilities(&self) -> Option<ServerCapabilitiesSnapshot> {
    self.lock_state().capabilities.clone()
  }

  /// Run the handshake against a fresh server process. Blocks the caller
  /// until `initialize`/`initialized` completed or failed.
  pub fn start(&self, root_uri: &str) -> Result<(), ClientError> {
    let (reply_tx, reply_rx) = channel();
    self
      .command_tx
      .send(Command::Start {
        root_uri: root_uri.to_string(),
        reply:    reply_tx,
      })
      .map_err(|_| ClientError::WorkerGone)?;
    reply_rx
      .recv_timeout(self.options.initialize_timeout + RESPONDER_GRACE)
      .map_err(|_| ClientError::WorkerGone)?
  }

  /// `shutdown` → `exit` → kill, then release every pending request, timer
  /// and subscription. Safe to call on a never-started client.
  pub fn stop(&self) {
    let (reply_tx, reply_rx) = channel();
    if self
      .command_tx
      .send(Command::Stop { reply: reply_tx })
      .is_ok()
    {
      let _ = reply_rx.recv_timeout(SHUTDOWN_TIMEOUT + RESPONDER_GRACE);
    }
    if let Some(handle) = self
      .worker
      .lock()
      .unwrap_or_else(|err| err.into_inner())
      .take()
      && handle.join().is_err()
    {
      warn!(server = %self.server_id, "client worker panicked");
    }
  }

  pub fn subscribe_diagnostics(&self, callback: DiagnosticCallback) -> DiagnosticsSubscription {
    self.listeners.subscribe(callback)
  }

  /// Invoked after a successful supervised restart; the manager uses this to
  /// replay `didOpen` for the documents it still tracks.
  pub fn set_restart_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
    *self
      .restart_hook
      .lock()
      .unwrap_or_else(|err| err.into_inner()) = Some(Arc::new(hook));
  }

  pub fn did_open(&self, uri: &str, language_id: &str, text: &str) {
    let mut state = self.lock_state();
    if !state.initialized {
      return;
    }
    let Some(sender) = state.sender.clone() else {
      return;
    };
    state.documents.insert(uri.to_string(), DocumentState {
      version: 1,
      text:    Rope::from_str(text),
    });
    let params = text_sync::did_open_params(uri, language_id, 1, text);
    let _ = sender.send(protocol::notification_payload(
      "textDocument/didOpen",
      Some(params),
    ));
  }

  /// Apply edits to an open document. Incremental sync sends the edit ranges
  /// immediately; Full sync retains the new text and lets the debounce flush
  /// it. The version bumps once per wire send, never per keystroke.
  pub fn did_change(&self, uri: &str, edits: &[TextEdit], new_text: &str) {
    let mut state = self.lock_state();
    if !state.initialized {
      return;
    }
    let Some(sender) = state.sender.clone() else {
      return;
    };
    let sync_kind = state
      .capabilities
      .as_ref()
      .map(ServerCapabilitiesSnapshot::sync_kind)
      .unwrap_or(SyncKind::Full);
    let Some(document) = state.documents.get_mut(uri) else {
      return;
    };

    match sync_kind {
      SyncKind::None => {
        document.text = Rope::from_str(new_text);
      },
      SyncKind::Incremental => {
        // An edits-less call is a whole-document replace; a change event
        // without a range carries the full text even under incremental sync.
        let changes = if edits.is_empty() {
          document.text = Rope::from_str(new_text);
          text_sync::full_content_change(&document.text)
        } else {
          let changes = text_sync::incremental_content_changes(&document.text, edits);
          document.text = Rope::from_str(new_text);
          changes
        };
        document.version += 1;
        let params = text_sync::did_change_params(uri, document.version, changes);
        let _ = sender.send(protocol::notification_payload(
          "textDocument/didChange",
          Some(params),
        ));
      },
      SyncKind::Full => {
        document.text = Rope::from_str(new_text);
        state
          .debounce
          .insert(uri.to_string(), Instant::now() + FULL_SYNC_DEBOUNCE);
      },
    }
  }

  pub fn did_save(&self, uri: &str, text: Option<&str>) {
    let mut state = self.lock_state();
    if !state.initialized {
      return;
    }
    let Some(sender) = state.sender.clone() else {
      return;
    };
    flush_debounced_change(&mut state, uri, &sender);
    let include_text = state
      .capabilities
      .as_ref()
      .is_some_and(ServerCapabilitiesSnapshot::save_include_text);
    let text = if include_text { text } else { None };
    let params = text_sync::did_save_params(uri, text);
    let _ = sender.send(protocol::notification_payload(
      "textDocument/didSave",
      Some(params),
    ));
  }

  /// Close a document. Its in-flight feature requests are cancelled and a
  /// pending debounced change flushes before `didClose` hits the wire.
  pub fn did_close(&self, uri: &str) {
    let mut state = self.lock_state();
    let Some(sender) = state.sender.clone() else {
      state.documents.remove(uri);
      state.debounce.remove(uri);
      return;
    };

    let in_flight: Vec<u64> = state
      .pending
      .iter()
      .filter(|(_, pending)| pending.uri.as_deref() == Some(uri))
      .map(|(id, _)| *id)
      .collect();
    for id in in_flight {
      if let Some(pending) = state.remove_pending(id) {
        let _ = sender.send(protocol::notification_payload(
          "$/cancelRequest",
          Some(protocol::cancel_params(id)),
        ));
        let _ = pending.responder.send(Err(RequestFailure::Cancelled));
      }
    }

    flush_debounced_change(&mut state, uri, &sender);
    state.documents.remove(uri);
    let params = text_sync::did_close_params(uri);
    let _ = sender.send(protocol::notification_payload(
      "textDocument/didClose",
      Some(params),
    ));
  }

  pub fn completion(&self, uri: &str, position: Position) -> Option<Vec<CompletionItem>> {
    let result = self.slot_request(FeatureSlot::Completion, uri, completion_params(uri, position))?;
    match parse_completion_response(Some(&result)) {
      Ok(items) => Some(items),
      Err(err) => {
        warn!(server = %self.server_id, error = %err, "completion response unusable");
        None
      },
    }
  }

  pub fn hover(&self, uri: &str, position: Position) -> Option<String> {
    let result = self.slot_request(FeatureSlot::Hover, uri, hover_params(uri, position))?;
    match parse_hover_response(Some(&result)) {
      Ok(hover) => hover,
      Err(err) => {
        warn!(server = %self.server_id, error = %err, "hover response unusable");
        None
      },
    }
  }

  pub fn definition(&self, uri: &str, position: Position) -> Option<Vec<Location>> {
    self.locations_request(FeatureSlot::Definition, uri, definition_params(uri, position))
  }

  pub fn type_definition(&self, uri: &str, position: Position) -> Option<Vec<Location>> {
    self.locations_request(
      FeatureSlot::TypeDefinition,
      uri,
      type_definition_params(uri, position),
    )
  }

  pub fn references(&self, uri: &str, position: Position) -> Option<Vec<Location>> {
    self.locations_request(FeatureSlot::References, uri, references_params(uri, position))
  }

  fn locations_request(
    &self,
    slot: FeatureSlot,
    uri: &str,
    params: Value,
  ) -> Option<Vec<Location>> {
    let result = self.slot_request(slot, uri, params)?;
    match parse_locations_response(Some(&result)) {
      Ok(locations) => Some(locations),
      Err(err) => {
        warn!(server = %self.server_id, error = %err, "locations response unusable");
        None
      },
    }
  }

  /// Issue a supersedable request through its feature slot and block until
  /// it resolves. Every non-fatal outcome folds to `None`.
  fn slot_request(&self, slot: FeatureSlot, uri: &str, params: Value) -> Option<Value> {
    let receiver = {
      let mut state = self.lock_state();
      if !state.initialized {
        return None;
      }
      if !state
        .capabilities
        .as_ref()
        .is_some_and(|capabilities| capabilities.supports(slot.capability()))
      {
        return None;
      }
      let sender = state.sender.clone()?;

      let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
      // The cancel for a superseded predecessor goes on the wire before the
      // request that replaces it; both happen under the state lock so the
      // ordering is atomic.
      if let Some(prior) = state.slots.insert(slot, id)
        && let Some(pending) = state.pending.remove(&prior)
      {
        let _ = sender.send(protocol::notification_payload(
          "$/cancelRequest",
          Some(protocol::cancel_params(prior)),
        ));
        let _ = pending.responder.send(Err(RequestFailure::Cancelled));
      }

      let (responder, receiver) = channel();
      let timeout = slot.timeout();
      state.pending.insert(id, PendingRequest {
        method: slot.method(),
        deadline: Instant::now() + timeout,
        timeout,
        responder,
        slot: Some(slot),
        uri: Some(uri.to_string()),
      });
      if sender
        .send(protocol::request_payload(id, slot.method(), Some(params)))
        .is_err()
      {
        state.remove_pending(id);
        return None;
      }
      receiver
    };

    match receiver.recv_timeout(slot.timeout() + RESPONDER_GRACE) {
      Ok(Ok(result)) => Some(result),
      Ok(Err(RequestFailure::Rejected(error))) => {
        warn!(
          server = %self.server_id,
          method = slot.method(),
          code = error.code,
          message = %error.message,
          "feature request rejected by server"
        );
        None
      },
      Ok(Err(failure)) => {
        debug!(server = %self.server_id, method = slot.method(), ?failure, "feature request folded to none");
        None
      },
      Err(_) => None,
    }
  }

  fn lock_state(&self) -> MutexGuard<'_, SessionState> {
    self.state.lock().unwrap_or_else(|err| err.into_inner())
  }
}

impl Drop for LanguageClient {
  fn drop(&mut self) {
    self.stop();
  }
}

/// Flush a document's pending debounced change, if any, before an operation
/// that must observe the latest text on the server side.
fn flush_debounced_change(state: &mut SessionState, uri: &str, sender: &MessageSender) {
  if state.debounce.remove(uri).is_none() {
    return;
  }
  let Some(document) = state.documents.get_mut(uri) else {
    return;
  };
  document.version += 1;
  let params = text_sync::did_change_params(
    uri,
    document.version,
    text_sync::full_content_change(&document.text),
  );
  let _ = sender.send(protocol::notification_payload(
    "textDocument/didChange",
    Some(params),
  ));
}

fn restart_delay(base: Duration, attempt: u32) -> Duration {
  base * 2u32.saturating_pow(attempt.saturating_sub(1))
}

fn initialize_params(root_uri: &str) -> Value {
  json!({
    "processId": Value::Null,
    "rootUri": root_uri,
    "workspaceFolders": [{ "uri": root_uri, "name": "root" }],
    "capabilities": client_capabilities(),
  })
}

fn client_capabilities() -> Value {
  json!({
    "textDocument": {
      "completion": {
        "completionItem": {
          "snippetSupport": false,
          "documentationFormat": ["markdown", "plaintext"],
        }
      },
      "hover": {
        "contentFormat": ["markdown", "plaintext"],
      },
      "definition": {},
      "references": {},
      "typeDefinition": {},
      "publishDiagnostics": {
        "relatedInformation": true,
      },
      "synchronization": {
        "didSave": true,
      },
    },
    "workspace": {
      "workspaceFolders": true,
    },
  })
}

struct Handshake {
  request_id: u64,
  deadline:   Instant,
  /// Present for the initial `start`; restart attempts have no caller to
  /// answer.
  reply:      Option<Sender<Result<(), ClientError>>>,
}

struct StopState {
  outcome: Receiver<Result<Value, RequestFailure>>,
  replies: Vec<Sender<()>>,
}

struct Worker {
  server_id:       String,
  factory:         Arc<dyn TransportFactory>,
  options:         ClientOptions,
  state:           Arc<Mutex<SessionState>>,
  next_request_id: Arc<AtomicU64>,
  command_rx:      Receiver<Command>,
  events:          Sender<LspEvent>,
  listeners:       DiagnosticListeners,
  restart_hook:    Arc<Mutex<Option<RestartHook>>>,
  transport:       Option<ServerTransport>,
  handshake:       Option<Handshake>,
  stopping:        Option<StopState>,
  restart_at:      Option<Instant>,
  root_uri:        Option<String>,
}

impl Worker {
  fn run(mut self) {
    debug!(server = %self.server_id, "client worker started");
    loop {
      self.drain_transport();
      self.check_pending_timeouts();
      self.check_handshake_timeout();
      self.flush_due_changes();
      self.check_restart_deadline();
      if self.check_stop_progress() {
        break;
      }

      match self.command_rx.recv_timeout(WORKER_TICK) {
        Ok(Command::Start { root_uri, reply }) => self.handle_start(root_uri, reply),
        Ok(Command::Stop { reply }) => {
          if self.begin_stop(reply) {
            break;
          }
        },
        Err(RecvTimeoutError::Timeout) => {},
        Err(RecvTimeoutError::Disconnected) => {
          self.teardown();
          break;
        },
      }
    }
    self.emit(LspEvent::ClientStopped {
      server_id: self.server_id.clone(),
    });
    debug!(server = %self.server_id, "client worker stopped");
  }

  fn handle_start(&mut self, root_uri: String, reply: Sender<Result<(), ClientError>>) {
    let busy = self.handshake.is_some()
      || self.restart_at.is_some()
      || self.stopping.is_some()
      || self.lock_state().initialized;
    if busy {
      let _ = reply.send(Err(ClientError::AlreadyRunning));
      return;
    }
    self.root_uri = Some(root_uri.clone());
    self.begin_handshake(&root_uri, Some(reply));
  }

  fn begin_handshake(&mut self, root_uri: &str, reply: Option<Sender<Result<(), ClientError>>>) {
    let transport = match self.factory.connect() {
      Ok(transport) => transport,
      Err(err) => {
        warn!(server = %self.server_id, error = %err, "failed to spawn server");
        self.emit(LspEvent::SpawnFailed {
          server_id: self.server_id.clone(),
          error:     err.to_string(),
        });
        match reply {
          Some(reply) => {
            let _ = reply.send(Err(ClientError::Spawn(err)));
          },
          // Respawn failed mid-ladder; climb to the next rung.
          None => self.schedule_restart(),
        }
        return;
      },
    };

    let sender = transport.sender();
    self.lock_state().sender = sender.clone();
    self.transport = Some(transport);
    self.emit(LspEvent::ServerStarted {
      server_id: self.server_id.clone(),
      command:   self.factory.describe(),
    });

    let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
    let params = initialize_params(root_uri);
    let sent = sender.is_some_and(|sender| {
      sender
        .send(protocol::request_payload(id, "initialize", Some(params)))
        .is_ok()
    });
    if !sent {
      self.abort_handshake_transport(reply, ClientError::HandshakeAborted);
      return;
    }

    self.handshake = Some(Handshake {
      request_id: id,
      deadline: Instant::now() + self.options.initialize_timeout,
      reply,
    });
  }

  fn abort_handshake_transport(
    &mut self,
    reply: Option<Sender<Result<(), ClientError>>>,
    error: ClientError,
  ) {
    match reply {
      Some(reply) => {
        if let Some(mut transport) = self.transport.take() {
          transport.kill();
        }
        self.lock_state().sender = None;
        let _ = reply.send(Err(error));
      },
      // A failed restart handshake walks the same path as a crash, so the
      // ladder keeps climbing until the cap.
      None => self.handle_server_exit(None),
    }
  }

  fn check_handshake_timeout(&mut self) {
    let timed_out = self
      .handshake
      .as_ref()
      .is_some_and(|handshake| Instant::now() >= handshake.deadline);
    if !timed_out {
      return;
    }
    let Some(handshake) = self.handshake.take() else {
      return;
    };
    warn!(server = %self.server_id, "initialize timed out");
    self.abort_handshake_transport(
      handshake.reply,
      ClientError::InitializeTimeout(self.options.initialize_timeout.as_millis()),
    );
  }

  fn complete_handshake(&mut self, handshake: Handshake, response: Response) {
    if let Some(error) = response.error {
      warn!(
        server = %self.server_id,
        code = error.code,
        message = %error.message,
        "initialize rejected"
      );
      self.abort_handshake_transport(
        handshake.reply,
        ClientError::Initialize(format!("{} ({})", error.message, error.code)),
      );
      return;
    }

    let raw_capabilities = response
      .result
      .as_ref()
      .and_then(|result| result.get("capabilities"))
      .cloned()
      .unwrap_or(Value::Null);
    let snapshot = ServerCapabilitiesSnapshot::from_raw(raw_capabilities);

    let sender = {
      let mut state = self.lock_state();
      state.capabilities = Some(snapshot);
      state.initialized = true;
      state.restarts = 0;
      state.sender.clone()
    };
    if let Some(sender) = sender {
      let _ = sender.send(protocol::notification_payload(
        "initialized",
        Some(json!({})),
      ));
    }
    debug!(server = %self.server_id, "session initialized");

    let was_restart = handshake.reply.is_none();
    if let Some(reply) = handshake.reply {
      let _ = reply.send(Ok(()));
    }
    if was_restart {
      let hook = self
        .restart_hook
        .lock()
        .unwrap_or_else(|err| err.into_inner())
        .clone();
      if let Some(hook) = hook {
        hook();
      }
    }
  }

  fn drain_transport(&mut self) {
    let Some(transport) = self.transport.as_mut() else {
      return;
    };

    let mut closed = false;
    let mut inbound = Vec::new();
    while let Some(event) = transport.try_recv_event() {
      match event {
        TransportEvent::Message(raw) => inbound.push(raw),
        TransportEvent::Stderr(line) => {
          debug!(server = %self.server_id, line = %line, "server stderr");
          let _ = self.events.send(LspEvent::ServerStderr {
            server_id: self.server_id.clone(),
            line,
          });
        },
        TransportEvent::Closed => {
          closed = true;
          break;
        },
      }
    }

    let exit_code = transport.poll_exit_code();
    for raw in inbound {
      self.handle_incoming(&raw);
    }
    if closed || exit_code.is_some() {
      self.handle_server_exit(exit_code);
    }
  }

  fn handle_incoming(&mut self, raw: &str) {
    match protocol::classify(raw) {
      Ok(Incoming::Response(response)) => self.handle_response(response),
      Ok(Incoming::Notification(notification)) => self.handle_notification(notification),
      Ok(Incoming::ServerRequest(request)) => self.acknowledge_server_request(request),
      Err(err) => {
        // Invalid JSON in one frame is not worth a session.
        warn!(server = %self.server_id, error = %err, "dropping malformed message");
      },
    }
  }

  fn handle_response(&mut self, response: Response) {
    let Some(id) = response.numeric_id() else {
      return;
    };

    if let Some(handshake) = self
      .handshake
      .take_if(|handshake| handshake.request_id == id)
    {
      self.complete_handshake(handshake, response);
      return;
    }

    let Some(pending) = self.lock_state().remove_pending(id) else {
      // A response for a request we already cancelled or timed out.
      return;
    };
    match response.error {
      Some(error) => {
        let _ = pending
          .responder
          .send(Err(RequestFailure::Rejected(error)));
      },
      None => {
        let _ = pending
          .responder
          .send(Ok(response.result.unwrap_or(Value::Null)));
      },
    }
  }

  fn handle_notification(&mut self, notification: Notification) {
    match notification.method.as_str() {
      "textDocument/publishDiagnostics" => {
        match parse_publish_diagnostics(notification.params.as_ref()) {
          Ok((uri, diagnostics)) => self.listeners.publish(&uri, &diagnostics),
          Err(err) => {
            warn!(server = %self.server_id, error = %err, "dropping publishDiagnostics");
          },
        }
      },
      "window/logMessage" => {
        let params = notification.params.unwrap_or(Value::Null);
        let kind = params
          .get("type")
          .and_then(Value::as_u64)
          .and_then(|code| LogMessageKind::from_lsp_code(code as u8));
        let message = params
          .get("message")
          .and_then(Value::as_str)
          .unwrap_or_default()
          .to_string();
        debug!(server = %self.server_id, message = %message, "server log");
        let _ = self.events.send(LspEvent::LogMessage {
          server_id: self.server_id.clone(),
          kind,
          message,
        });
      },
      _ => {},
    }
  }

  fn acknowledge_server_request(&mut self, request: ServerRequest) {
    debug!(server = %self.server_id, method = %request.method, "acknowledging server request");
    let sender = self.lock_state().sender.clone();
    if let Some(sender) = sender {
      let _ = sender.send(protocol::ack_payload(&request.id));
    }
  }

  fn check_pending_timeouts(&mut self) {
    let now = Instant::now();
    let expired = {
      let mut state = self.lock_state();
      let ids: Vec<u64> = state
        .pending
        .iter()
        .filter(|(_, pending)| now >= pending.deadline)
        .map(|(id, _)| *id)
        .collect();
      ids
        .into_iter()
        .filter_map(|id| state.remove_pending(id).map(|pending| (id, pending)))
        .collect::<Vec<_>>()
    };

    for (id, pending) in expired {
      warn!(
        server = %self.server_id,
        method = pending.method,
        id,
        "request timed out after {} ms",
        pending.timeout.as_millis()
      );
      let _ = self.events.send(LspEvent::RequestTimedOut {
        server_id: self.server_id.clone(),
        method:    pending.method.to_string(),
        id,
      });
      let _ = pending
        .responder
        .send(Err(RequestFailure::TimedOut(pending.timeout)));
    }
  }

  fn flush_due_changes(&mut self) {
    let now = Instant::now();
    let mut state = self.lock_state();
    let Some(sender) = state.sender.clone() else {
      return;
    };
    let due: Vec<String> = state
      .debounce
      .iter()
      .filter(|(_, deadline)| now >= **deadline)
      .map(|(uri, _)| uri.clone())
      .collect();
    for uri in due {
      state.debounce.remove(&uri);
      let Some(document) = state.documents.get_mut(&uri) else {
        continue;
      };
      document.version += 1;
      let params = text_sync::did_change_params(
        &uri,
        document.version,
        text_sync::full_content_change(&document.text),
      );
      let _ = sender.send(protocol::notification_payload(
        "textDocument/didChange",
        Some(params),
      ));
    }
  }

  fn handle_server_exit(&mut self, code: Option<i32>) {
    let code = match self.transport.take() {
      Some(mut transport) => {
        let code = code.or_else(|| transport.poll_exit_code());
        transport.kill();
        code
      },
      None => code,
    };
    warn!(server = %self.server_id, ?code, "server exited");
    self.emit(LspEvent::ServerExited {
      server_id: self.server_id.clone(),
      code,
    });

    let handshake = self.handshake.take();
    {
      let mut state = self.lock_state();
      state.sender = None;
      state.initialized = false;
      state.capabilities = None;
      state.reject_all_pending(|| RequestFailure::Stopped);
      state.documents.clear();
      state.debounce.clear();
    }

    if let Some(handshake) = handshake
      && let Some(reply) = handshake.reply
    {
      // The very first handshake died with its server: report to the caller
      // and leave restarting to a future `start`.
      let _ = reply.send(Err(ClientError::HandshakeAborted));
      return;
    }
    if self.stopping.is_some() {
      return;
    }
    self.schedule_restart();
  }

  fn schedule_restart(&mut self) {
    let restarts = {
      let mut state = self.lock_state();
      state.restarts += 1;
      state.restarts
    };
    if restarts > MAX_RESTARTS {
      warn!(server = %self.server_id, "restart limit exceeded, giving up");
      self.emit(LspEvent::MaxRestartsExceeded {
        server_id: self.server_id.clone(),
      });
      self.restart_at = None;
      return;
    }

    let delay = restart_delay(self.options.restart_backoff, restarts);
    debug!(server = %self.server_id, attempt = restarts, ?delay, "restart scheduled");
    self.emit(LspEvent::RestartScheduled {
      server_id: self.server_id.clone(),
      attempt: restarts,
      delay,
    });
    self.restart_at = Some(Instant::now() + delay);
  }

  fn check_restart_deadline(&mut self) {
    let due = self
      .restart_at
      .is_some_and(|deadline| Instant::now() >= deadline);
    if !due {
      return;
    }
    self.restart_at = None;
    let Some(root_uri) = self.root_uri.clone() else {
      return;
    };
    self.begin_handshake(&root_uri, None);
  }

  fn begin_stop(&mut self, reply: Sender<()>) -> bool {
    if let Some(stopping) = self.stopping.as_mut() {
      stopping.replies.push(reply);
      return false;
    }

    let initialized = self.lock_state().initialized;
    if !initialized {
      if let Some(handshake) = self.handshake.take()
        && let Some(handshake_reply) = handshake.reply
      {
        let _ = handshake_reply.send(Err(ClientError::Stopped));
      }
      self.teardown();
      let _ = reply.send(());
      return true;
    }

    let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
    let (responder, outcome) = channel();
    {
      let mut state = self.lock_state();
      state.pending.insert(id, PendingRequest {
        method: "shutdown",
        deadline: Instant::now() + SHUTDOWN_TIMEOUT,
        timeout: SHUTDOWN_TIMEOUT,
        responder,
        slot: None,
        uri: None,
      });
      if let Some(sender) = &state.sender {
        let _ = sender.send(protocol::request_payload(id, "shutdown", None));
      }
    }
    self.stopping = Some(StopState {
      outcome,
      replies: vec![reply],
    });
    false
  }

  /// True once the stop sequence finished; the shutdown response, its
  /// timeout, and a server exit all funnel here.
  fn check_stop_progress(&mut self) -> bool {
    let done = match &self.stopping {
      None => return false,
      Some(stopping) => {
        !matches!(stopping.outcome.try_recv(), Err(TryRecvError::Empty))
      },
    };
    if !done {
      return false;
    }
    let Some(stopping) = self.stopping.take() else {
      return false;
    };

    let sender = self.lock_state().sender.clone();
    if let Some(sender) = sender {
      let _ = sender.send(protocol::notification_payload("exit", None));
    }
    self.teardown();
    for reply in stopping.replies {
      let _ = reply.send(());
    }
    true
  }

  fn teardown(&mut self) {
    if let Some(mut transport) = self.transport.take() {
      transport.kill();
    }
    if let Some(handshake) = self.handshake.take()
      && let Some(reply) = handshake.reply
    {
      let _ = reply.send(Err(ClientError::Stopped));
    }
    self.restart_at = None;
    self.listeners.clear();
    let mut state = self.lock_state();
    state.sender = None;
    state.initialized = false;
    state.capabilities = None;
    state.reject_all_pending(|| RequestFailure::Stopped);
    state.documents.clear();
    state.debounce.clear();
  }

  fn emit(&self, event: LspEvent) {
    let _ = self.events.send(event);
  }

  fn lock_state(&self) -> MutexGuard<'_, SessionState> {
    self.state.lock().unwrap_or_else(|err| err.into_inner())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  struct NoTransport;

  impl TransportFactory for NoTransport {
    fn connect(&self) -> Result<ServerTransport, TransportError> {
      Err(TransportError::StdinClosed)
    }

    fn describe(&self) -> String {
      "none".to_string()
    }
  }

  fn idle_worker() -> (Worker, Receiver<LspEvent>) {
    let (events_tx, events_rx) = channel();
    let worker = Worker {
      server_id:       "lsp-test".to_string(),
      factory:         Arc::new(NoTransport),
      options:         ClientOptions::default(),
      state:           Arc::new(Mutex::new(SessionState::new())),
      next_request_id: Arc::new(AtomicU64::new(1)),
      command_rx:      channel().1,
      events:          events_tx,
      listeners:       DiagnosticListeners::new(),
      restart_hook:    Arc::new(Mutex::new(None)),
      transport:       None,
      handshake:       None,
      stopping:        None,
      restart_at:      None,
      root_uri:        None,
    };
    (worker, events_rx)
  }

  #[test]
  fn the_timeout_sweep_rejects_expired_requests_and_empties_their_slot() {
    let (mut worker, events_rx) = idle_worker();
    let (responder, response_rx) = channel();
    {
      let mut state = worker.lock_state();
      state.pending.insert(7, PendingRequest {
        method:    "textDocument/hover",
        deadline:  Instant::now() - Duration::from_millis(1),
        timeout:   Duration::from_secs(5),
        responder,
        slot:      Some(FeatureSlot::Hover),
        uri:       None,
      });
      state.slots.insert(FeatureSlot::Hover, 7);
    }

    worker.check_pending_timeouts();

    let state = worker.lock_state();
    assert!(state.pending.is_empty());
    assert!(state.slots.is_empty());
    drop(state);
    assert!(matches!(
      response_rx.try_recv(),
      Ok(Err(RequestFailure::TimedOut(_)))
    ));
    assert!(matches!(
      events_rx.try_recv(),
      Ok(LspEvent::RequestTimedOut { id: 7, .. })
    ));
  }

  #[test]
  fn unexpired_requests_survive_the_sweep() {
    let (mut worker, _events_rx) = idle_worker();
    let (responder, response_rx) = channel();
    worker.lock_state().pending.insert(3, PendingRequest {
      method:    "textDocument/references",
      deadline:  Instant::now() + Duration::from_secs(10),
      timeout:   Duration::from_secs(10),
      responder,
      slot:      Some(FeatureSlot::References),
      uri:       None,
    });

    worker.check_pending_timeouts();

    assert_eq!(worker.lock_state().pending.len(), 1);
    assert!(response_rx.try_recv().is_err());
  }

  #[test]
  fn restart_delays_double_from_the_base() {
    let base = Duration::from_millis(2000);
    assert_eq!(restart_delay(base, 1), Duration::from_millis(2000));
    assert_eq!(restart_delay(base, 2), Duration::from_millis(4000));
    assert_eq!(restart_delay(base, 3), Duration::from_millis(8000));
  }

  #[test]
  fn initialize_params_follow_the_handshake_shape() {
    let params = initialize_params("file:///w");
    assert_eq!(params["processId"], Value::Null);
    assert_eq!(params["rootUri"], json!("file:///w"));
    assert_eq!(params["workspaceFolders"][0]["name"], json!("root"));
    let completion_item =
      &params["capabilities"]["textDocument"]["completion"]["completionItem"];
    assert_eq!(completion_item["snippetSupport"], json!(false));
    assert_eq!(
      params["capabilities"]["workspace"]["workspaceFolders"],
      json!(true)
    );
    assert_eq!(
      params["capabilities"]["textDocument"]["publishDiagnostics"]["relatedInformation"],
      json!(true)
    );
  }

  #[test]
  fn feature_slots_carry_their_methods_and_timeouts() {
    assert_eq!(FeatureSlot::Hover.method(), "textDocument/hover");
    assert_eq!(FeatureSlot::Hover.timeout(), Duration::from_secs(5));
    assert_eq!(FeatureSlot::References.timeout(), Duration::from_secs(10));
  }

  #[test]
  fn slot_is_kept_by_a_newer_request_on_removal() {
    let mut state = SessionState::new();
    let (old_tx, _old_rx) = channel();
    let (new_tx, _new_rx) = channel();
    state.pending.insert(1, PendingRequest {
      method:    "textDocument/hover",
      deadline:  Instant::now(),
      timeout:   Duration::from_secs(5),
      responder: old_tx,
      slot:      Some(FeatureSlot::Hover),
      uri:       None,
    });
    state.pending.insert(2, PendingRequest {
      method:    "textDocument/hover",
      deadline:  Instant::now(),
      timeout:   Duration::from_secs(5),
      responder: new_tx,
      slot:      Some(FeatureSlot::Hover),
      uri:       None,
    });
    state.slots.insert(FeatureSlot::Hover, 2);

    // Removing the superseded request leaves the slot with its successor.
    state.remove_pending(1);
    assert_eq!(state.slots.get(&FeatureSlot::Hover), Some(&2));
    // Removing the current holder clears it.
    state.remove_pending(2);
    assert!(state.slots.is_empty());
  }

  #[test]
  fn rejecting_all_pending_empties_the_tables() {
    let mut state = SessionState::new();
    let (tx, rx) = channel();
    state.pending.insert(9, PendingRequest {
      method:    "textDocument/completion",
      deadline:  Instant::now(),
      timeout:   Duration::from_secs(5),
      responder: tx,
      slot:      Some(FeatureSlot::Completion),
      uri:       None,
    });
    state.slots.insert(FeatureSlot::Completion, 9);

    state.reject_all_pending(|| RequestFailure::Stopped);
    assert!(state.pending.is_empty());
    assert!(state.slots.is_empty());
    assert!(matches!(rx.try_recv(), Ok(Err(RequestFailure::Stopped))));
  }
}
