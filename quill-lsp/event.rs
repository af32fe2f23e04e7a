use std::time::Duration;

/// Numeric `window/logMessage` types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogMessageKind {
  Error,
  Warning,
  Info,
  Log,
}

impl LogMessageKind {
  pub fn from_lsp_code(code: u8) -> Option<Self> {
    match code {
      1 => Some(Self::Error),
      2 => Some(Self::Warning),
      3 => Some(Self::Info),
      4 => Some(Self::Log),
      _ => None,
    }
  }
}

/// Telemetry surfaced to the host. Feature callers never see these; they get
/// `None` and the event stream carries the why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LspEvent {
  ServerStarted {
    server_id: String,
    command:   String,
  },
  ServerStderr {
    server_id: String,
    line:      String,
  },
  ServerExited {
    server_id: String,
    code:      Option<i32>,
  },
  SpawnFailed {
    server_id: String,
    error:     String,
  },
  RestartScheduled {
    server_id: String,
    attempt:   u32,
    delay:     Duration,
  },
  MaxRestartsExceeded {
    server_id: String,
  },
  RequestTimedOut {
    server_id: String,
    method:    String,
    id:        u64,
  },
  LogMessage {
    server_id: String,
    kind:      Option<LogMessageKind>,
    message:   String,
  },
  ClientStopped {
    server_id: String,
  },
}
