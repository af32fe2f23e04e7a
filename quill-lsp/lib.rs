mod capabilities;
mod client;
mod config;
mod diagnostics;
mod event;
mod features;
mod manager;
pub mod protocol;
pub mod text_sync;
mod transport;

#[cfg(any(test, feature = "test-support"))]
pub mod test;

pub use capabilities::{
  FeatureCapability,
  ServerCapabilitiesSnapshot,
  SyncKind,
};
pub use client::{
  ClientError,
  ClientOptions,
  CommandTransportFactory,
  FeatureSlot,
  LanguageClient,
  TransportFactory,
};
pub use config::{
  ConfigError,
  ServerConfig,
  ServerOverride,
  ServerRegistry,
  lsp_language_id,
};
pub use diagnostics::{
  Diagnostic,
  DiagnosticCallback,
  DiagnosticPosition,
  DiagnosticRange,
  DiagnosticSeverity,
  DiagnosticsSubscription,
  PublishDiagnosticsError,
  RelatedInformation,
  parse_publish_diagnostics,
};
pub use event::{
  LogMessageKind,
  LspEvent,
};
pub use features::{
  CompletionItem,
  FeatureParseError,
  Location,
  Position,
  Range,
  parse_completion_response,
  parse_hover_response,
  parse_locations_response,
};
pub use manager::{
  LspManager,
  TransportConnector,
};
pub use text_sync::{
  TextEdit,
  normalize_path,
  path_to_uri,
  uri_to_path,
};
pub use transport::{
  MessageSender,
  ServerTransport,
  TransportError,
  TransportEvent,
};
