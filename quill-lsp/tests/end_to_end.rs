//! End-to-end scenarios against the scripted fake server.

use std::{
  path::Path,
  sync::{
    Arc,
    mpsc::{
      Receiver,
      channel,
    },
  },
  thread,
  time::Duration,
};

use quill_lsp::{
  ClientOptions,
  LanguageClient,
  LspEvent,
  LspManager,
  Position,
  ServerConfig,
  TextEdit,
  TransportFactory,
  test::{
    FakeServer,
    FakeServerFactory,
    ServerScript,
  },
};
use serde_json::{
  Value,
  json,
};

const WAIT: Duration = Duration::from_secs(3);

fn fast_options() -> ClientOptions {
  ClientOptions {
    initialize_timeout: Duration::from_secs(2),
    restart_backoff:    Duration::from_millis(25),
  }
}

fn start_client(
  factory: &Arc<FakeServerFactory>,
) -> (Arc<LanguageClient>, Receiver<LspEvent>, FakeServer) {
  let (events_tx, events_rx) = channel();
  let client = Arc::new(
    LanguageClient::new(
      "lsp-test",
      Arc::clone(factory) as Arc<dyn TransportFactory>,
      fast_options(),
      events_tx,
    )
    .expect("client builds"),
  );
  client.start("file:///w").expect("handshake succeeds");
  let server = factory.server(0).expect("first generation exists");
  (client, events_rx, server)
}

fn index_of(messages: &[Value], predicate: impl Fn(&Value) -> bool) -> Option<usize> {
  messages.iter().position(predicate)
}

fn is_method(message: &Value, method: &str) -> bool {
  message.get("method").and_then(Value::as_str) == Some(method)
}

#[test]
fn open_hover_close_round_trip() {
  let script = ServerScript::new()
    .with_capabilities(json!({ "hoverProvider": true, "textDocumentSync": 1 }))
    .respond("textDocument/hover", json!({ "contents": "number" }));
  let factory = FakeServerFactory::new(script);
  let (client, _events, server) = start_client(&factory);

  client.did_open("file:///w/a.ts", "typescript", "const x = 1;");
  assert!(server.wait_for_count("textDocument/didOpen", 1, WAIT));
  let opened = &server.messages_of("textDocument/didOpen")[0];
  assert_eq!(opened["params"]["textDocument"]["version"], json!(1));
  assert_eq!(opened["params"]["textDocument"]["text"], json!("const x = 1;"));

  let hover = client.hover("file:///w/a.ts", Position::new(0, 6));
  assert_eq!(hover.as_deref(), Some("number"));
  assert_eq!(server.count_of("textDocument/hover"), 1);

  client.did_close("file:///w/a.ts");
  assert!(server.wait_for_count("textDocument/didClose", 1, WAIT));

  client.stop();
  assert!(server.wait_for_count("shutdown", 1, WAIT));
  assert!(server.wait_for_count("exit", 1, WAIT));
}

#[test]
fn superseded_hover_cancels_before_the_new_request() {
  let script = ServerScript::new()
    .with_capabilities(json!({ "hoverProvider": true }))
    .respond_after(
      "textDocument/hover",
      Duration::from_millis(100),
      json!({ "contents": "stale" }),
    )
    .respond("textDocument/hover", json!({ "contents": "fresh" }));
  let factory = FakeServerFactory::new(script);
  let (client, _events, server) = start_client(&factory);
  client.did_open("file:///w/a.ts", "typescript", "const x = 1;");

  let first_client = Arc::clone(&client);
  let first = thread::spawn(move || first_client.hover("file:///w/a.ts", Position::new(0, 6)));
  // The second hover fires once the first is on the wire but long before its
  // (delayed) response can arrive.
  assert!(server.wait_for_count("textDocument/hover", 1, WAIT));
  let second = client.hover("file:///w/a.ts", Position::new(0, 7));

  assert_eq!(first.join().expect("first hover thread"), None);
  assert_eq!(second.as_deref(), Some("fresh"));

  let messages = server.messages();
  let hovers: Vec<usize> = messages
    .iter()
    .enumerate()
    .filter(|(_, message)| is_method(message, "textDocument/hover"))
    .map(|(index, _)| index)
    .collect();
  assert_eq!(hovers.len(), 2, "exactly two hover requests hit the wire");
  let cancel =
    index_of(&messages, |message| is_method(message, "$/cancelRequest")).expect("cancel sent");
  assert!(hovers[0] < cancel, "cancel follows the first hover");
  assert!(cancel < hovers[1], "cancel precedes the superseding hover");
  assert_eq!(
    messages[cancel]["params"]["id"], messages[hovers[0]]["id"],
    "cancel names the superseded request"
  );

  client.stop();
}

#[test]
fn incremental_change_sends_pre_edit_ranges() {
  let script = ServerScript::new().with_capabilities(json!({ "textDocumentSync": 2 }));
  let factory = FakeServerFactory::new(script);
  let (client, _events, server) = start_client(&factory);

  client.did_open("file:///w/a.ts", "typescript", "abc\ndef");
  let edits = [TextEdit {
    start: 1,
    end:   3,
    text:  "XYZ".into(),
  }];
  client.did_change("file:///w/a.ts", &edits, "aXYZ\ndef");

  assert!(server.wait_for_count("textDocument/didChange", 1, WAIT));
  let change = &server.messages_of("textDocument/didChange")[0];
  assert_eq!(change["params"]["textDocument"]["version"], json!(2));
  let content_change = &change["params"]["contentChanges"][0];
  assert_eq!(content_change["range"]["start"], json!({ "line": 0, "character": 1 }));
  assert_eq!(content_change["range"]["end"], json!({ "line": 0, "character": 3 }));
  assert_eq!(content_change["text"], json!("XYZ"));

  client.stop();
}

#[test]
fn full_sync_changes_coalesce_through_the_debounce() {
  let script = ServerScript::new().with_capabilities(json!({ "textDocumentSync": 1 }));
  let factory = FakeServerFactory::new(script);
  let (client, _events, server) = start_client(&factory);

  client.did_open("file:///w/a.ts", "typescript", "v1");
  client.did_change("file:///w/a.ts", &[], "v2");
  client.did_change("file:///w/a.ts", &[], "v3");
  client.did_change("file:///w/a.ts", &[], "v4");

  assert!(server.wait_for_count("textDocument/didChange", 1, WAIT));
  // Trailing edge: the burst collapses to one send carrying the final text,
  // and the version counts wire sends, not editor events.
  thread::sleep(Duration::from_millis(150));
  let changes = server.messages_of("textDocument/didChange");
  assert_eq!(changes.len(), 1);
  assert_eq!(changes[0]["params"]["textDocument"]["version"], json!(2));
  assert_eq!(
    changes[0]["params"]["contentChanges"],
    json!([{ "text": "v4" }])
  );

  client.stop();
}

#[test]
fn crashes_restart_with_backoff_until_the_cap() {
  // Generation 0 completes the handshake and then dies; every respawn dies
  // on receiving `initialize`, so the ladder never resets.
  let factory = FakeServerFactory::new(ServerScript::new().crash_on("initialize"));
  factory.push_script(ServerScript::new());
  let (client, events, server) = start_client(&factory);

  server.crash();

  let deadline = std::time::Instant::now() + WAIT;
  while factory.generation_count() < 4 && std::time::Instant::now() < deadline {
    thread::sleep(Duration::from_millis(10));
  }
  assert_eq!(factory.generation_count(), 4, "three respawns after the first server");
  for generation in 1..4 {
    let respawned = factory.server(generation).expect("generation exists");
    assert!(respawned.wait_for_count("initialize", 1, WAIT));
  }

  // The fourth exit exceeds the cap: no fifth generation appears.
  thread::sleep(Duration::from_millis(300));
  assert_eq!(factory.generation_count(), 4);

  let mut delays = Vec::new();
  let mut exceeded = false;
  while let Ok(event) = events.try_recv() {
    match event {
      LspEvent::RestartScheduled { attempt, delay, .. } => delays.push((attempt, delay)),
      LspEvent::MaxRestartsExceeded { .. } => exceeded = true,
      _ => {},
    }
  }
  assert!(exceeded, "cap emits a max-restarts event");
  assert_eq!(
    delays,
    vec![
      (1, Duration::from_millis(25)),
      (2, Duration::from_millis(50)),
      (3, Duration::from_millis(100)),
    ]
  );

  client.stop();
}

#[test]
fn manager_stops_a_client_when_its_last_document_closes() {
  let factory = FakeServerFactory::new(ServerScript::new());
  let connector_factory = Arc::clone(&factory);
  let manager = LspManager::with_connector(
    fast_options(),
    Arc::new(move |_config: &ServerConfig, _root: &Path| {
      Arc::clone(&connector_factory) as Arc<dyn TransportFactory>
    }),
  )
  .expect("manager builds");
  manager.set_workspace_root("/w");

  manager.document_opened("/w/a.rs", "fn a() {}");
  manager.document_opened("/w/b.rs", "fn b() {}");
  assert_eq!(factory.generation_count(), 1, "both files share one rust client");
  let server = factory.server(0).expect("rust server");
  assert!(server.wait_for_count("textDocument/didOpen", 2, WAIT));

  manager.document_closed("/w/a.rs");
  assert!(server.wait_for_count("textDocument/didClose", 1, WAIT));
  assert!(
    manager.client_for_path("/w/b.rs").is_some(),
    "client survives while a document remains"
  );

  manager.document_closed("/w/b.rs");
  assert!(server.wait_for_count("shutdown", 1, WAIT));
  assert!(server.wait_for_count("exit", 1, WAIT));
  assert!(manager.client_for_path("/w/b.rs").is_none());

  let mut stopped = false;
  while let Some(event) = manager.try_recv_event() {
    if matches!(event, LspEvent::ClientStopped { .. }) {
      stopped = true;
    }
  }
  assert!(stopped, "idle teardown reports through telemetry");
}

#[test]
fn manager_replays_open_documents_after_a_restart() {
  let factory = FakeServerFactory::new(ServerScript::new());
  let connector_factory = Arc::clone(&factory);
  let manager = LspManager::with_connector(
    fast_options(),
    Arc::new(move |_config: &ServerConfig, _root: &Path| {
      Arc::clone(&connector_factory) as Arc<dyn TransportFactory>
    }),
  )
  .expect("manager builds");
  manager.set_workspace_root("/w");

  manager.document_opened("/w/a.rs", "fn a() {}");
  let first = factory.server(0).expect("first generation");
  assert!(first.wait_for_count("textDocument/didOpen", 1, WAIT));

  // The editor keeps typing while the server is down; the replay carries the
  // manager's current text, not what the dead server last saw.
  manager.document_changed("/w/a.rs", &[], "fn a() { panic!() }");
  first.crash();

  let deadline = std::time::Instant::now() + WAIT;
  while factory.generation_count() < 2 && std::time::Instant::now() < deadline {
    thread::sleep(Duration::from_millis(10));
  }
  let second = factory.server(1).expect("respawned generation");
  assert!(second.wait_for_count("textDocument/didOpen", 1, WAIT));
  let replayed = &second.messages_of("textDocument/didOpen")[0];
  assert_eq!(
    replayed["params"]["textDocument"]["text"],
    json!("fn a() { panic!() }")
  );
  assert_eq!(replayed["params"]["textDocument"]["version"], json!(1));

  manager.dispose();
}
