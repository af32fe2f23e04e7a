use std::{
  io::{
    BufRead,
    BufReader,
    BufWriter,
    Read,
    Write,
  },
  path::Path,
  process::{
    Child,
    Command,
    Stdio,
  },
  sync::mpsc::{
    Receiver,
    Sender,
    TryRecvError,
    channel,
  },
  thread::{
    self,
    JoinHandle,
  },
};

use thiserror::Error;
use tracing::debug;

/// What the reader, writer and stderr threads surface to the session.
/// Payloads stay raw strings; JSON decoding belongs to the client layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
  Message(String),
  Stderr(String),
  Closed,
}

enum Outbound {
  Payload(String),
  Shutdown,
}

/// Ordered write handle into the server's stdin. Clones share the writer
/// thread, so payloads never interleave.
#[derive(Clone)]
pub struct MessageSender {
  tx: Sender<Outbound>,
}

impl MessageSender {
  pub fn send(&self, payload: String) -> Result<(), TransportError> {
    self
      .tx
      .send(Outbound::Payload(payload))
      .map_err(|_| TransportError::StdinClosed)
  }
}

/// One transport per server process: owns the child handle and the three
/// threads shipping framed payloads over its standard streams.
#[derive(Debug)]
pub struct ServerTransport {
  child:         Option<Child>,
  outbound_tx:   Option<Sender<Outbound>>,
  event_rx:      Receiver<TransportEvent>,
  reader_thread: Option<JoinHandle<()>>,
  writer_thread: Option<JoinHandle<()>>,
  stderr_thread: Option<JoinHandle<()>>,
}

impl ServerTransport {
  pub fn spawn(command: &str, args: &[String], cwd: &Path) -> Result<Self, TransportError> {
    let mut child = Command::new(command)
      .args(args)
      .current_dir(cwd)
      .stdin(Stdio::piped())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .spawn()
      .map_err(|err| TransportError::from_spawn(command, err))?;

    let stdin = child
      .stdin
      .take()
      .ok_or(TransportError::MissingPipe("stdin"))?;
    let stdout = child
      .stdout
      .take()
      .ok_or(TransportError::MissingPipe("stdout"))?;
    let stderr = child
      .stderr
      .take()
      .ok_or(TransportError::MissingPipe("stderr"))?;

    Ok(Self::wire(Some(child), stdin, stdout, stderr))
  }

  /// Build a transport over arbitrary streams with no child process behind
  /// them. This is how the scripted fake server plugs in.
  #[cfg(any(test, feature = "test-support"))]
  pub fn from_streams(
    stdin: impl Write + Send + 'static,
    stdout: impl Read + Send + 'static,
    stderr: impl Read + Send + 'static,
  ) -> Self {
    Self::wire(None, stdin, stdout, stderr)
  }

  fn wire(
    child: Option<Child>,
    stdin: impl Write + Send + 'static,
    stdout: impl Read + Send + 'static,
    stderr: impl Read + Send + 'static,
  ) -> Self {
    let (outbound_tx, outbound_rx) = channel();
    let (event_tx, event_rx) = channel();

    let writer_thread = Some(spawn_writer_thread(stdin, outbound_rx, event_tx.clone()));
    let reader_thread = Some(spawn_reader_thread(stdout, event_tx.clone()));
    let stderr_thread = Some(spawn_stderr_thread(stderr, event_tx));

    Self {
      child,
      outbound_tx: Some(outbound_tx),
      event_rx,
      reader_thread,
      writer_thread,
      stderr_thread,
    }
  }

  pub fn sender(&self) -> Option<MessageSender> {
    self
      .outbound_tx
      .as_ref()
      .map(|tx| MessageSender { tx: tx.clone() })
  }

  pub fn send(&self, payload: String) -> Result<(), TransportError> {
    let tx = self
      .outbound_tx
      .as_ref()
      .ok_or(TransportError::StdinClosed)?;
    tx.send(Outbound::Payload(payload))
      .map_err(|_| TransportError::StdinClosed)
  }

  pub fn try_recv_event(&self) -> Option<TransportEvent> {
    match self.event_rx.try_recv() {
      Ok(event) => Some(event),
      Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
    }
  }

  pub fn poll_exit_code(&mut self) -> Option<i32> {
    let child = self.child.as_mut()?;
    match child.try_wait() {
      Ok(status) => status.and_then(|status| status.code()),
      Err(err) => {
        debug!(error = %err, "failed to poll server process");
        None
      },
    }
  }

  /// Terminate the child and release every thread and sink.
  pub fn kill(&mut self) {
    if let Some(tx) = self.outbound_tx.take() {
      let _ = tx.send(Outbound::Shutdown);
    }

    if let Some(mut child) = self.child.take() {
      match child.try_wait() {
        Ok(Some(_)) => {},
        _ => {
          let _ = child.kill();
          let _ = child.wait();
        },
      }
    }

    join_thread(&mut self.reader_thread);
    join_thread(&mut self.writer_thread);
    join_thread(&mut self.stderr_thread);
  }
}

impl Drop for ServerTransport {
  fn drop(&mut self) {
    self.kill();
  }
}

fn spawn_reader_thread(
  stdout: impl Read + Send + 'static,
  event_tx: Sender<TransportEvent>,
) -> JoinHandle<()> {
  thread::Builder::new()
    .name("quill-lsp-stdout".into())
    .spawn(move || {
      let mut reader = BufReader::new(stdout);
      let mut header_buffer = String::new();
      let mut body_buffer = Vec::new();

      loop {
        match read_frame(&mut reader, &mut header_buffer, &mut body_buffer) {
          Ok(Some(payload)) => {
            let _ = event_tx.send(TransportEvent::Message(payload));
          },
          Ok(None) => {
            let _ = event_tx.send(TransportEvent::Closed);
            break;
          },
          Err(fault) => {
            // A broken header leaves the stream unparseable. Surface the
            // offending bytes for diagnostics and close the transport.
            let _ = event_tx.send(TransportEvent::Stderr(fault.to_string()));
            let _ = event_tx.send(TransportEvent::Closed);
            break;
          },
        }
      }
    })
    .expect("failed to spawn lsp stdout thread")
}

fn spawn_writer_thread(
  stdin: impl Write + Send + 'static,
  outbound_rx: Receiver<Outbound>,
  event_tx: Sender<TransportEvent>,
) -> JoinHandle<()> {
  thread::Builder::new()
    .name("quill-lsp-stdin".into())
    .spawn(move || {
      let mut writer = BufWriter::new(stdin);
      while let Ok(outbound) = outbound_rx.recv() {
        match outbound {
          Outbound::Payload(payload) => {
            if let Err(err) = write_frame(&mut writer, &payload) {
              let _ = event_tx.send(TransportEvent::Stderr(format!(
                "failed to write frame: {err}"
              )));
              break;
            }
          },
          Outbound::Shutdown => break,
        }
      }
    })
    .expect("failed to spawn lsp stdin thread")
}

fn spawn_stderr_thread(
  stderr: impl Read + Send + 'static,
  event_tx: Sender<TransportEvent>,
) -> JoinHandle<()> {
  thread::Builder::new()
    .name("quill-lsp-stderr".into())
    .spawn(move || {
      let mut reader = BufReader::new(stderr);
      let mut line = String::new();
      loop {
        line.clear();
        match reader.read_line(&mut line) {
          Ok(0) => break,
          Ok(_) => {
            let line = line.trim_end_matches(['\r', '\n']).to_string();
            if !line.is_empty() {
              let _ = event_tx.send(TransportEvent::Stderr(line));
            }
          },
          Err(err) => {
            debug!(error = %err, "server stderr stream closed with error");
            break;
          },
        }
      }
    })
    .expect("failed to spawn lsp stderr thread")
}

/// Read one `Content-Length`-framed payload. `Ok(None)` is clean EOF. Other
/// headers (`Content-Type` included) are tolerated and ignored; a header the
/// frame cannot proceed without is a [`FrameFault`].
pub(crate) fn read_frame<R: BufRead>(
  reader: &mut R,
  header_buffer: &mut String,
  body_buffer: &mut Vec<u8>,
) -> Result<Option<String>, FrameFault> {
  let mut content_length: Option<usize> = None;
  loop {
    header_buffer.clear();
    let read = reader
      .read_line(header_buffer)
      .map_err(FrameFault::ReadHeader)?;
    if read == 0 {
      return match content_length {
        // EOF between frames is a normal close.
        None => Ok(None),
        Some(_) => Err(FrameFault::TruncatedHeader),
      };
    }

    let header = header_buffer.trim_end_matches(['\r', '\n']);
    if header.is_empty() {
      match content_length {
        Some(_) => break,
        None => return Err(FrameFault::MissingContentLength),
      }
    }

    if let Some(rest) = header.strip_prefix("Content-Length:") {
      let value = rest.trim();
      let parsed = value
        .parse::<usize>()
        .map_err(|_| FrameFault::InvalidContentLength(value.to_string()))?;
      content_length = Some(parsed);
    }
  }

  let content_length = content_length.unwrap_or(0);
  body_buffer.resize(content_length, 0);
  reader
    .read_exact(body_buffer)
    .map_err(FrameFault::ReadBody)?;
  let payload = String::from_utf8_lossy(body_buffer).into_owned();
  body_buffer.clear();
  Ok(Some(payload))
}

pub(crate) fn write_frame<W: Write>(writer: &mut W, payload: &str) -> Result<(), std::io::Error> {
  write!(writer, "Content-Length: {}\r\n\r\n", payload.len())?;
  writer.write_all(payload.as_bytes())?;
  writer.flush()
}

fn join_thread(handle: &mut Option<JoinHandle<()>>) {
  if let Some(handle) = handle.take()
    && handle.join().is_err()
  {
    debug!("transport thread panicked");
  }
}

#[derive(Debug, Error)]
pub(crate) enum FrameFault {
  #[error("failed to read frame header: {0}")]
  ReadHeader(std::io::Error),
  #[error("frame header ended before its blank line")]
  TruncatedHeader,
  #[error("invalid Content-Length header value: {0:?}")]
  InvalidContentLength(String),
  #[error("frame headers carried no Content-Length")]
  MissingContentLength,
  #[error("failed to read frame body: {0}")]
  ReadBody(std::io::Error),
}

#[derive(Debug, Error)]
pub enum TransportError {
  #[error("server command not found: {command}")]
  CommandNotFound { command: String },
  #[error("server command not executable: {command}")]
  PermissionDenied { command: String },
  #[error("failed to spawn server process: {0}")]
  Spawn(std::io::Error),
  #[error("missing child {0} pipe")]
  MissingPipe(&'static str),
  #[error("server stdin is closed")]
  StdinClosed,
}

impl TransportError {
  fn from_spawn(command: &str, err: std::io::Error) -> Self {
    match err.kind() {
      std::io::ErrorKind::NotFound => {
        Self::CommandNotFound {
          command: command.to_string(),
        }
      },
      std::io::ErrorKind::PermissionDenied => {
        Self::PermissionDenied {
          command: command.to_string(),
        }
      },
      _ => Self::Spawn(err),
    }
  }
}
