//! In-process test doubles: a scripted language server speaking real LSP
//! framing over in-memory pipes, and the transport factory that serves it
//! to a client generation by generation.


pub use fake_server::{
  FakeServer,
  FakeServerFactory,
  ServerScript,
};
