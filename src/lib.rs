//! # msrp-rs
//!
//! A chunked, text-oriented message-transport protocol core (MSRP, RFC
//! 4975): the chunk grammar and streaming parser, a typed header codec, the
//! `msrp`/`msrps` URI model with the path-binding handshake, and a session
//! state machine that drives them over any ordered byte-stream transport.
//!
//! ## Quick start
//!
//! ```no_run
//! use msrp_rs::config::SessionConfig;
//! use msrp_rs::logging::NoopLogger;
//! use msrp_rs::session::Session;
//! use msrp_rs::transport::ChunkTransport;
//! use msrp_rs::uri::Uri;
//! use std::sync::Arc;
//! use tokio::net::TcpStream;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let stream = TcpStream::connect("relay.example:2855").await?;
//! let local_uri = Uri::parse("msrp://client.example:2855/abc123;tcp")?;
//! let mut transport = ChunkTransport::new(stream, local_uri, Arc::new(NoopLogger));
//!
//! let remote_uri = Uri::parse("msrp://relay.example:2855/xyz789;tcp")?;
//! transport.bind(vec![remote_uri]).await?;
//!
//! let (events_tx, mut events_rx) = tokio::sync::mpsc::unbounded_channel();
//! let session = Session::spawn(transport, SessionConfig::default(), events_tx, None);
//! let send = session.make_send_request(None, "hi".into(), 1, None, None);
//! session.send_chunk(send).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Protocol overview
//!
//! An MSRP chunk is a text frame bounded by a randomly generated
//! transaction identifier rather than a length prefix:
//!
//! ```text
//! MSRP <tid> <method-or-status>
//! <headers>
//!
//! <body>
//! -------<tid>$
//! ```
//!
//! The trailing `$`/`+`/`#` continuation flag tells the receiver whether the
//! body just seen is the whole message, a fragment of a larger one, or an
//! aborted send. [`codec::Framer`] turns a byte stream into that boundary;
//! [`transport::ChunkTransport`] assembles framer events into whole
//! [`chunk::Chunk`]s and runs the path-binding handshake; [`session::Session`]
//! drives request/response correlation, automatic REPORT generation, and the
//! four-phase shutdown lifecycle on top of that.
//!
//! ## Modules
//!
//! | Module | Responsibility |
//! |---|---|
//! | [`uri`] | `msrp`/`msrps` URI parsing and formatting |
//! | [`header`] | Typed header value parsing/encoding |
//! | [`chunk`] | The in-memory chunk model |
//! | [`codec`] | The streaming chunk-boundary framer |
//! | [`transport`] | Chunk read/write plus the path-binding handshake |
//! | [`session`] | The session state machine and transaction table |
//! | [`config`] | Embedder-tunable [`config::SessionConfig`] |
//! | [`logging`] | The [`logging::TrafficLogger`] hook |
//! | [`error`] | The crate's error taxonomy |

pub mod chunk;
pub mod codec;
pub mod config;
pub mod error;
pub mod header;
pub mod logging;
pub mod session;
pub mod transport;
pub mod uri;

pub use chunk::{Chunk, ContFlag};
pub use error::{ChunkParseError, HeaderParsingError, MsrpError, MsrpSessionError, MsrpTransactionError, UriParseError};
pub use session::{IncomingEvent, Session, SessionState};
pub use transport::ChunkTransport;
pub use uri::Uri;
