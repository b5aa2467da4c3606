//! Session engine: dispatches incoming chunks, tracks outstanding
//! transactions, and runs the four-phase shutdown lifecycle.
//!
//! A [`Session`] is a cheap, cloneable handle; the actual I/O runs on tasks
//! spawned by [`Session::spawn`]: one per-connection reader plus a
//! dispatcher holding an explicit outgoing queue and transaction table.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tokio::time::Instant;

use crate::chunk::{Chunk, ContFlag};
use crate::config::SessionConfig;
use crate::error::{ChunkParseError, MsrpError, MsrpSessionError, MsrpTransactionError};
use crate::header::{FailureReport, SuccessReport};
use crate::logging::TrafficLogger;
use bytes::Bytes;

use crate::transport::{
    build_request, build_send_request, make_response_chunk, Addressing, ChunkReader, ChunkTransport,
    ChunkWriter, PathMatch, DEFAULT_MAX_CHUNK_SIZE,
};

/// The session's position in the shutdown lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Normal operation: chunks flow in both directions.
    Connected,
    /// `shutdown()` was called; outstanding outgoing sends still drain,
    /// but no new ones are accepted.
    Flushing,
    /// The drain completed (or timed out); waiting for the I/O task to
    /// observe peer EOF or close the socket itself.
    Closing,
    /// The task has exited; the handle is inert.
    Done,
}

/// Delivered to the embedder for everything the session itself doesn't
/// resolve internally.
#[derive(Debug)]
pub enum IncomingEvent {
    /// A SEND chunk that passed path and content-type validation.
    Data { chunk: Chunk },
    /// A SEND whose `Content-Type` none of `accept_types` matched; the
    /// session already responded 415 and will not send an automatic
    /// report.
    Rejected { chunk: Chunk, error: MsrpTransactionError },
    Report(Chunk),
    NicknameRequest(Chunk),
    /// The I/O task exited (peer closed, protocol error, or shutdown
    /// completed).
    Closed,
}

enum OutgoingCommand {
    Send {
        chunk: Chunk,
        reply: Option<oneshot::Sender<Result<Chunk, MsrpTransactionError>>>,
    },
}

enum PendingKind {
    User(oneshot::Sender<Result<Chunk, MsrpTransactionError>>),
    /// A keep-alive SEND awaiting its response; an expiry here means the
    /// peer has gone silent, not just one slow transaction.
    Keepalive,
}

struct Pending {
    kind: PendingKind,
    started: Instant,
}

/// A handle to a running session. Cloning shares the same underlying
/// connection and state.
#[derive(Clone)]
pub struct Session {
    outgoing: mpsc::UnboundedSender<OutgoingCommand>,
    state: Arc<Mutex<SessionState>>,
    shutdown: Arc<Notify>,
    config: SessionConfig,
    addressing: Addressing,
}

impl Session {
    /// Spawns the I/O task and returns a handle to it. `events` receives
    /// everything the session doesn't resolve on its own. `pending_chunk`
    /// is the payload-bearing chunk [`ChunkTransport::accept_binding`] may
    /// have read off the wire during the handshake; when present, it's
    /// replayed to the dispatcher ahead of anything the reader task sees,
    /// so the embedder observes it as an ordinary [`IncomingEvent::Data`].
    pub fn spawn<S>(
        transport: ChunkTransport<S>,
        config: SessionConfig,
        events: mpsc::UnboundedSender<IncomingEvent>,
        pending_chunk: Option<Chunk>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(SessionState::Connected));
        let shutdown = Arc::new(Notify::new());
        let addressing = transport.addressing();
        let (reader, writer) = transport.split();

        let handle = Self {
            outgoing: outgoing_tx,
            state: state.clone(),
            shutdown: shutdown.clone(),
            config: config.clone(),
            addressing: addressing.clone(),
        };

        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        if let Some(chunk) = pending_chunk {
            let _ = incoming_tx.send(Ok(chunk));
        }
        tokio::spawn(reader_loop(reader, incoming_tx));
        tokio::spawn(run_loop(
            writer,
            addressing,
            config,
            events,
            outgoing_rx,
            incoming_rx,
            state,
            shutdown,
        ));

        handle
    }

    pub async fn state(&self) -> SessionState {
        *self.state.lock().await
    }

    /// Builds a request chunk addressed for this session, without
    /// involving the I/O task.
    pub fn make_request(&self, method: &str) -> Chunk {
        build_request(&self.addressing, method)
    }

    /// Builds a SEND chunk addressed for this session.
    pub fn make_send_request(
        &self,
        message_id: Option<String>,
        data: Bytes,
        start: u64,
        end: Option<u64>,
        length: Option<u64>,
    ) -> Chunk {
        build_send_request(&self.addressing, message_id, data, start, end, length)
    }

    /// Sends `chunk` and waits for its response, honoring
    /// `config.response_timeout`.
    pub async fn send_chunk(&self, chunk: Chunk) -> Result<Chunk, MsrpError> {
        if *self.state.lock().await != SessionState::Connected {
            return Err(MsrpSessionError(format!("{:?}", *self.state.lock().await)).into());
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.outgoing
            .send(OutgoingCommand::Send { chunk, reply: Some(reply_tx) })
            .map_err(|_| MsrpSessionError("session task has exited".to_string()))?;

        match tokio::time::timeout(self.config.response_timeout, reply_rx).await {
            Ok(Ok(Ok(response))) => Ok(response),
            Ok(Ok(Err(transaction_error))) => Err(transaction_error.into()),
            Ok(Err(_)) => Err(MsrpSessionError("session task has exited".to_string()).into()),
            Err(_) => Err(MsrpTransactionError::timed_out().into()),
        }
    }

    /// Sends `chunk` without waiting for a response — used for reports
    /// and other chunks the caller doesn't need to correlate.
    pub fn deliver_chunk(&self, chunk: Chunk) -> Result<(), MsrpSessionError> {
        self.outgoing
            .send(OutgoingCommand::Send { chunk, reply: None })
            .map_err(|_| MsrpSessionError("session task has exited".to_string()))
    }

    /// Moves the session into `Flushing`: no further sends are accepted,
    /// but chunks already queued still go out. Returns once the task has
    /// reached `Done`, or after `config.shutdown_timeout` elapses.
    pub async fn shutdown(&self) {
        {
            let mut state = self.state.lock().await;
            if *state == SessionState::Connected {
                *state = SessionState::Flushing;
            }
        }
        self.shutdown.notify_one();
        let deadline = self.config.shutdown_timeout;
        let _ = tokio::time::timeout(deadline, async {
            while *self.state.lock().await != SessionState::Done {
                tokio::task::yield_now().await;
            }
        })
        .await;
    }
}

/// Runs to completion independent of `run_loop`'s `select!` — never races
/// another future for the read half, so a chunk straddling several
/// network reads is never torn by cancellation.
async fn reader_loop<R>(mut reader: ChunkReader<R>, incoming: mpsc::UnboundedSender<Result<Chunk, ChunkParseError>>)
where
    R: AsyncRead + Unpin + Send,
{
    loop {
        let result = reader.read_chunk(DEFAULT_MAX_CHUNK_SIZE).await;
        let is_err = result.is_err();
        if incoming.send(result).is_err() || is_err {
            return;
        }
    }
}

async fn run_loop<W>(
    mut writer: ChunkWriter<W>,
    addressing: Addressing,
    config: SessionConfig,
    events: mpsc::UnboundedSender<IncomingEvent>,
    mut outgoing: mpsc::UnboundedReceiver<OutgoingCommand>,
    mut incoming: mpsc::UnboundedReceiver<Result<Chunk, ChunkParseError>>,
    state: Arc<Mutex<SessionState>>,
    shutdown: Arc<Notify>,
) where
    W: AsyncWrite + Unpin + Send,
{
    let mut pending: HashMap<String, Pending> = HashMap::new();
    let mut keepalive = tokio::time::interval(config.keepalive_interval);
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    'outer: loop {
        tokio::select! {
            _ = shutdown.notified() => {
                // Flush whatever is already queued before closing — the
                // caller's chunks queued ahead of `shutdown()` still go out.
                while let Ok(OutgoingCommand::Send { chunk, reply }) = outgoing.try_recv() {
                    let transaction_id = chunk.transaction_id().to_string();
                    if writer.write_chunk(chunk).await.is_err() {
                        if let Some(reply) = reply {
                            let _ = reply.send(Err(MsrpTransactionError::new(481, "connection lost")));
                        }
                        break;
                    }
                    if let Some(reply) = reply {
                        pending.insert(transaction_id, Pending { kind: PendingKind::User(reply), started: Instant::now() });
                    }
                }
                break 'outer;
            }
            _ = keepalive.tick() => {
                if *state.lock().await == SessionState::Connected {
                    let mut chunk = build_request(&addressing, "SEND");
                    chunk.add_header_text("Keep-Alive", "yes");
                    let transaction_id = chunk.transaction_id().to_string();
                    if writer.write_chunk(chunk).await.is_err() {
                        break 'outer;
                    }
                    pending.insert(transaction_id, Pending { kind: PendingKind::Keepalive, started: Instant::now() });
                }
            }
            cmd = outgoing.recv() => {
                match cmd {
                    Some(OutgoingCommand::Send { chunk, reply }) => {
                        let transaction_id = chunk.transaction_id().to_string();
                        if writer.write_chunk(chunk).await.is_err() {
                            if let Some(reply) = reply {
                                let _ = reply.send(Err(MsrpTransactionError::new(481, "connection lost")));
                            }
                            break 'outer;
                        }
                        if let Some(reply) = reply {
                            pending.insert(transaction_id, Pending { kind: PendingKind::User(reply), started: Instant::now() });
                        }
                    }
                    None => {
                        // Every handle dropped: nothing left to flush, proceed
                        // straight to closing.
                        break 'outer;
                    }
                }
            }
            result = incoming.recv() => {
                match result {
                    Some(Ok(chunk)) => {
                        handle_incoming(&mut writer, &addressing, &config, &events, &mut pending, chunk).await
                    }
                    Some(Err(_)) | None => break 'outer,
                }
            }
        }

        let timeout = config.response_timeout;
        let expired: Vec<String> = pending
            .iter()
            .filter(|(_, p)| p.started.elapsed() >= timeout)
            .map(|(id, _)| id.clone())
            .collect();
        let mut keepalive_expired = false;
        for id in expired {
            if let Some(p) = pending.remove(&id) {
                match p.kind {
                    PendingKind::User(reply) => {
                        let _ = reply.send(Err(MsrpTransactionError::timed_out()));
                    }
                    PendingKind::Keepalive => keepalive_expired = true,
                }
            }
        }
        if keepalive_expired {
            break 'outer;
        }
    }

    drain_pending(&mut incoming, &mut pending, config.response_timeout).await;

    *state.lock().await = SessionState::Closing;
    for (_, p) in pending.drain() {
        if let PendingKind::User(reply) = p.kind {
            let _ = reply.send(Err(MsrpTransactionError::timed_out()));
        }
    }
    *state.lock().await = SessionState::Done;
    let _ = events.send(IncomingEvent::Closed);
}

/// Keeps the reader alive past the main dispatch loop just long enough for
/// responses to transactions already in flight to arrive: bounded by the
/// latest pending entry's own response deadline, then one non-blocking
/// drain of whatever is already queued on the channel. Anything still
/// outstanding after this is left for the caller to fail with a timeout.
async fn drain_pending(
    incoming: &mut mpsc::UnboundedReceiver<Result<Chunk, ChunkParseError>>,
    pending: &mut HashMap<String, Pending>,
    response_timeout: Duration,
) {
    let deadline = match pending.values().map(|p| p.started + response_timeout).max() {
        Some(deadline) => deadline,
        None => return,
    };

    while !pending.is_empty() {
        match tokio::time::timeout_at(deadline, incoming.recv()).await {
            Ok(Some(Ok(chunk))) => {
                if !chunk.is_request() {
                    resolve_pending_response(pending, chunk);
                }
            }
            Ok(Some(Err(_))) | Ok(None) => return,
            Err(_) => break,
        }
    }

    while let Ok(result) = incoming.try_recv() {
        if let Ok(chunk) = result {
            if !chunk.is_request() {
                resolve_pending_response(pending, chunk);
            }
        }
    }
}

/// Resolves the pending entry `chunk` answers, if any; a response to an
/// already-expired or unknown transaction id is silently dropped.
fn resolve_pending_response(pending: &mut HashMap<String, Pending>, chunk: Chunk) {
    if let Some(p) = pending.remove(chunk.transaction_id()) {
        if let PendingKind::User(reply) = p.kind {
            let code = chunk.code().unwrap_or(0);
            let result = if (200..300).contains(&code) {
                Ok(chunk)
            } else {
                Err(MsrpTransactionError::new(code, chunk.comment().unwrap_or("").to_string()))
            };
            let _ = reply.send(result);
        }
    }
}

async fn handle_incoming<W>(
    writer: &mut ChunkWriter<W>,
    addressing: &Addressing,
    config: &SessionConfig,
    events: &mpsc::UnboundedSender<IncomingEvent>,
    pending: &mut HashMap<String, Pending>,
    chunk: Chunk,
) where
    W: AsyncWrite + Unpin + Send,
{
    if !chunk.is_request() {
        resolve_pending_response(pending, chunk);
        return;
    }

    match chunk.method() {
        Some("SEND") => handle_send(writer, addressing, config, events, chunk).await,
        Some("REPORT") => {
            let _ = events.send(IncomingEvent::Report(chunk));
        }
        Some("NICKNAME") => handle_nickname(writer, events, chunk).await,
        _ => {
            if let Some(response) = make_response_chunk(&chunk, 501, Some("Unknown method".to_string())) {
                let _ = writer.write_chunk(response).await;
            }
        }
    }
}

async fn handle_nickname<W>(
    writer: &mut ChunkWriter<W>,
    events: &mpsc::UnboundedSender<IncomingEvent>,
    chunk: Chunk,
) where
    W: AsyncWrite + Unpin + Send,
{
    let malformed = !chunk.has_header("Use-Nickname")
        || chunk.has_header("Success-Report")
        || chunk.has_header("Failure-Report");

    if malformed {
        if let Some(response) = make_response_chunk(&chunk, 400, Some("Bad request".to_string())) {
            let _ = writer.write_chunk(response).await;
        }
        return;
    }

    if let Some(response) = make_response_chunk(&chunk, 200, Some("OK".to_string())) {
        let _ = writer.write_chunk(response).await;
    }
    let _ = events.send(IncomingEvent::NicknameRequest(chunk));
}

async fn handle_send<W>(
    writer: &mut ChunkWriter<W>,
    addressing: &Addressing,
    config: &SessionConfig,
    events: &mpsc::UnboundedSender<IncomingEvent>,
    chunk: Chunk,
) where
    W: AsyncWrite + Unpin + Send,
{
    let mode = if config.use_sessmatch { PathMatch::Sessmatch } else { PathMatch::Strict };
    let error = crate::transport::check_incoming_send(addressing, &chunk, mode).or_else(|| {
        match chunk.content_type() {
            Some(ct) if !config.accepts_content_type(&ct) => {
                Some(MsrpTransactionError::new(415, "Unsupported media type"))
            }
            None if chunk.size() > 0 => Some(MsrpTransactionError::bad_content_type()),
            _ => None,
        }
    });

    let code = error.as_ref().map(|e| e.code).unwrap_or(200);
    let comment = error.as_ref().and_then(|e| e.comment.clone()).unwrap_or_else(|| "OK".to_string());
    if let Some(response) = make_response_chunk(&chunk, code, Some(comment)) {
        let _ = writer.write_chunk(response).await;
    }

    match error {
        Some(error) => {
            let _ = events.send(IncomingEvent::Rejected { chunk, error });
        }
        None => {
            let success_wanted = chunk.success_report() == SuccessReport::Yes;
            let complete = chunk.contflag == ContFlag::Complete;
            if config.automatic_reports && success_wanted && complete {
                if let Some(report) = crate::transport::make_report(addressing, &chunk, 200, Some("OK".to_string())) {
                    let _ = writer.write_chunk(report).await;
                }
            }
            let _ = events.send(IncomingEvent::Data { chunk });
        }
    }
}

/// True if `failure_report` on `chunk` demands a 4xx/5xx report be sent
/// for the given outcome — exposed for embedders building their own
/// report logic on top of `automatic_reports = false`.
pub fn wants_failure_report(chunk: &Chunk, code: u16) -> bool {
    if (200..300).contains(&code) {
        return false;
    }
    chunk.failure_report() != FailureReport::No
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uri::Uri;
    use std::sync::Arc as StdArc;

    fn config() -> SessionConfig {
        let mut config = SessionConfig::default();
        config.response_timeout = Duration::from_millis(200);
        config.keepalive_interval = Duration::from_secs(3600);
        config
    }

    #[tokio::test]
    async fn bind_then_send_and_receive_success_report() {
        let (client_io, server_io) = tokio::io::duplex(8192);
        let logger: StdArc<dyn TrafficLogger> = StdArc::new(crate::logging::NoopLogger);

        let client_uri = Uri::parse("msrp://client.example;tcp").unwrap();
        let server_uri = Uri::parse("msrp://server.example;tcp").unwrap();

        let mut client_transport = ChunkTransport::new(client_io, client_uri.clone(), logger.clone());
        let mut server_transport = ChunkTransport::new(server_io, server_uri.clone(), logger.clone());

        let (client_res, server_res) = tokio::join!(
            client_transport.bind(vec![server_uri.clone()]),
            server_transport.accept_binding(vec![client_uri.clone()]),
        );
        client_res.unwrap();
        let pending_chunk = server_res.unwrap();
        assert!(pending_chunk.is_none());

        let (client_events_tx, mut client_events_rx) = mpsc::unbounded_channel();
        let (server_events_tx, mut server_events_rx) = mpsc::unbounded_channel();
        let client = Session::spawn(client_transport, config(), client_events_tx, None);
        let server = Session::spawn(server_transport, config(), server_events_tx, pending_chunk);

        let mut send = client.make_send_request(None, bytes::Bytes::from_static(b"hello"), 1, None, None);
        send.add_header(
            "Success-Report",
            &crate::header::HeaderValue::SuccessReport(SuccessReport::Yes),
        );
        let response = client.send_chunk(send).await.unwrap();
        assert_eq!(response.code(), Some(200));

        let event = server_events_rx.recv().await.unwrap();
        match event {
            IncomingEvent::Data { chunk } => assert_eq!(&chunk.data[..], b"hello"),
            other => panic!("unexpected event: {:?}", other),
        }

        let report_event = client_events_rx.recv().await.unwrap();
        assert!(matches!(report_event, IncomingEvent::Report(_)));

        client.shutdown().await;
        server.shutdown().await;
    }
}
