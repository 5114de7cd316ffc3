//! Async connection pipeline.
//!
//! One connection runs four long-lived tasks wired with bounded channels, no
//! task per request:
//!
//! ```text
//! socket read -> unwrap (SASL frames) -> parse (BER) -> pending table
//! callers -> writer task -> socket write
//! ```
//!
//! Responses are correlated by message id through [`MessageRouter`]; a fatal
//! failure (I/O, decode, disconnect notice) is broadcast to every present and
//! future waiter. The socket and writer tasks support a pause/resume protocol
//! that hands the stream halves back for the StartTLS upgrade.

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{self, Control, LdapMessage, ModifyChange, ProtocolOp, SearchRequest};
use crate::config::{parse_server_url, Config, TlsConfig};
use crate::error::{LdapError, Result};
use crate::security::SecurityContext;
use crate::session::{LdapSession, SessionState};
use crate::tls;

const CHANNEL_CAPACITY: usize = 32;
const READ_BUF_SIZE: usize = 8192;

/// Stream to the server: plain TCP (ldap://) or TLS (ldaps:// / StartTLS).
pub enum ClientStream {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for ClientStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            ClientStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            ClientStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match &mut *self {
            ClientStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            ClientStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }
    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            ClientStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            ClientStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }
    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            ClientStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            ClientStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

impl Unpin for ClientStream {}

// ---------------------------------------------------------------------------
// Pending-request table
// ---------------------------------------------------------------------------

#[derive(Default)]
struct PendingQueue {
    messages: VecDeque<LdapMessage>,
    notify: Arc<Notify>,
}

#[derive(Default)]
struct RouterInner {
    queues: HashMap<i32, PendingQueue>,
    failure: Option<LdapError>,
    /// Terminal transport error seen by the socket stage, held back until the
    /// parse stage has drained every byte that arrived before it.
    deferred: Option<LdapError>,
}

/// Correlates incoming messages to waiters by message id. Queues are created
/// lazily on first wait or first arrival and removed explicitly by
/// [`MessageRouter::remove_message_queue`]. A single mutex guards both the
/// create-or-get path and the failure flag, so a waiter racing a failure
/// deterministically observes one or the other.
pub(crate) struct MessageRouter {
    inner: Mutex<RouterInner>,
}

impl MessageRouter {
    fn new() -> Self {
        Self {
            inner: Mutex::new(RouterInner::default()),
        }
    }

    fn deposit(&self, message: LdapMessage) {
        let mut inner = self.inner.lock().unwrap();
        if inner.failure.is_some() {
            return;
        }
        let queue = inner.queues.entry(message.message_id).or_default();
        queue.messages.push_back(message);
        queue.notify.notify_one();
    }

    /// Record the first fatal error and wake every pending waiter. Later
    /// failures are ignored; later deposits are dropped. Messages already
    /// queued stay readable, so responses delivered before the failure are
    /// not lost.
    fn fail(&self, error: LdapError) {
        let mut inner = self.inner.lock().unwrap();
        if inner.failure.is_some() {
            return;
        }
        inner.failure = Some(error);
        for queue in inner.queues.values() {
            // Permit for a waiter not yet parked, then every parked waiter.
            queue.notify.notify_one();
            queue.notify.notify_waiters();
        }
    }

    async fn wait_for_message(
        &self,
        id: i32,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<LdapMessage> {
        let deadline = Instant::now() + timeout;
        loop {
            let notify = {
                let mut inner = self.inner.lock().unwrap();
                // Buffered responses win over a later failure: a message the
                // server delivered before dying is still a valid answer.
                let queue = inner.queues.entry(id).or_default();
                if let Some(message) = queue.messages.pop_front() {
                    return Ok(message);
                }
                let notify = queue.notify.clone();
                if let Some(error) = &inner.failure {
                    return Err(error.clone());
                }
                notify
            };
            tokio::select! {
                _ = notify.notified() => {}
                _ = tokio::time::sleep_until(deadline) => return Err(LdapError::Timeout),
                _ = cancel.cancelled() => return Err(LdapError::Cancelled),
            }
        }
    }

    /// Stash a terminal socket error without broadcasting it. Bytes the
    /// socket already delivered may still be in flight through the unwrap
    /// and parse stages; broadcasting now would shadow their responses.
    fn defer_fail(&self, error: LdapError) {
        let mut inner = self.inner.lock().unwrap();
        if inner.deferred.is_none() {
            inner.deferred = Some(error);
        }
    }

    /// Promote a stashed socket error once the pipeline has drained.
    fn finish(&self) {
        let deferred = self.inner.lock().unwrap().deferred.take();
        if let Some(error) = deferred {
            self.fail(error);
        }
    }

    fn remove_message_queue(&self, id: i32) {
        self.inner.lock().unwrap().queues.remove(&id);
    }
}

// ---------------------------------------------------------------------------
// Pipeline tasks
// ---------------------------------------------------------------------------

enum SocketControl {
    /// Hand the read half back (for the TLS upgrade) and stop reading.
    Pause(oneshot::Sender<ReadHalf<ClientStream>>),
    Resume(ReadHalf<ClientStream>),
}

enum WriterCommand {
    Data(Vec<u8>),
    Pause(oneshot::Sender<WriteHalf<ClientStream>>),
    Resume(WriteHalf<ClientStream>),
    Shutdown,
}

/// Security layer installed after a SASL bind: every PDU in both directions
/// goes through `ctx` from then on.
struct SealContext {
    ctx: Arc<dyn SecurityContext>,
    confidential: bool,
}

async fn socket_stage(
    read_half: ReadHalf<ClientStream>,
    mut ctl_rx: mpsc::Receiver<SocketControl>,
    data_tx: mpsc::Sender<Vec<u8>>,
    router: Arc<MessageRouter>,
    shutdown: CancellationToken,
) {
    enum Event {
        Shutdown,
        Control(Option<SocketControl>),
        Read(std::io::Result<usize>),
    }

    let mut current = Some(read_half);
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        match current.take() {
            Some(mut rh) => {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => Event::Shutdown,
                    ctl = ctl_rx.recv() => Event::Control(ctl),
                    n = rh.read(&mut buf) => Event::Read(n),
                };
                match event {
                    Event::Shutdown => return,
                    Event::Control(Some(SocketControl::Pause(tx))) => {
                        let _ = tx.send(rh);
                    }
                    Event::Control(Some(SocketControl::Resume(new_rh))) => {
                        current = Some(new_rh);
                    }
                    Event::Control(None) => return,
                    // Returning drops `data_tx`; the closed channel propagates
                    // through the unwrap and parse stages, which report the
                    // deferred error only after draining what was read.
                    Event::Read(Ok(0)) => {
                        debug!("server closed the connection");
                        router.defer_fail(LdapError::Transport(
                            "connection closed by server".to_string(),
                        ));
                        return;
                    }
                    Event::Read(Ok(n)) => {
                        if data_tx.send(buf[..n].to_vec()).await.is_err() {
                            return;
                        }
                        current = Some(rh);
                    }
                    Event::Read(Err(e)) => {
                        router.defer_fail(e.into());
                        return;
                    }
                }
            }
            // Paused: only a resume (or shutdown) gets us going again.
            None => {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    ctl = ctl_rx.recv() => match ctl {
                        Some(SocketControl::Resume(rh)) => current = Some(rh),
                        Some(SocketControl::Pause(_)) | None => return,
                    },
                }
            }
        }
    }
}

/// Passthrough until a seal is installed; afterwards reassembles 4-byte
/// big-endian length-prefixed frames and unseals each one.
async fn unwrap_stage(
    mut data_rx: mpsc::Receiver<Vec<u8>>,
    plain_tx: mpsc::Sender<Vec<u8>>,
    seal: Arc<ArcSwapOption<SealContext>>,
    max_sasl_frame: u32,
    router: Arc<MessageRouter>,
) {
    let mut buf = BytesMut::new();
    while let Some(chunk) = data_rx.recv().await {
        let Some(seal) = seal.load_full() else {
            if plain_tx.send(chunk).await.is_err() {
                return;
            }
            continue;
        };
        buf.extend_from_slice(&chunk);
        loop {
            if buf.len() < 4 {
                break;
            }
            let frame_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
            if frame_len > max_sasl_frame {
                router.fail(LdapError::Decode {
                    message: format!(
                        "SASL frame of {} bytes exceeds limit {}",
                        frame_len, max_sasl_frame
                    ),
                    raw: buf[..buf.len().min(8)].to_vec(),
                });
                return;
            }
            if buf.len() < 4 + frame_len as usize {
                break;
            }
            buf.advance(4);
            let frame = buf.split_to(frame_len as usize);
            match seal.ctx.unwrap(&frame) {
                Ok(plain) => {
                    if plain_tx.send(plain).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    warn!("SASL unwrap failed: {}", e);
                    router.fail(e);
                    return;
                }
            }
        }
    }
}

async fn parse_stage(
    mut plain_rx: mpsc::Receiver<Vec<u8>>,
    router: Arc<MessageRouter>,
) {
    let mut buf = BytesMut::new();
    while let Some(chunk) = plain_rx.recv().await {
        buf.extend_from_slice(&chunk);
        loop {
            match codec::try_decode(&buf) {
                Ok(None) => break,
                Ok(Some((message, consumed))) => {
                    buf.advance(consumed);
                    if let ProtocolOp::ExtendedResponse(resp) = &message.protocol_op {
                        if message.message_id == 0 && resp.is_disconnect_notice() {
                            warn!(
                                "server sent notice of disconnection: {}",
                                resp.result.diagnostic_message
                            );
                            router.fail(LdapError::Disconnected(
                                resp.result.diagnostic_message.clone(),
                            ));
                            return;
                        }
                    }
                    debug!(message_id = message.message_id, "received LDAP message");
                    router.deposit(message);
                }
                Err(e) => {
                    if let LdapError::Decode { message, raw } = &e {
                        warn!(
                            "failed to parse LDAP message: {} (first bytes: {})",
                            message,
                            hex_preview(raw)
                        );
                    }
                    router.fail(e);
                    return;
                }
            }
        }
    }
    // Input channel closed: everything the socket read has been deposited.
    router.finish();
}

async fn writer_task(
    write_half: WriteHalf<ClientStream>,
    mut cmd_rx: mpsc::Receiver<WriterCommand>,
    router: Arc<MessageRouter>,
) {
    let mut current = Some(write_half);
    // Bytes submitted while the stream is paused for a TLS upgrade.
    let mut deferred: Vec<Vec<u8>> = Vec::new();
    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            WriterCommand::Data(bytes) => match current.as_mut() {
                Some(wh) => {
                    if let Err(e) = write_chunk(wh, &bytes).await {
                        router.fail(e.into());
                        return;
                    }
                }
                None => deferred.push(bytes),
            },
            WriterCommand::Pause(tx) => {
                if let Some(wh) = current.take() {
                    let _ = tx.send(wh);
                }
            }
            WriterCommand::Resume(mut wh) => {
                for bytes in deferred.drain(..) {
                    if let Err(e) = write_chunk(&mut wh, &bytes).await {
                        router.fail(e.into());
                        return;
                    }
                }
                current = Some(wh);
            }
            WriterCommand::Shutdown => {
                if let Some(mut wh) = current.take() {
                    let _ = wh.shutdown().await;
                }
                return;
            }
        }
    }
}

async fn write_chunk(
    wh: &mut WriteHalf<ClientStream>,
    bytes: &[u8],
) -> std::io::Result<()> {
    wh.write_all(bytes).await?;
    wh.flush().await
}

fn hex_preview(raw: &[u8]) -> String {
    raw.iter()
        .take(32)
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// One LDAP connection: session state, pipeline tasks and the pending table.
pub struct Connection {
    session: Mutex<LdapSession>,
    router: Arc<MessageRouter>,
    writer_tx: mpsc::Sender<WriterCommand>,
    socket_ctl: mpsc::Sender<SocketControl>,
    seal: Arc<ArcSwapOption<SealContext>>,
    state_tx: watch::Sender<SessionState>,
    shutdown: CancellationToken,
    operation_timeout: Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    host: String,
}

impl Connection {
    /// Connect to the configured server; ldaps:// runs the TLS handshake
    /// before the connection is handed back.
    pub async fn connect(config: &Config) -> Result<Self> {
        let (ldaps, host, port) = parse_server_url(&config.server.url)?;
        let addr = format!("{}:{}", host, port);
        let connect = async {
            let tcp = TcpStream::connect(&addr).await?;
            if ldaps {
                let tls_config = tls::client_config(config.tls.as_ref())?;
                let connector = TlsConnector::from(tls_config);
                let name = tls::server_name(&host)?;
                let stream = connector
                    .connect(name, tcp)
                    .await
                    .map_err(|e| LdapError::Transport(format!("TLS handshake: {}", e)))?;
                Ok::<_, LdapError>(ClientStream::Tls(Box::new(stream)))
            } else {
                Ok(ClientStream::Tcp(tcp))
            }
        };
        let stream = tokio::time::timeout(config.connect_timeout(), connect)
            .await
            .map_err(|_| LdapError::Timeout)??;
        info!(%addr, tls = ldaps, "connected to LDAP server");
        Ok(Self::start(stream, config, host))
    }

    fn start(stream: ClientStream, config: &Config, host: String) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        let router = Arc::new(MessageRouter::new());
        let seal: Arc<ArcSwapOption<SealContext>> = Arc::new(ArcSwapOption::empty());
        let shutdown = CancellationToken::new();
        let (state_tx, _) = watch::channel(SessionState::BeforeOpen);

        let (socket_ctl, ctl_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (data_tx, data_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (plain_tx, plain_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (writer_tx, cmd_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let tasks = vec![
            tokio::spawn(socket_stage(
                read_half,
                ctl_rx,
                data_tx,
                Arc::clone(&router),
                shutdown.clone(),
            )),
            tokio::spawn(unwrap_stage(
                data_rx,
                plain_tx,
                Arc::clone(&seal),
                config.max_sasl_frame(),
                Arc::clone(&router),
            )),
            tokio::spawn(parse_stage(plain_rx, Arc::clone(&router))),
            tokio::spawn(writer_task(write_half, cmd_rx, Arc::clone(&router))),
        ];

        Self {
            session: Mutex::new(LdapSession::new()),
            router,
            writer_tx,
            socket_ctl,
            seal,
            state_tx,
            shutdown,
            operation_timeout: config.operation_timeout(),
            tasks: Mutex::new(tasks),
            host,
        }
    }

    pub fn state(&self) -> SessionState {
        self.session.lock().unwrap().state()
    }

    /// Watch session state transitions (bind progress, close).
    pub fn state_changes(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    fn sync_state(&self) {
        let state = self.session.lock().unwrap().state();
        self.state_tx.send_replace(state);
    }

    /// Encode, seal when a security layer is installed, and queue for write.
    /// Returns the message id to wait on.
    async fn send_message(&self, message: LdapMessage) -> Result<i32> {
        let id = message.message_id;
        let plain = codec::encode_ldap_message(&message);
        let bytes = match self.seal.load_full() {
            None => plain,
            Some(seal) => {
                let sealed = seal.ctx.wrap(&plain, seal.confidential)?;
                let mut framed = Vec::with_capacity(4 + sealed.len());
                framed.extend_from_slice(&(sealed.len() as u32).to_be_bytes());
                framed.extend_from_slice(&sealed);
                framed
            }
        };
        self.writer_tx
            .send(WriterCommand::Data(bytes))
            .await
            .map_err(|_| LdapError::Transport("connection writer stopped".to_string()))?;
        debug!(message_id = id, "queued LDAP message");
        Ok(id)
    }

    pub async fn search(
        &self,
        request: SearchRequest,
        controls: Option<Vec<Control>>,
    ) -> Result<i32> {
        let message = self.session.lock().unwrap().search(request, controls)?;
        self.send_message(message).await
    }

    pub async fn add(
        &self,
        request: codec::AddRequest,
        controls: Option<Vec<Control>>,
    ) -> Result<i32> {
        let message = self.session.lock().unwrap().add(request, controls)?;
        self.send_message(message).await
    }

    pub async fn modify(
        &self,
        object: &str,
        changes: Vec<ModifyChange>,
        controls: Option<Vec<Control>>,
    ) -> Result<i32> {
        let message = self
            .session
            .lock()
            .unwrap()
            .modify(object, changes, controls)?;
        self.send_message(message).await
    }

    pub async fn delete(&self, dn: &str, controls: Option<Vec<Control>>) -> Result<i32> {
        let message = self.session.lock().unwrap().delete(dn, controls)?;
        self.send_message(message).await
    }

    pub async fn modify_dn(
        &self,
        request: codec::ModifyDnRequest,
        controls: Option<Vec<Control>>,
    ) -> Result<i32> {
        let message = self.session.lock().unwrap().modify_dn(request, controls)?;
        self.send_message(message).await
    }

    pub async fn extended(
        &self,
        request_name: &str,
        request_value: Option<Vec<u8>>,
    ) -> Result<i32> {
        let message = self
            .session
            .lock()
            .unwrap()
            .extended(request_name, request_value)?;
        self.send_message(message).await
    }

    pub(crate) async fn send_simple_bind(&self, name: &str, password: &str) -> Result<i32> {
        let message = self.session.lock().unwrap().simple_bind(name, password)?;
        self.sync_state();
        self.send_message(message).await
    }

    pub(crate) async fn send_sasl_bind(
        &self,
        mechanism: &str,
        credentials: Option<Vec<u8>>,
    ) -> Result<i32> {
        let message = self
            .session
            .lock()
            .unwrap()
            .sasl_bind(mechanism, credentials)?;
        self.sync_state();
        self.send_message(message).await
    }

    pub(crate) fn bind_completed(&self, result_code: i32) {
        self.session.lock().unwrap().bind_completed(result_code);
        self.sync_state();
    }

    /// Wait for the next message with the given id, bounded by the configured
    /// operation timeout.
    pub async fn wait_for_message(&self, id: i32) -> Result<LdapMessage> {
        self.router
            .wait_for_message(id, self.operation_timeout, &self.shutdown)
            .await
    }

    /// Like [`wait_for_message`](Self::wait_for_message) with an explicit
    /// deadline and caller cancellation.
    pub async fn wait_for_message_with(
        &self,
        id: i32,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<LdapMessage> {
        self.router.wait_for_message(id, timeout, cancel).await
    }

    /// Drop the pending queue for a finished operation.
    pub fn remove_message_queue(&self, id: i32) {
        self.router.remove_message_queue(id);
    }

    /// Install the SASL security layer. Must be called at a quiet point (the
    /// end of the bind exchange): every byte after the server's final bind
    /// response is expected to be framed.
    pub fn install_security_layer(&self, ctx: Arc<dyn SecurityContext>, confidential: bool) {
        info!(confidential, "installing SASL security layer");
        self.seal
            .store(Some(Arc::new(SealContext { ctx, confidential })));
    }

    pub fn security_layer_installed(&self) -> bool {
        self.seal.load().is_some()
    }

    /// StartTLS: run the extended operation, then swap the plaintext TCP
    /// stream for a TLS one in place. Both pipeline directions are paused
    /// around the handshake; no other traffic may be in flight.
    pub async fn start_tls(&self, tls_config: Option<&TlsConfig>) -> Result<()> {
        let message = self.session.lock().unwrap().start_tls_request()?;
        let id = self.send_message(message).await?;
        let response = self.wait_for_message(id).await?;
        self.remove_message_queue(id);
        match response.protocol_op {
            ProtocolOp::ExtendedResponse(resp) if resp.result.is_success() => {}
            ProtocolOp::ExtendedResponse(resp) => {
                return Err(LdapError::Transport(format!(
                    "StartTLS refused: code {} ({})",
                    resp.result.result_code, resp.result.diagnostic_message
                )));
            }
            other => {
                return Err(LdapError::decode(format!(
                    "unexpected response to StartTLS: {:?}",
                    other
                )));
            }
        }

        let (tx, rx) = oneshot::channel();
        self.socket_ctl
            .send(SocketControl::Pause(tx))
            .await
            .map_err(|_| LdapError::Transport("socket task stopped".to_string()))?;
        let read_half = rx
            .await
            .map_err(|_| LdapError::Transport("socket task stopped".to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.writer_tx
            .send(WriterCommand::Pause(tx))
            .await
            .map_err(|_| LdapError::Transport("writer task stopped".to_string()))?;
        let write_half = rx
            .await
            .map_err(|_| LdapError::Transport("writer task stopped".to_string()))?;

        let stream = read_half.unsplit(write_half);
        let tcp = match stream {
            ClientStream::Tcp(tcp) => tcp,
            ClientStream::Tls(_) => {
                return Err(LdapError::Transport(
                    "connection is already TLS".to_string(),
                ))
            }
        };

        let config = tls::client_config(tls_config)?;
        let connector = TlsConnector::from(config);
        let name = tls::server_name(&self.host)?;
        let tls_stream = connector
            .connect(name, tcp)
            .await
            .map_err(|e| LdapError::Transport(format!("StartTLS handshake: {}", e)))?;

        let (read_half, write_half) = tokio::io::split(ClientStream::Tls(Box::new(tls_stream)));
        self.socket_ctl
            .send(SocketControl::Resume(read_half))
            .await
            .map_err(|_| LdapError::Transport("socket task stopped".to_string()))?;
        self.writer_tx
            .send(WriterCommand::Resume(write_half))
            .await
            .map_err(|_| LdapError::Transport("writer task stopped".to_string()))?;
        info!(host = %self.host, "StartTLS upgrade complete");
        Ok(())
    }

    /// Graceful teardown: stop reading, send Unbind if the session is open,
    /// drain the writer, then await the pipeline tasks. Idempotent.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let unbind = {
            let mut session = self.session.lock().unwrap();
            if session.state() == SessionState::Opened {
                session.unbind().ok()
            } else {
                session.close();
                None
            }
        };
        self.sync_state();
        if let Some(message) = unbind {
            let bytes = codec::encode_ldap_message(&message);
            let _ = self.writer_tx.send(WriterCommand::Data(bytes)).await;
        }
        let _ = self.writer_tx.send(WriterCommand::Shutdown).await;
        let handles: Vec<JoinHandle<()>> = self.tasks.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        debug!("connection closed");
    }
}
