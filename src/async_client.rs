use chrono::{DateTime, Utc};
use crate::{
    codec::{CastMessageCodec, DEFAULT_MAX_FRAME_LEN},
    error::{CloseReason, Error},
    heartbeat,
    message::CastMessage,
    payload::{self, Payload, PayloadDyn, PayloadHeader, RequestIdGen,
              RequestInner, ResponseInner},
    types::{AppSession,
            EndpointId, EndpointIdConst,
            MediaSessionId,
            MessageTypeConst,
            NamespaceConst,
            RequestId},
    util::{lock, named},
};
use futures::{
    future::Either,
    SinkExt, Stream, StreamExt,
    stream::{SplitSink, SplitStream},
};
use once_cell::sync::Lazy;
use pin_project_lite::pin_project;
use serde::Deserialize;
use std::{
    collections::{HashMap, HashSet},
    fmt::{self, Debug},
    io,
    net::{IpAddr, SocketAddr},
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard, atomic::{AtomicUsize, Ordering}},
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    pin,
    sync::{broadcast, mpsc, oneshot, watch},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::{
    codec::Framed,
    time::delay_queue::{DelayQueue, Expired as DelayExpired, Key as DelayKey},
};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A control session with one cast device.
///
/// All methods take `&self`; concurrent requests are correlated by request id
/// inside a single background task that owns the socket.
pub struct Client {
    /// Some(_) until `.close()` is called.
    task_join_handle: Mutex<Option<JoinHandle<()>>>,
    heartbeat_join_handle: Mutex<Option<JoinHandle<()>>>,

    task_cmd_tx: mpsc::Sender::<TaskCmd>,

    request_id_gen: RequestIdGen,
    next_command_id: AtomicUsize,

    pub(crate) shared: Arc<Shared>,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub addr: SocketAddr,

    /// Source id on every message this client sends. `None` means `sender-0`.
    pub sender: Option<EndpointId>,

    /// Bounds TCP connect plus the TLS handshake.
    pub connect_timeout: Duration,

    /// Default bound for one request/response round trip.
    pub request_timeout: Duration,

    pub heartbeat_interval: Duration,

    /// The channel fails after `heartbeat_interval * heartbeat_timeout_factor`
    /// without any traffic from the device.
    pub heartbeat_timeout_factor: u32,

    pub max_frame_len: usize,
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
    Failed,
}

/// Data shared between `Client`, its `Task` and the heartbeat.
pub(crate) struct Shared {
    pub(crate) config: Config,
    status_tx: broadcast::Sender<StatusUpdate>,
    state_tx: watch::Sender<ChannelState>,

    // Written only by the Task, replaced wholesale.
    pub(crate) receiver_status_tx: watch::Sender<Option<Arc<payload::receiver::Status>>>,
    pub(crate) media_status_tx: watch::Sender<Option<Arc<payload::media::Status>>>,

    close_reason: Mutex<Option<CloseReason>>,
    last_seen: Mutex<Instant>,
    session: Mutex<SessionState>,
    local_addr: Option<SocketAddr>,
}

/// Which receiver app and media session the controllers currently address.
#[derive(Debug, Default)]
pub(crate) struct SessionState {
    pub(crate) app_session: Option<AppSession>,
    pub(crate) media_session_id: Option<MediaSessionId>,

    /// True from sending LOAD until its response is handled.
    pub(crate) loading: bool,
}

pin_project! {
    struct Task<S: TokioAsyncStream> {
        #[pin]
        conn_framed_sink: SplitSink<Framed<S, CastMessageCodec>, CastMessage>,

        #[pin]
        conn_framed_stream: SplitStream<Framed<S, CastMessageCodec>>,

        #[pin]
        task_cmd_rx: tokio_stream::wrappers::ReceiverStream<TaskCmd>,

        #[pin]
        timeout_queue: DelayQueue<RequestId>,

        need_flush: bool,
        requests_map: HashMap<RequestId, RequestState>,

        // Destinations with an open virtual connection, closed on shutdown.
        connected_destinations: HashSet<EndpointId>,

        shared: Arc<Shared>,
    }
}

#[derive(Debug)]
struct RequestState {
    response_ns: NamespaceConst,
    delay_key: DelayKey,
    timeout: Duration,
    result_sender: TaskCmdResultSender,
}

#[derive(Debug)]
pub(crate) struct TaskCmdResultSender {
    command_id: CommandId,
    result_tx: oneshot::Sender::<TaskCmdResult>,
}

#[derive(Debug)]
pub(crate) enum TaskCmd {
    Rpc {
        rpc: Box<CastRpc>,
        result_sender: TaskCmdResultSender,
    },
    Send {
        send: Box<CastSend>,
        result_sender: TaskCmdResultSender,
    },

    /// Send a heartbeat PING to the platform receiver.
    Ping,

    /// Fail the channel, e.g. on heartbeat timeout.
    Fail(CloseReason),

    Shutdown {
        result_sender: TaskCmdResultSender,
    },
}

#[derive(Debug)]
pub(crate) struct CastRpc {
    request_message: CastMessage,
    request_id: RequestId,
    response_ns: NamespaceConst,
    timeout: Duration,
}

#[derive(Debug)]
pub(crate) struct CastSend {
    request_message: CastMessage,
    typ: MessageTypeConst,
}

#[derive(Debug)]
enum TaskResponse {
    Done,
    Reply(Box<PayloadDyn>),
}

type TaskCmdResult = Result<TaskResponse>;

pub trait TokioAsyncStream: AsyncRead + AsyncWrite + Unpin {}

impl<T> TokioAsyncStream for T
where T: AsyncRead + AsyncWrite + Unpin
{}

type CommandId = usize;

#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct StatusUpdate {
    pub time: DateTime<Utc>,
    pub msg: StatusMessage,
}

/// Unsolicited messages from the device.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum StatusMessage {
    Receiver(Arc<payload::receiver::Status>),
    Media(Arc<payload::media::Status>),

    /// The device closed the virtual connection to an app transport.
    ConnectionClosed { source: EndpointId },
}

/// Upper bound for the task to accept a command and act on it locally.
const LOCAL_TASK_COMMAND_TIMEOUT: Duration = Duration::from_millis(1_000);

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_HEARTBEAT_TIMEOUT_FACTOR: u32 = 3;

const DATA_BUFFER_LEN: usize = 64 * 1024;

const TASK_CMD_CHANNEL_CAPACITY: usize = 16;

const STATUS_BROADCAST_CHANNEL_CAPACITY: usize = 16;

const TASK_DELAY_QUEUE_CAPACITY: usize = 4;

static JSON_NAMESPACES: Lazy<HashSet<NamespaceConst>> = Lazy::<HashSet<NamespaceConst>>::new(|| {
    HashSet::from([
        payload::connection::CHANNEL_NAMESPACE,
        payload::heartbeat::CHANNEL_NAMESPACE,
        payload::media::CHANNEL_NAMESPACE,
        payload::receiver::CHANNEL_NAMESPACE,
    ])
});

pub const DEFAULT_SENDER_ID: EndpointIdConst = "sender-0";
pub const DEFAULT_RECEIVER_ID: EndpointIdConst = "receiver-0";

/// Receiver application ids.
pub mod app {
    use crate::types::AppIdConst;

    pub const DEFAULT_MEDIA_RECEIVER: AppIdConst = "CC1AD845";
}

pub const DEFAULT_PORT: u16 = 8009;

impl Config {
    pub fn new(addr: SocketAddr) -> Config {
        Config {
            addr,
            sender: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            heartbeat_timeout_factor: DEFAULT_HEARTBEAT_TIMEOUT_FACTOR,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    pub fn with_sender(mut self, sender: impl Into<EndpointId>) -> Config {
        self.sender = Some(sender.into());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Config {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Config {
        self.request_timeout = timeout;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Config {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_heartbeat_timeout_factor(mut self, factor: u32) -> Config {
        self.heartbeat_timeout_factor = factor;
        self
    }

    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Config {
        self.max_frame_len = max_frame_len;
        self
    }

    /// Rejects settings a session cannot run with: a zero heartbeat interval
    /// or timeout factor would leave the device's liveness unchecked.
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval.is_zero() {
            return Err(Error::InvalidConfig("heartbeat_interval must be non-zero".to_string()));
        }
        if self.heartbeat_timeout_factor == 0 {
            return Err(Error::InvalidConfig(
                "heartbeat_timeout_factor must be non-zero".to_string()));
        }
        Ok(())
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_interval.saturating_mul(self.heartbeat_timeout_factor)
    }

    pub fn sender(&self) -> EndpointId {
        self.sender.as_ref()
            .cloned()
            .unwrap_or_else(|| DEFAULT_SENDER_ID.to_string())
    }

    /// Open a TLS control channel to `self.addr` and declare presence to the device.
    pub async fn connect(self) -> Result<Client> {
        self.validate()?;
        let (conn, local_addr) = tls_connect(&self).await?;
        Client::start(conn, Some(local_addr), self).await
    }
}

impl Client {
    /// Run a session over an already established stream, e.g. one end of
    /// `tokio::io::duplex`.
    pub async fn from_stream<S>(conn: S, config: Config) -> Result<Client>
    where S: TokioAsyncStream + Send + 'static
    {
        Self::start(conn, None, config).await
    }

    #[named]
    async fn start<S>(conn: S, local_addr: Option<SocketAddr>, config: Config)
    -> Result<Client>
    where S: TokioAsyncStream + Send + 'static
    {
        config.validate()?;

        let (task_cmd_tx, task_cmd_rx) = mpsc::channel(TASK_CMD_CHANNEL_CAPACITY);

        let shared = Arc::new(Shared::new(config, local_addr));

        let task = Task::new(conn, task_cmd_rx, Arc::clone(&shared));

        let task_join_handle = tokio::spawn(task.main());

        let client = Client {
            task_join_handle: Mutex::new(Some(task_join_handle)),
            heartbeat_join_handle: Mutex::new(None),
            task_cmd_tx,

            request_id_gen: RequestIdGen::new(),
            next_command_id: AtomicUsize::new(1),

            shared,
        };

        let connect_req = payload::connection::ConnectRequest {
            user_agent: payload::USER_AGENT.to_string(),
        };
        if let Err(err) = client.json_send(connect_req, DEFAULT_RECEIVER_ID.to_string()).await {
            client.abort_tasks();
            return Err(err);
        }

        // The Task may already have failed the channel.
        client.shared.state_tx.send_if_modified(|state| {
            if *state == ChannelState::Connecting {
                *state = ChannelState::Connected;
                true
            } else {
                false
            }
        });

        let heartbeat = tokio::spawn(heartbeat::run(Arc::clone(&client.shared),
                                                    client.task_cmd_tx.clone()));
        *lock(&client.heartbeat_join_handle) = Some(heartbeat);

        tracing::info!(target: method_path!("Client"),
                       addr = %client.config().addr,
                       state = ?client.state(),
                       "session started");

        Ok(client)
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn state(&self) -> ChannelState {
        self.shared.state()
    }

    /// Why the channel stopped, once it has.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.shared.close_reason()
    }

    /// Local address of the control connection, when connected over TCP.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.local_addr
    }

    /// Stream of unsolicited status pushes from the device.
    ///
    /// Responses to this client's own requests are not included.
    pub fn listen_status(&self) -> impl Stream<Item = StatusUpdate> + Send {
        tokio_stream::wrappers::BroadcastStream::new(self.shared.status_tx.subscribe())
            .filter_map(|res| futures::future::ready(match res {
                Ok(it) => Some(it),
                Err(tokio_stream::wrappers::errors::BroadcastStreamRecvError::Lagged(n)) => {
                    tracing::warn!(target: concat!(module_path!(),
                                                   "::Client::listen_status"),
                                   n,
                                   "lagged");
                    None
                },
            }))
    }

    /// Send `req` to `destination` and wait up to `timeout` for the response
    /// carrying the same request id.
    pub async fn request<Req, Resp>(&self, req: Req, destination: EndpointId, timeout: Duration)
    -> Result<Payload<Resp>>
    where Req: RequestInner,
          Resp: ResponseInner
    {
        self.ensure_connected()?;
        self.json_rpc(req, destination, timeout).await
    }

    /// Send `req` to `destination` without waiting for any response.
    pub async fn send<Req>(&self, req: Req, destination: EndpointId) -> Result<()>
    where Req: RequestInner
    {
        self.ensure_connected()?;
        self.json_send(req, destination).await
    }

    /// Open a virtual connection to `destination`, e.g. an app transport id.
    pub async fn connection_connect(&self, destination: EndpointId) -> Result<()> {
        let payload_req = payload::connection::ConnectRequest {
            user_agent: payload::USER_AGENT.to_string(),
        };
        self.send(payload_req, destination).await
    }

    /// Close virtual connections, shut the socket and stop background tasks.
    ///
    /// Pending requests fail with `ChannelClosed`. Calling again is a no-op.
    #[named]
    pub async fn close(&self) -> Result<()> {
        const METHOD_PATH: &str = method_path!("Client");

        let Some(join_handle) = lock(&self.task_join_handle).take() else {
            return Ok(());
        };

        if let Some(heartbeat) = lock(&self.heartbeat_join_handle).take() {
            heartbeat.abort();
        }

        self.shared.state_tx.send_if_modified(|state| {
            if *state == ChannelState::Connected {
                *state = ChannelState::Closing;
                true
            } else {
                false
            }
        });

        let (result_sender, result_rx) = self.result_channel();
        match self.task_cmd_tx.send(TaskCmd::Shutdown { result_sender }).await {
            Ok(()) => {
                if let Ok(Ok(Err(err))) =
                    tokio::time::timeout(LOCAL_TASK_COMMAND_TIMEOUT, result_rx).await
                {
                    tracing::warn!(target: METHOD_PATH,
                                   ?err,
                                   "shutdown error");
                }
            },
            // Task already exited.
            Err(_) => (),
        }

        let abort_handle = join_handle.abort_handle();
        match tokio::time::timeout(LOCAL_TASK_COMMAND_TIMEOUT, join_handle).await {
            Ok(Ok(())) => (),
            Ok(Err(err)) => tracing::warn!(target: METHOD_PATH,
                                           ?err,
                                           "task join error"),
            Err(_elapsed) => {
                tracing::warn!(target: METHOD_PATH,
                               "task did not stop in time, aborting");
                abort_handle.abort();
            },
        }

        tracing::info!(target: METHOD_PATH,
                       state = ?self.state(),
                       close_reason = ?self.close_reason(),
                       "closed");

        Ok(())
    }
}

/// Internals.
impl Client {
    pub(crate) fn ensure_connected(&self) -> Result<()> {
        match self.shared.state() {
            ChannelState::Connected => Ok(()),
            ChannelState::Failed => Err(self.shared.closed_error()),
            ChannelState::Disconnected
            | ChannelState::Connecting
            | ChannelState::Closing => Err(Error::NotConnected),
        }
    }

    pub(crate) fn session(&self) -> MutexGuard<'_, SessionState> {
        self.shared.session()
    }

    fn response_from_dyn<Resp>(&self, payload_dyn: PayloadDyn)
    -> Result<Payload<Resp>>
    where Resp: ResponseInner
    {
        let expected_types = Resp::TYPE_NAMES;

        if !expected_types.contains(&payload_dyn.typ.as_str()) {
            return Err(Error::UnexpectedResponse(format!(
                "type {typ:?} in namespace {ns:?}, expected one of {expected_types:?}",
                typ = payload_dyn.typ,
                ns = Resp::CHANNEL_NAMESPACE)));
        }

        Ok(Payload::<Resp> {
            request_id: payload_dyn.request_id,
            typ: payload_dyn.typ,
            inner: serde_json::from_value(payload_dyn.inner)?,
        })
    }

    pub(crate) async fn json_send<Req>(&self, req: Req, destination: EndpointId)
    -> Result<()>
    where Req: RequestInner
    {
        let request_message = cast_message_from_inner(
            req, None, self.config().sender(), destination)?;

        let (result_sender, result_rx) = self.result_channel();
        let cmd = TaskCmd::Send {
            send: Box::new(CastSend {
                request_message,
                typ: Req::TYPE_NAME,
            }),
            result_sender,
        };

        let backstop = self.config().request_timeout + LOCAL_TASK_COMMAND_TIMEOUT;
        self.task_cmd(cmd, result_rx, backstop,
                      || Error::Io(io::Error::new(io::ErrorKind::TimedOut,
                                                  "send timed out"))).await?;

        Ok(())
    }

    #[named]
    pub(crate) async fn json_rpc<Req, Resp>(&self, req: Req, destination: EndpointId,
                                            timeout: Duration)
    -> Result<Payload<Resp>>
    where Req: RequestInner,
          Resp: ResponseInner
    {
        let start = Instant::now();

        let request_id = self.request_id_gen.take_next();
        let request_message = cast_message_from_inner(
            req, Some(request_id), self.config().sender(), destination)?;

        let response_ns = Resp::CHANNEL_NAMESPACE;
        let response_type_names = Resp::TYPE_NAMES;

        let (result_sender, result_rx) = self.result_channel();
        let cmd = TaskCmd::Rpc {
            rpc: Box::new(CastRpc {
                request_message,
                request_id,
                response_ns,
                timeout,
            }),
            result_sender,
        };

        // The Task enforces `timeout`; this only guards against a stuck Task.
        let backstop = timeout + LOCAL_TASK_COMMAND_TIMEOUT;
        let response = self.task_cmd(cmd, result_rx, backstop,
                                     || Error::RequestTimeout { request_id, timeout }).await?;

        let TaskResponse::Reply(resp_dyn) = response else {
            return Err(Error::UnexpectedResponse(
                format!("request {request_id} completed without a reply")));
        };
        let resp: Payload<Resp> = self.response_from_dyn(*resp_dyn)?;

        let elapsed = start.elapsed();

        tracing::debug!(target: method_path!("Client"),
                        ?elapsed,
                        response_payload = ?resp,
                        response_ns,
                        response_type_name = resp.typ,
                        expected_response_type_names = ?response_type_names,
                        %request_id,
                        "json_rpc response");

        Ok(resp)
    }

    fn result_channel(&self) -> (TaskCmdResultSender, oneshot::Receiver<TaskCmdResult>) {
        let (result_tx, result_rx) = oneshot::channel::<TaskCmdResult>();
        let result_sender = TaskCmdResultSender {
            command_id: self.take_command_id(),
            result_tx,
        };
        (result_sender, result_rx)
    }

    async fn task_cmd(&self, cmd: TaskCmd, result_rx: oneshot::Receiver<TaskCmdResult>,
                      backstop: Duration, on_timeout: impl FnOnce() -> Error)
    -> Result<TaskResponse>
    {
        if self.task_cmd_tx.send(cmd).await.is_err() {
            return Err(self.shared.closed_error());
        }

        match tokio::time::timeout(backstop, result_rx).await {
            Err(_elapsed) => Err(on_timeout()),
            // Task dropped the sender: it has exited.
            Ok(Err(_recv_err)) => Err(self.shared.closed_error()),
            Ok(Ok(result)) => result,
        }
    }

    fn take_command_id(&self) -> CommandId {
        self.next_command_id.fetch_add(1, Ordering::SeqCst)
    }

    fn abort_tasks(&self) {
        if let Some(task) = lock(&self.task_join_handle).take() {
            task.abort();
        }
        if let Some(heartbeat) = lock(&self.heartbeat_join_handle).take() {
            heartbeat.abort();
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if lock(&self.task_join_handle).is_some() {
            tracing::warn!("Client: task not stopped before drop.\n\
                            Use Client::close to dispose of Client.");
            self.abort_tasks();
        }
    }
}

impl Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let task_running = lock(&self.task_join_handle).is_some();
        f.debug_struct("Client")
         .field("config", &self.shared.config)
         .field("state", &self.state())
         .field("task", if task_running { &"Some" } else { &"None" })
         .finish_non_exhaustive()
    }
}

impl Shared {
    fn new(config: Config, local_addr: Option<SocketAddr>) -> Shared {
        Shared {
            config,
            status_tx: broadcast::channel(STATUS_BROADCAST_CHANNEL_CAPACITY).0,
            state_tx: watch::channel(ChannelState::Connecting).0,
            receiver_status_tx: watch::channel(None).0,
            media_status_tx: watch::channel(None).0,
            close_reason: Mutex::new(None),
            last_seen: Mutex::new(Instant::now()),
            session: Mutex::new(SessionState::default()),
            local_addr,
        }
    }

    pub(crate) fn state(&self) -> ChannelState {
        *self.state_tx.borrow()
    }

    pub(crate) fn subscribe_state(&self) -> watch::Receiver<ChannelState> {
        self.state_tx.subscribe()
    }

    pub(crate) fn close_reason(&self) -> Option<CloseReason> {
        lock(&self.close_reason).clone()
    }

    pub(crate) fn since_last_seen(&self) -> Duration {
        lock(&self.last_seen).elapsed()
    }

    pub(crate) fn session(&self) -> MutexGuard<'_, SessionState> {
        lock(&self.session)
    }

    fn touch(&self) {
        *lock(&self.last_seen) = Instant::now();
    }

    /// Keeps the first reason recorded.
    fn record_close_reason(&self, reason: CloseReason) {
        let mut guard = lock(&self.close_reason);
        if guard.is_none() {
            *guard = Some(reason);
        }
    }

    fn closed_error(&self) -> Error {
        Error::ChannelClosed(self.close_reason().unwrap_or(CloseReason::Closed))
    }
}

#[tracing::instrument(level = "info",
                      fields(ip = ?config.addr.ip(),
                             port = config.addr.port()))]
#[named]
async fn tls_connect(config: &Config)
-> Result<(impl TokioAsyncStream + Send + 'static, SocketAddr)>
{
    const FUNCTION_PATH: &str = function_path!();

    let addr = config.addr;
    let ip: IpAddr = addr.ip();
    let connect_err = |source: io::Error| Error::Connect { addr, source };

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let tls_config = rustls::ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|err| connect_err(io::Error::new(io::ErrorKind::Other, err)))?
        .dangerous().with_custom_certificate_verifier(Arc::new(
            crate::util::rustls::danger::NoCertificateVerification::new(provider)))
        .with_no_client_auth();

    let connector = tokio_rustls::TlsConnector::from(Arc::new(tls_config));

    let domain = rustls::pki_types::ServerName::from(ip);

    let connect = async {
        let tcp_stream = tokio::net::TcpStream::connect(addr).await?;
        let local_addr = tcp_stream.local_addr()?;

        tracing::debug!(target: FUNCTION_PATH,
                        %local_addr,
                        "TcpStream connected");

        let tls_stream = connector.connect(domain, tcp_stream).await?;

        tracing::debug!(target: FUNCTION_PATH,
                        "TlsStream connected");

        Ok::<_, io::Error>((tls_stream, local_addr))
    };

    match tokio::time::timeout(config.connect_timeout, connect).await {
        Err(_elapsed) => Err(connect_err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("no connection within {:?}", config.connect_timeout)))),
        Ok(res) => res.map_err(connect_err),
    }
}

#[named]
fn cast_message_from_inner<Req>(req: Req, request_id: Option<RequestId>,
                                source: EndpointId, destination: EndpointId)
-> Result<CastMessage>
where Req: RequestInner
{
    const FUNCTION_PATH: &str = function_path!();

    let payload = Payload::<Req> {
        request_id,
        typ: Req::TYPE_NAME.to_string(),
        inner: req,
    };

    let namespace = Req::CHANNEL_NAMESPACE.to_string();

    tracing::debug!(target: FUNCTION_PATH,
                    ?payload,
                    ?request_id,
                    request_type = payload.typ,
                    namespace,
                    source, destination,
                    "payload struct");

    let payload_json = serde_json::to_string(&payload)?;

    tracing::trace!(target: FUNCTION_PATH,
                    payload_json,
                    ?request_id,
                    "payload json");

    Ok(CastMessage {
        namespace,
        source,
        destination,
        payload: payload_json.into(),
    })
}

/// Splits a send error into the error for the caller and, when the socket
/// itself is broken, the reason to fail the channel with.
fn classify_send_error(err: Error) -> (Error, Option<CloseReason>) {
    match err {
        Error::Io(io_err) => {
            let reason = CloseReason::WriteError(io_err.to_string());
            (Error::ChannelClosed(reason.clone()), Some(reason))
        },
        other => (other, None),
    }
}

fn read_failure(err: Error) -> CloseReason {
    match err {
        Error::Protocol(msg) => CloseReason::Protocol(msg),
        other => CloseReason::ReadError(other.to_string()),
    }
}

#[derive(Debug)]
enum TaskEvent {
    Cmd(TaskCmd),
    Flush(Result<()>),

    /// `None` once the device has ended the stream.
    MessageRead(Option<Result<CastMessage>>),

    RpcTimeout(DelayExpired<RequestId>),
}

impl<S: TokioAsyncStream> Task<S> {
    fn new(
        conn: S,
        task_cmd_rx: mpsc::Receiver::<TaskCmd>,
        shared: Arc<Shared>,
    ) -> Task<S> {
        let task_cmd_rx = tokio_stream::wrappers::ReceiverStream::new(task_cmd_rx);

        let timeout_queue = DelayQueue::<RequestId>::with_capacity(TASK_DELAY_QUEUE_CAPACITY);

        let cast_message_codec = CastMessageCodec::new(shared.config.max_frame_len);
        let conn_framed = Framed::with_capacity(conn, cast_message_codec, DATA_BUFFER_LEN);

        let (conn_framed_sink, conn_framed_stream) = conn_framed.split();

        Task {
            conn_framed_sink,
            conn_framed_stream,

            task_cmd_rx,
            timeout_queue,

            need_flush: false,
            requests_map: HashMap::new(),
            connected_destinations: HashSet::new(),

            shared,
        }
    }

    #[named]
    async fn main(self) {
        const METHOD_PATH: &str = method_path!("Task");

        pin! {
            let this = self;
        }

        let failure: CloseReason = loop {
            let Some(event) = this.as_mut().take_next_event().await else {
                tracing::info!(target: METHOD_PATH,
                               "shutdown on event stream closed");
                break CloseReason::Closed;
            };

            tracing::trace!(target: METHOD_PATH,
                            ?event,
                            "event");

            let res: Result<(), CloseReason> = match event {
                TaskEvent::Cmd(TaskCmd::Rpc { rpc, result_sender }) =>
                    this.as_mut().handle_rpc_cmd(rpc, result_sender).await,

                TaskEvent::Cmd(TaskCmd::Send { send, result_sender }) =>
                    this.as_mut().handle_send(send, result_sender).await,

                TaskEvent::Cmd(TaskCmd::Ping) => {
                    let destination = DEFAULT_RECEIVER_ID.to_string();
                    this.as_mut().send_unsolicited(payload::heartbeat::Ping {}, destination)
                        .await
                },

                TaskEvent::Cmd(TaskCmd::Fail(reason)) => Err(reason),

                TaskEvent::Cmd(TaskCmd::Shutdown { result_sender }) => {
                    tracing::info!(target: METHOD_PATH,
                                   "shutdown on command");
                    this.as_mut().shutdown().await;
                    Self::respond(result_sender, Ok(TaskResponse::Done));
                    return;
                },

                TaskEvent::MessageRead(None) => Err(CloseReason::Eof),

                TaskEvent::MessageRead(Some(Err(err))) => Err(read_failure(err)),

                TaskEvent::MessageRead(Some(Ok(msg))) =>
                    this.as_mut().handle_msg_read(msg).await,

                TaskEvent::RpcTimeout(expired) => {
                    this.as_mut().handle_rpc_timeout(expired);
                    Ok(())
                },

                TaskEvent::Flush(res) => {
                    *this.as_mut().project().need_flush = false;
                    res.map_err(|err| CloseReason::WriteError(err.to_string()))
                },
            };

            if let Err(reason) = res {
                break reason;
            }
        };

        this.as_mut().fail(failure);
    }

    async fn take_next_event(self: Pin<&mut Self>) -> Option<TaskEvent> {
        let mut proj = self.project();

        let conn_flush_stream = if *proj.need_flush {
            let fut = proj.conn_framed_sink.flush();
            let stream = futures::stream::once(fut);
            Either::Left(stream)
        } else {
            Either::Right(futures::stream::empty())
        };

        let mut read_stream = proj.conn_framed_stream
            .map(|res| TaskEvent::MessageRead(Some(res)))
            .chain(futures::stream::once(futures::future::ready(
                TaskEvent::MessageRead(None))));

        // Bound to a local so the temporaries outlive `merge()`.
        let streams = (
            &mut (conn_flush_stream.map(TaskEvent::Flush)),
            &mut (proj.task_cmd_rx.map(TaskEvent::Cmd)),
            &mut (proj.timeout_queue.map(TaskEvent::RpcTimeout)),
            &mut (read_stream),
        );

        let mut merged = futures_concurrency::stream::Merge::merge(streams);

        merged.next().await
    }

    #[named]
    async fn handle_send(mut self: Pin<&mut Self>,
                         send: Box<CastSend>, result_sender: TaskCmdResultSender)
    -> Result<(), CloseReason>
    {
        const METHOD_PATH: &str = method_path!("Task");

        let deadline = Instant::now() + self.shared.config.request_timeout;

        let CastSend {
            request_message,
            typ,
        } = *send;

        let command_id = result_sender.command_id;
        let destination = request_message.destination.clone();
        let is_connection_ns =
            request_message.namespace == payload::connection::CHANNEL_NAMESPACE;

        tracing::debug!(target: METHOD_PATH,
                        ?deadline,
                        command_id,
                        typ,
                        ?request_message,
                        "msg send");

        match self.as_mut().send_raw(request_message, deadline).await {
            Ok(()) => {
                if is_connection_ns {
                    let connected = self.as_mut().project().connected_destinations;
                    match typ {
                        payload::connection::MESSAGE_TYPE_CONNECT => {
                            connected.insert(destination);
                        },
                        payload::connection::MESSAGE_TYPE_CLOSE => {
                            connected.remove(&destination);
                        },
                        _ => (),
                    }
                }

                Self::respond(result_sender, Ok(TaskResponse::Done));
                Ok(())
            },
            Err(err) => {
                tracing::warn!(target: METHOD_PATH,
                               ?err,
                               command_id,
                               typ,
                               "send_raw error");

                let (err, broken) = classify_send_error(err);
                Self::respond(result_sender, Err(err));
                broken.map_or(Ok(()), Err)
            },
        }
    }

    #[named]
    async fn handle_rpc_cmd(mut self: Pin<&mut Self>,
                            rpc: Box<CastRpc>, result_sender: TaskCmdResultSender)
    -> Result<(), CloseReason>
    {
        const METHOD_PATH: &str = method_path!("Task");

        let CastRpc {
            request_message,
            request_id,
            response_ns,
            timeout,
        } = *rpc;

        let deadline = Instant::now() + timeout;

        let command_id = result_sender.command_id;

        tracing::trace!(target: METHOD_PATH,
                        ?deadline,
                        %request_id,
                        command_id,
                        ?request_message,
                        response_ns,
                        "rpc send");

        if let Err(err) = self.as_mut().send_raw(request_message, deadline).await {
            tracing::warn!(target: METHOD_PATH,
                           ?err,
                           %request_id,
                           command_id,
                           response_ns,
                           "send_raw error");

            let (err, broken) = classify_send_error(err);
            Self::respond(result_sender, Err(err));
            return broken.map_or(Ok(()), Err);
        }

        // # Record request state and set timeout.
        let mut proj = self.as_mut().project();
        let delay_key = proj.timeout_queue.as_mut().insert_at(request_id, deadline);

        let state = RequestState {
            response_ns,
            delay_key,
            timeout,
            result_sender,
        };

        proj.requests_map.insert(request_id, state);

        Ok(())
    }

    /// Send a payload that expects no response, e.g. PING, PONG, CLOSE.
    #[named]
    async fn send_unsolicited<Req>(mut self: Pin<&mut Self>, req: Req, destination: EndpointId)
    -> Result<(), CloseReason>
    where Req: RequestInner
    {
        const METHOD_PATH: &str = method_path!("Task");

        let source = self.shared.config.sender();
        let msg = match cast_message_from_inner(req, None, source, destination) {
            Ok(msg) => msg,
            Err(err) => {
                tracing::error!(target: METHOD_PATH,
                                ?err,
                                typ = Req::TYPE_NAME,
                                "serialisation error");
                return Ok(());
            },
        };

        let deadline = Instant::now() + self.shared.config.request_timeout;

        tracing::debug!(target: METHOD_PATH,
                        ?msg,
                        typ = Req::TYPE_NAME,
                        "msg send");

        match self.as_mut().send_raw(msg, deadline).await {
            Ok(()) => Ok(()),
            Err(err) => {
                tracing::warn!(target: METHOD_PATH,
                               ?err,
                               typ = Req::TYPE_NAME,
                               "send_raw error");
                classify_send_error(err).1.map_or(Ok(()), Err)
            },
        }
    }

    async fn send_raw(self: Pin<&mut Self>, msg: CastMessage, deadline: Instant
    ) -> Result<()> {
        let mut proj = self.project();

        *proj.need_flush = true;

        let fut = proj.conn_framed_sink.feed(msg);
        match tokio::time::timeout_at(deadline, fut).await {
            Ok(res) => res,
            Err(_elapsed) => Err(Error::Io(io::Error::new(io::ErrorKind::TimedOut,
                                                          "write timed out"))),
        }
    }

    #[named]
    async fn handle_msg_read(mut self: Pin<&mut Self>, msg: CastMessage)
    -> Result<(), CloseReason>
    {
        const METHOD_PATH: &str = method_path!("Task");

        // Any traffic proves the device is alive.
        self.shared.touch();

        let msg_time = Utc::now();

        tracing::trace!(target: METHOD_PATH,
                        ?msg, ?msg_time,
                        "message read");

        let msg_ns = msg.namespace.as_str();
        if !JSON_NAMESPACES.contains(msg_ns) {
            tracing::warn!(target: METHOD_PATH,
                           msg_ns,
                           ?msg,
                           "message namespace not known");
            return Ok(());
        }

        let Some(pd_json_str) = msg.payload.as_str() else {
            tracing::warn!(target: METHOD_PATH,
                           msg_ns,
                           ?msg,
                           "binary message not known");
            return Ok(());
        };

        tracing::trace!(target: METHOD_PATH,
                        pd_json_str,
                        "message payload json");

        let pd_value: serde_json::Value = match serde_json::from_str(pd_json_str) {
            Err(err) => {
                tracing::warn!(target: METHOD_PATH,
                               ?err, ?msg,
                               "error deserializing json as Value");
                return Ok(());
            },
            Ok(v) => v,
        };

        let header = match PayloadHeader::deserialize(&pd_value) {
            Err(err) => {
                tracing::warn!(target: METHOD_PATH,
                               ?err, ?msg,
                               "error deserializing payload header");
                return Ok(());
            },
            Ok(h) => h,
        };

        let pd_type = header.typ.as_str();

        // # Special message cases

        if msg_ns == payload::heartbeat::CHANNEL_NAMESPACE {
            if pd_type == payload::heartbeat::MESSAGE_TYPE_PING {
                return self.send_unsolicited(payload::heartbeat::Pong {}, msg.source).await;
            }

            tracing::trace!(target: METHOD_PATH,
                            pd_type,
                            "heartbeat message");
            return Ok(());
        }

        if msg_ns == payload::connection::CHANNEL_NAMESPACE
            && pd_type == payload::connection::MESSAGE_TYPE_CLOSE
        {
            return self.handle_close_from(msg.source);
        }

        // Status snapshots are stored whether solicited or pushed.
        let status_msg: Option<StatusMessage> = match (msg_ns, pd_type) {
            (payload::receiver::CHANNEL_NAMESPACE,
             payload::receiver::MESSAGE_RESPONSE_TYPE_RECEIVER_STATUS) =>
                self.store_receiver_status(&pd_value).map(StatusMessage::Receiver),

            (payload::media::CHANNEL_NAMESPACE,
             payload::media::MESSAGE_RESPONSE_TYPE_MEDIA_STATUS) =>
                self.store_media_status(&pd_value).map(StatusMessage::Media),

            _ => None,
        };

        if let Some(request_id) = header.request_id.filter(|id| id.is_rpc()) {
            let mut proj = self.as_mut().project();

            if let Some(request_state) = proj.requests_map.remove(&request_id) {
                if proj.timeout_queue.as_mut().try_remove(&request_state.delay_key).is_none() {
                    tracing::warn!(target: METHOD_PATH,
                                   ?request_state,
                                   %request_id,
                                   "timeout_queue missing expected delay key");
                }

                let result = if request_state.response_ns != msg_ns {
                    Err(Error::UnexpectedResponse(format!(
                        "reply to request {request_id} in namespace {msg_ns:?}, \
                         expected {expected_ns:?}",
                        expected_ns = request_state.response_ns)))
                } else {
                    Ok(TaskResponse::Reply(Box::new(PayloadDyn {
                        request_id: header.request_id,
                        typ: header.typ.clone(),
                        inner: pd_value,
                    })))
                };

                Self::respond(request_state.result_sender, result);
                return Ok(());
            }

            if status_msg.is_none() {
                tracing::warn!(target: METHOD_PATH,
                               %request_id, msg_ns, pd_type,
                               "no pending request for response");
            } else {
                tracing::debug!(target: METHOD_PATH,
                                %request_id, msg_ns, pd_type,
                                "no pending request, delivering as status push");
            }
        }

        match status_msg {
            Some(status_msg) => self.publish_status_update(StatusUpdate {
                time: msg_time,
                msg: status_msg,
            }),
            None => tracing::debug!(target: METHOD_PATH,
                                    msg_ns, pd_type,
                                    ?msg,
                                    "unhandled message"),
        }

        Ok(())
    }

    #[named]
    fn handle_close_from(mut self: Pin<&mut Self>, source: EndpointId)
    -> Result<(), CloseReason>
    {
        const METHOD_PATH: &str = method_path!("Task");

        if source == DEFAULT_RECEIVER_ID {
            tracing::warn!(target: METHOD_PATH,
                           source,
                           "platform receiver closed the connection");
            return Err(CloseReason::ClosedByDevice);
        }

        tracing::info!(target: METHOD_PATH,
                       source,
                       "app transport closed the connection");

        self.as_mut().project().connected_destinations.remove(&source);

        {
            let mut session = self.shared.session();
            if session.app_session.as_ref()
                      .is_some_and(|app| app.app_destination_id == source)
            {
                session.app_session = None;
            }
        }

        self.publish_status_update(StatusUpdate {
            time: Utc::now(),
            msg: StatusMessage::ConnectionClosed { source },
        });

        Ok(())
    }

    #[named]
    fn handle_rpc_timeout(mut self: Pin<&mut Self>, expired: DelayExpired<RequestId>) {
        const METHOD_PATH: &str = method_path!("Task");

        let deadline = expired.deadline();
        let request_id = expired.into_inner();

        let proj = self.as_mut().project();

        let Some(request_state) = proj.requests_map.remove(&request_id) else {
            tracing::warn!(target: METHOD_PATH,
                           %request_id,
                           "timeout for request no longer pending");
            return;
        };

        tracing::warn!(target: METHOD_PATH,
                       ?deadline,
                       %request_id,
                       ?request_state,
                       "rpc timeout");

        Self::respond(request_state.result_sender,
                      Err(Error::RequestTimeout {
                          request_id,
                          timeout: request_state.timeout,
                      }));
    }

    #[named]
    async fn shutdown(mut self: Pin<&mut Self>) {
        const METHOD_PATH: &str = method_path!("Task");

        let mut destinations: Vec<EndpointId> =
            self.as_mut().project().connected_destinations.drain().collect();

        // App transports first, the platform receiver last.
        destinations.sort_by_key(|d| d == DEFAULT_RECEIVER_ID);

        for destination in destinations {
            let close = payload::connection::CloseRequest {};
            if let Err(reason) = self.as_mut().send_unsolicited(close, destination).await {
                tracing::warn!(target: METHOD_PATH,
                               ?reason,
                               "connection close not sent");
                break;
            }
        }

        let mut proj = self.as_mut().project();
        let flush_and_close = async {
            proj.conn_framed_sink.flush().await?;
            proj.conn_framed_sink.close().await
        };
        match tokio::time::timeout(LOCAL_TASK_COMMAND_TIMEOUT, flush_and_close).await {
            Ok(Ok(())) => (),
            Ok(Err(err)) => tracing::warn!(target: METHOD_PATH,
                                           ?err,
                                           "error closing connection"),
            Err(_elapsed) => tracing::warn!(target: METHOD_PATH,
                                            "timed out closing connection"),
        }
        *proj.need_flush = false;

        self.shared.record_close_reason(CloseReason::Closed);
        self.as_mut().fail_pending(&CloseReason::Closed);
        self.shared.state_tx.send_replace(ChannelState::Disconnected);
    }

    #[named]
    fn fail(self: Pin<&mut Self>, reason: CloseReason) {
        tracing::warn!(target: method_path!("Task"),
                       ?reason,
                       pending = self.requests_map.len(),
                       "channel failed");

        self.shared.record_close_reason(reason.clone());
        self.shared.state_tx.send_replace(ChannelState::Failed);
        self.fail_pending(&reason);
    }

    fn fail_pending(self: Pin<&mut Self>, reason: &CloseReason) {
        let proj = self.project();

        proj.timeout_queue.get_mut().clear();

        for (_request_id, state) in proj.requests_map.drain() {
            Self::respond(state.result_sender, Err(Error::ChannelClosed(reason.clone())));
        }
    }

    #[named]
    fn respond(result_sender: TaskCmdResultSender, result: TaskCmdResult) {
        let command_id = result_sender.command_id;
        let result_variant = if result.is_ok() { "Ok"  }
                             else              { "Err" };

        match result_sender.result_tx.send(result) {
            Ok(()) =>
                tracing::trace!(target: method_path!("Task"),
                                command_id,
                                result_variant,
                                "sent result ok"),
            // The caller gave up waiting, e.g. its backstop timeout fired.
            Err(unsent) =>
                tracing::debug!(target: method_path!("Task"),
                                command_id,
                                result_variant,
                                ?unsent,
                                "result channel dropped"),
        }
    }

    #[named]
    fn store_receiver_status(&self, pd_value: &serde_json::Value)
    -> Option<Arc<payload::receiver::Status>>
    {
        match payload::receiver::StatusWrapper::deserialize(pd_value) {
            Ok(wrapper) => {
                let status = Arc::new(wrapper.status);
                tracing::debug!(target: method_path!("Task"),
                                status = ?payload::receiver::small_debug::ReceiverStatus(&status),
                                "receiver status");
                self.shared.receiver_status_tx.send_replace(Some(Arc::clone(&status)));
                Some(status)
            },
            Err(err) => {
                tracing::warn!(target: method_path!("Task"),
                               ?err, ?pd_value,
                               "error deserialising typed receiver status payload");
                None
            },
        }
    }

    #[named]
    fn store_media_status(&self, pd_value: &serde_json::Value)
    -> Option<Arc<payload::media::Status>>
    {
        match payload::media::Status::deserialize(pd_value) {
            Ok(status) => {
                let status = Arc::new(status);
                tracing::debug!(target: method_path!("Task"),
                                status = ?payload::media::small_debug::MediaStatus(&status),
                                "media status");
                self.shared.media_status_tx.send_replace(Some(Arc::clone(&status)));
                Some(status)
            },
            Err(err) => {
                tracing::warn!(target: method_path!("Task"),
                               ?err, ?pd_value,
                               "error deserialising typed media status payload");
                None
            },
        }
    }

    #[named]
    fn publish_status_update(&self, update: StatusUpdate) {
        const METHOD_PATH: &str = method_path!("Task");
        tracing::debug!(target: METHOD_PATH,
                        ?update,
                        "status update");

        // Ignore an error result, which just means no receivers are currently listening.
        if let Err(err) = self.shared.status_tx.send(update) {
            tracing::trace!(target: METHOD_PATH,
                            ?err,
                            "status send err");
        }
    }
}
