// Per-connection protocol state machine.
//
// Task layout per connection:
//   - a reader task that decodes frames and feeds them through a small
//     channel (so the state machine can react to timers and shutdown
//     without cancelling a read mid-frame),
//   - a writer task that owns the write half; every reply, including those
//     produced by concurrent lookup tasks, is enqueued so the write order
//     is well defined,
//   - the state machine itself, which owns all connection state.
//
// On the switch to splice mode both halves are recovered from their tasks,
// rejoined, and handed to the byte pump; frames read ahead in the meantime
// land in the pending queue, so nothing is lost or reordered.
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};

use egret_wire::{
    BrokerUrl, Command, ErrorKind, Frame, PROTOCOL_VERSION, read_command, write_command,
    write_frame,
};

use crate::admission::ConnectionPermit;
use crate::direct::{DirectProxyHandler, ProxyIo, SpliceContext, splice};
use crate::lookup::LookupProxyHandler;
use crate::service::ProxyService;

/// Connection lifecycle states. A connection is in exactly one state; every
/// transition happens inside the state machine task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Init,
    /// Authentication challenge sent, awaiting the response.
    Connecting { auth_method: String },
    Connected,
    ProxyLookupRequests,
    ProxyConnectingToBroker,
    ProxyConnectionToEndpoint,
    Closing,
    Closed,
}

/// Per-connection bookkeeping: identity, negotiated session parameters,
/// and inbound traffic counters.
struct ProxyConnection {
    id: u64,
    peer: SocketAddr,
    via_tls: bool,
    state: ConnectionState,
    principal: Option<String>,
    protocol_version: u32,
    auth_method: Option<String>,
    inbound_ops: u64,
    inbound_bytes: u64,
}

enum ReaderEvent {
    Frame(Command, Frame),
    Eof,
    Error(egret_wire::Error),
}

enum Action {
    Continue,
    Close,
    StartSplice {
        trigger: Frame,
        request_id: Option<u64>,
        target: BrokerUrl,
        topic: String,
    },
}

enum ConnectOutcome {
    Proceed { broker: ProxyIo, handler: DirectProxyHandler },
    Retry,
    Close,
}

pub(crate) async fn serve_connection(
    service: Arc<ProxyService>,
    io: ProxyIo,
    peer: SocketAddr,
    id: u64,
    permit: ConnectionPermit,
    via_tls: bool,
) {
    // Removing the connection from the live set, releasing the admission
    // slot and decrementing the gauge all ride on this guard, so they also
    // happen if the task unwinds.
    let _guard = service.register_connection(id, permit);

    if service.config().proxy_log_level >= 1 {
        tracing::info!(connection = id, peer = %peer, tls = via_tls, "client connected");
    }

    let (read_half, write_half) = tokio::io::split(io);
    let max_frame_bytes = service.config().max_frame_bytes;

    let (writer_tx, writer_rx) = mpsc::channel::<Frame>(64);
    let writer_task = spawn_writer(write_half, writer_rx);

    let (frame_tx, frame_rx) = mpsc::channel::<ReaderEvent>(8);
    let reader_task = spawn_reader(read_half, frame_tx, max_frame_bytes);

    let mut conn = ProxyConnection {
        id,
        peer,
        via_tls,
        state: ConnectionState::Init,
        principal: None,
        protocol_version: PROTOCOL_VERSION,
        auth_method: None,
        inbound_ops: 0,
        inbound_bytes: 0,
    };

    run_connection(
        &service,
        &mut conn,
        frame_rx,
        reader_task,
        writer_tx,
        writer_task,
    )
    .await;

    conn.state = ConnectionState::Closed;
    if service.config().proxy_log_level >= 1 {
        tracing::info!(
            connection = conn.id,
            peer = %conn.peer,
            ops = conn.inbound_ops,
            bytes = conn.inbound_bytes,
            "client disconnected"
        );
    }
}

fn spawn_writer(
    mut write_half: WriteHalf<ProxyIo>,
    mut writer_rx: mpsc::Receiver<Frame>,
) -> JoinHandle<WriteHalf<ProxyIo>> {
    tokio::spawn(async move {
        while let Some(frame) = writer_rx.recv().await {
            if let Err(err) = write_frame(&mut write_half, &frame).await {
                tracing::debug!(error = %err, "client write failed");
                break;
            }
        }
        write_half
    })
}

fn spawn_reader(
    mut read_half: ReadHalf<ProxyIo>,
    frame_tx: mpsc::Sender<ReaderEvent>,
    max_frame_bytes: usize,
) -> JoinHandle<ReadHalf<ProxyIo>> {
    tokio::spawn(async move {
        loop {
            // Reserving before reading means a closed receiver stops the
            // reader at a frame boundary, and a full channel pauses reads
            // (inbound backpressure) instead of buffering without bound.
            let permit = match frame_tx.reserve().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            match read_command(&mut read_half, max_frame_bytes).await {
                Ok(Some((command, frame))) => permit.send(ReaderEvent::Frame(command, frame)),
                Ok(None) => {
                    permit.send(ReaderEvent::Eof);
                    break;
                }
                Err(err) => {
                    permit.send(ReaderEvent::Error(err));
                    break;
                }
            }
        }
        read_half
    })
}

#[allow(clippy::too_many_lines)]
async fn run_connection(
    service: &Arc<ProxyService>,
    conn: &mut ProxyConnection,
    mut frame_rx: mpsc::Receiver<ReaderEvent>,
    reader_task: JoinHandle<ReadHalf<ProxyIo>>,
    writer_tx: mpsc::Sender<Frame>,
    writer_task: JoinHandle<WriteHalf<ProxyIo>>,
) {
    let mut shutdown = service.shutdown_signal();
    let learned: Arc<DashMap<String, BrokerUrl>> = Arc::new(DashMap::new());
    let mut lookups: JoinSet<()> = JoinSet::new();

    let keep_alive = Duration::from_secs(service.config().keep_alive_interval_seconds);
    let keep_alive_enabled = !keep_alive.is_zero();
    let mut ping_interval = tokio::time::interval_at(
        tokio::time::Instant::now() + keep_alive.max(Duration::from_secs(1)),
        keep_alive.max(Duration::from_secs(1)),
    );
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let idle_timeout = Duration::from_secs(service.config().idle_timeout_seconds);
    let idle_enabled = !idle_timeout.is_zero();
    let mut last_activity = Instant::now();

    // The splice setup that survives the control loop, if any.
    let mut established: Option<(ProxyIo, DirectProxyHandler)> = None;

    'control: loop {
        let idle_deadline =
            tokio::time::Instant::from_std(last_activity + idle_timeout.max(Duration::from_secs(1)));
        let action = tokio::select! {
            event = frame_rx.recv() => match event {
                None | Some(ReaderEvent::Eof) => Action::Close,
                Some(ReaderEvent::Error(err)) => {
                    tracing::debug!(connection = conn.id, error = %err, "frame decode failed");
                    send_error(&writer_tx, 0, ErrorKind::ProtocolError, "malformed frame").await;
                    Action::Close
                }
                Some(ReaderEvent::Frame(command, frame)) => {
                    last_activity = Instant::now();
                    conn.inbound_ops += 1;
                    conn.inbound_bytes += frame.encoded_len() as u64;
                    metrics::counter!("pulsar_proxy_binary_ops").increment(1);
                    metrics::counter!("pulsar_proxy_binary_bytes")
                        .increment(frame.encoded_len() as u64);
                    if service.config().proxy_log_level >= 2 {
                        tracing::debug!(
                            connection = conn.id,
                            command = command.name(),
                            bytes = frame.encoded_len(),
                            "frame"
                        );
                    }
                    process_command(service, conn, &writer_tx, &learned, &mut lookups, command, frame)
                        .await
                }
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    Action::Close
                } else {
                    Action::Continue
                }
            }
            _ = ping_interval.tick(), if keep_alive_enabled => {
                if last_activity.elapsed() > keep_alive * 2 {
                    tracing::debug!(connection = conn.id, "keep-alive expired");
                    Action::Close
                } else {
                    send_command(&writer_tx, &Command::Ping).await;
                    Action::Continue
                }
            }
            _ = tokio::time::sleep_until(idle_deadline), if idle_enabled => {
                tracing::debug!(connection = conn.id, "idle timeout");
                Action::Close
            }
        };

        match action {
            Action::Continue => {}
            Action::Close => break 'control,
            Action::StartSplice {
                trigger,
                request_id,
                target,
                topic,
            } => {
                conn.state = ConnectionState::ProxyConnectingToBroker;
                let mut handler = DirectProxyHandler::new(
                    target,
                    Some(topic),
                    service.config().pending_queue_max_frames,
                );
                // The triggering command is the first thing the broker must
                // see after its handshake.
                if handler.push_pending(trigger).is_err() {
                    send_error(
                        &writer_tx,
                        request_id.unwrap_or(0),
                        ErrorKind::TooManyRequests,
                        "pending queue full",
                    )
                    .await;
                    break 'control;
                }
                match connect_backend(
                    service,
                    conn,
                    &mut frame_rx,
                    &mut shutdown,
                    &writer_tx,
                    handler,
                )
                .await
                {
                    ConnectOutcome::Proceed { broker, handler } => {
                        established = Some((broker, handler));
                        break 'control;
                    }
                    ConnectOutcome::Retry => {
                        conn.state = ConnectionState::ProxyLookupRequests;
                    }
                    ConnectOutcome::Close => break 'control,
                }
            }
        }
    }

    // Cancel in-flight lookups: their semaphore permits release on drop and
    // any late broker replies are discarded.
    lookups.shutdown().await;

    match established {
        Some((broker, handler)) => {
            run_splice(service, conn, frame_rx, reader_task, writer_tx, writer_task, broker, handler)
                .await;
        }
        None => {
            // Plain close: let the writer flush queued replies, then drop
            // both halves.
            drop(writer_tx);
            frame_rx.close();
            let _ = writer_task.await;
            reader_task.abort();
            let _ = reader_task.await;
        }
    }
    conn.state = ConnectionState::Closing;
}

/// One state-machine step for one decoded command.
async fn process_command(
    service: &Arc<ProxyService>,
    conn: &mut ProxyConnection,
    writer_tx: &mpsc::Sender<Frame>,
    learned: &Arc<DashMap<String, BrokerUrl>>,
    lookups: &mut JoinSet<()>,
    command: Command,
    frame: Frame,
) -> Action {
    // Keep-alive frames are valid in every state.
    match &command {
        Command::Ping => {
            send_command(writer_tx, &Command::Pong).await;
            return Action::Continue;
        }
        Command::Pong => return Action::Continue,
        _ => {}
    }

    // Matching on a clone of the state keeps `conn` free for the arms to
    // transition.
    match (conn.state.clone(), command) {
        (
            ConnectionState::Init,
            Command::Connect {
                protocol_version,
                auth_method,
                auth_data,
                ..
            },
        ) => {
            conn.protocol_version = PROTOCOL_VERSION.min(protocol_version);
            if !service.auth().enabled() {
                conn.state = ConnectionState::Connected;
                send_connected(writer_tx, conn.protocol_version).await;
                return Action::Continue;
            }
            conn.auth_method = auth_method.clone();
            match service
                .auth()
                .authenticate(auth_method.as_deref(), auth_data.as_deref())
                .await
            {
                Ok(crate::auth::AuthOutcome::Granted { principal }) => {
                    tracing::debug!(
                        connection = conn.id,
                        method = conn.auth_method.as_deref().unwrap_or_default(),
                        principal = %principal,
                        "client authenticated"
                    );
                    conn.principal = Some(principal);
                    conn.state = ConnectionState::Connected;
                    send_connected(writer_tx, conn.protocol_version).await;
                    Action::Continue
                }
                Ok(crate::auth::AuthOutcome::Challenge { challenge }) => {
                    let method = auth_method.unwrap_or_default();
                    conn.state = ConnectionState::Connecting {
                        auth_method: method.clone(),
                    };
                    send_command(
                        writer_tx,
                        &Command::AuthChallenge {
                            auth_method: method,
                            challenge,
                        },
                    )
                    .await;
                    Action::Continue
                }
                Err(_) => {
                    send_error(writer_tx, 0, ErrorKind::AuthenticationError, "authentication failed")
                        .await;
                    Action::Close
                }
            }
        }
        (ConnectionState::Connecting { auth_method }, Command::AuthResponse { auth_data, .. }) => {
            let method = auth_method;
            match service
                .auth()
                .authenticate(Some(&method), Some(&auth_data))
                .await
            {
                Ok(crate::auth::AuthOutcome::Granted { principal }) => {
                    conn.principal = Some(principal);
                    conn.state = ConnectionState::Connected;
                    send_connected(writer_tx, conn.protocol_version).await;
                    Action::Continue
                }
                Ok(crate::auth::AuthOutcome::Challenge { challenge }) => {
                    send_command(
                        writer_tx,
                        &Command::AuthChallenge {
                            auth_method: method,
                            challenge,
                        },
                    )
                    .await;
                    Action::Continue
                }
                Err(_) => {
                    send_error(writer_tx, 0, ErrorKind::AuthenticationError, "authentication failed")
                        .await;
                    Action::Close
                }
            }
        }
        // A second Connect in any later state is a protocol violation.
        (_, Command::Connect { .. }) => {
            send_error(writer_tx, 0, ErrorKind::ProtocolError, "connect already received").await;
            Action::Close
        }
        (ConnectionState::Init | ConnectionState::Connecting { .. }, other) => {
            tracing::debug!(
                connection = conn.id,
                command = other.name(),
                "command before session establishment"
            );
            send_error(writer_tx, other.request_id().unwrap_or(0), ErrorKind::ProtocolError,
                "connect required first")
                .await;
            Action::Close
        }
        (
            ConnectionState::Connected | ConnectionState::ProxyLookupRequests,
            command @ (Command::Lookup { .. }
            | Command::PartitionedMetadata { .. }
            | Command::GetSchema { .. }
            | Command::GetOrCreateSchema { .. }),
        ) => {
            conn.state = ConnectionState::ProxyLookupRequests;
            let handler = LookupProxyHandler::new(
                Arc::clone(service),
                conn.id,
                conn.principal.clone(),
                conn.via_tls,
                writer_tx.clone(),
                Arc::clone(learned),
            );
            lookups.spawn(async move { handler.handle(command).await });
            // Reap whatever already finished so the set stays small.
            while lookups.try_join_next().is_some() {}
            Action::Continue
        }
        (
            ConnectionState::Connected | ConnectionState::ProxyLookupRequests,
            Command::CloseProducer { request_id, .. } | Command::CloseConsumer { request_id, .. },
        ) => {
            // Nothing broker-side exists before splice mode; acknowledge
            // locally.
            conn.state = ConnectionState::ProxyLookupRequests;
            send_command(writer_tx, &Command::Success { request_id }).await;
            Action::Continue
        }
        (
            ConnectionState::Connected | ConnectionState::ProxyLookupRequests,
            command,
        ) if command.is_data_plane() => {
            let request_id = command.request_id();
            let Some(topic) = data_plane_topic(&command) else {
                send_error(
                    writer_tx,
                    request_id.unwrap_or(0),
                    ErrorKind::ProtocolError,
                    "no producer or consumer session",
                )
                .await;
                return Action::Close;
            };
            // Prefer the broker this connection already looked the topic up
            // on; fall back to discovery.
            let target = if let Some(url) = learned.get(&topic).map(|entry| entry.clone()) {
                url
            } else {
                let Some(discovery) = service.discovery() else {
                    send_error(
                        writer_tx,
                        request_id.unwrap_or(0),
                        ErrorKind::ServiceNotReady,
                        "broker discovery is not configured",
                    )
                    .await;
                    conn.state = ConnectionState::ProxyLookupRequests;
                    return Action::Continue;
                };
                let parsed: egret_wire::TopicName = match topic.parse() {
                    Ok(parsed) => parsed,
                    Err(_) => {
                        send_error(
                            writer_tx,
                            request_id.unwrap_or(0),
                            ErrorKind::ProtocolError,
                            "invalid topic name",
                        )
                        .await;
                        return Action::Close;
                    }
                };
                match discovery.owning_broker(&parsed).await {
                    Ok(url) => url,
                    Err(err) => {
                        tracing::warn!(connection = conn.id, error = %err, "no broker for topic");
                        send_error(
                            writer_tx,
                            request_id.unwrap_or(0),
                            ErrorKind::ServiceNotReady,
                            "no broker available",
                        )
                        .await;
                        conn.state = ConnectionState::ProxyLookupRequests;
                        return Action::Continue;
                    }
                }
            };
            Action::StartSplice {
                trigger: frame,
                request_id,
                target,
                topic,
            }
        }
        (state, other) => {
            tracing::debug!(
                connection = conn.id,
                state = ?state,
                command = other.name(),
                "unexpected command"
            );
            send_error(
                writer_tx,
                other.request_id().unwrap_or(0),
                ErrorKind::ProtocolError,
                "unexpected command",
            )
            .await;
            Action::Close
        }
    }
}

/// Topic a data-plane command targets, when it names one. `Send`, `Ack` and
/// friends reference sessions that can only exist after a `Producer` or
/// `Subscribe`, so they carry no topic of their own.
fn data_plane_topic(command: &Command) -> Option<String> {
    match command {
        Command::Producer { topic, .. } | Command::Subscribe { topic, .. } => Some(topic.clone()),
        _ => None,
    }
}

/// Establish the backend side of a splice: validate the egress target, open
/// the socket (TLS if the broker URL asks for it), run the handshake, and
/// buffer every client frame that arrives meanwhile.
async fn connect_backend(
    service: &Arc<ProxyService>,
    conn: &mut ProxyConnection,
    frame_rx: &mut mpsc::Receiver<ReaderEvent>,
    shutdown: &mut watch::Receiver<bool>,
    writer_tx: &mpsc::Sender<Frame>,
    mut handler: DirectProxyHandler,
) -> ConnectOutcome {
    // Egress gate first: no socket is opened for a disallowed target.
    let addrs = match service
        .validator()
        .validate(&handler.target.host, handler.target.port)
        .await
    {
        Ok(addrs) => addrs,
        Err(err) => {
            tracing::warn!(
                connection = conn.id,
                target = %handler.target,
                error = %err,
                "egress target rejected"
            );
            return fail_pending(
                writer_tx,
                &mut handler,
                ErrorKind::ServiceNotReady,
                "target broker not allowed",
            )
            .await;
        }
    };

    let target = handler.target.clone();
    let connect_fut = establish_backend(service, conn.principal.clone(), target, addrs);
    tokio::pin!(connect_fut);
    let broker = loop {
        tokio::select! {
            result = &mut connect_fut => match result {
                Ok(broker) => break broker,
                Err(err) => {
                    tracing::warn!(
                        connection = conn.id,
                        target = %handler.target,
                        error = %err,
                        "backend connect failed"
                    );
                    return fail_pending(
                        writer_tx,
                        &mut handler,
                        ErrorKind::ServiceNotReady,
                        "broker unavailable",
                    )
                    .await;
                }
            },
            event = frame_rx.recv() => match event {
                // Client went away: the pending queue is dropped, nothing
                // is replied.
                None | Some(ReaderEvent::Eof) | Some(ReaderEvent::Error(_)) => {
                    return ConnectOutcome::Close;
                }
                Some(ReaderEvent::Frame(_, frame)) => {
                    conn.inbound_ops += 1;
                    conn.inbound_bytes += frame.encoded_len() as u64;
                    metrics::counter!("pulsar_proxy_binary_ops").increment(1);
                    metrics::counter!("pulsar_proxy_binary_bytes")
                        .increment(frame.encoded_len() as u64);
                    if handler.push_pending(frame).is_err() {
                        send_error(writer_tx, 0, ErrorKind::TooManyRequests, "pending queue full")
                            .await;
                        return ConnectOutcome::Close;
                    }
                }
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return ConnectOutcome::Close;
                }
            }
        }
    };
    ConnectOutcome::Proceed { broker, handler }
}

/// Connect to one of the validated addresses and complete the protocol
/// handshake, forwarding the client identity as `original_principal`.
async fn establish_backend(
    service: &Arc<ProxyService>,
    original_principal: Option<String>,
    target: BrokerUrl,
    addrs: Vec<SocketAddr>,
) -> anyhow::Result<ProxyIo> {
    use anyhow::Context;

    let mut last_err: Option<std::io::Error> = None;
    let mut stream = None;
    for addr in addrs {
        match tokio::net::TcpStream::connect(addr).await {
            Ok(socket) => {
                socket.set_nodelay(true).ok();
                stream = Some(socket);
                break;
            }
            Err(err) => last_err = Some(err),
        }
    }
    let socket = match stream {
        Some(socket) => socket,
        None => {
            return Err(last_err
                .map(anyhow::Error::from)
                .unwrap_or_else(|| anyhow::anyhow!("no addresses for {target}")))
            .with_context(|| format!("connect broker {target}"));
        }
    };
    let mut broker: ProxyIo = if target.tls {
        let connector = service.backend_connector()?;
        let name = crate::tls::server_name(&target.host)?;
        Box::new(
            connector
                .connect(name, socket)
                .await
                .context("backend TLS handshake")?,
        )
    } else {
        Box::new(socket)
    };

    let config = service.config();
    let connect = Command::Connect {
        client_version: concat!("egret-proxy/", env!("CARGO_PKG_VERSION")).to_string(),
        protocol_version: PROTOCOL_VERSION,
        auth_method: config
            .broker_client_auth_token
            .as_ref()
            .map(|_| "token".to_string()),
        auth_data: config.broker_client_auth_token.clone(),
        original_principal,
    };
    write_command(&mut broker, &connect)
        .await
        .context("send broker connect")?;
    let deadline = Duration::from_millis(config.lookup_request_timeout_ms);
    let reply = tokio::time::timeout(deadline, read_command(&mut broker, config.max_frame_bytes))
        .await
        .context("broker handshake timed out")?
        .context("read broker connected")?;
    match reply {
        Some((Command::Connected { .. }, _)) => Ok(broker),
        Some((other, _)) => anyhow::bail!("unexpected broker handshake reply: {}", other.name()),
        None => anyhow::bail!("broker closed during handshake"),
    }
}

/// Backend never came up: every buffered frame that carries a request id is
/// answered with an error; if any buffered frame cannot be correlated the
/// connection is closed instead.
async fn fail_pending(
    writer_tx: &mpsc::Sender<Frame>,
    handler: &mut DirectProxyHandler,
    kind: ErrorKind,
    message: &str,
) -> ConnectOutcome {
    let mut must_close = false;
    for frame in handler.take_pending() {
        match Command::decode(&frame) {
            Ok(command) => match command.request_id() {
                Some(request_id) => send_error(writer_tx, request_id, kind, message).await,
                None => must_close = true,
            },
            Err(_) => must_close = true,
        }
    }
    if must_close {
        ConnectOutcome::Close
    } else {
        ConnectOutcome::Retry
    }
}

/// Both sockets are live: recover the raw client stream from the reader and
/// writer tasks, flush the pending queue to the broker in order, and pump
/// opaque bytes until the splice ends.
#[allow(clippy::too_many_arguments)]
async fn run_splice(
    service: &Arc<ProxyService>,
    conn: &mut ProxyConnection,
    mut frame_rx: mpsc::Receiver<ReaderEvent>,
    reader_task: JoinHandle<ReadHalf<ProxyIo>>,
    writer_tx: mpsc::Sender<Frame>,
    writer_task: JoinHandle<WriteHalf<ProxyIo>>,
    mut broker: ProxyIo,
    mut handler: DirectProxyHandler,
) {
    // Stop the reader at the next frame boundary and fold everything it
    // read ahead into the pending queue. Channel order is arrival order. A
    // client stalled in the middle of a frame would park the drain forever;
    // after the deadline the partial frame is dropped with the connection.
    frame_rx.close();
    let drain = Duration::from_millis(service.config().shutdown_drain_timeout_ms.max(1));
    let drained = tokio::time::timeout(drain, async {
        while let Some(event) = frame_rx.recv().await {
            if let ReaderEvent::Frame(_, frame) = event
                && handler.push_pending(frame).is_err()
            {
                return false;
            }
        }
        true
    })
    .await;
    match drained {
        Ok(true) => {}
        Ok(false) => {
            send_error(&writer_tx, 0, ErrorKind::TooManyRequests, "pending queue full").await;
            drop(writer_tx);
            let _ = writer_task.await;
            reader_task.abort();
            let _ = reader_task.await;
            return;
        }
        Err(_) => {
            tracing::debug!(connection = conn.id, "client stalled mid-frame before splice");
            drop(writer_tx);
            let _ = writer_task.await;
            reader_task.abort();
            let _ = reader_task.await;
            return;
        }
    }

    // Recover both halves. The reader exits at its next reserve once the
    // channel is drained; the writer exits once every sender is gone.
    drop(writer_tx);
    let Ok(write_half) = writer_task.await else {
        reader_task.abort();
        let _ = reader_task.await;
        return;
    };
    let read_half = match reader_task.await {
        Ok(read_half) => read_half,
        Err(err) => {
            tracing::debug!(connection = conn.id, error = %err, "reader task failed");
            return;
        }
    };
    let client: ProxyIo = Box::new(read_half.unsplit(write_half));

    // Flush buffered frames in arrival order. Message counts are recorded
    // here, while frames are still decoded.
    for frame in handler.take_pending() {
        if let Some(topic) = &handler.topic
            && let Ok(Command::Send { num_messages, .. }) = Command::decode(&frame)
        {
            service.topic_stats().record_messages(
                topic,
                u64::from(num_messages.max(1)),
                frame.encoded_len() as u64,
            );
        }
        if let Err(err) = write_frame(&mut broker, &frame).await {
            tracing::warn!(connection = conn.id, error = %err, "broker write during flush");
            return;
        }
    }

    conn.state = ConnectionState::ProxyConnectionToEndpoint;
    service.register_splice_rate(conn.id, Arc::clone(&handler.rate));
    if service.config().proxy_zero_copy_mode_enabled {
        tracing::debug!(
            connection = conn.id,
            "zero-copy mode requested but no kernel splice primitive is available; using \
             buffered transfer"
        );
    }
    if service.config().proxy_log_level >= 1 {
        tracing::info!(connection = conn.id, target = %handler.target, "splice established");
    }

    let ctx = SpliceContext {
        rate: Arc::clone(&handler.rate),
        topic_stats: handler
            .topic
            .clone()
            .map(|topic| (service.topic_stats(), topic)),
    };
    // Shutdown must be able to tear down a long-lived splice: dropping the
    // pump future closes both sockets.
    let mut shutdown = service.shutdown_signal();
    let stopped = async {
        loop {
            if shutdown.changed().await.is_err() || *shutdown.borrow() {
                break;
            }
        }
    };
    tokio::select! {
        result = splice(client, broker, ctx) => match result {
            Ok((inbound, outbound)) => {
                if service.config().proxy_log_level >= 1 {
                    tracing::info!(
                        connection = conn.id,
                        to_broker = inbound,
                        to_client = outbound,
                        "splice ended"
                    );
                }
            }
            Err(err) => {
                tracing::info!(connection = conn.id, error = %err, "splice ended with error");
            }
        },
        _ = stopped => {
            tracing::info!(connection = conn.id, "splice closed by shutdown");
        }
    }
}

async fn send_command(writer_tx: &mpsc::Sender<Frame>, command: &Command) {
    match command.encode() {
        Ok(frame) => {
            let _ = writer_tx.send(frame).await;
        }
        Err(err) => tracing::error!(error = %err, "encode command"),
    }
}

async fn send_connected(writer_tx: &mpsc::Sender<Frame>, protocol_version: u32) {
    send_command(
        writer_tx,
        &Command::Connected {
            protocol_version,
            features: vec!["proxy".to_string()],
        },
    )
    .await;
}

async fn send_error(
    writer_tx: &mpsc::Sender<Frame>,
    request_id: u64,
    error: ErrorKind,
    message: &str,
) {
    send_command(
        writer_tx,
        &Command::Error {
            request_id,
            error,
            message: message.to_string(),
        },
    )
    .await;
}
