// In-process broker stand-in speaking just enough of the wire protocol for
// proxy tests: handshake, lookup-class replies, then raw echo once a
// data-plane command arrives (mirroring a connection that entered splice
// mode on the real broker).
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use egret_wire::{
    Command, DEFAULT_MAX_FRAME_BYTES, ErrorKind, LookupType, PROTOCOL_VERSION, read_command,
    write_command,
};

/// How the stub answers `Lookup` requests.
#[derive(Debug, Clone)]
pub enum LookupBehavior {
    /// Reply `Connect` with the given broker URL.
    Respond {
        broker_service_url: String,
        authoritative: bool,
    },
    /// Reply `Connect` pointing at this stub's own address, so splices land
    /// back on the stub.
    RespondSelf { authoritative: bool },
    /// Accept the request and never reply (the client's permit stays held).
    NeverReply,
    /// Reply with a `MetadataError`.
    Fail,
}

pub struct StubBroker {
    addr: SocketAddr,
    accept_task: JoinHandle<()>,
    seen: Arc<Mutex<Vec<Command>>>,
}

impl StubBroker {
    pub async fn start(behavior: LookupBehavior) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("bind stub broker")?;
        let addr = listener.local_addr().context("stub broker addr")?;
        let seen: Arc<Mutex<Vec<Command>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_for_accept = Arc::clone(&seen);
        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    break;
                };
                let behavior = behavior.clone();
                let seen = Arc::clone(&seen_for_accept);
                tokio::spawn(async move {
                    if let Err(err) = serve(socket, behavior, seen).await {
                        tracing::debug!(error = %err, "stub broker connection ended");
                    }
                });
            }
        });
        Ok(Self {
            addr,
            accept_task,
            seen,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn service_url(&self) -> String {
        format!("pulsar://127.0.0.1:{}", self.addr.port())
    }

    /// Every command received across all connections, in arrival order.
    pub fn seen(&self) -> Vec<Command> {
        self.seen.lock().expect("seen lock").clone()
    }

    /// `original_principal` values carried on `Connect` frames.
    pub fn seen_original_principals(&self) -> Vec<Option<String>> {
        self.seen()
            .into_iter()
            .filter_map(|command| match command {
                Command::Connect {
                    original_principal, ..
                } => Some(original_principal),
                _ => None,
            })
            .collect()
    }
}

impl Drop for StubBroker {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn serve(
    mut socket: TcpStream,
    behavior: LookupBehavior,
    seen: Arc<Mutex<Vec<Command>>>,
) -> Result<()> {
    // Handshake: every proxy-side connection starts with Connect.
    match read_command(&mut socket, DEFAULT_MAX_FRAME_BYTES).await? {
        Some((command @ Command::Connect { .. }, _)) => {
            seen.lock().expect("seen lock").push(command);
            write_command(
                &mut socket,
                &Command::Connected {
                    protocol_version: PROTOCOL_VERSION,
                    features: Vec::new(),
                },
            )
            .await?;
        }
        other => anyhow::bail!("expected connect, got {other:?}"),
    }

    loop {
        let Some((command, _frame)) = read_command(&mut socket, DEFAULT_MAX_FRAME_BYTES).await?
        else {
            return Ok(());
        };
        seen.lock().expect("seen lock").push(command.clone());
        match command {
            Command::Lookup { request_id, .. } => match &behavior {
                LookupBehavior::Respond {
                    broker_service_url,
                    authoritative,
                } => {
                    write_command(
                        &mut socket,
                        &Command::LookupResponse {
                            request_id,
                            response: LookupType::Connect,
                            broker_service_url: Some(broker_service_url.clone()),
                            broker_service_url_tls: None,
                            authoritative: *authoritative,
                            proxy_through_service_url: false,
                        },
                    )
                    .await?;
                }
                LookupBehavior::RespondSelf { authoritative } => {
                    let own = socket.local_addr().context("stub local addr")?;
                    write_command(
                        &mut socket,
                        &Command::LookupResponse {
                            request_id,
                            response: LookupType::Connect,
                            broker_service_url: Some(format!(
                                "pulsar://127.0.0.1:{}",
                                own.port()
                            )),
                            broker_service_url_tls: None,
                            authoritative: *authoritative,
                            proxy_through_service_url: false,
                        },
                    )
                    .await?;
                }
                LookupBehavior::NeverReply => {
                    // Keep the connection open and say nothing.
                    std::future::pending::<()>().await;
                }
                LookupBehavior::Fail => {
                    write_command(
                        &mut socket,
                        &Command::Error {
                            request_id,
                            error: ErrorKind::MetadataError,
                            message: "stubbed failure".to_string(),
                        },
                    )
                    .await?;
                }
            },
            Command::PartitionedMetadata { request_id, .. } => {
                write_command(
                    &mut socket,
                    &Command::PartitionedMetadataResponse {
                        request_id,
                        partitions: 4,
                    },
                )
                .await?;
            }
            Command::GetSchema { request_id, .. } => {
                write_command(
                    &mut socket,
                    &Command::GetSchemaResponse {
                        request_id,
                        schema: None,
                        schema_version: 0,
                    },
                )
                .await?;
            }
            Command::GetOrCreateSchema { request_id, .. } => {
                write_command(
                    &mut socket,
                    &Command::GetOrCreateSchemaResponse {
                        request_id,
                        schema_version: 1,
                    },
                )
                .await?;
            }
            Command::Ping => write_command(&mut socket, &Command::Pong).await?,
            command if command.is_data_plane() => {
                if let Some(request_id) = command.request_id() {
                    write_command(&mut socket, &Command::Success { request_id }).await?;
                }
                // From here the peer is splicing: echo raw bytes back.
                return echo(socket).await;
            }
            other => {
                tracing::debug!(command = other.name(), "stub broker ignoring command");
            }
        }
    }
}

async fn echo(mut socket: TcpStream) -> Result<()> {
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        let n = socket.read(&mut buf).await?;
        if n == 0 {
            socket.shutdown().await.ok();
            return Ok(());
        }
        socket.write_all(&buf[..n]).await?;
    }
}
