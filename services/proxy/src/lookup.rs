// Lookup path: control-plane requests the proxy answers on the client's
// behalf. Every request holds one lookup-semaphore permit across the broker
// RPC; replies are rewritten so clients keep connecting through the proxy.
use anyhow::{Context, Result, bail};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use egret_wire::{
    BrokerUrl, Command, ErrorKind, Frame, PROTOCOL_VERSION, TopicName, read_command,
    write_command,
};

use crate::direct::ProxyIo;
use crate::service::{ProxyService, ServiceUrls};
use crate::tls::server_name;

pub struct LookupProxyHandler {
    service: Arc<ProxyService>,
    connection_id: u64,
    principal: Option<String>,
    // Whether the client arrived over the TLS listener; rewritten URLs
    // point at the matching listener.
    client_tls: bool,
    writer: mpsc::Sender<Frame>,
    // Topic -> broker targets learned from successful lookups on this
    // connection; the splice path prefers these over fresh discovery.
    learned: Arc<DashMap<String, BrokerUrl>>,
}

impl LookupProxyHandler {
    pub fn new(
        service: Arc<ProxyService>,
        connection_id: u64,
        principal: Option<String>,
        client_tls: bool,
        writer: mpsc::Sender<Frame>,
        learned: Arc<DashMap<String, BrokerUrl>>,
    ) -> Self {
        Self {
            service,
            connection_id,
            principal,
            client_tls,
            writer,
            learned,
        }
    }

    /// Serve one lookup-class command end to end. Runs as its own task so a
    /// slow broker never blocks the connection's read loop.
    pub async fn handle(&self, command: Command) {
        let Some(request_id) = command.request_id() else {
            return;
        };
        // Permit first: the semaphore bounds everything that follows,
        // including the authorization call.
        let permit = match Arc::clone(self.service.lookup_permits()).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                self.reply_error(request_id, ErrorKind::TooManyRequests, "too many lookups")
                    .await;
                return;
            }
        };

        let topic = lookup_topic(&command);
        if let Some(topic) = &topic {
            match topic.parse::<TopicName>() {
                Ok(parsed) => {
                    if !self.authorized(&parsed).await {
                        self.reply_error(
                            request_id,
                            ErrorKind::AuthorizationError,
                            "not authorized for topic",
                        )
                        .await;
                        return;
                    }
                }
                Err(_) => {
                    self.reply_error(request_id, ErrorKind::MetadataError, "invalid topic name")
                        .await;
                    return;
                }
            }
        }

        let Some(discovery) = self.service.discovery() else {
            self.reply_error(
                request_id,
                ErrorKind::ServiceNotReady,
                "broker discovery is not configured",
            )
            .await;
            return;
        };
        // Lookups go to the (probable) owner; metadata and schema requests
        // go wherever load is lowest.
        let target = match &command {
            Command::Lookup { topic, .. } => match topic.parse::<TopicName>() {
                Ok(parsed) => discovery.owning_broker(&parsed).await,
                Err(_) => {
                    self.reply_error(request_id, ErrorKind::MetadataError, "invalid topic name")
                        .await;
                    return;
                }
            },
            _ => discovery.least_loaded_broker().await,
        };
        let target = match target {
            Ok(target) => target,
            Err(err) => {
                tracing::warn!(
                    connection = self.connection_id,
                    error = %err,
                    "broker discovery failed"
                );
                self.reply_error(request_id, ErrorKind::ServiceNotReady, "no broker available")
                    .await;
                return;
            }
        };

        let timeout = Duration::from_millis(self.service.config().lookup_request_timeout_ms);
        let rpc = broker_rpc(
            &self.service,
            &target,
            self.principal.clone(),
            command.clone(),
        );
        let reply = match tokio::time::timeout(timeout, rpc).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(err)) => {
                tracing::warn!(
                    connection = self.connection_id,
                    broker = %target,
                    error = %err,
                    "lookup rpc failed"
                );
                self.reply_error(request_id, ErrorKind::ServiceNotReady, "broker unavailable")
                    .await;
                return;
            }
            Err(_) => {
                self.reply_error(request_id, ErrorKind::MetadataError, "lookup timed out")
                    .await;
                return;
            }
        };

        // Remember where the broker sent us: the first data-plane command
        // for this topic splices to the learned target, not back through
        // discovery.
        if let (Some(topic), Command::LookupResponse {
            broker_service_url: Some(url),
            ..
        }) = (&topic, &reply)
            && let Ok(url) = url.parse::<BrokerUrl>()
        {
            self.learned.insert(topic.clone(), url);
        }

        let rewritten =
            rewrite_lookup_reply(reply, &self.service.service_urls(), self.client_tls);
        self.reply(rewritten).await;
        drop(permit);
    }

    async fn authorized(&self, topic: &TopicName) -> bool {
        let Some(authz) = self.service.authorization() else {
            return true;
        };
        let principal = self.principal.as_deref().unwrap_or_default();
        match authz.can_lookup(principal, topic).await {
            Ok(allowed) => allowed,
            Err(err) => {
                tracing::warn!(
                    connection = self.connection_id,
                    error = %err,
                    "authorization provider failed; denying"
                );
                false
            }
        }
    }

    async fn reply(&self, command: Command) {
        match command.encode() {
            Ok(frame) => {
                let _ = self.writer.send(frame).await;
            }
            Err(err) => {
                tracing::error!(connection = self.connection_id, error = %err, "encode reply");
            }
        }
    }

    async fn reply_error(&self, request_id: u64, error: ErrorKind, message: &str) {
        self.reply(Command::Error {
            request_id,
            error,
            message: message.to_string(),
        })
        .await;
    }
}

/// Topic string of a lookup-class command, if it names one.
fn lookup_topic(command: &Command) -> Option<String> {
    match command {
        Command::Lookup { topic, .. }
        | Command::PartitionedMetadata { topic, .. }
        | Command::GetSchema { topic, .. }
        | Command::GetOrCreateSchema { topic, .. } => Some(topic.clone()),
        _ => None,
    }
}

/// Point lookup replies back at the proxy so every subsequent connect, even
/// a redirect, loops through it.
pub(crate) fn rewrite_lookup_reply(
    reply: Command,
    urls: &ServiceUrls,
    client_tls: bool,
) -> Command {
    match reply {
        Command::LookupResponse {
            request_id,
            response,
            authoritative,
            ..
        } => {
            let prefer_tls = client_tls && urls.service_url_tls.is_some();
            let plain = if prefer_tls {
                None
            } else {
                urls.service_url.clone()
            };
            let tls = urls.service_url_tls.clone();
            Command::LookupResponse {
                request_id,
                response,
                broker_service_url: plain,
                broker_service_url_tls: tls,
                authoritative,
                proxy_through_service_url: true,
            }
        }
        other => other,
    }
}

/// Open a connection to `target` and resolve it to a ready byte stream
/// (TLS already negotiated when the URL asks for it).
pub(crate) async fn open_broker_stream(
    service: &Arc<ProxyService>,
    target: &BrokerUrl,
) -> Result<ProxyIo> {
    let addrs = service
        .resolver()
        .resolve(&target.host)
        .await
        .with_context(|| format!("resolve broker {}", target.host))?;
    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect((addr, target.port)).await {
            Ok(stream) => {
                stream.set_nodelay(true).ok();
                if target.tls {
                    let connector = service.backend_connector()?;
                    let name = server_name(&target.host)?;
                    let stream = connector
                        .connect(name, stream)
                        .await
                        .context("backend TLS handshake")?;
                    return Ok(Box::new(stream));
                }
                return Ok(Box::new(stream));
            }
            Err(err) => last_err = Some(err),
        }
    }
    match last_err {
        Some(err) => Err(err).with_context(|| format!("connect broker {target}")),
        None => bail!("no addresses for broker {target}"),
    }
}

/// One short-lived request/reply exchange with a broker, authenticated with
/// the proxy's own credential and carrying the client's identity as
/// `original_principal`.
pub(crate) async fn broker_rpc(
    service: &Arc<ProxyService>,
    target: &BrokerUrl,
    original_principal: Option<String>,
    command: Command,
) -> Result<Command> {
    let mut stream = open_broker_stream(service, target).await?;
    let config = service.config();
    let connect = Command::Connect {
        client_version: concat!("egret-proxy/", env!("CARGO_PKG_VERSION")).to_string(),
        protocol_version: PROTOCOL_VERSION,
        auth_method: config.broker_client_auth_token.as_ref().map(|_| "token".to_string()),
        auth_data: config.broker_client_auth_token.clone(),
        original_principal,
    };
    write_command(&mut stream, &connect)
        .await
        .context("send broker connect")?;
    match read_command(&mut stream, config.max_frame_bytes)
        .await
        .context("read broker connected")?
    {
        Some((Command::Connected { .. }, _)) => {}
        Some((other, _)) => bail!("unexpected broker handshake reply: {}", other.name()),
        None => bail!("broker closed during handshake"),
    }
    write_command(&mut stream, &command)
        .await
        .context("forward lookup request")?;
    match read_command(&mut stream, config.max_frame_bytes)
        .await
        .context("read lookup reply")?
    {
        Some((reply, _)) => Ok(reply),
        None => bail!("broker closed before replying"),
    }
}
