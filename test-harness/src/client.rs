// Minimal binary-protocol client for driving the proxy in tests.
use anyhow::{Context, Result, bail};
use std::net::SocketAddr;
use tokio::net::TcpStream;

use egret_wire::{
    Command, DEFAULT_MAX_FRAME_BYTES, Frame, PROTOCOL_VERSION, read_command, write_command,
    write_frame,
};

#[derive(Debug)]
pub struct TestClient {
    stream: TcpStream,
}

impl TestClient {
    /// Open a raw TCP connection without any handshake.
    pub async fn open(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await.context("connect proxy")?;
        Ok(Self { stream })
    }

    /// Connect and complete the session handshake, optionally with token
    /// credentials.
    pub async fn connect(addr: SocketAddr, token: Option<&str>) -> Result<Self> {
        let mut client = Self::open(addr).await?;
        client
            .send(&Command::Connect {
                client_version: "test-harness/0".to_string(),
                protocol_version: PROTOCOL_VERSION,
                auth_method: token.map(|_| "token".to_string()),
                auth_data: token.map(str::to_string),
                original_principal: None,
            })
            .await?;
        match client.recv().await? {
            Some(Command::Connected { .. }) => Ok(client),
            other => bail!("expected connected, got {other:?}"),
        }
    }

    pub async fn send(&mut self, command: &Command) -> Result<()> {
        write_command(&mut self.stream, command)
            .await
            .context("send command")
    }

    pub async fn send_frame(&mut self, frame: &Frame) -> Result<()> {
        write_frame(&mut self.stream, frame)
            .await
            .context("send frame")
    }

    /// Next command, skipping keep-alive pings from the proxy.
    pub async fn recv(&mut self) -> Result<Option<Command>> {
        loop {
            match read_command(&mut self.stream, DEFAULT_MAX_FRAME_BYTES).await? {
                Some((Command::Ping, _)) => {
                    self.send(&Command::Pong).await?;
                }
                Some((command, _)) => return Ok(Some(command)),
                None => return Ok(None),
            }
        }
    }

    pub async fn lookup(&mut self, request_id: u64, topic: &str) -> Result<Command> {
        self.send(&Command::Lookup {
            request_id,
            topic: topic.to_string(),
            authoritative: false,
        })
        .await?;
        self.recv()
            .await?
            .context("connection closed awaiting lookup reply")
    }

    /// Give the raw stream to tests that need byte-level control (splice
    /// scenarios).
    pub fn into_inner(self) -> TcpStream {
        self.stream
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }
}
