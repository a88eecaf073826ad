// Tagged command union carried in the command section of every frame.
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{Error, Frame, Result};

/// Highest protocol version this library speaks. `Connected` echoes the
/// minimum of this and the client's advertised version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Failure kinds carried on error replies. Every failed request is answered
/// with one of these plus the originating request id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ProtocolError,
    AuthenticationError,
    AuthorizationError,
    TooManyRequests,
    ServiceNotReady,
    MetadataError,
    UnknownError,
}

/// Outcome class of a lookup reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupType {
    Connect,
    Redirect,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaData {
    pub schema_type: String,
    pub data: String,
}

/// The command union. Control-plane commands are handled by the proxy
/// itself; the first data-plane command switches the connection into splice
/// mode (see `Command::is_data_plane`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    // Session establishment.
    Connect {
        client_version: String,
        protocol_version: u32,
        auth_method: Option<String>,
        auth_data: Option<String>,
        /// Identity a proxy forwards on behalf of its client.
        original_principal: Option<String>,
    },
    Connected {
        protocol_version: u32,
        #[serde(default)]
        features: Vec<String>,
    },
    AuthChallenge {
        auth_method: String,
        challenge: String,
    },
    AuthResponse {
        auth_method: String,
        auth_data: String,
    },
    Ping,
    Pong,

    // Control plane.
    Lookup {
        request_id: u64,
        topic: String,
        authoritative: bool,
    },
    LookupResponse {
        request_id: u64,
        response: LookupType,
        broker_service_url: Option<String>,
        broker_service_url_tls: Option<String>,
        authoritative: bool,
        proxy_through_service_url: bool,
    },
    PartitionedMetadata {
        request_id: u64,
        topic: String,
    },
    PartitionedMetadataResponse {
        request_id: u64,
        partitions: u32,
    },
    GetSchema {
        request_id: u64,
        topic: String,
        schema_version: Option<u64>,
    },
    GetSchemaResponse {
        request_id: u64,
        schema: Option<SchemaData>,
        schema_version: u64,
    },
    GetOrCreateSchema {
        request_id: u64,
        topic: String,
        schema: SchemaData,
    },
    GetOrCreateSchemaResponse {
        request_id: u64,
        schema_version: u64,
    },
    CloseProducer {
        request_id: u64,
        producer_id: u64,
    },
    CloseConsumer {
        request_id: u64,
        consumer_id: u64,
    },
    Success {
        request_id: u64,
    },
    Error {
        request_id: u64,
        error: ErrorKind,
        message: String,
    },

    // Data plane. The proxy never interprets these beyond extracting the
    // target topic; they are forwarded to the owning broker.
    Producer {
        request_id: u64,
        producer_id: u64,
        topic: String,
        producer_name: Option<String>,
    },
    Subscribe {
        request_id: u64,
        consumer_id: u64,
        topic: String,
        subscription: String,
    },
    Send {
        producer_id: u64,
        sequence_id: u64,
        num_messages: u32,
    },
    Ack {
        consumer_id: u64,
        message_id: u64,
    },
    Flow {
        consumer_id: u64,
        message_permits: u32,
    },
    Unsubscribe {
        request_id: u64,
        consumer_id: u64,
    },
    Seek {
        request_id: u64,
        consumer_id: u64,
        message_id: u64,
    },
    RedeliverUnacknowledgedMessages {
        consumer_id: u64,
    },
    GetLastMessageId {
        request_id: u64,
        consumer_id: u64,
    },
    ActiveConsumerChange {
        consumer_id: u64,
        is_active: bool,
    },
    ReachedEndOfTopic {
        consumer_id: u64,
    },
}

impl Command {
    pub fn encode(&self) -> Result<Frame> {
        self.encode_with_payload(Bytes::new())
    }

    pub fn encode_with_payload(&self, payload: Bytes) -> Result<Frame> {
        let command =
            serde_json::to_vec(self).map_err(|err| Error::Encode(err.to_string()))?;
        Frame::new(Bytes::from(command), payload)
    }

    pub fn decode(frame: &Frame) -> Result<Self> {
        serde_json::from_slice(&frame.command).map_err(|err| Error::Decode(err.to_string()))
    }

    /// True for commands that switch a connection into splice mode.
    pub fn is_data_plane(&self) -> bool {
        matches!(
            self,
            Command::Producer { .. }
                | Command::Subscribe { .. }
                | Command::Send { .. }
                | Command::Ack { .. }
                | Command::Flow { .. }
                | Command::Unsubscribe { .. }
                | Command::Seek { .. }
                | Command::RedeliverUnacknowledgedMessages { .. }
                | Command::GetLastMessageId { .. }
                | Command::ActiveConsumerChange { .. }
                | Command::ReachedEndOfTopic { .. }
        )
    }

    /// Request id for correlating replies, when the command carries one.
    pub fn request_id(&self) -> Option<u64> {
        match self {
            Command::Lookup { request_id, .. }
            | Command::LookupResponse { request_id, .. }
            | Command::PartitionedMetadata { request_id, .. }
            | Command::PartitionedMetadataResponse { request_id, .. }
            | Command::GetSchema { request_id, .. }
            | Command::GetSchemaResponse { request_id, .. }
            | Command::GetOrCreateSchema { request_id, .. }
            | Command::GetOrCreateSchemaResponse { request_id, .. }
            | Command::CloseProducer { request_id, .. }
            | Command::CloseConsumer { request_id, .. }
            | Command::Success { request_id }
            | Command::Error { request_id, .. }
            | Command::Producer { request_id, .. }
            | Command::Subscribe { request_id, .. }
            | Command::Unsubscribe { request_id, .. }
            | Command::Seek { request_id, .. }
            | Command::GetLastMessageId { request_id, .. } => Some(*request_id),
            _ => None,
        }
    }

    /// Short command name for logging and per-frame trace output.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Connect { .. } => "connect",
            Command::Connected { .. } => "connected",
            Command::AuthChallenge { .. } => "auth_challenge",
            Command::AuthResponse { .. } => "auth_response",
            Command::Ping => "ping",
            Command::Pong => "pong",
            Command::Lookup { .. } => "lookup",
            Command::LookupResponse { .. } => "lookup_response",
            Command::PartitionedMetadata { .. } => "partitioned_metadata",
            Command::PartitionedMetadataResponse { .. } => "partitioned_metadata_response",
            Command::GetSchema { .. } => "get_schema",
            Command::GetSchemaResponse { .. } => "get_schema_response",
            Command::GetOrCreateSchema { .. } => "get_or_create_schema",
            Command::GetOrCreateSchemaResponse { .. } => "get_or_create_schema_response",
            Command::CloseProducer { .. } => "close_producer",
            Command::CloseConsumer { .. } => "close_consumer",
            Command::Success { .. } => "success",
            Command::Error { .. } => "error",
            Command::Producer { .. } => "producer",
            Command::Subscribe { .. } => "subscribe",
            Command::Send { .. } => "send",
            Command::Ack { .. } => "ack",
            Command::Flow { .. } => "flow",
            Command::Unsubscribe { .. } => "unsubscribe",
            Command::Seek { .. } => "seek",
            Command::RedeliverUnacknowledgedMessages { .. } => "redeliver_unacked",
            Command::GetLastMessageId { .. } => "get_last_message_id",
            Command::ActiveConsumerChange { .. } => "active_consumer_change",
            Command::ReachedEndOfTopic { .. } => "reached_end_of_topic",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_round_trip() {
        let command = Command::Lookup {
            request_id: 7,
            topic: "persistent://t/n/orders".to_string(),
            authoritative: false,
        };
        let frame = command.encode().expect("encode");
        let decoded = Command::decode(&frame).expect("decode");
        assert_eq!(decoded, command);
        assert_eq!(decoded.request_id(), Some(7));
    }

    #[test]
    fn send_carries_payload_untouched() {
        let command = Command::Send {
            producer_id: 1,
            sequence_id: 9,
            num_messages: 1,
        };
        let frame = command
            .encode_with_payload(Bytes::from_static(b"message-body"))
            .expect("encode");
        assert_eq!(frame.payload, Bytes::from_static(b"message-body"));
        let decoded = Command::decode(&frame).expect("decode");
        assert!(decoded.is_data_plane());
        assert_eq!(decoded.request_id(), None);
    }

    #[test]
    fn control_plane_commands_are_not_data_plane() {
        for command in [
            Command::Ping,
            Command::Pong,
            Command::Lookup {
                request_id: 1,
                topic: "persistent://a/b/c".to_string(),
                authoritative: true,
            },
            Command::GetSchema {
                request_id: 2,
                topic: "persistent://a/b/c".to_string(),
                schema_version: None,
            },
        ] {
            assert!(!command.is_data_plane(), "{}", command.name());
        }
    }

    #[test]
    fn decode_rejects_unknown_type() {
        let frame = Frame::new(
            Bytes::from_static(b"{\"type\":\"warp_drive\"}"),
            Bytes::new(),
        )
        .expect("frame");
        let err = Command::decode(&frame).expect_err("unknown");
        assert!(matches!(err, Error::Decode(_)));
    }
}
