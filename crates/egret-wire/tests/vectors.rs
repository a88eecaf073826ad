// Golden encoding vectors so accidental wire-format changes fail loudly.
use bytes::Bytes;
use egret_wire::{Command, ErrorKind, Frame, LookupType};

#[test]
fn frame_layout_is_stable() {
    let frame = Frame::new(Bytes::from_static(b"cmd"), Bytes::from_static(b"pay")).expect("frame");
    let encoded = frame.encode();
    // total_size = 4 (command_size field) + 3 + 3 = 10
    assert_eq!(&encoded[0..4], &10u32.to_be_bytes());
    assert_eq!(&encoded[4..8], &3u32.to_be_bytes());
    assert_eq!(&encoded[8..11], b"cmd");
    assert_eq!(&encoded[11..14], b"pay");
    assert_eq!(encoded.len(), 14);
}

#[test]
fn command_tags_are_stable() {
    let frame = Command::Ping.encode().expect("encode");
    assert_eq!(&frame.command[..], br#"{"type":"ping"}"#);

    let frame = Command::Error {
        request_id: 3,
        error: ErrorKind::TooManyRequests,
        message: "busy".to_string(),
    }
    .encode()
    .expect("encode");
    let text = std::str::from_utf8(&frame.command).expect("utf8");
    assert!(text.contains(r#""type":"error""#), "{text}");
    assert!(text.contains(r#""error":"too_many_requests""#), "{text}");
}

#[test]
fn lookup_response_field_names_are_stable() {
    let frame = Command::LookupResponse {
        request_id: 11,
        response: LookupType::Connect,
        broker_service_url: Some("pulsar://proxy:6650".to_string()),
        broker_service_url_tls: None,
        authoritative: true,
        proxy_through_service_url: true,
    }
    .encode()
    .expect("encode");
    let text = std::str::from_utf8(&frame.command).expect("utf8");
    for needle in [
        r#""type":"lookup_response""#,
        r#""response":"connect""#,
        r#""proxy_through_service_url":true"#,
        r#""broker_service_url":"pulsar://proxy:6650""#,
    ] {
        assert!(text.contains(needle), "missing {needle} in {text}");
    }
}

#[test]
fn decoding_tolerates_unknown_fields() {
    // Older proxies must be able to read frames from newer peers.
    let frame = Frame::new(
        Bytes::from_static(br#"{"type":"ping","future_field":42}"#),
        Bytes::new(),
    )
    .expect("frame");
    let command = Command::decode(&frame).expect("decode");
    assert_eq!(command, Command::Ping);
}
