use std::collections::HashSet;

use exthost_bridge::rpc::{RpcMessage, RpcValue};
use exthost_bridge::services::{Direction, GuestService, MainService, ServiceAddress};
use exthost_bridge::{AppError, RemoteError, RemoteErrorKind};

#[test]
fn wire_names_are_unique_across_both_catalogs() {
    let names: Vec<&str> = MainService::ALL
        .iter()
        .map(|s| s.name())
        .chain(GuestService::ALL.iter().map(|s| s.name()))
        .collect();
    let unique: HashSet<&str> = names.iter().copied().collect();
    assert_eq!(names.len(), unique.len());
}

#[test]
fn addresses_carry_their_direction() {
    for service in MainService::ALL {
        assert_eq!(service.address().direction(), Direction::Main);
        assert!(service.name().starts_with("MainThread"));
    }
    for service in GuestService::ALL {
        assert_eq!(service.address().direction(), Direction::Guest);
        assert!(service.name().starts_with("ExtHost"));
    }
}

#[test]
fn lookup_resolves_wire_names() {
    let addr = ServiceAddress::lookup("ExtHostCommands").expect("known service");
    assert_eq!(addr, GuestService::Commands.address());
    assert_eq!(addr.to_string(), "guest/ExtHostCommands");
    assert!(ServiceAddress::lookup("MainThreadTerminal").is_none());
}

#[test]
fn catalog_lists_one_side() {
    assert_eq!(ServiceAddress::catalog(Direction::Main).len(), MainService::ALL.len());
    assert_eq!(
        ServiceAddress::catalog(Direction::Guest),
        GuestService::ALL
            .iter()
            .map(|s| ServiceAddress::from(*s))
            .collect::<Vec<_>>()
    );
}

#[test]
fn request_envelope_shape() {
    let message = RpcMessage::Request {
        id: 7,
        service: "ExtHostExtensionService".into(),
        method: "$activateById".into(),
        args: vec!["demo.ext".into(), RpcValue::Null],
    };
    let json: serde_json::Value =
        serde_json::from_slice(&message.encode().expect("encodes")).expect("json");

    assert_eq!(json["type"], "request");
    assert_eq!(json["id"], 7);
    assert_eq!(json["args"][0]["$t"], "string");
    assert_eq!(json["args"][0]["v"], "demo.ext");
    assert_eq!(json["args"][1]["$t"], "null");
}

#[test]
fn error_reply_carries_structured_error() {
    let raw = br#"{"type":"reply_err","id":3,"error":{"kind":"unknown_method","message":"nope"}}"#;
    let message = RpcMessage::decode(raw).expect("decodes");
    assert_eq!(message.id(), 3);
    assert_eq!(
        message,
        RpcMessage::ReplyErr {
            id: 3,
            error: RemoteError::new(RemoteErrorKind::UnknownMethod, "nope"),
        }
    );
}

#[test]
fn malformed_envelope_is_a_protocol_error() {
    let err = RpcMessage::decode(b"{\"type\":\"shout\"}").expect_err("unknown type");
    assert!(matches!(err, AppError::Protocol(_)));
}

#[test]
fn remote_error_display() {
    let err = AppError::from(RemoteError::handler("boom"));
    assert_eq!(err.to_string(), "remote: handler failure: boom");
    assert!(!err.is_connection_closed());
    assert!(AppError::ConnectionClosed("gone".into()).is_connection_closed());
}
