//! Wire protocol unit tests: round-trips, server fixtures, and tolerance
//! for unknown message types.

use std::collections::BTreeMap;

use serde_json::json;

use dnscheck::protocol::{
    ClientRequest, ConsensusMap, DnsErrorInfo, DnsErrorKind, Provider, ProviderList,
    ProviderResult, RecordType, ServerMessage, TransportMode,
};

fn sample_provider() -> Provider {
    Provider {
        id: "cloudflare".into(),
        name: "Cloudflare".into(),
        nameservers: vec!["1.1.1.1".into(), "1.0.0.1".into()],
    }
}

fn sample_result() -> ProviderResult {
    ProviderResult {
        provider: sample_provider(),
        records: BTreeMap::from([
            (RecordType::A, vec!["93.184.216.34".to_owned()]),
            (RecordType::Aaaa, Vec::new()),
        ]),
        errors: BTreeMap::from([
            (RecordType::A, None),
            (
                RecordType::Aaaa,
                Some(DnsErrorInfo {
                    kind: DnsErrorKind::NoAnswer,
                    message: "No answer for this record type.".into(),
                }),
            ),
        ]),
        latency_ms: 64,
    }
}

fn round_trip_server(message: &ServerMessage) {
    let encoded = serde_json::to_string(message).unwrap();
    let decoded: ServerMessage = serde_json::from_str(&encoded).unwrap();
    assert_eq!(&decoded, message, "lossy round trip via {encoded}");
}

// ── Round trips ───────────────────────────────────────────────────────────────

#[test]
fn every_server_message_shape_round_trips() {
    round_trip_server(&ServerMessage::ProviderLists {
        lists: BTreeMap::from([(
            "global".to_owned(),
            ProviderList {
                id: "global".into(),
                label: "Global Anycast Providers".into(),
                description: "Popular public DNS resolvers.".into(),
                providers: vec![sample_provider()],
            },
        )]),
    });
    round_trip_server(&ServerMessage::RunStarted {
        providers: vec!["google".into(), "cloudflare".into()],
        domain: Some("example.com".into()),
        list_id: Some("global".into()),
        transport: Some(TransportMode::Auto),
    });
    round_trip_server(&ServerMessage::ProviderResult {
        result: sample_result(),
        consensus: ConsensusMap::from([(
            RecordType::A,
            vec!["93.184.216.34".to_owned()],
        )]),
    });
    round_trip_server(&ServerMessage::RunComplete {
        consensus: ConsensusMap::from([(RecordType::A, vec!["93.184.216.34".to_owned()])]),
        domain: Some("example.com".into()),
        list_id: Some("global".into()),
        providers: BTreeMap::from([("cloudflare".to_owned(), sample_result())]),
        transport: Some(TransportMode::Udp),
    });
    round_trip_server(&ServerMessage::Error {
        message: "Domain name looks invalid. Please try again.".into(),
    });
}

#[test]
fn every_client_request_shape_round_trips() {
    for request in [
        ClientRequest::Check {
            domain: "example.com".into(),
            list_id: Some("privacy".into()),
            transport: Some(TransportMode::Tcp),
        },
        ClientRequest::Check {
            domain: "example.com".into(),
            list_id: None,
            transport: None,
        },
        ClientRequest::Lists,
    ] {
        let encoded = serde_json::to_string(&request).unwrap();
        let decoded: ClientRequest = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, request);
    }
}

// ── Exact wire shapes ─────────────────────────────────────────────────────────

#[test]
fn check_request_omits_absent_options() {
    let request = ClientRequest::Check {
        domain: "example.com".into(),
        list_id: None,
        transport: None,
    };
    assert_eq!(
        serde_json::to_value(&request).unwrap(),
        json!({"action": "check", "domain": "example.com"})
    );

    let request = ClientRequest::Check {
        domain: "example.com".into(),
        list_id: Some("global".into()),
        transport: Some(TransportMode::Auto),
    };
    assert_eq!(
        serde_json::to_value(&request).unwrap(),
        json!({
            "action": "check",
            "domain": "example.com",
            "list_id": "global",
            "transport": "auto",
        })
    );
}

#[test]
fn lists_request_matches_wire_shape() {
    assert_eq!(
        serde_json::to_value(ClientRequest::Lists).unwrap(),
        json!({"action": "lists"})
    );
}

#[test]
fn record_types_serialize_as_map_keys() {
    let consensus = ConsensusMap::from([
        (RecordType::A, vec!["1.2.3.4".to_owned()]),
        (RecordType::Aaaa, vec!["2606:2800::1".to_owned()]),
    ]);
    assert_eq!(
        serde_json::to_value(&consensus).unwrap(),
        json!({"A": ["1.2.3.4"], "AAAA": ["2606:2800::1"]})
    );
}

// ── Server fixtures ───────────────────────────────────────────────────────────

/// A `provider_result` exactly as the server emits it, including `null`
/// entries for record types that succeeded.
#[test]
fn parses_provider_result_fixture_with_null_errors() {
    let raw = r#"{
        "type": "provider_result",
        "result": {
            "records": {"A": ["93.184.216.34"], "AAAA": []},
            "errors": {"A": null, "AAAA": {"type": "no_answer", "message": "No answer for this record type."}},
            "latency_ms": 87,
            "provider": {"id": "quad9", "name": "Quad9", "nameservers": ["9.9.9.9"]}
        },
        "consensus": {"A": ["93.184.216.34"]}
    }"#;

    let message: ServerMessage = serde_json::from_str(raw).unwrap();
    let ServerMessage::ProviderResult { result, consensus } = message else {
        panic!("expected provider_result, got {message:?}");
    };
    assert_eq!(result.provider.id, "quad9");
    assert_eq!(result.records_for(RecordType::A), ["93.184.216.34"]);
    assert!(result.error_for(RecordType::A).is_none(), "null means no error");
    assert_eq!(
        result.error_for(RecordType::Aaaa).map(|e| e.kind),
        Some(DnsErrorKind::NoAnswer)
    );
    assert_eq!(consensus[&RecordType::A], vec!["93.184.216.34".to_owned()]);
}

/// `run_started` carries echo fields this client tolerates but does not
/// require.
#[test]
fn parses_run_started_fixture_and_minimal_form() {
    let full = r#"{
        "type": "run_started",
        "domain": "example.com",
        "list_id": "global",
        "providers": ["google", "cloudflare", "quad9"],
        "transport": "auto"
    }"#;
    let message: ServerMessage = serde_json::from_str(full).unwrap();
    let ServerMessage::RunStarted { providers, transport, .. } = message else {
        panic!("expected run_started");
    };
    assert_eq!(providers.len(), 3);
    assert_eq!(transport, Some(TransportMode::Auto));

    let minimal = r#"{"type": "run_started", "providers": []}"#;
    let message: ServerMessage = serde_json::from_str(minimal).unwrap();
    assert!(matches!(message, ServerMessage::RunStarted { .. }));
}

// ── Tolerance ─────────────────────────────────────────────────────────────────

#[test]
fn unknown_message_type_parses_to_unknown() {
    let message: ServerMessage =
        serde_json::from_str(r#"{"type": "telemetry", "payload": {"x": 1}}"#).unwrap();
    assert_eq!(message, ServerMessage::Unknown);
}

#[test]
fn missing_type_tag_is_an_error() {
    assert!(serde_json::from_str::<ServerMessage>(r#"{"message": "hi"}"#).is_err());
    assert!(serde_json::from_str::<ServerMessage>("[1, 2, 3]").is_err());
}

#[test]
fn unknown_error_kind_parses_to_other() {
    let info: DnsErrorInfo =
        serde_json::from_str(r#"{"type": "brand_new_kind", "message": "?"}"#).unwrap();
    assert_eq!(info.kind, DnsErrorKind::Other);
    assert!(!info.is_hard());
}

#[test]
fn resolver_error_is_hard() {
    let info = DnsErrorInfo {
        kind: DnsErrorKind::ResolverError,
        message: "Query timed out.".into(),
    };
    assert!(info.is_hard());
}

// ── Transport mode parsing ────────────────────────────────────────────────────

#[test]
fn transport_mode_parses_and_displays() {
    for (text, mode) in [
        ("auto", TransportMode::Auto),
        ("udp", TransportMode::Udp),
        ("tcp", TransportMode::Tcp),
    ] {
        assert_eq!(text.parse::<TransportMode>().unwrap(), mode);
        assert_eq!(mode.to_string(), text);
    }
    assert!("dns-over-carrier-pigeon".parse::<TransportMode>().is_err());
}
