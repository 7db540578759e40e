//! Advisory pipeline scenarios against a real (in-memory) store.

#![allow(clippy::unwrap_used)]

use chrono::Utc;
use domainos_core::Settings;
use domainos_core::Store;
use domainos_core::advisory::REASON_RATE_LIMIT_HOUR;
use domainos_core::advisory::parse_advisory_blocks;
use domainos_protocol::Domain;
use serde_json::json;

fn store_with_domain() -> Store {
    let store = Store::open_in_memory().unwrap();
    store
        .upsert_domain(&Domain {
            id: "d1".to_string(),
            name: "Vendor Ops".to_string(),
            kb_path: "/kb/d1".into(),
            identity: String::new(),
            escalation_triggers: vec![],
            allow_gmail: false,
            model_provider: None,
            model_name: None,
            force_tool_attempt: false,
            sort_order: 0,
        })
        .unwrap();
    store
}

fn brainstorm_response(title: &str, option_count: usize) -> String {
    let options: Vec<_> = (0..option_count)
        .map(|i| json!({"title": format!("Option {i}"), "action": format!("Review option {i}")}))
        .collect();
    let body = json!({
        "schemaVersion": 1,
        "type": "brainstorm",
        "title": title,
        "persist": "yes",
        "topic": "vendor strategy",
        "options": options,
    });
    format!("```advisory-brainstorm\n{body}\n```\n")
}

/// Scenario: two artifacts already created this hour, hourly limit 2. The
/// next valid brainstorm is rejected with `rate_limit_hour` and a system
/// note beginning "hourly save limit".
#[test]
fn hourly_limit_rejects_third_artifact() {
    let store = store_with_domain();
    let settings = Settings {
        advisory_hourly_limit: 2,
        ..Settings::default()
    };
    let now = Utc::now();

    for i in 0..2 {
        let result = parse_advisory_blocks(
            &brainstorm_response(&format!("Earlier artifact {i}"), 2),
            "d1",
            None,
            Some(&store),
            &settings,
            now,
        )
        .unwrap();
        assert_eq!(result.persisted.len(), 1);
    }

    let result = parse_advisory_blocks(
        &brainstorm_response("Fresh eight option brainstorm", 8),
        "d1",
        Some("s1"),
        Some(&store),
        &settings,
        now,
    )
    .unwrap();

    assert_eq!(result.persisted.len(), 0);
    let rate_rejects: Vec<_> = result
        .rejects
        .iter()
        .filter(|r| r.reason == REASON_RATE_LIMIT_HOUR)
        .collect();
    assert_eq!(rate_rejects.len(), 1);
    assert!(result.system_notes[0].starts_with("hourly save limit"));
}

/// The limit is per domain: another domain still saves.
#[test]
fn rate_limit_is_scoped_per_domain() {
    let store = store_with_domain();
    store
        .upsert_domain(&Domain {
            id: "d2".to_string(),
            name: "Legal".to_string(),
            kb_path: "/kb/d2".into(),
            identity: String::new(),
            escalation_triggers: vec![],
            allow_gmail: false,
            model_provider: None,
            model_name: None,
            force_tool_attempt: false,
            sort_order: 0,
        })
        .unwrap();
    let settings = Settings {
        advisory_hourly_limit: 1,
        ..Settings::default()
    };
    let now = Utc::now();

    let first = parse_advisory_blocks(
        &brainstorm_response("Saturate domain one", 2),
        "d1",
        None,
        Some(&store),
        &settings,
        now,
    )
    .unwrap();
    assert_eq!(first.persisted.len(), 1);

    let blocked = parse_advisory_blocks(
        &brainstorm_response("Second for domain one", 2),
        "d1",
        None,
        Some(&store),
        &settings,
        now,
    )
    .unwrap();
    assert_eq!(blocked.persisted.len(), 0);

    let other = parse_advisory_blocks(
        &brainstorm_response("Second for domain one", 2),
        "d2",
        None,
        Some(&store),
        &settings,
        now,
    )
    .unwrap();
    assert_eq!(other.persisted.len(), 1);
}

/// Serialize -> deserialize leaves the payload structurally equal and the
/// fingerprint identical.
#[test]
fn persisted_payload_round_trips_with_same_fingerprint() {
    let store = store_with_domain();
    let settings = Settings::default();
    let now = Utc::now();

    let result = parse_advisory_blocks(
        &brainstorm_response("Round trip check", 3),
        "d1",
        None,
        Some(&store),
        &settings,
        now,
    )
    .unwrap();
    let artifact = &result.persisted[0];

    let reloaded = store.get_advisory(&artifact.id).unwrap();
    assert_eq!(reloaded.content, artifact.content);
    assert_eq!(reloaded.fingerprint, artifact.fingerprint);

    let recomputed = domainos_core::blocks::advisory::advisory_fingerprint(
        reloaded.schema_version,
        reloaded.artifact_type,
        &reloaded.title,
        &reloaded.content,
    );
    assert_eq!(recomputed, reloaded.fingerprint);
}
