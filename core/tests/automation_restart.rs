//! Dedup across process restart: the unique index lives in the database, so
//! a fresh process cannot double-fire a minute that already ran.

#![allow(clippy::unwrap_used)]

use chrono::Utc;
use domainos_core::DomainOsErr;
use domainos_core::Store;
use domainos_protocol::Automation;
use domainos_protocol::AutomationActionType;
use domainos_protocol::AutomationRun;
use domainos_protocol::Domain;
use domainos_protocol::RunStatus;
use domainos_protocol::TriggerType;
use serde_json::json;

fn seed(store: &Store) {
    store
        .upsert_domain(&Domain {
            id: "d1".to_string(),
            name: "Ops".to_string(),
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
        .upsert_automation(&Automation {
            id: "X".to_string(),
            domain_id: "d1".to_string(),
            name: "morning digest".to_string(),
            trigger_type: TriggerType::Schedule,
            trigger_cron: Some("0 9 * * *".to_string()),
            trigger_event: None,
            prompt_template: String::new(),
            action_type: AutomationActionType::Notification,
            action_config: json!({}),
            enabled: true,
            catch_up_enabled: false,
            store_payloads: false,
            deadline_window_days: None,
            next_run_at: None,
            failure_streak: 0,
            cooldown_until: None,
            run_count: 0,
            duplicate_skip_count: 0,
            last_duplicate_at: None,
            last_run_at: None,
            last_error: None,
        })
        .unwrap();
}

fn run(id: &str, dedupe_key: &str) -> AutomationRun {
    let now = Utc::now();
    AutomationRun {
        id: id.to_string(),
        automation_id: "X".to_string(),
        domain_id: "d1".to_string(),
        trigger_type: TriggerType::Schedule,
        trigger_event: None,
        trigger_data: None,
        dedupe_key: Some(dedupe_key.to_string()),
        prompt_hash: None,
        prompt_rendered: None,
        response_hash: None,
        llm_response: None,
        action_type: AutomationActionType::Notification,
        action_result: None,
        action_external_id: None,
        status: RunStatus::Pending,
        error: None,
        error_code: None,
        duration_ms: None,
        created_at: now,
        updated_at: now,
    }
}

/// Scenario: a 09:00 tick inserts a run, the process restarts, another tick
/// computes the same dedupe key. The second insert is rejected and the
/// parent's skip counter increments.
#[test]
fn restart_cannot_double_fire_a_minute() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("domainos.sqlite3");
    let key = "X|2025-06-15T09:00";

    {
        let store = Store::open(&db_path).unwrap();
        seed(&store);
        store.try_insert_run(&run("r1", key)).unwrap();
    }

    // new process, same database
    let store = Store::open(&db_path).unwrap();
    let second = store.try_insert_run(&run("r2", key));
    assert!(matches!(second, Err(DomainOsErr::Duplicate)));

    let parent = store.get_automation("X").unwrap();
    assert_eq!(parent.duplicate_skip_count, 1);
    assert!(parent.last_duplicate_at.is_some());

    // the surviving run is the one from before the restart
    assert!(store.get_run("r1").is_ok());
    assert!(store.get_run("r2").is_err());
}
