//! Feed a few gateway push events through the delegation pipeline.
//! Run with: `cargo run --example event_pipeline`

use std::sync::Arc;

use anyhow::Result;
use missiondesk_orchestration::{
    Collaborators, DelegationStatus, DelegationStore, DispatchOutcome, Dispatcher, LocalBackend,
    NewDelegation, SessionUpdate, WorkStage,
};
use serde_json::json;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    let backend = Arc::new(LocalBackend::new());
    backend.insert_work_item("wi-42", WorkStage::Backlog)?;

    let delegation = backend
        .create_delegation(NewDelegation {
            work_item_id: "wi-42".into(),
            agent_id: "builder".into(),
        })
        .await?;
    backend
        .attach_session(
            &delegation.id,
            SessionUpdate {
                session_key: Some("agent:builder:task:wi-42".into()),
                run_id: Some("run-1".into()),
                status: Some(DelegationStatus::Active),
                ..SessionUpdate::default()
            },
        )
        .await?;

    let dispatcher = Dispatcher::new(Collaborators::local(backend.clone()));
    let events = [
        ("agent", json!({"runId": "run-1", "stream": "lifecycle", "data": {"phase": "start"}})),
        ("agent", json!({"runId": "run-1", "stream": "assistant", "data": {"text": "working"}})),
        ("agent", json!({"runId": "run-1", "stream": "lifecycle", "data": {"phase": "end"}})),
        ("agent", json!({"runId": "run-unknown", "stream": "lifecycle", "data": {"phase": "end"}})),
    ];

    for (message_type, payload) in events {
        match dispatcher.dispatch(message_type, &payload).await? {
            DispatchOutcome::Applied {
                event_key, stage, ..
            } => println!("{event_key}: {stage:?}"),
            other => println!("{message_type}: {other:?}"),
        }
    }

    println!("work item stage: {:?}", backend.stage_of("wi-42")?);
    println!("audit entries: {}", backend.audit_entries()?.len());
    Ok(())
}
