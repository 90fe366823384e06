use serde_json::json;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use trip_supervisor::{
    audit::AuditLog,
    handlers::create_default_registry,
    state::InMemorySessionStore,
    ConfirmDecision, PreferenceField, SessionManager, StepStatus, Supervisor, SupervisorConfig,
    TripState, TurnReply, UserInput,
};

fn print_step(label: &str, status: &StepStatus) {
    match status {
        StepStatus::Succeeded { detail } => println!("\n{}:\n{}", label, detail.trim_end()),
        other => println!("\n{}: {:?}", label, other),
    }
}

fn print_reply(label: &str, reply: &TurnReply) {
    let snapshot = reply.snapshot();
    println!("\n=== {} ===", label);
    println!("Phase: {}  (turns used: {})", snapshot.phase, snapshot.turn_count);

    match reply {
        TurnReply::Question { handler, question, .. } => {
            println!("{} asks: {}", handler, question);
        }
        TurnReply::Failed { failure, .. } => {
            println!("Failed: {}", failure);
        }
        TurnReply::Cancelled { .. } => println!("Cancelled"),
        TurnReply::Snapshot { .. } => {}
    }

    if let Some(plan) = &snapshot.plan {
        println!("Plan: {} ({} activities, est. {} KRW)", plan.title, plan.activity_count(), plan.total_cost());
        for day in &plan.days {
            let names: Vec<&str> = day.activities.iter().map(|a| a.name.as_str()).collect();
            println!("  Day {}: {}", day.day_number, names.join(" → "));
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Trip supervisor demo starting");

    let config = SupervisorConfig::from_env()?;
    let supervisor = Supervisor::new(create_default_registry(), config, AuditLog::new());
    let sessions = SessionManager::new(Arc::new(supervisor), Box::new(InMemorySessionStore::new()));

    let session_id = sessions.create_session().await?;
    info!(session_id = %session_id, "Running Busan scenario");

    let input = UserInput::message("Three days in Busan in November, medium budget, we love food")
        .with_preference(PreferenceField::Destination, json!("Busan"))
        .with_preference(PreferenceField::Days, json!(3))
        .with_preference(PreferenceField::Budget, json!("medium"))
        .with_preference(PreferenceField::StartDate, json!("2026-11-02"))
        .with_preference(PreferenceField::TravelStyle, json!("food, nature"));

    let reply = sessions.submit_input(session_id, &input).await?;
    print_reply("AFTER PREFERENCES", &reply);

    let reply = sessions.confirm_plan(session_id, ConfirmDecision::Accept).await?;
    print_reply("AFTER CONFIRMATION", &reply);

    let snapshot = reply.snapshot();
    print_step("Calendar export", &snapshot.calendar_status);
    print_step("Shared summary", &snapshot.share_status);

    let audit_log = sessions.supervisor().audit_log();
    let records = audit_log.list_for_session(session_id).await?;
    println!("\nAudit trail:");
    for record in records {
        println!(
            "  turn {}: {} -> {} [{}] {}",
            record.turn,
            record.phase_before,
            record.phase_after,
            record.outcome,
            record.state_hash.get(..12).unwrap_or(&record.state_hash)
        );
    }

    let state = TripState::restore(snapshot.clone());
    println!("Audit matches final state: {}", audit_log.matches_state(&state).await?);

    println!("\nLast events:");
    for entry in state.recent_history(3) {
        println!("  turn {}: {:?}", entry.turn, entry.event);
    }

    let closed = sessions.close_session(session_id).await?;
    info!(session_id = %session_id, phase = %closed.phase, "Session closed");

    Ok(())
}
