//! Scheduling and event-driven automations.

pub mod cron;
pub mod engine;

pub use cron::CronExpr;
pub use cron::last_cron_match;
pub use cron::matches_cron;
pub use cron::validate_cron;
pub use engine::AutomationEngine;
pub use engine::AutomationExecutor;
pub use engine::AutomationOutcome;
pub use engine::TickSummary;
pub use engine::materialize_dedupe_payload;
