/// Failure escalation module
///
/// This module groups everything that happens *after* a race could
/// not be collected:
/// - Durable failure records and their state machine (tracker)
/// - Daily collection counters and the summary report (summary)
///
/// Design notes:
/// - The tracker is an asynchronous consumer: retries run on their
///   own, slower reconciliation cadence, never inside the per-minute
///   collection invocation
/// - Notification failures are logged and swallowed
pub mod summary;
pub mod tracker;

pub use summary::DailyCounters;
pub use tracker::{FailureEscalationTracker, ODDS_COLLECTION_JOB};
