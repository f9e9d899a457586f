/// Collector module
///
/// This module groups all logic responsible for:
/// - Polling odds for a list of races (`orchestrator`)
/// - Running one triggered invocation end to end (`runner`):
///   fallback check, window planning, first pass, second pass
///
/// The collector layer acts as the orchestration layer between:
/// - Odds providers (horse, cycle / boat)
/// - The durable stores (snapshots, state, failures)
///
/// Design notes:
/// - Provider-specific logic MUST NOT live here
/// - One race's failure never aborts a batch
/// - Only infrastructure errors leave this module
pub mod orchestrator;
pub mod runner;

pub use orchestrator::OddsCollectionOrchestrator;
pub use runner::CollectionRunner;
