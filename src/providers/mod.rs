//! Odds provider registry
//!
//! This module provides:
//! - The `OddsProvider` abstraction (one per upstream API)
//! - A strategy table resolving race type → provider + retry policy
//!
//! All provider-specific logic must live in dedicated provider
//! modules. The orchestrator interacts exclusively through the
//! `OddsProvider` trait and the `ProviderTable`.

pub mod adapter;
pub mod cycle_boat;
pub mod horse;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::debug;

use adapter::OddsProvider;

use crate::config::ProvidersConfig;
use crate::retry::{RetryWrapper, create_retry_wrapper};
use crate::schema::RaceType;

/// One row of the strategy table.
#[derive(Clone)]
pub struct ProviderEntry {
    pub provider: Arc<dyn OddsProvider>,
    pub retry: RetryWrapper,

    /// Applied to every single fetch attempt
    pub timeout: Duration,
}

/// Race type → provider lookup.
///
/// DESIGN:
/// - Keeps provider selection in one place
/// - Each row carries its own retry policy so call sites never
///   repeat configuration
/// - Several race types may share one provider instance
#[derive(Clone, Default)]
pub struct ProviderTable {
    entries: HashMap<RaceType, ProviderEntry>,
}

impl ProviderTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        mut self,
        race_type: RaceType,
        provider: Arc<dyn OddsProvider>,
        retry: RetryWrapper,
        timeout: Duration,
    ) -> Self {
        debug!(
            "{} races → {} ({} retries, {:?} per attempt)",
            race_type.as_str(),
            provider.name(),
            retry.options().max_retries,
            timeout
        );
        self.entries.insert(
            race_type,
            ProviderEntry {
                provider,
                retry,
                timeout,
            },
        );
        self
    }

    /// Returns `None` when no provider serves this race type.
    pub fn resolve(&self, race_type: RaceType) -> Option<&ProviderEntry> {
        self.entries.get(&race_type)
    }

    /// Builds the production table:
    /// - horse        → provider A
    /// - cycle / boat → provider B (shared instance)
    pub fn from_config(cfg: &ProvidersConfig, client: reqwest::Client) -> Self {
        let horse: Arc<dyn OddsProvider> = Arc::new(horse::HorseOddsProvider::new(
            client.clone(),
            cfg.horse.base_url.clone(),
        ));
        let board: Arc<dyn OddsProvider> = Arc::new(cycle_boat::CycleBoatOddsProvider::new(
            client,
            cfg.cycle_boat.base_url.clone(),
        ));

        let horse_retry = create_retry_wrapper(cfg.horse.retry.to_options());
        let board_retry = create_retry_wrapper(cfg.cycle_boat.retry.to_options());
        let board_timeout = cfg.cycle_boat.timeout();

        Self::new()
            .register(RaceType::Horse, horse, horse_retry, cfg.horse.timeout())
            .register(RaceType::Cycle, board.clone(), board_retry.clone(), board_timeout)
            .register(RaceType::Boat, board, board_retry, board_timeout)
    }
}
