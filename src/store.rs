//! Narrow interfaces to the collaborators the engine consumes: the cash-flow
//! feed, the configuration catalog, and scenario persistence.
//!
//! `InMemoryRepository` is an explicit store object meant to be built once at
//! process start and handed to `ScenarioManager`; tests build their own.

use crate::aggregation::AggregationFilter;
use crate::error::{Result, TreasuryError};
use crate::schema::{Forecast, RawCashFlowEntry, Scenario, ScenarioScope};
use crate::snapshot::ForecastSnapshot;
use std::collections::{HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

/// Configuration lookups used to validate ids referenced by entries.
pub trait ReferenceCatalog: Send + Sync {
    fn has_rubrique(&self, rubrique_id: &str) -> bool;
}

#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    rubriques: HashSet<String>,
}

impl StaticCatalog {
    pub fn new<I, S>(rubriques: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            rubriques: rubriques.into_iter().map(Into::into).collect(),
        }
    }
}

impl ReferenceCatalog for StaticCatalog {
    fn has_rubrique(&self, rubrique_id: &str) -> bool {
        self.rubriques.contains(rubrique_id)
    }
}

/// Read side of the cash-flow ledger.
pub trait CashFlowSource: Send + Sync {
    fn entries(&self, filter: &AggregationFilter) -> Result<Vec<RawCashFlowEntry>>;
}

/// Serves a fixed set of rows, pre-filtered on plan and period only; the
/// aggregation engine applies the rest of the filter.
#[derive(Debug, Clone, Default)]
pub struct StaticCashFlowSource {
    rows: Vec<RawCashFlowEntry>,
}

impl StaticCashFlowSource {
    pub fn new(rows: Vec<RawCashFlowEntry>) -> Self {
        Self { rows }
    }
}

impl CashFlowSource for StaticCashFlowSource {
    fn entries(&self, filter: &AggregationFilter) -> Result<Vec<RawCashFlowEntry>> {
        Ok(self
            .rows
            .iter()
            .filter(|row| filter.plan_id.as_ref().map_or(true, |p| &row.plan_id == p))
            .filter(|row| {
                filter
                    .period_id
                    .as_ref()
                    .map_or(true, |p| &row.period_id == p)
            })
            .cloned()
            .collect())
    }
}

/// Persistence of scenarios, forecast lines and snapshots.
///
/// Multi-record writes (`commit_simulation`, `commit_adjustment`,
/// `update_scenarios`) must be atomic: either every record is written or none.
pub trait TreasuryRepository: Send + Sync {
    fn scenario(&self, id: Uuid) -> Result<Option<Scenario>>;
    fn scenarios_in_scope(&self, scope: &ScenarioScope) -> Result<Vec<Scenario>>;
    fn insert_scenario(&self, scenario: Scenario, forecasts: Vec<Forecast>) -> Result<()>;
    fn update_scenarios(&self, scenarios: Vec<Scenario>) -> Result<()>;
    /// Removes the scenario and its forecast lines; snapshots are kept.
    fn delete_scenario(&self, id: Uuid) -> Result<()>;

    fn forecasts(&self, scenario_id: Uuid) -> Result<Vec<Forecast>>;
    fn forecast(&self, id: Uuid) -> Result<Option<Forecast>>;

    /// Writes a new version of every line plus the scenario. Each line's
    /// stored version must be exactly one below the incoming one.
    fn commit_simulation(&self, scenario: Scenario, forecasts: Vec<Forecast>) -> Result<()>;

    /// Compare-and-swap of a single line against `expected_version`, together
    /// with the owning scenario's refreshed state.
    fn commit_adjustment(
        &self,
        forecast: Forecast,
        expected_version: u64,
        scenario: Scenario,
    ) -> Result<()>;

    fn insert_snapshot(&self, snapshot: ForecastSnapshot) -> Result<()>;
    /// Snapshots of a scenario in creation order.
    fn snapshots(&self, scenario_id: Uuid) -> Result<Vec<ForecastSnapshot>>;
    fn snapshot(&self, id: Uuid) -> Result<Option<ForecastSnapshot>>;
}

#[derive(Default)]
struct RepositoryState {
    scenarios: HashMap<Uuid, Scenario>,
    forecasts: HashMap<Uuid, Forecast>,
    snapshots: Vec<ForecastSnapshot>,
}

#[derive(Default)]
pub struct InMemoryRepository {
    state: RwLock<RepositoryState>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, RepositoryState>> {
        self.state
            .read()
            .map_err(|_| TreasuryError::Collaborator("repository lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, RepositoryState>> {
        self.state
            .write()
            .map_err(|_| TreasuryError::Collaborator("repository lock poisoned".to_string()))
    }
}

fn check_version(stored: &Forecast, expected: u64) -> Result<()> {
    if stored.version != expected {
        return Err(TreasuryError::ConcurrentModification {
            forecast_id: stored.id,
            expected,
            actual: stored.version,
        });
    }
    Ok(())
}

impl TreasuryRepository for InMemoryRepository {
    fn scenario(&self, id: Uuid) -> Result<Option<Scenario>> {
        Ok(self.read()?.scenarios.get(&id).cloned())
    }

    fn scenarios_in_scope(&self, scope: &ScenarioScope) -> Result<Vec<Scenario>> {
        let state = self.read()?;
        let mut scenarios: Vec<Scenario> = state
            .scenarios
            .values()
            .filter(|s| &s.scope == scope)
            .cloned()
            .collect();
        scenarios.sort_by_key(|s| s.created_at);
        Ok(scenarios)
    }

    fn insert_scenario(&self, scenario: Scenario, forecasts: Vec<Forecast>) -> Result<()> {
        let mut state = self.write()?;
        if state.scenarios.contains_key(&scenario.id) {
            return Err(TreasuryError::validation(
                "scenarioId",
                format!("scenario {} already exists", scenario.id),
            ));
        }
        for forecast in forecasts {
            state.forecasts.insert(forecast.id, forecast);
        }
        state.scenarios.insert(scenario.id, scenario);
        Ok(())
    }

    fn update_scenarios(&self, scenarios: Vec<Scenario>) -> Result<()> {
        let mut state = self.write()?;
        if let Some(missing) = scenarios
            .iter()
            .find(|s| !state.scenarios.contains_key(&s.id))
        {
            return Err(TreasuryError::not_found("Scenario", missing.id));
        }
        for scenario in scenarios {
            state.scenarios.insert(scenario.id, scenario);
        }
        Ok(())
    }

    fn delete_scenario(&self, id: Uuid) -> Result<()> {
        let mut state = self.write()?;
        if state.scenarios.remove(&id).is_none() {
            return Err(TreasuryError::not_found("Scenario", id));
        }
        state.forecasts.retain(|_, f| f.scenario_id != id);
        Ok(())
    }

    fn forecasts(&self, scenario_id: Uuid) -> Result<Vec<Forecast>> {
        let state = self.read()?;
        let mut forecasts: Vec<Forecast> = state
            .forecasts
            .values()
            .filter(|f| f.scenario_id == scenario_id)
            .cloned()
            .collect();
        forecasts.sort_by(|a, b| {
            (a.month, &a.rubrique_id, &a.period_id, a.id)
                .cmp(&(b.month, &b.rubrique_id, &b.period_id, b.id))
        });
        Ok(forecasts)
    }

    fn forecast(&self, id: Uuid) -> Result<Option<Forecast>> {
        Ok(self.read()?.forecasts.get(&id).cloned())
    }

    fn commit_simulation(&self, scenario: Scenario, forecasts: Vec<Forecast>) -> Result<()> {
        let mut state = self.write()?;
        if !state.scenarios.contains_key(&scenario.id) {
            return Err(TreasuryError::not_found("Scenario", scenario.id));
        }

        for forecast in &forecasts {
            let stored = state
                .forecasts
                .get(&forecast.id)
                .ok_or_else(|| TreasuryError::not_found("Forecast", forecast.id))?;
            check_version(stored, forecast.version.saturating_sub(1))?;
        }

        for forecast in forecasts {
            state.forecasts.insert(forecast.id, forecast);
        }
        state.scenarios.insert(scenario.id, scenario);
        Ok(())
    }

    fn commit_adjustment(
        &self,
        forecast: Forecast,
        expected_version: u64,
        scenario: Scenario,
    ) -> Result<()> {
        let mut state = self.write()?;
        let stored = state
            .forecasts
            .get(&forecast.id)
            .ok_or_else(|| TreasuryError::not_found("Forecast", forecast.id))?;
        check_version(stored, expected_version)?;
        if !state.scenarios.contains_key(&scenario.id) {
            return Err(TreasuryError::not_found("Scenario", scenario.id));
        }

        state.forecasts.insert(forecast.id, forecast);
        state.scenarios.insert(scenario.id, scenario);
        Ok(())
    }

    fn insert_snapshot(&self, snapshot: ForecastSnapshot) -> Result<()> {
        let mut state = self.write()?;
        if state.snapshots.iter().any(|s| s.id() == snapshot.id()) {
            return Err(TreasuryError::validation(
                "snapshotId",
                format!("snapshot {} already exists and is write-once", snapshot.id()),
            ));
        }
        state.snapshots.push(snapshot);
        Ok(())
    }

    fn snapshots(&self, scenario_id: Uuid) -> Result<Vec<ForecastSnapshot>> {
        Ok(self
            .read()?
            .snapshots
            .iter()
            .filter(|s| s.scenario_id() == scenario_id)
            .cloned()
            .collect())
    }

    fn snapshot(&self, id: Uuid) -> Result<Option<ForecastSnapshot>> {
        Ok(self.read()?.snapshots.iter().find(|s| s.id() == id).cloned())
    }
}
