use crate::error::{Result, TreasuryError};
use crate::schema::{ForecastDataPoint, ImpactMetrics, Scenario, ScenarioParameter};
use crate::store::TreasuryRepository;
use chrono::{DateTime, Utc};
use log::info;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// The computed state of a scenario as it is frozen into a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotData {
    pub scenario_revision: u64,
    pub parameters: Vec<ScenarioParameter>,
    pub data: Vec<ForecastDataPoint>,
    pub impact_metrics: ImpactMetrics,
}

impl SnapshotData {
    pub fn from_scenario(scenario: &Scenario) -> Self {
        Self {
            scenario_revision: scenario.revision,
            parameters: scenario.parameters.clone(),
            data: scenario.data.clone(),
            impact_metrics: scenario.impact_metrics.clone(),
        }
    }
}

/// Immutable, timestamped copy of a scenario's projection.
///
/// Fields are only reachable through getters; the canonical JSON payload is
/// rendered once at capture time and never re-rendered.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ForecastSnapshot {
    id: Uuid,
    scenario_id: Uuid,
    scenario_name: String,
    label: Option<String>,
    content: SnapshotData,
    payload: String,
    created_by: String,
    created_at: DateTime<Utc>,
}

impl ForecastSnapshot {
    pub fn capture(scenario: &Scenario, actor: &str, label: Option<String>) -> Result<Self> {
        Self::from_data(
            scenario.id,
            &scenario.name,
            SnapshotData::from_scenario(scenario),
            actor,
            label,
        )
    }

    fn from_data(
        scenario_id: Uuid,
        scenario_name: &str,
        content: SnapshotData,
        actor: &str,
        label: Option<String>,
    ) -> Result<Self> {
        let payload = serde_json::to_string(&content)?;
        Ok(Self {
            id: Uuid::new_v4(),
            scenario_id,
            scenario_name: scenario_name.to_string(),
            label,
            content,
            payload,
            created_by: actor.to_string(),
            created_at: Utc::now(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn scenario_id(&self) -> Uuid {
        self.scenario_id
    }

    pub fn scenario_name(&self) -> &str {
        &self.scenario_name
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn content(&self) -> &SnapshotData {
        &self.content
    }

    pub fn data(&self) -> &[ForecastDataPoint] {
        &self.content.data
    }

    pub fn impact_metrics(&self) -> &ImpactMetrics {
        &self.content.impact_metrics
    }

    /// Canonical JSON of the content, as rendered at capture time.
    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn created_by(&self) -> &str {
        &self.created_by
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// True when the content still renders to the captured payload.
    pub fn verify_integrity(&self) -> bool {
        serde_json::to_string(&self.content)
            .map(|rendered| rendered == self.payload)
            .unwrap_or(false)
    }
}

/// Write-once snapshot persistence on top of the repository.
pub struct SnapshotStore {
    repository: Arc<dyn TreasuryRepository>,
}

impl SnapshotStore {
    pub fn new(repository: Arc<dyn TreasuryRepository>) -> Self {
        Self { repository }
    }

    /// Fails with `NotFound` when the scenario does not exist.
    pub fn save(
        &self,
        scenario_id: Uuid,
        data: SnapshotData,
        actor: &str,
        label: Option<String>,
    ) -> Result<ForecastSnapshot> {
        let scenario = self
            .repository
            .scenario(scenario_id)?
            .ok_or_else(|| TreasuryError::not_found("Scenario", scenario_id))?;

        let snapshot = ForecastSnapshot::from_data(scenario.id, &scenario.name, data, actor, label)?;
        self.repository.insert_snapshot(snapshot.clone())?;

        info!(
            "Saved snapshot {} of scenario '{}' at revision {}",
            snapshot.id, scenario.name, snapshot.content.scenario_revision
        );
        Ok(snapshot)
    }

    /// Snapshots of the scenario, oldest first.
    pub fn list(&self, scenario_id: Uuid) -> Result<Vec<ForecastSnapshot>> {
        let mut snapshots = self.repository.snapshots(scenario_id)?;
        snapshots.sort_by_key(|s| s.created_at);
        Ok(snapshots)
    }

    pub fn get(&self, id: Uuid) -> Result<Option<ForecastSnapshot>> {
        self.repository.snapshot(id)
    }
}
