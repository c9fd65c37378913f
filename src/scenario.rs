//! Scenario lifecycle and the simulate / adjust units of work.
//!
//! `ScenarioManager` sequences aggregation, parameter application, balance
//! evolution and alert evaluation, then commits the result through the
//! repository in a single write. Mutations of one scenario are serialized by
//! a per-scenario lock; baseline changes additionally hold a per-scope lock.
//! Forecast lines carry optimistic versions on top of that, so a caller
//! presenting a stale version is rejected even across processes sharing a
//! repository.

use crate::aggregation::{AggregationEngine, AggregationFilter, AggregationReport, ConsistencyIssue};
use crate::alerts::{reconcile_alerts, AlertEvaluator, AlertRule, EvaluationInput};
use crate::audit::{AuditAction, AuditEvent, AuditSink};
use crate::balance::{BalanceEvolutionCalculator, BalanceEvolutionPoint};
use crate::config::EngineConfig;
use crate::error::{Result, TreasuryError};
use crate::parameters::ParameterEngine;
use crate::schema::{
    Alert, DataQualityWarning, FlowDirection, Forecast, ForecastDataPoint, ImpactMetrics,
    Scenario, ScenarioParameter, ScenarioScope, ScenarioType,
};
use crate::snapshot::{ForecastSnapshot, SnapshotData, SnapshotStore};
use crate::store::{CashFlowSource, ReferenceCatalog, TreasuryRepository};
use crate::utils::relative_change;
use chrono::{NaiveDate, Utc};
use dashmap::DashMap;
use log::{debug, info, warn};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

/// A baseline line supplied when creating a scenario.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ForecastLine {
    pub period_id: String,
    pub rubrique_id: String,
    pub direction: FlowDirection,
    pub month: NaiveDate,
    pub original_amount: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NewScenario {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub scenario_type: ScenarioType,
    pub scope: ScenarioScope,
    pub parameters: Vec<ScenarioParameter>,
    pub opening_balance: f64,
    #[serde(default)]
    pub is_baseline: bool,
    /// Explicit lines; when empty the scope baseline's originals are cloned.
    #[serde(default)]
    pub lines: Vec<ForecastLine>,
    pub actor: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ParameterValue {
    pub key: String,
    pub value: f64,
}

impl ParameterValue {
    pub fn new(key: impl Into<String>, value: f64) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SimulationRequest {
    pub scenario_id: Uuid,
    /// New values for declared parameters; undeclared keys are rejected.
    #[serde(default)]
    pub parameters: Vec<ParameterValue>,
    pub reason: String,
    pub actor: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationOutcome {
    pub scenario: Scenario,
    pub forecasts: Vec<Forecast>,
    pub balance: Vec<BalanceEvolutionPoint>,
    pub warnings: Vec<DataQualityWarning>,
    pub consistency_issues: Vec<ConsistencyIssue>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AdjustForecastRequest {
    pub forecast_id: Uuid,
    /// The version the caller last observed.
    pub expected_version: u64,
    pub adjusted_amount: f64,
    pub reason: String,
    pub actor: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdjustmentOutcome {
    pub forecast: Forecast,
    pub scenario: Scenario,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MonthComparison {
    pub month: NaiveDate,
    pub baseline_net: f64,
    pub scenario_net: f64,
    pub delta: f64,
    pub baseline_balance: Option<f64>,
    pub scenario_balance: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioComparison {
    pub scenario_id: Uuid,
    pub baseline_id: Uuid,
    pub months: Vec<MonthComparison>,
    pub total_delta: f64,
    pub closing_balance_delta: f64,
}

struct Projection {
    data: Vec<ForecastDataPoint>,
    impact_metrics: ImpactMetrics,
    alerts: Vec<Alert>,
    balance: Vec<BalanceEvolutionPoint>,
    report: AggregationReport,
}

impl Projection {
    fn apply_to(self, scenario: &mut Scenario) -> (Vec<BalanceEvolutionPoint>, AggregationReport) {
        scenario.data = self.data;
        scenario.impact_metrics = self.impact_metrics;
        scenario.alerts = reconcile_alerts(&scenario.alerts, self.alerts);
        (self.balance, self.report)
    }
}

fn acquire(lock: &Mutex<()>) -> Result<MutexGuard<'_, ()>> {
    lock.lock()
        .map_err(|_| TreasuryError::Collaborator("scenario lock poisoned".to_string()))
}

pub struct ScenarioManager {
    config: EngineConfig,
    evaluator: AlertEvaluator,
    repository: Arc<dyn TreasuryRepository>,
    source: Arc<dyn CashFlowSource>,
    audit: Arc<dyn AuditSink>,
    catalog: Option<Arc<dyn ReferenceCatalog>>,
    snapshots: SnapshotStore,
    scenario_locks: DashMap<Uuid, Arc<Mutex<()>>>,
    scope_locks: DashMap<ScenarioScope, Arc<Mutex<()>>>,
}

impl ScenarioManager {
    pub fn new(
        config: EngineConfig,
        repository: Arc<dyn TreasuryRepository>,
        source: Arc<dyn CashFlowSource>,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self> {
        config.validate()?;
        let evaluator = AlertEvaluator::from_config(&config);
        debug!(
            "Scenario manager ready with alert rules: {:?}",
            evaluator.rule_names()
        );

        Ok(Self {
            config,
            evaluator,
            snapshots: SnapshotStore::new(repository.clone()),
            repository,
            source,
            audit,
            catalog: None,
            scenario_locks: DashMap::new(),
            scope_locks: DashMap::new(),
        })
    }

    /// Validates entry and forecast rubrique ids against `catalog`.
    pub fn with_catalog(mut self, catalog: Arc<dyn ReferenceCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn register_alert_rule(&mut self, rule: Box<dyn AlertRule>) {
        self.evaluator.register(rule);
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn scenario(&self, id: Uuid) -> Result<Scenario> {
        self.repository
            .scenario(id)?
            .ok_or_else(|| TreasuryError::not_found("Scenario", id))
    }

    pub fn scenarios(&self, scope: &ScenarioScope) -> Result<Vec<Scenario>> {
        self.repository.scenarios_in_scope(scope)
    }

    pub fn baseline(&self, scope: &ScenarioScope) -> Result<Option<Scenario>> {
        Ok(self
            .repository
            .scenarios_in_scope(scope)?
            .into_iter()
            .find(|s| s.is_baseline))
    }

    pub fn forecasts(&self, scenario_id: Uuid) -> Result<Vec<Forecast>> {
        self.repository.forecasts(scenario_id)
    }

    /// Aggregates the entries the cash-flow source returns for `filter`.
    pub fn aggregate(&self, filter: &AggregationFilter) -> Result<AggregationReport> {
        filter.validate()?;
        let raw = self.source.entries(filter)?;
        Ok(self.aggregation_engine().aggregate(&raw, filter))
    }

    pub fn create_scenario(&self, request: NewScenario) -> Result<Scenario> {
        if request.name.trim().is_empty() {
            return Err(TreasuryError::validation("name", "scenario name is required"));
        }
        if !request.opening_balance.is_finite() {
            return Err(TreasuryError::validation(
                "openingBalance",
                "opening balance is not a finite number",
            ));
        }
        let mut keys = HashSet::new();
        for parameter in &request.parameters {
            parameter.validate()?;
            if !keys.insert(parameter.key.as_str()) {
                return Err(TreasuryError::validation(
                    "parameters",
                    format!("parameter '{}' is declared twice", parameter.key),
                ));
            }
        }

        let engine = ParameterEngine::new(&self.config);
        if request.is_baseline && !engine.is_neutral(&request.parameters) {
            return Err(TreasuryError::validation(
                "parameters",
                "a baseline scenario must carry neutral parameter values",
            ));
        }

        let scope_lock = self.scope_lock(&request.scope);
        let _scope_guard = acquire(&scope_lock)?;
        let previous_baseline = self.baseline(&request.scope)?;

        let mut scenario = Scenario::new(
            request.name.clone(),
            request.scenario_type,
            request.scope.clone(),
            request.parameters.clone(),
            request.opening_balance,
            request.actor.clone(),
        );
        scenario.description = request.description.clone();

        let forecasts: Vec<Forecast> = if !request.lines.is_empty() {
            request
                .lines
                .iter()
                .map(|line| {
                    Forecast::new(
                        scenario.id,
                        line.period_id.clone(),
                        line.rubrique_id.clone(),
                        line.direction,
                        line.month,
                        line.original_amount,
                    )
                })
                .collect()
        } else if let Some(baseline) = &previous_baseline {
            self.repository
                .forecasts(baseline.id)?
                .iter()
                .map(|f| f.rebased_for(scenario.id))
                .collect()
        } else {
            Vec::new()
        };

        for forecast in &forecasts {
            self.check_rubrique(&forecast.rubrique_id)?;
            engine.check_amount(&forecast.rubrique_id, forecast.original_amount)?;
        }

        // Projected as what it will be once committed; stored unpromoted first
        // so the scope never holds two baselines.
        scenario.is_baseline = request.is_baseline;
        self.project(&scenario, &forecasts)?.apply_to(&mut scenario);
        scenario.is_baseline = false;
        self.repository
            .insert_scenario(scenario.clone(), forecasts.clone())?;

        if request.is_baseline {
            scenario.is_baseline = true;
            self.install_baseline(previous_baseline.map(|b| b.id), &scenario)?;
        }

        info!(
            "Created scenario '{}' ({}) in scope {} with {} forecast line(s)",
            scenario.name,
            scenario.id,
            scenario.scope,
            forecasts.len()
        );
        self.emit(
            AuditEvent::new(
                &request.actor,
                AuditAction::CreateScenario,
                "scenario",
                scenario.id,
            )
            .with_details(json!({
                "name": scenario.name,
                "scope": scenario.scope.to_string(),
                "isBaseline": scenario.is_baseline,
                "lines": forecasts.len(),
            })),
        );

        Ok(scenario)
    }

    /// Rejects a baseline that other scenarios of its scope still compare against.
    pub fn delete_scenario(&self, id: Uuid, actor: &str) -> Result<()> {
        let scope = self.scenario(id)?.scope;
        let scope_lock = self.scope_lock(&scope);
        let _scope_guard = acquire(&scope_lock)?;
        let lock = self.scenario_lock(id);
        let _guard = acquire(&lock)?;

        let scenario = self.scenario(id)?;
        if scenario.is_baseline {
            let dependents = self
                .repository
                .scenarios_in_scope(&scope)?
                .iter()
                .filter(|s| s.id != id && !s.is_baseline)
                .count();
            if dependents > 0 {
                return Err(TreasuryError::BaselineReferenced {
                    scenario_id: id,
                    dependents,
                });
            }
        }

        self.repository.delete_scenario(id)?;
        self.scenario_locks.remove(&id);

        info!("Deleted scenario '{}' ({})", scenario.name, id);
        self.emit(
            AuditEvent::new(actor, AuditAction::DeleteScenario, "scenario", id)
                .with_details(json!({ "name": scenario.name, "scope": scope.to_string() })),
        );
        Ok(())
    }

    /// Makes `id` the baseline of its scope and demotes the previous one in the same write.
    pub fn promote_baseline(&self, id: Uuid, actor: &str) -> Result<Scenario> {
        let scope = self.scenario(id)?.scope;
        let scope_lock = self.scope_lock(&scope);
        let _scope_guard = acquire(&scope_lock)?;
        let lock = self.scenario_lock(id);
        let _guard = acquire(&lock)?;

        let mut scenario = self.scenario(id)?;
        if scenario.is_baseline {
            self.emit(
                AuditEvent::new(actor, AuditAction::PromoteBaseline, "scenario", id)
                    .with_details(json!({ "alreadyBaseline": true })),
            );
            return Ok(scenario);
        }

        if !ParameterEngine::new(&self.config).is_neutral(&scenario.parameters) {
            return Err(TreasuryError::validation(
                "parameters",
                format!(
                    "scenario '{}' has non-neutral parameters and cannot become the baseline",
                    scenario.name
                ),
            ));
        }
        let forecasts = self.repository.forecasts(id)?;
        if let Some(line) = forecasts
            .iter()
            .find(|f| (f.adjusted_amount - f.original_amount).abs() > self.config.consistency_tolerance)
        {
            return Err(TreasuryError::validation(
                "forecasts",
                format!(
                    "line {} ({}) is adjusted away from its original amount",
                    line.id, line.rubrique_id
                ),
            ));
        }

        let previous = self.baseline(&scope)?.map(|b| b.id);
        scenario.is_baseline = true;
        self.project(&scenario, &forecasts)?.apply_to(&mut scenario);
        scenario.touch();
        self.install_baseline(previous, &scenario)?;

        info!(
            "Promoted scenario '{}' ({}) to baseline of {}",
            scenario.name, id, scope
        );
        self.emit(
            AuditEvent::new(actor, AuditAction::PromoteBaseline, "scenario", id).with_details(
                json!({ "previousBaseline": previous.map(|p| p.to_string()) }),
            ),
        );
        Ok(scenario)
    }

    /// Validates and applies new parameter values, recomputes the projection
    /// and commits every line plus the scenario at once.
    pub fn simulate(&self, request: SimulationRequest) -> Result<SimulationOutcome> {
        if request.reason.trim().is_empty() {
            return Err(TreasuryError::validation(
                "adjustmentReason",
                "an adjustment reason is required",
            ));
        }

        let lock = self.scenario_lock(request.scenario_id);
        let _guard = acquire(&lock)?;

        let mut scenario = self.scenario(request.scenario_id)?;
        let parameters = resolve_parameters(&scenario, &request.parameters)?;

        let engine = ParameterEngine::new(&self.config);
        if scenario.is_baseline && !engine.is_neutral(&parameters) {
            return Err(TreasuryError::validation(
                "parameters",
                "the baseline scenario only accepts neutral parameter values",
            ));
        }

        let current = self.repository.forecasts(scenario.id)?;
        let adjusted = engine.apply_parameters(&current, &parameters, &request.reason)?;

        scenario.parameters = parameters;
        let (balance, report) = self.project(&scenario, &adjusted)?.apply_to(&mut scenario);
        scenario.touch();

        self.repository
            .commit_simulation(scenario.clone(), adjusted.clone())?;

        info!(
            "Simulated scenario '{}' ({}) at revision {}: {} line(s), closing balance {:.2}",
            scenario.name,
            scenario.id,
            scenario.revision,
            adjusted.len(),
            scenario.impact_metrics.closing_balance
        );
        self.emit(
            AuditEvent::new(&request.actor, AuditAction::Simulate, "scenario", scenario.id)
                .with_details(json!({
                    "reason": request.reason,
                    "parameters": request
                        .parameters
                        .iter()
                        .map(|p| (p.key.clone(), json!(p.value)))
                        .collect::<serde_json::Map<String, serde_json::Value>>(),
                    "revision": scenario.revision,
                    "lines": adjusted.len(),
                })),
        );

        Ok(SimulationOutcome {
            scenario,
            forecasts: adjusted,
            balance,
            warnings: report.warnings,
            consistency_issues: report.consistency_issues,
        })
    }

    /// Manual override of one line, guarded by the caller's expected version.
    pub fn adjust_forecast(&self, request: AdjustForecastRequest) -> Result<AdjustmentOutcome> {
        if request.reason.trim().is_empty() {
            return Err(TreasuryError::validation(
                "adjustmentReason",
                "an adjustment reason is required",
            ));
        }

        let located = self
            .repository
            .forecast(request.forecast_id)?
            .ok_or_else(|| TreasuryError::not_found("Forecast", request.forecast_id))?;
        let lock = self.scenario_lock(located.scenario_id);
        let _guard = acquire(&lock)?;

        let stored = self
            .repository
            .forecast(request.forecast_id)?
            .ok_or_else(|| TreasuryError::not_found("Forecast", request.forecast_id))?;
        if stored.version != request.expected_version {
            return Err(TreasuryError::ConcurrentModification {
                forecast_id: stored.id,
                expected: request.expected_version,
                actual: stored.version,
            });
        }

        let mut scenario = self.scenario(stored.scenario_id)?;
        if scenario.is_baseline {
            return Err(TreasuryError::validation(
                "forecastId",
                "baseline lines always equal their original amounts",
            ));
        }
        ParameterEngine::new(&self.config).check_amount(&stored.rubrique_id, request.adjusted_amount)?;

        let mut next = stored.clone();
        next.adjusted_amount = request.adjusted_amount;
        next.version = stored.version + 1;
        next.adjustment_reason = Some(request.reason.clone());
        next.updated_at = Utc::now();

        let lines: Vec<Forecast> = self
            .repository
            .forecasts(scenario.id)?
            .into_iter()
            .map(|f| if f.id == next.id { next.clone() } else { f })
            .collect();
        self.project(&scenario, &lines)?.apply_to(&mut scenario);
        scenario.touch();

        self.repository
            .commit_adjustment(next.clone(), request.expected_version, scenario.clone())?;

        info!(
            "Adjusted forecast {} ({}) from {:.2} to {:.2}, now version {}",
            next.id, next.rubrique_id, stored.adjusted_amount, next.adjusted_amount, next.version
        );
        self.emit(
            AuditEvent::new(&request.actor, AuditAction::AdjustForecast, "forecast", next.id)
                .with_details(json!({
                    "scenarioId": scenario.id.to_string(),
                    "previousAmount": stored.adjusted_amount,
                    "adjustedAmount": next.adjusted_amount,
                    "version": next.version,
                    "reason": request.reason,
                })),
        );

        Ok(AdjustmentOutcome {
            forecast: next,
            scenario,
        })
    }

    /// Month-by-month net flow of the scenario against its scope baseline.
    pub fn compare_with_baseline(&self, id: Uuid) -> Result<ScenarioComparison> {
        let scenario = self.scenario(id)?;
        let baseline = self
            .baseline(&scenario.scope)?
            .ok_or_else(|| TreasuryError::not_found("Baseline", &scenario.scope))?;

        fn by_month(points: &[ForecastDataPoint]) -> BTreeMap<NaiveDate, (f64, f64)> {
            points.iter().map(|p| (p.month, (p.net, p.balance))).collect()
        }
        let base = by_month(&baseline.data);
        let current = by_month(&scenario.data);
        let months: BTreeSet<NaiveDate> = base.keys().chain(current.keys()).copied().collect();

        let months: Vec<MonthComparison> = months
            .into_iter()
            .map(|month| {
                let b = base.get(&month);
                let s = current.get(&month);
                let baseline_net = b.map_or(0.0, |(net, _)| *net);
                let scenario_net = s.map_or(0.0, |(net, _)| *net);
                MonthComparison {
                    month,
                    baseline_net,
                    scenario_net,
                    delta: scenario_net - baseline_net,
                    baseline_balance: b.map(|(_, balance)| *balance),
                    scenario_balance: s.map(|(_, balance)| *balance),
                }
            })
            .collect();

        Ok(ScenarioComparison {
            scenario_id: scenario.id,
            baseline_id: baseline.id,
            total_delta: months.iter().map(|m| m.delta).sum(),
            closing_balance_delta: scenario.impact_metrics.closing_balance
                - baseline.impact_metrics.closing_balance,
            months,
        })
    }

    pub fn mark_alert_read(&self, scenario_id: Uuid, alert_id: Uuid, actor: &str) -> Result<Alert> {
        self.update_alert(scenario_id, alert_id, actor, AuditAction::MarkAlertRead, |alert| {
            alert.mark_read()
        })
    }

    pub fn resolve_alert(&self, scenario_id: Uuid, alert_id: Uuid, actor: &str) -> Result<Alert> {
        self.update_alert(scenario_id, alert_id, actor, AuditAction::ResolveAlert, |alert| {
            alert.resolve(actor, Utc::now())
        })
    }

    pub fn save_snapshot(
        &self,
        scenario_id: Uuid,
        actor: &str,
        label: Option<String>,
    ) -> Result<ForecastSnapshot> {
        let lock = self.scenario_lock(scenario_id);
        let _guard = acquire(&lock)?;

        let scenario = self.scenario(scenario_id)?;
        let snapshot = self.snapshots.save(
            scenario_id,
            SnapshotData::from_scenario(&scenario),
            actor,
            label,
        )?;

        self.emit(
            AuditEvent::new(actor, AuditAction::SaveSnapshot, "snapshot", snapshot.id())
                .with_details(json!({
                    "scenarioId": scenario_id.to_string(),
                    "revision": scenario.revision,
                })),
        );
        Ok(snapshot)
    }

    pub fn list_snapshots(&self, scenario_id: Uuid) -> Result<Vec<ForecastSnapshot>> {
        self.snapshots.list(scenario_id)
    }

    pub fn get_snapshot(&self, id: Uuid) -> Result<Option<ForecastSnapshot>> {
        self.snapshots.get(id)
    }

    fn update_alert(
        &self,
        scenario_id: Uuid,
        alert_id: Uuid,
        actor: &str,
        action: AuditAction,
        change: impl FnOnce(&mut Alert),
    ) -> Result<Alert> {
        let lock = self.scenario_lock(scenario_id);
        let _guard = acquire(&lock)?;

        let mut scenario = self.scenario(scenario_id)?;
        let alert = scenario
            .alerts
            .iter_mut()
            .find(|a| a.id == alert_id)
            .ok_or_else(|| TreasuryError::not_found("Alert", alert_id))?;
        change(alert);
        let updated = alert.clone();

        scenario.touch();
        self.repository.update_scenarios(vec![scenario])?;

        self.emit(
            AuditEvent::new(actor, action, "alert", alert_id)
                .with_details(json!({ "scenarioId": scenario_id.to_string() })),
        );
        Ok(updated)
    }

    /// Demotes `previous` and stores `next` as baseline in one repository write.
    /// The caller holds the scope lock.
    fn install_baseline(&self, previous: Option<Uuid>, next: &Scenario) -> Result<()> {
        match previous {
            Some(previous_id) if previous_id != next.id => {
                let lock = self.scenario_lock(previous_id);
                let _guard = acquire(&lock)?;

                let mut demoted = self.scenario(previous_id)?;
                demoted.is_baseline = false;
                demoted.touch();
                info!(
                    "Demoting scenario '{}' ({}) from baseline of {}",
                    demoted.name, demoted.id, demoted.scope
                );
                self.repository
                    .update_scenarios(vec![demoted, next.clone()])
            }
            _ => self.repository.update_scenarios(vec![next.clone()]),
        }
    }

    fn project(&self, scenario: &Scenario, forecasts: &[Forecast]) -> Result<Projection> {
        let filter = scope_filter(&scenario.scope);
        let raw = self.source.entries(&filter)?;
        let report = self.aggregation_engine().aggregate(&raw, &filter);

        let realized = BalanceEvolutionCalculator::series_from_summary(&report.consolidated);
        let projected = BalanceEvolutionCalculator::series_from_forecasts(forecasts);
        let series = BalanceEvolutionCalculator::merge_realized_and_forecast(&realized, &projected);
        let balance = BalanceEvolutionCalculator::evolve(scenario.opening_balance, &series);

        let baseline_lines = if scenario.is_baseline {
            None
        } else {
            match self.baseline(&scenario.scope)? {
                Some(baseline) if baseline.id != scenario.id => {
                    Some(self.repository.forecasts(baseline.id)?)
                }
                _ => None,
            }
        };

        let alerts = self.evaluator.evaluate(&EvaluationInput {
            summaries: &report.summaries,
            forecasts,
            baseline: baseline_lines.as_deref(),
            balance: &balance,
        });
        if !alerts.is_empty() {
            debug!(
                "Scenario {} raised {} alert(s) on evaluation",
                scenario.id,
                alerts.len()
            );
        }

        let impact_metrics = impact_metrics(
            scenario.opening_balance,
            forecasts,
            &balance,
            baseline_lines.as_deref(),
        );
        let data = balance
            .iter()
            .map(|p| ForecastDataPoint {
                month: p.date,
                receipts: p.receipts,
                payments: p.payments,
                net: p.receipts - p.payments,
                balance: p.balance,
            })
            .collect();

        Ok(Projection {
            data,
            impact_metrics,
            alerts,
            balance,
            report,
        })
    }

    fn aggregation_engine(&self) -> AggregationEngine<'_> {
        let engine = AggregationEngine::new(&self.config);
        match &self.catalog {
            Some(catalog) => engine.with_catalog(catalog.as_ref()),
            None => engine,
        }
    }

    fn check_rubrique(&self, rubrique_id: &str) -> Result<()> {
        match &self.catalog {
            Some(catalog) if !catalog.has_rubrique(rubrique_id) => Err(
                TreasuryError::validation("rubriqueId", format!("unknown rubrique '{}'", rubrique_id)),
            ),
            _ => Ok(()),
        }
    }

    fn scenario_lock(&self, id: Uuid) -> Arc<Mutex<()>> {
        self.scenario_locks
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }

    fn scope_lock(&self, scope: &ScenarioScope) -> Arc<Mutex<()>> {
        self.scope_locks
            .entry(scope.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }

    fn emit(&self, event: AuditEvent) {
        let action = event.action;
        if let Err(e) = self.audit.record(event) {
            warn!("Audit sink rejected {} event: {}", action, e);
        }
    }
}

fn scope_filter(scope: &ScenarioScope) -> AggregationFilter {
    let filter = AggregationFilter::for_plan(scope.plan_id.clone());
    match &scope.period_id {
        Some(period) => filter.with_period(period.clone()),
        None => filter,
    }
}

fn resolve_parameters(
    scenario: &Scenario,
    requested: &[ParameterValue],
) -> Result<Vec<ScenarioParameter>> {
    let mut parameters = scenario.parameters.clone();
    for value in requested {
        let declared = parameters
            .iter_mut()
            .find(|p| p.key == value.key)
            .ok_or_else(|| TreasuryError::InvalidParameter {
                key: value.key.clone(),
                value: value.value,
                details: format!("not declared on scenario '{}'", scenario.name),
            })?;
        declared.check_value(value.value)?;
        declared.value = value.value;
    }
    Ok(parameters)
}

fn net_flow(forecasts: &[Forecast], amount: impl Fn(&Forecast) -> f64) -> f64 {
    forecasts
        .iter()
        .map(|f| match f.direction {
            FlowDirection::Receipt => amount(f),
            FlowDirection::Payment => -amount(f),
        })
        .sum()
}

fn impact_metrics(
    opening_balance: f64,
    forecasts: &[Forecast],
    balance: &[BalanceEvolutionPoint],
    baseline: Option<&[Forecast]>,
) -> ImpactMetrics {
    let total_original = net_flow(forecasts, |f| f.original_amount);
    let total_adjusted = net_flow(forecasts, |f| f.adjusted_amount);
    let (total_receipts, total_payments) =
        forecasts
            .iter()
            .fold((0.0, 0.0), |(r, p), f| match f.direction {
                FlowDirection::Receipt => (r + f.adjusted_amount, p),
                FlowDirection::Payment => (r, p + f.adjusted_amount),
            });
    let baseline_net = baseline.map(|lines| net_flow(lines, |f| f.adjusted_amount));

    ImpactMetrics {
        total_original,
        total_adjusted,
        ecart: total_adjusted - total_original,
        ecart_percent: relative_change(total_adjusted, total_original),
        total_receipts,
        total_payments,
        closing_balance: balance.last().map_or(opening_balance, |p| p.balance),
        minimum_balance: balance
            .iter()
            .map(|p| p.balance)
            .reduce(f64::min)
            .unwrap_or(opening_balance),
        negative_months: balance.iter().filter(|p| p.balance < 0.0).count(),
        baseline_delta: baseline_net.map(|net| total_adjusted - net),
        baseline_delta_percent: baseline_net.map(|net| relative_change(total_adjusted, net)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::parameters::{EffectKind, ParameterEffect};
    use crate::schema::{AlertType, RawCashFlowEntry};
    use crate::store::{InMemoryRepository, StaticCashFlowSource};

    fn month(m: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, m, 1).unwrap()
    }

    fn config() -> EngineConfig {
        EngineConfig {
            parameter_effects: vec![
                ParameterEffect::new("tariff_growth", EffectKind::Proportional)
                    .for_rubriques(&["R-VENTE"]),
            ],
            ..EngineConfig::default()
        }
    }

    fn setup_with(rows: Vec<RawCashFlowEntry>) -> (ScenarioManager, Arc<MemoryAuditSink>) {
        let audit = Arc::new(MemoryAuditSink::new());
        let manager = ScenarioManager::new(
            config(),
            Arc::new(InMemoryRepository::new()),
            Arc::new(StaticCashFlowSource::new(rows)),
            audit.clone(),
        )
        .unwrap();
        (manager, audit)
    }

    fn setup() -> (ScenarioManager, Arc<MemoryAuditSink>) {
        setup_with(Vec::new())
    }

    fn tariff(value: f64) -> ScenarioParameter {
        ScenarioParameter::new("tariff_growth", value, -0.2, 0.2, 0.01)
    }

    fn lines() -> Vec<ForecastLine> {
        vec![
            ForecastLine {
                period_id: "P-01".to_string(),
                rubrique_id: "R-VENTE".to_string(),
                direction: FlowDirection::Receipt,
                month: month(1),
                original_amount: 1_000.0,
            },
            ForecastLine {
                period_id: "P-01".to_string(),
                rubrique_id: "R-ACHAT".to_string(),
                direction: FlowDirection::Payment,
                month: month(1),
                original_amount: 600.0,
            },
        ]
    }

    fn new_scenario(name: &str, is_baseline: bool, lines: Vec<ForecastLine>) -> NewScenario {
        NewScenario {
            name: name.to_string(),
            description: None,
            scenario_type: ScenarioType::Realistic,
            scope: ScenarioScope::plan("PLAN-2024"),
            parameters: vec![tariff(0.0)],
            opening_balance: 100.0,
            is_baseline,
            lines,
            actor: "tester".to_string(),
        }
    }

    fn simulate(manager: &ScenarioManager, id: Uuid, value: f64) -> Result<SimulationOutcome> {
        manager.simulate(SimulationRequest {
            scenario_id: id,
            parameters: vec![ParameterValue::new("tariff_growth", value)],
            reason: "tariff review".to_string(),
            actor: "tester".to_string(),
        })
    }

    #[test]
    fn test_create_clones_baseline_lines() {
        let (manager, audit) = setup();
        let baseline = manager.create_scenario(new_scenario("Base", true, lines())).unwrap();
        let variant = manager.create_scenario(new_scenario("Variant", false, Vec::new())).unwrap();

        let base_lines = manager.forecasts(baseline.id).unwrap();
        let variant_lines = manager.forecasts(variant.id).unwrap();
        assert_eq!(variant_lines.len(), 2);
        assert!(variant_lines.iter().all(|f| f.version == 0));
        assert!(variant_lines.iter().all(|f| f.scenario_id == variant.id));
        assert!(base_lines.iter().all(|f| f.adjusted_amount == f.original_amount));

        assert_eq!(baseline.data.len(), 1);
        assert_eq!(baseline.data[0].balance, 500.0);
        assert_eq!(audit.count(AuditAction::CreateScenario), 2);
    }

    #[test]
    fn test_lines_in_last_representable_month_keep_scope_usable() {
        let (manager, _) = setup();
        let last = crate::utils::month_start(NaiveDate::MAX);
        let mut edge_lines = lines();
        edge_lines[0].month = crate::utils::prev_month(last).unwrap();
        edge_lines[1].month = last;

        let first = manager
            .create_scenario(new_scenario("Edge", true, edge_lines))
            .unwrap();
        assert_eq!(first.data.len(), 2);
        assert_eq!(first.data[1].month, last);
        assert!((first.impact_metrics.closing_balance - 500.0).abs() < 0.01);

        let second = manager
            .create_scenario(new_scenario("Next", true, lines()))
            .unwrap();
        assert!(manager.promote_baseline(first.id, "tester").unwrap().is_baseline);
        assert!(!manager.scenario(second.id).unwrap().is_baseline);
    }

    #[test]
    fn test_simulate_applies_parameters_and_bumps_versions() {
        let (manager, audit) = setup();
        manager.create_scenario(new_scenario("Base", true, lines())).unwrap();
        let variant = manager.create_scenario(new_scenario("Variant", false, Vec::new())).unwrap();

        let outcome = simulate(&manager, variant.id, 0.05).unwrap();
        let sale = outcome
            .forecasts
            .iter()
            .find(|f| f.rubrique_id == "R-VENTE")
            .unwrap();
        assert!((sale.adjusted_amount - 1_050.0).abs() < 0.01);
        assert!(outcome.forecasts.iter().all(|f| f.version == 1));
        assert_eq!(outcome.scenario.revision, 1);
        assert_eq!(outcome.scenario.parameters[0].value, 0.05);
        assert!((outcome.scenario.impact_metrics.closing_balance - 550.0).abs() < 0.01);
        let delta = outcome.scenario.impact_metrics.baseline_delta.unwrap();
        assert!((delta - 50.0).abs() < 0.01);
        assert_eq!(audit.count(AuditAction::Simulate), 1);

        let again = simulate(&manager, variant.id, 0.05).unwrap();
        assert!(again.forecasts.iter().all(|f| f.version == 2));
        let resale = again
            .forecasts
            .iter()
            .find(|f| f.rubrique_id == "R-VENTE")
            .unwrap();
        assert_eq!(resale.adjusted_amount, sale.adjusted_amount);
    }

    #[test]
    fn test_simulate_rejects_out_of_bounds_value() {
        let (manager, audit) = setup();
        let scenario = manager.create_scenario(new_scenario("Solo", false, lines())).unwrap();

        let result = simulate(&manager, scenario.id, 0.5);
        assert!(matches!(result, Err(TreasuryError::InvalidParameter { .. })));
        let off_step = simulate(&manager, scenario.id, 0.055);
        assert!(matches!(off_step, Err(TreasuryError::InvalidParameter { .. })));

        assert!(manager
            .forecasts(scenario.id)
            .unwrap()
            .iter()
            .all(|f| f.version == 0));
        assert_eq!(manager.scenario(scenario.id).unwrap().revision, 0);
        assert_eq!(audit.count(AuditAction::Simulate), 0);
    }

    #[test]
    fn test_simulate_rejects_undeclared_parameter() {
        let (manager, _) = setup();
        let scenario = manager.create_scenario(new_scenario("Solo", false, lines())).unwrap();

        let result = manager.simulate(SimulationRequest {
            scenario_id: scenario.id,
            parameters: vec![ParameterValue::new("fx_rate", 1.0)],
            reason: "fx".to_string(),
            actor: "tester".to_string(),
        });
        assert!(matches!(
            result,
            Err(TreasuryError::InvalidParameter { ref key, .. }) if key == "fx_rate"
        ));
    }

    #[test]
    fn test_baseline_only_accepts_neutral_values() {
        let (manager, _) = setup();
        let baseline = manager.create_scenario(new_scenario("Base", true, lines())).unwrap();

        let result = simulate(&manager, baseline.id, 0.05);
        assert!(matches!(result, Err(TreasuryError::ValidationError { .. })));
        assert!(simulate(&manager, baseline.id, 0.0).is_ok());

        let mut request = new_scenario("Base 2", true, lines());
        request.parameters = vec![tariff(0.1)];
        assert!(matches!(
            manager.create_scenario(request),
            Err(TreasuryError::ValidationError { .. })
        ));
    }

    #[test]
    fn test_adjust_forecast_versions() {
        let (manager, audit) = setup();
        let scenario = manager.create_scenario(new_scenario("Solo", false, lines())).unwrap();
        let line = manager.forecasts(scenario.id).unwrap()[0].clone();

        let outcome = manager
            .adjust_forecast(AdjustForecastRequest {
                forecast_id: line.id,
                expected_version: 0,
                adjusted_amount: 750.0,
                reason: "supplier renegotiation".to_string(),
                actor: "tester".to_string(),
            })
            .unwrap();
        assert_eq!(outcome.forecast.version, 1);
        assert_eq!(outcome.forecast.original_amount, line.original_amount);
        assert_eq!(outcome.scenario.revision, 1);

        let stale = manager.adjust_forecast(AdjustForecastRequest {
            forecast_id: line.id,
            expected_version: 0,
            adjusted_amount: 800.0,
            reason: "late edit".to_string(),
            actor: "other".to_string(),
        });
        match stale {
            Err(TreasuryError::ConcurrentModification {
                expected, actual, ..
            }) => {
                assert_eq!(expected, 0);
                assert_eq!(actual, 1);
            }
            other => panic!("expected ConcurrentModification, got {:?}", other),
        }

        let missing = manager.adjust_forecast(AdjustForecastRequest {
            forecast_id: Uuid::new_v4(),
            expected_version: 0,
            adjusted_amount: 1.0,
            reason: "x".to_string(),
            actor: "tester".to_string(),
        });
        assert!(matches!(missing, Err(TreasuryError::NotFound { .. })));
        assert_eq!(audit.count(AuditAction::AdjustForecast), 1);
    }

    #[test]
    fn test_negative_amount_rejected_for_regular_rubrique() {
        let (manager, _) = setup();
        let scenario = manager.create_scenario(new_scenario("Solo", false, lines())).unwrap();
        let line = manager.forecasts(scenario.id).unwrap()[0].clone();

        let result = manager.adjust_forecast(AdjustForecastRequest {
            forecast_id: line.id,
            expected_version: 0,
            adjusted_amount: -10.0,
            reason: "typo".to_string(),
            actor: "tester".to_string(),
        });
        assert!(matches!(result, Err(TreasuryError::ValidationError { .. })));
    }

    #[test]
    fn test_referenced_baseline_cannot_be_deleted() {
        let (manager, audit) = setup();
        let baseline = manager.create_scenario(new_scenario("Base", true, lines())).unwrap();
        let variant = manager.create_scenario(new_scenario("Variant", false, Vec::new())).unwrap();

        let result = manager.delete_scenario(baseline.id, "tester");
        assert!(matches!(
            result,
            Err(TreasuryError::BaselineReferenced { dependents: 1, .. })
        ));

        manager.delete_scenario(variant.id, "tester").unwrap();
        assert!(manager.forecasts(variant.id).unwrap().is_empty());
        manager.delete_scenario(baseline.id, "tester").unwrap();
        assert!(matches!(
            manager.scenario(baseline.id),
            Err(TreasuryError::NotFound { .. })
        ));
        assert_eq!(audit.count(AuditAction::DeleteScenario), 2);
    }

    #[test]
    fn test_promote_demotes_previous_baseline() {
        let (manager, _) = setup();
        let first = manager.create_scenario(new_scenario("Base", true, lines())).unwrap();
        let second = manager.create_scenario(new_scenario("Next", false, Vec::new())).unwrap();

        let promoted = manager.promote_baseline(second.id, "tester").unwrap();
        assert!(promoted.is_baseline);
        assert!(!manager.scenario(first.id).unwrap().is_baseline);

        let baselines: Vec<_> = manager
            .scenarios(&ScenarioScope::plan("PLAN-2024"))
            .unwrap()
            .into_iter()
            .filter(|s| s.is_baseline)
            .collect();
        assert_eq!(baselines.len(), 1);
        assert_eq!(baselines[0].id, second.id);
    }

    #[test]
    fn test_promote_requires_neutral_scenario() {
        let (manager, _) = setup();
        manager.create_scenario(new_scenario("Base", true, lines())).unwrap();
        let variant = manager.create_scenario(new_scenario("Variant", false, Vec::new())).unwrap();
        simulate(&manager, variant.id, 0.1).unwrap();

        let result = manager.promote_baseline(variant.id, "tester");
        assert!(matches!(result, Err(TreasuryError::ValidationError { .. })));
    }

    #[test]
    fn test_compare_with_baseline() {
        let (manager, _) = setup();
        manager.create_scenario(new_scenario("Base", true, lines())).unwrap();
        let variant = manager.create_scenario(new_scenario("Variant", false, Vec::new())).unwrap();
        simulate(&manager, variant.id, 0.1).unwrap();

        let comparison = manager.compare_with_baseline(variant.id).unwrap();
        assert_eq!(comparison.months.len(), 1);
        assert!((comparison.months[0].delta - 100.0).abs() < 0.01);
        assert!((comparison.total_delta - 100.0).abs() < 0.01);
        assert!((comparison.closing_balance_delta - 100.0).abs() < 0.01);
    }

    #[test]
    fn test_alert_read_and_resolve() {
        let (manager, audit) = setup();
        let mut request = new_scenario("Tight", false, lines());
        request.opening_balance = -1_000.0;
        let scenario = manager.create_scenario(request).unwrap();

        let alert = scenario
            .alerts
            .iter()
            .find(|a| a.alert_type == AlertType::NegativeBalance)
            .unwrap()
            .clone();

        let read = manager.mark_alert_read(scenario.id, alert.id, "tester").unwrap();
        assert!(read.is_read);
        assert!(!read.is_resolved);

        let resolved = manager.resolve_alert(scenario.id, alert.id, "treasurer").unwrap();
        assert!(resolved.is_resolved);
        assert_eq!(resolved.resolved_by.as_deref(), Some("treasurer"));

        // Still raised by the inputs, but the stored alert keeps its state.
        let outcome = simulate(&manager, scenario.id, 0.0).unwrap();
        let kept: Vec<_> = outcome
            .scenario
            .alerts
            .iter()
            .filter(|a| a.alert_type == AlertType::NegativeBalance)
            .collect();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].id, alert.id);
        assert!(kept[0].is_resolved);

        assert!(matches!(
            manager.resolve_alert(scenario.id, Uuid::new_v4(), "tester"),
            Err(TreasuryError::NotFound { .. })
        ));
        assert_eq!(audit.count(AuditAction::ResolveAlert), 1);
        assert_eq!(audit.count(AuditAction::MarkAlertRead), 1);
    }

    #[test]
    fn test_realized_months_feed_the_balance() {
        let rows = vec![RawCashFlowEntry {
            id: None,
            domain: "Energie".to_string(),
            direction: FlowDirection::Receipt,
            rubrique_id: "R-VENTE".to_string(),
            regroupement_id: None,
            categorie_id: None,
            period_id: "P-12".to_string(),
            plan_id: "PLAN-2024".to_string(),
            date: "2023-12-15".to_string(),
            budget_amount: 200.0,
            real_amount: 250.0,
        }];
        let (manager, _) = setup_with(rows);
        let scenario = manager.create_scenario(new_scenario("Solo", false, lines())).unwrap();

        assert_eq!(scenario.data.len(), 2);
        assert_eq!(scenario.data[0].month, NaiveDate::from_ymd_opt(2023, 12, 1).unwrap());
        assert_eq!(scenario.data[0].balance, 350.0);
        assert_eq!(scenario.data[1].balance, 750.0);
    }

    #[test]
    fn test_snapshot_round_trip() {
        let (manager, audit) = setup();
        let scenario = manager.create_scenario(new_scenario("Solo", false, lines())).unwrap();

        let snapshot = manager
            .save_snapshot(scenario.id, "tester", Some("before review".to_string()))
            .unwrap();
        simulate(&manager, scenario.id, 0.2).unwrap();

        let stored = manager.get_snapshot(snapshot.id()).unwrap().unwrap();
        assert_eq!(stored.payload(), snapshot.payload());
        assert_eq!(stored.content().scenario_revision, 0);
        assert_eq!(manager.list_snapshots(scenario.id).unwrap().len(), 1);
        assert_eq!(audit.count(AuditAction::SaveSnapshot), 1);

        assert!(matches!(
            manager.save_snapshot(Uuid::new_v4(), "tester", None),
            Err(TreasuryError::NotFound { .. })
        ));
    }
}
