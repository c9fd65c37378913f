//! # Treasury Scenario Engine
//!
//! Cash-flow aggregation and forecast scenario simulation for treasury plans.
//!
//! ## Core Concepts
//!
//! - **Cash-flow entries**: Budgeted vs. realized receipts and payments, classified by
//!   domain (Energie, REM_CIE, Fonctionnement, ...) and rubrique
//! - **Aggregation**: Per-domain and consolidated summaries; the consolidated summary is
//!   always the sum of the seven domain summaries
//! - **Scenarios**: Named parameter sets applied to baseline forecast lines. Recomputation
//!   always starts from the original amount, so re-applying a parameter set is idempotent
//! - **Balance evolution**: Running balance over realized and projected months, gaps filled
//!   with zero flow
//! - **Alerts**: Budget overruns, negative balances, forecast deviations and configurable
//!   thresholds, keyed so that re-evaluation never duplicates them
//!
//! ## Example
//!
//! ```rust,ignore
//! use treasury_scenario_engine::*;
//! use chrono::NaiveDate;
//! use std::sync::Arc;
//!
//! let config = EngineConfig::from_json_str(r#"{
//!     "parameterEffects": [
//!         { "key": "tariff_growth", "kind": "proportional", "rubriques": ["R-VENTE"] }
//!     ]
//! }"#)?;
//!
//! let manager = ScenarioManager::new(
//!     config,
//!     Arc::new(InMemoryRepository::new()),
//!     Arc::new(StaticCashFlowSource::new(vec![])),
//!     Arc::new(LogAuditSink),
//! )?;
//!
//! let scenario = manager.create_scenario(NewScenario {
//!     name: "Tariff +5%".to_string(),
//!     description: None,
//!     scenario_type: ScenarioType::Optimistic,
//!     scope: ScenarioScope::plan("PLAN-2024"),
//!     parameters: vec![ScenarioParameter::new("tariff_growth", 0.0, -0.2, 0.2, 0.01)],
//!     opening_balance: 250_000.0,
//!     is_baseline: false,
//!     lines: vec![ForecastLine {
//!         period_id: "P-2024-01".to_string(),
//!         rubrique_id: "R-VENTE".to_string(),
//!         direction: FlowDirection::Receipt,
//!         month: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
//!         original_amount: 1_000_000.0,
//!     }],
//!     actor: "treasurer".to_string(),
//! })?;
//!
//! let outcome = manager.simulate(SimulationRequest {
//!     scenario_id: scenario.id,
//!     parameters: vec![ParameterValue::new("tariff_growth", 0.05)],
//!     reason: "Tariff review".to_string(),
//!     actor: "treasurer".to_string(),
//! })?;
//! assert_eq!(outcome.forecasts[0].adjusted_amount, 1_050_000.0);
//! ```

pub mod aggregation;
pub mod alerts;
pub mod audit;
pub mod balance;
pub mod config;
pub mod error;
pub mod parameters;
pub mod scenario;
pub mod schema;
pub mod snapshot;
pub mod store;
pub mod utils;

pub use aggregation::{
    check_consolidation, AggregationEngine, AggregationFilter, AggregationReport,
    ConsistencyIssue, DomainSummary, MonthlyAmount, RubriqueBreakdownRow, SummaryScope,
};
pub use alerts::{
    reconcile_alerts, AlertEvaluator, AlertRule, BudgetOverrunRule, Comparator, EvaluationInput,
    ForecastDeviationRule, Metric, NegativeBalanceRule, ThresholdRule, ThresholdRuleConfig,
};
pub use audit::{AuditAction, AuditEvent, AuditSink, LogAuditSink, MemoryAuditSink};
pub use balance::{BalanceEvolutionCalculator, BalanceEvolutionPoint, MonthlyFlow};
pub use config::{BudgetOverrunPolicy, EngineConfig, ToleranceBand};
pub use error::{Result, TreasuryError};
pub use parameters::{EffectKind, ParameterEffect, ParameterEngine};
pub use scenario::{
    AdjustForecastRequest, AdjustmentOutcome, ForecastLine, MonthComparison, NewScenario,
    ParameterValue, ScenarioComparison, ScenarioManager, SimulationOutcome, SimulationRequest,
};
pub use schema::*;
pub use snapshot::{ForecastSnapshot, SnapshotData, SnapshotStore};
pub use store::{
    CashFlowSource, InMemoryRepository, ReferenceCatalog, StaticCashFlowSource, StaticCatalog,
    TreasuryRepository,
};
pub use utils::*;

use log::{debug, info};

pub struct TreasuryProcessor;

impl TreasuryProcessor {
    /// Validates raw rows and aggregates the ones that survive. Cross-total
    /// mismatches are logged and reported, never fatal.
    pub fn aggregate(
        config: &EngineConfig,
        raw: &[RawCashFlowEntry],
        filter: &AggregationFilter,
    ) -> Result<AggregationReport> {
        config.validate()?;
        filter.validate()?;

        info!("Aggregating {} cash-flow row(s) for [{}]", raw.len(), filter);
        let report = AggregationEngine::new(config).aggregate(raw, filter);

        for warning in &report.warnings {
            debug!("Excluded entry: {}", warning);
        }

        Ok(report)
    }

    /// Like [`TreasuryProcessor::aggregate`], but fails with `ConsistencyError`
    /// on the first cross-total mismatch.
    pub fn aggregate_with_verification(
        config: &EngineConfig,
        raw: &[RawCashFlowEntry],
        filter: &AggregationFilter,
    ) -> Result<AggregationReport> {
        let report = Self::aggregate(config, raw, filter)?;

        if let Some(issue) = report.consistency_issues.first() {
            return Err(TreasuryError::ConsistencyError {
                scope: filter.to_string(),
                field: issue.field.clone(),
                expected: issue.expected,
                actual: issue.actual,
            });
        }

        Ok(report)
    }
}

pub fn aggregate_cash_flows(
    config: &EngineConfig,
    raw: &[RawCashFlowEntry],
    filter: &AggregationFilter,
) -> Result<AggregationReport> {
    TreasuryProcessor::aggregate(config, raw, filter)
}

pub fn aggregate_with_verification(
    config: &EngineConfig,
    raw: &[RawCashFlowEntry],
    filter: &AggregationFilter,
) -> Result<AggregationReport> {
    TreasuryProcessor::aggregate_with_verification(config, raw, filter)
}
