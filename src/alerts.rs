//! Threshold rules over aggregation, forecast and balance output.
//!
//! Every rule is a small stateless `AlertRule`; the evaluator runs the
//! registered rules and returns the alert set the current inputs warrant.
//! Reconciling that set with alerts already stored is done by
//! [`reconcile_alerts`].

use crate::aggregation::{DomainSummary, SummaryScope};
use crate::balance::BalanceEvolutionPoint;
use crate::config::{BudgetOverrunPolicy, EngineConfig};
use crate::schema::{Alert, AlertKey, AlertSeverity, AlertType, Domain, FlowDirection, Forecast};
use crate::utils::relative_change;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum Metric {
    SoldeNet,
    TotalEncaissements,
    TotalDecaissements,
    ClosingBalance,
    MinimumBalance,
    #[schemars(description = "Net adjusted forecast: receipts minus payments")]
    TotalAdjustedForecast,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum Comparator {
    Gt,
    Gte,
    Lt,
    Lte,
}

impl Comparator {
    pub fn holds(&self, value: f64, threshold: f64) -> bool {
        match self {
            Comparator::Gt => value > threshold,
            Comparator::Gte => value >= threshold,
            Comparator::Lt => value < threshold,
            Comparator::Lte => value <= threshold,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ThresholdRuleConfig {
    pub name: String,
    pub metric: Metric,
    pub comparator: Comparator,
    pub threshold: f64,
    pub severity: AlertSeverity,
    #[serde(default)]
    #[schemars(description = "Restrict summary metrics to one domain; consolidated otherwise")]
    pub domain: Option<Domain>,
}

/// Everything a rule may look at.
#[derive(Debug, Clone, Copy)]
pub struct EvaluationInput<'a> {
    pub summaries: &'a [DomainSummary],
    pub forecasts: &'a [Forecast],
    /// Baseline lines to compare against; `None` compares with originals.
    pub baseline: Option<&'a [Forecast]>,
    pub balance: &'a [BalanceEvolutionPoint],
}

pub trait AlertRule: Send + Sync {
    fn name(&self) -> &str;
    fn evaluate(&self, input: &EvaluationInput<'_>) -> Vec<Alert>;
}

pub struct BudgetOverrunRule {
    policy: BudgetOverrunPolicy,
}

impl BudgetOverrunRule {
    pub fn new(policy: BudgetOverrunPolicy) -> Self {
        Self { policy }
    }
}

impl AlertRule for BudgetOverrunRule {
    fn name(&self) -> &str {
        "budget_overrun"
    }

    fn evaluate(&self, input: &EvaluationInput<'_>) -> Vec<Alert> {
        let mut alerts = Vec::new();
        for summary in input.summaries {
            let SummaryScope::Domain(domain) = summary.scope else {
                continue;
            };
            for row in summary
                .rubriques
                .iter()
                .filter(|r| r.direction == FlowDirection::Payment)
            {
                let band = self.policy.band_for(&row.rubrique_id);
                let (severity, threshold) = if row.ecart_percent > band.critical {
                    (AlertSeverity::Critical, band.critical)
                } else if row.ecart_percent > band.warning {
                    (AlertSeverity::Warning, band.warning)
                } else {
                    continue;
                };

                alerts.push(
                    Alert::new(
                        AlertType::BudgetOverrun,
                        severity,
                        format!("{}/rubrique:{}", domain, row.rubrique_id),
                        None,
                        format!(
                            "{} spending on {} is {:.1}% over budget ({:.2} vs {:.2})",
                            domain,
                            row.rubrique_id,
                            row.ecart_percent * 100.0,
                            row.total,
                            row.budget_total
                        ),
                    )
                    .with_values(threshold, row.ecart_percent),
                );
            }
        }
        alerts
    }
}

pub struct NegativeBalanceRule;

impl AlertRule for NegativeBalanceRule {
    fn name(&self) -> &str {
        "negative_balance"
    }

    fn evaluate(&self, input: &EvaluationInput<'_>) -> Vec<Alert> {
        input
            .balance
            .iter()
            .filter(|p| p.balance < 0.0)
            .map(|p| {
                Alert::new(
                    AlertType::NegativeBalance,
                    AlertSeverity::Critical,
                    "balance",
                    Some(p.date),
                    format!(
                        "Projected balance for {} is negative ({:.2})",
                        p.date.format("%Y-%m"),
                        p.balance
                    ),
                )
                .with_values(0.0, p.balance)
            })
            .collect()
    }
}

pub struct ForecastDeviationRule {
    deviation: f64,
}

impl ForecastDeviationRule {
    pub fn new(deviation: f64) -> Self {
        Self { deviation }
    }
}

impl AlertRule for ForecastDeviationRule {
    fn name(&self) -> &str {
        "forecast_deviation"
    }

    fn evaluate(&self, input: &EvaluationInput<'_>) -> Vec<Alert> {
        let reference: Option<HashMap<_, f64>> = input.baseline.map(|lines| {
            lines
                .iter()
                .map(|f| (f.line_key(), f.adjusted_amount))
                .collect()
        });

        let mut alerts = Vec::new();
        for forecast in input.forecasts {
            let base = match &reference {
                Some(lines) => match lines.get(&forecast.line_key()) {
                    Some(amount) => *amount,
                    None => continue,
                },
                None => forecast.original_amount,
            };
            if base == 0.0 {
                continue;
            }

            let deviation = relative_change(forecast.adjusted_amount, base);
            if deviation.abs() <= self.deviation {
                continue;
            }

            alerts.push(
                Alert::new(
                    AlertType::ForecastDeviation,
                    AlertSeverity::Warning,
                    format!("forecast:{}", forecast.rubrique_id),
                    Some(forecast.month),
                    format!(
                        "{} for {} deviates {:+.1}% from the reference ({:.2} vs {:.2})",
                        forecast.rubrique_id,
                        forecast.month.format("%Y-%m"),
                        deviation * 100.0,
                        forecast.adjusted_amount,
                        base
                    ),
                )
                .with_values(self.deviation, deviation),
            );
        }
        alerts
    }
}

pub struct ThresholdRule {
    config: ThresholdRuleConfig,
}

impl ThresholdRule {
    pub fn new(config: ThresholdRuleConfig) -> Self {
        Self { config }
    }

    fn measure(&self, input: &EvaluationInput<'_>) -> Option<f64> {
        match self.config.metric {
            Metric::SoldeNet => self.summary_value(input, |s| s.solde_net),
            Metric::TotalEncaissements => self.summary_value(input, |s| s.total_encaissements),
            Metric::TotalDecaissements => self.summary_value(input, |s| s.total_decaissements),
            Metric::ClosingBalance => input.balance.last().map(|p| p.balance),
            Metric::MinimumBalance => input
                .balance
                .iter()
                .map(|p| p.balance)
                .reduce(f64::min),
            Metric::TotalAdjustedForecast => {
                if input.forecasts.is_empty() {
                    return None;
                }
                Some(
                    input
                        .forecasts
                        .iter()
                        .map(|f| match f.direction {
                            FlowDirection::Receipt => f.adjusted_amount,
                            FlowDirection::Payment => -f.adjusted_amount,
                        })
                        .sum(),
                )
            }
        }
    }

    fn summary_value(
        &self,
        input: &EvaluationInput<'_>,
        field: impl Fn(&DomainSummary) -> f64,
    ) -> Option<f64> {
        if let Some(domain) = self.config.domain {
            return input
                .summaries
                .iter()
                .find(|s| s.scope == SummaryScope::Domain(domain))
                .map(field);
        }
        if let Some(consolidated) = input
            .summaries
            .iter()
            .find(|s| s.scope == SummaryScope::Consolidated)
        {
            return Some(field(consolidated));
        }
        if input.summaries.is_empty() {
            return None;
        }
        Some(input.summaries.iter().map(field).sum())
    }
}

impl AlertRule for ThresholdRule {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn evaluate(&self, input: &EvaluationInput<'_>) -> Vec<Alert> {
        let Some(value) = self.measure(input) else {
            return Vec::new();
        };
        if !self.config.comparator.holds(value, self.config.threshold) {
            return Vec::new();
        }

        let resource = match self.config.domain {
            Some(domain) => format!("metric:{}/{}", self.config.name, domain),
            None => format!("metric:{}", self.config.name),
        };
        vec![Alert::new(
            AlertType::ThresholdExceeded,
            self.config.severity,
            resource,
            None,
            format!(
                "{}: {:?} is {:.2} ({:?} {:.2})",
                self.config.name,
                self.config.metric,
                value,
                self.config.comparator,
                self.config.threshold
            ),
        )
        .with_values(self.config.threshold, value)]
    }
}

/// Registry of alert rules.
pub struct AlertEvaluator {
    rules: Vec<Box<dyn AlertRule>>,
}

impl AlertEvaluator {
    /// Built-in rules plus the configured threshold rules.
    pub fn from_config(config: &EngineConfig) -> Self {
        let mut rules: Vec<Box<dyn AlertRule>> = vec![
            Box::new(BudgetOverrunRule::new(config.budget_overrun.clone())),
            Box::new(NegativeBalanceRule),
            Box::new(ForecastDeviationRule::new(config.forecast_deviation)),
        ];
        rules.extend(
            config
                .threshold_rules
                .iter()
                .cloned()
                .map(|r| Box::new(ThresholdRule::new(r)) as Box<dyn AlertRule>),
        );
        Self { rules }
    }

    pub fn with_rules(rules: Vec<Box<dyn AlertRule>>) -> Self {
        Self { rules }
    }

    pub fn register(&mut self, rule: Box<dyn AlertRule>) {
        self.rules.push(rule);
    }

    pub fn rule_names(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    /// One alert per key, the most severe when several rules agree, ordered by key.
    pub fn evaluate(&self, input: &EvaluationInput<'_>) -> Vec<Alert> {
        let mut by_key: BTreeMap<AlertKey, Alert> = BTreeMap::new();
        for rule in &self.rules {
            for alert in rule.evaluate(input) {
                match by_key.get(&alert.key()) {
                    Some(existing) if existing.severity >= alert.severity => {}
                    _ => {
                        by_key.insert(alert.key(), alert);
                    }
                }
            }
        }
        by_key.into_values().collect()
    }
}

/// Merges freshly evaluated alerts into the stored set.
///
/// Stored alerts are never dropped. An unresolved stored alert whose key is
/// raised again takes the fresh severity, values and message but keeps its id
/// and read state; fresh alerts with unseen keys are appended.
pub fn reconcile_alerts(stored: &[Alert], fresh: Vec<Alert>) -> Vec<Alert> {
    let mut fresh_by_key: HashMap<AlertKey, Alert> =
        fresh.into_iter().map(|a| (a.key(), a)).collect();
    let mut seen: HashSet<AlertKey> = HashSet::new();
    let mut merged = Vec::with_capacity(stored.len() + fresh_by_key.len());

    for alert in stored {
        let key = alert.key();
        let mut kept = alert.clone();
        if !kept.is_resolved {
            if let Some(update) = fresh_by_key.get(&key) {
                kept.severity = update.severity;
                kept.threshold = update.threshold;
                kept.current_value = update.current_value;
                kept.message = update.message.clone();
            }
        }
        seen.insert(key);
        merged.push(kept);
    }

    let mut additions: Vec<Alert> = fresh_by_key
        .drain()
        .filter(|(key, _)| !seen.contains(key))
        .map(|(_, alert)| alert)
        .collect();
    additions.sort_by_key(|a| a.key());
    merged.extend(additions);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::{AggregationEngine, AggregationFilter};
    use crate::balance::{BalanceEvolutionCalculator, MonthlyFlow};
    use crate::schema::CashFlowEntry;
    use chrono::{NaiveDate, Utc};
    use uuid::Uuid;

    fn month(y: i32, m: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, 1).unwrap()
    }

    fn no_input<'a>() -> EvaluationInput<'a> {
        EvaluationInput {
            summaries: &[],
            forecasts: &[],
            baseline: None,
            balance: &[],
        }
    }

    #[test]
    fn test_negative_balance_example() {
        let evaluator = AlertEvaluator::from_config(&EngineConfig::default());
        let balance = BalanceEvolutionCalculator::evolve(
            0.0,
            &[
                MonthlyFlow::new(month(2024, 1), 100.0, 50.0),
                MonthlyFlow::new(month(2024, 2), 100.0, 200.0),
            ],
        );

        let alerts = evaluator.evaluate(&EvaluationInput {
            balance: &balance,
            ..no_input()
        });
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, AlertType::NegativeBalance);
        assert_eq!(alerts[0].severity, AlertSeverity::Critical);
        assert_eq!(alerts[0].period, Some(month(2024, 2)));
        assert_eq!(alerts[0].current_value, Some(-50.0));
    }

    #[test]
    fn test_budget_overrun_bands() {
        let config = EngineConfig::default();
        let engine = AggregationEngine::new(&config);
        let on = NaiveDate::from_ymd_opt(2024, 1, 10).unwrap();
        let entries = vec![
            CashFlowEntry::new(Domain::Fonctionnement, FlowDirection::Payment, "R-LOYER", "P", "PL", on, 100.0, 115.0),
            CashFlowEntry::new(Domain::Fonctionnement, FlowDirection::Payment, "R-SALAIRE", "P", "PL", on, 100.0, 140.0),
            CashFlowEntry::new(Domain::Fonctionnement, FlowDirection::Payment, "R-EAU", "P", "PL", on, 100.0, 105.0),
            CashFlowEntry::new(Domain::Fonctionnement, FlowDirection::Receipt, "R-VENTE", "P", "PL", on, 100.0, 300.0),
        ];
        let report = engine.aggregate_entries(&entries, &AggregationFilter::all());

        let evaluator = AlertEvaluator::from_config(&config);
        let alerts = evaluator.evaluate(&EvaluationInput {
            summaries: &report.summaries,
            ..no_input()
        });

        assert_eq!(alerts.len(), 2);
        let loyer = alerts.iter().find(|a| a.resource.ends_with("R-LOYER")).unwrap();
        assert_eq!(loyer.severity, AlertSeverity::Warning);
        let salaire = alerts.iter().find(|a| a.resource.ends_with("R-SALAIRE")).unwrap();
        assert_eq!(salaire.severity, AlertSeverity::Critical);
        assert_eq!(salaire.threshold, Some(0.25));
    }

    #[test]
    fn test_forecast_deviation_against_baseline() {
        let baseline_id = Uuid::new_v4();
        let scenario_id = Uuid::new_v4();
        let base = Forecast::new(baseline_id, "P-1", "R-VENTE", FlowDirection::Receipt, month(2024, 1), 1000.0);
        let mut close = base.rebased_for(scenario_id);
        close.adjusted_amount = 1050.0;
        let other_base = Forecast::new(baseline_id, "P-2", "R-VENTE", FlowDirection::Receipt, month(2024, 2), 1000.0);
        let mut far = other_base.rebased_for(scenario_id);
        far.adjusted_amount = 1300.0;

        let baseline = vec![base, other_base];
        let scenario = vec![close, far];
        let evaluator = AlertEvaluator::from_config(&EngineConfig::default());
        let alerts = evaluator.evaluate(&EvaluationInput {
            forecasts: &scenario,
            baseline: Some(&baseline),
            ..no_input()
        });

        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, AlertType::ForecastDeviation);
        assert_eq!(alerts[0].period, Some(month(2024, 2)));
        assert_eq!(alerts[0].severity, AlertSeverity::Warning);
    }

    #[test]
    fn test_forecast_deviation_without_baseline_uses_originals() {
        let scenario_id = Uuid::new_v4();
        let mut steady = Forecast::new(scenario_id, "P-1", "R-VENTE", FlowDirection::Receipt, month(2024, 1), 500.0);
        steady.adjusted_amount = 540.0;
        let mut jump = Forecast::new(scenario_id, "P-1", "R-ACHAT", FlowDirection::Payment, month(2024, 1), 200.0);
        jump.adjusted_amount = 260.0;
        let mut from_zero = Forecast::new(scenario_id, "P-2", "R-PRIME", FlowDirection::Payment, month(2024, 2), 0.0);
        from_zero.adjusted_amount = 100.0;

        let forecasts = vec![steady, jump, from_zero];
        let alerts = ForecastDeviationRule::new(0.10).evaluate(&EvaluationInput {
            forecasts: &forecasts,
            baseline: None,
            ..no_input()
        });

        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].resource, "forecast:R-ACHAT");
        assert_eq!(alerts[0].period, Some(month(2024, 1)));
        assert!((alerts[0].current_value.unwrap() - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_threshold_rule_on_closing_balance() {
        let config = EngineConfig {
            threshold_rules: vec![ThresholdRuleConfig {
                name: "min_cash".to_string(),
                metric: Metric::ClosingBalance,
                comparator: Comparator::Lt,
                threshold: 1_000.0,
                severity: AlertSeverity::Info,
                domain: None,
            }],
            ..EngineConfig::default()
        };
        let evaluator = AlertEvaluator::from_config(&config);
        assert!(evaluator.rule_names().contains(&"min_cash"));

        let balance = BalanceEvolutionCalculator::evolve(
            900.0,
            &[MonthlyFlow::new(month(2024, 1), 50.0, 0.0)],
        );
        let alerts = evaluator.evaluate(&EvaluationInput {
            balance: &balance,
            ..no_input()
        });
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, AlertType::ThresholdExceeded);
        assert_eq!(alerts[0].severity, AlertSeverity::Info);
        assert_eq!(alerts[0].current_value, Some(950.0));
    }

    #[test]
    fn test_evaluation_is_idempotent_by_key() {
        let evaluator = AlertEvaluator::from_config(&EngineConfig::default());
        let balance = BalanceEvolutionCalculator::evolve(
            -10.0,
            &[
                MonthlyFlow::new(month(2024, 1), 0.0, 0.0),
                MonthlyFlow::new(month(2024, 2), 0.0, 0.0),
            ],
        );
        let input = EvaluationInput {
            balance: &balance,
            ..no_input()
        };

        let first = evaluator.evaluate(&input);
        let second = evaluator.evaluate(&input);
        let first_keys: Vec<_> = first.iter().map(|a| a.key()).collect();
        let second_keys: Vec<_> = second.iter().map(|a| a.key()).collect();
        assert_eq!(first_keys, second_keys);

        let stored = reconcile_alerts(&[], first);
        let again = reconcile_alerts(&stored, second);
        assert_eq!(again.len(), 2);
        assert_eq!(again[0].id, stored[0].id);
    }

    #[test]
    fn test_reconcile_keeps_resolved_alerts() {
        let mut resolved = Alert::new(
            AlertType::NegativeBalance,
            AlertSeverity::Critical,
            "balance",
            Some(month(2024, 1)),
            "old",
        );
        resolved.resolve("treasurer", Utc::now());
        let gone = Alert::new(
            AlertType::ForecastDeviation,
            AlertSeverity::Warning,
            "forecast:R-1",
            Some(month(2024, 3)),
            "no longer raised",
        );
        let fresh = vec![Alert::new(
            AlertType::NegativeBalance,
            AlertSeverity::Critical,
            "balance",
            Some(month(2024, 1)),
            "new",
        )];

        let merged = reconcile_alerts(&[resolved.clone(), gone.clone()], fresh);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].id, resolved.id);
        assert!(merged[0].is_resolved);
        assert_eq!(merged[0].message, "old");
        assert_eq!(merged[1].id, gone.id);
    }

    struct AlwaysInfo;

    impl AlertRule for AlwaysInfo {
        fn name(&self) -> &str {
            "always"
        }

        fn evaluate(&self, _input: &EvaluationInput<'_>) -> Vec<Alert> {
            vec![Alert::new(
                AlertType::ThresholdExceeded,
                AlertSeverity::Info,
                "custom",
                None,
                "custom rule",
            )]
        }
    }

    #[test]
    fn test_custom_rules_are_additive() {
        let mut evaluator = AlertEvaluator::with_rules(Vec::new());
        assert!(evaluator.evaluate(&no_input()).is_empty());
        evaluator.register(Box::new(AlwaysInfo));
        assert_eq!(evaluator.evaluate(&no_input()).len(), 1);
    }
}
