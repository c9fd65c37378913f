use crate::error::{Result, TreasuryError};
use crate::utils::parse_entry_date;
use chrono::{DateTime, NaiveDate, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

const STEP_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, JsonSchema)]
pub enum Domain {
    #[schemars(description = "Electricity purchases and resale")]
    Energie,

    #[serde(rename = "REM_CIE")]
    #[schemars(description = "Remittances to and from the parent company")]
    RemCie,

    #[schemars(description = "Operating costs: salaries, rent, suppliers")]
    Fonctionnement,

    #[schemars(description = "Bank fees and financial services")]
    ServiceBancaire,

    #[schemars(description = "Taxes and duties")]
    Impot,

    #[schemars(description = "Ancillary flows not covered by another domain")]
    Annexe,

    #[schemars(description = "Gas purchases and resale")]
    Gaz,
}

impl Domain {
    pub const ALL: [Domain; 7] = [
        Domain::Energie,
        Domain::RemCie,
        Domain::Fonctionnement,
        Domain::ServiceBancaire,
        Domain::Impot,
        Domain::Annexe,
        Domain::Gaz,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Energie => "Energie",
            Domain::RemCie => "REM_CIE",
            Domain::Fonctionnement => "Fonctionnement",
            Domain::ServiceBancaire => "ServiceBancaire",
            Domain::Impot => "Impot",
            Domain::Annexe => "Annexe",
            Domain::Gaz => "Gaz",
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Domain {
    type Err = TreasuryError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim();
        Domain::ALL
            .into_iter()
            .find(|d| d.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| TreasuryError::validation("domain", format!("unknown domain '{}'", s)))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowDirection {
    Receipt,
    Payment,
}

/// One recorded cash flow, owned by a period within a plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CashFlowEntry {
    pub id: Uuid,
    pub domain: Domain,
    pub direction: FlowDirection,
    pub rubrique_id: String,
    pub regroupement_id: Option<String>,
    pub categorie_id: Option<String>,
    pub period_id: String,
    pub plan_id: String,
    pub date: NaiveDate,
    pub budget_amount: f64,
    pub real_amount: f64,
    /// `real_amount - budget_amount`
    pub ecart: f64,
    /// `ecart / budget_amount`, 0 when nothing was budgeted
    pub ecart_percent: f64,
}

impl CashFlowEntry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        domain: Domain,
        direction: FlowDirection,
        rubrique_id: impl Into<String>,
        period_id: impl Into<String>,
        plan_id: impl Into<String>,
        date: NaiveDate,
        budget_amount: f64,
        real_amount: f64,
    ) -> Self {
        let (ecart, ecart_percent) = compute_ecart(budget_amount, real_amount);
        Self {
            id: Uuid::new_v4(),
            domain,
            direction,
            rubrique_id: rubrique_id.into(),
            regroupement_id: None,
            categorie_id: None,
            period_id: period_id.into(),
            plan_id: plan_id.into(),
            date,
            budget_amount,
            real_amount,
            ecart,
            ecart_percent,
        }
    }

    pub fn with_classification(
        mut self,
        regroupement_id: impl Into<String>,
        categorie_id: Option<String>,
    ) -> Self {
        self.regroupement_id = Some(regroupement_id.into());
        self.categorie_id = categorie_id;
        self
    }

    /// Manual edit of the amounts; the derived variance fields follow.
    pub fn apply_manual_edit(&mut self, budget_amount: f64, real_amount: f64) {
        let (ecart, ecart_percent) = compute_ecart(budget_amount, real_amount);
        self.budget_amount = budget_amount;
        self.real_amount = real_amount;
        self.ecart = ecart;
        self.ecart_percent = ecart_percent;
    }
}

fn compute_ecart(budget_amount: f64, real_amount: f64) -> (f64, f64) {
    let ecart = real_amount - budget_amount;
    let percent = if budget_amount == 0.0 {
        0.0
    } else {
        ecart / budget_amount
    };
    (ecart, percent)
}

/// The untyped shape delivered by the cash-flow read interface.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RawCashFlowEntry {
    #[serde(default)]
    pub id: Option<Uuid>,
    pub domain: String,
    pub direction: FlowDirection,
    pub rubrique_id: String,
    #[serde(default)]
    pub regroupement_id: Option<String>,
    #[serde(default)]
    pub categorie_id: Option<String>,
    pub period_id: String,
    pub plan_id: String,
    #[schemars(description = "YYYY-MM-DD, or YYYY-MM for month-level entries")]
    pub date: String,
    pub budget_amount: f64,
    pub real_amount: f64,
}

impl RawCashFlowEntry {
    pub fn validate(&self) -> std::result::Result<CashFlowEntry, DataQualityWarning> {
        let domain = Domain::from_str(&self.domain).map_err(|_| DataQualityWarning {
            entry_id: self.id,
            field: "domain".to_string(),
            value: self.domain.clone(),
            message: format!("unknown domain '{}'", self.domain),
        })?;

        let date = parse_entry_date(&self.date).map_err(|e| DataQualityWarning {
            entry_id: self.id,
            field: "date".to_string(),
            value: self.date.clone(),
            message: e.to_string(),
        })?;

        for (field, amount) in [
            ("budgetAmount", self.budget_amount),
            ("realAmount", self.real_amount),
        ] {
            if !amount.is_finite() {
                return Err(DataQualityWarning {
                    entry_id: self.id,
                    field: field.to_string(),
                    value: amount.to_string(),
                    message: "amount is not a finite number".to_string(),
                });
            }
        }

        let mut entry = CashFlowEntry::new(
            domain,
            self.direction,
            self.rubrique_id.clone(),
            self.period_id.clone(),
            self.plan_id.clone(),
            date,
            self.budget_amount,
            self.real_amount,
        );
        if let Some(id) = self.id {
            entry.id = id;
        }
        entry.regroupement_id = self.regroupement_id.clone();
        entry.categorie_id = self.categorie_id.clone();
        Ok(entry)
    }
}

/// An entry excluded from aggregation, reported next to the result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DataQualityWarning {
    pub entry_id: Option<Uuid>,
    pub field: String,
    pub value: String,
    pub message: String,
}

impl fmt::Display for DataQualityWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.entry_id {
            Some(id) => write!(f, "entry {}: {} ({} = '{}')", id, self.message, self.field, self.value),
            None => write!(f, "entry: {} ({} = '{}')", self.message, self.field, self.value),
        }
    }
}

/// One projected line item of a scenario.
///
/// `original_amount` is the baseline and is never touched after creation;
/// every recomputation starts from it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Forecast {
    pub id: Uuid,
    pub scenario_id: Uuid,
    pub period_id: String,
    pub rubrique_id: String,
    pub direction: FlowDirection,
    /// First day of the month the line projects.
    pub month: NaiveDate,
    pub original_amount: f64,
    pub adjusted_amount: f64,
    pub version: u64,
    pub adjustment_reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Forecast {
    pub fn new(
        scenario_id: Uuid,
        period_id: impl Into<String>,
        rubrique_id: impl Into<String>,
        direction: FlowDirection,
        month: NaiveDate,
        original_amount: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            scenario_id,
            period_id: period_id.into(),
            rubrique_id: rubrique_id.into(),
            direction,
            month: crate::utils::month_start(month),
            original_amount,
            adjusted_amount: original_amount,
            version: 0,
            adjustment_reason: None,
            updated_at: Utc::now(),
        }
    }

    pub fn ecart(&self) -> f64 {
        self.adjusted_amount - self.original_amount
    }

    /// Fresh version-0 copy of this line for another scenario.
    pub fn rebased_for(&self, scenario_id: Uuid) -> Self {
        Self::new(
            scenario_id,
            self.period_id.clone(),
            self.rubrique_id.clone(),
            self.direction,
            self.month,
            self.original_amount,
        )
    }

    /// Key pairing a line with its counterpart in another scenario.
    pub fn line_key(&self) -> (String, String, NaiveDate) {
        (self.period_id.clone(), self.rubrique_id.clone(), self.month)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioParameter {
    pub key: String,
    #[serde(default)]
    pub label: Option<String>,
    pub value: f64,
    pub min: f64,
    pub max: f64,
    pub step: f64,
    #[serde(default)]
    pub unit: String,
}

impl ScenarioParameter {
    pub fn new(key: impl Into<String>, value: f64, min: f64, max: f64, step: f64) -> Self {
        Self {
            key: key.into(),
            label: None,
            value,
            min,
            max,
            step,
            unit: String::new(),
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    /// Checks `min <= value <= max` and that `value` sits on the step grid from `min`.
    pub fn validate(&self) -> Result<()> {
        self.check_value(self.value)
    }

    pub fn check_value(&self, value: f64) -> Result<()> {
        let invalid = |details: String| TreasuryError::InvalidParameter {
            key: self.key.clone(),
            value,
            details,
        };

        if !value.is_finite() {
            return Err(invalid("value is not a finite number".to_string()));
        }
        if self.min > self.max {
            return Err(invalid(format!(
                "declared bounds are inverted: min {} > max {}",
                self.min, self.max
            )));
        }
        if self.step <= 0.0 {
            return Err(invalid(format!("step must be positive, got {}", self.step)));
        }
        if value < self.min || value > self.max {
            return Err(invalid(format!(
                "outside bounds [{}, {}]",
                self.min, self.max
            )));
        }

        let steps = (value - self.min) / self.step;
        if (steps - steps.round()).abs() > STEP_TOLERANCE {
            return Err(invalid(format!(
                "not aligned to step {} from min {}",
                self.step, self.min
            )));
        }

        Ok(())
    }

    pub fn is_neutral(&self, neutral_value: f64) -> bool {
        (self.value - neutral_value).abs() <= STEP_TOLERANCE * self.step.abs().max(1.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ScenarioType {
    Realistic,
    Optimistic,
    Pessimistic,
}

/// The plan/period window a scenario belongs to; at most one baseline per scope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioScope {
    pub plan_id: String,
    #[serde(default)]
    pub period_id: Option<String>,
}

impl ScenarioScope {
    pub fn plan(plan_id: impl Into<String>) -> Self {
        Self {
            plan_id: plan_id.into(),
            period_id: None,
        }
    }
}

impl fmt::Display for ScenarioScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.period_id {
            Some(period) => write!(f, "{}/{}", self.plan_id, period),
            None => f.write_str(&self.plan_id),
        }
    }
}

/// One month of a scenario projection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ForecastDataPoint {
    pub month: NaiveDate,
    pub receipts: f64,
    pub payments: f64,
    pub net: f64,
    pub balance: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImpactMetrics {
    pub total_original: f64,
    pub total_adjusted: f64,
    /// `total_adjusted - total_original`
    pub ecart: f64,
    pub ecart_percent: f64,
    pub total_receipts: f64,
    pub total_payments: f64,
    pub closing_balance: f64,
    pub minimum_balance: f64,
    pub negative_months: usize,
    /// Net projected flow minus the baseline's, absent for the baseline itself.
    pub baseline_delta: Option<f64>,
    pub baseline_delta_percent: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Scenario {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub scenario_type: ScenarioType,
    pub scope: ScenarioScope,
    pub is_baseline: bool,
    pub parameters: Vec<ScenarioParameter>,
    pub opening_balance: f64,
    pub data: Vec<ForecastDataPoint>,
    pub impact_metrics: ImpactMetrics,
    pub alerts: Vec<Alert>,
    /// Bumped on every committed mutation.
    pub revision: u64,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Scenario {
    pub fn new(
        name: impl Into<String>,
        scenario_type: ScenarioType,
        scope: ScenarioScope,
        parameters: Vec<ScenarioParameter>,
        opening_balance: f64,
        created_by: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: None,
            scenario_type,
            scope,
            is_baseline: false,
            parameters,
            opening_balance,
            data: Vec::new(),
            impact_metrics: ImpactMetrics::default(),
            alerts: Vec::new(),
            revision: 0,
            created_by: created_by.into(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn parameter(&self, key: &str) -> Option<&ScenarioParameter> {
        self.parameters.iter().find(|p| p.key == key)
    }

    pub fn touch(&mut self) {
        self.revision += 1;
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertType {
    ThresholdExceeded,
    NegativeBalance,
    BudgetOverrun,
    ForecastDeviation,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

/// Identity of an alert across evaluations: type + resource + period.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AlertKey {
    pub alert_type: AlertType,
    pub resource: String,
    pub period: Option<NaiveDate>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: Uuid,
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    /// What the alert is about, e.g. `rubrique:R-12` or `balance`.
    pub resource: String,
    pub period: Option<NaiveDate>,
    pub message: String,
    pub threshold: Option<f64>,
    pub current_value: Option<f64>,
    pub is_read: bool,
    pub is_resolved: bool,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Alert {
    pub fn new(
        alert_type: AlertType,
        severity: AlertSeverity,
        resource: impl Into<String>,
        period: Option<NaiveDate>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            alert_type,
            severity,
            resource: resource.into(),
            period,
            message: message.into(),
            threshold: None,
            current_value: None,
            is_read: false,
            is_resolved: false,
            resolved_by: None,
            resolved_at: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_values(mut self, threshold: f64, current_value: f64) -> Self {
        self.threshold = Some(threshold);
        self.current_value = Some(current_value);
        self
    }

    pub fn key(&self) -> AlertKey {
        AlertKey {
            alert_type: self.alert_type,
            resource: self.resource.clone(),
            period: self.period,
        }
    }

    pub fn mark_read(&mut self) {
        self.is_read = true;
    }

    pub fn resolve(&mut self, actor: impl Into<String>, at: DateTime<Utc>) {
        self.is_read = true;
        self.is_resolved = true;
        self.resolved_by = Some(actor.into());
        self.resolved_at = Some(at);
    }
}
