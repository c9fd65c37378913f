use crate::config::EngineConfig;
use crate::error::{Result, TreasuryError};
use crate::schema::{CashFlowEntry, DataQualityWarning, Domain, FlowDirection, RawCashFlowEntry};
use crate::store::ReferenceCatalog;
use crate::utils::{month_start, prev_month, relative_change};
use chrono::{Datelike, NaiveDate};
use log::{debug, info, warn};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AggregationFilter {
    pub plan_id: Option<String>,
    pub period_id: Option<String>,
    pub year: Option<i32>,
    #[schemars(description = "Calendar month 1-12, only meaningful together with year")]
    pub month: Option<u32>,
    pub domain: Option<Domain>,
}

impl AggregationFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_plan(plan_id: impl Into<String>) -> Self {
        Self {
            plan_id: Some(plan_id.into()),
            ..Self::default()
        }
    }

    pub fn for_year(year: i32) -> Self {
        Self {
            year: Some(year),
            ..Self::default()
        }
    }

    pub fn for_month(year: i32, month: u32) -> Self {
        Self {
            year: Some(year),
            month: Some(month),
            ..Self::default()
        }
    }

    pub fn with_period(mut self, period_id: impl Into<String>) -> Self {
        self.period_id = Some(period_id.into());
        self
    }

    pub fn with_domain(mut self, domain: Domain) -> Self {
        self.domain = Some(domain);
        self
    }

    /// Rejects windows no entry date can fall into.
    pub fn validate(&self) -> Result<()> {
        if let Some(year) = self.year {
            if year < NaiveDate::MIN.year() || year > NaiveDate::MAX.year() {
                return Err(TreasuryError::validation(
                    "year",
                    format!("year {} is outside the supported calendar", year),
                ));
            }
        }
        if let Some(month) = self.month {
            if self.year.is_none() {
                return Err(TreasuryError::validation("month", "a month filter needs a year"));
            }
            if !(1..=12).contains(&month) {
                return Err(TreasuryError::validation(
                    "month",
                    format!("month {} is not between 1 and 12", month),
                ));
            }
        }
        Ok(())
    }

    pub fn matches(&self, entry: &CashFlowEntry) -> bool {
        if let Some(plan) = &self.plan_id {
            if &entry.plan_id != plan {
                return false;
            }
        }
        if let Some(period) = &self.period_id {
            if &entry.period_id != period {
                return false;
            }
        }
        if let Some(domain) = self.domain {
            if entry.domain != domain {
                return false;
            }
        }
        if let Some(year) = self.year {
            if entry.date.year() != year {
                return false;
            }
            if let Some(month) = self.month {
                if entry.date.month() != month {
                    return false;
                }
            }
        }
        true
    }

    /// The comparable window one step back: previous month when filtering by
    /// month, previous year when filtering by year. Plan and period ids are
    /// dropped since they do not carry over between windows.
    pub fn prior(&self) -> Option<AggregationFilter> {
        let year = self.year?;
        match self.month {
            Some(month) => {
                let current = NaiveDate::from_ymd_opt(year, month, 1)?;
                let previous = prev_month(current)?;
                Some(AggregationFilter {
                    plan_id: None,
                    period_id: None,
                    year: Some(previous.year()),
                    month: Some(previous.month()),
                    domain: self.domain,
                })
            }
            None => Some(AggregationFilter {
                plan_id: None,
                period_id: None,
                year: Some(year.checked_sub(1)?),
                month: None,
                domain: self.domain,
            }),
        }
    }
}

impl fmt::Display for AggregationFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(plan) = &self.plan_id {
            parts.push(format!("plan={}", plan));
        }
        if let Some(period) = &self.period_id {
            parts.push(format!("period={}", period));
        }
        if let Some(year) = self.year {
            match self.month {
                Some(month) => parts.push(format!("month={:04}-{:02}", year, month)),
                None => parts.push(format!("year={}", year)),
            }
        }
        if let Some(domain) = self.domain {
            parts.push(format!("domain={}", domain));
        }
        if parts.is_empty() {
            f.write_str("all")
        } else {
            f.write_str(&parts.join(","))
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(tag = "kind", content = "domain", rename_all = "camelCase")]
pub enum SummaryScope {
    Domain(Domain),
    Consolidated,
}

impl SummaryScope {
    fn includes(&self, entry: &CashFlowEntry) -> bool {
        match self {
            SummaryScope::Domain(domain) => entry.domain == *domain,
            SummaryScope::Consolidated => true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MonthlyAmount {
    pub month: NaiveDate,
    pub encaissements: f64,
    pub decaissements: f64,
    /// Realized net flow of the month.
    pub realise: f64,
    /// Budgeted net flow of the month.
    pub prevision: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RubriqueBreakdownRow {
    pub rubrique_id: String,
    pub direction: FlowDirection,
    pub monthly: BTreeMap<NaiveDate, f64>,
    pub total: f64,
    pub budget_total: f64,
    pub ecart: f64,
    pub ecart_percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DomainSummary {
    pub scope: SummaryScope,
    pub total_encaissements: f64,
    pub total_decaissements: f64,
    pub solde_net: f64,
    /// Relative change of `solde_net` against the prior comparable window.
    pub variation_percent: f64,
    pub monthly: Vec<MonthlyAmount>,
    pub rubriques: Vec<RubriqueBreakdownRow>,
    pub entry_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConsistencyIssue {
    pub field: String,
    pub month: Option<NaiveDate>,
    /// Sum over the per-domain summaries.
    pub expected: f64,
    /// Value carried by the consolidated summary.
    pub actual: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AggregationReport {
    pub summaries: Vec<DomainSummary>,
    pub consolidated: DomainSummary,
    pub warnings: Vec<DataQualityWarning>,
    pub consistency_issues: Vec<ConsistencyIssue>,
}

impl AggregationReport {
    pub fn summary(&self, domain: Domain) -> Option<&DomainSummary> {
        self.summaries
            .iter()
            .find(|s| s.scope == SummaryScope::Domain(domain))
    }

    pub fn is_consistent(&self) -> bool {
        self.consistency_issues.is_empty()
    }
}

/// Rolls cash-flow entries into per-domain and consolidated summaries.
///
/// Pure over its inputs; safe to run concurrently for different filters.
pub struct AggregationEngine<'a> {
    config: &'a EngineConfig,
    catalog: Option<&'a dyn ReferenceCatalog>,
}

impl<'a> AggregationEngine<'a> {
    pub fn new(config: &'a EngineConfig) -> Self {
        Self {
            config,
            catalog: None,
        }
    }

    pub fn with_catalog(mut self, catalog: &'a dyn ReferenceCatalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Converts feed rows into typed entries; bad rows become warnings.
    pub fn validate_entries(
        &self,
        raw: &[RawCashFlowEntry],
    ) -> (Vec<CashFlowEntry>, Vec<DataQualityWarning>) {
        let mut entries = Vec::with_capacity(raw.len());
        let mut warnings = Vec::new();

        for row in raw {
            match row.validate() {
                Ok(entry) => match self.check_references(&entry) {
                    Some(warning) => {
                        debug!("Excluding entry from aggregation: {}", warning);
                        warnings.push(warning);
                    }
                    None => entries.push(entry),
                },
                Err(warning) => {
                    debug!("Excluding entry from aggregation: {}", warning);
                    warnings.push(warning);
                }
            }
        }

        (entries, warnings)
    }

    pub fn aggregate(
        &self,
        raw: &[RawCashFlowEntry],
        filter: &AggregationFilter,
    ) -> AggregationReport {
        let (entries, warnings) = self.validate_entries(raw);
        let report = self.report_from_checked(&entries, filter, warnings);

        if !report.warnings.is_empty() {
            info!(
                "Aggregation [{}] excluded {} malformed entr(y/ies)",
                filter,
                report.warnings.len()
            );
        }

        report
    }

    pub fn aggregate_entries(
        &self,
        entries: &[CashFlowEntry],
        filter: &AggregationFilter,
    ) -> AggregationReport {
        let mut warnings = Vec::new();
        let mut checked: Vec<CashFlowEntry> = Vec::with_capacity(entries.len());
        for entry in entries {
            match self.check_references(entry) {
                Some(warning) => warnings.push(warning),
                None => checked.push(entry.clone()),
            }
        }

        self.report_from_checked(&checked, filter, warnings)
    }

    /// Builds the report from entries whose references were already checked.
    fn report_from_checked(
        &self,
        checked: &[CashFlowEntry],
        filter: &AggregationFilter,
        warnings: Vec<DataQualityWarning>,
    ) -> AggregationReport {
        let summaries: Vec<DomainSummary> = Domain::ALL
            .iter()
            .filter(|d| filter.domain.map_or(true, |wanted| wanted == **d))
            .map(|d| self.get_by_domain(*d, checked, filter))
            .collect();
        let consolidated = self.get_consolidated(checked, filter);

        let consistency_issues =
            check_consolidation(&summaries, &consolidated, self.config.consistency_tolerance);
        for issue in &consistency_issues {
            warn!(
                "Consolidation mismatch [{}] on {} ({:?}): domains sum to {}, consolidated is {}",
                filter, issue.field, issue.month, issue.expected, issue.actual
            );
        }

        AggregationReport {
            summaries,
            consolidated,
            warnings,
            consistency_issues,
        }
    }

    pub fn get_by_domain(
        &self,
        domain: Domain,
        entries: &[CashFlowEntry],
        filter: &AggregationFilter,
    ) -> DomainSummary {
        summarize(entries, filter, SummaryScope::Domain(domain))
    }

    pub fn get_consolidated(
        &self,
        entries: &[CashFlowEntry],
        filter: &AggregationFilter,
    ) -> DomainSummary {
        summarize(entries, filter, SummaryScope::Consolidated)
    }

    /// Fails with `ConsistencyError` when the consolidated summary is not the
    /// element-wise sum of the seven per-domain summaries.
    pub fn verify_consolidation(
        &self,
        entries: &[CashFlowEntry],
        filter: &AggregationFilter,
    ) -> Result<()> {
        let summaries: Vec<DomainSummary> = Domain::ALL
            .iter()
            .map(|d| self.get_by_domain(*d, entries, filter))
            .collect();
        let consolidated = self.get_consolidated(entries, filter);

        match check_consolidation(&summaries, &consolidated, self.config.consistency_tolerance)
            .into_iter()
            .next()
        {
            Some(issue) => Err(TreasuryError::ConsistencyError {
                scope: filter.to_string(),
                field: match issue.month {
                    Some(month) => format!("{}@{}", issue.field, month.format("%Y-%m")),
                    None => issue.field,
                },
                expected: issue.expected,
                actual: issue.actual,
            }),
            None => Ok(()),
        }
    }

    fn check_references(&self, entry: &CashFlowEntry) -> Option<DataQualityWarning> {
        let catalog = self.catalog?;
        if catalog.has_rubrique(&entry.rubrique_id) {
            return None;
        }
        Some(DataQualityWarning {
            entry_id: Some(entry.id),
            field: "rubriqueId".to_string(),
            value: entry.rubrique_id.clone(),
            message: format!("unknown rubrique '{}'", entry.rubrique_id),
        })
    }
}

#[derive(Default)]
struct RubriqueAccumulator {
    monthly: BTreeMap<NaiveDate, f64>,
    total: f64,
    budget_total: f64,
}

fn summarize(
    entries: &[CashFlowEntry],
    filter: &AggregationFilter,
    scope: SummaryScope,
) -> DomainSummary {
    let mut total_encaissements = 0.0;
    let mut total_decaissements = 0.0;
    let mut entry_count = 0;
    let mut monthly: BTreeMap<NaiveDate, MonthlyAmount> = BTreeMap::new();
    let mut rubriques: BTreeMap<(String, FlowDirection), RubriqueAccumulator> = BTreeMap::new();

    for entry in entries
        .iter()
        .filter(|e| filter.matches(e) && scope.includes(e))
    {
        entry_count += 1;
        let real = entry.real_amount.abs();
        let budget = entry.budget_amount.abs();
        let month = month_start(entry.date);

        let slot = monthly.entry(month).or_insert_with(|| MonthlyAmount {
            month,
            ..MonthlyAmount::default()
        });
        match entry.direction {
            FlowDirection::Receipt => {
                total_encaissements += real;
                slot.encaissements += real;
                slot.realise += real;
                slot.prevision += budget;
            }
            FlowDirection::Payment => {
                total_decaissements += real;
                slot.decaissements += real;
                slot.realise -= real;
                slot.prevision -= budget;
            }
        }

        let row = rubriques
            .entry((entry.rubrique_id.clone(), entry.direction))
            .or_default();
        *row.monthly.entry(month).or_default() += real;
        row.total += real;
        row.budget_total += budget;
    }

    let solde_net = total_encaissements - total_decaissements;
    let variation_percent = variation_against_prior(entries, filter, scope, solde_net);

    DomainSummary {
        scope,
        total_encaissements,
        total_decaissements,
        solde_net,
        variation_percent,
        monthly: monthly.into_values().collect(),
        rubriques: rubriques
            .into_iter()
            .map(|((rubrique_id, direction), acc)| {
                let ecart = acc.total - acc.budget_total;
                let ecart_percent = if acc.budget_total == 0.0 {
                    0.0
                } else {
                    ecart / acc.budget_total
                };
                RubriqueBreakdownRow {
                    rubrique_id,
                    direction,
                    monthly: acc.monthly,
                    total: acc.total,
                    budget_total: acc.budget_total,
                    ecart,
                    ecart_percent,
                }
            })
            .collect(),
        entry_count,
    }
}

fn variation_against_prior(
    entries: &[CashFlowEntry],
    filter: &AggregationFilter,
    scope: SummaryScope,
    current_solde: f64,
) -> f64 {
    let Some(prior) = filter.prior() else {
        return 0.0;
    };

    let mut found = false;
    let mut prior_solde = 0.0;
    for entry in entries
        .iter()
        .filter(|e| prior.matches(e) && scope.includes(e))
    {
        found = true;
        match entry.direction {
            FlowDirection::Receipt => prior_solde += entry.real_amount.abs(),
            FlowDirection::Payment => prior_solde -= entry.real_amount.abs(),
        }
    }

    if !found {
        return 0.0;
    }
    relative_change(current_solde, prior_solde)
}

/// Compares the consolidated summary with the element-wise sum of `summaries`.
pub fn check_consolidation(
    summaries: &[DomainSummary],
    consolidated: &DomainSummary,
    tolerance: f64,
) -> Vec<ConsistencyIssue> {
    let mut issues = Vec::new();
    let mut compare = |field: &str, month: Option<NaiveDate>, expected: f64, actual: f64| {
        if (expected - actual).abs() > tolerance {
            issues.push(ConsistencyIssue {
                field: field.to_string(),
                month,
                expected,
                actual,
            });
        }
    };

    compare(
        "totalEncaissements",
        None,
        summaries.iter().map(|s| s.total_encaissements).sum(),
        consolidated.total_encaissements,
    );
    compare(
        "totalDecaissements",
        None,
        summaries.iter().map(|s| s.total_decaissements).sum(),
        consolidated.total_decaissements,
    );
    compare(
        "soldeNet",
        None,
        summaries.iter().map(|s| s.solde_net).sum(),
        consolidated.solde_net,
    );

    let mut summed: BTreeMap<NaiveDate, MonthlyAmount> = BTreeMap::new();
    for point in summaries.iter().flat_map(|s| s.monthly.iter()) {
        let slot = summed.entry(point.month).or_insert_with(|| MonthlyAmount {
            month: point.month,
            ..MonthlyAmount::default()
        });
        slot.encaissements += point.encaissements;
        slot.decaissements += point.decaissements;
        slot.realise += point.realise;
        slot.prevision += point.prevision;
    }

    let consolidated_months: BTreeMap<NaiveDate, &MonthlyAmount> = consolidated
        .monthly
        .iter()
        .map(|m| (m.month, m))
        .collect();
    let empty = MonthlyAmount::default();

    let mut months: Vec<NaiveDate> = summed.keys().copied().collect();
    months.extend(consolidated_months.keys().copied());
    months.sort();
    months.dedup();

    for month in months {
        let expected = summed.get(&month).unwrap_or(&empty);
        let actual = consolidated_months.get(&month).copied().unwrap_or(&empty);
        compare("encaissements", Some(month), expected.encaissements, actual.encaissements);
        compare("decaissements", Some(month), expected.decaissements, actual.decaissements);
        compare("realise", Some(month), expected.realise, actual.realise);
        compare("prevision", Some(month), expected.prevision, actual.prevision);
    }

    issues
}
