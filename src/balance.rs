use crate::aggregation::DomainSummary;
use crate::error::{Result, TreasuryError};
use crate::schema::{FlowDirection, Forecast};
use crate::utils::{month_range, month_start};
use chrono::NaiveDate;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MonthlyFlow {
    pub month: NaiveDate,
    pub receipts: f64,
    pub payments: f64,
}

impl MonthlyFlow {
    pub fn new(month: NaiveDate, receipts: f64, payments: f64) -> Self {
        Self {
            month: month_start(month),
            receipts,
            payments,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BalanceEvolutionPoint {
    pub date: NaiveDate,
    pub balance: f64,
    pub receipts: f64,
    pub payments: f64,
}

/// Running balance over a monthly flow series.
///
/// The same computation serves realized flows and scenario projections; the
/// caller decides which series to feed in.
pub struct BalanceEvolutionCalculator;

impl BalanceEvolutionCalculator {
    /// One point per month from the first to the last month of `series`.
    /// Months missing from the input count as zero flow; several flows for the
    /// same month are summed.
    pub fn evolve(opening_balance: f64, series: &[MonthlyFlow]) -> Vec<BalanceEvolutionPoint> {
        let buckets = bucket(series);
        let (Some(first), Some(last)) = (
            buckets.keys().next().copied(),
            buckets.keys().next_back().copied(),
        ) else {
            return Vec::new();
        };

        let mut balance = opening_balance;
        month_range(first, last)
            .into_iter()
            .map(|month| {
                let (receipts, payments) = buckets.get(&month).copied().unwrap_or((0.0, 0.0));
                balance += receipts - payments;
                BalanceEvolutionPoint {
                    date: month,
                    balance,
                    receipts,
                    payments,
                }
            })
            .collect()
    }

    pub fn series_from_summary(summary: &DomainSummary) -> Vec<MonthlyFlow> {
        summary
            .monthly
            .iter()
            .map(|m| MonthlyFlow::new(m.month, m.encaissements, m.decaissements))
            .collect()
    }

    /// Monthly flows of the lines' adjusted amounts.
    pub fn series_from_forecasts(forecasts: &[Forecast]) -> Vec<MonthlyFlow> {
        Self::series_with(forecasts, |f| f.adjusted_amount)
    }

    /// Monthly flows of the lines' untouched baseline amounts.
    pub fn series_from_originals(forecasts: &[Forecast]) -> Vec<MonthlyFlow> {
        Self::series_with(forecasts, |f| f.original_amount)
    }

    fn series_with(forecasts: &[Forecast], amount: impl Fn(&Forecast) -> f64) -> Vec<MonthlyFlow> {
        let mut months: BTreeMap<NaiveDate, MonthlyFlow> = BTreeMap::new();
        for forecast in forecasts {
            let flow = months
                .entry(forecast.month)
                .or_insert_with(|| MonthlyFlow::new(forecast.month, 0.0, 0.0));
            match forecast.direction {
                FlowDirection::Receipt => flow.receipts += amount(forecast),
                FlowDirection::Payment => flow.payments += amount(forecast),
            }
        }
        months.into_values().collect()
    }

    /// Realized months followed by projected ones; a month present in
    /// `forecast` replaces the realized month entirely.
    pub fn merge_realized_and_forecast(
        realized: &[MonthlyFlow],
        forecast: &[MonthlyFlow],
    ) -> Vec<MonthlyFlow> {
        let mut merged: BTreeMap<NaiveDate, MonthlyFlow> = BTreeMap::new();
        for (month, (receipts, payments)) in bucket(realized) {
            merged.insert(month, MonthlyFlow::new(month, receipts, payments));
        }
        for (month, (receipts, payments)) in bucket(forecast) {
            merged.insert(month, MonthlyFlow::new(month, receipts, payments));
        }
        merged.into_values().collect()
    }

    /// Checks ordering, gap-free months and `balance[i] = balance[i-1] + r - p`.
    pub fn verify_continuity(
        opening_balance: f64,
        points: &[BalanceEvolutionPoint],
        tolerance: f64,
    ) -> Result<()> {
        let mut previous_balance = opening_balance;
        let mut previous_month: Option<NaiveDate> = None;

        for point in points {
            if let Some(prev) = previous_month {
                if crate::utils::next_month(prev) != Some(point.date) {
                    return Err(TreasuryError::validation(
                        "balanceSeries",
                        format!("series jumps from {} to {}", prev, point.date),
                    ));
                }
            }

            let expected = previous_balance + point.receipts - point.payments;
            if (expected - point.balance).abs() > tolerance {
                return Err(TreasuryError::validation(
                    "balanceSeries",
                    format!(
                        "balance on {} is {}, expected {}",
                        point.date, point.balance, expected
                    ),
                ));
            }

            previous_balance = point.balance;
            previous_month = Some(point.date);
        }

        Ok(())
    }
}

fn bucket(series: &[MonthlyFlow]) -> BTreeMap<NaiveDate, (f64, f64)> {
    let mut buckets: BTreeMap<NaiveDate, (f64, f64)> = BTreeMap::new();
    for flow in series {
        let slot = buckets.entry(month_start(flow.month)).or_insert((0.0, 0.0));
        slot.0 += flow.receipts;
        slot.1 += flow.payments;
    }
    buckets
}
