use crate::config::EngineConfig;
use crate::error::{Result, TreasuryError};
use crate::schema::{Forecast, ScenarioParameter};
use chrono::Utc;
use log::debug;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum EffectKind {
    #[schemars(description = "delta = originalAmount * value (value 0.05 = +5%). Neutral value: 0.")]
    Proportional,

    #[schemars(description = "delta = originalAmount * (value - 1) (value 1.05 = +5%). Neutral value: 1.")]
    Multiplier,

    #[schemars(description = "delta = value, a flat amount added to every matching line. Neutral value: 0.")]
    Additive,

    #[schemars(description = "delta = -originalAmount * value (value 0.05 = -5%). Neutral value: 0.")]
    InverseProportional,
}

impl EffectKind {
    pub fn delta(&self, original_amount: f64, value: f64) -> f64 {
        match self {
            EffectKind::Proportional => original_amount * value,
            EffectKind::Multiplier => original_amount * (value - 1.0),
            EffectKind::Additive => value,
            EffectKind::InverseProportional => -original_amount * value,
        }
    }

    /// The parameter value at which this effect leaves amounts untouched.
    pub fn neutral_value(&self) -> f64 {
        match self {
            EffectKind::Multiplier => 1.0,
            _ => 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ParameterEffect {
    #[schemars(description = "Scenario parameter key this effect is bound to")]
    pub key: String,

    pub kind: EffectKind,

    #[serde(default)]
    #[schemars(description = "Rubrique ids the effect applies to. Empty means every rubrique.")]
    pub rubriques: Vec<String>,
}

impl ParameterEffect {
    pub fn new(key: impl Into<String>, kind: EffectKind) -> Self {
        Self {
            key: key.into(),
            kind,
            rubriques: Vec::new(),
        }
    }

    pub fn for_rubriques(mut self, rubriques: &[&str]) -> Self {
        self.rubriques = rubriques.iter().map(|r| r.to_string()).collect();
        self
    }

    pub fn applies_to(&self, rubrique_id: &str) -> bool {
        self.rubriques.is_empty() || self.rubriques.iter().any(|r| r == rubrique_id)
    }
}

/// Applies a scenario's parameter set to baseline forecast lines.
///
/// Stateless: every call recomputes from `original_amount`, so applying the
/// same parameters to the same baseline always yields the same amounts.
pub struct ParameterEngine<'a> {
    config: &'a EngineConfig,
}

impl<'a> ParameterEngine<'a> {
    pub fn new(config: &'a EngineConfig) -> Self {
        Self { config }
    }

    /// `original + Σ delta`, clamped at zero unless the rubrique may go negative.
    pub fn adjusted_amount(&self, forecast: &Forecast, parameters: &[ScenarioParameter]) -> f64 {
        let total_delta: f64 = parameters
            .iter()
            .filter_map(|param| {
                let effect = self.config.effect(&param.key)?;
                if !effect.applies_to(&forecast.rubrique_id) {
                    return None;
                }
                Some(effect.kind.delta(forecast.original_amount, param.value))
            })
            .sum();

        let adjusted = forecast.original_amount + total_delta;
        if adjusted < 0.0 && !self.config.allows_negative(&forecast.rubrique_id) {
            0.0
        } else {
            adjusted
        }
    }

    /// Produces the next version of every line. Fails as a whole, before
    /// anything is returned, if a single line is invalid.
    pub fn apply_parameters(
        &self,
        baseline: &[Forecast],
        parameters: &[ScenarioParameter],
        reason: &str,
    ) -> Result<Vec<Forecast>> {
        if reason.trim().is_empty() {
            return Err(TreasuryError::validation(
                "adjustmentReason",
                "an adjustment reason is required",
            ));
        }

        for param in parameters {
            if self.config.effect(&param.key).is_none() {
                debug!("Parameter '{}' has no configured effect, ignoring", param.key);
            }
        }

        let now = Utc::now();
        let mut adjusted = Vec::with_capacity(baseline.len());

        for forecast in baseline {
            self.check_original(forecast)?;

            let amount = self.adjusted_amount(forecast, parameters);
            if !amount.is_finite() {
                return Err(TreasuryError::validation(
                    "adjustedAmount",
                    format!(
                        "forecast {} ({}) produced a non-finite amount",
                        forecast.id, forecast.rubrique_id
                    ),
                ));
            }

            let mut next = forecast.clone();
            next.adjusted_amount = amount;
            next.version = forecast.version + 1;
            next.adjustment_reason = Some(reason.to_string());
            next.updated_at = now;
            adjusted.push(next);
        }

        debug!(
            "Applied {} parameter(s) to {} forecast line(s)",
            parameters.len(),
            adjusted.len()
        );

        Ok(adjusted)
    }

    /// Value at which `key` has no effect; 0 for keys without a configured effect.
    pub fn neutral_value(&self, key: &str) -> f64 {
        self.config
            .effect(key)
            .map(|e| e.kind.neutral_value())
            .unwrap_or(0.0)
    }

    pub fn is_neutral(&self, parameters: &[ScenarioParameter]) -> bool {
        parameters
            .iter()
            .all(|p| p.is_neutral(self.neutral_value(&p.key)))
    }

    /// Checks a manually entered amount against the rubrique's sign policy.
    pub fn check_amount(&self, rubrique_id: &str, amount: f64) -> Result<()> {
        if !amount.is_finite() {
            return Err(TreasuryError::validation(
                "adjustedAmount",
                "amount is not a finite number",
            ));
        }
        if amount < 0.0 && !self.config.allows_negative(rubrique_id) {
            return Err(TreasuryError::validation(
                "adjustedAmount",
                format!(
                    "rubrique {} does not allow negative amounts, got {}",
                    rubrique_id, amount
                ),
            ));
        }
        Ok(())
    }

    fn check_original(&self, forecast: &Forecast) -> Result<()> {
        self.check_amount(&forecast.rubrique_id, forecast.original_amount)
            .map_err(|_| {
                TreasuryError::validation(
                    "originalAmount",
                    format!(
                        "forecast {} ({}) has a disallowed original amount {}",
                        forecast.id, forecast.rubrique_id, forecast.original_amount
                    ),
                )
            })
    }
}
