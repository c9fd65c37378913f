//! Numeric policy of the engine.
//!
//! Tolerances, parameter effects and generic threshold rules are supplied by
//! the caller, usually as a JSON document validated against the schema
//! returned by [`EngineConfig::schema_as_json`].

use crate::alerts::ThresholdRuleConfig;
use crate::error::{Result, TreasuryError};
use crate::parameters::ParameterEffect;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ToleranceBand {
    #[schemars(description = "Relative écart (e.g. 0.10 = 10%) above which a warning is raised")]
    pub warning: f64,

    #[schemars(description = "Relative écart above which the alert becomes critical. Must be >= warning.")]
    pub critical: f64,
}

impl ToleranceBand {
    fn validate(&self, field: &str) -> Result<()> {
        if self.warning < 0.0 || self.critical < 0.0 {
            return Err(TreasuryError::validation(
                field,
                format!(
                    "tolerances must be non-negative (warning {}, critical {})",
                    self.warning, self.critical
                ),
            ));
        }
        if self.warning > self.critical {
            return Err(TreasuryError::validation(
                field,
                format!(
                    "warning tolerance {} exceeds critical tolerance {}",
                    self.warning, self.critical
                ),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BudgetOverrunPolicy {
    #[serde(flatten)]
    pub default: ToleranceBand,

    #[serde(default)]
    #[schemars(description = "Per-rubrique tolerance bands, keyed by rubrique id")]
    pub overrides: BTreeMap<String, ToleranceBand>,
}

impl BudgetOverrunPolicy {
    pub fn band_for(&self, rubrique_id: &str) -> &ToleranceBand {
        self.overrides.get(rubrique_id).unwrap_or(&self.default)
    }
}

impl Default for BudgetOverrunPolicy {
    fn default() -> Self {
        Self {
            default: ToleranceBand {
                warning: 0.10,
                critical: 0.25,
            },
            overrides: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    #[serde(default)]
    pub budget_overrun: BudgetOverrunPolicy,

    #[serde(default = "default_forecast_deviation")]
    #[schemars(
        description = "Relative deviation of a scenario line against the baseline line above which FORECAST_DEVIATION is raised"
    )]
    pub forecast_deviation: f64,

    #[serde(default)]
    #[schemars(description = "How each scenario parameter key moves forecast amounts")]
    pub parameter_effects: Vec<ParameterEffect>,

    #[serde(default)]
    #[schemars(
        description = "Rubriques (e.g. corrective lines) whose adjusted amount may go below zero"
    )]
    pub negative_rubriques: Vec<String>,

    #[serde(default)]
    pub threshold_rules: Vec<ThresholdRuleConfig>,

    #[serde(default = "default_consistency_tolerance")]
    #[schemars(
        description = "Absolute tolerance of the consolidated vs. per-domain cross-total check"
    )]
    pub consistency_tolerance: f64,
}

fn default_forecast_deviation() -> f64 {
    0.10
}

fn default_consistency_tolerance() -> f64 {
    0.01
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            budget_overrun: BudgetOverrunPolicy::default(),
            forecast_deviation: default_forecast_deviation(),
            parameter_effects: Vec::new(),
            negative_rubriques: Vec::new(),
            threshold_rules: Vec::new(),
            consistency_tolerance: default_consistency_tolerance(),
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        self.budget_overrun.default.validate("budgetOverrun")?;
        for (rubrique, band) in &self.budget_overrun.overrides {
            band.validate(&format!("budgetOverrun.overrides.{}", rubrique))?;
        }

        if self.forecast_deviation < 0.0 {
            return Err(TreasuryError::validation(
                "forecastDeviation",
                format!("must be non-negative, got {}", self.forecast_deviation),
            ));
        }
        if self.consistency_tolerance < 0.0 {
            return Err(TreasuryError::validation(
                "consistencyTolerance",
                format!("must be non-negative, got {}", self.consistency_tolerance),
            ));
        }

        let mut seen = HashSet::new();
        for effect in &self.parameter_effects {
            if effect.key.trim().is_empty() {
                return Err(TreasuryError::validation(
                    "parameterEffects",
                    "effect key must not be empty",
                ));
            }
            if !seen.insert(effect.key.as_str()) {
                return Err(TreasuryError::validation(
                    "parameterEffects",
                    format!("duplicate effect key '{}'", effect.key),
                ));
            }
        }

        Ok(())
    }

    pub fn allows_negative(&self, rubrique_id: &str) -> bool {
        self.negative_rubriques.iter().any(|r| r == rubrique_id)
    }

    pub fn effect(&self, key: &str) -> Option<&ParameterEffect> {
        self.parameter_effects.iter().find(|e| e.key == key)
    }

    pub fn generate_json_schema() -> schemars::schema::RootSchema {
        schemars::schema_for!(EngineConfig)
    }

    pub fn schema_as_json() -> std::result::Result<String, serde_json::Error> {
        let schema = Self::generate_json_schema();
        serde_json::to_string_pretty(&schema)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameters::EffectKind;

    #[test]
    fn test_schema_generation() {
        let schema_json = EngineConfig::schema_as_json().unwrap();
        assert!(schema_json.contains("budgetOverrun"));
        assert!(schema_json.contains("parameterEffects"));
        assert!(schema_json.contains("thresholdRules"));
    }

    #[test]
    fn test_load_from_json() {
        let json = r#"{
            "budgetOverrun": {
                "warning": 0.05,
                "critical": 0.15,
                "overrides": { "R-IMPOT": { "warning": 0.0, "critical": 0.02 } }
            },
            "forecastDeviation": 0.2,
            "parameterEffects": [
                { "key": "tariff_growth", "kind": "proportional", "rubriques": [] },
                { "key": "fixed_fee", "kind": "additive", "rubriques": ["R-FRAIS"] }
            ],
            "negativeRubriques": ["R-REGUL"]
        }"#;

        let config = EngineConfig::from_json_str(json).unwrap();
        assert_eq!(config.budget_overrun.band_for("R-IMPOT").critical, 0.02);
        assert_eq!(config.budget_overrun.band_for("R-OTHER").warning, 0.05);
        assert_eq!(config.forecast_deviation, 0.2);
        assert_eq!(config.consistency_tolerance, 0.01);
        assert_eq!(
            config.effect("tariff_growth").unwrap().kind,
            EffectKind::Proportional
        );
        assert!(config.allows_negative("R-REGUL"));
        assert!(!config.allows_negative("R-FRAIS"));
    }

    #[test]
    fn test_rejects_inverted_band() {
        let json = r#"{ "budgetOverrun": { "warning": 0.5, "critical": 0.1 } }"#;
        assert!(matches!(
            EngineConfig::from_json_str(json),
            Err(TreasuryError::ValidationError { .. })
        ));
    }

    #[test]
    fn test_rejects_duplicate_effect_keys() {
        let json = r#"{
            "parameterEffects": [
                { "key": "growth", "kind": "proportional" },
                { "key": "growth", "kind": "additive" }
            ]
        }"#;
        assert!(EngineConfig::from_json_str(json).is_err());
    }

    #[test]
    fn test_default_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }
}
