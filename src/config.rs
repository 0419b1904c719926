//! Engine configuration, loaded from JSON.
use crate::sequence::SequenceSettings;
use crate::types::RequestContext;
use chrono::FixedOffset;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid timezone offset '{0}', expected +HH:MM")]
    Timezone(String),
    #[error("Base currency {0} is missing from the currency table")]
    MissingBaseCurrency(String),
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct EngineConfig {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    /// Company timezone used for day-of-month evaluation, as `+HH:MM`.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_base_currency")]
    pub base_currency: String,
    #[serde(default = "default_currencies")]
    pub currencies: Vec<CurrencyConfig>,
    #[serde(default)]
    pub sequences: SequenceDefaults,
    #[serde(default)]
    pub proration: ProrationConfig,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CurrencyConfig {
    pub code: String,
    #[serde(default = "default_precision")]
    pub precision: u32,
    /// Units of this currency per one unit of the base currency.
    pub rate: Decimal,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SequenceDefaults {
    pub package: SequenceSettings,
    pub client: SequenceSettings,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ProrationConfig {
    /// Decimal places kept on a prorated amount.
    pub precision: u32,
    /// Prorate `day` and `week` periods as well as `month` and `year`.
    pub allow_all_periods: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            timezone: default_timezone(),
            base_currency: default_base_currency(),
            currencies: default_currencies(),
            sequences: SequenceDefaults::default(),
            proration: ProrationConfig::default(),
        }
    }
}

impl Default for SequenceDefaults {
    fn default() -> Self {
        Self {
            package: SequenceSettings::new(1, 1, "{num}"),
            client: SequenceSettings::new(1500, 1, "{num}"),
        }
    }
}

impl Default for ProrationConfig {
    fn default() -> Self {
        Self {
            precision: 4,
            allow_all_periods: false,
        }
    }
}

impl EngineConfig {
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    pub fn from_json(contents: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = serde_json::from_str(contents)?;
        config.check()?;
        Ok(config)
    }

    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(&self)?)?;
        Ok(())
    }

    fn check(&self) -> Result<(), ConfigError> {
        self.timezone_offset()?;
        if !self.currencies.iter().any(|c| c.code == self.base_currency) {
            return Err(ConfigError::MissingBaseCurrency(self.base_currency.clone()));
        }
        Ok(())
    }

    pub fn timezone_offset(&self) -> Result<FixedOffset, ConfigError> {
        FixedOffset::from_str(&self.timezone).map_err(|_| ConfigError::Timezone(self.timezone.clone()))
    }

    /// Request context for `company_id` in the configured timezone.
    pub fn context(&self, company_id: u64) -> Result<RequestContext, ConfigError> {
        Ok(RequestContext::new(company_id).with_timezone(self.timezone_offset()?))
    }
}

fn default_database_path() -> PathBuf {
    PathBuf::from("package-pricing.db")
}

fn default_timezone() -> String {
    "+00:00".to_string()
}

fn default_base_currency() -> String {
    "USD".to_string()
}

fn default_precision() -> u32 {
    2
}

fn default_currencies() -> Vec<CurrencyConfig> {
    vec![CurrencyConfig {
        code: "USD".to_string(),
        precision: 2,
        rate: Decimal::ONE,
    }]
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn parses_partial_config_with_defaults() {
        let config = EngineConfig::from_json(
            r#"{
                "timezone": "-05:00",
                "currencies": [
                    { "code": "USD", "rate": "1" },
                    { "code": "EUR", "rate": "0.92" },
                    { "code": "JPY", "precision": 0, "rate": "151.2" }
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(config.base_currency, "USD");
        assert_eq!(config.currencies[1].rate, dec!(0.92));
        assert_eq!(config.currencies[2].precision, 0);
        assert_eq!(config.proration.precision, 4);
        assert_eq!(config.sequences.client.start, 1500);
        assert_eq!(config.timezone_offset().unwrap().local_minus_utc(), -5 * 3600);
    }

    #[test]
    fn rejects_bad_timezone() {
        let result = EngineConfig::from_json(r#"{ "timezone": "EST" }"#);
        assert!(matches!(result, Err(ConfigError::Timezone(_))));
    }

    #[test]
    fn rejects_missing_base_currency() {
        let result = EngineConfig::from_json(r#"{ "base_currency": "EUR" }"#);
        assert!(matches!(result, Err(ConfigError::MissingBaseCurrency(_))));
    }

    #[test]
    fn save_and_load() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("nested/config.json");

        EngineConfig::default().save_to(&path).unwrap();
        let loaded = EngineConfig::load_from(&path).unwrap();

        assert_eq!(loaded.currencies, EngineConfig::default().currencies);
    }
}
