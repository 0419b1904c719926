//! Currency conversion seam and the configured rate table.
use crate::config::{CurrencyConfig, EngineConfig};
use crate::error::PricingError;
use rust_decimal::{Decimal, RoundingStrategy};
use std::collections::HashMap;

/// Decimal places money is stored with.
pub const STORAGE_PRECISION: u32 = 4;

pub trait CurrencyConverter: Send + Sync {
    fn convert(
        &self,
        amount: Decimal,
        from: &str,
        to: &str,
        company_id: u64,
    ) -> Result<Decimal, PricingError>;

    /// Default display precision for `code`.
    fn precision(&self, _code: &str, _company_id: u64) -> u32 {
        2
    }
}

/// Static rates relative to a base currency.
#[derive(Debug, Clone)]
pub struct CurrencyTable {
    currencies: HashMap<String, CurrencyConfig>,
}

impl CurrencyTable {
    pub fn new(currencies: impl IntoIterator<Item = CurrencyConfig>) -> Self {
        Self {
            currencies: currencies
                .into_iter()
                .map(|c| (c.code.clone(), c))
                .collect(),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.currencies.iter().cloned())
    }

    fn lookup(&self, code: &str) -> Result<&CurrencyConfig, PricingError> {
        self.currencies
            .get(code)
            .ok_or_else(|| PricingError::UnknownCurrency(code.to_string()))
    }
}

impl CurrencyConverter for CurrencyTable {
    fn convert(
        &self,
        amount: Decimal,
        from: &str,
        to: &str,
        _company_id: u64,
    ) -> Result<Decimal, PricingError> {
        if from == to {
            return Ok(amount);
        }
        let from_rate = self.lookup(from)?.rate;
        let to_rate = self.lookup(to)?.rate;
        if from_rate.is_zero() {
            return Err(PricingError::UnknownCurrency(from.to_string()));
        }

        let converted = amount
            .checked_div(from_rate)
            .and_then(|base| base.checked_mul(to_rate))
            .ok_or_else(|| PricingError::Conversion {
                amount,
                from: from.to_string(),
                to: to.to_string(),
            })?;

        Ok(converted.round_dp_with_strategy(STORAGE_PRECISION, RoundingStrategy::MidpointAwayFromZero))
    }

    fn precision(&self, code: &str, _company_id: u64) -> u32 {
        self.currencies.get(code).map(|c| c.precision).unwrap_or(2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn table() -> CurrencyTable {
        CurrencyTable::new([
            CurrencyConfig { code: "USD".into(), precision: 2, rate: dec!(1) },
            CurrencyConfig { code: "EUR".into(), precision: 2, rate: dec!(0.5) },
            CurrencyConfig { code: "JPY".into(), precision: 0, rate: dec!(150) },
        ])
    }

    #[test]
    fn converts_through_base() {
        let table = table();
        assert_eq!(table.convert(dec!(10), "USD", "EUR", 1).unwrap(), dec!(5));
        assert_eq!(table.convert(dec!(5), "EUR", "JPY", 1).unwrap(), dec!(1500));
        assert_eq!(table.convert(dec!(3), "USD", "USD", 1).unwrap(), dec!(3));
    }

    #[test]
    fn keeps_storage_precision() {
        let table = table();
        assert_eq!(table.convert(dec!(19.999), "USD", "EUR", 1).unwrap(), dec!(9.9995));
    }

    #[test]
    fn overflowing_conversion_is_an_error() {
        let result = table().convert(Decimal::MAX, "USD", "JPY", 1);
        assert!(matches!(
            result,
            Err(PricingError::Conversion { ref from, ref to, .. }) if from == "USD" && to == "JPY"
        ));
        // the same amount in the same currency needs no arithmetic
        assert_eq!(table().convert(Decimal::MAX, "JPY", "JPY", 1).unwrap(), Decimal::MAX);
    }

    #[test]
    fn unknown_currency_fails() {
        let result = table().convert(dec!(1), "USD", "GBP", 1);
        assert!(matches!(result, Err(PricingError::UnknownCurrency(code)) if code == "GBP"));
        assert_eq!(table().precision("JPY", 1), 0);
        assert_eq!(table().precision("GBP", 1), 2);
    }
}
