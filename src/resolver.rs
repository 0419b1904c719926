//! Find the pricing row for a `(term, period, currency)` and quote it,
//! optionally in another currency.
use crate::currency::{CurrencyConverter, STORAGE_PRECISION};
use crate::error::PricingError;
use crate::pricing::PricingRow;
use crate::types::{Money, Period};
use rust_decimal::Decimal;

/// A matched row with every amount in the requested currency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPrice {
    pub pricing: PricingRow,
    /// Decimal places the amounts should be shown with.
    pub precision: u32,
}

pub struct PriceTermResolver<'a> {
    converter: &'a dyn CurrencyConverter,
}

impl<'a> PriceTermResolver<'a> {
    pub fn new(converter: &'a dyn CurrencyConverter) -> Self {
        Self { converter }
    }

    /// First row matching exactly; `None` when no row does.
    pub fn resolve(
        &self,
        company_id: u64,
        rows: &[PricingRow],
        term: u32,
        period: Period,
        currency: &str,
        convert_to: Option<&str>,
    ) -> Result<Option<ResolvedPrice>, PricingError> {
        let term = if period == Period::OneTime { 0 } else { term };
        let Some(row) = rows.iter().find(|row| row.matches(term, period, currency)) else {
            return Ok(None);
        };

        let pricing = match convert_to {
            Some(target) if target != row.currency => self.convert_row(company_id, row, target)?,
            _ => row.clone(),
        };
        let precision = display_precision(
            pricing.price.amount(),
            self.converter.precision(&pricing.currency, company_id),
        );

        Ok(Some(ResolvedPrice { pricing, precision }))
    }

    /// Convert each amount of `row` independently into `target`.
    pub fn convert_row(
        &self,
        company_id: u64,
        row: &PricingRow,
        target: &str,
    ) -> Result<PricingRow, PricingError> {
        let convert = |amount: Money| -> Result<Money, PricingError> {
            self.converter
                .convert(amount.amount(), &row.currency, target, company_id)
                .map(Money::from)
        };

        Ok(PricingRow {
            price: convert(row.price)?,
            price_renews: row.price_renews.map(convert).transpose()?,
            price_transfer: row.price_transfer.map(convert).transpose()?,
            setup_fee: convert(row.setup_fee)?,
            cancel_fee: convert(row.cancel_fee)?,
            currency: target.to_string(),
            ..row.clone()
        })
    }
}

/// Raise precision to the storage precision when the amount carries sub-cent
/// digits, so they are not rounded away for display.
pub fn display_precision(price: Decimal, default_precision: u32) -> u32 {
    let mut scaled = price.round_dp(STORAGE_PRECISION);
    scaled.rescale(STORAGE_PRECISION);

    if scaled.to_string().ends_with("00") {
        default_precision
    } else {
        STORAGE_PRECISION.max(default_precision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CurrencyConfig;
    use crate::currency::CurrencyTable;
    use rust_decimal_macros::dec;

    fn row(id: u64, term: u32, period: Period, price: Decimal, currency: &str) -> PricingRow {
        PricingRow {
            id,
            company_id: 1,
            term,
            period,
            price: price.into(),
            price_renews: None,
            price_transfer: None,
            setup_fee: Money::ZERO,
            cancel_fee: Money::ZERO,
            currency: currency.to_string(),
        }
    }

    fn table() -> CurrencyTable {
        CurrencyTable::new([
            CurrencyConfig { code: "USD".into(), precision: 2, rate: dec!(1) },
            CurrencyConfig { code: "GBP".into(), precision: 2, rate: dec!(1) },
            CurrencyConfig { code: "EUR".into(), precision: 2, rate: dec!(0.9) },
        ])
    }

    #[test]
    fn requires_exact_match() {
        let table = table();
        let resolver = PriceTermResolver::new(&table);
        let rows = vec![
            row(1, 1, Period::Month, dec!(10), "USD"),
            row(2, 12, Period::Month, dec!(100), "USD"),
        ];

        let found = resolver.resolve(1, &rows, 12, Period::Month, "USD", None).unwrap();
        assert_eq!(found.unwrap().pricing.id, 2);

        assert!(resolver.resolve(1, &rows, 1, Period::Year, "USD", None).unwrap().is_none());
        assert!(resolver.resolve(1, &rows, 1, Period::Month, "EUR", None).unwrap().is_none());
    }

    #[test]
    fn converts_every_amount() {
        let table = table();
        let resolver = PriceTermResolver::new(&table);
        let mut source = row(1, 1, Period::Month, dec!(10), "USD");
        source.setup_fee = dec!(5).into();
        source.price_renews = Some(dec!(20).into());

        let found = resolver
            .resolve(1, &[source], 1, Period::Month, "USD", Some("EUR"))
            .unwrap()
            .unwrap();

        assert_eq!(found.pricing.currency, "EUR");
        assert_eq!(found.pricing.price.amount(), dec!(9));
        assert_eq!(found.pricing.setup_fee.amount(), dec!(4.5));
        assert_eq!(found.pricing.renewal_price().amount(), dec!(18));
        assert_eq!(found.precision, 2);
    }

    #[test]
    fn overflowing_conversion_fails_the_resolve() {
        let table = CurrencyTable::new([
            CurrencyConfig { code: "USD".into(), precision: 2, rate: dec!(1) },
            CurrencyConfig { code: "JPY".into(), precision: 0, rate: dec!(150) },
        ]);
        let resolver = PriceTermResolver::new(&table);
        let rows = vec![row(1, 1, Period::Month, Decimal::MAX, "USD")];

        let result = resolver.resolve(1, &rows, 1, Period::Month, "USD", Some("JPY"));
        assert!(matches!(result, Err(PricingError::Conversion { .. })));
        // unconverted it still resolves
        assert!(resolver.resolve(1, &rows, 1, Period::Month, "USD", None).unwrap().is_some());
    }

    #[test]
    fn sub_cent_prices_raise_precision() {
        let table = table();
        let resolver = PriceTermResolver::new(&table);
        let rows = vec![row(1, 1, Period::Month, dec!(19.999), "USD")];

        let found = resolver
            .resolve(1, &rows, 1, Period::Month, "USD", Some("GBP"))
            .unwrap()
            .unwrap();

        assert_eq!(found.pricing.price.amount(), dec!(19.999));
        assert_eq!(found.precision, 4);
    }

    #[test]
    fn precision_rule() {
        assert_eq!(display_precision(dec!(10.00), 2), 2);
        assert_eq!(display_precision(dec!(10), 2), 2);
        assert_eq!(display_precision(dec!(10.005), 2), 4);
        assert_eq!(display_precision(dec!(19.999), 2), 4);
    }
}
