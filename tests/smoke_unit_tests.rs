//! Smoke screen unit tests for the pricing engine's building blocks
//!
//! These span the public surface of the crate, exercising each piece in
//! isolation from the integration scenarios. They are intended as a smoke
//! screen and mostly cover the happy path.

use package_pricing::{
    config::EngineConfig,
    currency::{CurrencyConverter, CurrencyTable},
    groups::reorder,
    options::OptionType,
    pricing::{PricingDraft, PricingInput},
    resolver::display_precision,
    sequence::{SequenceSettings, format_code, next_value},
    types::{Money, Period, RequestContext, validate_term},
    usage::ServiceStatus,
};
use rust_decimal_macros::dec;

// TYPES MODULE TESTS
#[cfg(test)]
mod types_tests {
    use super::*;

    /// Periods parse from and print to their stored names
    #[test]
    fn periods_round_trip_through_names() {
        for period in Period::all() {
            assert_eq!(period.as_str().parse::<Period>(), Ok(period));
        }
        assert!("fortnight".parse::<Period>().is_err());
    }

    /// Terms must be positive for recurring periods only
    #[test]
    fn validates_terms() {
        assert!(validate_term(1, Period::Month));
        assert!(!validate_term(0, Period::Year));
        assert!(validate_term(0, Period::OneTime));
    }

    /// Money keeps the decimal it was built from
    #[test]
    fn money_wraps_decimal() {
        let money = Money::from(dec!(19.99));
        assert_eq!(money.amount(), dec!(19.99));
        assert!(Money::ZERO.amount().is_zero());
    }

    /// Each request context gets its own correlation id
    #[test]
    fn contexts_have_distinct_request_ids() {
        let first = RequestContext::new(1);
        let second = RequestContext::new(1);
        assert_ne!(first.request_id, second.request_id);
        assert_eq!(first.language, "en_us");
    }
}

// PRICING MODULE TESTS
#[cfg(test)]
mod pricing_tests {
    use super::*;

    /// One-time rows lose their term and renewal price
    #[test]
    fn one_time_rows_never_renew() {
        let input = PricingInput::new(12, Period::OneTime, dec!(50), "usd").set_renewal_price(dec!(40));
        let draft = PricingDraft::normalize(&input);

        assert_eq!(draft.term, 0);
        assert_eq!(draft.price_renews, None);
        assert_eq!(draft.currency, "USD");
    }

    /// A row with an id and no term asks for removal
    #[test]
    fn removal_rows() {
        assert!(PricingInput::remove(4).is_removal());
        assert!(!PricingInput::new(1, Period::Month, dec!(1), "USD").with_id(4).is_removal());
        assert!(!PricingInput::new(1, Period::Month, dec!(1), "USD").is_removal());
    }
}

// SEQUENCE MODULE TESTS
#[cfg(test)]
mod sequence_tests {
    use super::*;

    /// Codes substitute plain and padded placeholders
    #[test]
    fn formats_codes() {
        assert_eq!(format_code("{num}", 7), "7");
        assert_eq!(format_code("PKG-{num:4}", 7), "PKG-0007");
        assert_eq!(format_code("no placeholder", 7), "no placeholder");
    }

    /// The first number is the start, later ones step by the increment
    #[test]
    fn numbers_step_from_start() {
        let settings = SequenceSettings::new(1500, 5, "{num}");
        assert_eq!(next_value(None, &settings), 1500);
        assert_eq!(next_value(Some(1500), &settings), 1505);
        // a raised start skips ahead
        assert_eq!(next_value(Some(10), &settings), 1500);
    }
}

// RESOLVER AND CURRENCY TESTS
#[cfg(test)]
mod currency_tests {
    use super::*;

    /// Sub-cent amounts are shown at storage precision
    #[test]
    fn precision_upgrade() {
        assert_eq!(display_precision(dec!(10.00), 2), 2);
        assert_eq!(display_precision(dec!(10.005), 2), 4);
        assert_eq!(display_precision(dec!(3), 0), 0);
    }

    /// The default table only knows the base currency
    #[test]
    fn default_table_converts_base_only() {
        let table = CurrencyTable::from_config(&EngineConfig::default());
        assert_eq!(table.convert(dec!(5), "USD", "USD", 1).unwrap(), dec!(5));
        assert!(table.convert(dec!(5), "USD", "EUR", 1).is_err());
    }
}

// CONFIG MODULE TESTS
#[cfg(test)]
mod config_tests {
    use super::*;

    /// Unset fields fall back to defaults
    #[test]
    fn empty_config_uses_defaults() {
        let config = EngineConfig::from_json("{}").unwrap();
        assert_eq!(config.base_currency, "USD");
        assert_eq!(config.proration.precision, 4);
        assert!(!config.proration.allow_all_periods);
        assert_eq!(config.sequences.package.start, 1);
    }

    /// Contexts built from config carry its timezone
    #[test]
    fn context_uses_configured_timezone() {
        let config = EngineConfig::from_json(r#"{"timezone": "-05:00"}"#).unwrap();
        let ctx = config.context(3).unwrap();
        assert_eq!(ctx.company_id, 3);
        assert_eq!(ctx.timezone.local_minus_utc(), -5 * 3600);
    }
}

// OPTIONS, GROUPS AND USAGE TESTS
#[cfg(test)]
mod catalog_tests {
    use super::*;

    /// Option types parse from their names and group into families
    #[test]
    fn option_type_families() {
        assert_eq!("select".parse::<OptionType>(), Ok(OptionType::Select));
        assert!(OptionType::Quantity.is_single_value());
        assert!(!OptionType::Radio.is_single_value());
        assert!(OptionType::Password.is_text());
        assert!(OptionType::Checkbox.is_choice());
    }

    /// Explicit ordering moves listed members first
    #[test]
    fn reorders_members() {
        assert_eq!(reorder(&[10, 20, 30], &[30]), vec![30, 10, 20]);
        assert_eq!(reorder(&[10, 20, 30], &[40]), vec![10, 20, 30]);
    }

    /// Only canceled services stop counting as in use
    #[test]
    fn live_statuses() {
        assert!(ServiceStatus::Pending.is_live());
        assert!(ServiceStatus::Suspended.is_live());
        assert!(!ServiceStatus::Canceled.is_live());
    }
}
