//! Shared value types: periods, money, request context.
use chrono::{FixedOffset, Offset, Utc};
use rust_decimal::Decimal;
use std::fmt;
use std::str::FromStr;

/// Longest term a pricing row accepts.
pub const MAX_TERM: u32 = 65535;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Period {
    #[n(0)]
    Day,
    #[n(1)]
    Week,
    #[n(2)]
    Month,
    #[n(3)]
    Year,
    #[n(4)]
    OneTime,
}

impl Period {
    pub fn as_str(&self) -> &'static str {
        match self {
            Period::Day => "day",
            Period::Week => "week",
            Period::Month => "month",
            Period::Year => "year",
            Period::OneTime => "onetime",
        }
    }

    pub fn is_recurring(&self) -> bool {
        !matches!(self, Period::OneTime)
    }

    pub fn all() -> [Period; 5] {
        [
            Period::Day,
            Period::Week,
            Period::Month,
            Period::Year,
            Period::OneTime,
        ]
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Period {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Period::all()
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| format!("'{s}' is not a valid period"))
    }
}

/// A term is valid when positive, or for any value on a one-time period.
pub fn validate_term(term: u32, period: Period) -> bool {
    period == Period::OneTime || (term > 0 && term <= MAX_TERM)
}

/// Decimal amount persisted as its exact string form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct Money(Decimal);

impl Money {
    pub const ZERO: Money = Money(Decimal::ZERO);

    pub fn amount(&self) -> Decimal {
        self.0
    }
}

impl From<Decimal> for Money {
    fn from(value: Decimal) -> Self {
        Money(value)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl<C> minicbor::Encode<C> for Money {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        e.str(&self.0.to_string())?.ok()
    }
}

impl<'b, C> minicbor::Decode<'b, C> for Money {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let text = d.str()?;

        Decimal::from_str(text)
            .map(Money)
            .map_err(|_| minicbor::decode::Error::message("failed to parse decimal amount"))
    }
}

/// Module-specific key/value pair stored on a package.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct MetaField {
    #[n(0)]
    pub key: String,
    #[n(1)]
    pub value: String,
    #[n(2)]
    pub encrypted: bool,
}

impl MetaField {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            encrypted: false,
        }
    }
}

/// Scope for every service call: company, language and timezone.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub company_id: u64,
    pub language: String,
    pub timezone: FixedOffset,
    pub request_id: String,
}

impl RequestContext {
    pub fn new(company_id: u64) -> Self {
        Self {
            company_id,
            language: "en_us".to_string(),
            timezone: Utc.fix(),
            request_id: uuid7::uuid7().to_string(),
        }
    }

    pub fn with_timezone(mut self, timezone: FixedOffset) -> Self {
        self.timezone = timezone;
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }
}

/// Edits the engine applied differently than submitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileWarning {
    /// A pricing row submitted for removal is still referenced by a live
    /// service and was kept unchanged.
    PricingRetained { pricing_id: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn money_encoding_keeps_scale() {
        let original = Money::from(dec!(19.9990));

        let encoding = minicbor::to_vec(original).unwrap();
        let decode: Money = minicbor::decode(&encoding).unwrap();

        assert_eq!(original, decode);
        assert_eq!(decode.to_string(), "19.9990");
    }

    #[test]
    fn period_parsing() {
        assert_eq!("month".parse::<Period>().unwrap(), Period::Month);
        assert_eq!("onetime".parse::<Period>().unwrap(), Period::OneTime);
        assert!("fortnight".parse::<Period>().is_err());
    }

    #[test]
    fn term_validation() {
        assert!(validate_term(1, Period::Month));
        assert!(!validate_term(0, Period::Month));
        assert!(validate_term(0, Period::OneTime));
        assert!(validate_term(MAX_TERM + 1, Period::OneTime));
        assert!(!validate_term(MAX_TERM + 1, Period::Year));
    }
}
