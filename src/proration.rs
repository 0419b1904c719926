//! Partial-period pricing.
//!
//! A recurring service renews on its prorata day. A service started on any
//! other day is charged for the days up to the next prorata day (the anchor),
//! as a fraction of the billing period that ends on that anchor.
//!
//! "No proration" (`Ok(None)`) and "could not work out a date"
//! (`Err(ProrationError::Unresolvable)`) are kept apart throughout.
use crate::config::{ConfigError, EngineConfig};
use crate::error::ProrationError;
use crate::types::Period;
use chrono::{DateTime, Datelike, Days, FixedOffset, Months, NaiveDate, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use tracing::warn;

/// Last day of month usable as a prorata day or cutoff.
pub const MAX_PRORATA_DAY: u32 = 28;

/// A package's proration settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProrataPolicy {
    pub day: Option<u32>,
    pub cutoff: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct ProrationCalculator {
    timezone: FixedOffset,
    allow_all_periods: bool,
    precision: u32,
}

impl ProrationCalculator {
    pub fn new(timezone: FixedOffset) -> Self {
        Self {
            timezone,
            allow_all_periods: false,
            precision: 4,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(config.timezone_offset()?)
            .allow_all_periods(config.proration.allow_all_periods)
            .with_precision(config.proration.precision))
    }

    /// Also prorate `day` and `week` periods.
    pub fn allow_all_periods(mut self, allow: bool) -> Self {
        self.allow_all_periods = allow;
        self
    }

    pub fn with_precision(mut self, precision: u32) -> Self {
        self.precision = precision;
        self
    }

    pub fn can_prorate(&self, period: Period) -> bool {
        match period {
            Period::Month | Period::Year => true,
            Period::Day | Period::Week => self.allow_all_periods,
            Period::OneTime => false,
        }
    }

    fn local_date(&self, start: DateTime<Utc>) -> NaiveDate {
        start.with_timezone(&self.timezone).date_naive()
    }

    /// The anchor a service started at `start` prorates up to, or `None`
    /// when no proration applies.
    pub fn prorate_date(
        &self,
        start: DateTime<Utc>,
        prorata_day: u32,
        period: Period,
    ) -> Result<Option<NaiveDate>, ProrationError> {
        if !self.can_prorate(period) {
            return Ok(None);
        }
        if !(1..=MAX_PRORATA_DAY).contains(&prorata_day) {
            return Err(ProrationError::Unresolvable(format!(
                "prorata day {prorata_day} is outside 1..={}",
                MAX_PRORATA_DAY
            )));
        }

        let local = self.local_date(start);
        if local.day() == prorata_day {
            return Ok(None);
        }

        next_anchor(local, prorata_day).map(Some)
    }

    /// Days between the start and its anchor; 0 when no proration applies.
    pub fn days_to_prorate(
        &self,
        start: DateTime<Utc>,
        prorata_day: u32,
        period: Period,
    ) -> Result<i64, ProrationError> {
        Ok(match self.prorate_date(start, prorata_day, period)? {
            Some(anchor) => (anchor - self.local_date(start)).num_days(),
            None => 0,
        })
    }

    /// Length in days of the `term × period` billing period ending on `anchor`.
    pub fn days_in_period(
        &self,
        anchor: NaiveDate,
        term: u32,
        period: Period,
    ) -> Result<i64, ProrationError> {
        if term == 0 {
            return Err(ProrationError::Unresolvable("term must be positive".into()));
        }

        let period_start = match period {
            Period::Day => anchor.checked_sub_days(Days::new(term.into())),
            Period::Week => anchor.checked_sub_days(Days::new(u64::from(term) * 7)),
            Period::Month => anchor.checked_sub_months(Months::new(term)),
            Period::Year => term
                .checked_mul(12)
                .and_then(|months| anchor.checked_sub_months(Months::new(months))),
            Period::OneTime => None,
        };

        period_start
            .map(|from| (anchor - from).num_days())
            .ok_or_else(|| {
                ProrationError::Unresolvable(format!("no {term} {period} period ends on {anchor}"))
            })
    }

    /// Prorated `amount`, or the failure that prevented it.
    ///
    /// An `explicit_date` replaces the computed anchor; it must fall after the
    /// start and no further away than one billing period.
    pub fn try_prorate_price(
        &self,
        amount: Decimal,
        start: DateTime<Utc>,
        term: u32,
        period: Period,
        prorata_day: u32,
        explicit_date: Option<NaiveDate>,
    ) -> Result<Decimal, ProrationError> {
        if !self.can_prorate(period) {
            return Ok(amount);
        }

        let local = self.local_date(start);
        let anchor = match explicit_date {
            Some(date) if date <= local => {
                return Err(ProrationError::Unresolvable(format!(
                    "prorate date {date} is not after the start {local}"
                )));
            }
            Some(date) => date,
            None => match self.prorate_date(start, prorata_day, period)? {
                Some(anchor) => anchor,
                None => return Ok(amount),
            },
        };

        let days = (anchor - local).num_days();
        let period_days = self.days_in_period(anchor, term, period)?;
        if period_days <= 0 {
            return Err(ProrationError::Unresolvable(format!(
                "empty billing period ending {anchor}"
            )));
        }
        // a short period can end well before the next prorata day
        if days > period_days {
            return Err(ProrationError::Unresolvable(format!(
                "{anchor} is more than one {term} {period} period after {local}"
            )));
        }

        let prorated = amount
            .checked_mul(Decimal::from(days))
            .and_then(|total| total.checked_div(Decimal::from(period_days)))
            .ok_or_else(|| ProrationError::Unresolvable("prorated amount overflowed".into()))?;

        Ok(prorated.round_dp_with_strategy(self.precision, RoundingStrategy::MidpointAwayFromZero))
    }

    /// Prorated `amount`, falling back to the full amount when no prorate
    /// date can be resolved.
    pub fn prorate_price(
        &self,
        amount: Decimal,
        start: DateTime<Utc>,
        term: u32,
        period: Period,
        prorata_day: u32,
        explicit_date: Option<NaiveDate>,
    ) -> Decimal {
        match self.try_prorate_price(amount, start, term, period, prorata_day, explicit_date) {
            Ok(prorated) => prorated,
            Err(e) => {
                warn!(%start, term, %period, prorata_day, error = %e, "charging full amount");
                amount
            }
        }
    }

    /// Prorate date for an invoice, honoring the cutoff: past the cutoff day
    /// the next full period is charged instead.
    pub fn invoice_prorate_date(
        &self,
        start: DateTime<Utc>,
        policy: ProrataPolicy,
        period: Period,
    ) -> Result<Option<NaiveDate>, ProrationError> {
        let Some(day) = policy.day else {
            return Ok(None);
        };
        let local_day = self.local_date(start).day();
        if policy.cutoff.is_some_and(|cutoff| local_day > cutoff) {
            return Ok(None);
        }
        self.prorate_date(start, day, period)
    }
}

/// First date after `local` whose day of month is `day`.
fn next_anchor(local: NaiveDate, day: u32) -> Result<NaiveDate, ProrationError> {
    let month_start = local.with_day(1);
    let anchor = if local.day() < day {
        month_start.and_then(|d| d.with_day(day))
    } else {
        month_start
            .and_then(|d| d.checked_add_months(Months::new(1)))
            .and_then(|d| d.with_day(day))
    };

    anchor.ok_or_else(|| ProrationError::Unresolvable(format!("no anchor after {local}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Offset, TimeZone};
    use rust_decimal_macros::dec;

    fn utc() -> ProrationCalculator {
        ProrationCalculator::new(Utc.fix())
    }

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn anchors_to_next_prorata_day() {
        let calc = utc();
        assert_eq!(
            calc.prorate_date(at(2025, 1, 10, 12), 1, Period::Month).unwrap(),
            Some(date(2025, 2, 1))
        );
        assert_eq!(
            calc.prorate_date(at(2025, 1, 10, 12), 20, Period::Month).unwrap(),
            Some(date(2025, 1, 20))
        );
        assert_eq!(
            calc.prorate_date(at(2025, 12, 30, 0), 5, Period::Year).unwrap(),
            Some(date(2026, 1, 5))
        );
    }

    #[test]
    fn start_on_prorata_day_needs_no_proration() {
        let calc = utc().allow_all_periods(true);
        for period in Period::all() {
            assert_eq!(calc.prorate_date(at(2025, 3, 15, 8), 15, period).unwrap(), None);
        }
        assert_eq!(calc.days_to_prorate(at(2025, 3, 15, 8), 15, Period::Month).unwrap(), 0);
    }

    #[test]
    fn day_of_month_uses_company_timezone() {
        let start = at(2025, 3, 15, 2);
        let new_york = ProrationCalculator::new(FixedOffset::west_opt(5 * 3600).unwrap());

        // still the 14th locally
        assert_eq!(new_york.prorate_date(start, 14, Period::Month).unwrap(), None);
        assert_eq!(
            utc().prorate_date(start, 14, Period::Month).unwrap(),
            Some(date(2025, 4, 14))
        );
    }

    #[test]
    fn short_periods_need_widening() {
        let start = at(2025, 1, 10, 0);
        assert_eq!(utc().prorate_date(start, 1, Period::Week).unwrap(), None);
        assert_eq!(
            utc().allow_all_periods(true).prorate_date(start, 1, Period::Week).unwrap(),
            Some(date(2025, 2, 1))
        );
    }

    #[test]
    fn short_periods_charge_at_most_one_period() {
        let calc = utc().allow_all_periods(true);
        let start = at(2025, 1, 10, 0);

        // Feb 1 is 22 days out, past a 7 day or 1 day period
        for period in [Period::Week, Period::Day] {
            let result = calc.try_prorate_price(dec!(10), start, 1, period, 1, None);
            assert!(matches!(result, Err(ProrationError::Unresolvable(_))));
            assert_eq!(calc.prorate_price(dec!(10), start, 1, period, 1, None), dec!(10));
        }

        // 4 of the 7 days Jan 25 -> Feb 1
        assert_eq!(
            calc.try_prorate_price(dec!(10), at(2025, 1, 28, 0), 1, Period::Week, 1, None)
                .unwrap(),
            dec!(5.7143)
        );
        // a 4 week term covers the 22 days
        assert_eq!(
            calc.try_prorate_price(dec!(28), start, 4, Period::Week, 1, None).unwrap(),
            dec!(22)
        );
    }

    #[test]
    fn explicit_date_past_one_period_is_unresolvable() {
        let result =
            utc().try_prorate_price(dec!(31), at(2025, 1, 10, 0), 1, Period::Month, 1, Some(date(2025, 3, 20)));
        assert!(matches!(result, Err(ProrationError::Unresolvable(_))));
    }

    #[test]
    fn invalid_prorata_day_is_unresolvable() {
        let result = utc().prorate_date(at(2025, 1, 10, 0), 31, Period::Month);
        assert!(matches!(result, Err(ProrationError::Unresolvable(_))));

        let result = utc().days_in_period(date(2025, 2, 1), 0, Period::Month);
        assert!(matches!(result, Err(ProrationError::Unresolvable(_))));
    }

    #[test]
    fn prorates_by_days_in_billing_period() {
        let calc = utc();
        // Jan 10 -> Feb 1 is 22 days of the 31 day period Jan 1 -> Feb 1
        assert_eq!(calc.days_to_prorate(at(2025, 1, 10, 0), 1, Period::Month).unwrap(), 22);
        assert_eq!(calc.days_in_period(date(2025, 2, 1), 1, Period::Month).unwrap(), 31);
        assert_eq!(
            calc.prorate_price(dec!(31), at(2025, 1, 10, 0), 1, Period::Month, 1, None),
            dec!(22)
        );

        // 2024 is a leap year
        assert_eq!(calc.days_in_period(date(2024, 7, 1), 1, Period::Year).unwrap(), 366);
        assert_eq!(
            calc.prorate_price(dec!(10), at(2025, 1, 10, 0), 3, Period::Month, 1, None),
            dec!(2.3913)
        );
    }

    #[test]
    fn one_time_is_never_prorated() {
        let calc = utc().allow_all_periods(true);
        assert_eq!(
            calc.prorate_price(dec!(99.95), at(2025, 1, 10, 0), 0, Period::OneTime, 1, None),
            dec!(99.95)
        );
    }

    #[test]
    fn explicit_date_overrides_anchor() {
        let calc = utc();
        let start = at(2025, 1, 10, 0);
        assert_eq!(
            calc.try_prorate_price(dec!(31), start, 1, Period::Month, 1, Some(date(2025, 1, 20)))
                .unwrap(),
            // 10 of the 31 days Dec 20 -> Jan 20
            dec!(10)
        );

        let before = calc.try_prorate_price(dec!(31), start, 1, Period::Month, 1, Some(date(2025, 1, 10)));
        assert!(matches!(before, Err(ProrationError::Unresolvable(_))));
        // the soft variant charges the full amount instead
        assert_eq!(
            calc.prorate_price(dec!(31), start, 1, Period::Month, 1, Some(date(2025, 1, 10))),
            dec!(31)
        );
    }

    #[test]
    fn cutoff_skips_late_starts() {
        let calc = utc();
        let policy = ProrataPolicy { day: Some(1), cutoff: Some(20) };

        assert_eq!(
            calc.invoice_prorate_date(at(2025, 1, 10, 0), policy, Period::Month).unwrap(),
            Some(date(2025, 2, 1))
        );
        assert_eq!(
            calc.invoice_prorate_date(at(2025, 1, 25, 0), policy, Period::Month).unwrap(),
            None
        );
        assert_eq!(
            calc.invoice_prorate_date(at(2025, 1, 25, 0), ProrataPolicy::default(), Period::Month)
                .unwrap(),
            None
        );
    }
}
