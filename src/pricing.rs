//! Pricing rows shared by packages and option values.
//!
//! Both owners reconcile submitted rows the same way: a row with an id and no
//! term is a removal, a row with an id and a term is an update, a row without
//! an id is new. What differs is what happens when a removal targets a row a
//! live service still uses, see [`PricingPolicy`].
use crate::error::PricingError;
use crate::store::{Tx, TxResult, abort, keys, lift};
use crate::types::{MAX_TERM, Money, Period, ReconcileWarning, validate_term};
use crate::validate::{Report, Rules, join};
use rust_decimal::Decimal;
use std::collections::HashSet;
use tracing::warn;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct PricingRow {
    #[n(0)]
    pub id: u64,
    #[n(1)]
    pub company_id: u64,
    #[n(2)]
    pub term: u32,
    #[n(3)]
    pub period: Period,
    #[n(4)]
    pub price: Money,
    #[n(5)]
    pub price_renews: Option<Money>,
    #[n(6)]
    pub price_transfer: Option<Money>,
    #[n(7)]
    pub setup_fee: Money,
    #[n(8)]
    pub cancel_fee: Money,
    #[n(9)]
    pub currency: String,
}

impl PricingRow {
    /// Price charged on renewal; falls back to the initial price.
    pub fn renewal_price(&self) -> Money {
        self.price_renews.unwrap_or(self.price)
    }

    pub fn matches(&self, term: u32, period: Period, currency: &str) -> bool {
        self.term == term && self.period == period && self.currency == currency
    }
}

/// A submitted pricing row.
#[derive(Debug, Clone, PartialEq)]
pub struct PricingInput {
    pub id: Option<u64>,
    pub term: Option<u32>,
    pub period: Period,
    pub price: Decimal,
    pub price_renews: Option<Decimal>,
    pub price_transfer: Option<Decimal>,
    pub setup_fee: Option<Decimal>,
    pub cancel_fee: Option<Decimal>,
    pub currency: String,
}

impl PricingInput {
    pub fn new(term: u32, period: Period, price: Decimal, currency: &str) -> Self {
        Self {
            id: None,
            term: Some(term),
            period,
            price,
            price_renews: None,
            price_transfer: None,
            setup_fee: None,
            cancel_fee: None,
            currency: currency.to_string(),
        }
    }

    /// Resubmit a stored row unchanged.
    pub fn from_row(row: &PricingRow) -> Self {
        Self {
            id: Some(row.id),
            term: Some(row.term),
            period: row.period,
            price: row.price.amount(),
            price_renews: row.price_renews.map(|m| m.amount()),
            price_transfer: row.price_transfer.map(|m| m.amount()),
            setup_fee: Some(row.setup_fee.amount()),
            cancel_fee: Some(row.cancel_fee.amount()),
            currency: row.currency.clone(),
        }
    }

    /// Ask for the stored row `id` to be removed.
    pub fn remove(id: u64) -> Self {
        Self {
            id: Some(id),
            term: None,
            period: Period::Month,
            price: Decimal::ZERO,
            price_renews: None,
            price_transfer: None,
            setup_fee: None,
            cancel_fee: None,
            currency: String::new(),
        }
    }

    pub fn with_id(mut self, id: u64) -> Self {
        self.id = Some(id);
        self
    }
    pub fn set_renewal_price(mut self, price: Decimal) -> Self {
        self.price_renews = Some(price);
        self
    }
    pub fn set_transfer_price(mut self, price: Decimal) -> Self {
        self.price_transfer = Some(price);
        self
    }
    pub fn set_setup_fee(mut self, fee: Decimal) -> Self {
        self.setup_fee = Some(fee);
        self
    }
    pub fn set_cancel_fee(mut self, fee: Decimal) -> Self {
        self.cancel_fee = Some(fee);
        self
    }
    pub fn set_price(mut self, price: Decimal) -> Self {
        self.price = price;
        self
    }
    pub fn clear_term(mut self) -> Self {
        self.term = None;
        self
    }

    pub fn is_removal(&self) -> bool {
        self.id.is_some() && self.term.is_none()
    }
}

/// A submitted row after normalization, ready to persist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PricingDraft {
    pub term: u32,
    pub period: Period,
    pub price: Money,
    pub price_renews: Option<Money>,
    pub price_transfer: Option<Money>,
    pub setup_fee: Money,
    pub cancel_fee: Money,
    pub currency: String,
}

impl PricingDraft {
    /// One-time rows never renew: term 0 and no renewal price.
    pub fn normalize(input: &PricingInput) -> Self {
        let one_time = input.period == Period::OneTime;
        Self {
            term: if one_time { 0 } else { input.term.unwrap_or(0) },
            period: input.period,
            price: input.price.into(),
            price_renews: if one_time {
                None
            } else {
                input.price_renews.map(Money::from)
            },
            price_transfer: input.price_transfer.map(Money::from),
            setup_fee: input.setup_fee.unwrap_or_default().into(),
            cancel_fee: input.cancel_fee.unwrap_or_default().into(),
            currency: input.currency.trim().to_ascii_uppercase(),
        }
    }

    fn changes_identity(&self, stored: &PricingRow) -> bool {
        self.term != stored.term || self.period != stored.period || self.currency != stored.currency
    }
}

pub fn pricing_rules<'a>() -> Rules<'a, PricingInput> {
    let non_negative = |amount: Option<Decimal>| amount.is_none_or(|a| !a.is_sign_negative());

    Rules::new()
        .rule("term", "required", "A term is required for recurring periods", |p: &PricingInput| {
            p.period == Period::OneTime || p.term.is_some()
        })
        .terminal()
        .rule(
            "term",
            "valid",
            format!("Term must be between 1 and {}", MAX_TERM),
            |p: &PricingInput| p.term.is_none_or(|term| validate_term(term, p.period)),
        )
        .rule("price", "min", "Price may not be negative", move |p: &PricingInput| {
            non_negative(Some(p.price))
        })
        .rule("price_renews", "min", "Renewal price may not be negative", move |p: &PricingInput| {
            non_negative(p.price_renews)
        })
        .rule("price_transfer", "min", "Transfer price may not be negative", move |p: &PricingInput| {
            non_negative(p.price_transfer)
        })
        .rule("setup_fee", "min", "Setup fee may not be negative", move |p: &PricingInput| {
            non_negative(p.setup_fee)
        })
        .rule("cancel_fee", "min", "Cancel fee may not be negative", move |p: &PricingInput| {
            non_negative(p.cancel_fee)
        })
        .rule("currency", "format", "Currency must be a three letter code", |p: &PricingInput| {
            let code = p.currency.trim();
            code.len() == 3 && code.chars().all(|c| c.is_ascii_alphabetic())
        })
        .terminal()
}

/// Persistence of pricing rows.
pub trait PricingStore {
    fn load_pricing(&self, id: u64) -> TxResult<Option<PricingRow>>;
    fn insert_pricing(&self, company_id: u64, draft: &PricingDraft) -> TxResult<PricingRow>;
    fn update_pricing(&self, id: u64, draft: &PricingDraft) -> TxResult<PricingRow>;
    fn delete_pricing(&self, id: u64) -> TxResult<()>;
}

impl PricingStore for Tx<'_> {
    fn load_pricing(&self, id: u64) -> TxResult<Option<PricingRow>> {
        self.get(&keys::pricing(id))
    }

    fn insert_pricing(&self, company_id: u64, draft: &PricingDraft) -> TxResult<PricingRow> {
        let row = build_row(self.next_id()?, company_id, draft);
        self.put(&keys::pricing(row.id), &row)?;
        Ok(row)
    }

    fn update_pricing(&self, id: u64, draft: &PricingDraft) -> TxResult<PricingRow> {
        let stored: PricingRow = self.require(&keys::pricing(id), "pricing", id)?;
        let row = build_row(id, stored.company_id, draft);
        self.put(&keys::pricing(id), &row)?;
        Ok(row)
    }

    fn delete_pricing(&self, id: u64) -> TxResult<()> {
        self.remove(&keys::pricing(id))
    }
}

fn build_row(id: u64, company_id: u64, draft: &PricingDraft) -> PricingRow {
    PricingRow {
        id,
        company_id,
        term: draft.term,
        period: draft.period,
        price: draft.price,
        price_renews: draft.price_renews,
        price_transfer: draft.price_transfer,
        setup_fee: draft.setup_fee,
        cancel_fee: draft.cancel_fee,
        currency: draft.currency.clone(),
    }
}

/// What a removal of an in-use row does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InUseRemoval {
    /// Report a violation and fail the submission.
    Reject,
    /// Keep the row unchanged and carry on, reporting a warning.
    Retain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PricingPolicy {
    pub in_use_removal: InUseRemoval,
    /// Stored rows missing from the submission are removal requests.
    pub omitted_rows_removed: bool,
    /// New rows start without a cancel fee.
    pub insert_without_cancel_fee: bool,
}

impl PricingPolicy {
    pub const PACKAGE: PricingPolicy = PricingPolicy {
        in_use_removal: InUseRemoval::Retain,
        omitted_rows_removed: true,
        insert_without_cancel_fee: false,
    };

    pub const OPTION_VALUE: PricingPolicy = PricingPolicy {
        in_use_removal: InUseRemoval::Reject,
        omitted_rows_removed: false,
        insert_without_cancel_fee: true,
    };
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PricingPlan {
    pub deletes: Vec<u64>,
    pub updates: Vec<(u64, PricingDraft)>,
    pub inserts: Vec<PricingDraft>,
    pub warnings: Vec<ReconcileWarning>,
}

impl PricingPlan {
    /// Persist the plan; returns the owner's pricing ids afterwards.
    pub fn apply(&self, tx: &Tx<'_>, company_id: u64, owned: &[u64]) -> TxResult<Vec<u64>> {
        for id in &self.deletes {
            tx.delete_pricing(*id)?;
        }
        for (id, draft) in &self.updates {
            tx.update_pricing(*id, draft)?;
        }

        let mut ids: Vec<u64> = owned
            .iter()
            .copied()
            .filter(|id| !self.deletes.contains(id))
            .collect();
        for draft in &self.inserts {
            ids.push(tx.insert_pricing(company_id, draft)?.id);
        }
        Ok(ids)
    }
}

/// Classify and validate `submitted` against the rows the owner holds.
///
/// `in_use` answers whether a live service references a row. Violations land
/// in `report`; the caller aborts once every rule of the submission ran.
pub fn plan_pricing(
    tx: &Tx<'_>,
    owned: &[u64],
    submitted: &[PricingInput],
    policy: PricingPolicy,
    in_use: &dyn Fn(u64) -> Result<bool, PricingError>,
    prefix: &str,
    report: &mut Report,
) -> TxResult<PricingPlan> {
    let rules = pricing_rules();
    let mut plan = PricingPlan::default();
    let mentioned: HashSet<u64> = submitted.iter().filter_map(|p| p.id).collect();

    for (i, input) in submitted.iter().enumerate() {
        let field = format!("{prefix}[{i}]");

        let Some(id) = input.id else {
            rules.check(input, &field, report);
            let mut draft = PricingDraft::normalize(input);
            if policy.insert_without_cancel_fee {
                draft.cancel_fee = Money::ZERO;
            }
            plan.inserts.push(draft);
            continue;
        };

        if !owned.contains(&id) {
            report.push(join(&field, "id"), "exists", format!("Pricing {id} does not belong here"));
            continue;
        }

        if input.is_removal() {
            plan_removal(&mut plan, id, policy, in_use, &field, report)?;
            continue;
        }

        rules.check(input, &field, report);
        let draft = PricingDraft::normalize(input);
        let Some(stored) = tx.load_pricing(id)? else {
            return abort(PricingError::NotFound { entity: "pricing", id });
        };
        if draft.changes_identity(&stored) && lift(in_use(id))? {
            report.push(
                join(&field, "term"),
                "in_use",
                "Pricing in use by a service may not change its term, period or currency",
            );
        }
        plan.updates.push((id, draft));
    }

    if policy.omitted_rows_removed {
        for id in owned.iter().filter(|id| !mentioned.contains(id)) {
            plan_removal(&mut plan, *id, policy, in_use, prefix, report)?;
        }
    }

    Ok(plan)
}

fn plan_removal(
    plan: &mut PricingPlan,
    id: u64,
    policy: PricingPolicy,
    in_use: &dyn Fn(u64) -> Result<bool, PricingError>,
    field: &str,
    report: &mut Report,
) -> TxResult<()> {
    if plan.deletes.contains(&id) {
        return Ok(());
    }
    if !lift(in_use(id))? {
        plan.deletes.push(id);
        return Ok(());
    }

    match policy.in_use_removal {
        InUseRemoval::Reject => {
            report.push(
                join(field, "id"),
                "in_use",
                format!("Pricing {id} is in use by a service and may not be removed"),
            );
        }
        InUseRemoval::Retain => {
            warn!(pricing_id = id, "pricing in use by a service, keeping it instead of removing");
            plan.warnings.push(ReconcileWarning::PricingRetained { pricing_id: id });
        }
    }
    Ok(())
}
