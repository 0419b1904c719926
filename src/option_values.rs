//! Reconciliation of an option's value set.
//!
//! Submitted rows are classified in array order: an existing row with a blank
//! name is deleted (unless the type is text-like, where blank is the normal
//! state), everything else is normalized into a [`ValueShape`] and upserted.
//! Each surviving value then reconciles its own pricing rows.
//!
//! Validation runs over the final value set before anything is written.
use crate::options::OptionType;
use crate::pricing::{PricingInput, PricingPlan, PricingPolicy, PricingStore, plan_pricing};
use crate::store::{Tx, TxResult, keys, lift};
use crate::usage::ServiceUsageOracle;
use crate::validate::{Report, Rules, is_html_safe, join};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// What a value means, by option type.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub enum ValueShape {
    /// checkbox, radio and select
    #[n(0)]
    Choice {
        #[n(0)]
        value: String,
    },
    #[n(1)]
    Quantity {
        #[n(0)]
        min: u32,
        /// `None` is unlimited.
        #[n(1)]
        max: Option<u32>,
        #[n(2)]
        step: u32,
        #[n(3)]
        default_quantity: Option<u32>,
    },
    /// text, textarea and password; the client supplies the value.
    #[n(2)]
    Text,
}

impl ValueShape {
    pub fn normalize(option_type: OptionType, input: &ValueInput) -> Self {
        if option_type.is_text() {
            ValueShape::Text
        } else if option_type == OptionType::Quantity {
            ValueShape::Quantity {
                min: input.min.unwrap_or(0),
                max: input.max,
                step: input.step.unwrap_or(1),
                default_quantity: input.default_quantity,
            }
        } else {
            ValueShape::Choice {
                value: input.value.clone().unwrap_or_default().trim().to_string(),
            }
        }
    }

    /// Reshape a stored value after its option changed type.
    pub fn retype(&self, option_type: OptionType) -> Self {
        match (self, option_type) {
            (_, t) if t.is_text() => ValueShape::Text,
            (ValueShape::Quantity { .. }, OptionType::Quantity) => self.clone(),
            (_, OptionType::Quantity) => ValueShape::Quantity {
                min: 0,
                max: None,
                step: 1,
                default_quantity: None,
            },
            (ValueShape::Choice { .. }, _) => self.clone(),
            _ => ValueShape::Choice {
                value: String::new(),
            },
        }
    }

    pub fn choice_value(&self) -> Option<&str> {
        match self {
            ValueShape::Choice { value } => Some(value),
            _ => None,
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueStatus {
    #[n(0)]
    Active,
    #[n(1)]
    Inactive,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct OptionValue {
    #[n(0)]
    pub id: u64,
    #[n(1)]
    pub option_id: u64,
    #[n(2)]
    pub name: String,
    #[n(3)]
    pub shape: ValueShape,
    #[n(4)]
    pub default: bool,
    #[n(5)]
    pub status: ValueStatus,
    /// Zero-based display position.
    #[n(6)]
    pub order: u32,
    #[n(7)]
    pub pricing_ids: Vec<u64>,
}

/// A submitted value row.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueInput {
    pub id: Option<u64>,
    pub name: String,
    pub value: Option<String>,
    pub default: bool,
    pub status: ValueStatus,
    pub min: Option<u32>,
    pub max: Option<u32>,
    pub step: Option<u32>,
    pub default_quantity: Option<u32>,
    pub pricing: Vec<PricingInput>,
}

impl ValueInput {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            value: None,
            default: false,
            status: ValueStatus::Active,
            min: None,
            max: None,
            step: None,
            default_quantity: None,
            pricing: Vec::new(),
        }
    }

    pub fn choice(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(name).set_value(value)
    }

    pub fn quantity(name: impl Into<String>, min: u32, max: Option<u32>, step: u32) -> Self {
        let mut input = Self::new(name);
        input.min = Some(min);
        input.max = max;
        input.step = Some(step);
        input
    }

    /// Resubmit a stored value unchanged, pricing untouched.
    pub fn from_value(value: &OptionValue) -> Self {
        let mut input = Self::new(value.name.clone());
        input.id = Some(value.id);
        input.default = value.default;
        input.status = value.status;
        match &value.shape {
            ValueShape::Choice { value } => input.value = Some(value.clone()),
            ValueShape::Quantity {
                min,
                max,
                step,
                default_quantity,
            } => {
                input.min = Some(*min);
                input.max = *max;
                input.step = Some(*step);
                input.default_quantity = *default_quantity;
            }
            ValueShape::Text => {}
        }
        input
    }

    /// Ask for the stored value `id` to be deleted.
    pub fn remove(id: u64) -> Self {
        Self::new("").with_id(id)
    }

    pub fn with_id(mut self, id: u64) -> Self {
        self.id = Some(id);
        self
    }
    pub fn set_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
    pub fn set_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }
    pub fn set_default(mut self, default: bool) -> Self {
        self.default = default;
        self
    }
    pub fn set_status(mut self, status: ValueStatus) -> Self {
        self.status = status;
        self
    }
    pub fn set_default_quantity(mut self, quantity: u32) -> Self {
        self.default_quantity = Some(quantity);
        self
    }
    pub fn add_pricing(mut self, pricing: PricingInput) -> Self {
        self.pricing.push(pricing);
        self
    }

    /// Existing row with a blank name, on a type where blank means removal.
    pub fn is_delete(&self, option_type: OptionType) -> bool {
        self.id.is_some() && self.name.trim().is_empty() && !option_type.is_text()
    }
}

/// A value as it will exist once the submission is applied; the subject of
/// the set-level rules.
#[derive(Debug, Clone)]
pub struct ValueCandidate {
    pub field: String,
    pub name: String,
    pub shape: ValueShape,
    pub default: bool,
    pub status: ValueStatus,
}

fn value_rules<'a>(option_type: OptionType) -> Rules<'a, ValueCandidate> {
    let select = option_type == OptionType::Select;

    Rules::new()
        .rule("name", "required", "A name is required", move |v: &ValueCandidate| {
            option_type.is_text() || !v.name.is_empty()
        })
        .terminal()
        .rule("name", "html", "Select names may not contain markup characters", move |v: &ValueCandidate| {
            !select || is_html_safe(&v.name)
        })
        .rule("value", "html", "Select values may not contain markup characters", move |v: &ValueCandidate| {
            !select || v.shape.choice_value().is_none_or(is_html_safe)
        })
        .rule("max", "min", "Maximum may not be below the minimum", |v: &ValueCandidate| {
            match v.shape {
                ValueShape::Quantity { min, max, .. } => max.is_none_or(|max| min <= max),
                _ => true,
            }
        })
        .rule("step", "min", "Step must be at least 1", |v: &ValueCandidate| match v.shape {
            ValueShape::Quantity { step, .. } => step >= 1,
            _ => true,
        })
        .terminal()
        .rule(
            "default_quantity",
            "range",
            "Default quantity must be a step within the minimum and maximum",
            |v: &ValueCandidate| match v.shape {
                ValueShape::Quantity {
                    min,
                    max,
                    step,
                    default_quantity: Some(quantity),
                } => {
                    quantity >= min
                        && max.is_none_or(|max| quantity <= max)
                        && (quantity - min).checked_rem(step) == Some(0)
                }
                _ => true,
            },
        )
        .linked_to("step")
        .rule("default", "active", "The default value must be active", |v: &ValueCandidate| {
            !v.default || v.status == ValueStatus::Active
        })
}

/// Rules over the whole value set.
pub fn check_value_set(option_type: OptionType, values: &[ValueCandidate], report: &mut Report) {
    let rules = value_rules(option_type);
    for value in values {
        rules.check(value, &value.field, report);
    }

    if option_type.is_single_value() && values.len() != 1 {
        report.push(
            "values",
            "count",
            format!("A {option_type} option must have exactly one value"),
        );
    } else if values.is_empty() {
        report.push("values", "count", "At least one value is required");
    }

    if !values.is_empty() && values.iter().all(|v| v.status != ValueStatus::Active) {
        report.push("values", "active", "At least one value must be active");
    }

    if values.iter().filter(|v| v.default).count() > 1 {
        report.push("values", "default", "Only one value may be the default");
    }

    if option_type.is_choice() {
        let mut seen = HashSet::new();
        for value in values {
            let Some(choice) = value.shape.choice_value() else {
                continue;
            };
            if !seen.insert(choice) {
                report.push(
                    join(&value.field, "value"),
                    "unique",
                    format!("The value '{choice}' is used more than once"),
                );
            }
        }
    }
}

/// A submitted value after classification.
#[derive(Debug, Clone)]
pub struct PlannedValue {
    pub id: Option<u64>,
    pub name: String,
    pub shape: ValueShape,
    pub default: bool,
    pub status: ValueStatus,
    pub owned_pricing: Vec<u64>,
    pub pricing: PricingPlan,
}

#[derive(Debug, Default, Clone)]
pub struct ValuePlan {
    pub deletes: Vec<OptionValue>,
    pub upserts: Vec<PlannedValue>,
    /// Stored values the submission did not mention, reshaped for the
    /// option's type; ordered after the submitted ones.
    pub untouched: Vec<OptionValue>,
}

pub struct OptionValueReconciler<'a> {
    usage: &'a dyn ServiceUsageOracle,
}

impl<'a> OptionValueReconciler<'a> {
    pub fn new(usage: &'a dyn ServiceUsageOracle) -> Self {
        Self { usage }
    }

    /// Classify and validate `submitted` against the option's stored values.
    /// Violations land in `report`; nothing is written.
    pub fn plan(
        &self,
        tx: &Tx<'_>,
        stored_ids: &[u64],
        option_type: OptionType,
        submitted: &[ValueInput],
        report: &mut Report,
    ) -> TxResult<ValuePlan> {
        let mut stored: HashMap<u64, OptionValue> = HashMap::new();
        for id in stored_ids {
            stored.insert(*id, tx.require(&keys::option_value(*id), "option value", *id)?);
        }

        let mut plan = ValuePlan::default();
        let mut candidates = Vec::new();
        let mentioned: HashSet<u64> = submitted.iter().filter_map(|v| v.id).collect();

        for (i, input) in submitted.iter().enumerate() {
            let field = format!("values[{i}]");

            let existing = match input.id {
                Some(id) => match stored.get(&id) {
                    Some(value) => Some(value),
                    None => {
                        report.push(join(&field, "id"), "exists", format!("Value {id} does not belong to this option"));
                        continue;
                    }
                },
                None => None,
            };

            if let Some(value) = existing.filter(|_| input.is_delete(option_type)) {
                if lift(self.usage.is_option_value_in_use(value.id, None))? {
                    report.push(
                        join(&field, "id"),
                        "in_use",
                        "A value selected by a service may not be removed",
                    );
                }
                plan.deletes.push(value.clone());
                continue;
            }

            let shape = ValueShape::normalize(option_type, input);
            let name = if option_type.is_text() {
                String::new()
            } else {
                input.name.trim().to_string()
            };

            let changed = existing.filter(|value| {
                option_type.is_choice() && value.shape.choice_value() != shape.choice_value()
            });
            if let Some(value) = changed {
                if lift(self.usage.is_option_value_in_use(value.id, None))? {
                    report.push(
                        join(&field, "value"),
                        "in_use",
                        "A value selected by a service may not change",
                    );
                }
            }

            let owned_pricing = existing.map(|v| v.pricing_ids.clone()).unwrap_or_default();
            let value_id = input.id;
            let in_use = |pricing_id: u64| match value_id {
                Some(value_id) => self.usage.is_option_value_in_use(value_id, Some(pricing_id)),
                None => Ok(false),
            };
            let pricing = plan_pricing(
                tx,
                &owned_pricing,
                &input.pricing,
                PricingPolicy::OPTION_VALUE,
                &in_use,
                &join(&field, "pricing"),
                report,
            )?;

            candidates.push(ValueCandidate {
                field,
                name: name.clone(),
                shape: shape.clone(),
                default: input.default,
                status: input.status,
            });
            plan.upserts.push(PlannedValue {
                id: input.id,
                name,
                shape,
                default: input.default,
                status: input.status,
                owned_pricing,
                pricing,
            });
        }

        for id in stored_ids.iter().filter(|id| !mentioned.contains(id)) {
            let Some(value) = stored.get(id) else {
                continue;
            };
            let mut value = value.clone();
            value.shape = value.shape.retype(option_type);
            if option_type.is_text() {
                value.name.clear();
            }

            candidates.push(ValueCandidate {
                field: format!("values.{id}"),
                name: value.name.clone(),
                shape: value.shape.clone(),
                default: value.default,
                status: value.status,
            });
            plan.untouched.push(value);
        }

        check_value_set(option_type, &candidates, report);
        Ok(plan)
    }

    /// Write a validated plan; returns the option's value ids in order.
    pub fn apply(
        &self,
        tx: &Tx<'_>,
        option_id: u64,
        company_id: u64,
        plan: &ValuePlan,
    ) -> TxResult<Vec<u64>> {
        for value in &plan.deletes {
            for pricing_id in &value.pricing_ids {
                tx.delete_pricing(*pricing_id)?;
            }
            tx.remove(&keys::option_value(value.id))?;
            debug!(value_id = value.id, option_id, "deleted option value");
        }

        let mut ids = Vec::with_capacity(plan.upserts.len() + plan.untouched.len());
        let mut order = 0;

        for planned in &plan.upserts {
            let id = match planned.id {
                Some(id) => id,
                None => tx.next_id()?,
            };
            let value = OptionValue {
                id,
                option_id,
                name: planned.name.clone(),
                shape: planned.shape.clone(),
                default: planned.default,
                status: planned.status,
                order,
                pricing_ids: planned.pricing.apply(tx, company_id, &planned.owned_pricing)?,
            };
            tx.put(&keys::option_value(id), &value)?;
            ids.push(id);
            order += 1;
        }

        for untouched in &plan.untouched {
            let mut value = untouched.clone();
            value.order = order;
            tx.put(&keys::option_value(value.id), &value)?;
            ids.push(value.id);
            order += 1;
        }

        Ok(ids)
    }

    /// Plan and apply in one step, aborting on any violation.
    pub fn reconcile_values(
        &self,
        tx: &Tx<'_>,
        option_id: u64,
        company_id: u64,
        stored_ids: &[u64],
        option_type: OptionType,
        submitted: &[ValueInput],
    ) -> TxResult<Vec<u64>> {
        let mut report = Report::new();
        let plan = self.plan(tx, stored_ids, option_type, submitted, &mut report)?;
        report.into_tx()?;
        self.apply(tx, option_id, company_id, &plan)
    }

    /// Reconcile the pricing rows of one stored value.
    pub fn reconcile_pricing(
        &self,
        tx: &Tx<'_>,
        value_id: u64,
        company_id: u64,
        submitted: &[PricingInput],
    ) -> TxResult<Vec<u64>> {
        let mut value: OptionValue = tx.require(&keys::option_value(value_id), "option value", value_id)?;

        let mut report = Report::new();
        let in_use = |pricing_id: u64| self.usage.is_option_value_in_use(value_id, Some(pricing_id));
        let plan = plan_pricing(
            tx,
            &value.pricing_ids,
            submitted,
            PricingPolicy::OPTION_VALUE,
            &in_use,
            "pricing",
            &mut report,
        )?;
        report.into_tx()?;

        value.pricing_ids = plan.apply(tx, company_id, &value.pricing_ids)?;
        tx.put(&keys::option_value(value_id), &value)?;
        Ok(value.pricing_ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(field: &str, name: &str, shape: ValueShape) -> ValueCandidate {
        ValueCandidate {
            field: field.to_string(),
            name: name.to_string(),
            shape,
            default: false,
            status: ValueStatus::Active,
        }
    }

    fn choice(value: &str) -> ValueShape {
        ValueShape::Choice {
            value: value.to_string(),
        }
    }

    fn rules_of(report: &Report) -> Vec<(&str, &str)> {
        report
            .violations()
            .iter()
            .map(|v| (v.field.as_str(), v.rule))
            .collect()
    }

    #[test]
    fn normalizes_by_type() {
        let input = ValueInput::choice("Extra", " 10 ").set_default_quantity(4);
        assert_eq!(ValueShape::normalize(OptionType::Select, &input), choice("10"));
        assert_eq!(ValueShape::normalize(OptionType::Password, &input), ValueShape::Text);
        assert_eq!(
            ValueShape::normalize(OptionType::Quantity, &input),
            ValueShape::Quantity {
                min: 0,
                max: None,
                step: 1,
                default_quantity: Some(4),
            }
        );
    }

    #[test]
    fn text_rows_are_never_deleted() {
        let input = ValueInput::remove(3);
        assert!(input.is_delete(OptionType::Radio));
        assert!(!input.is_delete(OptionType::Textarea));
        assert!(!ValueInput::new("").is_delete(OptionType::Radio));
    }

    #[test]
    fn checkbox_takes_exactly_one_value() {
        let values = vec![
            candidate("values[0]", "Backup", choice("1")),
            candidate("values[1]", "Backup 2", choice("2")),
        ];
        let mut report = Report::new();
        check_value_set(OptionType::Checkbox, &values, &mut report);

        assert_eq!(rules_of(&report), vec![("values", "count")]);
    }

    #[test]
    fn duplicate_select_values_fail() {
        let values = vec![
            candidate("values[0]", "Small", choice("s")),
            candidate("values[1]", "Also small", choice("s")),
        ];
        let mut report = Report::new();
        check_value_set(OptionType::Select, &values, &mut report);

        assert_eq!(rules_of(&report), vec![("values[1].value", "unique")]);
    }

    #[test]
    fn default_must_be_single_and_active() {
        let mut first = candidate("values[0]", "One", choice("1"));
        first.default = true;
        first.status = ValueStatus::Inactive;
        let mut second = candidate("values[1]", "Two", choice("2"));
        second.default = true;
        second.status = ValueStatus::Inactive;

        let mut report = Report::new();
        check_value_set(OptionType::Radio, &[first, second], &mut report);

        assert_eq!(
            rules_of(&report),
            vec![
                ("values[0].default", "active"),
                ("values[1].default", "active"),
                ("values", "active"),
                ("values", "default"),
            ]
        );
    }

    #[test]
    fn quantity_bounds() {
        let shape = |min, max, step, default_quantity| ValueShape::Quantity {
            min,
            max,
            step,
            default_quantity,
        };
        let check = |shape: ValueShape| {
            let mut report = Report::new();
            check_value_set(OptionType::Quantity, &[candidate("values[0]", "Disk", shape)], &mut report);
            report
                .violations()
                .iter()
                .map(|v| v.rule)
                .collect::<Vec<_>>()
        };

        assert!(check(shape(0, Some(10), 2, Some(4))).is_empty());
        assert_eq!(check(shape(5, Some(1), 1, None)), vec!["min"]);
        assert_eq!(check(shape(0, Some(10), 2, Some(5))), vec!["range"]);
        assert_eq!(check(shape(0, Some(10), 1, Some(11))), vec!["range"]);
        // zero step reports once; the default quantity rule is skipped
        assert_eq!(check(shape(0, None, 0, Some(3))), vec!["min"]);
    }

    #[test]
    fn select_values_must_be_html_safe() {
        let values = vec![candidate("values[0]", "<b>Big</b>", choice("a&b"))];
        let mut report = Report::new();
        check_value_set(OptionType::Select, &values, &mut report);
        assert_eq!(
            rules_of(&report),
            vec![("values[0].name", "html"), ("values[0].value", "html")]
        );

        let mut report = Report::new();
        check_value_set(OptionType::Radio, &values, &mut report);
        assert!(report.is_empty());
    }

    #[test]
    fn retype_keeps_compatible_shapes() {
        let quantity = ValueShape::Quantity {
            min: 1,
            max: Some(4),
            step: 1,
            default_quantity: None,
        };
        assert_eq!(quantity.retype(OptionType::Quantity), quantity);
        assert_eq!(quantity.retype(OptionType::Select), choice(""));
        assert_eq!(choice("x").retype(OptionType::Radio), choice("x"));
        assert_eq!(choice("x").retype(OptionType::Text), ValueShape::Text);
    }
}
