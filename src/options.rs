//! Configurable options: add-ons offered with a package through option groups.
use crate::config::EngineConfig;
use crate::currency::{CurrencyConverter, CurrencyTable};
use crate::error::PricingError;
use crate::groups::{OptionGroup, check_option_groups, sync_option_group_options};
use crate::option_values::{OptionValue, OptionValueReconciler, ValueInput};
use crate::packages::Package;
use crate::pricing::{PricingRow, PricingStore};
use crate::resolver::{PriceTermResolver, ResolvedPrice};
use crate::store::{Store, Tx, TxResult, abort, keys, lift};
use crate::types::{Period, RequestContext};
use crate::usage::{ServiceLedger, ServiceUsageOracle};
use crate::validate::{Report, Rules};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptionType {
    #[n(0)]
    Checkbox,
    #[n(1)]
    Radio,
    #[n(2)]
    Select,
    #[n(3)]
    Quantity,
    #[n(4)]
    Text,
    #[n(5)]
    Textarea,
    #[n(6)]
    Password,
}

impl OptionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptionType::Checkbox => "checkbox",
            OptionType::Radio => "radio",
            OptionType::Select => "select",
            OptionType::Quantity => "quantity",
            OptionType::Text => "text",
            OptionType::Textarea => "textarea",
            OptionType::Password => "password",
        }
    }

    pub fn all() -> [OptionType; 7] {
        [
            OptionType::Checkbox,
            OptionType::Radio,
            OptionType::Select,
            OptionType::Quantity,
            OptionType::Text,
            OptionType::Textarea,
            OptionType::Password,
        ]
    }

    /// Types owning exactly one value row.
    pub fn is_single_value(&self) -> bool {
        !matches!(self, OptionType::Radio | OptionType::Select)
    }

    /// Types whose value the client types in.
    pub fn is_text(&self) -> bool {
        matches!(self, OptionType::Text | OptionType::Textarea | OptionType::Password)
    }

    /// Types whose values carry a fixed `value`.
    pub fn is_choice(&self) -> bool {
        matches!(self, OptionType::Checkbox | OptionType::Radio | OptionType::Select)
    }
}

impl fmt::Display for OptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OptionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OptionType::all()
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("'{s}' is not a valid option type"))
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct PackageOption {
    #[n(0)]
    pub id: u64,
    #[n(1)]
    pub company_id: u64,
    /// Shown to clients.
    #[n(2)]
    pub label: String,
    /// Field name the provisioning module reads.
    #[n(3)]
    pub name: String,
    #[n(4)]
    pub option_type: OptionType,
    /// May be added to an existing service.
    #[n(5)]
    pub addable: bool,
    /// May be changed on an existing service.
    #[n(6)]
    pub editable: bool,
    #[n(7)]
    pub hidden: bool,
    #[n(8)]
    pub description: Option<String>,
    #[n(9)]
    pub group_ids: Vec<u64>,
    #[n(10)]
    pub value_ids: Vec<u64>,
}

/// Fields to set on an option; `None` leaves the stored field alone.
#[derive(Debug, Clone, Default)]
pub struct OptionInput {
    pub label: Option<String>,
    pub name: Option<String>,
    pub option_type: Option<OptionType>,
    pub addable: Option<bool>,
    pub editable: Option<bool>,
    pub hidden: Option<bool>,
    pub description: Option<Option<String>>,
    pub group_ids: Option<Vec<u64>>,
    pub values: Option<Vec<ValueInput>>,
}

impl OptionInput {
    pub fn new(label: impl Into<String>, name: impl Into<String>, option_type: OptionType) -> Self {
        Self {
            label: Some(label.into()),
            name: Some(name.into()),
            option_type: Some(option_type),
            ..Default::default()
        }
    }

    pub fn set_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
    pub fn set_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
    pub fn set_type(mut self, option_type: OptionType) -> Self {
        self.option_type = Some(option_type);
        self
    }
    pub fn set_addable(mut self, addable: bool) -> Self {
        self.addable = Some(addable);
        self
    }
    pub fn set_editable(mut self, editable: bool) -> Self {
        self.editable = Some(editable);
        self
    }
    pub fn set_hidden(mut self, hidden: bool) -> Self {
        self.hidden = Some(hidden);
        self
    }
    pub fn set_description(mut self, description: Option<String>) -> Self {
        self.description = Some(description);
        self
    }
    pub fn set_groups(mut self, group_ids: Vec<u64>) -> Self {
        self.group_ids = Some(group_ids);
        self
    }
    pub fn set_values(mut self, values: Vec<ValueInput>) -> Self {
        self.values = Some(values);
        self
    }
    pub fn add_value(mut self, value: ValueInput) -> Self {
        self.values.get_or_insert_with(Vec::new).push(value);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueView {
    pub value: OptionValue,
    pub pricing: Vec<PricingRow>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionView {
    pub option: PackageOption,
    pub values: Vec<ValueView>,
}

fn option_rules<'a>() -> Rules<'a, PackageOption> {
    Rules::new()
        .rule("label", "required", "A label is required", |o: &PackageOption| {
            !o.label.is_empty()
        })
        .rule("name", "required", "A field name is required", |o: &PackageOption| {
            !o.name.is_empty()
        })
}

fn merge_option(option: &mut PackageOption, input: &OptionInput) {
    if let Some(label) = &input.label {
        option.label = label.trim().to_string();
    }
    if let Some(name) = &input.name {
        option.name = name.trim().to_string();
    }
    if let Some(option_type) = input.option_type {
        option.option_type = option_type;
    }
    if let Some(addable) = input.addable {
        option.addable = addable;
    }
    if let Some(editable) = input.editable {
        option.editable = editable;
    }
    if let Some(hidden) = input.hidden {
        option.hidden = hidden;
    }
    if let Some(description) = &input.description {
        option.description = description.clone();
    }
    if let Some(group_ids) = &input.group_ids {
        option.group_ids = group_ids.clone();
    }
}

pub struct OptionService {
    store: Store,
    usage: Arc<dyn ServiceUsageOracle>,
    currency: Arc<dyn CurrencyConverter>,
}

impl OptionService {
    pub fn new(instance: Arc<sled::Db>) -> Self {
        Self::from_config(instance, &EngineConfig::default())
    }

    pub fn from_config(instance: Arc<sled::Db>, config: &EngineConfig) -> Self {
        Self {
            store: Store::new(instance.clone()),
            usage: Arc::new(ServiceLedger::new(instance)),
            currency: Arc::new(CurrencyTable::from_config(config)),
        }
    }

    pub fn with_usage_oracle(mut self, usage: Arc<dyn ServiceUsageOracle>) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_currency(mut self, currency: Arc<dyn CurrencyConverter>) -> Self {
        self.currency = currency;
        self
    }

    pub fn add(&self, ctx: &RequestContext, input: OptionInput) -> anyhow::Result<PackageOption> {
        let reconciler = OptionValueReconciler::new(self.usage.as_ref());

        let option = self.store.transaction(|tx| {
            let mut report = Report::new();
            if input.option_type.is_none() {
                report.push("option_type", "required", "An option type is required");
            }

            let mut option = PackageOption {
                id: 0,
                company_id: ctx.company_id,
                label: String::new(),
                name: String::new(),
                option_type: OptionType::Checkbox,
                addable: false,
                editable: false,
                hidden: false,
                description: None,
                group_ids: Vec::new(),
                value_ids: Vec::new(),
            };
            merge_option(&mut option, &input);
            option_rules().check(&option, "", &mut report);
            check_option_groups(tx, ctx.company_id, &option.group_ids, "group_ids", &mut report)?;

            let values = input.values.as_deref().unwrap_or_default();
            let plan = reconciler.plan(tx, &[], option.option_type, values, &mut report)?;
            report.into_tx()?;

            option.id = tx.next_id()?;
            option.value_ids = reconciler.apply(tx, option.id, ctx.company_id, &plan)?;
            tx.put(&keys::option(option.id), &option)?;
            sync_option_group_options(tx, option.id, &[], &option.group_ids)?;
            Ok(option)
        })?;

        info!(
            option_id = option.id,
            company_id = ctx.company_id,
            option_type = %option.option_type,
            request_id = %ctx.request_id,
            "added package option"
        );
        Ok(option)
    }

    /// Apply `input` to a stored option. Values are reconciled when submitted
    /// or when the type changes.
    pub fn edit(
        &self,
        ctx: &RequestContext,
        option_id: u64,
        input: OptionInput,
    ) -> anyhow::Result<PackageOption> {
        let reconciler = OptionValueReconciler::new(self.usage.as_ref());

        let option = self.store.transaction(|tx| {
            let mut option = require_option(tx, ctx.company_id, option_id)?;
            let previous_type = option.option_type;
            let previous_groups = option.group_ids.clone();
            merge_option(&mut option, &input);

            let mut report = Report::new();
            option_rules().check(&option, "", &mut report);
            check_option_groups(tx, ctx.company_id, &option.group_ids, "group_ids", &mut report)?;

            let plan = if input.values.is_some() || option.option_type != previous_type {
                let values = input.values.as_deref().unwrap_or_default();
                Some(reconciler.plan(tx, &option.value_ids, option.option_type, values, &mut report)?)
            } else {
                None
            };
            report.into_tx()?;

            if let Some(plan) = &plan {
                option.value_ids = reconciler.apply(tx, option.id, ctx.company_id, plan)?;
            }
            tx.put(&keys::option(option.id), &option)?;
            sync_option_group_options(tx, option.id, &previous_groups, &option.group_ids)?;
            Ok(option)
        })?;

        debug!(option_id, request_id = %ctx.request_id, "edited package option");
        Ok(option)
    }

    /// Delete an option with its values and their pricing. Blocked while a
    /// service has any of its values selected.
    pub fn delete(&self, ctx: &RequestContext, option_id: u64) -> anyhow::Result<()> {
        self.store.transaction(|tx| {
            let option = require_option(tx, ctx.company_id, option_id)?;

            let mut report = Report::new();
            for (i, value_id) in option.value_ids.iter().enumerate() {
                if lift(self.usage.is_option_value_in_use(*value_id, None))? {
                    report.push(
                        format!("values[{i}]"),
                        "in_use",
                        "A value of this option is selected by a service",
                    );
                }
            }
            report.into_tx()?;

            for value_id in &option.value_ids {
                if let Some(value) = tx.get::<OptionValue>(&keys::option_value(*value_id))? {
                    for pricing_id in &value.pricing_ids {
                        tx.delete_pricing(*pricing_id)?;
                    }
                }
                tx.remove(&keys::option_value(*value_id))?;
            }
            sync_option_group_options(tx, option_id, &option.group_ids, &[])?;
            tx.remove(&keys::option(option_id))
        })?;

        info!(option_id, company_id = ctx.company_id, request_id = %ctx.request_id, "deleted package option");
        Ok(())
    }

    pub fn get(&self, ctx: &RequestContext, option_id: u64) -> anyhow::Result<Option<OptionView>> {
        match self.load_option(ctx, option_id)? {
            Some(option) => Ok(Some(option_view(&self.store, option)?)),
            None => Ok(None),
        }
    }

    pub fn get_value(&self, ctx: &RequestContext, value_id: u64) -> anyhow::Result<Option<ValueView>> {
        let Some(value) = self.store.get::<OptionValue>(&keys::option_value(value_id))? else {
            return Ok(None);
        };
        if self.load_option(ctx, value.option_id)?.is_none() {
            return Ok(None);
        }
        Ok(Some(value_view(&self.store, value)?))
    }

    /// Options of an option group, in group order.
    pub fn list_by_group(&self, ctx: &RequestContext, group_id: u64) -> anyhow::Result<Vec<OptionView>> {
        let group = self
            .store
            .get::<OptionGroup>(&keys::option_group(group_id))?
            .filter(|g| g.company_id == ctx.company_id);
        let Some(group) = group else {
            return Ok(Vec::new());
        };
        Ok(options_in_groups(&self.store, ctx.company_id, &[group.id])?)
    }

    /// Options offered with a package through its option groups.
    pub fn list_by_package(&self, ctx: &RequestContext, package_id: u64) -> anyhow::Result<Vec<OptionView>> {
        let package = self
            .store
            .get::<Package>(&keys::package(package_id))?
            .filter(|p| p.company_id == ctx.company_id);
        let Some(package) = package else {
            return Ok(Vec::new());
        };
        Ok(options_in_groups(&self.store, ctx.company_id, &package.option_group_ids)?)
    }

    /// Price of a value for a term, optionally converted.
    pub fn value_price(
        &self,
        ctx: &RequestContext,
        value_id: u64,
        term: u32,
        period: Period,
        currency: &str,
        convert_to: Option<&str>,
    ) -> anyhow::Result<Option<ResolvedPrice>> {
        let Some(view) = self.get_value(ctx, value_id)? else {
            return Ok(None);
        };
        let resolver = PriceTermResolver::new(self.currency.as_ref());
        Ok(resolver.resolve(ctx.company_id, &view.pricing, term, period, currency, convert_to)?)
    }

    fn load_option(&self, ctx: &RequestContext, option_id: u64) -> Result<Option<PackageOption>, PricingError> {
        Ok(self
            .store
            .get::<PackageOption>(&keys::option(option_id))?
            .filter(|o| o.company_id == ctx.company_id))
    }
}

fn require_option(tx: &Tx<'_>, company_id: u64, option_id: u64) -> TxResult<PackageOption> {
    let option: PackageOption = tx.require(&keys::option(option_id), "option", option_id)?;
    if option.company_id != company_id {
        return abort(PricingError::NotFound {
            entity: "option",
            id: option_id,
        });
    }
    Ok(option)
}

pub(crate) fn pricing_rows(store: &Store, ids: &[u64]) -> Result<Vec<PricingRow>, PricingError> {
    let mut rows = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(row) = store.get::<PricingRow>(&keys::pricing(*id))? {
            rows.push(row);
        }
    }
    Ok(rows)
}

fn value_view(store: &Store, value: OptionValue) -> Result<ValueView, PricingError> {
    let pricing = pricing_rows(store, &value.pricing_ids)?;
    Ok(ValueView { value, pricing })
}

pub(crate) fn option_view(store: &Store, option: PackageOption) -> Result<OptionView, PricingError> {
    let mut values = Vec::with_capacity(option.value_ids.len());
    for id in &option.value_ids {
        if let Some(value) = store.get::<OptionValue>(&keys::option_value(*id))? {
            values.push(value_view(store, value)?);
        }
    }
    values.sort_by_key(|v| v.value.order);
    Ok(OptionView { option, values })
}

/// Options of the given option groups in group order, each listed once.
pub(crate) fn options_in_groups(
    store: &Store,
    company_id: u64,
    group_ids: &[u64],
) -> Result<Vec<OptionView>, PricingError> {
    let mut seen = Vec::new();
    let mut views = Vec::new();
    for group_id in group_ids {
        let Some(group) = store.get::<OptionGroup>(&keys::option_group(*group_id))? else {
            continue;
        };
        for option_id in &group.option_ids {
            if seen.contains(option_id) {
                continue;
            }
            seen.push(*option_id);
            let option = store
                .get::<PackageOption>(&keys::option(*option_id))?
                .filter(|o| o.company_id == company_id);
            if let Some(option) = option {
                views.push(option_view(store, option)?);
            }
        }
    }
    Ok(views)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_families() {
        let single: Vec<_> = OptionType::all()
            .into_iter()
            .filter(|t| t.is_single_value())
            .map(|t| t.as_str())
            .collect();
        assert_eq!(single, vec!["checkbox", "quantity", "text", "textarea", "password"]);

        assert!(OptionType::Select.is_choice());
        assert!(!OptionType::Quantity.is_choice());
        assert!(!OptionType::Quantity.is_text());
        assert_eq!("textarea".parse::<OptionType>().unwrap(), OptionType::Textarea);
        assert!("dropdown".parse::<OptionType>().is_err());
    }

    #[test]
    fn add_value_starts_value_list() {
        let input = OptionInput::default().add_value(ValueInput::choice("A", "a"));
        assert_eq!(input.values.map(|v| v.len()), Some(1));
    }
}
