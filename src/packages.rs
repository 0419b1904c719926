//! Packages: sellable templates with a price list.
//!
//! Edits reconcile the submitted pricing rows against the stored ones. A row
//! dropped from the submission is removed only when no live service uses it;
//! otherwise it is kept as it was and the edit carries on, reporting a
//! [`ReconcileWarning::PricingRetained`] in the [`EditOutcome`].
use crate::config::{EngineConfig, ProrationConfig};
use crate::currency::{CurrencyConverter, CurrencyTable};
use crate::error::PricingError;
use crate::groups::{
    PackageGroup, check_option_groups, check_package_groups, sync_option_group_packages,
    sync_package_groups,
};
use crate::options::{OptionView, options_in_groups, pricing_rows};
use crate::pricing::{PricingInput, PricingPlan, PricingPolicy, PricingRow, PricingStore, plan_pricing};
use crate::proration::{MAX_PRORATA_DAY, ProrataPolicy, ProrationCalculator};
use crate::provisioner::{ModuleProvisioner, PassthroughProvisioner};
use crate::resolver::{PriceTermResolver, ResolvedPrice};
use crate::sequence::{SequenceIdGenerator, SequenceScope, SettingsProvider, SledSettings};
use crate::store::{Store, Tx, TxResult, abort, keys, lift};
use crate::types::{MetaField, ReconcileWarning, RequestContext};
use crate::usage::{ServiceLedger, ServiceUsageOracle};
use crate::validate::{Report, Rules, Violation, join};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, info_span, warn};

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PackageStatus {
    #[n(0)]
    Active,
    #[n(1)]
    Inactive,
    /// Only sold to clients allowed to see it.
    #[n(2)]
    Restricted,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Package {
    #[n(0)]
    pub id: u64,
    #[n(1)]
    pub company_id: u64,
    #[n(2)]
    pub id_format: String,
    #[n(3)]
    pub id_value: u64,
    /// `id_format` with `id_value` substituted.
    #[n(4)]
    pub id_code: String,
    #[n(5)]
    pub name: String,
    #[n(6)]
    pub description: Option<String>,
    #[n(7)]
    pub module_id: Option<u64>,
    #[n(8)]
    pub module_row: Option<u64>,
    /// Units in stock; `None` is unlimited.
    #[n(9)]
    pub qty: Option<u32>,
    /// Most a single client may hold.
    #[n(10)]
    pub client_qty: Option<u32>,
    #[n(11)]
    pub prorata_day: Option<u32>,
    #[n(12)]
    pub prorata_cutoff: Option<u32>,
    #[n(13)]
    pub status: PackageStatus,
    #[n(14)]
    pub hidden: bool,
    #[n(15)]
    pub taxable: bool,
    #[n(16)]
    pub single_term: bool,
    #[n(17)]
    pub upgrades_use_renewal: bool,
    #[n(18)]
    pub meta: Vec<MetaField>,
    #[n(19)]
    pub pricing_ids: Vec<u64>,
    #[n(20)]
    pub group_ids: Vec<u64>,
    #[n(21)]
    pub option_group_ids: Vec<u64>,
    #[n(22)]
    pub module_group_ids: Vec<u64>,
    #[n(23)]
    pub plugin_ids: Vec<u64>,
}

impl Package {
    fn blank(company_id: u64) -> Self {
        Self {
            id: 0,
            company_id,
            id_format: String::new(),
            id_value: 0,
            id_code: String::new(),
            name: String::new(),
            description: None,
            module_id: None,
            module_row: None,
            qty: None,
            client_qty: None,
            prorata_day: None,
            prorata_cutoff: None,
            status: PackageStatus::Active,
            hidden: false,
            taxable: false,
            single_term: false,
            upgrades_use_renewal: false,
            meta: Vec::new(),
            pricing_ids: Vec::new(),
            group_ids: Vec::new(),
            option_group_ids: Vec::new(),
            module_group_ids: Vec::new(),
            plugin_ids: Vec::new(),
        }
    }

    pub fn prorata_policy(&self) -> ProrataPolicy {
        ProrataPolicy {
            day: self.prorata_day,
            cutoff: self.prorata_cutoff,
        }
    }

    pub fn meta_value(&self, key: &str) -> Option<&str> {
        self.meta
            .iter()
            .find(|m| m.key == key)
            .map(|m| m.value.as_str())
    }
}

/// Fields to set on a package. `None` leaves the stored field alone; for
/// nullable fields `Some(None)` clears it.
#[derive(Debug, Clone, Default)]
pub struct PackageInput {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub module_id: Option<Option<u64>>,
    pub module_row: Option<Option<u64>>,
    pub qty: Option<Option<u32>>,
    pub client_qty: Option<Option<u32>>,
    pub prorata_day: Option<Option<u32>>,
    pub prorata_cutoff: Option<Option<u32>>,
    pub status: Option<PackageStatus>,
    pub hidden: Option<bool>,
    pub taxable: Option<bool>,
    pub single_term: Option<bool>,
    pub upgrades_use_renewal: Option<bool>,
    pub meta: Option<Vec<MetaField>>,
    pub pricing: Option<Vec<PricingInput>>,
    pub group_ids: Option<Vec<u64>>,
    pub option_group_ids: Option<Vec<u64>>,
    pub module_group_ids: Option<Vec<u64>>,
    pub plugin_ids: Option<Vec<u64>>,
}

impl PackageInput {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn set_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
    pub fn set_description(mut self, description: Option<String>) -> Self {
        self.description = Some(description);
        self
    }
    pub fn set_module(mut self, module_id: Option<u64>) -> Self {
        self.module_id = Some(module_id);
        self
    }
    pub fn set_module_row(mut self, module_row: Option<u64>) -> Self {
        self.module_row = Some(module_row);
        self
    }
    pub fn set_qty(mut self, qty: Option<u32>) -> Self {
        self.qty = Some(qty);
        self
    }
    pub fn set_client_qty(mut self, client_qty: Option<u32>) -> Self {
        self.client_qty = Some(client_qty);
        self
    }
    pub fn set_prorata(mut self, day: Option<u32>, cutoff: Option<u32>) -> Self {
        self.prorata_day = Some(day);
        self.prorata_cutoff = Some(cutoff);
        self
    }
    pub fn set_status(mut self, status: PackageStatus) -> Self {
        self.status = Some(status);
        self
    }
    pub fn set_hidden(mut self, hidden: bool) -> Self {
        self.hidden = Some(hidden);
        self
    }
    pub fn set_taxable(mut self, taxable: bool) -> Self {
        self.taxable = Some(taxable);
        self
    }
    pub fn set_single_term(mut self, single_term: bool) -> Self {
        self.single_term = Some(single_term);
        self
    }
    pub fn set_upgrades_use_renewal(mut self, use_renewal: bool) -> Self {
        self.upgrades_use_renewal = Some(use_renewal);
        self
    }
    pub fn set_meta(mut self, meta: Vec<MetaField>) -> Self {
        self.meta = Some(meta);
        self
    }
    pub fn set_pricing(mut self, pricing: Vec<PricingInput>) -> Self {
        self.pricing = Some(pricing);
        self
    }
    pub fn add_pricing(mut self, pricing: PricingInput) -> Self {
        self.pricing.get_or_insert_with(Vec::new).push(pricing);
        self
    }
    pub fn set_groups(mut self, group_ids: Vec<u64>) -> Self {
        self.group_ids = Some(group_ids);
        self
    }
    pub fn set_option_groups(mut self, option_group_ids: Vec<u64>) -> Self {
        self.option_group_ids = Some(option_group_ids);
        self
    }
    pub fn set_module_groups(mut self, module_group_ids: Vec<u64>) -> Self {
        self.module_group_ids = Some(module_group_ids);
        self
    }
    pub fn set_plugins(mut self, plugin_ids: Vec<u64>) -> Self {
        self.plugin_ids = Some(plugin_ids);
        self
    }
}

/// Result of an edit. `warnings` lists removals that were not carried out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditOutcome {
    pub package: Package,
    pub warnings: Vec<ReconcileWarning>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageView {
    pub package: Package,
    pub pricing: Vec<PricingRow>,
    pub groups: Vec<PackageGroup>,
    /// Options offered through the package's option groups.
    pub options: Vec<OptionView>,
}

/// First charge for a pricing row starting at a given moment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quote {
    pub package_id: u64,
    pub pricing: ResolvedPrice,
    /// Date the first (partial) period runs to, when prorated.
    pub prorate_date: Option<NaiveDate>,
    pub price: Decimal,
    pub setup_fee: Decimal,
    pub renewal_price: Decimal,
}

fn package_rules<'a>() -> Rules<'a, Package> {
    let day_in_range = |day: Option<u32>| day.is_none_or(|d| (1..=MAX_PRORATA_DAY).contains(&d));

    Rules::new()
        .rule("name", "required", "A package name is required", |p: &Package| {
            !p.name.is_empty()
        })
        .rule(
            "prorata_day",
            "range",
            format!("Prorata day must be between 1 and {}", MAX_PRORATA_DAY),
            move |p: &Package| day_in_range(p.prorata_day),
        )
        .rule(
            "prorata_cutoff",
            "range",
            format!("Prorata cutoff must be between 1 and {}", MAX_PRORATA_DAY),
            move |p: &Package| day_in_range(p.prorata_cutoff),
        )
        .terminal()
        .rule(
            "prorata_cutoff",
            "requires_day",
            "A prorata cutoff needs a prorata day",
            |p: &Package| p.prorata_cutoff.is_none() || p.prorata_day.is_some(),
        )
        .linked_to("prorata_day")
        .rule(
            "module_row",
            "requires_module",
            "A module row needs a module",
            |p: &Package| p.module_row.is_none() || p.module_id.is_some(),
        )
}

fn merge_package(package: &mut Package, input: &PackageInput) {
    if let Some(name) = &input.name {
        package.name = name.trim().to_string();
    }
    if let Some(description) = &input.description {
        package.description = description.clone();
    }
    if let Some(module_id) = input.module_id {
        package.module_id = module_id;
    }
    if let Some(module_row) = input.module_row {
        package.module_row = module_row;
    }
    if let Some(qty) = input.qty {
        package.qty = qty;
    }
    if let Some(client_qty) = input.client_qty {
        package.client_qty = client_qty;
    }
    if let Some(day) = input.prorata_day {
        package.prorata_day = day;
    }
    if let Some(cutoff) = input.prorata_cutoff {
        package.prorata_cutoff = cutoff;
    }
    if let Some(status) = input.status {
        package.status = status;
    }
    if let Some(hidden) = input.hidden {
        package.hidden = hidden;
    }
    if let Some(taxable) = input.taxable {
        package.taxable = taxable;
    }
    if let Some(single_term) = input.single_term {
        package.single_term = single_term;
    }
    if let Some(use_renewal) = input.upgrades_use_renewal {
        package.upgrades_use_renewal = use_renewal;
    }
    if let Some(meta) = &input.meta {
        package.meta = meta.clone();
    }
    if let Some(group_ids) = &input.group_ids {
        package.group_ids = group_ids.clone();
    }
    if let Some(option_group_ids) = &input.option_group_ids {
        package.option_group_ids = option_group_ids.clone();
    }
    if let Some(module_group_ids) = &input.module_group_ids {
        package.module_group_ids = module_group_ids.clone();
    }
    if let Some(plugin_ids) = &input.plugin_ids {
        package.plugin_ids = plugin_ids.clone();
    }
}

fn never_in_use(_pricing_id: u64) -> Result<bool, PricingError> {
    Ok(false)
}

pub struct PackageService {
    store: Store,
    usage: Arc<dyn ServiceUsageOracle>,
    currency: Arc<dyn CurrencyConverter>,
    settings: Arc<dyn SettingsProvider>,
    provisioner: Arc<dyn ModuleProvisioner>,
    proration: ProrationConfig,
}

impl PackageService {
    pub fn new(instance: Arc<sled::Db>) -> Self {
        Self::from_config(instance, &EngineConfig::default())
    }

    pub fn from_config(instance: Arc<sled::Db>, config: &EngineConfig) -> Self {
        Self {
            store: Store::new(instance.clone()),
            usage: Arc::new(ServiceLedger::new(instance.clone())),
            currency: Arc::new(CurrencyTable::from_config(config)),
            settings: Arc::new(SledSettings::new(instance, config.sequences.clone())),
            provisioner: Arc::new(PassthroughProvisioner),
            proration: config.proration.clone(),
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

    pub fn with_settings(mut self, settings: Arc<dyn SettingsProvider>) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_provisioner(mut self, provisioner: Arc<dyn ModuleProvisioner>) -> Self {
        self.provisioner = provisioner;
        self
    }

    /// Create a package with its pricing, id code and group memberships.
    pub fn add(&self, ctx: &RequestContext, input: PackageInput) -> anyhow::Result<Package> {
        let _span = info_span!("package_add", request_id = %ctx.request_id).entered();
        let generator = SequenceIdGenerator::new(self.settings.as_ref());

        let package = self.store.transaction(|tx| {
            let mut package = Package::blank(ctx.company_id);
            merge_package(&mut package, &input);

            let mut report = Report::new();
            self.check_package(tx, &mut package, &mut report)?;

            let submitted = input.pricing.as_deref().unwrap_or_default();
            if submitted.is_empty() {
                report.push("pricing", "required", "At least one pricing row is required");
            }
            let plan = plan_pricing(
                tx,
                &[],
                submitted,
                PricingPolicy::PACKAGE,
                &never_in_use,
                "pricing",
                &mut report,
            )?;
            report.into_tx()?;

            let code = generator.next_id(tx, SequenceScope::Package { company_id: ctx.company_id })?;
            package.id = tx.next_id()?;
            package.id_format = code.format;
            package.id_value = code.value;
            package.id_code = code.code;
            package.pricing_ids = plan.apply(tx, ctx.company_id, &[])?;

            tx.put(&keys::package(package.id), &package)?;
            sync_package_groups(tx, package.id, &[], &package.group_ids)?;
            sync_option_group_packages(tx, package.id, &[], &package.option_group_ids)?;
            Ok(package)
        })?;

        info!(
            package_id = package.id,
            company_id = ctx.company_id,
            id_code = %package.id_code,
            pricing_rows = package.pricing_ids.len(),
            "added package"
        );
        Ok(package)
    }

    /// Apply `input` to a stored package.
    ///
    /// Pricing rows the submission drops (or submits with an id and no term)
    /// are removed unless a live service uses them; those are kept unchanged
    /// and listed in the outcome's warnings.
    pub fn edit(
        &self,
        ctx: &RequestContext,
        package_id: u64,
        input: PackageInput,
    ) -> anyhow::Result<EditOutcome> {
        let _span = info_span!("package_edit", request_id = %ctx.request_id, package_id).entered();

        let outcome = self.store.transaction(|tx| {
            let stored = require_package(tx, ctx.company_id, package_id)?;
            let mut package = stored.clone();
            merge_package(&mut package, &input);

            let mut report = Report::new();
            self.check_package(tx, &mut package, &mut report)?;

            if package.module_id != stored.module_id {
                for pricing_id in &stored.pricing_ids {
                    if lift(self.usage.is_pricing_in_use(*pricing_id))? {
                        report.push(
                            "module_id",
                            "in_use",
                            "The module may not change while a service uses this package",
                        );
                        break;
                    }
                }
            }

            let plan = match &input.pricing {
                Some(submitted) => {
                    let in_use = |pricing_id: u64| self.usage.is_pricing_in_use(pricing_id);
                    plan_pricing(
                        tx,
                        &stored.pricing_ids,
                        submitted,
                        PricingPolicy::PACKAGE,
                        &in_use,
                        "pricing",
                        &mut report,
                    )?
                }
                None => PricingPlan::default(),
            };
            let remaining = stored.pricing_ids.len().saturating_sub(plan.deletes.len()) + plan.inserts.len();
            if remaining == 0 {
                report.push("pricing", "required", "At least one pricing row is required");
            }
            report.into_tx()?;

            package.pricing_ids = plan.apply(tx, ctx.company_id, &stored.pricing_ids)?;
            tx.put(&keys::package(package_id), &package)?;
            sync_package_groups(tx, package_id, &stored.group_ids, &package.group_ids)?;
            sync_option_group_packages(
                tx,
                package_id,
                &stored.option_group_ids,
                &package.option_group_ids,
            )?;

            Ok(EditOutcome {
                package,
                warnings: plan.warnings,
            })
        })?;

        if !outcome.warnings.is_empty() {
            warn!(
                package_id,
                retained = outcome.warnings.len(),
                "edit kept pricing rows still used by services"
            );
        }
        info!(package_id, "edited package");
        Ok(outcome)
    }

    /// Delete a package with its pricing, meta and memberships. Blocked while
    /// any service, of any status, references one of its pricing rows.
    pub fn delete(&self, ctx: &RequestContext, package_id: u64) -> anyhow::Result<()> {
        let _span = info_span!("package_delete", request_id = %ctx.request_id, package_id).entered();

        self.store.transaction(|tx| {
            let package = require_package(tx, ctx.company_id, package_id)?;

            let mut report = Report::new();
            for (i, pricing_id) in package.pricing_ids.iter().enumerate() {
                if lift(self.usage.is_pricing_referenced(*pricing_id))? {
                    report.push(
                        format!("pricing[{i}]"),
                        "in_use",
                        "A service references this pricing",
                    );
                }
            }
            report.into_tx()?;

            for pricing_id in &package.pricing_ids {
                tx.delete_pricing(*pricing_id)?;
            }
            sync_package_groups(tx, package_id, &package.group_ids, &[])?;
            sync_option_group_packages(tx, package_id, &package.option_group_ids, &[])?;
            tx.remove(&keys::package(package_id))
        })?;

        info!(package_id, company_id = ctx.company_id, "deleted package");
        Ok(())
    }

    /// Remove one pricing row outright. Unlike an edit dropping the row, this
    /// fails while a live service uses it.
    pub fn delete_pricing(
        &self,
        ctx: &RequestContext,
        package_id: u64,
        pricing_id: u64,
    ) -> anyhow::Result<Package> {
        let package = self.store.transaction(|tx| {
            let mut package = require_package(tx, ctx.company_id, package_id)?;

            let mut report = Report::new();
            if !package.pricing_ids.contains(&pricing_id) {
                report.push(
                    "pricing_id",
                    "exists",
                    format!("Pricing {pricing_id} does not belong to this package"),
                );
            } else if lift(self.usage.is_pricing_in_use(pricing_id))? {
                report.push(
                    "pricing_id",
                    "in_use",
                    format!("Pricing {pricing_id} is in use by a service and may not be removed"),
                );
            } else if package.pricing_ids.len() == 1 {
                report.push("pricing", "required", "At least one pricing row is required");
            }
            report.into_tx()?;

            tx.delete_pricing(pricing_id)?;
            package.pricing_ids.retain(|id| *id != pricing_id);
            tx.put(&keys::package(package_id), &package)?;
            Ok(package)
        })?;

        info!(package_id, pricing_id, request_id = %ctx.request_id, "deleted package pricing");
        Ok(package)
    }

    pub fn get(&self, ctx: &RequestContext, package_id: u64) -> anyhow::Result<Option<PackageView>> {
        match self.load_package(ctx, package_id)? {
            Some(package) => Ok(Some(self.view(package)?)),
            None => Ok(None),
        }
    }

    /// Packages of the company, optionally with one status.
    pub fn list(&self, ctx: &RequestContext, status: Option<PackageStatus>) -> anyhow::Result<Vec<Package>> {
        Ok(self
            .store
            .scan::<Package>(keys::PACKAGES)?
            .into_iter()
            .filter(|p| p.company_id == ctx.company_id)
            .filter(|p| status.is_none_or(|s| p.status == s))
            .collect())
    }

    /// Members of a package group, in group order.
    pub fn list_by_group(&self, ctx: &RequestContext, group_id: u64) -> anyhow::Result<Vec<Package>> {
        let group = self
            .store
            .get::<PackageGroup>(&keys::package_group(group_id))?
            .filter(|g| g.company_id == ctx.company_id);
        let Some(group) = group else {
            return Ok(Vec::new());
        };

        let mut packages = Vec::with_capacity(group.package_ids.len());
        for package_id in &group.package_ids {
            if let Some(package) = self.load_package(ctx, *package_id)? {
                packages.push(package);
            }
        }
        Ok(packages)
    }

    /// The package owning a pricing row.
    pub fn get_by_pricing_id(
        &self,
        ctx: &RequestContext,
        pricing_id: u64,
    ) -> anyhow::Result<Option<PackageView>> {
        let owner = self
            .store
            .scan::<Package>(keys::PACKAGES)?
            .into_iter()
            .find(|p| p.company_id == ctx.company_id && p.pricing_ids.contains(&pricing_id));
        match owner {
            Some(package) => Ok(Some(self.view(package)?)),
            None => Ok(None),
        }
    }

    /// Price the first period of `pricing_id` for a service starting at
    /// `start`, prorated to the package's prorata day when it has one.
    pub fn quote(
        &self,
        ctx: &RequestContext,
        pricing_id: u64,
        start: DateTime<Utc>,
        convert_to: Option<&str>,
    ) -> anyhow::Result<Option<Quote>> {
        let Some(view) = self.get_by_pricing_id(ctx, pricing_id)? else {
            return Ok(None);
        };
        let Some(row) = view.pricing.iter().find(|p| p.id == pricing_id) else {
            return Ok(None);
        };

        let resolver = PriceTermResolver::new(self.currency.as_ref());
        let Some(resolved) = resolver.resolve(
            ctx.company_id,
            &view.pricing,
            row.term,
            row.period,
            &row.currency,
            convert_to,
        )?
        else {
            return Ok(None);
        };

        let calculator = ProrationCalculator::new(ctx.timezone)
            .allow_all_periods(self.proration.allow_all_periods)
            .with_precision(self.proration.precision);
        let pricing = &resolved.pricing;
        let policy = view.package.prorata_policy();

        let prorate_date = match calculator.invoice_prorate_date(start, policy, pricing.period) {
            Ok(date) => date,
            Err(e) => {
                warn!(package_id = view.package.id, pricing_id, error = %e, "quoting full price");
                None
            }
        };
        let (prorate_date, price) = match (prorate_date, policy.day) {
            (Some(date), Some(day)) => match calculator.try_prorate_price(
                pricing.price.amount(),
                start,
                pricing.term,
                pricing.period,
                day,
                Some(date),
            ) {
                Ok(price) => (Some(date), price),
                Err(e) => {
                    warn!(package_id = view.package.id, pricing_id, error = %e, "quoting full price");
                    (None, pricing.price.amount())
                }
            },
            _ => (prorate_date, pricing.price.amount()),
        };

        Ok(Some(Quote {
            package_id: view.package.id,
            prorate_date,
            price,
            setup_fee: pricing.setup_fee.amount(),
            renewal_price: pricing.renewal_price().amount(),
            pricing: resolved,
        }))
    }

    /// Field rules, associations and module meta; may rewrite `meta`.
    fn check_package(&self, tx: &Tx<'_>, package: &mut Package, report: &mut Report) -> TxResult<()> {
        package_rules().check(package, "", report);
        check_package_groups(tx, package.company_id, &package.group_ids, "group_ids", report)?;
        check_option_groups(
            tx,
            package.company_id,
            &package.option_group_ids,
            "option_group_ids",
            report,
        )?;

        if let Some(module_id) = package.module_id {
            match self.provisioner.validate_meta(module_id, &package.meta) {
                Ok(meta) => package.meta = meta,
                Err(violations) => report.extend(violations.into_iter().map(|v| Violation {
                    field: join("meta", &v.field),
                    ..v
                })),
            }
        }
        Ok(())
    }

    fn load_package(&self, ctx: &RequestContext, package_id: u64) -> Result<Option<Package>, PricingError> {
        Ok(self
            .store
            .get::<Package>(&keys::package(package_id))?
            .filter(|p| p.company_id == ctx.company_id))
    }

    fn view(&self, package: Package) -> Result<PackageView, PricingError> {
        let pricing = pricing_rows(&self.store, &package.pricing_ids)?;
        let mut groups = Vec::with_capacity(package.group_ids.len());
        for group_id in &package.group_ids {
            if let Some(group) = self.store.get::<PackageGroup>(&keys::package_group(*group_id))? {
                groups.push(group);
            }
        }
        let options = options_in_groups(&self.store, package.company_id, &package.option_group_ids)?;

        Ok(PackageView {
            package,
            pricing,
            groups,
            options,
        })
    }
}

pub(crate) fn require_package(tx: &Tx<'_>, company_id: u64, package_id: u64) -> TxResult<Package> {
    let package: Package = tx.require(&keys::package(package_id), "package", package_id)?;
    if package.company_id != company_id {
        return abort(PricingError::NotFound {
            entity: "package",
            id: package_id,
        });
    }
    Ok(package)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules_of(package: &Package) -> Vec<(String, &'static str)> {
        let mut report = Report::new();
        package_rules().check(package, "", &mut report);
        report
            .violations()
            .iter()
            .map(|v| (v.field.clone(), v.rule))
            .collect()
    }

    #[test]
    fn prorata_fields_are_checked() {
        let mut package = Package::blank(1);
        package.name = "Basic".into();
        assert!(rules_of(&package).is_empty());

        package.prorata_cutoff = Some(20);
        assert_eq!(
            rules_of(&package),
            vec![("prorata_cutoff".to_string(), "requires_day")]
        );

        package.prorata_day = Some(31);
        package.prorata_cutoff = Some(29);
        assert_eq!(
            rules_of(&package),
            vec![
                ("prorata_day".to_string(), "range"),
                ("prorata_cutoff".to_string(), "range"),
            ]
        );
    }

    #[test]
    fn patch_leaves_unset_fields() {
        let mut package = Package::blank(1);
        merge_package(
            &mut package,
            &PackageInput::new("Basic")
                .set_description(Some("Entry plan".into()))
                .set_qty(Some(10)),
        );
        merge_package(
            &mut package,
            &PackageInput::default().set_description(None).set_hidden(true),
        );

        assert_eq!(package.name, "Basic");
        assert_eq!(package.description, None);
        assert_eq!(package.qty, Some(10));
        assert!(package.hidden);
    }

    #[test]
    fn meta_lookup_by_key() {
        let mut package = Package::blank(1);
        merge_package(
            &mut package,
            &PackageInput::new("Basic").set_meta(vec![MetaField {
                key: "server_type".into(),
                value: "shared".into(),
                encrypted: false,
            }]),
        );

        assert_eq!(package.meta_value("server_type"), Some("shared"));
        assert_eq!(package.meta_value("quota"), None);
    }
}
