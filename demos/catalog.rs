//! Walk through a small catalog: groups, a package with an option, a service
//! holding a price, an edit that keeps that price, and a prorated quote.
//!
//! Run with `cargo run --example catalog`; set `RUST_LOG=debug` for more.
use anyhow::Context;
use chrono::{TimeZone, Utc};
use package_pricing::{
    compatible::CompatiblePackageFilter,
    config::EngineConfig,
    groups::{GroupService, GroupType, OptionGroupInput, PackageGroupInput},
    option_values::ValueInput,
    options::{OptionInput, OptionService, OptionType},
    packages::{PackageInput, PackageService},
    pricing::PricingInput,
    types::Period,
    usage::{ServiceLedger, ServiceStatus},
};
use rust_decimal_macros::dec;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = EngineConfig::default();
    let temp_dir = tempfile::tempdir()?;
    let db = Arc::new(sled::open(temp_dir.path().join(&config.database_path))?);
    let ctx = config.context(1)?;

    let groups = GroupService::new(db.clone());
    let options = OptionService::new(db.clone());
    let packages = PackageService::from_config(db.clone(), &config);
    let ledger = ServiceLedger::new(db.clone());

    let hosting = groups.add_package_group(
        &ctx,
        PackageGroupInput::new("Web hosting", GroupType::Standard).set_allow_upgrades(true),
    )?;
    let extras = groups.add_option_group(&ctx, OptionGroupInput::new("Hosting extras"))?;
    options.add(
        &ctx,
        OptionInput::new("Backup", "backup", OptionType::Checkbox)
            .set_groups(vec![extras.id])
            .add_value(
                ValueInput::choice("Daily backup", "1")
                    .add_pricing(PricingInput::new(1, Period::Month, dec!(2.00), "USD")),
            ),
    )?;

    let starter = packages.add(
        &ctx,
        PackageInput::new("Starter")
            .set_prorata(Some(1), Some(25))
            .set_groups(vec![hosting.id])
            .set_option_groups(vec![extras.id])
            .add_pricing(PricingInput::new(1, Period::Month, dec!(9.99), "USD"))
            .add_pricing(PricingInput::new(1, Period::Year, dec!(99.00), "USD")),
    )?;
    let business = packages.add(
        &ctx,
        PackageInput::new("Business")
            .set_groups(vec![hosting.id])
            .add_pricing(PricingInput::new(1, Period::Month, dec!(24.99), "USD")),
    )?;
    println!("added {} ({}) and {} ({})", starter.name, starter.id_code, business.name, business.id_code);

    // a client buys the monthly plan
    let monthly = starter.pricing_ids[0];
    ledger.record_service(monthly, ServiceStatus::Active, vec![])?;

    // dropping every row but the yearly one keeps the monthly row in use
    let view = packages.get(&ctx, starter.id)?.context("starter missing")?;
    let outcome = packages.edit(
        &ctx,
        starter.id,
        PackageInput::default().set_pricing(vec![PricingInput::from_row(&view.pricing[1])]),
    )?;
    println!("edit warnings: {:?}", outcome.warnings);

    let start = Utc.with_ymd_and_hms(2025, 1, 10, 9, 30, 0).single().context("bad start")?;
    if let Some(quote) = packages.quote(&ctx, monthly, start, None)? {
        println!(
            "first invoice {} {} (runs to {:?}), then {} per month",
            quote.price, quote.pricing.pricing.currency, quote.prorate_date, quote.renewal_price
        );
    }

    let targets = CompatiblePackageFilter::new(db).find_compatible(
        &ctx,
        starter.id,
        None,
        GroupType::Standard,
    )?;
    for target in targets {
        println!("can move to {} from {}", target.package.name, target.pricing[0].price);
    }

    Ok(())
}
