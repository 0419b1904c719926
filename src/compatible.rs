//! Upgrade and downgrade targets for a package.
use crate::groups::{GroupType, PackageGroup};
use crate::options::pricing_rows;
use crate::packages::{Package, PackageStatus};
use crate::pricing::PricingRow;
use crate::store::{Store, keys};
use crate::types::RequestContext;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// A target package with what a client needs to pick it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompatiblePackage {
    pub package: Package,
    pub pricing: Vec<PricingRow>,
    pub groups: Vec<PackageGroup>,
}

pub struct CompatiblePackageFilter {
    store: Store,
}

impl CompatiblePackageFilter {
    pub fn new(instance: Arc<sled::Db>) -> Self {
        Self {
            store: Store::new(instance),
        }
    }

    /// Packages sharing an upgradable group of `group_type` with the source
    /// package and bound to `module_id`.
    ///
    /// Results follow the source's group order, then each group's member
    /// order; a package reachable through several groups is listed once.
    /// Inactive packages and the source itself are skipped.
    pub fn find_compatible(
        &self,
        ctx: &RequestContext,
        package_id: u64,
        module_id: Option<u64>,
        group_type: GroupType,
    ) -> anyhow::Result<Vec<CompatiblePackage>> {
        let source = self
            .store
            .get::<Package>(&keys::package(package_id))?
            .filter(|p| p.company_id == ctx.company_id);
        let Some(source) = source else {
            return Ok(Vec::new());
        };

        let mut seen = HashSet::from([source.id]);
        let mut found = Vec::new();

        for group_id in &source.group_ids {
            let group = self
                .store
                .get::<PackageGroup>(&keys::package_group(*group_id))?
                .filter(|g| g.company_id == ctx.company_id)
                .filter(|g| g.group_type == group_type && g.allow_upgrades);
            let Some(group) = group else {
                continue;
            };

            for member_id in &group.package_ids {
                if !seen.insert(*member_id) {
                    continue;
                }
                let Some(candidate) = self.store.get::<Package>(&keys::package(*member_id))? else {
                    continue;
                };
                if candidate.company_id != ctx.company_id
                    || candidate.module_id != module_id
                    || candidate.status == PackageStatus::Inactive
                {
                    continue;
                }
                found.push(self.describe(candidate)?);
            }
        }

        debug!(package_id, group_type = group_type.as_str(), found = found.len(), "compatible packages");
        Ok(found)
    }

    fn describe(&self, package: Package) -> anyhow::Result<CompatiblePackage> {
        let pricing = pricing_rows(&self.store, &package.pricing_ids)?;
        let mut groups = Vec::with_capacity(package.group_ids.len());
        for group_id in &package.group_ids {
            if let Some(group) = self.store.get::<PackageGroup>(&keys::package_group(*group_id))? {
                groups.push(group);
            }
        }
        Ok(CompatiblePackage {
            package,
            pricing,
            groups,
        })
    }
}
