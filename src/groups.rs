//! Package groups and option groups.
//!
//! A group keeps its members as an ordered id list. Membership changes made by
//! package and option edits go through the `sync_*` helpers, which only touch
//! groups actually joined or left, so a member that stays keeps its position.
use crate::error::PricingError;
use crate::options::PackageOption;
use crate::packages::Package;
use crate::store::{Store, Tx, TxResult, abort, keys};
use crate::types::RequestContext;
use crate::validate::{Report, Rules};
use std::sync::Arc;
use tracing::info;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupType {
    #[n(0)]
    Standard,
    /// Sold on top of services from the parent groups.
    #[n(1)]
    Addon,
}

impl GroupType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupType::Standard => "standard",
            GroupType::Addon => "addon",
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct PackageGroup {
    #[n(0)]
    pub id: u64,
    #[n(1)]
    pub company_id: u64,
    #[n(2)]
    pub name: String,
    #[n(3)]
    pub group_type: GroupType,
    /// Members may be swapped for one another as upgrades or downgrades.
    #[n(4)]
    pub allow_upgrades: bool,
    #[n(5)]
    pub parent_group_ids: Vec<u64>,
    #[n(6)]
    pub package_ids: Vec<u64>,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct OptionGroup {
    #[n(0)]
    pub id: u64,
    #[n(1)]
    pub company_id: u64,
    #[n(2)]
    pub name: String,
    #[n(3)]
    pub description: Option<String>,
    #[n(4)]
    pub hide_options: bool,
    #[n(5)]
    pub option_ids: Vec<u64>,
    /// Packages offering this group's options.
    #[n(6)]
    pub package_ids: Vec<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct PackageGroupInput {
    pub name: Option<String>,
    pub group_type: Option<GroupType>,
    pub allow_upgrades: Option<bool>,
    pub parent_group_ids: Option<Vec<u64>>,
}

impl PackageGroupInput {
    pub fn new(name: impl Into<String>, group_type: GroupType) -> Self {
        Self {
            name: Some(name.into()),
            group_type: Some(group_type),
            ..Default::default()
        }
    }

    pub fn set_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
    pub fn set_allow_upgrades(mut self, allow: bool) -> Self {
        self.allow_upgrades = Some(allow);
        self
    }
    pub fn set_parents(mut self, parent_group_ids: Vec<u64>) -> Self {
        self.parent_group_ids = Some(parent_group_ids);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct OptionGroupInput {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub hide_options: Option<bool>,
}

impl OptionGroupInput {
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
    pub fn set_hide_options(mut self, hide: bool) -> Self {
        self.hide_options = Some(hide);
        self
    }
}

fn package_group_rules<'a>() -> Rules<'a, PackageGroup> {
    Rules::new()
        .rule("name", "required", "A group name is required", |g: &PackageGroup| {
            !g.name.trim().is_empty()
        })
        .rule(
            "parent_group_ids",
            "addon_only",
            "Only addon groups may have parent groups",
            |g: &PackageGroup| g.group_type == GroupType::Addon || g.parent_group_ids.is_empty(),
        )
        .terminal()
}

fn option_group_rules<'a>() -> Rules<'a, OptionGroup> {
    Rules::new().rule("name", "required", "A group name is required", |g: &OptionGroup| {
        !g.name.trim().is_empty()
    })
}

#[derive(Clone)]
pub struct GroupService {
    store: Store,
}

impl GroupService {
    pub fn new(instance: Arc<sled::Db>) -> Self {
        Self {
            store: Store::new(instance),
        }
    }

    pub fn add_package_group(
        &self,
        ctx: &RequestContext,
        input: PackageGroupInput,
    ) -> anyhow::Result<PackageGroup> {
        let group = self.store.transaction(|tx| {
            let mut group = PackageGroup {
                id: 0,
                company_id: ctx.company_id,
                name: String::new(),
                group_type: GroupType::Standard,
                allow_upgrades: false,
                parent_group_ids: Vec::new(),
                package_ids: Vec::new(),
            };
            merge_package_group(&mut group, &input);
            validate_package_group(tx, &group)?;

            group.id = tx.next_id()?;
            tx.put(&keys::package_group(group.id), &group)?;
            Ok(group)
        })?;

        info!(group_id = group.id, company_id = ctx.company_id, request_id = %ctx.request_id, "added package group");
        Ok(group)
    }

    pub fn edit_package_group(
        &self,
        ctx: &RequestContext,
        group_id: u64,
        input: PackageGroupInput,
    ) -> anyhow::Result<PackageGroup> {
        Ok(self.store.transaction(|tx| {
            let mut group = require_package_group(tx, ctx.company_id, group_id)?;
            merge_package_group(&mut group, &input);
            validate_package_group(tx, &group)?;

            tx.put(&keys::package_group(group_id), &group)?;
            Ok(group)
        })?)
    }

    /// Delete a group, dropping it from its member packages and from addon
    /// groups naming it as a parent.
    pub fn delete_package_group(&self, ctx: &RequestContext, group_id: u64) -> anyhow::Result<()> {
        let children: Vec<u64> = self
            .store
            .scan::<PackageGroup>(keys::PACKAGE_GROUPS)?
            .into_iter()
            .filter(|g| g.parent_group_ids.contains(&group_id))
            .map(|g| g.id)
            .collect();

        self.store.transaction(|tx| {
            let group = require_package_group(tx, ctx.company_id, group_id)?;
            for package_id in &group.package_ids {
                update::<Package>(tx, keys::package(*package_id), |package| {
                    package.group_ids.retain(|id| *id != group_id)
                })?;
            }
            for child in &children {
                update::<PackageGroup>(tx, keys::package_group(*child), |child| {
                    child.parent_group_ids.retain(|id| *id != group_id)
                })?;
            }
            tx.remove(&keys::package_group(group_id))
        })?;

        info!(group_id, company_id = ctx.company_id, request_id = %ctx.request_id, "deleted package group");
        Ok(())
    }

    pub fn get_package_group(
        &self,
        ctx: &RequestContext,
        group_id: u64,
    ) -> anyhow::Result<Option<PackageGroup>> {
        Ok(self
            .store
            .get::<PackageGroup>(&keys::package_group(group_id))?
            .filter(|g| g.company_id == ctx.company_id))
    }

    pub fn list_package_groups(
        &self,
        ctx: &RequestContext,
        group_type: Option<GroupType>,
    ) -> anyhow::Result<Vec<PackageGroup>> {
        Ok(self
            .store
            .scan::<PackageGroup>(keys::PACKAGE_GROUPS)?
            .into_iter()
            .filter(|g| g.company_id == ctx.company_id)
            .filter(|g| group_type.is_none_or(|t| g.group_type == t))
            .collect())
    }

    /// Move the listed packages to the front of the group, in the given order.
    pub fn order_packages(
        &self,
        ctx: &RequestContext,
        group_id: u64,
        package_ids: &[u64],
    ) -> anyhow::Result<PackageGroup> {
        Ok(self.store.transaction(|tx| {
            let mut group = require_package_group(tx, ctx.company_id, group_id)?;
            check_members(&group.package_ids, package_ids, "package_ids")?;
            group.package_ids = reorder(&group.package_ids, package_ids);
            tx.put(&keys::package_group(group_id), &group)?;
            Ok(group)
        })?)
    }

    pub fn add_option_group(
        &self,
        ctx: &RequestContext,
        input: OptionGroupInput,
    ) -> anyhow::Result<OptionGroup> {
        let group = self.store.transaction(|tx| {
            let mut group = OptionGroup {
                id: 0,
                company_id: ctx.company_id,
                name: String::new(),
                description: None,
                hide_options: false,
                option_ids: Vec::new(),
                package_ids: Vec::new(),
            };
            merge_option_group(&mut group, &input);
            validate_option_group(&group)?;

            group.id = tx.next_id()?;
            tx.put(&keys::option_group(group.id), &group)?;
            Ok(group)
        })?;

        info!(group_id = group.id, company_id = ctx.company_id, request_id = %ctx.request_id, "added option group");
        Ok(group)
    }

    pub fn edit_option_group(
        &self,
        ctx: &RequestContext,
        group_id: u64,
        input: OptionGroupInput,
    ) -> anyhow::Result<OptionGroup> {
        Ok(self.store.transaction(|tx| {
            let mut group = require_option_group(tx, ctx.company_id, group_id)?;
            merge_option_group(&mut group, &input);
            validate_option_group(&group)?;

            tx.put(&keys::option_group(group_id), &group)?;
            Ok(group)
        })?)
    }

    /// Delete a group, dropping it from its options and from the packages
    /// offering it. The options themselves stay.
    pub fn delete_option_group(&self, ctx: &RequestContext, group_id: u64) -> anyhow::Result<()> {
        self.store.transaction(|tx| {
            let group = require_option_group(tx, ctx.company_id, group_id)?;
            for option_id in &group.option_ids {
                update::<PackageOption>(tx, keys::option(*option_id), |option| {
                    option.group_ids.retain(|id| *id != group_id)
                })?;
            }
            for package_id in &group.package_ids {
                update::<Package>(tx, keys::package(*package_id), |package| {
                    package.option_group_ids.retain(|id| *id != group_id)
                })?;
            }
            tx.remove(&keys::option_group(group_id))
        })?;

        info!(group_id, company_id = ctx.company_id, request_id = %ctx.request_id, "deleted option group");
        Ok(())
    }

    pub fn get_option_group(
        &self,
        ctx: &RequestContext,
        group_id: u64,
    ) -> anyhow::Result<Option<OptionGroup>> {
        Ok(self
            .store
            .get::<OptionGroup>(&keys::option_group(group_id))?
            .filter(|g| g.company_id == ctx.company_id))
    }

    pub fn list_option_groups(&self, ctx: &RequestContext) -> anyhow::Result<Vec<OptionGroup>> {
        Ok(self
            .store
            .scan::<OptionGroup>(keys::OPTION_GROUPS)?
            .into_iter()
            .filter(|g| g.company_id == ctx.company_id)
            .collect())
    }

    /// Move the listed options to the front of the group, in the given order.
    pub fn order_options(
        &self,
        ctx: &RequestContext,
        group_id: u64,
        option_ids: &[u64],
    ) -> anyhow::Result<OptionGroup> {
        Ok(self.store.transaction(|tx| {
            let mut group = require_option_group(tx, ctx.company_id, group_id)?;
            check_members(&group.option_ids, option_ids, "option_ids")?;
            group.option_ids = reorder(&group.option_ids, option_ids);
            tx.put(&keys::option_group(group_id), &group)?;
            Ok(group)
        })?)
    }
}

fn merge_package_group(group: &mut PackageGroup, input: &PackageGroupInput) {
    if let Some(name) = &input.name {
        group.name = name.trim().to_string();
    }
    if let Some(group_type) = input.group_type {
        group.group_type = group_type;
    }
    if let Some(allow) = input.allow_upgrades {
        group.allow_upgrades = allow;
    }
    if let Some(parents) = &input.parent_group_ids {
        group.parent_group_ids = parents.clone();
    }
}

fn merge_option_group(group: &mut OptionGroup, input: &OptionGroupInput) {
    if let Some(name) = &input.name {
        group.name = name.trim().to_string();
    }
    if let Some(description) = &input.description {
        group.description = description.clone();
    }
    if let Some(hide) = input.hide_options {
        group.hide_options = hide;
    }
}

fn validate_package_group(tx: &Tx<'_>, group: &PackageGroup) -> TxResult<()> {
    let mut report = Report::new();
    package_group_rules().check(group, "", &mut report);

    // parents are standard groups of the same company
    for (i, parent_id) in group.parent_group_ids.iter().enumerate() {
        let field = format!("parent_group_ids[{i}]");
        let parent: Option<PackageGroup> = tx.get(&keys::package_group(*parent_id))?;
        match parent {
            Some(parent) if parent.company_id == group.company_id && parent.id != group.id => {
                if parent.group_type != GroupType::Standard {
                    report.push(field, "standard", "Parent groups must be standard groups");
                }
            }
            _ => report.push(field, "exists", format!("Package group {parent_id} does not exist")),
        }
    }

    report.into_tx()
}

fn validate_option_group(group: &OptionGroup) -> TxResult<()> {
    let mut report = Report::new();
    option_group_rules().check(group, "", &mut report);
    report.into_tx()
}

fn check_members(members: &[u64], ids: &[u64], field: &str) -> TxResult<()> {
    let mut report = Report::new();
    for (i, id) in ids.iter().enumerate() {
        if !members.contains(id) {
            report.push(
                format!("{field}[{i}]"),
                "member",
                format!("{id} is not a member of this group"),
            );
        }
    }
    report.into_tx()
}

/// `ids` first, in their given order, then every other member in its
/// current relative order.
pub fn reorder(members: &[u64], ids: &[u64]) -> Vec<u64> {
    let mut ordered: Vec<u64> = Vec::with_capacity(members.len());
    for id in ids {
        if members.contains(id) && !ordered.contains(id) {
            ordered.push(*id);
        }
    }
    let rest: Vec<u64> = members
        .iter()
        .copied()
        .filter(|id| !ordered.contains(id))
        .collect();
    ordered.extend(rest);
    ordered
}

fn require_package_group(tx: &Tx<'_>, company_id: u64, group_id: u64) -> TxResult<PackageGroup> {
    let group: PackageGroup = tx.require(&keys::package_group(group_id), "package group", group_id)?;
    if group.company_id != company_id {
        return abort(PricingError::NotFound {
            entity: "package group",
            id: group_id,
        });
    }
    Ok(group)
}

fn require_option_group(tx: &Tx<'_>, company_id: u64, group_id: u64) -> TxResult<OptionGroup> {
    let group: OptionGroup = tx.require(&keys::option_group(group_id), "option group", group_id)?;
    if group.company_id != company_id {
        return abort(PricingError::NotFound {
            entity: "option group",
            id: group_id,
        });
    }
    Ok(group)
}

/// Load, edit and store the record at `key`; a missing record is skipped.
fn update<T>(tx: &Tx<'_>, key: String, edit: impl FnOnce(&mut T)) -> TxResult<()>
where
    T: minicbor::Encode<()> + for<'b> minicbor::Decode<'b, ()>,
{
    let Some(mut record) = tx.get::<T>(&key)? else {
        return Ok(());
    };
    edit(&mut record);
    tx.put(&key, &record)
}

fn sync_members<G>(
    tx: &Tx<'_>,
    key: fn(u64) -> String,
    members: fn(&mut G) -> &mut Vec<u64>,
    member_id: u64,
    before: &[u64],
    after: &[u64],
) -> TxResult<()>
where
    G: minicbor::Encode<()> + for<'b> minicbor::Decode<'b, ()>,
{
    for group_id in before.iter().filter(|id| !after.contains(id)) {
        update::<G>(tx, key(*group_id), |group| {
            members(group).retain(|id| *id != member_id)
        })?;
    }
    for group_id in after.iter().filter(|id| !before.contains(id)) {
        update::<G>(tx, key(*group_id), |group| {
            let list = members(group);
            if !list.contains(&member_id) {
                list.push(member_id);
            }
        })?;
    }
    Ok(())
}

fn group_packages(group: &mut PackageGroup) -> &mut Vec<u64> {
    &mut group.package_ids
}

fn group_options(group: &mut OptionGroup) -> &mut Vec<u64> {
    &mut group.option_ids
}

fn option_group_packages(group: &mut OptionGroup) -> &mut Vec<u64> {
    &mut group.package_ids
}

/// Move a package from the `before` groups to the `after` groups.
pub fn sync_package_groups(tx: &Tx<'_>, package_id: u64, before: &[u64], after: &[u64]) -> TxResult<()> {
    sync_members::<PackageGroup>(tx, keys::package_group, group_packages, package_id, before, after)
}

/// Move an option from the `before` option groups to the `after` ones.
pub fn sync_option_group_options(
    tx: &Tx<'_>,
    option_id: u64,
    before: &[u64],
    after: &[u64],
) -> TxResult<()> {
    sync_members::<OptionGroup>(tx, keys::option_group, group_options, option_id, before, after)
}

/// Record which option groups a package offers.
pub fn sync_option_group_packages(
    tx: &Tx<'_>,
    package_id: u64,
    before: &[u64],
    after: &[u64],
) -> TxResult<()> {
    sync_members::<OptionGroup>(tx, keys::option_group, option_group_packages, package_id, before, after)
}

/// Report every id in `ids` that is not a package group of `company_id`.
pub fn check_package_groups(
    tx: &Tx<'_>,
    company_id: u64,
    ids: &[u64],
    prefix: &str,
    report: &mut Report,
) -> TxResult<()> {
    for (i, id) in ids.iter().enumerate() {
        let group: Option<PackageGroup> = tx.get(&keys::package_group(*id))?;
        if group.is_none_or(|g| g.company_id != company_id) {
            report.push(
                format!("{prefix}[{i}]"),
                "exists",
                format!("Package group {id} does not exist"),
            );
        }
    }
    Ok(())
}

/// Report every id in `ids` that is not an option group of `company_id`.
pub fn check_option_groups(
    tx: &Tx<'_>,
    company_id: u64,
    ids: &[u64],
    prefix: &str,
    report: &mut Report,
) -> TxResult<()> {
    for (i, id) in ids.iter().enumerate() {
        let group: Option<OptionGroup> = tx.get(&keys::option_group(*id))?;
        if group.is_none_or(|g| g.company_id != company_id) {
            report.push(
                format!("{prefix}[{i}]"),
                "exists",
                format!("Option group {id} does not exist"),
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn service() -> (tempfile::TempDir, GroupService) {
        let temp_dir = tempdir().unwrap();
        let db = Arc::new(sled::open(temp_dir.path().join("groups.db")).unwrap());
        (temp_dir, GroupService::new(db))
    }

    #[test]
    fn reorder_keeps_unlisted_members_after() {
        assert_eq!(reorder(&[1, 2, 3, 4], &[3, 1]), vec![3, 1, 2, 4]);
        assert_eq!(reorder(&[1, 2, 3], &[]), vec![1, 2, 3]);
        assert_eq!(reorder(&[1, 2], &[2, 2]), vec![2, 1]);
    }

    #[test]
    fn addon_parents_must_be_standard_groups() {
        let (_dir, groups) = service();
        let ctx = RequestContext::new(1);

        let hosting = groups
            .add_package_group(&ctx, PackageGroupInput::new("Hosting", GroupType::Standard))
            .unwrap();
        let addons = groups
            .add_package_group(
                &ctx,
                PackageGroupInput::new("Addons", GroupType::Addon).set_parents(vec![hosting.id]),
            )
            .unwrap();
        assert_eq!(addons.parent_group_ids, vec![hosting.id]);

        let err = groups
            .add_package_group(
                &ctx,
                PackageGroupInput::new("Nested", GroupType::Addon).set_parents(vec![addons.id, 999]),
            )
            .unwrap_err();
        let err = err.downcast_ref::<PricingError>().unwrap();
        assert!(err.has_rule("standard"));
        assert!(err.has_rule("exists"));

        let err = groups
            .add_package_group(
                &ctx,
                PackageGroupInput::new("Plain", GroupType::Standard).set_parents(vec![hosting.id]),
            )
            .unwrap_err();
        assert!(err.downcast_ref::<PricingError>().unwrap().has_rule("addon_only"));
    }

    #[test]
    fn deleting_a_parent_detaches_addons() {
        let (_dir, groups) = service();
        let ctx = RequestContext::new(1);

        let hosting = groups
            .add_package_group(&ctx, PackageGroupInput::new("Hosting", GroupType::Standard))
            .unwrap();
        let addons = groups
            .add_package_group(
                &ctx,
                PackageGroupInput::new("Addons", GroupType::Addon).set_parents(vec![hosting.id]),
            )
            .unwrap();

        groups.delete_package_group(&ctx, hosting.id).unwrap();

        assert!(groups.get_package_group(&ctx, hosting.id).unwrap().is_none());
        let addons = groups.get_package_group(&ctx, addons.id).unwrap().unwrap();
        assert!(addons.parent_group_ids.is_empty());
    }

    #[test]
    fn groups_are_scoped_to_company() {
        let (_dir, groups) = service();
        let ours = RequestContext::new(1);
        let theirs = RequestContext::new(2);

        let group = groups
            .add_option_group(&ours, OptionGroupInput::new("Extras").set_hide_options(true))
            .unwrap();

        assert!(groups.get_option_group(&theirs, group.id).unwrap().is_none());
        assert!(groups.list_option_groups(&theirs).unwrap().is_empty());
        assert_eq!(groups.list_option_groups(&ours).unwrap(), vec![group.clone()]);

        let err = groups
            .edit_option_group(&theirs, group.id, OptionGroupInput::default().set_name("Mine"))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PricingError>(),
            Some(PricingError::NotFound { .. })
        ));
    }

    #[test]
    fn blank_names_are_rejected() {
        let (_dir, groups) = service();
        let ctx = RequestContext::new(1);

        let err = groups
            .add_option_group(&ctx, OptionGroupInput::new("  "))
            .unwrap_err();
        assert!(err.downcast_ref::<PricingError>().unwrap().has_rule("required"));
        assert!(groups.list_option_groups(&ctx).unwrap().is_empty());
    }
}
