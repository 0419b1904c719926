//! Seam to the module that provisions services for a package.
use crate::types::MetaField;
use crate::validate::Violation;

/// Validates the module-specific fields of a package.
pub trait ModuleProvisioner: Send + Sync {
    /// Check `meta` for `module_id`, returning the fields to store (the
    /// module may fill defaults or mark fields encrypted).
    fn validate_meta(&self, module_id: u64, meta: &[MetaField]) -> Result<Vec<MetaField>, Vec<Violation>>;
}

/// Accepts any meta unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughProvisioner;

impl ModuleProvisioner for PassthroughProvisioner {
    fn validate_meta(&self, _module_id: u64, meta: &[MetaField]) -> Result<Vec<MetaField>, Vec<Violation>> {
        Ok(meta.to_vec())
    }
}
