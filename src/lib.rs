pub mod compatible;
pub mod config;
pub mod currency;
pub mod error;
pub mod groups;
pub mod option_values;
pub mod options;
pub mod packages;
pub mod pricing;
pub mod proration;
pub mod provisioner;
pub mod resolver;
pub mod sequence;
pub mod store;
pub mod types;
pub mod usage;
pub mod validate;

pub use compatible::{CompatiblePackage, CompatiblePackageFilter};
pub use config::EngineConfig;
pub use error::{PricingError, ProrationError};
pub use groups::{GroupService, GroupType, OptionGroupInput, PackageGroupInput};
pub use option_values::{OptionValueReconciler, ValueInput, ValueShape, ValueStatus};
pub use options::{OptionInput, OptionService, OptionType, PackageOption};
pub use packages::{EditOutcome, Package, PackageInput, PackageService, PackageStatus, Quote};
pub use pricing::{PricingInput, PricingRow};
pub use proration::ProrationCalculator;
pub use resolver::PriceTermResolver;
pub use sequence::SequenceIdGenerator;
pub use types::{MetaField, Money, Period, ReconcileWarning, RequestContext};
pub use usage::{ServiceLedger, ServiceStatus, ServiceUsageOracle};
