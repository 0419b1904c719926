use crate::validate::Violation;

#[derive(thiserror::Error, Debug)]
pub enum PricingError {
    #[error("validation failed: {}", describe(.0))]
    Validation(Vec<Violation>),
    #[error("{entity} {id} was not found")]
    NotFound { entity: &'static str, id: u64 },
    #[error("currency {0} is not configured")]
    UnknownCurrency(String),
    #[error("converting {amount} {from} to {to} overflowed")]
    Conversion {
        amount: rust_decimal::Decimal,
        from: String,
        to: String,
    },
    #[error("storage failure: {0}")]
    Persistence(#[from] sled::Error),
    #[error("failed to encode record: {0}")]
    Encode(String),
    #[error("failed to decode record at {key}: {source}")]
    Decode {
        key: String,
        #[source]
        source: minicbor::decode::Error,
    },
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ProrationError {
    #[error("prorate date could not be resolved: {0}")]
    Unresolvable(String),
}

impl PricingError {
    /// Violations carried by a validation failure, if that is what this is.
    pub fn violations(&self) -> Option<&[Violation]> {
        match self {
            PricingError::Validation(v) => Some(v),
            _ => None,
        }
    }

    /// True when a validation failure includes `rule` on any field.
    pub fn has_rule(&self, rule: &str) -> bool {
        self.violations()
            .is_some_and(|v| v.iter().any(|violation| violation.rule == rule))
    }
}

fn describe(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| format!("{} ({}): {}", v.field, v.rule, v.message))
        .collect::<Vec<_>>()
        .join("; ")
}
