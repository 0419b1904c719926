//! Composable field rules.
//!
//! A [`Rules`] chain is evaluated against one subject and every failing rule is
//! reported, so a caller sees all problems with a submission at once. Two
//! modifiers shape the evaluation:
//!
//! - a *terminal* rule stops the remaining rules of its field when it fails
//!   (a malformed currency code makes any further currency check noise);
//! - a *linked* rule reads another field and is skipped when that field has
//!   already failed.
use crate::error::PricingError;
use crate::store::{TxResult, abort};
use std::collections::HashSet;

/// A single failed rule, addressed by field path (`values[1].pricing[0].term`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub field: String,
    pub rule: &'static str,
    pub message: String,
}

type Check<'a, T> = Box<dyn Fn(&T) -> bool + 'a>;

struct Rule<'a, T> {
    field: &'static str,
    name: &'static str,
    message: String,
    terminal: bool,
    linked: Option<&'static str>,
    check: Check<'a, T>,
}

pub struct Rules<'a, T> {
    rules: Vec<Rule<'a, T>>,
}

impl<'a, T> Default for Rules<'a, T> {
    fn default() -> Self {
        Self { rules: Vec::new() }
    }
}

impl<'a, T> Rules<'a, T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a rule; `check` returns true when the subject passes.
    pub fn rule(
        mut self,
        field: &'static str,
        name: &'static str,
        message: impl Into<String>,
        check: impl Fn(&T) -> bool + 'a,
    ) -> Self {
        self.rules.push(Rule {
            field,
            name,
            message: message.into(),
            terminal: false,
            linked: None,
            check: Box::new(check),
        });
        self
    }

    /// Mark the most recently added rule as terminal for its field.
    pub fn terminal(mut self) -> Self {
        if let Some(rule) = self.rules.last_mut() {
            rule.terminal = true;
        }
        self
    }

    /// Only evaluate the most recently added rule when `field` passed.
    pub fn linked_to(mut self, field: &'static str) -> Self {
        if let Some(rule) = self.rules.last_mut() {
            rule.linked = Some(field);
        }
        self
    }

    /// Evaluate every rule, pushing failures into `report` under `prefix`.
    pub fn check(&self, subject: &T, prefix: &str, report: &mut Report) {
        let mut failed: HashSet<&'static str> = HashSet::new();
        let mut blocked: HashSet<&'static str> = HashSet::new();

        for rule in &self.rules {
            if blocked.contains(rule.field) {
                continue;
            }
            if rule.linked.is_some_and(|linked| failed.contains(linked)) {
                continue;
            }
            if (rule.check)(subject) {
                continue;
            }

            failed.insert(rule.field);
            if rule.terminal {
                blocked.insert(rule.field);
            }
            report.push(join(prefix, rule.field), rule.name, rule.message.clone());
        }
    }
}

/// Collected violations for one submission.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Report {
    violations: Vec<Violation>,
}

impl Report {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, field: impl Into<String>, rule: &'static str, message: impl Into<String>) {
        self.violations.push(Violation {
            field: field.into(),
            rule,
            message: message.into(),
        });
    }

    pub fn extend(&mut self, violations: impl IntoIterator<Item = Violation>) {
        self.violations.extend(violations);
    }

    pub fn is_empty(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn violations(&self) -> &[Violation] {
        &self.violations
    }

    pub fn into_result(self) -> Result<(), PricingError> {
        if self.violations.is_empty() {
            Ok(())
        } else {
            Err(PricingError::Validation(self.violations))
        }
    }

    /// Abort the surrounding transaction when anything was reported.
    pub fn into_tx(self) -> TxResult<()> {
        match self.into_result() {
            Ok(()) => Ok(()),
            Err(e) => abort(e),
        }
    }
}

/// Join a path prefix and a field name: `join("pricing[0]", "term")`.
pub fn join(prefix: &str, field: &str) -> String {
    if prefix.is_empty() {
        field.to_string()
    } else {
        format!("{prefix}.{field}")
    }
}

/// True when `input` is unchanged by HTML escaping.
pub fn is_html_safe(input: &str) -> bool {
    !input.contains(['&', '<', '>', '"', '\''])
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Row {
        currency: String,
        term: u32,
    }

    fn rules<'a>() -> Rules<'a, Row> {
        Rules::new()
            .rule("currency", "length", "must be three letters", |r: &Row| r.currency.len() == 3)
            .terminal()
            .rule("currency", "upper", "must be uppercase", |r: &Row| {
                r.currency.chars().all(|c| c.is_ascii_uppercase())
            })
            .rule("term", "positive", "must be positive", |r: &Row| r.term > 0)
            .rule("term", "currency_term", "USD terms are capped", |r: &Row| {
                r.currency != "USD" || r.term < 100
            })
            .linked_to("currency")
    }

    #[test]
    fn collects_all_non_terminal_failures() {
        let mut report = Report::new();
        rules().check(&Row { currency: "usd".into(), term: 0 }, "pricing[0]", &mut report);

        let fields: Vec<_> = report.violations().iter().map(|v| v.field.as_str()).collect();
        assert_eq!(fields, vec!["pricing[0].currency", "pricing[0].term"]);
    }

    #[test]
    fn terminal_rule_short_circuits_field() {
        let mut report = Report::new();
        rules().check(&Row { currency: "us".into(), term: 1 }, "", &mut report);

        assert_eq!(report.violations().len(), 1);
        assert_eq!(report.violations()[0].rule, "length");
    }

    #[test]
    fn linked_rule_skipped_when_source_failed() {
        let mut report = Report::new();
        rules().check(&Row { currency: "usx".into(), term: 500 }, "", &mut report);
        assert!(report.violations().iter().all(|v| v.rule != "currency_term"));

        let mut report = Report::new();
        rules().check(&Row { currency: "USD".into(), term: 500 }, "", &mut report);
        assert_eq!(report.violations()[0].rule, "currency_term");
    }

    #[test]
    fn html_safety() {
        assert!(is_html_safe("Extra 10GB"));
        assert!(!is_html_safe("<b>bold</b>"));
        assert!(!is_html_safe("Tom & Jerry"));
    }
}
