//! Human-readable id codes for packages and clients.
//!
//! The next number is reserved inside the same transaction as the insert that
//! uses it. sled detects the conflicting counter write when two creations race
//! and retries one of them, so no number is issued twice.
use crate::config::SequenceDefaults;
use crate::error::PricingError;
use crate::store::{Store, Tx, TxResult, abort, keys};
use crate::types::RequestContext;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

#[derive(
    Serialize, Deserialize, minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq,
)]
pub struct SequenceSettings {
    #[n(0)]
    pub start: u64,
    #[n(1)]
    pub increment: u64,
    #[n(2)]
    pub format: String,
}

impl SequenceSettings {
    pub fn new(start: u64, increment: u64, format: impl Into<String>) -> Self {
        Self {
            start,
            increment,
            format: format.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceKind {
    Package,
    Client,
}

impl SequenceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SequenceKind::Package => "package",
            SequenceKind::Client => "client",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceScope {
    Package { company_id: u64 },
    Client { company_id: u64, client_group_id: Option<u64> },
}

impl SequenceScope {
    fn kind(&self) -> SequenceKind {
        match self {
            SequenceScope::Package { .. } => SequenceKind::Package,
            SequenceScope::Client { .. } => SequenceKind::Client,
        }
    }

    fn company_id(&self) -> u64 {
        match self {
            SequenceScope::Package { company_id } | SequenceScope::Client { company_id, .. } => {
                *company_id
            }
        }
    }
}

/// A reserved number and its formatted code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdCode {
    pub value: u64,
    pub format: String,
    pub code: String,
}

/// Source of `{start, increment, format}` triples.
pub trait SettingsProvider: Send + Sync {
    fn company_sequence(
        &self,
        company_id: u64,
        kind: SequenceKind,
    ) -> Result<Option<SequenceSettings>, PricingError>;

    fn client_group_sequence(
        &self,
        client_group_id: u64,
    ) -> Result<Option<SequenceSettings>, PricingError>;

    /// Fallback used when neither scope has an explicit setting.
    fn default_sequence(&self, kind: SequenceKind) -> SequenceSettings;
}

/// Settings kept in the store, falling back to configured defaults.
#[derive(Clone)]
pub struct SledSettings {
    store: Store,
    defaults: SequenceDefaults,
}

impl SledSettings {
    pub fn new(instance: Arc<sled::Db>, defaults: SequenceDefaults) -> Self {
        Self {
            store: Store::new(instance),
            defaults,
        }
    }

    pub fn set_company_sequence(
        &self,
        company_id: u64,
        kind: SequenceKind,
        settings: SequenceSettings,
    ) -> anyhow::Result<()> {
        let key = keys::company_setting(company_id, &sequence_setting(kind));
        self.store.transaction(|tx| tx.put(&key, &settings))?;
        Ok(())
    }

    pub fn set_client_group_sequence(
        &self,
        client_group_id: u64,
        settings: SequenceSettings,
    ) -> anyhow::Result<()> {
        let key = keys::client_group_setting(client_group_id, &sequence_setting(SequenceKind::Client));
        self.store.transaction(|tx| tx.put(&key, &settings))?;
        Ok(())
    }
}

impl SettingsProvider for SledSettings {
    fn company_sequence(
        &self,
        company_id: u64,
        kind: SequenceKind,
    ) -> Result<Option<SequenceSettings>, PricingError> {
        self.store
            .get(&keys::company_setting(company_id, &sequence_setting(kind)))
    }

    fn client_group_sequence(
        &self,
        client_group_id: u64,
    ) -> Result<Option<SequenceSettings>, PricingError> {
        self.store.get(&keys::client_group_setting(
            client_group_id,
            &sequence_setting(SequenceKind::Client),
        ))
    }

    fn default_sequence(&self, kind: SequenceKind) -> SequenceSettings {
        match kind {
            SequenceKind::Package => self.defaults.package.clone(),
            SequenceKind::Client => self.defaults.client.clone(),
        }
    }
}

fn sequence_setting(kind: SequenceKind) -> String {
    format!("{}_id_sequence", kind.as_str())
}

pub struct SequenceIdGenerator<'a> {
    settings: &'a dyn SettingsProvider,
}

impl<'a> SequenceIdGenerator<'a> {
    pub fn new(settings: &'a dyn SettingsProvider) -> Self {
        Self { settings }
    }

    /// Resolve the effective settings, narrowest scope first.
    pub fn effective_settings(&self, scope: SequenceScope) -> Result<SequenceSettings, PricingError> {
        if let SequenceScope::Client {
            client_group_id: Some(group),
            ..
        } = scope
        {
            if let Some(settings) = self.settings.client_group_sequence(group)? {
                return Ok(settings);
            }
        }

        let kind = scope.kind();
        Ok(self
            .settings
            .company_sequence(scope.company_id(), kind)?
            .unwrap_or_else(|| self.settings.default_sequence(kind)))
    }

    /// Reserve the next number for `scope` inside `tx`.
    pub fn next_id(&self, tx: &Tx<'_>, scope: SequenceScope) -> TxResult<IdCode> {
        let settings = match self.effective_settings(scope) {
            Ok(settings) => settings,
            Err(e) => return abort(e),
        };

        let key = keys::sequence(scope.kind().as_str(), scope.company_id(), &settings.format);
        let last: Option<u64> = tx.get(&key)?;
        let value = next_value(last, &settings);
        tx.put(&key, &value)?;

        debug!(kind = scope.kind().as_str(), company_id = scope.company_id(), value, "reserved id value");

        Ok(IdCode {
            value,
            code: format_code(&settings.format, value),
            format: settings.format,
        })
    }
}

/// `max(last + increment, start)`, or `start` for the first number issued.
pub fn next_value(last: Option<u64>, settings: &SequenceSettings) -> u64 {
    match last {
        Some(last) => last.saturating_add(settings.increment).max(settings.start),
        None => settings.start,
    }
}

/// Widest zero padding `{num:N}` accepts; wider placeholders stay literal.
pub const MAX_CODE_WIDTH: usize = 20;

/// Substitute `{num}` (or zero-padded `{num:N}`) in `format` with `value`.
pub fn format_code(format: &str, value: u64) -> String {
    let mut out = String::with_capacity(format.len() + 8);
    let mut rest = format;

    while let Some(open) = rest.find("{num") {
        out.push_str(&rest[..open]);
        let tail = &rest[open + 4..];

        if let Some(after) = tail.strip_prefix('}') {
            out.push_str(&value.to_string());
            rest = after;
            continue;
        }

        let padded = tail
            .strip_prefix(':')
            .and_then(|t| t.split_once('}'))
            .and_then(|(width, after)| width.parse::<usize>().ok().map(|w| (w, after)))
            .filter(|(width, _)| *width <= MAX_CODE_WIDTH);
        match padded {
            Some((width, after)) => {
                out.push_str(&format!("{value:0width$}"));
                rest = after;
            }
            None => {
                out.push_str("{num");
                rest = tail;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Reserve a client code on its own, for callers that create clients
/// outside this crate.
pub fn reserve_client_code(
    store: &Store,
    settings: &dyn SettingsProvider,
    ctx: &RequestContext,
    client_group_id: Option<u64>,
) -> anyhow::Result<IdCode> {
    let generator = SequenceIdGenerator::new(settings);
    let scope = SequenceScope::Client {
        company_id: ctx.company_id,
        client_group_id,
    };
    Ok(store.transaction(|tx| generator.next_id(tx, scope))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_codes() {
        assert_eq!(format_code("{num}", 42), "42");
        assert_eq!(format_code("PKG-{num:5}", 42), "PKG-00042");
        assert_eq!(format_code("C{num}-{num:3}", 7), "C7-007");
        assert_eq!(format_code("{numx}", 7), "{numx}");
        assert_eq!(format_code("plain", 7), "plain");
    }

    #[test]
    fn oversized_padding_stays_literal() {
        assert_eq!(format_code("{num:20}", 7), "00000000000000000007");
        assert_eq!(format_code("A{num:21}", 7), "A{num:21}");
        assert_eq!(format_code("{num:4000000000}-{num}", 7), "{num:4000000000}-7");
    }

    #[test]
    fn next_value_respects_start_and_increment() {
        let settings = SequenceSettings::new(1500, 5, "{num}");
        assert_eq!(next_value(None, &settings), 1500);
        assert_eq!(next_value(Some(1500), &settings), 1505);
        // a raised start wins over the stored counter
        assert_eq!(next_value(Some(10), &settings), 1500);
    }
}
