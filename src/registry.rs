//! Option Chain Registry
//!
//! Loads the externally supplied chain file: a JSON map from strike (string
//! key) to the call/put instrument identifiers for one underlying/expiry.
//! The core only consumes the flat identifier set (the subscription set) and
//! the reverse strike lookup for presentation callers.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// Call/put identifiers at one strike. Either side may be missing.
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
pub struct StrikePair {
    #[serde(rename = "CE", default)]
    pub call: Option<String>,
    #[serde(rename = "PE", default)]
    pub put: Option<String>,
}

/// Which side of a strike an identifier names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionSide {
    Call,
    Put,
}

/// Parsed chain file, read-only for the lifetime of a pipeline run.
#[derive(Debug, Clone, Default)]
pub struct OptionChain {
    strikes: HashMap<String, StrikePair>,
    by_instrument: HashMap<String, (String, OptionSide)>,
}

impl OptionChain {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read chain file {}", path.display()))?;
        let strikes: HashMap<String, StrikePair> = serde_json::from_str(&raw)
            .with_context(|| format!("Malformed chain file {}", path.display()))?;
        Ok(Self::from_strikes(strikes))
    }

    pub fn from_strikes(strikes: HashMap<String, StrikePair>) -> Self {
        let mut by_instrument = HashMap::new();
        for (strike, pair) in &strikes {
            if let Some(ce) = &pair.call {
                by_instrument.insert(ce.clone(), (strike.clone(), OptionSide::Call));
            }
            if let Some(pe) = &pair.put {
                by_instrument.insert(pe.clone(), (strike.clone(), OptionSide::Put));
            }
        }
        Self {
            strikes,
            by_instrument,
        }
    }

    /// Every identifier in the chain, sorted so subscription payloads are
    /// deterministic across runs.
    pub fn instrument_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.by_instrument.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Strike and side for an identifier, for presentation callers.
    pub fn strike_for(&self, instrument_id: &str) -> Option<(&str, OptionSide)> {
        self.by_instrument
            .get(instrument_id)
            .map(|(strike, side)| (strike.as_str(), *side))
    }

    pub fn len(&self) -> usize {
        self.strikes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strikes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> OptionChain {
        let raw = r#"{
            "24000": {"CE": "NSE_FO|101", "PE": "NSE_FO|102"},
            "24100": {"CE": "NSE_FO|103", "PE": "NSE_FO|104"},
            "24200": {"CE": "NSE_FO|105"}
        }"#;
        let strikes: HashMap<String, StrikePair> = serde_json::from_str(raw).unwrap();
        OptionChain::from_strikes(strikes)
    }

    #[test]
    fn test_instrument_ids_sorted_and_complete() {
        let chain = sample();
        assert_eq!(
            chain.instrument_ids(),
            vec![
                "NSE_FO|101",
                "NSE_FO|102",
                "NSE_FO|103",
                "NSE_FO|104",
                "NSE_FO|105"
            ]
        );
    }

    #[test]
    fn test_strike_lookup() {
        let chain = sample();
        assert_eq!(
            chain.strike_for("NSE_FO|104"),
            Some(("24100", OptionSide::Put))
        );
        assert_eq!(chain.strike_for("NSE_FO|999"), None);
    }

    #[test]
    fn test_missing_put_side_tolerated() {
        let chain = sample();
        assert_eq!(
            chain.strike_for("NSE_FO|105"),
            Some(("24200", OptionSide::Call))
        );
        assert_eq!(chain.len(), 3);
    }
}
