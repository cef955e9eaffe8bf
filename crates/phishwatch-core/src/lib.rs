//! Core domain model and brand normalization for phishwatch.

use std::collections::HashMap;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "phishwatch-core";

/// Timestamp layout used by the persisted dataset (`MM/DD/YYYY HH:MM:SS`).
pub const TIME_FORMAT: &str = "%m/%d/%Y %H:%M:%S";

/// Serde adapter keeping [`PhishReport::reported_at`] on the fixed wire
/// layout instead of chrono's default RFC 3339 rendering.
pub mod wire_time {
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    use super::TIME_FORMAT;

    pub fn serialize<S>(value: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.format(TIME_FORMAT).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<NaiveDateTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        NaiveDateTime::parse_from_str(&text, TIME_FORMAT).map_err(serde::de::Error::custom)
    }
}

/// A reported phishing URL, both as extracted from the feed and as persisted.
///
/// `url` is the natural key: the persisted set never holds two reports with
/// the same URL. Field order matches the dataset layout (URL, Target, Time).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhishReport {
    pub url: String,
    pub target: String,
    #[serde(with = "wire_time")]
    pub reported_at: NaiveDateTime,
}

/// One row of text cells lifted out of the feed's table body.
///
/// A well-formed row is `[url, target, time-of-day]`; anything else is the
/// extractor's problem.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawRow {
    pub cells: Vec<String>,
}

impl RawRow {
    pub fn new(cells: Vec<String>) -> Self {
        Self { cells }
    }

    pub fn cell(&self, index: usize) -> Option<&str> {
        self.cells.get(index).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for RawRow {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self::new(iter.into_iter().map(Into::into).collect())
    }
}

/// Exact-match table mapping feed brand strings to canonical names.
///
/// Unknown strings pass through unchanged so novel brands still show up in
/// the attack report instead of being dropped. Canonical names map to
/// themselves, which keeps normalization idempotent.
#[derive(Debug, Clone)]
pub struct BrandNormalizer {
    aliases: HashMap<String, String>,
}

/// Built-in aliases covering the spellings the feed is known to use.
const BUILTIN_ALIASES: &[(&str, &str)] = &[
    ("AT&T Inc.", "AT&T"),
    ("AT&T", "AT&T"),
    ("Google LLC", "Google"),
    ("Google Inc.", "Google"),
    ("Google", "Google"),
    ("Microsoft Corporation", "Microsoft"),
    ("Microsoft Corp.", "Microsoft"),
    ("Microsoft", "Microsoft"),
    ("PayPal Inc.", "PayPal"),
    ("PayPal, Inc.", "PayPal"),
    ("PayPal", "PayPal"),
    ("Amazon.com Inc.", "Amazon"),
    ("Amazon.com", "Amazon"),
    ("Amazon", "Amazon"),
    ("Apple Inc.", "Apple"),
    ("Apple", "Apple"),
    ("Meta Platforms, Inc.", "Facebook"),
    ("Facebook, Inc.", "Facebook"),
    ("Facebook", "Facebook"),
    ("WhatsApp LLC", "WhatsApp"),
    ("WhatsApp Inc.", "WhatsApp"),
    ("WhatsApp", "WhatsApp"),
    ("Netflix Inc.", "Netflix"),
    ("Netflix", "Netflix"),
    ("Wells Fargo & Company", "Wells Fargo"),
    ("Wells Fargo", "Wells Fargo"),
    ("DHL International GmbH", "DHL"),
    ("DHL", "DHL"),
];

impl BrandNormalizer {
    pub fn new() -> Self {
        let aliases = BUILTIN_ALIASES
            .iter()
            .map(|(raw, canonical)| (raw.to_string(), canonical.to_string()))
            .collect();
        Self { aliases }
    }

    /// Add a raw → canonical mapping. The canonical name should also map to
    /// itself, or idempotence is lost.
    pub fn add_alias(&mut self, raw: &str, canonical: &str) {
        self.aliases.insert(raw.to_string(), canonical.to_string());
    }

    /// Map a raw brand string to its canonical name; unknown strings are
    /// returned unchanged.
    pub fn normalize(&self, raw: &str) -> String {
        self.aliases
            .get(raw)
            .cloned()
            .unwrap_or_else(|| raw.to_string())
    }
}

impl Default for BrandNormalizer {
    fn default() -> Self {
        Self::new()
    }
}
