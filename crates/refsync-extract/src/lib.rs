//! Mapping definitions, category resolution and the field extraction +
//! transformation pipeline applied to fetched authority records.

use std::collections::BTreeMap;
use std::path::Path;

use refsync_core::{main_datatype, MainType, RecordCategory};
use refsync_fetch::Document;
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

pub mod countries;
pub mod transform;

pub use countries::{CountryTable, COUNTRY_FEED_URL};
pub use transform::{apply_format, number_to_date, Transformed, VALUE_PLACEHOLDER};

pub const CRATE_NAME: &str = "refsync-extract";

const BUNDLED_MAPPINGS: &str = include_str!("../data/mappings.json");

#[derive(Debug, Error)]
pub enum MappingError {
    #[error("reading mapping file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("parsing mapping definitions: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("mapping definitions are empty")]
    Empty,
}

/// Where a field's raw value comes from.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FieldSource {
    /// Path query evaluated against the authority document.
    Xpath { path: String },
    /// Fixed value, independent of the document.
    Constant { value: String },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TargetData {
    pub property: String,
    #[serde(rename = "type", default)]
    pub datatype: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum FormatArgs {
    List(Vec<String>),
    Table(BTreeMap<String, String>),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FieldTarget {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: TargetData,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub args: Option<FormatArgs>,
}

/// One rule pairing a location in the authority document with a target
/// property and its value-shaping instructions.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FieldMap {
    pub from: FieldSource,
    pub to: FieldTarget,
}

/// The full set of mapping definitions, keyed by category group name.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct MappingSet {
    groups: BTreeMap<String, Vec<FieldMap>>,
}

impl MappingSet {
    /// Definitions shipped with the crate.
    pub fn bundled() -> Result<Self, MappingError> {
        Self::from_json_str(BUNDLED_MAPPINGS)
    }

    pub fn from_json_str(json: &str) -> Result<Self, MappingError> {
        let set: Self = serde_json::from_str(json)?;
        if set.groups.is_empty() || set.groups.values().all(Vec::is_empty) {
            return Err(MappingError::Empty);
        }
        Ok(set)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, MappingError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| MappingError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    pub fn group(&self, key: &str) -> Option<&[FieldMap]> {
        self.groups.get(key).map(Vec::as_slice)
    }

    /// Group names with their map counts, for diagnostics.
    pub fn group_summaries(&self) -> impl Iterator<Item = (&str, usize)> {
        self.groups.iter().map(|(key, maps)| (key.as_str(), maps.len()))
    }

    /// Select the applicable group for a value datatype: category group
    /// first, then the explicit override key. `None` means the item cannot
    /// be mapped and is skipped by the orchestrator.
    pub fn resolve(&self, datatype: &str, override_key: Option<&str>) -> Option<&[FieldMap]> {
        let category = RecordCategory::from_datatype(datatype);
        self.group(category.group_key())
            .or_else(|| override_key.and_then(|key| self.group(key)))
    }
}

/// A transformed candidate value ready for merging into a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedValue {
    pub property: String,
    pub datatype: String,
    pub main: MainType,
    pub value: String,
}

/// Run every field map against the document. Maps without a match, with an
/// empty extracted value or with an invalid query contribute nothing; the
/// output keeps the mapping definition order.
pub fn apply_mapping(
    maps: &[FieldMap],
    document: &Document,
    countries: &CountryTable,
) -> Vec<ExtractedValue> {
    let mut values = Vec::new();
    for map in maps {
        if map.to.kind != "property" {
            continue;
        }
        let raw = match &map.from {
            FieldSource::Xpath { path } => {
                let query = path.trim_matches(|c| c == ' ' || c == '=');
                match document.query_first(query) {
                    Ok(Some(node)) => node.text_content().trim().to_string(),
                    Ok(None) => continue,
                    Err(err) => {
                        warn!(%err, "skipping field map with invalid path query");
                        continue;
                    }
                }
            }
            FieldSource::Constant { value } => value.trim().to_string(),
        };
        if raw.is_empty() {
            continue;
        }

        let datatype = map
            .to
            .data
            .datatype
            .clone()
            .unwrap_or_else(|| "literal".to_string());
        let transformed = apply_format(
            map.to.format.as_deref(),
            map.to.args.as_ref(),
            countries,
            datatype,
            raw,
        );
        let main = main_datatype(&transformed.datatype).unwrap_or(MainType::Literal);
        values.push(ExtractedValue {
            property: map.to.data.property.clone(),
            datatype: transformed.datatype,
            main,
            value: transformed.value,
        });
    }
    values
}
