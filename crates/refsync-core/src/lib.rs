//! Core domain model for refsync: repository resources, property values and
//! the datatype classification shared by the extract and sync crates.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "refsync-core";

/// Whether new values are added alongside or instead of existing ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateMode {
    Append,
    Replace,
}

#[derive(Debug, Error)]
#[error("unknown update mode {0:?} (expected \"append\" or \"replace\")")]
pub struct ParseUpdateModeError(String);

impl FromStr for UpdateMode {
    type Err = ParseUpdateModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "append" => Ok(Self::Append),
            "replace" => Ok(Self::Replace),
            other => Err(ParseUpdateModeError(other.to_string())),
        }
    }
}

impl fmt::Display for UpdateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Append => "append",
            Self::Replace => "replace",
        })
    }
}

/// Coarse classification of a datatype, deciding which value slot is filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MainType {
    Literal,
    Uri,
    Resource,
}

/// Resolve the main type of a concrete datatype name.
///
/// The table mirrors the datatypes the host repository and its common
/// extension modules register. Unknown names return `None`; callers that
/// build values treat that as literal.
pub fn main_datatype(datatype: &str) -> Option<MainType> {
    let datatype = datatype.to_ascii_lowercase();
    let known = match datatype.as_str() {
        "literal" => Some(MainType::Literal),
        "uri" => Some(MainType::Uri),
        "resource" | "resource:item" | "resource:itemset" | "resource:media"
        | "resource:annotation" | "annotation" => Some(MainType::Resource),
        // Geometry datatypes, both schema generations.
        "geometry:geography:coordinates" | "geometry:geography" | "geometry:geometry"
        | "geography" | "geography:coordinates" | "geometry" | "geometry:coordinates"
        | "geometry:position" => Some(MainType::Literal),
        "html" | "xml" | "boolean" | "email" => Some(MainType::Literal),
        "numeric:timestamp" | "numeric:integer" | "numeric:duration" | "numeric:interval" => {
            Some(MainType::Literal)
        }
        _ => None,
    };
    if known.is_some() {
        return known;
    }
    if datatype.starts_with("valuesuggest") {
        return Some(MainType::Uri);
    }
    if datatype.starts_with("customvocab") {
        return Some(MainType::Literal);
    }
    None
}

/// Closed set of authority-record categories used to pick a mapping group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordCategory {
    Person,
    Organization,
    Other,
}

impl RecordCategory {
    pub fn from_datatype(datatype: &str) -> Self {
        match datatype {
            "valuesuggest:idref:person" => Self::Person,
            "valuesuggest:idref:corporation" => Self::Organization,
            _ => Self::Other,
        }
    }

    /// Key of the matching group in a mapping definition file.
    pub fn group_key(self) -> &'static str {
        match self {
            Self::Person => "Personne",
            Self::Organization => "Collectivité",
            Self::Other => "Autre",
        }
    }
}

/// One value attached to a resource property, in the repository's JSON-LD
/// value shape. The datatype decides which of `literal`, `uri` and
/// `resource_ref` is semantically active; the other slots stay `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyValue {
    pub property_id: u64,
    #[serde(rename = "type")]
    pub datatype: String,
    #[serde(rename = "@language", default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(rename = "@value", default, skip_serializing_if = "Option::is_none")]
    pub literal: Option<String>,
    #[serde(rename = "@id", default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(rename = "o:label", default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(rename = "value_resource_id", default, skip_serializing_if = "Option::is_none")]
    pub resource_ref: Option<u64>,
    #[serde(default = "default_true")]
    pub is_public: bool,
}

fn default_true() -> bool {
    true
}

impl PropertyValue {
    pub fn literal(property_id: u64, datatype: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            property_id,
            datatype: datatype.into(),
            language: None,
            literal: Some(value.into()),
            uri: None,
            label: None,
            resource_ref: None,
            is_public: true,
        }
    }

    pub fn uri(property_id: u64, datatype: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            property_id,
            datatype: datatype.into(),
            language: None,
            literal: None,
            uri: Some(uri.into()),
            label: None,
            resource_ref: None,
            is_public: true,
        }
    }

    /// Normalized form used for duplicate detection: every field of the
    /// comparison superset made optional, absent fields as `None`.
    pub fn normalized(&self) -> NormalizedValue {
        NormalizedValue {
            property_id: Some(self.property_id),
            datatype: Some(self.datatype.clone()),
            language: self.language.clone(),
            literal: self.literal.clone(),
            uri: self.uri.clone(),
            label: self.label.clone(),
            resource_ref: self.resource_ref,
            is_public: Some(self.is_public),
        }
    }
}

/// Structural-equality key over the full field superset, with total ordering
/// so candidate sets can be sorted and deduplicated deterministically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct NormalizedValue {
    pub property_id: Option<u64>,
    pub datatype: Option<String>,
    pub language: Option<String>,
    pub literal: Option<String>,
    pub uri: Option<String>,
    pub label: Option<String>,
    pub resource_ref: Option<u64>,
    pub is_public: Option<bool>,
}

/// A repository entity with its property values. Resources are read via the
/// paged search, mutated in place by the updater and written back whole; the
/// sync never creates or deletes them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub id: u64,
    pub resource_name: String,
    #[serde(default)]
    pub properties: BTreeMap<String, Vec<PropertyValue>>,
}

impl Resource {
    pub fn new(id: u64, resource_name: impl Into<String>) -> Self {
        Self {
            id,
            resource_name: resource_name.into(),
            properties: BTreeMap::new(),
        }
    }

    /// First value of `term` whose datatype is in `datatypes`.
    pub fn value_of(&self, term: &str, datatypes: &[String]) -> Option<&PropertyValue> {
        self.properties
            .get(term)?
            .iter()
            .find(|v| datatypes.iter().any(|d| d == &v.datatype))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn main_datatype_covers_the_closed_table() {
        assert_eq!(main_datatype("literal"), Some(MainType::Literal));
        assert_eq!(main_datatype("uri"), Some(MainType::Uri));
        assert_eq!(main_datatype("resource:item"), Some(MainType::Resource));
        assert_eq!(main_datatype("numeric:timestamp"), Some(MainType::Literal));
        assert_eq!(main_datatype("geometry:geography"), Some(MainType::Literal));
    }

    #[test]
    fn main_datatype_prefixes_and_unknowns() {
        assert_eq!(main_datatype("valuesuggest:idref:person"), Some(MainType::Uri));
        assert_eq!(main_datatype("customvocab:12"), Some(MainType::Literal));
        assert_eq!(main_datatype("something:else"), None);
    }

    #[test]
    fn category_resolution_is_closed_with_other_fallback() {
        assert_eq!(
            RecordCategory::from_datatype("valuesuggest:idref:person"),
            RecordCategory::Person
        );
        assert_eq!(
            RecordCategory::from_datatype("valuesuggest:idref:corporation"),
            RecordCategory::Organization
        );
        assert_eq!(RecordCategory::from_datatype("uri"), RecordCategory::Other);
        assert_eq!(RecordCategory::Other.group_key(), "Autre");
    }

    #[test]
    fn normalized_values_compare_structurally() {
        let a = PropertyValue::literal(7, "literal", "Durand");
        let mut b = PropertyValue::literal(7, "literal", "Durand");
        assert_eq!(a.normalized(), b.normalized());
        b.language = Some("fra".into());
        assert_ne!(a.normalized(), b.normalized());
    }

    #[test]
    fn property_value_serializes_to_jsonld_names() {
        let value = PropertyValue::uri(3, "valuesuggest:idref:person", "https://www.idref.fr/1");
        let json = serde_json::to_value(&value).unwrap();
        assert_eq!(json["property_id"], 3);
        assert_eq!(json["type"], "valuesuggest:idref:person");
        assert_eq!(json["@id"], "https://www.idref.fr/1");
        assert!(json.get("@value").is_none());
        assert_eq!(json["is_public"], true);
    }

    #[test]
    fn value_of_filters_by_datatype() {
        let mut resource = Resource::new(1, "items");
        resource.properties.insert(
            "dcterms:creator".into(),
            vec![
                PropertyValue::literal(2, "literal", "plain"),
                PropertyValue::uri(2, "valuesuggest:idref:person", "https://www.idref.fr/2"),
            ],
        );
        let datatypes = vec!["valuesuggest:idref:person".to_string()];
        let found = resource.value_of("dcterms:creator", &datatypes).unwrap();
        assert_eq!(found.uri.as_deref(), Some("https://www.idref.fr/2"));
        assert!(resource.value_of("dcterms:subject", &datatypes).is_none());
    }

    #[test]
    fn update_mode_parses_and_rejects() {
        assert_eq!("append".parse::<UpdateMode>().unwrap(), UpdateMode::Append);
        assert_eq!("replace".parse::<UpdateMode>().unwrap(), UpdateMode::Replace);
        assert!("upsert".parse::<UpdateMode>().is_err());
    }
}
