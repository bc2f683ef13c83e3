//! Merging transformed values into a resource under the configured mode and
//! issuing the persistence write.

use std::collections::{BTreeMap, HashSet};

use refsync_core::{MainType, PropertyValue, Resource, UpdateMode};
use refsync_extract::ExtractedValue;
use tracing::error;

use crate::store::ResourceStore;

/// Sentinel accepted in the allowed-properties list meaning "no restriction".
pub const ALL_PROPERTIES: &str = "all";

/// Terminal outcome of one item's update, bucketed by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Updated,
    NoNewData,
    Failed,
}

/// Merge `values` into `resource` and write it back when anything changed.
///
/// In replace mode the prior values of a property are cleared the first time
/// that property is touched in this call; untouched properties keep theirs.
/// In append mode a candidate equal to an existing value (structural
/// equality over the normalized field superset) is skipped. A write error is
/// logged and reported as `Failed`, never raised past the item boundary.
pub async fn update_resource(
    store: &dyn ResourceStore,
    resource: &Resource,
    values: &[ExtractedValue],
    mode: UpdateMode,
    allowed_properties: &[String],
    property_ids: &BTreeMap<String, u64>,
) -> UpdateOutcome {
    let process_all = allowed_properties.iter().any(|p| p == ALL_PROPERTIES);

    let mut data = resource.clone();
    let mut touched: HashSet<&str> = HashSet::new();
    let mut is_new = false;

    for value in values {
        if !process_all && !allowed_properties.contains(&value.property) {
            continue;
        }
        let Some(&property_id) = property_ids.get(&value.property) else {
            continue;
        };

        let new_value = match value.main {
            MainType::Uri => PropertyValue::uri(property_id, &value.datatype, &value.value),
            // Resource references cannot be built from an extracted string.
            MainType::Resource | MainType::Literal => {
                PropertyValue::literal(property_id, &value.datatype, &value.value)
            }
        };

        let existing = data.properties.entry(value.property.clone()).or_default();
        if mode == UpdateMode::Replace && touched.insert(value.property.as_str()) {
            existing.clear();
        }

        if mode == UpdateMode::Append
            && existing
                .iter()
                .any(|candidate| candidate.normalized() == new_value.normalized())
        {
            continue;
        }

        existing.push(new_value);
        is_new = true;
    }

    if !is_new {
        return UpdateOutcome::NoNewData;
    }

    match store.update(&data).await {
        Ok(()) => UpdateOutcome::Updated,
        Err(err) => {
            error!(id = resource.id, %err, "resource not updatable");
            UpdateOutcome::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use refsync_core::MainType;

    fn property_ids() -> BTreeMap<String, u64> {
        BTreeMap::from([
            ("foaf:name".to_string(), 10),
            ("foaf:familyName".to_string(), 11),
            ("dcterms:subject".to_string(), 12),
        ])
    }

    fn literal_value(property: &str, value: &str) -> ExtractedValue {
        ExtractedValue {
            property: property.to_string(),
            datatype: "literal".to_string(),
            main: MainType::Literal,
            value: value.to_string(),
        }
    }

    fn store_with(resource: Resource) -> MemoryStore {
        MemoryStore::new(property_ids()).with_resources([resource])
    }

    #[tokio::test]
    async fn append_adds_and_suppresses_duplicates() {
        let mut resource = Resource::new(1, "items");
        resource
            .properties
            .insert("foaf:name".into(), vec![PropertyValue::literal(10, "literal", "Jean Durand")]);
        let store = store_with(resource.clone());

        let values = [
            literal_value("foaf:name", "Jean Durand"),
            literal_value("foaf:familyName", "Durand"),
        ];
        let outcome = update_resource(
            &store,
            &resource,
            &values,
            UpdateMode::Append,
            &["all".to_string()],
            &property_ids(),
        )
        .await;

        assert_eq!(outcome, UpdateOutcome::Updated);
        let updated = store.resource(1).unwrap();
        assert_eq!(updated.properties["foaf:name"].len(), 1);
        assert_eq!(
            updated.properties["foaf:familyName"][0].literal.as_deref(),
            Some("Durand")
        );
    }

    #[tokio::test]
    async fn all_duplicates_is_no_new_data_without_a_write() {
        let mut resource = Resource::new(1, "items");
        resource
            .properties
            .insert("foaf:name".into(), vec![PropertyValue::literal(10, "literal", "Jean Durand")]);
        let store = store_with(resource.clone());

        let values = [literal_value("foaf:name", "Jean Durand")];
        let outcome = update_resource(
            &store,
            &resource,
            &values,
            UpdateMode::Append,
            &["all".to_string()],
            &property_ids(),
        )
        .await;

        assert_eq!(outcome, UpdateOutcome::NoNewData);
        assert_eq!(store.update_calls(), 0);
    }

    #[tokio::test]
    async fn replace_clears_touched_properties_once_and_leaves_others() {
        let mut resource = Resource::new(1, "items");
        resource
            .properties
            .insert("foaf:name".into(), vec![PropertyValue::literal(10, "literal", "Old Name")]);
        resource
            .properties
            .insert("dcterms:subject".into(), vec![PropertyValue::literal(12, "literal", "Kept")]);
        let store = store_with(resource.clone());

        let values = [
            literal_value("foaf:name", "Jean Durand"),
            literal_value("foaf:name", "J. Durand"),
        ];
        let outcome = update_resource(
            &store,
            &resource,
            &values,
            UpdateMode::Replace,
            &["all".to_string()],
            &property_ids(),
        )
        .await;

        assert_eq!(outcome, UpdateOutcome::Updated);
        let updated = store.resource(1).unwrap();
        let names: Vec<_> = updated.properties["foaf:name"]
            .iter()
            .filter_map(|v| v.literal.as_deref())
            .collect();
        // Both values of this run survive; only the prior value is gone.
        assert_eq!(names, ["Jean Durand", "J. Durand"]);
        assert_eq!(
            updated.properties["dcterms:subject"][0].literal.as_deref(),
            Some("Kept")
        );
    }

    #[tokio::test]
    async fn out_of_scope_properties_are_ignored() {
        let resource = Resource::new(1, "items");
        let store = store_with(resource.clone());

        let values = [
            literal_value("foaf:name", "Jean Durand"),
            literal_value("foaf:familyName", "Durand"),
        ];
        let outcome = update_resource(
            &store,
            &resource,
            &values,
            UpdateMode::Append,
            &["foaf:familyName".to_string()],
            &property_ids(),
        )
        .await;

        assert_eq!(outcome, UpdateOutcome::Updated);
        let updated = store.resource(1).unwrap();
        assert!(!updated.properties.contains_key("foaf:name"));
        assert!(updated.properties.contains_key("foaf:familyName"));
    }

    #[tokio::test]
    async fn write_failure_is_contained_as_failed() {
        let resource = Resource::new(7, "items");
        let store = MemoryStore::new(property_ids())
            .with_resources([resource.clone()])
            .failing_updates([7]);

        let values = [literal_value("foaf:name", "Jean Durand")];
        let outcome = update_resource(
            &store,
            &resource,
            &values,
            UpdateMode::Append,
            &["all".to_string()],
            &property_ids(),
        )
        .await;

        assert_eq!(outcome, UpdateOutcome::Failed);
    }

    #[tokio::test]
    async fn no_usable_values_is_no_new_data() {
        let resource = Resource::new(1, "items");
        let store = store_with(resource.clone());
        let outcome = update_resource(
            &store,
            &resource,
            &[],
            UpdateMode::Replace,
            &["all".to_string()],
            &property_ids(),
        )
        .await;
        assert_eq!(outcome, UpdateOutcome::NoNewData);
        assert_eq!(store.update_calls(), 0);
    }

    #[tokio::test]
    async fn uri_values_populate_the_identifier_slot() {
        let resource = Resource::new(1, "items");
        let store = store_with(resource.clone());
        let values = [ExtractedValue {
            property: "foaf:name".to_string(),
            datatype: "uri".to_string(),
            main: MainType::Uri,
            value: "http://www.geonames.org/3017382".to_string(),
        }];
        update_resource(
            &store,
            &resource,
            &values,
            UpdateMode::Append,
            &["all".to_string()],
            &property_ids(),
        )
        .await;
        let updated = store.resource(1).unwrap();
        let value = &updated.properties["foaf:name"][0];
        assert_eq!(value.uri.as_deref(), Some("http://www.geonames.org/3017382"));
        assert!(value.literal.is_none());
    }
}
