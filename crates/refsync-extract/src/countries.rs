//! Country code to GeoNames URI table, loaded from a remote feed at run
//! start with a bundled snapshot as fallback.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{info, warn};

/// Default feed carrying the maintained country table.
pub const COUNTRY_FEED_URL: &str =
    "https://raw.githubusercontent.com/Daniel-KM/Omeka-S-module-Mapper/master/data/mapping/tables/geonames.countries.json";

const BUNDLED_SNAPSHOT: &str = include_str!("../data/geonames_countries.json");

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountryTable {
    entries: BTreeMap<String, String>,
}

impl CountryTable {
    /// Snapshot shipped with the crate. The file is validated by tests, so a
    /// parse failure here is a build defect.
    pub fn bundled() -> Self {
        let entries = serde_json::from_str(BUNDLED_SNAPSHOT)
            .expect("bundled country snapshot is valid json");
        Self { entries }
    }

    pub fn from_entries(entries: BTreeMap<String, String>) -> Self {
        Self { entries }
    }

    /// Fetch the live feed, falling back to the bundled snapshot when the
    /// feed is unreachable, unparseable or empty.
    pub async fn load(feed_url: &str, timeout: Duration) -> Self {
        match Self::fetch_feed(feed_url, timeout).await {
            Ok(entries) if !entries.is_empty() => {
                info!(%feed_url, entries = entries.len(), "loaded country table from feed");
                Self { entries }
            }
            Ok(_) => {
                warn!(%feed_url, "country feed is empty, using bundled snapshot");
                Self::bundled()
            }
            Err(err) => {
                warn!(%feed_url, %err, "country feed unavailable, using bundled snapshot");
                Self::bundled()
            }
        }
    }

    async fn fetch_feed(
        feed_url: &str,
        timeout: Duration,
    ) -> Result<BTreeMap<String, String>, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let response = client.get(feed_url).send().await?.error_for_status()?;
        response.json().await
    }

    pub fn get(&self, code: &str) -> Option<&str> {
        self.entries.get(code).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundled_snapshot_parses_and_has_france() {
        let table = CountryTable::bundled();
        assert!(!table.is_empty());
        assert_eq!(table.get("FR"), Some("http://www.geonames.org/3017382"));
        assert_eq!(table.get("XX"), None);
    }

    #[tokio::test]
    async fn unreachable_feed_falls_back_to_snapshot() {
        let table = CountryTable::load("http://127.0.0.1:9/countries.json", Duration::from_millis(200)).await;
        assert_eq!(table, CountryTable::bundled());
    }
}
