//! Format rules applied to raw extracted values. Every rule is total: input
//! that a rule cannot handle passes through as a literal.

use crate::countries::CountryTable;
use crate::FormatArgs;

/// Token substituted with the raw value in `concat` argument lists.
pub const VALUE_PLACEHOLDER: &str = "__value__";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transformed {
    pub value: String,
    pub datatype: String,
}

/// Apply the named format to a raw value. An unknown or absent format is a
/// no-op; table and conversion misses fall back to a literal-typed
/// passthrough of the raw value.
pub fn apply_format(
    format: Option<&str>,
    args: Option<&FormatArgs>,
    countries: &CountryTable,
    datatype: String,
    raw: String,
) -> Transformed {
    match format {
        Some("concat") => {
            let Some(FormatArgs::List(tokens)) = args else {
                return Transformed { value: raw, datatype };
            };
            let value = tokens
                .iter()
                .map(|token| {
                    if token == VALUE_PLACEHOLDER {
                        raw.as_str()
                    } else {
                        token.as_str()
                    }
                })
                .collect();
            Transformed { value, datatype }
        }
        Some("table") => {
            if let Some(FormatArgs::Table(table)) = args {
                if let Some(mapped) = table.get(&raw) {
                    return Transformed {
                        value: mapped.clone(),
                        datatype,
                    };
                }
            }
            Transformed {
                value: raw,
                datatype: "literal".to_string(),
            }
        }
        Some("number_to_date") => match number_to_date(&raw) {
            Some(date) => Transformed {
                value: date,
                datatype,
            },
            None => Transformed {
                value: raw,
                datatype: "literal".to_string(),
            },
        },
        Some("code_to_uri") => match countries.get(&raw) {
            Some(uri) => Transformed {
                value: uri.to_string(),
                datatype,
            },
            None => Transformed {
                value: raw,
                datatype: "literal".to_string(),
            },
        },
        _ => Transformed { value: raw, datatype },
    }
}

/// Convert a numeric date like `19480520` into `[sign]YYYY[-MM[-DD]]` by
/// 4/2/2 slicing, trimming empty trailing groups. Returns `None` when the
/// input is not an optional sign followed by one to eight digits.
pub fn number_to_date(value: &str) -> Option<String> {
    let (sign, digits) = match value.as_bytes().first() {
        Some(b'-') => ("-", &value[1..]),
        Some(b'+') | Some(b' ') => ("", &value[1..]),
        _ => ("", value),
    };
    if digits.is_empty() || digits.len() > 8 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let year = &digits[..digits.len().min(4)];
    let month = digits.get(4..digits.len().min(6)).unwrap_or("");
    let day = digits.get(6..digits.len().min(8)).unwrap_or("");
    let sliced = format!("{year}-{month}-{day}");
    Some(format!("{sign}{}", sliced.trim_end_matches('-')))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn no_countries() -> CountryTable {
        CountryTable::from_entries(BTreeMap::new())
    }

    #[test]
    fn number_to_date_slices_full_dates() {
        assert_eq!(number_to_date("19480520").as_deref(), Some("1948-05-20"));
        assert_eq!(number_to_date("-00500101").as_deref(), Some("-0050-01-01"));
    }

    #[test]
    fn number_to_date_trims_partial_input() {
        assert_eq!(number_to_date("1948").as_deref(), Some("1948"));
        assert_eq!(number_to_date("194805").as_deref(), Some("1948-05"));
        assert_eq!(number_to_date("19").as_deref(), Some("19"));
        assert_eq!(number_to_date("+19480520").as_deref(), Some("1948-05-20"));
    }

    #[test]
    fn number_to_date_rejects_non_numeric_and_overlong() {
        assert_eq!(number_to_date("abc"), None);
        assert_eq!(number_to_date(""), None);
        assert_eq!(number_to_date("194805201"), None);
        assert_eq!(number_to_date("19-48"), None);
    }

    #[test]
    fn non_matching_number_falls_back_to_literal() {
        let out = apply_format(
            Some("number_to_date"),
            None,
            &no_countries(),
            "numeric:timestamp".into(),
            "abc".into(),
        );
        assert_eq!(out.value, "abc");
        assert_eq!(out.datatype, "literal");
    }

    #[test]
    fn concat_substitutes_the_placeholder() {
        let args = FormatArgs::List(vec![
            "http://id.loc.gov/vocabulary/iso639-2/".into(),
            VALUE_PLACEHOLDER.into(),
        ]);
        let out = apply_format(
            Some("concat"),
            Some(&args),
            &no_countries(),
            "uri".into(),
            "fre".into(),
        );
        assert_eq!(out.value, "http://id.loc.gov/vocabulary/iso639-2/fre");
        assert_eq!(out.datatype, "uri");
    }

    #[test]
    fn table_hits_keep_the_datatype_and_misses_go_literal() {
        let mut map = BTreeMap::new();
        map.insert("a".to_string(), "article".to_string());
        let args = FormatArgs::Table(map);
        let hit = apply_format(Some("table"), Some(&args), &no_countries(), "uri".into(), "a".into());
        assert_eq!(hit.value, "article");
        assert_eq!(hit.datatype, "uri");
        let miss = apply_format(Some("table"), Some(&args), &no_countries(), "uri".into(), "z".into());
        assert_eq!(miss.value, "z");
        assert_eq!(miss.datatype, "literal");
    }

    #[test]
    fn code_to_uri_uses_the_country_table() {
        let table = CountryTable::bundled();
        let hit = apply_format(Some("code_to_uri"), None, &table, "uri".into(), "FR".into());
        assert_eq!(hit.value, "http://www.geonames.org/3017382");
        assert_eq!(hit.datatype, "uri");
        let miss = apply_format(Some("code_to_uri"), None, &table, "uri".into(), "ZZ".into());
        assert_eq!(miss.value, "ZZ");
        assert_eq!(miss.datatype, "literal");
    }

    #[test]
    fn unknown_format_is_a_no_op() {
        let out = apply_format(Some("shout"), None, &no_countries(), "literal".into(), "x".into());
        assert_eq!(out.value, "x");
        assert_eq!(out.datatype, "literal");
        let none = apply_format(None, None, &no_countries(), "literal".into(), "x".into());
        assert_eq!(none.value, "x");
    }
}
