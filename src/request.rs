//! Search request value and its wire encoding.

use std::collections::BTreeMap;

use crate::error::{Result, SearchError};

/// Parameters forced on every export call regardless of what the caller sets.
pub const FIXED_EXPORT_PARAMS: [(&str, &str); 3] = [
    ("output_mode", "csv"),
    ("preview", "0"),
    ("check_connection", "0"),
];

/// One immutable search: text, optional time bounds, optional projection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    search: String,
    earliest: Option<String>,
    latest: Option<String>,
    fields: Option<Vec<String>>,
}

impl SearchRequest {
    /// Build a request for `search`. Fails on empty or whitespace-only text.
    pub fn new(search: impl Into<String>) -> Result<Self> {
        let search = search.into();
        if search.trim().is_empty() {
            return Err(SearchError::EmptySearch);
        }
        Ok(Self {
            search,
            earliest: None,
            latest: None,
            fields: None,
        })
    }

    /// Earliest time bound, in any form the service accepts (`-24h`, epoch, ISO).
    pub fn earliest(mut self, earliest: impl Into<String>) -> Self {
        self.earliest = Some(earliest.into());
        self
    }

    pub fn latest(mut self, latest: impl Into<String>) -> Self {
        self.latest = Some(latest.into());
        self
    }

    /// Restrict the export to these fields, in this order.
    pub fn fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn search(&self) -> &str {
        &self.search
    }

    pub fn earliest_time(&self) -> Option<&str> {
        self.earliest.as_deref()
    }

    pub fn latest_time(&self) -> Option<&str> {
        self.latest.as_deref()
    }

    pub fn field_list(&self) -> Option<&[String]> {
        self.fields.as_deref()
    }

    /// Form parameters for the export endpoint.
    ///
    /// Keys are unique; the fixed export parameters are applied last and win.
    pub fn form_params(&self) -> BTreeMap<&'static str, String> {
        let mut params = BTreeMap::new();
        if let Some(fields) = &self.fields {
            params.insert("field_list", encode_field_list(fields));
        }
        if let Some(earliest) = &self.earliest {
            params.insert("earliest_time", earliest.clone());
        }
        if let Some(latest) = &self.latest {
            params.insert("latest_time", latest.clone());
        }
        params.insert("search", self.search.clone());
        for (key, value) in FIXED_EXPORT_PARAMS {
            params.insert(key, value.to_string());
        }
        params
    }

    /// URL-encoded request body for the export endpoint.
    pub fn form_body(&self) -> String {
        encode_form(self.form_params().iter().map(|(k, v)| (*k, v.as_str())))
    }
}

impl std::fmt::Display for SearchRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SearchRequest {{{}}}", self.search)
    }
}

/// `application/x-www-form-urlencoded` encoding of `pairs`.
pub fn encode_form<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> String {
    url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish()
}

/// Join field names with commas. Names are trimmed; empty names are skipped.
pub fn encode_field_list<S: AsRef<str>>(fields: &[S]) -> String {
    fields
        .iter()
        .map(|f| f.as_ref().trim())
        .filter(|f| !f.is_empty())
        .collect::<Vec<_>>()
        .join(",")
}

/// Split a comma-separated field list, trimming names and skipping blanks.
pub fn decode_field_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn empty_search_rejected() {
        assert!(matches!(SearchRequest::new(""), Err(SearchError::EmptySearch)));
        assert!(matches!(SearchRequest::new("   "), Err(SearchError::EmptySearch)));
    }

    #[test]
    fn minimal_request_has_only_search_and_fixed_params() {
        let req = SearchRequest::new("search index=main").unwrap();
        let params = req.form_params();
        assert_eq!(params.len(), 4);
        assert_eq!(params["search"], "search index=main");
        assert_eq!(params["output_mode"], "csv");
        assert_eq!(params["preview"], "0");
        assert_eq!(params["check_connection"], "0");
        assert!(!params.contains_key("field_list"));
        assert!(!params.contains_key("earliest_time"));
    }

    #[test]
    fn full_request_params() {
        let req = SearchRequest::new("search error")
            .unwrap()
            .earliest("-24h")
            .latest("now")
            .fields(["source", "sourcetype"]);
        let params = req.form_params();
        assert_eq!(params["field_list"], "source,sourcetype");
        assert_eq!(params["earliest_time"], "-24h");
        assert_eq!(params["latest_time"], "now");
        assert_eq!(req.field_list().unwrap().len(), 2);
    }

    #[test]
    fn form_body_is_url_encoded() {
        let req = SearchRequest::new("search a=b | head 5").unwrap();
        let body = req.form_body();
        assert!(body.contains("search=search+a%3Db+%7C+head+5"), "body: {body}");
        assert!(body.contains("output_mode=csv"), "body: {body}");
    }

    #[test]
    fn display_shows_search_text() {
        let req = SearchRequest::new("x").unwrap();
        assert_eq!(req.to_string(), "SearchRequest {x}");
    }

    #[rstest]
    #[case("a,b,c", vec!["a", "b", "c"])]
    #[case(" a , b ", vec!["a", "b"])]
    #[case("a,,b,", vec!["a", "b"])]
    #[case("", vec![])]
    #[case("_raw", vec!["_raw"])]
    fn decode_field_list_cases(#[case] input: &str, #[case] expected: Vec<&str>) {
        assert_eq!(decode_field_list(input), expected);
    }

    #[test]
    fn encode_field_list_skips_blanks() {
        assert_eq!(encode_field_list(&["host", " ", " source "]), "host,source");
        let empty: [&str; 0] = [];
        assert_eq!(encode_field_list(&empty), "");
    }
}
