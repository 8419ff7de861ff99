//! Thumbnail request descriptors
//!
//! A descriptor is the parsed form of the query string carried by a thumbnail
//! URI: which page to capture, at which output size, with which algorithm tag
//! and whether a cached copy may be reused.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::DescriptorError;

/// Values of the `refresh` parameter that leave force-refresh off
const FALSY_REFRESH_VALUES: [&str; 5] = ["", "0", "false", "no", "off"];

/// Immutable description of one thumbnail request
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestDescriptor {
    target_url: String,
    width: u32,
    height: u32,
    algorithm: String,
    force_refresh: bool,
}

impl RequestDescriptor {
    pub fn new<S: Into<String>>(target_url: S, width: u32, height: u32) -> Self {
        Self {
            target_url: target_url.into(),
            width,
            height,
            algorithm: String::new(),
            force_refresh: false,
        }
    }

    pub fn with_algorithm<S: Into<String>>(mut self, algorithm: S) -> Self {
        self.algorithm = algorithm.into();
        self
    }

    pub fn with_force_refresh(mut self, force_refresh: bool) -> Self {
        self.force_refresh = force_refresh;
        self
    }

    /// Replace the target while keeping size, algorithm and refresh flag
    pub fn with_target_url<S: Into<String>>(mut self, target_url: S) -> Self {
        self.target_url = target_url.into();
        self
    }

    /// Parse the URL-encoded query of a thumbnail URI.
    ///
    /// Pairs are split on `&` and then on the first `=`; pairs without `=` are
    /// skipped. Keys are matched case-insensitively and a later duplicate
    /// overrides an earlier one. `+` is kept literally.
    pub fn parse(raw_query: &str) -> Result<Self, DescriptorError> {
        let mut params = parse_params(raw_query);

        let width = parse_dimension(&params, "width")?;
        let height = parse_dimension(&params, "height")?;

        Ok(Self {
            target_url: params.remove("url").unwrap_or_default(),
            width,
            height,
            algorithm: params.remove("algorithm").unwrap_or_default(),
            force_refresh: params
                .get("refresh")
                .map(|value| is_truthy(value))
                .unwrap_or(false),
        })
    }

    /// Parse a complete thumbnail URI, splitting it at the first `?`
    pub fn from_uri(uri: &str) -> Result<Self, DescriptorError> {
        match uri.split_once('?') {
            Some((_, query)) => Self::parse(query),
            None => Err(DescriptorError::MissingQuery {
                uri: uri.to_string(),
            }),
        }
    }

    pub fn target_url(&self) -> &str {
        &self.target_url
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    pub fn force_refresh(&self) -> bool {
        self.force_refresh
    }
}

impl fmt::Display for RequestDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ {}x{}", self.target_url, self.width, self.height)?;
        if !self.algorithm.is_empty() {
            write!(f, " ({})", self.algorithm)?;
        }
        if self.force_refresh {
            write!(f, " [refresh]")?;
        }
        Ok(())
    }
}

/// Decode a query string into lower-cased keys and their last values
pub fn parse_params(raw_query: &str) -> HashMap<String, String> {
    let raw_query = raw_query.strip_prefix('?').unwrap_or(raw_query);

    let mut params = HashMap::new();
    for pair in raw_query.split('&') {
        let Some((raw_key, raw_value)) = pair.split_once('=') else {
            continue;
        };
        params.insert(percent_decode(raw_key).to_lowercase(), percent_decode(raw_value));
    }
    params
}

fn percent_decode(value: &str) -> String {
    match urlencoding::decode(value) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => String::from_utf8_lossy(&urlencoding::decode_binary(value.as_bytes())).into_owned(),
    }
}

fn parse_dimension(
    params: &HashMap<String, String>,
    name: &'static str,
) -> Result<u32, DescriptorError> {
    let value = params
        .get(name)
        .ok_or(DescriptorError::MissingParameter { name })?;

    match value.parse::<u32>() {
        Ok(parsed) if parsed > 0 => Ok(parsed),
        _ => Err(DescriptorError::InvalidDimension {
            name,
            value: value.clone(),
        }),
    }
}

fn is_truthy(value: &str) -> bool {
    let lowered = value.trim().to_lowercase();
    !FALSY_REFRESH_VALUES.contains(&lowered.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_parse_full_query() {
        let descriptor = RequestDescriptor::parse(
            "url=https%3A%2F%2Fexample.com%2Fpath%3Fq%3D1&width=200&height=100&algorithm=v1",
        )
        .unwrap();

        assert_eq!(descriptor.target_url(), "https://example.com/path?q=1");
        assert_eq!(descriptor.width(), 200);
        assert_eq!(descriptor.height(), 100);
        assert_eq!(descriptor.algorithm(), "v1");
        assert!(!descriptor.force_refresh());
    }

    #[test]
    fn test_parse_defaults_optional_fields() {
        let descriptor = RequestDescriptor::parse("width=10&height=20").unwrap();
        assert_eq!(descriptor.target_url(), "");
        assert_eq!(descriptor.algorithm(), "");
        assert!(!descriptor.force_refresh());
    }

    #[test]
    fn test_parse_keys_are_case_insensitive_and_later_duplicates_win() {
        let descriptor =
            RequestDescriptor::parse("URL=a&Width=10&HEIGHT=20&url=b&width=30").unwrap();
        assert_eq!(descriptor.target_url(), "b");
        assert_eq!(descriptor.width(), 30);
        assert_eq!(descriptor.height(), 20);
    }

    #[test]
    fn test_parse_plus_is_not_a_space() {
        let descriptor = RequestDescriptor::parse("url=a+b&width=1&height=1").unwrap();
        assert_eq!(descriptor.target_url(), "a+b");
    }

    #[test]
    fn test_parse_ignores_pairs_without_equals() {
        let descriptor = RequestDescriptor::parse("bogus&width=5&&height=6").unwrap();
        assert_eq!(descriptor.width(), 5);
        assert_eq!(descriptor.height(), 6);
    }

    #[test]
    fn test_parse_splits_on_first_equals() {
        let descriptor = RequestDescriptor::parse("url=a=b&width=5&height=6").unwrap();
        assert_eq!(descriptor.target_url(), "a=b");
    }

    #[rstest]
    #[case("height=10", DescriptorError::MissingParameter { name: "width" })]
    #[case("width=10", DescriptorError::MissingParameter { name: "height" })]
    #[case("width=abc&height=10", DescriptorError::InvalidDimension { name: "width", value: "abc".to_string() })]
    #[case("width=0&height=10", DescriptorError::InvalidDimension { name: "width", value: "0".to_string() })]
    #[case("width=10&height=-4", DescriptorError::InvalidDimension { name: "height", value: "-4".to_string() })]
    fn test_parse_rejects_bad_dimensions(#[case] query: &str, #[case] expected: DescriptorError) {
        assert_eq!(RequestDescriptor::parse(query).unwrap_err(), expected);
    }

    #[rstest]
    #[case("1", true)]
    #[case("true", true)]
    #[case("yes", true)]
    #[case("anything", true)]
    #[case("", false)]
    #[case("0", false)]
    #[case("false", false)]
    #[case("FALSE", false)]
    #[case("no", false)]
    #[case("Off", false)]
    fn test_parse_refresh_flag(#[case] value: &str, #[case] expected: bool) {
        let query = format!("width=1&height=1&refresh={value}");
        let descriptor = RequestDescriptor::parse(&query).unwrap();
        assert_eq!(descriptor.force_refresh(), expected);
    }

    #[test]
    fn test_from_uri() {
        let descriptor = RequestDescriptor::from_uri(
            "page-thumb://thumbnail?url=http%3A%2F%2Fa.test&width=4&height=3",
        )
        .unwrap();
        assert_eq!(descriptor.target_url(), "http://a.test");
        assert_eq!((descriptor.width(), descriptor.height()), (4, 3));
    }

    #[test]
    fn test_from_uri_without_query() {
        let error = RequestDescriptor::from_uri("page-thumb://thumbnail").unwrap_err();
        assert!(matches!(error, DescriptorError::MissingQuery { .. }));
    }

    #[test]
    fn test_display() {
        let descriptor = RequestDescriptor::new("https://example.com", 200, 100)
            .with_algorithm("v1")
            .with_force_refresh(true);
        assert_eq!(
            descriptor.to_string(),
            "https://example.com @ 200x100 (v1) [refresh]"
        );
    }
}
