//! Label sets for tcm components
//!
//! A label set identifies a single series (when sampled from the backend) or
//! selects the targets of a scrape job (when used as a job selector). Labels
//! are kept sorted so that rendering and size estimation are deterministic.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Label carrying the metric name of a series
pub const METRIC_NAME_LABEL: &str = "__name__";

/// Label carrying the scrape job name of a series
pub const JOB_LABEL: &str = "job";

/// An ordered set of label name/value pairs
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelSet(BTreeMap<String, String>);

impl LabelSet {
    /// Create an empty label set
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder pattern for adding a label
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    /// Insert a label, returning the previous value if any
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(name.into(), value.into())
    }

    /// Get the value of a label
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// Metric name of the series, if the set carries one
    pub fn metric_name(&self) -> Option<&str> {
        self.get(METRIC_NAME_LABEL)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Size in bytes of the canonical text form `{a="b",c="d"}`
    pub fn serialized_len(&self) -> usize {
        self.to_string().len()
    }

    /// Render the set as a selector, optionally pinned to one metric name
    ///
    /// The metric name is expressed as a `__name__` matcher so that names
    /// containing colons or other unusual characters stay valid.
    pub fn selector(&self, metric: Option<&str>) -> String {
        let mut matchers = Vec::with_capacity(self.0.len() + 1);
        if let Some(metric) = metric {
            matchers.push(format!("{}=\"{}\"", METRIC_NAME_LABEL, escape_value(metric)));
        }
        for (name, value) in &self.0 {
            if name == METRIC_NAME_LABEL && metric.is_some() {
                continue;
            }
            matchers.push(format!("{}=\"{}\"", name, escape_value(value)));
        }
        format!("{{{}}}", matchers.join(","))
    }
}

impl fmt::Display for LabelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (name, value)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}=\"{}\"", name, escape_value(value))?;
        }
        f.write_str("}")
    }
}

impl<K, V> FromIterator<(K, V)> for LabelSet
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl From<BTreeMap<String, String>> for LabelSet {
    fn from(labels: BTreeMap<String, String>) -> Self {
        Self(labels)
    }
}

/// Escape a label value the way the Prometheus text format does
fn escape_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            _ => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_is_sorted() {
        let labels = LabelSet::new()
            .with("path", "/api")
            .with("__name__", "http_requests_total")
            .with("code", "200");

        assert_eq!(
            labels.to_string(),
            r#"{__name__="http_requests_total",code="200",path="/api"}"#
        );
        assert_eq!(labels.metric_name(), Some("http_requests_total"));
    }

    #[test]
    fn test_serialized_len() {
        assert_eq!(LabelSet::new().serialized_len(), 2);

        let labels = LabelSet::new().with("a", "b");
        // {a="b"}
        assert_eq!(labels.serialized_len(), 7);
    }

    #[test]
    fn test_escaping() {
        let labels = LabelSet::new().with("msg", "say \"hi\"\n");
        assert_eq!(labels.to_string(), r#"{msg="say \"hi\"\n"}"#);
    }

    #[test]
    fn test_selector() {
        let selector = LabelSet::new().with("job", "api").with("env", "prod");
        assert_eq!(selector.selector(None), r#"{env="prod",job="api"}"#);
        assert_eq!(
            selector.selector(Some("up")),
            r#"{__name__="up",env="prod",job="api"}"#
        );
    }

    #[test]
    fn test_from_iter() {
        let labels: LabelSet = vec![("job", "api"), ("instance", "a:9100")].into_iter().collect();
        assert_eq!(labels.len(), 2);
        assert_eq!(labels.get("job"), Some("api"));
    }
}
