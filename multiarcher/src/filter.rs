//! Namespace scoping and opt-out annotations

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;

use k8s_openapi::api::core::v1::Namespace;
use tracing::{debug, error, info};

/// Annotation that disables mutation for a namespace or a single workload
pub const DISABLED_ANNOTATION: &str = "k8smultiarcher.programmerq.io/disabled";

/// Whether the annotation map opts out of mutation
pub fn is_opted_out(annotations: Option<&BTreeMap<String, String>>) -> bool {
    annotations
        .and_then(|a| a.get(DISABLED_ANNOTATION))
        .is_some_and(|v| v == "true")
}

/// Single requirement of a label selector
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    Equal(String, String),
    NotEqual(String, String),
    In(String, BTreeSet<String>),
    NotIn(String, BTreeSet<String>),
    Exists(String),
    DoesNotExist(String),
}

impl Requirement {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            Self::Equal(key, value) => labels.get(key) == Some(value),
            Self::NotEqual(key, value) => labels.get(key) != Some(value),
            Self::In(key, values) => labels.get(key).is_some_and(|v| values.contains(v)),
            Self::NotIn(key, values) => !labels.get(key).is_some_and(|v| values.contains(v)),
            Self::Exists(key) => labels.contains_key(key),
            Self::DoesNotExist(key) => !labels.contains_key(key),
        }
    }
}

/// Error parsing a label selector string
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid label selector {selector:?}: {reason}")]
pub struct SelectorParseError {
    selector: String,
    reason: String,
}

/// Label selector in the string form accepted by `kubectl -l`
///
/// An empty selector matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    requirements: Vec<Requirement>,
}

impl LabelSelector {
    pub fn parse(selector: &str) -> Result<Self, SelectorParseError> {
        let fail = |reason: &str| SelectorParseError {
            selector: selector.to_owned(),
            reason: reason.to_owned(),
        };

        let requirements = split_terms(selector)
            .map_err(|reason| fail(reason))?
            .into_iter()
            .map(|term| parse_term(term).map_err(|reason| fail(reason)))
            .collect::<Result<_, _>>()?;

        Ok(Self { requirements })
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |values: &BTreeSet<String>| values.iter().cloned().collect::<Vec<_>>().join(",");
        for (i, requirement) in self.requirements.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            match requirement {
                Requirement::Equal(k, v) => write!(f, "{k}={v}")?,
                Requirement::NotEqual(k, v) => write!(f, "{k}!={v}")?,
                Requirement::In(k, vs) => write!(f, "{k} in ({})", join(vs))?,
                Requirement::NotIn(k, vs) => write!(f, "{k} notin ({})", join(vs))?,
                Requirement::Exists(k) => write!(f, "{k}")?,
                Requirement::DoesNotExist(k) => write!(f, "!{k}")?,
            }
        }
        Ok(())
    }
}

/// Splits on commas that are not inside a parenthesized value set
fn split_terms(selector: &str) -> Result<Vec<&str>, &'static str> {
    let mut terms = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;

    for (i, c) in selector.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.checked_sub(1).ok_or("unbalanced parenthesis")?,
            ',' if depth == 0 => {
                terms.push(selector[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err("unbalanced parenthesis");
    }
    terms.push(selector[start..].trim());

    if terms.len() == 1 && terms[0].is_empty() {
        return Ok(Vec::new());
    }
    if terms.iter().any(|t| t.is_empty()) {
        return Err("empty requirement");
    }
    Ok(terms)
}

fn parse_term(term: &str) -> Result<Requirement, &'static str> {
    if let Some(key) = term.strip_prefix('!') {
        return Ok(Requirement::DoesNotExist(label_key(key)?));
    }
    if let Some((key, value)) = term.split_once("!=") {
        return Ok(Requirement::NotEqual(label_key(key)?, label_value(value)?));
    }
    if let Some((key, value)) = term.split_once("==").or_else(|| term.split_once('=')) {
        return Ok(Requirement::Equal(label_key(key)?, label_value(value)?));
    }
    if let Some((key, values)) = term.split_once(" notin ") {
        return Ok(Requirement::NotIn(label_key(key)?, value_set(values)?));
    }
    if let Some((key, values)) = term.split_once(" in ") {
        return Ok(Requirement::In(label_key(key)?, value_set(values)?));
    }
    Ok(Requirement::Exists(label_key(term)?))
}

fn label_key(raw: &str) -> Result<String, &'static str> {
    let key = raw.trim();
    if key.is_empty() {
        return Err("empty label key");
    }
    if !key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'))
    {
        return Err("invalid character in label key");
    }
    Ok(key.to_owned())
}

fn label_value(raw: &str) -> Result<String, &'static str> {
    let value = raw.trim();
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err("invalid character in label value");
    }
    Ok(value.to_owned())
}

fn value_set(raw: &str) -> Result<BTreeSet<String>, &'static str> {
    let inner = raw
        .trim()
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .ok_or("value set must be parenthesized")?;

    inner.split(',').map(label_value).collect()
}

/// Decides which namespaces the webhook acts on
#[derive(Debug, Clone, Default)]
pub struct NamespaceFilter {
    selector: Option<LabelSelector>,
    ignored: HashSet<String>,
}

impl NamespaceFilter {
    pub fn new(selector: Option<LabelSelector>, ignored: impl IntoIterator<Item = String>) -> Self {
        Self {
            selector: selector.filter(|s| !s.is_empty()),
            ignored: ignored.into_iter().collect(),
        }
    }

    /// Reads `NAMESPACE_SELECTOR` and `NAMESPACES_TO_IGNORE`
    ///
    /// An unparseable selector is ignored rather than failing startup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let selector = lookup("NAMESPACE_SELECTOR")
            .filter(|s| !s.is_empty())
            .and_then(|raw| match LabelSelector::parse(&raw) {
                Ok(selector) => {
                    info!(selector = %selector, "loaded namespace selector");
                    Some(selector)
                }
                Err(err) => {
                    error!(error = %err, "failed to parse NAMESPACE_SELECTOR, ignoring");
                    None
                }
            });

        let ignored: Vec<String> = lookup("NAMESPACES_TO_IGNORE")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|ns| !ns.is_empty())
            .map(str::to_owned)
            .collect();
        if !ignored.is_empty() {
            info!(count = ignored.len(), namespaces = ?ignored, "loaded namespaces to ignore");
        }

        Self::new(selector, ignored)
    }

    /// Whether the namespace name alone excludes it
    pub fn is_ignored(&self, namespace: &str) -> bool {
        self.ignored.contains(namespace)
    }

    /// Whether the namespace object may be mutated
    ///
    /// Checks the ignore list, the label selector and the opt-out annotation.
    pub fn should_process(&self, namespace: &Namespace) -> bool {
        let name = namespace.metadata.name.as_deref().unwrap_or_default();

        if self.is_ignored(name) {
            debug!(namespace = name, "skipping namespace due to ignore list");
            return false;
        }

        if let Some(selector) = &self.selector {
            let labels = namespace.metadata.labels.clone().unwrap_or_default();
            if !selector.matches(&labels) {
                debug!(namespace = name, "skipping namespace due to selector mismatch");
                return false;
            }
        }

        if is_opted_out(namespace.metadata.annotations.as_ref()) {
            debug!(namespace = name, "skipping namespace due to disabled annotation");
            return false;
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn namespace(name: &str, l: &[(&str, &str)], a: &[(&str, &str)]) -> Namespace {
        Namespace {
            metadata: ObjectMeta {
                name: Some(name.into()),
                labels: Some(labels(l)),
                annotations: Some(labels(a)),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_selector_forms() {
        let selector =
            LabelSelector::parse("env=prod, tier!=db,team in (a, b),zone notin (x),managed,!legacy")
                .unwrap();

        assert_eq!(
            selector.requirements,
            vec![
                Requirement::Equal("env".into(), "prod".into()),
                Requirement::NotEqual("tier".into(), "db".into()),
                Requirement::In("team".into(), ["a".to_string(), "b".to_string()].into()),
                Requirement::NotIn("zone".into(), ["x".to_string()].into()),
                Requirement::Exists("managed".into()),
                Requirement::DoesNotExist("legacy".into()),
            ]
        );
    }

    #[test]
    fn test_parse_double_equals() {
        let selector = LabelSelector::parse("env==prod").unwrap();
        assert!(selector.matches(&labels(&[("env", "prod")])));
    }

    #[test]
    fn test_parse_invalid_selectors() {
        assert!(LabelSelector::parse("env=prod,").is_err());
        assert!(LabelSelector::parse("team in (a,b").is_err());
        assert!(LabelSelector::parse("team in a").is_err());
        assert!(LabelSelector::parse("=prod").is_err());
        assert!(LabelSelector::parse("env=pr od").is_err());
    }

    #[test]
    fn test_empty_selector_matches_everything() {
        let selector = LabelSelector::parse("").unwrap();
        assert!(selector.is_empty());
        assert!(selector.matches(&labels(&[])));
    }

    #[test]
    fn test_selector_matching() {
        let selector = LabelSelector::parse("env=prod,team in (a,b),!legacy").unwrap();

        assert!(selector.matches(&labels(&[("env", "prod"), ("team", "a")])));
        assert!(!selector.matches(&labels(&[("env", "dev"), ("team", "a")])));
        assert!(!selector.matches(&labels(&[("env", "prod"), ("team", "c")])));
        assert!(!selector.matches(&labels(&[
            ("env", "prod"),
            ("team", "b"),
            ("legacy", "true")
        ])));

        let not_in = LabelSelector::parse("zone notin (x)").unwrap();
        assert!(not_in.matches(&labels(&[])));
        assert!(!not_in.matches(&labels(&[("zone", "x")])));
    }

    #[test]
    fn test_selector_display_round_trip() {
        let raw = "env=prod,team in (a,b),!legacy";
        let selector = LabelSelector::parse(raw).unwrap();
        assert_eq!(selector.to_string(), raw);
    }

    #[test]
    fn test_from_lookup() {
        let filter = NamespaceFilter::from_lookup(|name| match name {
            "NAMESPACE_SELECTOR" => Some("multiarch=enabled".into()),
            "NAMESPACES_TO_IGNORE" => Some(" kube-system, ,monitoring ".into()),
            _ => None,
        });

        assert!(filter.is_ignored("kube-system"));
        assert!(filter.is_ignored("monitoring"));
        assert!(!filter.is_ignored(""));
        assert!(filter.selector.is_some());
    }

    #[test]
    fn test_from_lookup_invalid_selector_is_ignored() {
        let filter = NamespaceFilter::from_lookup(|name| {
            (name == "NAMESPACE_SELECTOR").then(|| "team in (a".to_string())
        });
        assert!(filter.selector.is_none());
        assert!(filter.should_process(&namespace("anything", &[], &[])));
    }

    #[test]
    fn test_should_process() {
        let filter = NamespaceFilter::new(
            Some(LabelSelector::parse("multiarch=enabled").unwrap()),
            vec!["kube-system".to_string()],
        );

        assert!(filter.should_process(&namespace("apps", &[("multiarch", "enabled")], &[])));
        assert!(!filter.should_process(&namespace("apps", &[], &[])));
        assert!(!filter.should_process(&namespace(
            "kube-system",
            &[("multiarch", "enabled")],
            &[]
        )));
        assert!(!filter.should_process(&namespace(
            "apps",
            &[("multiarch", "enabled")],
            &[(DISABLED_ANNOTATION, "true")]
        )));
    }

    #[test]
    fn test_opt_out_requires_literal_true() {
        assert!(is_opted_out(Some(&labels(&[(DISABLED_ANNOTATION, "true")]))));
        assert!(!is_opted_out(Some(&labels(&[(DISABLED_ANNOTATION, "yes")]))));
        assert!(!is_opted_out(Some(&labels(&[(DISABLED_ANNOTATION, "false")]))));
        assert!(!is_opted_out(Some(&labels(&[]))));
        assert!(!is_opted_out(None));
    }

    #[test]
    fn test_opt_out_annotation_name() {
        let annotations = labels(&[("k8smultiarcher.programmerq.io/disabled", "true")]);
        assert!(is_opted_out(Some(&annotations)));

        let annotations = labels(&[("multiarcher.dev/disabled", "true")]);
        assert!(!is_opted_out(Some(&annotations)));
    }
}
