use std::collections::BTreeMap;

use regex::Regex;

use super::state::ReleaseSpec;
use super::{ErrorKind, Result};

#[derive(Debug, Clone, PartialEq)]
struct LabelExpr {
    key: String,
    value: String,
    negated: bool,
}

/// A conjunction of `k=v` / `k!=v` label expressions
///
/// Releases are matched against their labels unioned with the identity
/// fields `name`, `namespace` and `chart`. An empty selector matches all.
#[derive(Debug, Clone, Default)]
pub struct Selector {
    exprs: Vec<LabelExpr>,
}

impl Selector {
    pub fn parse(labels: &[String]) -> Result<Selector> {
        let wellformed = Regex::new(r"^([A-Za-z0-9_-]+)(!?=)([A-Za-z0-9_-]+)$").unwrap();
        let mut exprs = vec![];
        for label in labels {
            let caps = match wellformed.captures(label) {
                Some(c) => c,
                None => bail!(ErrorKind::MalformedSelector(label.clone())),
            };
            exprs.push(LabelExpr {
                key: caps[1].to_string(),
                value: caps[3].to_string(),
                negated: &caps[2] == "!=",
            });
        }
        Ok(Selector { exprs })
    }

    pub fn is_empty(&self) -> bool {
        self.exprs.is_empty()
    }

    pub fn matches(&self, release: &ReleaseSpec) -> bool {
        let mut labels: BTreeMap<String, String> = release.labels.clone();
        labels.insert("name".into(), release.name.clone());
        labels.insert("namespace".into(), release.namespace.clone());
        labels.insert("chart".into(), release.chart.clone());

        self.exprs.iter().all(|e| {
            let found = labels.get(&e.key).map(|v| v == &e.value).unwrap_or(false);
            found != e.negated
        })
    }

    /// Filter a release list, preserving order
    pub fn filter(&self, releases: &[ReleaseSpec]) -> Vec<ReleaseSpec> {
        releases.iter().filter(|r| self.matches(r)).cloned().collect()
    }
}
