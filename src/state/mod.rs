use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

use serde_yaml::{Mapping, Value};

use super::environment::{Environment, EnvironmentSpec, MissingFileHandler};
use super::merge::dig;
use super::selector::Selector;
use super::{ErrorKind, Result};

mod load;
pub use self::load::{LoadCtx, LoadOpts, Loader};

mod visitor;
pub use self::visitor::{StateVisit, Visitor};

/// A `--set name=value` style override on a release
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct SetValue {
    pub name: String,
    pub value: String,
}

/// Defaults applied to every release that leaves them unset
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct HelmDefaults {
    pub kubeContext: String,
    pub tillerNamespace: String,
    pub namespace: String,
    pub wait: Option<bool>,
    pub waitForJobs: Option<bool>,
    pub timeout: Option<u32>,
    pub atomic: Option<bool>,
    pub force: Option<bool>,
    pub verify: Option<bool>,
    pub createNamespace: Option<bool>,
    pub cleanupOnFail: Option<bool>,
    pub skipDeps: Option<bool>,
    /// Extra args passed verbatim to every engine call
    pub args: Vec<String>,
}

impl HelmDefaults {
    /// Field-wise merge where the overriding document wins
    fn absorb(&mut self, other: HelmDefaults) {
        if !other.kubeContext.is_empty() {
            self.kubeContext = other.kubeContext;
        }
        if !other.tillerNamespace.is_empty() {
            self.tillerNamespace = other.tillerNamespace;
        }
        if !other.namespace.is_empty() {
            self.namespace = other.namespace;
        }
        if other.wait.is_some() {
            self.wait = other.wait;
        }
        if other.waitForJobs.is_some() {
            self.waitForJobs = other.waitForJobs;
        }
        if other.timeout.is_some() {
            self.timeout = other.timeout;
        }
        if other.atomic.is_some() {
            self.atomic = other.atomic;
        }
        if other.force.is_some() {
            self.force = other.force;
        }
        if other.verify.is_some() {
            self.verify = other.verify;
        }
        if other.createNamespace.is_some() {
            self.createNamespace = other.createNamespace;
        }
        if other.cleanupOnFail.is_some() {
            self.cleanupOnFail = other.cleanupOnFail;
        }
        if other.skipDeps.is_some() {
            self.skipDeps = other.skipDeps;
        }
        if !other.args.is_empty() {
            self.args = other.args;
        }
    }
}

/// A chart repository to register with the engine
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct RepositorySpec {
    pub name: String,
    pub url: String,
    pub certFile: Option<String>,
    pub keyFile: Option<String>,
    pub caFile: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub oci: bool,
    pub passCredentials: bool,
}

/// A nested sub-manifest reference under `helmfiles:`
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct SubHelmfileSpec {
    /// Path or glob, relative to the referencing manifest
    pub path: String,
    pub selectors: Vec<String>,
    pub selectorsInherited: bool,
    /// Additional environment value sources for the child
    pub values: Vec<Value>,
}

impl SubHelmfileSpec {
    /// Bare string entries are shorthand for `{path: ...}`
    pub fn from_value(v: &Value) -> Result<SubHelmfileSpec> {
        match v {
            Value::String(s) => Ok(SubHelmfileSpec {
                path: s.clone(),
                ..Default::default()
            }),
            Value::Mapping(_) => Ok(serde_yaml::from_value(v.clone())?),
            other => bail!("helmfiles entries must be paths or maps, got {:?}", other),
        }
    }
}

/// One release of a chart into a `(kube-context, namespace)`
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct ReleaseSpec {
    pub name: String,
    pub namespace: String,
    pub kubeContext: String,
    pub tillerNamespace: String,
    /// Repo reference, local path, URL or OCI reference
    pub chart: String,
    pub version: Option<String>,
    /// Desired presence; false marks the release for deletion on apply
    pub installed: Option<bool>,
    /// Dotted path into the environment values used as an enable gate
    pub condition: String,
    pub needs: Vec<String>,
    pub labels: BTreeMap<String, String>,
    /// File paths or inline maps passed as chart values
    pub values: Vec<Value>,
    /// Encrypted values files, decrypted through the engine before use
    pub secrets: Vec<String>,
    pub set: Vec<SetValue>,
    pub missingFileHandler: Option<MissingFileHandler>,
    pub wait: Option<bool>,
    pub waitForJobs: Option<bool>,
    pub timeout: Option<u32>,
    pub atomic: Option<bool>,
    pub force: Option<bool>,
    pub verify: Option<bool>,
    pub createNamespace: Option<bool>,
    pub cleanupOnFail: Option<bool>,
    pub skipDeps: Option<bool>,
    pub disableValidation: Option<bool>,
    pub disableValidationOnInstall: Option<bool>,

    /// Condition result, set during normalization
    #[serde(skip)]
    pub _enabled: bool,
    /// Local chart directory after remote chart resolution
    #[serde(skip)]
    pub _resolved_chart: Option<String>,
}

impl ReleaseSpec {
    pub fn is_installed(&self) -> bool {
        self.installed.unwrap_or(true)
    }

    /// The chart path handed to the engine
    pub fn chart_path(&self) -> &str {
        self._resolved_chart.as_ref().unwrap_or(&self.chart)
    }

    pub fn id(&self, v3: bool) -> ReleaseId {
        if v3 {
            ReleaseId {
                context: nonempty(&self.kubeContext, "default"),
                namespace: self.namespace.clone(),
                name: self.name.clone(),
            }
        } else {
            // helm v2 identity is scoped by the tiller namespace only
            ReleaseId {
                context: nonempty(&self.tillerNamespace, "kube-system"),
                namespace: String::new(),
                name: self.name.clone(),
            }
        }
    }

    /// Expand a `needs` entry to a canonical id
    ///
    /// `name` inherits this release's context and namespace, `ns/name` its
    /// context, `ctx/ns/name` is fully qualified.
    pub fn need_id(&self, need: &str, v3: bool) -> ReleaseId {
        let parts: Vec<&str> = need.split('/').collect();
        let (context, namespace, name) = match parts.len() {
            1 => (self.kubeContext.clone(), self.namespace.clone(), parts[0].into()),
            2 => (self.kubeContext.clone(), parts[0].into(), parts[1].into()),
            _ => (parts[0].into(), parts[1].into(), parts[2..].join("/")),
        };
        if v3 {
            ReleaseId {
                context: nonempty(&context, "default"),
                namespace,
                name,
            }
        } else {
            ReleaseId {
                context: nonempty(&self.tillerNamespace, "kube-system"),
                namespace: String::new(),
                name,
            }
        }
    }

    fn apply_defaults(&mut self, d: &HelmDefaults) {
        if self.kubeContext.is_empty() {
            self.kubeContext = d.kubeContext.clone();
        }
        if self.tillerNamespace.is_empty() {
            self.tillerNamespace = d.tillerNamespace.clone();
        }
        if self.namespace.is_empty() {
            self.namespace = d.namespace.clone();
        }
        if self.wait.is_none() {
            self.wait = d.wait;
        }
        if self.waitForJobs.is_none() {
            self.waitForJobs = d.waitForJobs;
        }
        if self.timeout.is_none() {
            self.timeout = d.timeout;
        }
        if self.atomic.is_none() {
            self.atomic = d.atomic;
        }
        if self.force.is_none() {
            self.force = d.force;
        }
        if self.verify.is_none() {
            self.verify = d.verify;
        }
        if self.createNamespace.is_none() {
            self.createNamespace = d.createNamespace;
        }
        if self.cleanupOnFail.is_none() {
            self.cleanupOnFail = d.cleanupOnFail;
        }
        if self.skipDeps.is_none() {
            self.skipDeps = d.skipDeps;
        }
    }
}

fn nonempty(s: &str, fallback: &str) -> String {
    if s.is_empty() {
        fallback.into()
    } else {
        s.into()
    }
}

/// Canonical release identity used for needs-resolution and duplicate checks
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReleaseId {
    pub context: String,
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for ReleaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}/{}", self.context, self.name)
        } else {
            write!(f, "{}/{}/{}", self.context, self.namespace, self.name)
        }
    }
}

/// The first-pass parse of a document: only enough to find bases and
/// environments, everything else ignored
#[derive(Deserialize, Default)]
#[serde(default)]
pub struct StatePartial {
    pub environments: BTreeMap<String, EnvironmentSpec>,
    pub bases: Vec<String>,
}

/// One loaded manifest after base inheritance, templating and environment
/// resolution
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct HelmState {
    #[serde(skip)]
    pub filePath: PathBuf,

    pub helmfiles: Vec<Value>,
    pub bases: Vec<String>,
    pub environments: BTreeMap<String, EnvironmentSpec>,
    pub helmDefaults: HelmDefaults,
    pub repositories: Vec<RepositorySpec>,
    pub releases: Vec<ReleaseSpec>,
    pub commonLabels: BTreeMap<String, String>,
    /// Named yaml anchors usable from release entries in the same document
    pub templates: Mapping,
    pub apiVersions: Vec<String>,
    pub kubeVersion: Option<String>,

    /// The environment the second pass was rendered with
    #[serde(skip)]
    pub env: Environment,
}

impl HelmState {
    /// Parsed `helmfiles:` entries (paths or maps)
    pub fn sub_helmfiles(&self) -> Result<Vec<SubHelmfileSpec>> {
        self.helmfiles.iter().map(SubHelmfileSpec::from_value).collect()
    }

    /// Merge a later document of the same manifest into the accumulated state
    ///
    /// Scalars last-writer-win, the ordered lists append, maps merge.
    pub fn absorb(&mut self, doc: HelmState) {
        self.helmfiles.extend(doc.helmfiles);
        self.releases.extend(doc.releases);
        self.repositories.extend(doc.repositories);
        for (name, spec) in doc.environments {
            let entry = self.environments.entry(name).or_default();
            entry.values.extend(spec.values);
            if spec.missingFileHandler.is_some() {
                entry.missingFileHandler = spec.missingFileHandler;
            }
        }
        self.helmDefaults.absorb(doc.helmDefaults);
        self.commonLabels.extend(doc.commonLabels);
        for (k, v) in doc.templates {
            self.templates.insert(k, v);
        }
        self.apiVersions.extend(doc.apiVersions);
        if doc.kubeVersion.is_some() {
            self.kubeVersion = doc.kubeVersion;
        }
    }

    /// Merge an inherited base manifest at lowest priority
    ///
    /// Only the sharable parts of a base take part: environments,
    /// helmDefaults, repositories, templates and commonLabels. Its releases
    /// are never executed through the inheriting state.
    pub fn absorb_base(&mut self, base: HelmState) {
        for (name, spec) in base.environments {
            let entry = self.environments.entry(name).or_default();
            // base values sit under anything the current document adds
            let mut values = spec.values;
            values.extend(entry.values.drain(..));
            entry.values = values;
            if entry.missingFileHandler.is_none() {
                entry.missingFileHandler = spec.missingFileHandler;
            }
        }
        let mut defaults = base.helmDefaults;
        defaults.absorb(std::mem::replace(&mut self.helmDefaults, HelmDefaults::default()));
        self.helmDefaults = defaults;
        let mut repos = base.repositories;
        repos.extend(self.repositories.drain(..));
        self.repositories = repos;
        for (k, v) in base.templates {
            if !self.templates.contains_key(&k) {
                self.templates.insert(k, v);
            }
        }
        for (k, v) in base.commonLabels {
            self.commonLabels.entry(k).or_insert(v);
        }
    }

    /// Apply defaults, inject common labels and evaluate conditions
    pub fn normalize(&mut self) -> Result<()> {
        let defaults = self.helmDefaults.clone();
        let common = self.commonLabels.clone();
        let env_values = self.env.values.clone();
        for release in &mut self.releases {
            release.apply_defaults(&defaults);
            for (k, v) in &common {
                release.labels.entry(k.clone()).or_insert_with(|| v.clone());
            }
            release._enabled = if release.condition.is_empty() {
                true
            } else {
                match dig(&env_values, &release.condition) {
                    Some(Value::Bool(b)) => *b,
                    None => {
                        debug!(
                            "condition {} not present, disabling release {}",
                            release.condition, release.name
                        );
                        false
                    }
                    Some(other) => bail!(
                        "condition {} for release {} must be a boolean, got {:?}",
                        release.condition,
                        release.name,
                        other
                    ),
                }
            };
        }
        Ok(())
    }

    /// Releases that passed their condition gate
    pub fn enabled_releases(&self) -> Vec<ReleaseSpec> {
        self.releases.iter().filter(|r| r._enabled).cloned().collect()
    }

    /// Filter enabled releases through a selector and verify id uniqueness
    pub fn select(&self, selector: &Selector, v3: bool) -> Result<Vec<ReleaseSpec>> {
        let selected = selector.filter(&self.enabled_releases());
        check_duplicates(&selected, v3)?;
        Ok(selected)
    }
}

/// Two selected releases must never share an id
pub fn check_duplicates(releases: &[ReleaseSpec], v3: bool) -> Result<()> {
    let mut seen = BTreeSet::new();
    for r in releases {
        let id = r.id(v3);
        if !seen.insert(id.clone()) {
            if v3 {
                bail!(ErrorKind::DuplicateRelease(
                    id.name,
                    id.namespace,
                    id.context
                ));
            }
            bail!(ErrorKind::DuplicateReleaseLegacy(id.name, id.context));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn release(name: &str, ns: &str, ctx: &str) -> ReleaseSpec {
        let mut r = ReleaseSpec::default();
        r.name = name.into();
        r.namespace = ns.into();
        r.kubeContext = ctx.into();
        r._enabled = true;
        r
    }

    #[test]
    fn release_id_forms() {
        let r = release("api", "prod", "east");
        assert_eq!(r.id(true).to_string(), "east/prod/api");
        let bare = release("api", "prod", "");
        assert_eq!(bare.id(true).to_string(), "default/prod/api");
        let mut legacy = release("api", "prod", "");
        legacy.tillerNamespace = "tiller".into();
        assert_eq!(legacy.id(false).to_string(), "tiller/api");
    }

    #[test]
    fn need_id_inherits_context() {
        let r = release("api", "prod", "east");
        assert_eq!(r.need_id("db", true).to_string(), "east/prod/db");
        assert_eq!(r.need_id("infra/db", true).to_string(), "east/infra/db");
        assert_eq!(r.need_id("west/infra/db", true).to_string(), "west/infra/db");
    }

    #[test]
    fn duplicates_are_fatal_v3() {
        let rs = vec![release("foo", "zoo", ""), release("foo", "zoo", "")];
        let err = check_duplicates(&rs, true).unwrap_err();
        assert_eq!(
            err.to_string(),
            "duplicate release \"foo\" found in namespace \"zoo\" in kubecontext \"default\""
        );
        // same name in different namespaces is fine under v3
        let ok = vec![release("foo", "zoo", ""), release("foo", "park", "")];
        assert!(check_duplicates(&ok, true).is_ok());
    }

    #[test]
    fn duplicates_are_fatal_v2_across_namespaces() {
        let mut a = release("foo", "zoo", "");
        a.tillerNamespace = "tiller".into();
        let mut b = release("foo", "park", "");
        b.tillerNamespace = "tiller".into();
        let err = check_duplicates(&[a, b], false).unwrap_err();
        assert_eq!(
            err.to_string(),
            "duplicate release \"foo\" found in tiller namespace \"tiller\""
        );
    }

    #[test]
    fn absorb_appends_and_merges() {
        let mut acc: HelmState = serde_yaml::from_str(
            "releases:\n  - name: a\n    chart: c/a\nhelmDefaults:\n  timeout: 60",
        )
        .unwrap();
        let doc: HelmState = serde_yaml::from_str(
            "releases:\n  - name: b\n    chart: c/b\nhelmDefaults:\n  wait: true",
        )
        .unwrap();
        acc.absorb(doc);
        assert_eq!(acc.releases.len(), 2);
        assert_eq!(acc.helmDefaults.timeout, Some(60));
        assert_eq!(acc.helmDefaults.wait, Some(true));
    }

    #[test]
    fn base_sits_under_current() {
        let mut state: HelmState =
            serde_yaml::from_str("helmDefaults:\n  kubeContext: own").unwrap();
        let base: HelmState =
            serde_yaml::from_str("helmDefaults:\n  kubeContext: base\n  timeout: 300").unwrap();
        state.absorb_base(base);
        assert_eq!(state.helmDefaults.kubeContext, "own");
        assert_eq!(state.helmDefaults.timeout, Some(300));
    }

    #[test]
    fn normalize_applies_defaults_and_conditions() {
        let mut state: HelmState = serde_yaml::from_str(
            r#"
helmDefaults:
  namespace: shared
  timeout: 120
commonLabels:
  team: platform
releases:
  - name: gated
    chart: c/gated
    condition: gated.enabled
  - name: open
    chart: c/open
    labels:
      team: own
"#,
        )
        .unwrap();
        state.env.values = serde_yaml::from_str("gated:\n  enabled: false").unwrap();
        state.normalize().unwrap();

        let enabled = state.enabled_releases();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].name, "open");
        assert_eq!(enabled[0].namespace, "shared");
        assert_eq!(enabled[0].timeout, Some(120));
        // release labels win over commonLabels
        assert_eq!(enabled[0].labels["team"], "own");
    }

    #[test]
    fn non_boolean_condition_is_fatal() {
        let mut state: HelmState = serde_yaml::from_str(
            "releases:\n  - name: r\n    chart: c/r\n    condition: svc.enabled",
        )
        .unwrap();
        state.env.values = serde_yaml::from_str("svc:\n  enabled: sure").unwrap();
        assert!(state.normalize().is_err());
    }
}
