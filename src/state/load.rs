use std::path::{Path, PathBuf};
use std::sync::Arc;

use regex::Regex;
use serde_yaml::{Mapping, Value};

use super::{check_duplicates, HelmState, StatePartial};
use crate::environment::{self, Environment};
use crate::fs::Filesystem;
use crate::merge::resolve_merge_keys;
use crate::template::Renderer;
use crate::{Result, ResultExt};

/// Options fixed for the whole invocation
#[derive(Clone, Debug)]
pub struct LoadOpts {
    /// The requested environment name
    pub environment: String,
    /// CLI selectors, applied per state by the visitor
    pub selectors: Vec<String>,
    /// CLI state value layers (`--state-values-file`, `--state-values-set`),
    /// highest precedence
    pub state_values: Vec<Mapping>,
    /// Reverse the release and visitation order (delete/destroy)
    pub reverse: bool,
    /// Engine generation, decides release identity rules
    pub v3: bool,
    /// `EXPERIMENTAL=explicit-selector-inheritance`
    pub explicit_selector_inheritance: bool,
}

impl Default for LoadOpts {
    fn default() -> Self {
        LoadOpts {
            environment: "default".into(),
            selectors: vec![],
            state_values: vec![],
            reverse: false,
            v3: true,
            explicit_selector_inheritance: false,
        }
    }
}

/// Per-state loading context, passed by value into recursion
#[derive(Clone, Debug, Default)]
pub struct LoadCtx {
    /// Environment values inherited from the parent state
    pub inherited: Mapping,
    /// Override layers from the referencing `helmfiles:` entry
    pub overrides: Vec<Mapping>,
}

/// The two-pass manifest loader
pub struct Loader {
    fs: Arc<dyn Filesystem>,
    opts: LoadOpts,
}

impl Loader {
    pub fn new(fs: Arc<dyn Filesystem>, opts: LoadOpts) -> Self {
        Loader { fs, opts }
    }

    pub fn opts(&self) -> &LoadOpts {
        &self.opts
    }

    pub fn fs(&self) -> &Arc<dyn Filesystem> {
        &self.fs
    }

    /// Load, render and normalize one manifest
    pub fn load(&self, path: &Path, ctx: &LoadCtx) -> Result<HelmState> {
        let mut visiting = vec![];
        let mut state = self.load_raw(path, ctx, &mut visiting)?;
        if self.opts.reverse {
            state.releases.reverse();
        }
        state
            .normalize()
            .chain_err(|| format!("in {}", state.filePath.display()))?;
        check_duplicates(&state.enabled_releases(), self.opts.v3)
            .chain_err(|| format!("in {}", state.filePath.display()))?;
        Ok(state)
    }

    /// The document pipeline, shared between states and their bases
    fn load_raw(
        &self,
        path: &Path,
        ctx: &LoadCtx,
        visiting: &mut Vec<PathBuf>,
    ) -> Result<HelmState> {
        let abs = self.fs.abs(path)?;
        if visiting.contains(&abs) {
            bail!("circular base inheritance involving {}", abs.display());
        }
        visiting.push(abs.clone());

        let dir = abs.parent().map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));
        let content = self
            .fs
            .read_to_string(&abs)
            .chain_err(|| format!("in {}", path.display()))?;
        let renderer = Renderer::new(self.fs.clone(), dir.clone());

        let mut state = HelmState::default();
        state.filePath = abs.clone();
        state.env = Environment::empty(&self.opts.environment);

        let inherited_env = Environment {
            name: self.opts.environment.clone(),
            values: ctx.inherited.clone(),
            defaults: Mapping::new(),
        };

        for (i, doc) in split_documents(&content).into_iter().enumerate() {
            if doc.trim().is_empty() {
                continue;
            }
            let tpl_name = format!("{}#{}", abs.display(), i);

            // First pass: render against the inherited environment and pick
            // out bases and environment declarations. The final environment
            // is not visible yet, so render failures only defer to the
            // second pass.
            let first = match renderer.render(&tpl_name, &doc, &inherited_env) {
                Ok(rendered) => rendered,
                Err(e) => {
                    debug!("first-pass render of document {} deferred: {}", i, e);
                    doc.clone()
                }
            };
            let partial: StatePartial = serde_yaml::from_str::<Value>(&first)
                .ok()
                .and_then(|v| serde_yaml::from_value(resolve_merge_keys(v)).ok())
                .unwrap_or_default();

            for (bi, base) in partial.bases.iter().enumerate() {
                let base_path = dir.join(base);
                let base_state = self
                    .load_raw(&base_path, ctx, visiting)
                    .chain_err(|| format!("in {}: in .bases[{}]", abs.display(), bi))?;
                state.absorb_base(base_state);
            }

            // Environment declarations seen so far: bases and earlier
            // documents, then this document's own
            let mut env_specs = state.environments.clone();
            for (name, spec) in partial.environments {
                let entry = env_specs.entry(name).or_default();
                entry.values.extend(spec.values);
                if spec.missingFileHandler.is_some() {
                    entry.missingFileHandler = spec.missingFileHandler;
                }
            }

            let spec = env_specs.get(&self.opts.environment);
            if spec.is_none() && self.opts.environment != "default" {
                bail!(crate::ErrorKind::UnknownEnvironment(self.opts.environment.clone()));
            }
            let mut overrides = ctx.overrides.clone();
            overrides.extend(self.opts.state_values.iter().cloned());
            let env = environment::resolve(
                &self.opts.environment,
                spec,
                &self.fs,
                &dir,
                &ctx.inherited,
                &overrides,
            )
            .chain_err(|| format!("in {}", abs.display()))?;

            // Second pass: the full render with the resolved environment
            let second = renderer
                .render(&tpl_name, &doc, &env)
                .chain_err(|| format!("in {}: document {}", abs.display(), i))?;
            if second.trim().is_empty() {
                state.env = env;
                continue;
            }
            let value: Value = serde_yaml::from_str(&second)
                .chain_err(|| format!("in {}: document {}", abs.display(), i))?;
            if value.is_null() {
                state.env = env;
                continue;
            }
            let parsed: HelmState = serde_yaml::from_value(resolve_merge_keys(value))
                .chain_err(|| format!("in {}: document {}", abs.display(), i))?;

            state.absorb(parsed);
            state.env = env;
        }

        visiting.pop();
        Ok(state)
    }
}

/// Split a manifest into its yaml documents
///
/// Rendering happens per document, so anchors never leak across `---`
/// boundaries.
fn split_documents(content: &str) -> Vec<String> {
    let sep = Regex::new(r"(?m)^---\s*$").unwrap();
    sep.split(content).map(String::from).collect()
}
