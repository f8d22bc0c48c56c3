use std::collections::HashMap;
use std::fs as stdfs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use serde_yaml::{Mapping, Value};
use tempfile::TempDir;
use tera::Context;

use super::affected::Affected;
use super::chart::ChartResolver;
use super::engine::{DiffResult, EngineRegistry};
use super::executor::{run_groups, FailurePolicy, Outcome};
use super::fs::{Filesystem, RealFs};
use super::graph::{plan, NeedsOpts, Plan};
use super::merge::{merge_values, stringify_keys};
use super::selector::Selector;
use super::state::{HelmState, LoadOpts, Loader, ReleaseId, ReleaseSpec, StateVisit, Visitor};
use super::template::Renderer;
use super::{ErrorKind, Result, ResultExt};

/// Everything the CLI resolved for one invocation
#[derive(Clone, Debug)]
pub struct RunOpts {
    pub file: Option<String>,
    pub environment: String,
    pub namespace: Option<String>,
    pub selectors: Vec<String>,
    pub kube_context: Option<String>,
    pub state_values_files: Vec<String>,
    pub state_values_sets: Vec<String>,
    pub helm_binary: String,
    pub concurrency: usize,
    pub skip_deps: bool,
    pub skip_repos: bool,
    pub skip_crds: bool,
    pub skip_needs: bool,
    pub include_needs: bool,
    pub include_transitive_needs: bool,
    pub detailed_exitcode: bool,
    pub suppress_secrets: bool,
    pub context_lines: Option<u32>,
    pub color: Option<bool>,
    pub interactive: bool,
    /// Extra args appended verbatim to every engine call
    pub engine_args: Vec<String>,
    pub explicit_selector_inheritance: bool,
}

impl Default for RunOpts {
    fn default() -> Self {
        RunOpts {
            file: None,
            environment: "default".into(),
            namespace: None,
            selectors: vec![],
            kube_context: None,
            state_values_files: vec![],
            state_values_sets: vec![],
            helm_binary: "helm".into(),
            concurrency: 0,
            skip_deps: false,
            skip_repos: false,
            skip_crds: false,
            skip_needs: false,
            include_needs: false,
            include_transitive_needs: false,
            detailed_exitcode: false,
            suppress_secrets: false,
            context_lines: None,
            color: None,
            interactive: false,
            engine_args: vec![],
            explicit_selector_inheritance: false,
        }
    }
}

/// The operation a flag set is built for
#[derive(Clone, Copy, PartialEq)]
enum Op {
    Diff,
    Sync,
    Template,
    Lint,
    Delete,
    Test,
    Status,
}

/// Binds loader, planner, executor and engines into per-command flows
pub struct Runner {
    opts: RunOpts,
    fs: Arc<dyn Filesystem>,
    registry: Arc<EngineRegistry>,
    affected: Arc<Affected>,
    cancel: Arc<AtomicBool>,
    scratch: TempDir,
    scratch_seq: AtomicUsize,
}

impl Runner {
    pub fn new(opts: RunOpts) -> Result<Self> {
        let registry = Arc::new(EngineRegistry::new(&opts.helm_binary));
        Self::with_parts(opts, Arc::new(RealFs::default()), registry)
    }

    /// Constructor with injectable collaborators, used by tests
    pub fn with_parts(
        opts: RunOpts,
        fs: Arc<dyn Filesystem>,
        registry: Arc<EngineRegistry>,
    ) -> Result<Self> {
        Ok(Runner {
            opts,
            fs,
            registry,
            affected: Arc::new(Affected::new()),
            cancel: Arc::new(AtomicBool::new(false)),
            scratch: tempfile::Builder::new().prefix("flotilla-values").tempdir()?,
            scratch_seq: AtomicUsize::new(0),
        })
    }

    pub fn affected(&self) -> &Affected {
        &self.affected
    }

    pub fn cancel_token(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    fn entry_file(&self) -> Result<PathBuf> {
        if let Some(ref f) = self.opts.file {
            return Ok(PathBuf::from(f));
        }
        let default = PathBuf::from("helmfile.yaml");
        if self.fs.file_exists(&default) {
            return Ok(default);
        }
        bail!("no manifest found: pass one with --file or create helmfile.yaml");
    }

    fn default_context(&self) -> String {
        self.opts.kube_context.clone().unwrap_or_default()
    }

    fn engine_v3(&self) -> Result<bool> {
        Ok(self.registry.get(&self.default_context())?.is_v3())
    }

    fn load_opts(&self, reverse: bool, v3: bool) -> Result<LoadOpts> {
        let mut state_values = vec![];
        for file in &self.opts.state_values_files {
            let raw = self.fs.read_to_string(&PathBuf::from(file))?;
            let parsed: Value = serde_yaml::from_str(&raw).chain_err(|| format!("in {}", file))?;
            match stringify_keys(parsed) {
                Value::Mapping(m) => state_values.push(m),
                Value::Null => {}
                _ => bail!("{} does not contain a top-level map", file),
            }
        }
        let mut sets = Mapping::new();
        for kv in &self.opts.state_values_sets {
            let mut parts = kv.splitn(2, '=');
            match (parts.next(), parts.next()) {
                (Some(path), Some(value)) if !path.is_empty() => {
                    set_dotted(&mut sets, path, Value::String(value.into()))
                }
                _ => bail!("--state-values-set entries must be of the form path=value, got {}", kv),
            }
        }
        if !sets.is_empty() {
            state_values.push(sets);
        }

        Ok(LoadOpts {
            environment: self.opts.environment.clone(),
            selectors: self.opts.selectors.clone(),
            state_values,
            reverse,
            v3,
            explicit_selector_inheritance: self.opts.explicit_selector_inheritance,
        })
    }

    fn visitor(&self, reverse: bool, v3: bool) -> Result<Visitor> {
        Ok(Visitor::new(Loader::new(self.fs.clone(), self.load_opts(reverse, v3)?)))
    }

    fn needs_opts(&self) -> NeedsOpts {
        NeedsOpts {
            skip_needs: self.opts.skip_needs,
            include_needs: self.opts.include_needs,
            include_transitive_needs: self.opts.include_transitive_needs,
        }
    }

    fn ensure_matches(&self, total: usize) -> Result<()> {
        if total == 0 && !self.opts.selectors.is_empty() {
            bail!(ErrorKind::NoMatchingReleases);
        }
        Ok(())
    }

    fn context_for(&self, release: &ReleaseSpec) -> String {
        self.opts
            .kube_context
            .clone()
            .unwrap_or_else(|| release.kubeContext.clone())
    }

    /// Repo setup, chart downloads and dependency builds for one state
    fn prepare(&self, visit: &StateVisit, selected: &mut Vec<ReleaseSpec>) -> Result<()> {
        if !self.opts.skip_repos {
            let mut contexts: Vec<String> =
                selected.iter().map(|r| self.context_for(r)).collect();
            if contexts.is_empty() {
                contexts.push(self.default_context());
            }
            contexts.sort();
            contexts.dedup();
            for ctx in contexts {
                self.registry.sync_repos_once(&ctx, &visit.state.repositories)?;
            }
        }

        let resolver = ChartResolver::new()?;
        let state_dir = state_dir(&visit.state);
        for release in selected.iter_mut() {
            let engine = self.registry.get(&self.context_for(release))?;
            let mut extra = visit.state.helmDefaults.args.clone();
            extra.extend(self.opts.engine_args.iter().cloned());
            if !extra.is_empty() {
                engine.set_extra_args(extra);
            }
            resolver.resolve(engine.as_ref(), release)?;

            let skip_deps = self.opts.skip_deps || release.skipDeps.unwrap_or(false);
            if !skip_deps {
                let chart = state_dir.join(release.chart_path());
                if self.fs.dir_exists(&chart) {
                    engine.build_deps(&release.name, &chart.to_string_lossy())?;
                }
            }
        }
        Ok(())
    }

    fn scratch_file(&self, hint: &str, content: &str) -> Result<PathBuf> {
        let seq = self.scratch_seq.fetch_add(1, Ordering::SeqCst);
        let path = self.scratch.path().join(format!("{}-{}.yaml", hint, seq));
        stdfs::write(&path, content)?;
        Ok(path)
    }

    /// Materialize a release's values entries into `-f` arguments
    fn values_flags(&self, state: &HelmState, release: &ReleaseSpec) -> Result<Vec<String>> {
        let dir = state_dir(state);
        let renderer = Renderer::new(self.fs.clone(), dir.clone());
        let mut flags = vec![];
        for entry in &release.values {
            match entry {
                Value::String(rel) => {
                    let path = dir.join(rel);
                    if !self.fs.file_exists(&path) {
                        use crate::environment::MissingFileHandler::*;
                        match release.missingFileHandler.unwrap_or_default() {
                            Error => bail!(ErrorKind::MissingValuesFile(rel.clone())),
                            Warn => warn!("no file matching \"{}\" found, skipping", rel),
                            Info => info!("no file matching \"{}\" found, skipping", rel),
                            Debug => debug!("no file matching \"{}\" found, skipping", rel),
                        }
                        continue;
                    }
                    if rel.ends_with(".gotmpl") {
                        // templated values render against the state environment
                        let raw = self.fs.read_to_string(&path)?;
                        let rendered = renderer
                            .render(&path.to_string_lossy(), &raw, &state.env)
                            .chain_err(|| format!("in {}", path.display()))?;
                        let tmp = self.scratch_file(&release.name, &rendered)?;
                        flags.push("--values".into());
                        flags.push(tmp.to_string_lossy().into());
                    } else {
                        flags.push("--values".into());
                        flags.push(path.to_string_lossy().into());
                    }
                }
                Value::Mapping(inline) => {
                    let body = serde_yaml::to_string(&Value::Mapping(inline.clone()))?;
                    let tmp = self.scratch_file(&release.name, &body)?;
                    flags.push("--values".into());
                    flags.push(tmp.to_string_lossy().into());
                }
                Value::Null => {}
                other => bail!(
                    "values entries for release {} must be paths or maps, got {:?}",
                    release.name,
                    other
                ),
            }
        }
        for secret in &release.secrets {
            let path = dir.join(secret);
            if !self.fs.file_exists(&path) {
                bail!(ErrorKind::MissingValuesFile(secret.clone()));
            }
            let engine = self.registry.get(&self.context_for(release))?;
            let decrypted = engine.decrypt_secret(&path.to_string_lossy())?;
            flags.push("--values".into());
            flags.push(decrypted.to_string_lossy().into());
        }
        for sv in &release.set {
            flags.push("--set".into());
            flags.push(format!("{}={}", sv.name, sv.value));
        }
        Ok(flags)
    }

    /// Build the engine flag set for one release and operation
    fn release_flags(
        &self,
        state: &HelmState,
        release: &ReleaseSpec,
        v3: bool,
        op: Op,
    ) -> Result<Vec<String>> {
        let mut flags = vec![];

        let namespace = self
            .opts
            .namespace
            .clone()
            .unwrap_or_else(|| release.namespace.clone());
        if !namespace.is_empty() {
            flags.push("--namespace".into());
            flags.push(namespace);
        }
        if !v3 && !release.tillerNamespace.is_empty() {
            flags.push("--tiller-namespace".into());
            flags.push(release.tillerNamespace.clone());
        }

        match op {
            Op::Diff | Op::Sync | Op::Template | Op::Lint => {
                flags.extend(self.values_flags(state, release)?);
                if let Some(ref v) = release.version {
                    flags.push("--version".into());
                    flags.push(v.clone());
                }
            }
            _ => {}
        }
        if op == Op::Diff || op == Op::Sync || op == Op::Template {
            for api in &state.apiVersions {
                flags.push("--api-versions".into());
                flags.push(api.clone());
            }
            if let Some(ref kv) = state.kubeVersion {
                flags.push("--kube-version".into());
                flags.push(kv.clone());
            }
        }

        match op {
            Op::Diff => {
                if let Some(n) = self.opts.context_lines {
                    flags.push("--context".into());
                    flags.push(n.to_string());
                }
                match self.opts.color {
                    Some(false) => flags.push("--no-color".into()),
                    Some(true) => flags.push("--color".into()),
                    None => {}
                }
                if release.disableValidation.unwrap_or(false) {
                    flags.push("--disable-validation".into());
                }
            }
            Op::Sync => {
                if release.wait.unwrap_or(false) {
                    flags.push("--wait".into());
                }
                if release.waitForJobs.unwrap_or(false) {
                    flags.push("--wait-for-jobs".into());
                }
                if let Some(t) = release.timeout {
                    flags.push("--timeout".into());
                    flags.push(if v3 { format!("{}s", t) } else { t.to_string() });
                }
                if release.atomic.unwrap_or(false) {
                    flags.push("--atomic".into());
                }
                if release.force.unwrap_or(false) {
                    flags.push("--force".into());
                }
                if release.verify.unwrap_or(false) {
                    flags.push("--verify".into());
                }
                if release.cleanupOnFail.unwrap_or(false) {
                    flags.push("--cleanup-on-fail".into());
                }
                if v3 && release.createNamespace.unwrap_or(false) {
                    flags.push("--create-namespace".into());
                }
                if self.opts.skip_crds {
                    flags.push("--skip-crds".into());
                }
            }
            Op::Delete => {
                if let Some(t) = release.timeout {
                    if v3 {
                        flags.push("--timeout".into());
                        flags.push(format!("{}s", t));
                    }
                }
            }
            Op::Test => {
                if !v3 {
                    if let Some(t) = release.timeout {
                        flags.push("--timeout".into());
                        flags.push(t.to_string());
                    }
                }
            }
            _ => {}
        }
        Ok(flags)
    }

    fn flags_map(
        &self,
        state: &HelmState,
        releases: &[ReleaseSpec],
        v3: bool,
        op: Op,
    ) -> Result<HashMap<ReleaseId, Vec<String>>> {
        let mut map = HashMap::new();
        for r in releases {
            map.insert(r.id(v3), self.release_flags(state, r, v3, op)?);
        }
        Ok(map)
    }

    fn bail_on_failures(&self, failures: Vec<(&ReleaseId, &str)>) -> Result<()> {
        if failures.is_empty() {
            return Ok(());
        }
        for (id, msg) in &failures {
            error!("{}: {}", id, msg);
        }
        bail!(ErrorKind::ReleaseFailed(failures[0].0.to_string()));
    }

    // ---- commands ----

    /// Register and refresh chart repositories for every reachable state
    pub fn repos(&self) -> Result<()> {
        let v3 = self.engine_v3()?;
        let visitor = self.visitor(false, v3)?;
        let entry = self.entry_file()?;
        visitor.visit(&entry, &mut |visit| {
            let mut contexts: Vec<String> = visit
                .selected
                .iter()
                .map(|r| self.context_for(r))
                .collect();
            if contexts.is_empty() {
                contexts.push(self.default_context());
            }
            contexts.sort();
            contexts.dedup();
            for ctx in contexts {
                self.registry.sync_repos_once(&ctx, &visit.state.repositories)?;
            }
            Ok(())
        })?;
        Ok(())
    }

    /// Update chart dependencies for local charts in every state
    pub fn deps(&self) -> Result<()> {
        let v3 = self.engine_v3()?;
        let visitor = self.visitor(false, v3)?;
        let entry = self.entry_file()?;
        visitor.visit(&entry, &mut |visit| {
            if !self.opts.skip_repos {
                self.registry
                    .sync_repos_once(&self.default_context(), &visit.state.repositories)?;
            }
            let dir = state_dir(&visit.state);
            for release in &visit.selected {
                let chart = dir.join(release.chart_path());
                if self.fs.dir_exists(&chart) {
                    let engine = self.registry.get(&self.context_for(release))?;
                    engine.update_deps(&chart.to_string_lossy())?;
                }
            }
            Ok(())
        })?;
        Ok(())
    }

    /// Diff every selected release; returns whether any changes were seen
    pub fn diff(&self) -> Result<bool> {
        let v3 = self.engine_v3()?;
        let visitor = self.visitor(false, v3)?;
        let entry = self.entry_file()?;
        let mut any_changed = false;

        let total = visitor.visit(&entry, &mut |visit| {
            let mut selected = visit.selected.clone();
            if selected.is_empty() {
                return Ok(());
            }
            self.prepare(&visit, &mut selected)?;
            let all = visit.state.enabled_releases();
            let p = plan(&selected, &all, &self.needs_opts(), v3)
                .chain_err(|| format!("in {}", visit.state.filePath.display()))?;
            let flags = Arc::new(self.flags_map(&visit.state, &selected, v3, Op::Diff)?);

            let registry = self.registry.clone();
            let kube_override = self.opts.kube_context.clone();
            let suppress = self.opts.suppress_secrets;
            let res = run_groups(
                &p,
                self.opts.concurrency,
                FailurePolicy::Aggregate,
                v3,
                &self.cancel,
                move |r| {
                    let ctx = kube_override.clone().unwrap_or_else(|| r.kubeContext.clone());
                    let engine = match registry.get(&ctx) {
                        Ok(e) => e,
                        Err(e) => return Outcome::Fatal(e.to_string()),
                    };
                    let f = flags.get(&r.id(v3)).cloned().unwrap_or_default();
                    match engine.diff_release(&r.name, r.chart_path(), suppress, &f) {
                        Ok(DiffResult::Unchanged) => Outcome::Ok,
                        Ok(DiffResult::Changed) => Outcome::Changed,
                        Err(e) => Outcome::Error(e.to_string()),
                    }
                },
            )?;
            for id in res.changed() {
                self.affected.note_updated(id.clone());
                any_changed = true;
            }
            self.bail_on_failures(res.failures())
        })?;

        self.ensure_matches(total)?;
        self.affected.display();
        Ok(any_changed)
    }

    /// Diff, confirm, then converge each group; deletions last
    pub fn apply(&self) -> Result<bool> {
        let v3 = self.engine_v3()?;
        let visitor = self.visitor(false, v3)?;
        let entry = self.entry_file()?;
        let mut any_changed = false;

        let total = visitor.visit(&entry, &mut |visit| {
            let mut selected = visit.selected.clone();
            if selected.is_empty() {
                return Ok(());
            }
            self.prepare(&visit, &mut selected)?;
            let all = visit.state.enabled_releases();
            let full = plan(&selected, &all, &self.needs_opts(), v3)
                .chain_err(|| format!("in {}", visit.state.filePath.display()))?;
            let upgrades = subset(&full, |r| r.is_installed());

            // group by group: diff first, then converge what changed
            for group in &upgrades.groups {
                let single = Plan {
                    groups: vec![group.clone()],
                };
                let flags = Arc::new(self.flags_map(&visit.state, group, v3, Op::Diff)?);
                let registry = self.registry.clone();
                let kube_override = self.opts.kube_context.clone();
                let suppress = self.opts.suppress_secrets;
                let res = run_groups(
                    &single,
                    self.opts.concurrency,
                    FailurePolicy::Aggregate,
                    v3,
                    &self.cancel,
                    move |r| {
                        let ctx = kube_override.clone().unwrap_or_else(|| r.kubeContext.clone());
                        let engine = match registry.get(&ctx) {
                            Ok(e) => e,
                            Err(e) => return Outcome::Fatal(e.to_string()),
                        };
                        let f = flags.get(&r.id(v3)).cloned().unwrap_or_default();
                        match engine.diff_release(&r.name, r.chart_path(), suppress, &f) {
                            Ok(DiffResult::Unchanged) => Outcome::Ok,
                            Ok(DiffResult::Changed) => Outcome::Changed,
                            Err(e) => Outcome::Error(e.to_string()),
                        }
                    },
                )?;
                self.bail_on_failures(res.failures())?;

                let changed: Vec<ReleaseId> = res.changed().into_iter().cloned().collect();
                if changed.is_empty() {
                    continue;
                }
                any_changed = true;

                if self.opts.interactive && !confirm(&changed)? {
                    bail!("apply aborted by user");
                }

                let to_sync: Vec<ReleaseSpec> = group
                    .iter()
                    .filter(|r| changed.contains(&r.id(v3)))
                    .cloned()
                    .collect();
                self.sync_releases(&visit.state, &to_sync, v3)?;
            }

            self.delete_absent(&visit.state, &full, v3)?;
            Ok(())
        })?;

        self.ensure_matches(total)?;
        self.affected.display();
        Ok(any_changed)
    }

    /// Converge every selected release without a diff gate
    pub fn sync(&self) -> Result<()> {
        let v3 = self.engine_v3()?;
        let visitor = self.visitor(false, v3)?;
        let entry = self.entry_file()?;

        let total = visitor.visit(&entry, &mut |visit| {
            let mut selected = visit.selected.clone();
            if selected.is_empty() {
                return Ok(());
            }
            self.prepare(&visit, &mut selected)?;
            let all = visit.state.enabled_releases();
            let full = plan(&selected, &all, &self.needs_opts(), v3)
                .chain_err(|| format!("in {}", visit.state.filePath.display()))?;

            let upgrades = subset(&full, |r| r.is_installed());
            for group in &upgrades.groups {
                self.sync_releases(&visit.state, group, v3)?;
            }
            self.delete_absent(&visit.state, &full, v3)?;
            Ok(())
        })?;

        self.ensure_matches(total)?;
        self.affected.display();
        Ok(())
    }

    /// Sync one already-planned group
    fn sync_releases(&self, state: &HelmState, group: &[ReleaseSpec], v3: bool) -> Result<()> {
        if group.is_empty() {
            return Ok(());
        }
        let single = Plan {
            groups: vec![group.to_vec()],
        };
        let flags = Arc::new(self.flags_map(state, group, v3, Op::Sync)?);
        let registry = self.registry.clone();
        let kube_override = self.opts.kube_context.clone();
        let affected = self.affected.clone();
        let res = run_groups(
            &single,
            self.opts.concurrency,
            FailurePolicy::HaltOnError,
            v3,
            &self.cancel,
            move |r| {
                let ctx = kube_override.clone().unwrap_or_else(|| r.kubeContext.clone());
                let engine = match registry.get(&ctx) {
                    Ok(e) => e,
                    Err(e) => return Outcome::Fatal(e.to_string()),
                };
                let f = flags.get(&r.id(v3)).cloned().unwrap_or_default();
                match engine.sync_release(&r.name, r.chart_path(), &f) {
                    Ok(()) => {
                        affected.note_updated(r.id(v3));
                        Outcome::Ok
                    }
                    Err(e) => Outcome::Error(e.to_string()),
                }
            },
        )?;
        self.bail_on_failures(res.failures())
    }

    /// Remove releases newly marked `installed: false` that still exist
    fn delete_absent(&self, state: &HelmState, full: &Plan, v3: bool) -> Result<()> {
        let mut candidates = subset(full, |r| !r.is_installed());
        if candidates.is_empty() {
            return Ok(());
        }
        // dependents are deleted before their dependencies
        candidates = candidates.reversed();
        for group in &candidates.groups {
            let live: Vec<ReleaseSpec> = group
                .iter()
                .filter(|r| self.release_exists(r).unwrap_or(false))
                .cloned()
                .collect();
            if live.is_empty() {
                continue;
            }
            self.delete_releases(state, &live, v3, false)?;
        }
        Ok(())
    }

    fn release_exists(&self, release: &ReleaseSpec) -> Result<bool> {
        let engine = self.registry.get(&self.context_for(release))?;
        let filter = format!("^{}$", release.name);
        let mut flags = vec![];
        if !release.namespace.is_empty() && engine.is_v3() {
            flags.push("--namespace".into());
            flags.push(release.namespace.clone());
        }
        let out = engine.list(Some(&filter), &flags)?;
        Ok(out.lines().any(|l| l.trim() == release.name))
    }

    fn delete_releases(
        &self,
        state: &HelmState,
        group: &[ReleaseSpec],
        v3: bool,
        purge: bool,
    ) -> Result<()> {
        let single = Plan {
            groups: vec![group.to_vec()],
        };
        let flags = Arc::new(self.flags_map(state, group, v3, Op::Delete)?);
        let registry = self.registry.clone();
        let kube_override = self.opts.kube_context.clone();
        let affected = self.affected.clone();
        let res = run_groups(
            &single,
            self.opts.concurrency,
            FailurePolicy::HaltOnError,
            v3,
            &self.cancel,
            move |r| {
                let ctx = kube_override.clone().unwrap_or_else(|| r.kubeContext.clone());
                let engine = match registry.get(&ctx) {
                    Ok(e) => e,
                    Err(e) => return Outcome::Fatal(e.to_string()),
                };
                let mut f = flags.get(&r.id(v3)).cloned().unwrap_or_default();
                if purge && !v3 {
                    f.push("--purge".into());
                }
                match engine.delete_release(&r.name, &f) {
                    Ok(()) => {
                        affected.note_deleted(r.id(v3));
                        Outcome::Ok
                    }
                    Err(e) => Outcome::Error(e.to_string()),
                }
            },
        )?;
        self.bail_on_failures(res.failures())
    }

    /// Delete selected releases, dependents before dependencies
    pub fn delete(&self, purge: bool) -> Result<()> {
        let v3 = self.engine_v3()?;
        let visitor = self.visitor(true, v3)?;
        let entry = self.entry_file()?;

        let total = visitor.visit(&entry, &mut |visit| {
            let mut selected = visit.selected.clone();
            if selected.is_empty() {
                return Ok(());
            }
            self.prepare(&visit, &mut selected)?;
            let all = visit.state.enabled_releases();
            let p = plan(&selected, &all, &self.needs_opts(), v3)
                .chain_err(|| format!("in {}", visit.state.filePath.display()))?
                .reversed();
            for group in &p.groups {
                let live: Vec<ReleaseSpec> = group
                    .iter()
                    .filter(|r| self.release_exists(r).unwrap_or(false))
                    .cloned()
                    .collect();
                if live.is_empty() {
                    continue;
                }
                self.delete_releases(&visit.state, &live, v3, purge)?;
            }
            Ok(())
        })?;

        self.ensure_matches(total)?;
        self.affected.display();
        Ok(())
    }

    /// Render every selected release through the engine
    pub fn template(&self, output_dir: Option<&str>, output_dir_template: &str) -> Result<()> {
        let v3 = self.engine_v3()?;
        let visitor = self.visitor(false, v3)?;
        let entry = self.entry_file()?;

        let total = visitor.visit(&entry, &mut |visit| {
            let mut selected = visit.selected.clone();
            if selected.is_empty() {
                return Ok(());
            }
            self.prepare(&visit, &mut selected)?;
            let renderer = Renderer::new(self.fs.clone(), state_dir(&visit.state));
            for release in &selected {
                let engine = self.registry.get(&self.context_for(release))?;
                let mut flags = self.release_flags(&visit.state, release, v3, Op::Template)?;
                if let Some(base) = output_dir {
                    let mut ctx = Context::new();
                    ctx.insert("OutputDir", &base);
                    ctx.insert("Release", &serde_json::json!({ "Name": release.name }));
                    ctx.insert("State", &serde_json::json!({
                        "BaseName": visit.state.filePath.file_stem().map(|s| s.to_string_lossy().to_string()).unwrap_or_default(),
                    }));
                    let dir = renderer.one_off(output_dir_template, &ctx)?;
                    flags.push("--output-dir".into());
                    flags.push(dir);
                }
                let out = engine.template(&release.name, release.chart_path(), &flags)?;
                if output_dir.is_none() {
                    print!("{}", out);
                }
            }
            Ok(())
        })?;

        self.ensure_matches(total)
    }

    /// Run chart tests for every selected release
    pub fn test(&self) -> Result<()> {
        let v3 = self.engine_v3()?;
        let visitor = self.visitor(false, v3)?;
        let entry = self.entry_file()?;

        let total = visitor.visit(&entry, &mut |visit| {
            for release in &visit.selected {
                let engine = self.registry.get(&self.context_for(release))?;
                let flags = self.release_flags(&visit.state, release, v3, Op::Test)?;
                engine
                    .test_release(&release.name, &flags)
                    .chain_err(|| ErrorKind::ReleaseFailed(release.name.clone()))?;
            }
            Ok(())
        })?;
        self.ensure_matches(total)
    }

    /// Lint charts for every selected release
    pub fn lint(&self) -> Result<()> {
        let v3 = self.engine_v3()?;
        let visitor = self.visitor(false, v3)?;
        let entry = self.entry_file()?;

        let total = visitor.visit(&entry, &mut |visit| {
            let mut selected = visit.selected.clone();
            if selected.is_empty() {
                return Ok(());
            }
            self.prepare(&visit, &mut selected)?;
            for release in &selected {
                let engine = self.registry.get(&self.context_for(release))?;
                let flags = self.release_flags(&visit.state, release, v3, Op::Lint)?;
                engine
                    .lint(&release.name, release.chart_path(), &flags)
                    .chain_err(|| ErrorKind::ReleaseFailed(release.name.clone()))?;
            }
            Ok(())
        })?;
        self.ensure_matches(total)
    }

    /// Engine status for every selected release
    pub fn status(&self) -> Result<()> {
        let v3 = self.engine_v3()?;
        let visitor = self.visitor(false, v3)?;
        let entry = self.entry_file()?;

        let total = visitor.visit(&entry, &mut |visit| {
            for release in &visit.selected {
                let engine = self.registry.get(&self.context_for(release))?;
                let flags = self.release_flags(&visit.state, release, v3, Op::Status)?;
                engine.release_status(&release.name, &flags)?;
            }
            Ok(())
        })?;
        self.ensure_matches(total)
    }

    /// Print a table or json array of releases across all states
    pub fn list(&self, json: bool) -> Result<()> {
        let v3 = self.engine_v3()?;
        let visitor = self.visitor(false, v3)?;
        let entry = self.entry_file()?;
        let selector = Selector::parse(&self.opts.selectors)?;

        let mut rows = vec![];
        visitor.visit(&entry, &mut |visit| {
            // disabled releases stay listed, with enabled=false
            for release in selector.filter(&visit.state.releases) {
                rows.push(ListRow {
                    name: release.name.clone(),
                    namespace: release.namespace.clone(),
                    enabled: release._enabled,
                    installed: release.is_installed(),
                    labels: release
                        .labels
                        .iter()
                        .map(|(k, v)| format!("{}:{}", k, v))
                        .collect::<Vec<_>>()
                        .join(","),
                    chart: release.chart.clone(),
                    version: release.version.clone().unwrap_or_default(),
                });
            }
            Ok(())
        })?;

        if json {
            println!("{}", serde_json::to_string(&rows)?);
        } else {
            print_table(&rows);
        }
        Ok(())
    }

    /// Write each release's fully merged values map to disk
    pub fn write_values(&self, output_file_template: &str) -> Result<()> {
        let v3 = self.engine_v3()?;
        let visitor = self.visitor(false, v3)?;
        let entry = self.entry_file()?;

        let total = visitor.visit(&entry, &mut |visit| {
            let dir = state_dir(&visit.state);
            let renderer = Renderer::new(self.fs.clone(), dir.clone());
            for release in &visit.selected {
                let mut merged = Mapping::new();
                for entry in &release.values {
                    match entry {
                        Value::String(rel) => {
                            let path = dir.join(rel);
                            if !self.fs.file_exists(&path) {
                                continue;
                            }
                            let raw = self.fs.read_to_string(&path)?;
                            let body = if rel.ends_with(".gotmpl") {
                                renderer.render(&path.to_string_lossy(), &raw, &visit.state.env)?
                            } else {
                                raw
                            };
                            let parsed: Value = serde_yaml::from_str(&body)
                                .chain_err(|| format!("in {}", path.display()))?;
                            if let Value::Mapping(m) = stringify_keys(parsed) {
                                merge_values(&mut merged, &m);
                            }
                        }
                        Value::Mapping(inline) => {
                            if let Value::Mapping(m) =
                                stringify_keys(Value::Mapping(inline.clone()))
                            {
                                merge_values(&mut merged, &m);
                            }
                        }
                        _ => {}
                    }
                }
                for sv in &release.set {
                    set_dotted(&mut merged, &sv.name, Value::String(sv.value.clone()));
                }

                let mut ctx = Context::new();
                ctx.insert(
                    "Release",
                    &serde_json::json!({ "Name": release.name, "Namespace": release.namespace }),
                );
                let out_path = renderer.one_off(output_file_template, &ctx)?;
                let body = serde_yaml::to_string(&Value::Mapping(merged))?;
                info!("Writing values of {} to {}", release.name, out_path);
                if let Some(parent) = PathBuf::from(&out_path).parent() {
                    if !parent.as_os_str().is_empty() {
                        stdfs::create_dir_all(parent)?;
                    }
                }
                stdfs::write(&out_path, body)?;
            }
            Ok(())
        })?;
        self.ensure_matches(total)
    }
}

/// Filter a plan's groups, dropping the ones left empty
fn subset<F>(p: &Plan, pred: F) -> Plan
where
    F: Fn(&ReleaseSpec) -> bool,
{
    Plan {
        groups: p
            .groups
            .iter()
            .map(|g| g.iter().filter(|r| pred(r)).cloned().collect::<Vec<_>>())
            .filter(|g: &Vec<ReleaseSpec>| !g.is_empty())
            .collect(),
    }
}

fn state_dir(state: &HelmState) -> PathBuf {
    state
        .filePath
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Insert a value at a dotted path, creating intermediate maps
fn set_dotted(map: &mut Mapping, path: &str, value: Value) {
    let mut parts = path.splitn(2, '.');
    let head = parts.next().unwrap_or_default().to_string();
    let key = Value::String(head);
    match parts.next() {
        None => {
            map.insert(key, value);
        }
        Some(rest) => {
            if !matches!(map.get(&key), Some(Value::Mapping(_))) {
                map.insert(key.clone(), Value::Mapping(Mapping::new()));
            }
            if let Some(Value::Mapping(inner)) = map.get_mut(&key) {
                set_dotted(inner, rest, value);
            }
        }
    }
}

/// One apply-gate confirmation for a group of affected releases
fn confirm(changed: &[ReleaseId]) -> Result<bool> {
    println!("Affected releases:");
    for id in changed {
        println!("  {}", id);
    }
    print!("Do you really want to apply? (y/N) ");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    let answer = line.trim().to_lowercase();
    Ok(answer == "y" || answer == "yes")
}

#[derive(Serialize)]
struct ListRow {
    name: String,
    namespace: String,
    enabled: bool,
    installed: bool,
    labels: String,
    chart: String,
    version: String,
}

fn print_table(rows: &[ListRow]) {
    let headers = ["NAME", "NAMESPACE", "ENABLED", "INSTALLED", "LABELS", "CHART", "VERSION"];
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    let cells: Vec<[String; 7]> = rows
        .iter()
        .map(|r| {
            [
                r.name.clone(),
                r.namespace.clone(),
                r.enabled.to_string(),
                r.installed.to_string(),
                r.labels.clone(),
                r.chart.clone(),
                r.version.clone(),
            ]
        })
        .collect();
    for row in &cells {
        for (i, cell) in row.iter().enumerate() {
            widths[i] = widths[i].max(cell.len());
        }
    }
    let fmt_row = |cols: &[String]| {
        cols.iter()
            .enumerate()
            .map(|(i, c)| format!("{:w$}", c, w = widths[i]))
            .collect::<Vec<_>>()
            .join("  ")
            .trim_end()
            .to_string()
    };
    println!("{}", fmt_row(&headers.iter().map(|s| s.to_string()).collect::<Vec<_>>()));
    for row in &cells {
        println!("{}", fmt_row(row));
    }
}
