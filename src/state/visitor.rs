use std::path::{Path, PathBuf};

use serde_yaml::{Mapping, Value};

use super::{HelmState, LoadCtx, Loader, ReleaseSpec, SubHelmfileSpec};
use crate::merge::stringify_keys;
use crate::selector::Selector;
use crate::{Result, ResultExt};

/// One visited state with its selector-filtered releases
pub struct StateVisit {
    pub state: HelmState,
    pub selected: Vec<ReleaseSpec>,
}

/// Walks `helmfiles:` references depth-first, children before parent
///
/// Visitation order is declaration order crossed with sorted glob
/// expansion, reversed when the loader runs in reverse mode.
pub struct Visitor {
    loader: Loader,
}

impl Visitor {
    pub fn new(loader: Loader) -> Self {
        Visitor { loader }
    }

    pub fn loader(&self) -> &Loader {
        &self.loader
    }

    /// Visit every reachable state and return the total selected releases
    pub fn visit<F>(&self, path: &Path, f: &mut F) -> Result<usize>
    where
        F: FnMut(StateVisit) -> Result<()>,
    {
        let cli_selectors = Selector::parse(&self.loader.opts().selectors)?;
        let mut visiting = vec![];
        self.visit_state(
            path,
            &LoadCtx::default(),
            &cli_selectors,
            &cli_selectors,
            &mut visiting,
            f,
        )
    }

    fn visit_state<F>(
        &self,
        path: &Path,
        ctx: &LoadCtx,
        selector: &Selector,
        cli_selectors: &Selector,
        visiting: &mut Vec<PathBuf>,
        f: &mut F,
    ) -> Result<usize>
    where
        F: FnMut(StateVisit) -> Result<()>,
    {
        let abs = self.loader.fs().abs(path)?;
        if visiting.contains(&abs) {
            bail!("circular helmfiles reference involving {}", abs.display());
        }
        visiting.push(abs.clone());

        let state = self
            .loader
            .load(&abs, ctx)
            .chain_err(|| format!("in {}", path.display()))?;
        let dir = abs.parent().map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));

        let mut matched = 0;
        let mut subs = state.sub_helmfiles().chain_err(|| format!("in {}", abs.display()))?;
        if self.loader.opts().reverse {
            subs.reverse();
        }

        for (i, sub) in subs.iter().enumerate() {
            let wrap = |e: crate::Error| -> crate::Error {
                crate::Error::with_chain(e, format!("in {}: in .helmfiles[{}]", abs.display(), i))
            };

            let child_selector = self
                .child_selector(sub, selector, cli_selectors)
                .map_err(wrap)?;
            let child_ctx = LoadCtx {
                inherited: state.env.values.clone(),
                overrides: self.sub_overrides(sub, &dir).map_err(wrap)?,
            };

            let mut paths = self
                .loader
                .fs()
                .glob(&dir.join(&sub.path).to_string_lossy())
                .map_err(wrap)?;
            if paths.is_empty() {
                // a non-glob reference to a missing file is a user error
                return Err(wrap(
                    format!("no matches for path: {}", sub.path).into(),
                ));
            }
            if self.loader.opts().reverse {
                paths.reverse();
            }

            for sub_path in paths {
                matched += self
                    .visit_state(&sub_path, &child_ctx, &child_selector, cli_selectors, visiting, f)
                    .map_err(wrap)?;
            }
        }

        let selected = state.select(selector, self.loader.opts().v3)?;
        matched += selected.len();
        f(StateVisit { state, selected })?;

        visiting.pop();
        Ok(matched)
    }

    /// Selector for a sub-manifest reference
    ///
    /// Legacy mode inherits the CLI selectors when a reference names none;
    /// explicit mode requires `selectorsInherited: true` for any
    /// inheritance.
    fn child_selector(
        &self,
        sub: &SubHelmfileSpec,
        parent: &Selector,
        cli: &Selector,
    ) -> Result<Selector> {
        if sub.selectorsInherited {
            if !sub.selectors.is_empty() {
                bail!("selectorsInherited cannot be combined with explicit selectors");
            }
            return Ok(parent.clone());
        }
        if !sub.selectors.is_empty() {
            return Selector::parse(&sub.selectors);
        }
        if self.loader.opts().explicit_selector_inheritance {
            Ok(Selector::default())
        } else {
            Ok(cli.clone())
        }
    }

    /// Resolve a reference's `values:` into override layers for the child
    fn sub_overrides(&self, sub: &SubHelmfileSpec, dir: &Path) -> Result<Vec<Mapping>> {
        let mut layers = vec![];
        for entry in &sub.values {
            match entry {
                Value::String(rel) => {
                    let file = dir.join(rel);
                    let raw = self.loader.fs().read_to_string(&file)?;
                    let parsed: Value =
                        serde_yaml::from_str(&raw).chain_err(|| format!("in {}", file.display()))?;
                    match stringify_keys(parsed) {
                        Value::Mapping(m) => layers.push(m),
                        Value::Null => {}
                        _ => bail!("{} does not contain a top-level map", file.display()),
                    }
                }
                Value::Mapping(m) => {
                    if let Value::Mapping(fixed) = stringify_keys(Value::Mapping(m.clone())) {
                        layers.push(fixed);
                    }
                }
                Value::Null => {}
                other => bail!("helmfiles values entries must be paths or maps, got {:?}", other),
            }
        }
        Ok(layers)
    }
}

#[cfg(test)]
mod tests {
    use super::super::{LoadOpts, Loader};
    use super::Visitor;
    use crate::fs::MemFs;
    use std::path::Path;
    use std::sync::Arc;

    fn visitor(fs: MemFs, opts: LoadOpts) -> Visitor {
        Visitor::new(Loader::new(Arc::new(fs), opts))
    }

    fn visited_files(v: &Visitor, entry: &str) -> Vec<String> {
        let mut order = vec![];
        v.visit(Path::new(entry), &mut |visit| {
            order.push(visit.state.filePath.to_string_lossy().to_string());
            Ok(())
        })
        .unwrap();
        order
    }

    #[test]
    fn nested_children_before_parent() {
        let fs = MemFs::new()
            .add("/d/helmfile.yaml", "helmfiles: [a.yaml, b.yaml]")
            .add("/d/a.yaml", "helmfiles: [c.yaml]")
            .add("/d/b.yaml", "releases: [{name: b, chart: c/b}]")
            .add("/d/c.yaml", "releases: [{name: c, chart: c/c}]");
        let v = visitor(fs, LoadOpts::default());
        assert_eq!(
            visited_files(&v, "/d/helmfile.yaml"),
            vec!["/d/c.yaml", "/d/a.yaml", "/d/b.yaml", "/d/helmfile.yaml"]
        );
    }

    #[test]
    fn glob_expansion_is_sorted() {
        let fs = MemFs::new()
            .add(
                "/d/helmfile.yaml",
                "helmfiles: ['helmfile.d/a*.yaml', 'helmfile.d/b*.yaml']",
            )
            .add("/d/helmfile.d/b.yaml", "releases: [{name: b, chart: c/b}]")
            .add("/d/helmfile.d/a2.yaml", "releases: [{name: a2, chart: c/a2}]")
            .add("/d/helmfile.d/a1.yaml", "releases: [{name: a1, chart: c/a1}]");
        let v = visitor(fs, LoadOpts::default());
        assert_eq!(
            visited_files(&v, "/d/helmfile.yaml"),
            vec![
                "/d/helmfile.d/a1.yaml",
                "/d/helmfile.d/a2.yaml",
                "/d/helmfile.d/b.yaml",
                "/d/helmfile.yaml"
            ]
        );
    }

    #[test]
    fn missing_reference_is_fatal_with_chain() {
        let fs = MemFs::new().add("/d/helmfile.yaml", "helmfiles: [gone.yaml]");
        let v = visitor(fs, LoadOpts::default());
        let err = v.visit(Path::new("/d/helmfile.yaml"), &mut |_| Ok(())).unwrap_err();
        let chain = format!("{:?}", err);
        assert!(chain.contains("in /d/helmfile.yaml: in .helmfiles[0]"));
        assert!(chain.contains("no matches for path: gone.yaml"));
    }

    #[test]
    fn helmfile_cycles_are_fatal() {
        let fs = MemFs::new()
            .add("/d/a.yaml", "helmfiles: [b.yaml]")
            .add("/d/b.yaml", "helmfiles: [a.yaml]");
        let v = visitor(fs, LoadOpts::default());
        let err = v.visit(Path::new("/d/a.yaml"), &mut |_| Ok(())).unwrap_err();
        assert!(format!("{:?}", err).contains("circular helmfiles reference"));
    }

    #[test]
    fn legacy_mode_inherits_cli_selectors() {
        let fs = MemFs::new()
            .add("/d/helmfile.yaml", "helmfiles: [sub.yaml]")
            .add(
                "/d/sub.yaml",
                r#"
releases:
  - {name: web, chart: c/web, labels: {tier: web}}
  - {name: db, chart: c/db, labels: {tier: data}}
"#,
            );
        let mut opts = LoadOpts::default();
        opts.selectors = vec!["tier=web".into()];
        let v = visitor(fs, opts);
        let mut selected = vec![];
        v.visit(Path::new("/d/helmfile.yaml"), &mut |visit| {
            selected.extend(visit.selected.iter().map(|r| r.name.clone()));
            Ok(())
        })
        .unwrap();
        assert_eq!(selected, vec!["web"]);
    }

    #[test]
    fn explicit_mode_drops_cli_selectors() {
        let fs = MemFs::new()
            .add(
                "/d/helmfile.yaml",
                "helmfiles:\n  - path: sub.yaml\n  - path: inheriting.yaml\n    selectorsInherited: true",
            )
            .add("/d/sub.yaml", "releases: [{name: web, chart: c/web, labels: {tier: web}}, {name: db, chart: c/db}]")
            .add("/d/inheriting.yaml", "releases: [{name: web2, chart: c/web, labels: {tier: web}}, {name: db2, chart: c/db}]");
        let mut opts = LoadOpts::default();
        opts.selectors = vec!["tier=web".into()];
        opts.explicit_selector_inheritance = true;
        let v = visitor(fs, opts);
        let mut selected = vec![];
        v.visit(Path::new("/d/helmfile.yaml"), &mut |visit| {
            selected.extend(visit.selected.iter().map(|r| r.name.clone()));
            Ok(())
        })
        .unwrap();
        // sub.yaml gets no selector at all, inheriting.yaml gets the parent's
        assert_eq!(selected, vec!["web", "db", "web2"]);
    }

    #[test]
    fn reference_values_flow_into_child_env() {
        let fs = MemFs::new()
            .add(
                "/d/helmfile.yaml",
                r#"
environments:
  default:
    values:
      - region: parent-region
helmfiles:
  - path: sub.yaml
    values:
      - tier: override
"#,
            )
            .add(
                "/d/sub.yaml",
                r#"
releases:
  - name: "{{ Environment.Values.region }}-{{ Environment.Values.tier }}"
    chart: c/x
"#,
            );
        let v = visitor(fs, LoadOpts::default());
        let mut names = vec![];
        v.visit(Path::new("/d/helmfile.yaml"), &mut |visit| {
            names.extend(visit.state.releases.iter().map(|r| r.name.clone()));
            Ok(())
        })
        .unwrap();
        assert_eq!(names, vec!["parent-region-override"]);
    }

    #[test]
    fn reverse_flips_visitation() {
        let fs = MemFs::new()
            .add("/d/helmfile.yaml", "helmfiles: [a.yaml, b.yaml]")
            .add("/d/a.yaml", "releases: [{name: a, chart: c/a}]")
            .add("/d/b.yaml", "releases: [{name: b, chart: c/b}]");
        let mut opts = LoadOpts::default();
        opts.reverse = true;
        let v = visitor(fs, opts);
        assert_eq!(
            visited_files(&v, "/d/helmfile.yaml"),
            vec!["/d/b.yaml", "/d/a.yaml", "/d/helmfile.yaml"]
        );
    }
}
