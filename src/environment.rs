use std::path::Path;
use std::sync::Arc;

use serde_yaml::{Mapping, Value};

use super::fs::Filesystem;
use super::merge::{merge_values, stringify_keys};
use super::{ErrorKind, Result, ResultExt};

/// Policy for environment value entries whose glob matches no files
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub enum MissingFileHandler {
    Error,
    Warn,
    Info,
    Debug,
}

impl Default for MissingFileHandler {
    fn default() -> Self {
        MissingFileHandler::Error
    }
}

/// An `environments:` entry as written in a manifest
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct EnvironmentSpec {
    /// File globs or inline maps, merged in order
    pub values: Vec<Value>,
    pub missingFileHandler: Option<MissingFileHandler>,
}

/// The resolved environment a second-pass render sees
#[derive(Clone, Debug, Default)]
pub struct Environment {
    pub name: String,
    pub values: Mapping,
    pub defaults: Mapping,
}

impl Environment {
    pub fn empty(name: &str) -> Self {
        Environment {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Resolve an environment's layered values
///
/// Layer order, increasing precedence: inherited values from the caller,
/// per-env value files (glob-expanded, sorted), per-env inline maps, then
/// each caller override in order (sub-manifest reference values, CLI state
/// value files, CLI sets).
pub fn resolve(
    name: &str,
    spec: Option<&EnvironmentSpec>,
    fs: &Arc<dyn Filesystem>,
    dir: &Path,
    inherited: &Mapping,
    overrides: &[Mapping],
) -> Result<Environment> {
    let mut values = inherited.clone();

    if let Some(spec) = spec {
        let handler = spec.missingFileHandler.unwrap_or_default();
        for entry in &spec.values {
            match entry {
                Value::String(pattern) => {
                    let full = dir.join(pattern);
                    let matched = fs.glob(&full.to_string_lossy())?;
                    if matched.is_empty() {
                        match handler {
                            MissingFileHandler::Error => {
                                bail!(ErrorKind::MissingValuesFile(pattern.clone()))
                            }
                            MissingFileHandler::Warn => {
                                warn!("no file matching \"{}\" found, skipping", pattern)
                            }
                            MissingFileHandler::Info => {
                                info!("no file matching \"{}\" found, skipping", pattern)
                            }
                            MissingFileHandler::Debug => {
                                debug!("no file matching \"{}\" found, skipping", pattern)
                            }
                        }
                        continue;
                    }
                    for file in matched {
                        debug!("merging environment values from {}", file.display());
                        let raw = fs.read_to_string(&file)?;
                        let parsed: Value = serde_yaml::from_str(&raw)
                            .chain_err(|| format!("in {}", file.display()))?;
                        merge_layer(&mut values, parsed, &file.to_string_lossy())?;
                    }
                }
                Value::Mapping(inline) => {
                    if let Value::Mapping(fixed) = stringify_keys(Value::Mapping(inline.clone())) {
                        merge_values(&mut values, &fixed);
                    }
                }
                Value::Null => {}
                other => bail!(
                    "environment \"{}\" has a values entry that is neither a file path nor a map: {:?}",
                    name,
                    other
                ),
            }
        }
    }

    // the pre-override map doubles as the environment's defaults
    let defaults = values.clone();
    for layer in overrides {
        merge_values(&mut values, layer);
    }

    Ok(Environment {
        name: name.into(),
        values,
        defaults,
    })
}

fn merge_layer(values: &mut Mapping, parsed: Value, origin: &str) -> Result<()> {
    match stringify_keys(parsed) {
        Value::Mapping(m) => {
            merge_values(values, &m);
            Ok(())
        }
        Value::Null => Ok(()),
        _ => bail!("{} does not contain a top-level map", origin),
    }
}

#[cfg(test)]
mod tests {
    use super::{resolve, EnvironmentSpec, MissingFileHandler};
    use crate::fs::{Filesystem, MemFs};
    use serde_yaml::Mapping;
    use std::path::Path;
    use std::sync::Arc;

    fn spec(yaml: &str) -> EnvironmentSpec {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn values(yaml: &str) -> Mapping {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn files_merge_in_sorted_glob_order() {
        let fs: Arc<dyn Filesystem> = Arc::new(
            MemFs::new()
                .add("/d/env.2.yaml", "who: second")
                .add("/d/env.1.yaml", "who: first\nkept: yes"),
        );
        let s = spec("values: [env.*.yaml]");
        let env = resolve("default", Some(&s), &fs, Path::new("/d"), &Mapping::new(), &[]).unwrap();
        assert_eq!(env.values, values("who: second\nkept: yes"));
    }

    #[test]
    fn inline_maps_override_files() {
        let fs: Arc<dyn Filesystem> = Arc::new(MemFs::new().add("/d/base.yaml", "tier: file"));
        let s = spec("values:\n  - base.yaml\n  - tier: inline");
        let env = resolve("default", Some(&s), &fs, Path::new("/d"), &Mapping::new(), &[]).unwrap();
        assert_eq!(env.values, values("tier: inline"));
    }

    #[test]
    fn missing_file_is_fatal_by_default() {
        let fs: Arc<dyn Filesystem> = Arc::new(MemFs::new());
        let s = spec("values: [absent.yaml]");
        let err =
            resolve("default", Some(&s), &fs, Path::new("/d"), &Mapping::new(), &[]).unwrap_err();
        assert!(err.to_string().contains("no file matching \"absent.yaml\" found"));
    }

    #[test]
    fn missing_file_handlers_tolerate() {
        let fs: Arc<dyn Filesystem> = Arc::new(MemFs::new());
        for handler in &["Warn", "Info", "Debug"] {
            let s = spec(&format!("values: [absent.yaml]\nmissingFileHandler: {}", handler));
            assert_ne!(s.missingFileHandler, Some(MissingFileHandler::Error));
            let env =
                resolve("default", Some(&s), &fs, Path::new("/d"), &Mapping::new(), &[]).unwrap();
            assert!(env.values.is_empty());
        }
    }

    #[test]
    fn arrays_in_layers_replace() {
        let fs: Arc<dyn Filesystem> = Arc::new(
            MemFs::new()
                .add("/d/one.yaml", "bar: [bar]")
                .add("/d/two.yaml", "bar: [BAR]"),
        );
        let s = spec("values:\n  - foo: [foo]\n  - foo: [FOO]\n  - one.yaml\n  - two.yaml");
        let env = resolve("default", Some(&s), &fs, Path::new("/d"), &Mapping::new(), &[]).unwrap();
        assert_eq!(env.values, values("foo: [FOO]\nbar: [BAR]"));
    }

    #[test]
    fn caller_overrides_win() {
        let fs: Arc<dyn Filesystem> = Arc::new(MemFs::new());
        let s = spec("values:\n  - tier: env");
        let over = values("tier: cli");
        let env =
            resolve("default", Some(&s), &fs, Path::new("/d"), &Mapping::new(), &[over]).unwrap();
        assert_eq!(env.values, values("tier: cli"));
    }

    #[test]
    fn inherited_values_are_lowest_precedence() {
        let fs: Arc<dyn Filesystem> = Arc::new(MemFs::new());
        let s = spec("values:\n  - tier: own");
        let inherited = values("tier: parent\nregion: eu");
        let env = resolve("default", Some(&s), &fs, Path::new("/d"), &inherited, &[]).unwrap();
        assert_eq!(env.values, values("tier: own\nregion: eu"));
    }
}
