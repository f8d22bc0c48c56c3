use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use semver::Version;

use super::state::RepositorySpec;
use super::Result;

mod helm;
pub use self::helm::HelmExec;

/// What a diff run observed (the engine conveys changes via exit code 2)
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum DiffResult {
    Unchanged,
    Changed,
}

/// Contract over the package-management tool
///
/// One engine instance is bound to a `(binary, kube-context)` pair; a run
/// may multiplex several contexts through the registry.
pub trait Engine: Send + Sync {
    fn set_extra_args(&self, args: Vec<String>);

    fn add_repo(&self, repo: &RepositorySpec) -> Result<()>;
    fn update_repos(&self) -> Result<()>;
    fn registry_login(&self, host: &str, username: &str, password: &str) -> Result<()>;

    fn build_deps(&self, name: &str, chart: &str) -> Result<()>;
    fn update_deps(&self, chart: &str) -> Result<()>;
    fn fetch(&self, chart: &str, version: Option<&str>, dest: &Path) -> Result<()>;
    fn chart_pull(&self, chart: &str) -> Result<()>;
    fn chart_export(&self, chart: &str, dest: &Path) -> Result<()>;

    fn template(&self, name: &str, chart: &str, flags: &[String]) -> Result<String>;
    fn lint(&self, name: &str, chart: &str, flags: &[String]) -> Result<()>;

    fn sync_release(&self, name: &str, chart: &str, flags: &[String]) -> Result<()>;
    fn diff_release(
        &self,
        name: &str,
        chart: &str,
        suppress_diff: bool,
        flags: &[String],
    ) -> Result<DiffResult>;
    fn delete_release(&self, name: &str, flags: &[String]) -> Result<()>;
    fn release_status(&self, name: &str, flags: &[String]) -> Result<()>;
    fn test_release(&self, name: &str, flags: &[String]) -> Result<()>;
    fn list(&self, filter: Option<&str>, flags: &[String]) -> Result<String>;
    fn decrypt_secret(&self, path: &str) -> Result<PathBuf>;

    fn get_version(&self) -> Version;
    fn is_version_at_least(&self, minimum: &str) -> bool {
        match Version::parse(minimum) {
            Ok(min) => self.get_version() >= min,
            Err(_) => false,
        }
    }
    fn is_v3(&self) -> bool {
        self.get_version().major >= 3
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct EngineKey {
    binary: String,
    context: String,
}

/// Lazily populated `(binary, kube-context) -> engine` map
///
/// Creation is serialized; repository installation happens exactly once
/// per engine and happens-before any chart operation on it.
pub struct EngineRegistry {
    binary: String,
    engines: Mutex<HashMap<EngineKey, Arc<dyn Engine>>>,
    prepared: Mutex<HashSet<EngineKey>>,
}

impl EngineRegistry {
    pub fn new(binary: &str) -> Self {
        EngineRegistry {
            binary: binary.into(),
            engines: Mutex::new(HashMap::new()),
            prepared: Mutex::new(HashSet::new()),
        }
    }

    fn key(&self, context: &str) -> EngineKey {
        EngineKey {
            binary: self.binary.clone(),
            context: context.into(),
        }
    }

    /// Fetch or create the engine for a kube context
    pub fn get(&self, context: &str) -> Result<Arc<dyn Engine>> {
        let key = self.key(context);
        let mut engines = self.engines.lock().unwrap();
        if let Some(engine) = engines.get(&key) {
            return Ok(engine.clone());
        }
        let context_opt = if context.is_empty() { None } else { Some(context) };
        let engine: Arc<dyn Engine> = Arc::new(HelmExec::new(&self.binary, context_opt)?);
        engines.insert(key, engine.clone());
        Ok(engine)
    }

    /// Install a test double under a context key
    pub fn insert(&self, context: &str, engine: Arc<dyn Engine>) {
        self.engines.lock().unwrap().insert(self.key(context), engine);
    }

    /// Register and refresh repositories, once per engine per run
    pub fn sync_repos_once(&self, context: &str, repos: &[RepositorySpec]) -> Result<()> {
        let key = self.key(context);
        {
            let mut prepared = self.prepared.lock().unwrap();
            if prepared.contains(&key) {
                return Ok(());
            }
            prepared.insert(key);
        }
        if repos.is_empty() {
            return Ok(());
        }
        let engine = self.get(context)?;
        for repo in repos {
            if repo.oci {
                if let (Some(user), Some(pass)) = (&repo.username, &repo.password) {
                    engine.registry_login(&repo.url, user, pass)?;
                }
                continue;
            }
            engine.add_repo(repo)?;
        }
        engine.update_repos()?;
        Ok(())
    }
}
