use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

use glob::Pattern;

use super::{Result, ResultExt};

/// Capability set for everything the loader does against a filesystem
///
/// All state loading flows through this trait so tests can run against
/// `MemFs` without touching disk. Callers pass forward-slash paths;
/// implementations normalize.
pub trait Filesystem: Send + Sync {
    fn read_file(&self, path: &Path) -> Result<Vec<u8>>;
    fn glob(&self, pattern: &str) -> Result<Vec<PathBuf>>;
    fn abs(&self, path: &Path) -> Result<PathBuf>;
    fn getwd(&self) -> Result<PathBuf>;
    fn chdir(&self, path: &Path) -> Result<()>;
    fn file_exists(&self, path: &Path) -> bool;
    fn dir_exists(&self, path: &Path) -> bool;

    fn read_to_string(&self, path: &Path) -> Result<String> {
        let bytes = self.read_file(path)?;
        String::from_utf8(bytes).map_err(|e| format!("{} is not valid utf-8: {}", path.display(), e).into())
    }
}

/// Lexically resolve `.` and `..` components without hitting the filesystem
///
/// `fs::canonicalize` insists that the path exists, which breaks glob
/// patterns and memory-backed tests.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            c => out.push(c.as_os_str()),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

/// The process-backed filesystem used by the binary
#[derive(Default)]
pub struct RealFs {}

impl Filesystem for RealFs {
    fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        Ok(fs::read(path).chain_err(|| format!("failed to read {}", path.display()))?)
    }

    fn glob(&self, pattern: &str) -> Result<Vec<PathBuf>> {
        let mut paths = vec![];
        for entry in glob::glob(pattern)? {
            paths.push(entry?);
        }
        // glob iteration order is platform dependent - results are contractually sorted
        paths.sort();
        Ok(paths)
    }

    fn abs(&self, path: &Path) -> Result<PathBuf> {
        if path.is_absolute() {
            return Ok(normalize(path));
        }
        Ok(normalize(&self.getwd()?.join(path)))
    }

    fn getwd(&self) -> Result<PathBuf> {
        Ok(env::current_dir()?)
    }

    fn chdir(&self, path: &Path) -> Result<()> {
        Ok(env::set_current_dir(path)?)
    }

    fn file_exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn dir_exists(&self, path: &Path) -> bool {
        path.is_dir()
    }
}

/// An in-memory filesystem for hermetic loader tests
///
/// Stores file contents under normalized absolute paths and treats every
/// ancestor of a stored file as an existing directory.
#[derive(Default)]
pub struct MemFs {
    files: Mutex<BTreeMap<PathBuf, Vec<u8>>>,
    cwd: Mutex<PathBuf>,
}

impl MemFs {
    pub fn new() -> Self {
        MemFs {
            files: Mutex::new(BTreeMap::new()),
            cwd: Mutex::new(PathBuf::from("/")),
        }
    }

    pub fn add<P: AsRef<Path>, C: Into<Vec<u8>>>(self, path: P, content: C) -> Self {
        self.files
            .lock()
            .unwrap()
            .insert(normalize(&Path::new("/").join(path.as_ref())), content.into());
        self
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            normalize(path)
        } else {
            normalize(&self.cwd.lock().unwrap().join(path))
        }
    }
}

impl Filesystem for MemFs {
    fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        let full = self.resolve(path);
        match self.files.lock().unwrap().get(&full) {
            Some(data) => Ok(data.clone()),
            None => bail!("failed to read {}: no such file", full.display()),
        }
    }

    fn glob(&self, pattern: &str) -> Result<Vec<PathBuf>> {
        let full = self.resolve(Path::new(pattern));
        let pat = Pattern::new(&full.to_string_lossy())?;
        let mut paths: Vec<PathBuf> = self
            .files
            .lock()
            .unwrap()
            .keys()
            .filter(|p| pat.matches_path(p))
            .cloned()
            .collect();
        paths.sort();
        Ok(paths)
    }

    fn abs(&self, path: &Path) -> Result<PathBuf> {
        Ok(self.resolve(path))
    }

    fn getwd(&self) -> Result<PathBuf> {
        Ok(self.cwd.lock().unwrap().clone())
    }

    fn chdir(&self, path: &Path) -> Result<()> {
        let full = self.resolve(path);
        if !self.dir_exists(&full) {
            bail!("no such directory: {}", full.display());
        }
        *self.cwd.lock().unwrap() = full;
        Ok(())
    }

    fn file_exists(&self, path: &Path) -> bool {
        let full = self.resolve(path);
        self.files.lock().unwrap().contains_key(&full)
    }

    fn dir_exists(&self, path: &Path) -> bool {
        let full = self.resolve(path);
        if full == Path::new("/") {
            return true;
        }
        self.files
            .lock()
            .unwrap()
            .keys()
            .any(|p| p.ancestors().skip(1).any(|a| a == full))
    }
}

#[cfg(test)]
mod tests {
    use super::{Filesystem, MemFs, normalize};
    use std::path::{Path, PathBuf};

    #[test]
    fn normalize_resolves_dots() {
        assert_eq!(normalize(Path::new("/a/b/../c/./d")), PathBuf::from("/a/c/d"));
        assert_eq!(normalize(Path::new("./x")), PathBuf::from("x"));
        assert_eq!(normalize(Path::new(".")), PathBuf::from("."));
    }

    #[test]
    fn memfs_read_and_exists() {
        let fs = MemFs::new().add("/deploy/helmfile.yaml", "releases: []");
        assert!(fs.file_exists(Path::new("/deploy/helmfile.yaml")));
        assert!(fs.dir_exists(Path::new("/deploy")));
        assert!(!fs.file_exists(Path::new("/deploy/other.yaml")));
        let data = fs.read_to_string(Path::new("/deploy/helmfile.yaml")).unwrap();
        assert_eq!(data, "releases: []");
    }

    #[test]
    fn memfs_glob_is_sorted() {
        let fs = MemFs::new()
            .add("/d/b.yaml", "")
            .add("/d/a2.yaml", "")
            .add("/d/a1.yaml", "");
        let matched = fs.glob("/d/a*.yaml").unwrap();
        assert_eq!(matched, vec![PathBuf::from("/d/a1.yaml"), PathBuf::from("/d/a2.yaml")]);
    }

    #[test]
    fn memfs_chdir_relative_reads() {
        let fs = MemFs::new().add("/deploy/env/values.yaml", "foo: 1");
        fs.chdir(Path::new("/deploy")).unwrap();
        assert!(fs.file_exists(Path::new("env/values.yaml")));
        assert_eq!(fs.getwd().unwrap(), PathBuf::from("/deploy"));
        assert!(fs.chdir(Path::new("/nonexistent")).is_err());
    }
}
