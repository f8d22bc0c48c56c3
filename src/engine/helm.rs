use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;

use regex::Regex;
use semver::Version;

use super::{DiffResult, Engine};
use crate::state::RepositorySpec;
use crate::{ErrorKind, Result, ResultExt};

/// The process-backed helm engine
///
/// All calls shell out to the configured binary with the bound kube
/// context. `set_extra_args` is guarded but not safe across concurrent
/// commands against the same instance.
pub struct HelmExec {
    binary: String,
    kube_context: Option<String>,
    version: Version,
    extra_args: Mutex<Vec<String>>,
}

impl HelmExec {
    /// Create an engine and probe the binary version once
    pub fn new(binary: &str, kube_context: Option<&str>) -> Result<HelmExec> {
        let version = probe_version(binary)?;
        debug!("{} is version {}", binary, version);
        Ok(HelmExec {
            binary: binary.into(),
            kube_context: kube_context.map(String::from),
            version,
            extra_args: Mutex::new(vec![]),
        })
    }

    /// Construct with a known version, for offline use
    pub fn with_version(binary: &str, kube_context: Option<&str>, version: Version) -> HelmExec {
        HelmExec {
            binary: binary.into(),
            kube_context: kube_context.map(String::from),
            version,
            extra_args: Mutex::new(vec![]),
        }
    }

    fn args(&self, cmd: Vec<String>) -> Vec<String> {
        let mut full = vec![];
        if let Some(ref ctx) = self.kube_context {
            full.push("--kube-context".into());
            full.push(ctx.clone());
        }
        full.extend(cmd);
        full.extend(self.extra_args.lock().unwrap().iter().cloned());
        full
    }

    /// Run to completion inheriting stdio
    fn hexec(&self, cmd: Vec<String>) -> Result<()> {
        let args = self.args(cmd);
        debug!("{} {}", self.binary, args.join(" "));
        let s = Command::new(&self.binary).args(&args).status()?;
        if !s.success() {
            bail!(ErrorKind::EngineFailure(
                format!("{} {}", self.binary, args.join(" ")),
                s.code().unwrap_or(1001)
            ));
        }
        Ok(())
    }

    /// Run capturing output, returning `(stdout, stderr, exit code)`
    fn hout(&self, cmd: Vec<String>) -> Result<(String, String, i32)> {
        let args = self.args(cmd);
        debug!("{} {}", self.binary, args.join(" "));
        let out = Command::new(&self.binary).args(&args).output()?;
        let stdout: String = String::from_utf8_lossy(&out.stdout).into();
        let stderr: String = String::from_utf8_lossy(&out.stderr).into();
        Ok((stdout, stderr, out.status.code().unwrap_or(1001)))
    }
}

fn probe_version(binary: &str) -> Result<Version> {
    // v2 needs --client to avoid contacting tiller, v3 rejects the flag
    for args in &[
        vec!["version", "--client", "--short"],
        vec!["version", "--short"],
    ] {
        let out = Command::new(binary)
            .args(args)
            .output()
            .chain_err(|| format!("failed to invoke {}", binary))?;
        if out.status.success() {
            let text: String = String::from_utf8_lossy(&out.stdout).into();
            return parse_version(&text);
        }
    }
    bail!("could not determine version of {}", binary)
}

/// Parse `v3.2.4+g0ad800e` or `Client: v2.16.1+ge13bc94` style output
fn parse_version(text: &str) -> Result<Version> {
    let re = Regex::new(r"v?(\d+\.\d+\.\d+)").unwrap();
    let caps = match re.captures(text) {
        Some(c) => c,
        None => bail!("could not parse engine version from {:?}", text),
    };
    Ok(Version::parse(&caps[1])?)
}

impl Engine for HelmExec {
    fn set_extra_args(&self, args: Vec<String>) {
        *self.extra_args.lock().unwrap() = args;
    }

    fn add_repo(&self, repo: &RepositorySpec) -> Result<()> {
        info!("Adding repo {} {}", repo.name, repo.url);
        let mut cmd = vec!["repo".into(), "add".into(), repo.name.clone(), repo.url.clone()];
        if let Some(ref cert) = repo.certFile {
            cmd.push("--cert-file".into());
            cmd.push(cert.clone());
        }
        if let Some(ref key) = repo.keyFile {
            cmd.push("--key-file".into());
            cmd.push(key.clone());
        }
        if let Some(ref ca) = repo.caFile {
            cmd.push("--ca-file".into());
            cmd.push(ca.clone());
        }
        if let Some(ref user) = repo.username {
            cmd.push("--username".into());
            cmd.push(user.clone());
        }
        if let Some(ref pass) = repo.password {
            cmd.push("--password".into());
            cmd.push(pass.clone());
        }
        if repo.passCredentials {
            cmd.push("--pass-credentials".into());
        }
        self.hexec(cmd)
    }

    fn update_repos(&self) -> Result<()> {
        info!("Updating repos");
        self.hexec(vec!["repo".into(), "update".into()])
    }

    fn registry_login(&self, host: &str, username: &str, password: &str) -> Result<()> {
        info!("Logging in to registry {}", host);
        self.hexec(vec![
            "registry".into(),
            "login".into(),
            host.into(),
            "--username".into(),
            username.into(),
            "--password".into(),
            password.into(),
        ])
    }

    fn build_deps(&self, name: &str, chart: &str) -> Result<()> {
        info!("Building dependencies for {}", name);
        self.hexec(vec!["dependency".into(), "build".into(), chart.into()])
    }

    fn update_deps(&self, chart: &str) -> Result<()> {
        info!("Updating dependencies in {}", chart);
        self.hexec(vec!["dependency".into(), "update".into(), chart.into()])
    }

    fn fetch(&self, chart: &str, version: Option<&str>, dest: &Path) -> Result<()> {
        info!("Fetching {}", chart);
        let mut cmd = vec![
            "fetch".into(),
            chart.into(),
            "--untar".into(),
            "--untardir".into(),
            dest.to_string_lossy().into(),
        ];
        if let Some(v) = version {
            cmd.push("--version".into());
            cmd.push(v.into());
        }
        self.hexec(cmd)
    }

    fn chart_pull(&self, chart: &str) -> Result<()> {
        info!("Pulling {}", chart);
        self.hexec(vec!["chart".into(), "pull".into(), chart.into()])
    }

    fn chart_export(&self, chart: &str, dest: &Path) -> Result<()> {
        info!("Exporting {}", chart);
        self.hexec(vec![
            "chart".into(),
            "export".into(),
            chart.into(),
            "--destination".into(),
            dest.to_string_lossy().into(),
        ])
    }

    fn template(&self, name: &str, chart: &str, flags: &[String]) -> Result<String> {
        let mut cmd = if self.is_v3() {
            vec!["template".into(), name.into(), chart.into()]
        } else {
            vec!["template".into(), chart.into(), "--name".into(), name.into()]
        };
        cmd.extend(flags.iter().cloned());
        let (stdout, stderr, code) = self.hout(cmd)?;
        if code != 0 {
            warn!("template {} stderr: {}", name, stderr);
            bail!(ErrorKind::EngineFailure(format!("{} template {}", self.binary, name), code));
        }
        Ok(stdout)
    }

    fn lint(&self, name: &str, chart: &str, flags: &[String]) -> Result<()> {
        info!("Linting {}", name);
        let mut cmd = vec!["lint".into(), chart.into()];
        cmd.extend(flags.iter().cloned());
        self.hexec(cmd)
    }

    fn sync_release(&self, name: &str, chart: &str, flags: &[String]) -> Result<()> {
        info!("Upgrading {} with chart {}", name, chart);
        let mut cmd = vec![
            "upgrade".into(),
            "--install".into(),
            name.into(),
            chart.into(),
        ];
        cmd.extend(flags.iter().cloned());
        self.hexec(cmd)
    }

    fn diff_release(
        &self,
        name: &str,
        chart: &str,
        suppress_diff: bool,
        flags: &[String],
    ) -> Result<DiffResult> {
        debug!("Diffing {} against chart {}", name, chart);
        let mut cmd = vec![
            "diff".into(),
            "upgrade".into(),
            "--reset-values".into(),
            "--allow-unreleased".into(),
            "--detailed-exitcode".into(),
            name.into(),
            chart.into(),
        ];
        if suppress_diff {
            cmd.push("--suppress-secrets".into());
        }
        cmd.extend(flags.iter().cloned());
        let (stdout, stderr, code) = self.hout(cmd)?;
        match code {
            0 => {
                info!("{} is up to date", name);
                Ok(DiffResult::Unchanged)
            }
            // the sentinel: 2 means live state differs from desired
            2 => {
                print!("{}", stdout);
                Ok(DiffResult::Changed)
            }
            other => {
                warn!("diff {} stderr: {}", name, stderr);
                bail!(ErrorKind::EngineFailure(format!("{} diff upgrade {}", self.binary, name), other))
            }
        }
    }

    fn delete_release(&self, name: &str, flags: &[String]) -> Result<()> {
        info!("Deleting {}", name);
        let mut cmd = if self.is_v3() {
            vec!["uninstall".into(), name.into()]
        } else {
            vec!["delete".into(), name.into()]
        };
        cmd.extend(flags.iter().cloned());
        self.hexec(cmd)
    }

    fn release_status(&self, name: &str, flags: &[String]) -> Result<()> {
        let mut cmd = vec!["status".into(), name.into()];
        cmd.extend(flags.iter().cloned());
        self.hexec(cmd)
    }

    fn test_release(&self, name: &str, flags: &[String]) -> Result<()> {
        info!("Testing {}", name);
        let mut cmd = vec!["test".into(), name.into()];
        cmd.extend(flags.iter().cloned());
        self.hexec(cmd)
    }

    fn list(&self, filter: Option<&str>, flags: &[String]) -> Result<String> {
        let mut cmd = vec!["list".into(), "-q".into()];
        if let Some(f) = filter {
            if self.is_v3() {
                cmd.push("--filter".into());
                cmd.push(f.into());
            } else {
                cmd.push(f.into());
            }
        }
        cmd.extend(flags.iter().cloned());
        let (stdout, stderr, code) = self.hout(cmd)?;
        if code != 0 {
            warn!("list stderr: {}", stderr);
            bail!(ErrorKind::EngineFailure(format!("{} list", self.binary), code));
        }
        Ok(stdout)
    }

    fn decrypt_secret(&self, path: &str) -> Result<PathBuf> {
        info!("Decrypting {}", path);
        self.hexec(vec!["secrets".into(), "dec".into(), path.into()])?;
        // the secrets plugin writes alongside the source
        Ok(PathBuf::from(format!("{}.dec", path)))
    }

    fn get_version(&self) -> Version {
        self.version.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::parse_version;

    #[test]
    fn version_parsing() {
        assert_eq!(parse_version("v3.2.4+g0ad800e").unwrap().major, 3);
        assert_eq!(parse_version("Client: v2.16.1+ge13bc94").unwrap().major, 2);
        assert_eq!(parse_version("3.0.0").unwrap().major, 3);
        assert!(parse_version("whatever").is_err());
    }
}
