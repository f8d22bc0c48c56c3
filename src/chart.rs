use std::path::{Path, PathBuf};

use tempfile::TempDir;
use walkdir::WalkDir;

use super::engine::Engine;
use super::state::ReleaseSpec;
use super::Result;

/// Whether a chart reference needs downloading before the engine can use it
pub fn is_remote(chart: &str) -> bool {
    chart.starts_with("http://") || chart.starts_with("https://") || chart.starts_with("oci://")
}

/// Last path segment of a chart reference, without archive suffix
fn chart_name(chart: &str) -> String {
    let base = chart.trim_end_matches('/').rsplit('/').next().unwrap_or(chart);
    let base = base.trim_end_matches(".tgz").trim_end_matches(".tar.gz");
    // strip a trailing -x.y.z version from archive names
    match base.rfind('-') {
        Some(i) if base[i + 1..].chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false) => {
            base[..i].to_string()
        }
        _ => base.to_string(),
    }
}

/// Downloads URL and OCI charts into a per-run scratch directory
///
/// The directory lives for the duration of the run and is removed on drop.
/// The loader never downloads anything itself; it only records the local
/// path resolved here.
pub struct ChartResolver {
    scratch: TempDir,
}

impl ChartResolver {
    pub fn new() -> Result<Self> {
        let scratch = tempfile::Builder::new().prefix("flotilla-charts").tempdir()?;
        debug!("chart scratch directory at {}", scratch.path().display());
        Ok(ChartResolver { scratch })
    }

    /// Substitute a release's chart with a local copy when it is remote
    pub fn resolve(&self, engine: &dyn Engine, release: &mut ReleaseSpec) -> Result<()> {
        if !is_remote(&release.chart) {
            return Ok(());
        }
        let dest = self.scratch.path().join(&release.name);
        let local: PathBuf = if release.chart.starts_with("oci://") {
            let reference = release.chart.trim_start_matches("oci://");
            engine.chart_pull(reference)?;
            engine.chart_export(reference, &dest)?;
            unpacked_dir(&dest).unwrap_or_else(|| dest.join(chart_name(reference)))
        } else {
            engine.fetch(&release.chart, release.version.as_deref(), &dest)?;
            unpacked_dir(&dest).unwrap_or_else(|| dest.join(chart_name(&release.chart)))
        };
        debug!("resolved {} to {}", release.chart, local.display());
        release._resolved_chart = Some(local.to_string_lossy().into());
        Ok(())
    }
}

/// The single directory the engine unpacked below `dest`
///
/// Archive names do not always match the chart name, so prefer what is
/// actually on disk over a derived name.
fn unpacked_dir(dest: &Path) -> Option<PathBuf> {
    WalkDir::new(dest)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .find(|e| e.file_type().is_dir())
        .map(|e| e.path().to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::{chart_name, is_remote};

    #[test]
    fn remote_detection() {
        assert!(is_remote("https://charts.example.com/app-1.2.3.tgz"));
        assert!(is_remote("oci://ghcr.io/org/app"));
        assert!(!is_remote("stable/app"));
        assert!(!is_remote("./charts/app"));
    }

    #[test]
    fn chart_names() {
        assert_eq!(chart_name("https://charts.example.com/app-1.2.3.tgz"), "app");
        assert_eq!(chart_name("oci://ghcr.io/org/widget"), "widget");
        assert_eq!(chart_name("ghcr.io/org/widget"), "widget");
    }
}
