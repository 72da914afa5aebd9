//! Result file naming and atomic writes

use std::io::Write;
use std::path::{Path, PathBuf};

use serde_json::{json, Map, Value};
use tempfile::NamedTempFile;

use crate::config::OutputConfig;
use crate::error::{BenchError, BenchResult};
use crate::grid::GridPoint;
use crate::scheduler::{InvocationFailure, ResultSet};

/// Derives file names from grid point parameters
///
/// Every active axis value and every run constant appears in the name, each
/// behind its own key, so distinct points never share a file even when runs
/// with different constants write to the same directory.
#[derive(Debug, Clone, Default)]
pub struct OutputNamer {
    prefix: String,
}

impl OutputNamer {
    /// Namer prepending `prefix` to every name
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Name without extension, e.g. `size-16K_dirty-0.5_iter-10_par-16_fanout-16`
    pub fn stem(&self, point: &GridPoint) -> String {
        let mut parts: Vec<String> = point
            .values()
            .iter()
            .map(|(kind, value)| format!("{}-{}", kind.name(), value))
            .collect();
        parts.push(format!("iter-{}", point.iterations()));
        parts.push(format!("par-{}", point.max_parallel()));
        parts.push(format!("fanout-{}", point.fan_out()));
        format!("{}{}", self.prefix, parts.join("_"))
    }

    /// Result file name
    pub fn file_name(&self, point: &GridPoint) -> String {
        format!("{}.json", self.stem(point))
    }

    /// Failure marker name
    pub fn failure_marker_name(&self, point: &GridPoint) -> String {
        format!("{}.failed.json", self.stem(point))
    }

    /// Sweep manifest name
    pub fn manifest_name(&self) -> String {
        format!("{}manifest.json", self.prefix)
    }
}

/// Parameters of `point` as a JSON object
pub fn point_parameters(point: &GridPoint) -> Value {
    let mut params = Map::new();
    for (kind, value) in point.values() {
        params.insert(kind.name().to_string(), json!(value));
    }
    params.insert("iterations".into(), json!(point.iterations()));
    params.insert("max_parallel".into(), json!(point.max_parallel()));
    params.insert("fan_out".into(), json!(point.fan_out()));
    Value::Object(params)
}

/// Writes result sets and failure markers into the output directory
#[derive(Debug, Clone)]
pub struct ResultStore {
    dir: PathBuf,
    namer: OutputNamer,
    failure_markers: bool,
}

impl ResultStore {
    /// Store configured by `output`
    pub fn new(output: &OutputConfig) -> Self {
        Self {
            dir: output.dir.clone(),
            namer: OutputNamer::new(output.prefix.clone()),
            failure_markers: output.failure_markers,
        }
    }

    /// Output directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File naming
    pub fn namer(&self) -> &OutputNamer {
        &self.namer
    }

    /// Where the results of `point` go
    pub fn path_for(&self, point: &GridPoint) -> PathBuf {
        self.dir.join(self.namer.file_name(point))
    }

    /// Where the failure marker of `point` goes
    pub fn failure_path_for(&self, point: &GridPoint) -> PathBuf {
        self.dir.join(self.namer.failure_marker_name(point))
    }

    /// Replace the result file of `point` with `results`
    ///
    /// A stale failure marker from an earlier run is removed. Failing to
    /// remove it only logs a warning, since the results are already in place.
    pub fn write_results(&self, point: &GridPoint, results: &ResultSet) -> BenchResult<PathBuf> {
        let path = self.path_for(point);
        let bytes = results.to_json_bytes()?;
        atomic_write(&path, &bytes).map_err(|e| BenchError::persistence(&path, e))?;

        let marker = self.failure_path_for(point);
        if let Err(e) = remove_if_present(&marker) {
            tracing::warn!(
                path = %marker.display(),
                error = %e,
                "Failed to remove stale failure marker"
            );
        }

        tracing::info!(path = %path.display(), records = results.len(), "Wrote results");
        Ok(path)
    }

    /// Record that `point` failed
    ///
    /// Any result file left by an earlier run is removed so the directory
    /// never shows a success for this point. Returns the marker path when
    /// markers are enabled.
    pub fn write_failure(
        &self,
        point: &GridPoint,
        failures: &[InvocationFailure],
    ) -> BenchResult<Option<PathBuf>> {
        let stale = self.path_for(point);
        remove_if_present(&stale).map_err(|e| BenchError::persistence(&stale, e))?;

        if !self.failure_markers {
            return Ok(None);
        }

        let path = self.failure_path_for(point);
        let marker = json!({
            "status": "failed",
            "parameters": point_parameters(point),
            "failures": failures,
        });
        let mut bytes = serde_json::to_vec_pretty(&marker)?;
        bytes.push(b'\n');
        atomic_write(&path, &bytes).map_err(|e| BenchError::persistence(&path, e))?;

        tracing::info!(path = %path.display(), "Wrote failure marker");
        Ok(Some(path))
    }

    /// Write the sweep manifest
    pub fn write_manifest(&self, manifest: &Value) -> BenchResult<PathBuf> {
        let path = self.dir.join(self.namer.manifest_name());
        let mut bytes = serde_json::to_vec_pretty(manifest)?;
        bytes.push(b'\n');
        atomic_write(&path, &bytes).map_err(|e| BenchError::persistence(&path, e))?;
        Ok(path)
    }
}

/// Write `bytes` to `path` so readers see either the old file or the new one
fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
