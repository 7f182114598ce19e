//! Manifest Loader
//!
//! Loads a manifest document from disk, interprets it with the fixed
//! capability surface, and collects the pipeline specifications it
//! registers. `include` references are resolved recursively: the nested
//! manifest's pipelines are merged into the including manifest and its
//! exports become visible to the including document's expressions and
//! `use:` references.
//!
//! Each call is independent — repeated includes of the same path
//! re-evaluate the file. There is no load-level memoization.

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, error, info};
use serde_json::{Map, Value};

use crate::error::LoadError;
use crate::monitoring::journal::{EventKind, Journal};

use super::model::{ManifestDoc, PipelineSpec};

/// A loaded manifest: the pipeline specifications it registered and the
/// exports it (and its includes) made reusable. Immutable once loading
/// completes.
#[derive(Debug, Clone)]
pub struct Manifest {
    pub path: PathBuf,
    pub pipelines: Vec<PipelineSpec>,
    pub exports: Map<String, Value>,
}

/// Loads the manifest at `path`.
///
/// Emits `event=requested` on entry and `event=loading-failed` if the
/// file cannot be read or interpreted. A failure inside an `include` is
/// fatal to the including manifest as well, so a broken nested manifest
/// produces one `loading-failed` line per manifest on the include chain.
pub fn load_manifest(path: &Path, journal: &Journal) -> Result<Manifest, LoadError> {
    load_recursive(path, journal, &mut Vec::new())
}

fn load_recursive(
    path: &Path,
    journal: &Journal,
    chain: &mut Vec<PathBuf>,
) -> Result<Manifest, LoadError> {
    let display = path.display().to_string();
    journal.manifest(&display, EventKind::Requested);

    match load_document(path, journal, chain) {
        Ok(manifest) => {
            info!(
                "Loaded manifest '{}': {} pipelines, {} exports",
                display,
                manifest.pipelines.len(),
                manifest.exports.len()
            );
            Ok(manifest)
        }
        Err(err) => {
            journal.manifest(&display, EventKind::LoadingFailed);
            error!("{}", err);
            Err(err)
        }
    }
}

fn load_document(
    path: &Path,
    journal: &Journal,
    chain: &mut Vec<PathBuf>,
) -> Result<Manifest, LoadError> {
    let text = fs::read_to_string(path).map_err(|source| LoadError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    // Re-evaluation of repeated includes is intentional; re-entering a
    // manifest that is still loading is not.
    let identity = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    if chain.contains(&identity) {
        return Err(LoadError::IncludeCycle {
            path: path.to_path_buf(),
        });
    }
    chain.push(identity);

    debug!("Manifest '{}' read ({} bytes)", path.display(), text.len());

    let doc: ManifestDoc = serde_yaml::from_str(&text).map_err(|source| LoadError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    let mut pipelines = Vec::new();
    let mut exports = Map::new();

    for include in &doc.include {
        let include_path = resolve_include(path, include);
        let nested =
            load_recursive(&include_path, journal, chain).map_err(|source| LoadError::Include {
                path: include_path.clone(),
                source: Box::new(source),
            })?;

        pipelines.extend(nested.pipelines);
        for (name, value) in nested.exports {
            exports.insert(name, value);
        }
    }

    // Local exports shadow anything an include provided.
    for (name, value) in &doc.exports {
        exports.insert(name.clone(), value.clone());
    }

    for pipeline in doc.pipelines {
        pipelines.push(PipelineSpec::from_doc(pipeline, &exports)?);
    }

    chain.pop();

    Ok(Manifest {
        path: path.to_path_buf(),
        pipelines,
        exports,
    })
}

/// Relative include paths resolve against the including manifest's
/// directory, so a manifest tree loads the same from any working
/// directory. Absolute paths are taken as-is.
fn resolve_include(from: &Path, include: &str) -> PathBuf {
    let target = Path::new(include);
    if target.is_absolute() {
        return target.to_path_buf();
    }

    match from.parent() {
        Some(base) => base.join(target),
        None => target.to_path_buf(),
    }
}
