//! Run Driver
//!
//! Orchestrates one manifest execution end to end: load the manifest,
//! then for every registered pipeline resolve its declared tools, build
//! its environment, and run its stages. All top-level pipelines of one
//! manifest execute concurrently and their failure domains are isolated:
//! a failing pipeline reduces to `false` in the result sequence without
//! cancelling or affecting its siblings.
//!
//! Only a manifest load failure aborts the whole run.

use std::path::Path;
use std::sync::Arc;

use futures::future::join_all;
use log::{error, info};
use serde_json::{Map, Value};

use crate::error::{EngineError, StageError};
use crate::manifest::expr::{self, Scope};
use crate::manifest::loader::load_manifest;
use crate::manifest::model::PipelineSpec;
use crate::monitoring::journal::{EventKind, Journal, Level};
use crate::tools::{Registry, ToolCache, ToolSet};

/// Pipeline execution engine.
///
/// Holds the tool registry and the run journal; each [`Engine::execute`]
/// call is one independent run with its own tool cache.
///
/// # Example
///
/// ```rust,no_run
/// use pipewright::execution::Engine;
/// use pipewright::tools::Registry;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let engine = Engine::new(Registry::with_builtins());
///     let results = engine.execute("workspace-1", "pipeline.yaml").await?;
///     assert!(results.iter().all(|ok| *ok));
///     Ok(())
/// }
/// ```
pub struct Engine {
    registry: Arc<Registry>,
    journal: Journal,
}

impl Engine {
    /// Creates an engine with a fresh journal.
    pub fn new(registry: Registry) -> Self {
        Self::with_journal(registry, Journal::new())
    }

    /// Creates an engine recording into an existing journal.
    pub fn with_journal(registry: Registry, journal: Journal) -> Self {
        Self {
            registry: Arc::new(registry),
            journal,
        }
    }

    /// The journal this engine records lifecycle events into.
    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    /// Executes the manifest at `path` against a workspace identifier.
    ///
    /// Returns one success boolean per registered pipeline, in
    /// registration order. A load failure is the only error; every other
    /// failure is recovered at the pipeline boundary.
    pub async fn execute(
        &self,
        workspace: &str,
        path: impl AsRef<Path>,
    ) -> Result<Vec<bool>, EngineError> {
        let manifest = load_manifest(path.as_ref(), &self.journal)?;

        // One cache per run, shared by every pipeline of the manifest.
        let cache = ToolCache::new();

        let runs = manifest
            .pipelines
            .iter()
            .map(|spec| self.run_pipeline(workspace, &manifest.exports, spec, &cache));
        let results = join_all(runs).await;

        info!(
            "Manifest '{}' finished: {}/{} pipelines succeeded",
            manifest.path.display(),
            results.iter().filter(|ok| **ok).count(),
            results.len()
        );

        Ok(results)
    }

    async fn run_pipeline(
        &self,
        workspace: &str,
        exports: &Map<String, Value>,
        spec: &PipelineSpec,
        cache: &ToolCache,
    ) -> bool {
        self.journal
            .pipeline(&spec.name, Level::Info, EventKind::Started);

        let (environment, tools) = match self.prepare(workspace, exports, spec, cache).await {
            Ok(prepared) => prepared,
            Err(err) => {
                error!("Pipeline '{}' setup failed: {}", spec.name, err);
                self.journal
                    .pipeline(&spec.name, Level::Error, EventKind::Failed);
                return false;
            }
        };

        super::stage::run_stages(spec, &environment, &tools, exports, &self.journal).await
    }

    /// Resolves the pipeline's declared tools in declaration order and
    /// builds its environment.
    async fn prepare(
        &self,
        workspace: &str,
        exports: &Map<String, Value>,
        spec: &PipelineSpec,
        cache: &ToolCache,
    ) -> Result<(Value, ToolSet), StageError> {
        let mut tools = ToolSet::new();
        for name in &spec.tools {
            cache
                .resolve_into_set(&self.registry, name, &mut tools)
                .await?;
            self.journal.tool_imported(&spec.name, name);
        }

        let mut scope = Scope::new();
        scope.merge(exports);
        scope.set("workspace", Value::String(workspace.to_string()));
        scope.set("tools", tools.properties());

        let mut environment = Map::new();
        for (key, entry) in &spec.environment {
            environment.insert(key.clone(), expr::render(entry, &scope)?);
        }

        self.journal
            .pipeline(&spec.name, Level::Info, EventKind::EnvironmentLoaded);

        Ok((Value::Object(environment), tools))
    }
}
