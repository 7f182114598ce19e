//! Tool Resolver
//!
//! Run-scoped, memoized tool instantiation. Resolution is depth-first
//! pre-order over each factory's `requires` list, so a tool's
//! dependencies are always constructed before the tool itself.
//!
//! Two guarantees beyond plain memoization:
//!
//! - Concurrent pipelines requesting the same not-yet-resolved tool await
//!   one in-flight construction instead of racing a check-then-set; each
//!   cache slot is an async once-cell, not a bare presence check.
//! - A name re-entered while already on the active resolution path is a
//!   cycle error naming the full chain, rather than unbounded recursion.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use log::debug;
use tokio::sync::OnceCell;

use crate::error::ToolError;

use super::{Registry, ToolInstance, ToolSet};

/// The run-scoped tool cache.
///
/// Its lifetime equals one run-driver invocation: every pipeline of a
/// manifest shares the same cache, so at most one instance of a tool is
/// constructed per run no matter how many pipelines or dependents
/// request it.
#[derive(Default)]
pub struct ToolCache {
    slots: Mutex<HashMap<String, Arc<OnceCell<ToolInstance>>>>,
}

impl std::fmt::Debug for ToolCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = match self.slots.lock() {
            Ok(slots) => slots.keys().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().keys().cloned().collect(),
        };
        names.sort();
        f.debug_struct("ToolCache").field("slots", &names).finish()
    }
}

impl ToolCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves a single tool, constructing it and any of its transitive
    /// dependencies that are not already cached.
    pub async fn resolve(
        &self,
        registry: &Registry,
        name: &str,
    ) -> Result<ToolInstance, ToolError> {
        let mut collected = ToolSet::new();
        self.resolve_into(registry, name, &mut Vec::new(), &mut collected)
            .await
    }

    /// Resolves each declared name in order and returns the requesting
    /// pipeline's tool set: the declared tools plus every transitive
    /// dependency touched while resolving them.
    pub async fn resolve_set(
        &self,
        registry: &Registry,
        names: &[String],
    ) -> Result<ToolSet, ToolError> {
        let mut set = ToolSet::new();
        for name in names {
            self.resolve_into_set(registry, name, &mut set).await?;
        }
        Ok(set)
    }

    /// Resolves one name, collecting it and its transitive dependencies
    /// into an existing set.
    pub async fn resolve_into_set(
        &self,
        registry: &Registry,
        name: &str,
        set: &mut ToolSet,
    ) -> Result<ToolInstance, ToolError> {
        self.resolve_into(registry, name, &mut Vec::new(), set).await
    }

    fn resolve_into<'a>(
        &'a self,
        registry: &'a Registry,
        name: &'a str,
        path: &'a mut Vec<String>,
        collected: &'a mut ToolSet,
    ) -> BoxFuture<'a, Result<ToolInstance, ToolError>> {
        Box::pin(async move {
            if path.iter().any(|entry| entry == name) {
                let mut chain = path.join(" -> ");
                chain.push_str(" -> ");
                chain.push_str(name);
                return Err(ToolError::CyclicDependency { chain });
            }

            let factory = registry.locate(name)?;

            // The dependency walk runs even on a cache hit so that this
            // request's tool set picks up the transitive dependencies.
            path.push(name.to_string());
            let mut deps = ToolSet::new();
            for dep in factory.requires() {
                let result = self.resolve_into(registry, &dep, path, collected).await;
                match result {
                    Ok(instance) => deps.insert(dep, instance),
                    Err(err) => {
                        path.pop();
                        return Err(err);
                    }
                }
            }
            path.pop();

            let cell = {
                let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
                Arc::clone(slots.entry(name.to_string()).or_default())
            };

            let instance = cell
                .get_or_try_init(|| async {
                    debug!("Constructing tool '{}'", name);
                    factory.build(&deps).await
                })
                .await?
                .clone();

            collected.insert(name, Arc::clone(&instance));
            Ok(instance)
        })
    }
}
