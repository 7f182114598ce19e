//! Tool Module
//!
//! Tools are the named capabilities pipelines declare (`tools: [git]`) and
//! stage scripts invoke. Each tool is located through the [`Registry`],
//! constructed by its [`ToolFactory`] after its dependencies, and
//! instantiated at most once per run by the [`ToolCache`].
//!
//! # Structure
//!
//! - [`resolver`]: Run-scoped memoized dependency resolution
//! - [`shell`]: Built-in command runner
//! - [`git`]: Built-in repository introspection

pub mod git;
pub mod resolver;
pub mod shell;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde_json::{Map, Value};

use crate::error::ToolError;

pub use resolver::ToolCache;

/// A realized tool interface. Opaque to the engine; shared by every
/// pipeline that declares the tool.
pub type ToolInstance = Arc<dyn Tool>;

/// The public surface of a resolved tool.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Read-only data visible to manifest expressions under
    /// `tools.<name>`.
    fn properties(&self) -> Value {
        Value::Object(Map::new())
    }

    /// Invokes a named action with rendered arguments.
    async fn invoke(&self, action: &str, args: &Value) -> Result<Value, ToolError>;
}

/// Locates and constructs one kind of tool.
///
/// Factories declare their dependencies by name; the resolver constructs
/// those first and hands them to [`ToolFactory::build`].
#[async_trait]
pub trait ToolFactory: Send + Sync {
    /// Names of tools that must be resolved before this one.
    fn requires(&self) -> Vec<String> {
        Vec::new()
    }

    /// Builds the tool instance from its direct dependencies.
    async fn build(&self, deps: &ToolSet) -> Result<ToolInstance, ToolError>;
}

/// A tool with the empty interface: no properties, no actions.
///
/// What a definition with no behavior resolves to.
#[derive(Debug)]
pub struct NullTool {
    name: String,
}

impl NullTool {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Tool for NullTool {
    async fn invoke(&self, action: &str, _args: &Value) -> Result<Value, ToolError> {
        Err(ToolError::UnknownAction {
            tool: self.name.clone(),
            action: action.to_string(),
        })
    }
}

/// The tools available to one pipeline: its declared tools plus their
/// transitive dependencies, by name.
#[derive(Clone, Default)]
pub struct ToolSet {
    tools: HashMap<String, ToolInstance>,
}

impl ToolSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, instance: ToolInstance) {
        self.tools.insert(name.into(), instance);
    }

    pub fn get(&self, name: &str) -> Option<&ToolInstance> {
        self.tools.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Every tool's expression-visible data, keyed by tool name. This is
    /// what manifests see as `tools`.
    pub fn properties(&self) -> Value {
        let mut map = Map::new();
        for (name, tool) in &self.tools {
            map.insert(name.clone(), tool.properties());
        }
        Value::Object(map)
    }
}

impl fmt::Debug for ToolSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.tools.keys().collect();
        names.sort();
        f.debug_struct("ToolSet").field("tools", &names).finish()
    }
}

/// Built-in tool factories, shared by every registry created with
/// [`Registry::with_builtins`].
static BUILTINS: Lazy<HashMap<&'static str, Arc<dyn ToolFactory>>> = Lazy::new(|| {
    let mut table: HashMap<&'static str, Arc<dyn ToolFactory>> = HashMap::new();
    table.insert("shell", Arc::new(shell::ShellFactory));
    table.insert("git", Arc::new(git::GitFactory));
    table
});

/// Locator consulted when a name matches no registered factory, modeling
/// externally shipped plugin tools addressed by name.
pub type FallbackLocator = dyn Fn(&str) -> Option<Arc<dyn ToolFactory>> + Send + Sync;

/// Maps tool names to factories.
///
/// Lookup order: registered factories (the built-ins, plus anything the
/// embedder registered) first, then the optional fallback locator. A name
/// found in neither is a fatal resolution error for the requesting
/// pipeline.
#[derive(Default)]
pub struct Registry {
    factories: HashMap<String, Arc<dyn ToolFactory>>,
    fallback: Option<Box<FallbackLocator>>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry seeded with the built-in tools.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for (name, factory) in BUILTINS.iter() {
            registry.register(*name, Arc::clone(factory));
        }
        registry
    }

    /// Registers a factory, replacing any previous binding of the name.
    pub fn register(&mut self, name: impl Into<String>, factory: Arc<dyn ToolFactory>) {
        self.factories.insert(name.into(), factory);
    }

    /// Installs the fallback locator for externally named plugin tools.
    pub fn set_fallback<F>(&mut self, locator: F)
    where
        F: Fn(&str) -> Option<Arc<dyn ToolFactory>> + Send + Sync + 'static,
    {
        self.fallback = Some(Box::new(locator));
    }

    /// Locates the factory for a tool name.
    pub fn locate(&self, name: &str) -> Result<Arc<dyn ToolFactory>, ToolError> {
        if let Some(factory) = self.factories.get(name) {
            return Ok(Arc::clone(factory));
        }

        if let Some(fallback) = &self.fallback {
            if let Some(factory) = fallback(name) {
                return Ok(factory);
            }
        }

        Err(ToolError::Unknown(name.to_string()))
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.factories.keys().collect();
        names.sort();
        f.debug_struct("Registry")
            .field("factories", &names)
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}
