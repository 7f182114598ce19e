//! Pipewright - Declarative Pipeline Execution Engine
//!
//! Loads a declarative build/deploy manifest, resolves a graph of
//! pluggable tools with dependency ordering and memoized instantiation,
//! and executes ordered conditional stages against a per-run
//! environment. Manifests are data, interpreted with a fixed capability
//! surface; they cannot reach the host process outside the script steps
//! the engine provides.
//!
//! # Architecture
//!
//! The library is organized into four main modules:
//!
//! - [`manifest`]: Manifest documents, expressions, and loading
//! - [`tools`]: Tool traits, the registry, and dependency resolution
//! - [`execution`]: The run driver and the stage scheduler
//! - [`monitoring`]: The structured lifecycle journal
//!
//! # Example
//!
//! ```rust,no_run
//! use pipewright::execution::Engine;
//! use pipewright::tools::Registry;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = Engine::new(Registry::with_builtins());
//!
//!     // One boolean per registered pipeline, in registration order.
//!     let results = engine.execute("workspace-1", "pipeline.yaml").await?;
//!
//!     if results.iter().all(|ok| *ok) {
//!         println!("all pipelines succeeded");
//!     }
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod execution;
pub mod manifest;
pub mod monitoring;
pub mod tools;

// Re-export commonly used types
pub use error::{EngineError, LoadError, StageError, ToolError};
pub use execution::engine::Engine;
pub use manifest::loader::{load_manifest, Manifest};
pub use manifest::model::{PipelineSpec, StageSpec};
pub use monitoring::journal::Journal;
pub use tools::{Registry, Tool, ToolFactory};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "Pipewright";
