//! Manifest Data Model
//!
//! Core data structures for manifest documents and the validated pipeline
//! specifications registered from them.
//!
//! # Example YAML Format
//!
//! ```yaml
//! pipelines:
//!   - name: build-and-publish
//!     tools: [git, shell]
//!     environment:
//!       release: "{{ tools.git.branch == 'main' }}"
//!       tag: "app:{{ tools.git.commit.abbrev }}"
//!     stages:
//!       - name: build
//!         script:
//!           - tool: shell
//!             action: run
//!             args: { command: "make build" }
//!       - name: publish
//!         when: "env.release"
//!         script:
//!           - tool: shell
//!             action: run
//!             args: { command: "make publish TAG={{ env.tag }}" }
//! ```
//!
//! A raw document (`ManifestDoc`) may omit almost everything; registration
//! resolves every optional field to its documented default so downstream
//! components never see an unset field.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::LoadError;

use super::expr::Expr;

/// Placeholder for unnamed pipelines and stages.
pub const NO_NAME: &str = "no-name";

/// Raw manifest document as parsed from YAML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManifestDoc {
    /// Paths of nested manifests to load and merge
    #[serde(default)]
    pub include: Vec<String>,

    /// Values and stage templates this manifest makes reusable
    #[serde(default)]
    pub exports: Map<String, Value>,

    /// Pipeline specifications registered by this manifest
    #[serde(default)]
    pub pipelines: Vec<PipelineDoc>,
}

/// Raw pipeline entry of a manifest document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDoc {
    #[serde(default)]
    pub name: Option<String>,

    /// Tool names this pipeline requires, in declaration order
    #[serde(default)]
    pub tools: Vec<String>,

    /// Opaque mapping passed through unused by the engine
    #[serde(default = "empty_object")]
    pub definitions: Value,

    /// Environment entries, rendered once per run against the workspace
    /// and resolved tool set
    #[serde(default)]
    pub environment: Map<String, Value>,

    #[serde(default)]
    pub stages: Vec<StageDoc>,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

/// Raw stage entry of a pipeline.
///
/// A stage either declares `when`/`script` inline or references an exported
/// stage template via `use`; inline fields override the template's.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDoc {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default, rename = "use")]
    pub template: Option<String>,

    #[serde(default)]
    pub when: Option<String>,

    #[serde(default)]
    pub script: Option<Vec<ScriptStep>>,
}

/// One interpreter step of a stage script.
///
/// These are the only capabilities manifest code can invoke; there is no
/// step kind that reaches the host process in any other way.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScriptStep {
    /// Invoke an action on a resolved tool instance.
    Invoke {
        tool: String,
        action: String,
        #[serde(default)]
        args: Value,
        /// Bind the result into the stage-local scope
        #[serde(default)]
        register: Option<String>,
    },

    /// Suspend for the given number of milliseconds.
    Sleep { sleep: u64 },

    /// Read a file as text.
    ReadFile {
        read_file: String,
        #[serde(default)]
        register: Option<String>,
    },

    /// Write text to a file.
    WriteFile { write_file: String, contents: Value },

    /// Apply a step sequence to every item concurrently; wait for all,
    /// surface the first failure in item order.
    Parallel { parallel: MapBlock },

    /// Apply a step sequence to each item in order, short-circuiting on
    /// the first failure.
    Sequential { sequential: MapBlock },
}

/// Body of a `parallel` or `sequential` combinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapBlock {
    /// Expression yielding the sequence to map over
    pub items: String,

    /// Steps applied per item, with the element bound as `item`
    #[serde(default)]
    pub steps: Vec<ScriptStep>,
}

/// A fully validated pipeline specification.
///
/// Invariant: every optional field of the document form is resolved here;
/// no component downstream of registration handles a missing field.
#[derive(Debug, Clone)]
pub struct PipelineSpec {
    pub name: String,
    pub tools: Vec<String>,
    pub definitions: Value,
    pub environment: Map<String, Value>,
    pub stages: Vec<StageSpec>,
}

/// A fully validated stage specification.
#[derive(Debug, Clone)]
pub struct StageSpec {
    pub name: String,
    pub when: Expr,
    pub script: Vec<ScriptStep>,
}

/// Template shape accepted for exported stage templates.
#[derive(Debug, Clone, Deserialize)]
struct StageTemplate {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    when: Option<String>,
    #[serde(default)]
    script: Option<Vec<ScriptStep>>,
}

impl PipelineSpec {
    /// Validates a raw pipeline entry, applying field defaults and
    /// resolving `use:` references against the export scope.
    pub fn from_doc(doc: PipelineDoc, templates: &Map<String, Value>) -> Result<Self, LoadError> {
        let name = doc.name.unwrap_or_else(|| NO_NAME.to_string());

        let mut stages = Vec::with_capacity(doc.stages.len());
        for stage in doc.stages {
            stages.push(StageSpec::from_doc(stage, &name, templates)?);
        }

        let mut seen = std::collections::HashSet::new();
        for stage in &stages {
            if !seen.insert(stage.name.clone()) {
                return Err(LoadError::DuplicateStage {
                    pipeline: name.clone(),
                    stage: stage.name.clone(),
                });
            }
        }

        Ok(Self {
            name,
            tools: doc.tools,
            definitions: doc.definitions,
            environment: doc.environment,
            stages,
        })
    }
}

impl StageSpec {
    fn from_doc(
        doc: StageDoc,
        pipeline: &str,
        templates: &Map<String, Value>,
    ) -> Result<Self, LoadError> {
        let template = match &doc.template {
            Some(reference) => {
                let value =
                    templates
                        .get(reference)
                        .ok_or_else(|| LoadError::UnknownTemplate {
                            pipeline: pipeline.to_string(),
                            template: reference.clone(),
                        })?;
                let parsed: StageTemplate = serde_json::from_value(value.clone()).map_err(|_| {
                    LoadError::BadTemplate {
                        pipeline: pipeline.to_string(),
                        template: reference.clone(),
                    }
                })?;
                Some(parsed)
            }
            None => None,
        };

        let (template_name, template_when, template_script) = match template {
            Some(t) => (t.name, t.when, t.script),
            None => (None, None, None),
        };

        let name = doc
            .name
            .or(template_name)
            .unwrap_or_else(|| NO_NAME.to_string());

        let when = match doc.when.or(template_when) {
            Some(source) => Expr::parse(&source).map_err(|source| LoadError::BadPredicate {
                pipeline: pipeline.to_string(),
                stage: name.clone(),
                source,
            })?,
            None => Expr::always_true(),
        };

        let script = doc.script.or(template_script).unwrap_or_default();
        validate_steps(&script, pipeline, &name)?;

        Ok(Self { name, when, script })
    }
}

/// Checks every expression a script will evaluate at run time, so that
/// syntax errors surface as load failures rather than stage failures.
fn validate_steps(steps: &[ScriptStep], pipeline: &str, stage: &str) -> Result<(), LoadError> {
    for step in steps {
        match step {
            ScriptStep::Parallel { parallel: block }
            | ScriptStep::Sequential { sequential: block } => {
                Expr::parse(&block.items).map_err(|source| LoadError::BadScript {
                    pipeline: pipeline.to_string(),
                    stage: stage.to_string(),
                    source,
                })?;
                validate_steps(&block.steps, pipeline, stage)?;
            }
            ScriptStep::Invoke { .. }
            | ScriptStep::Sleep { .. }
            | ScriptStep::ReadFile { .. }
            | ScriptStep::WriteFile { .. } => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn no_templates() -> Map<String, Value> {
        Map::new()
    }

    #[test]
    fn test_pipeline_defaults() {
        let doc: PipelineDoc = serde_yaml::from_str("{}").unwrap();
        let spec = PipelineSpec::from_doc(doc, &no_templates()).unwrap();

        assert_eq!(spec.name, "no-name");
        assert!(spec.tools.is_empty());
        assert_eq!(spec.definitions, json!({}));
        assert!(spec.environment.is_empty());
        assert!(spec.stages.is_empty());
    }

    #[test]
    fn test_stage_defaults() {
        let doc: PipelineDoc = serde_yaml::from_str("stages:\n  - {}\n").unwrap();
        let spec = PipelineSpec::from_doc(doc, &no_templates()).unwrap();

        assert_eq!(spec.stages.len(), 1);
        let stage = &spec.stages[0];
        assert_eq!(stage.name, "no-name");
        assert_eq!(stage.when, Expr::always_true());
        assert!(stage.script.is_empty());
    }

    #[test]
    fn test_when_parsed_at_registration() {
        let doc: PipelineDoc = serde_yaml::from_str(
            r#"
stages:
  - name: gated
    when: "env.release && env.target == 'prod'"
"#,
        )
        .unwrap();

        let spec = PipelineSpec::from_doc(doc, &no_templates()).unwrap();
        assert_ne!(spec.stages[0].when, Expr::always_true());
    }

    #[test]
    fn test_bad_predicate_is_a_load_error() {
        let doc: PipelineDoc = serde_yaml::from_str(
            r#"
name: broken
stages:
  - name: gated
    when: "env.release &&"
"#,
        )
        .unwrap();

        let result = PipelineSpec::from_doc(doc, &no_templates());
        assert!(matches!(result, Err(LoadError::BadPredicate { .. })));
    }

    #[test]
    fn test_duplicate_stage_names_rejected() {
        let doc: PipelineDoc = serde_yaml::from_str(
            r#"
name: dup
stages:
  - name: build
  - name: build
"#,
        )
        .unwrap();

        let result = PipelineSpec::from_doc(doc, &no_templates());
        assert!(matches!(result, Err(LoadError::DuplicateStage { .. })));
    }

    #[test]
    fn test_script_steps_deserialize() {
        let doc: PipelineDoc = serde_yaml::from_str(
            r#"
name: scripted
stages:
  - name: work
    script:
      - tool: shell
        action: run
        args: { command: "make build" }
        register: build
      - sleep: 250
      - read_file: ./VERSION
        register: version
      - write_file: ./out.txt
        contents: "v={{ version }}"
      - parallel:
          items: "env.targets"
          steps:
            - tool: shell
              action: run
              args: { command: "deploy {{ item }}" }
"#,
        )
        .unwrap();

        let spec = PipelineSpec::from_doc(doc, &no_templates()).unwrap();
        let script = &spec.stages[0].script;
        assert_eq!(script.len(), 5);
        assert!(matches!(script[0], ScriptStep::Invoke { .. }));
        assert!(matches!(script[1], ScriptStep::Sleep { sleep: 250 }));
        assert!(matches!(script[2], ScriptStep::ReadFile { .. }));
        assert!(matches!(script[3], ScriptStep::WriteFile { .. }));
        assert!(matches!(script[4], ScriptStep::Parallel { .. }));
    }

    #[test]
    fn test_bad_combinator_items_is_a_load_error() {
        let doc: PipelineDoc = serde_yaml::from_str(
            r#"
name: broken
stages:
  - name: fanout
    script:
      - parallel:
          items: "env.targets =="
          steps: []
"#,
        )
        .unwrap();

        let result = PipelineSpec::from_doc(doc, &no_templates());
        assert!(matches!(result, Err(LoadError::BadScript { .. })));
    }

    #[test]
    fn test_use_template_resolution() {
        let mut templates = Map::new();
        templates.insert(
            "skipped-stage".to_string(),
            json!({ "when": "false", "script": [] }),
        );

        let doc: PipelineDoc = serde_yaml::from_str(
            r#"
name: templated
stages:
  - name: skipped
    use: skipped-stage
"#,
        )
        .unwrap();

        let spec = PipelineSpec::from_doc(doc, &templates).unwrap();
        assert_eq!(spec.stages[0].name, "skipped");
        assert_eq!(
            spec.stages[0].when,
            Expr::Literal(Value::Bool(false))
        );
    }

    #[test]
    fn test_inline_fields_override_template() {
        let mut templates = Map::new();
        templates.insert(
            "gated".to_string(),
            json!({ "name": "template-name", "when": "false" }),
        );

        let doc: PipelineDoc = serde_yaml::from_str(
            r#"
stages:
  - use: gated
    when: "true"
"#,
        )
        .unwrap();

        let spec = PipelineSpec::from_doc(doc, &templates).unwrap();
        assert_eq!(spec.stages[0].name, "template-name");
        assert_eq!(spec.stages[0].when, Expr::always_true());
    }

    #[test]
    fn test_unknown_template_rejected() {
        let doc: PipelineDoc = serde_yaml::from_str(
            r#"
stages:
  - use: missing
"#,
        )
        .unwrap();

        let result = PipelineSpec::from_doc(doc, &no_templates());
        assert!(matches!(result, Err(LoadError::UnknownTemplate { .. })));
    }

    #[test]
    fn test_non_mapping_template_rejected() {
        let mut templates = Map::new();
        templates.insert("scalar".to_string(), json!("not a stage"));

        let doc: PipelineDoc = serde_yaml::from_str(
            r#"
stages:
  - use: scalar
"#,
        )
        .unwrap();

        let result = PipelineSpec::from_doc(doc, &templates);
        assert!(matches!(result, Err(LoadError::BadTemplate { .. })));
    }
}
