//! Stage Scheduler
//!
//! Runs the stages of one pipeline strictly in declaration order and
//! interprets their scripts. Per stage the state machine is:
//!
//! ```text
//! PENDING -> SKIPPED                      (predicate falsy)
//! PENDING -> STARTED -> SUCCEEDED         (script completed)
//! PENDING -> STARTED -> FAILED            (script raised)
//! ```
//!
//! The first failure aborts the remaining stages of the pipeline: no
//! partial continuation, no retry. A failing `when` predicate is treated
//! exactly like a failing script. Concurrency inside a stage only happens
//! where the script asks for it with `parallel`; the scheduler itself
//! never overlaps two stages.

use futures::future::{join_all, BoxFuture};
use log::error;
use serde_json::{Map, Value};
use tokio::time::{sleep, Duration};

use crate::error::StageError;
use crate::manifest::expr::{self, Expr, Scope};
use crate::manifest::model::{MapBlock, PipelineSpec, ScriptStep};
use crate::monitoring::journal::{EventKind, Journal, Level};
use crate::tools::ToolSet;

/// Runs every stage of the pipeline against its environment and tool
/// set. Returns `true` only when no stage failed.
pub async fn run_stages(
    spec: &PipelineSpec,
    environment: &Value,
    tools: &ToolSet,
    exports: &Map<String, Value>,
    journal: &Journal,
) -> bool {
    let mut scope = Scope::new();
    scope.merge(exports);
    scope.set("env", environment.clone());
    scope.set("tools", tools.properties());

    for stage in &spec.stages {
        let gate = match stage.when.eval_bool(&scope) {
            Ok(pass) => pass,
            Err(err) => {
                journal.stage(&spec.name, &stage.name, Level::Error, EventKind::Failed);
                error!("{}", StageError::Predicate(err));
                return false;
            }
        };

        if !gate {
            journal.stage(&spec.name, &stage.name, Level::Info, EventKind::Skipped);
            continue;
        }

        journal.stage(&spec.name, &stage.name, Level::Info, EventKind::Started);

        match run_script(&stage.script, &scope, tools).await {
            Ok(()) => {
                journal.stage(&spec.name, &stage.name, Level::Info, EventKind::Succeeded);
            }
            Err(err) => {
                journal.stage(&spec.name, &stage.name, Level::Error, EventKind::Failed);
                error!("{}", err);
                return false;
            }
        }
    }

    journal.pipeline(&spec.name, Level::Info, EventKind::Succeeded);
    true
}

/// Interprets one stage script. The script sees a copy of the stage
/// scope; `register` bindings live for the rest of the script only.
async fn run_script(
    steps: &[ScriptStep],
    scope: &Scope,
    tools: &ToolSet,
) -> Result<(), StageError> {
    let mut locals = scope.clone();
    run_steps(steps, &mut locals, tools).await
}

fn run_steps<'a>(
    steps: &'a [ScriptStep],
    scope: &'a mut Scope,
    tools: &'a ToolSet,
) -> BoxFuture<'a, Result<(), StageError>> {
    Box::pin(async move {
        for step in steps {
            run_step(step, scope, tools).await?;
        }
        Ok(())
    })
}

async fn run_step(
    step: &ScriptStep,
    scope: &mut Scope,
    tools: &ToolSet,
) -> Result<(), StageError> {
    match step {
        ScriptStep::Invoke {
            tool,
            action,
            args,
            register,
        } => {
            let instance = tools
                .get(tool)
                .ok_or_else(|| StageError::MissingTool(tool.clone()))?;
            let rendered = expr::render(args, scope)?;
            let result = instance.invoke(action, &rendered).await?;
            if let Some(name) = register {
                scope.set(name.clone(), result);
            }
        }

        ScriptStep::Sleep { sleep: ms } => {
            sleep(Duration::from_millis(*ms)).await;
        }

        ScriptStep::ReadFile {
            read_file,
            register,
        } => {
            let path = render_text(read_file, scope)?;
            let contents =
                tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|source| StageError::File {
                        path: path.into(),
                        source,
                    })?;
            if let Some(name) = register {
                scope.set(name.clone(), Value::String(contents));
            }
        }

        ScriptStep::WriteFile {
            write_file,
            contents,
        } => {
            let path = render_text(write_file, scope)?;
            let rendered = expr::render(contents, scope)?;
            let text = match rendered {
                Value::String(s) => s,
                other => other.to_string(),
            };
            tokio::fs::write(&path, text)
                .await
                .map_err(|source| StageError::File {
                    path: path.into(),
                    source,
                })?;
        }

        ScriptStep::Parallel { parallel } => run_parallel(parallel, scope, tools).await?,

        ScriptStep::Sequential { sequential } => run_sequential(sequential, scope, tools).await?,
    }

    Ok(())
}

/// Applies the block's steps to every item concurrently. Waits for all
/// applications; the first failure in item order is surfaced.
async fn run_parallel(
    block: &MapBlock,
    scope: &Scope,
    tools: &ToolSet,
) -> Result<(), StageError> {
    let items = eval_items(&block.items, scope, "parallel")?;

    let branches = items.into_iter().map(|item| {
        let mut child = scope.clone();
        child.set("item", item);
        async move { run_steps(&block.steps, &mut child, tools).await }
    });

    join_all(branches)
        .await
        .into_iter()
        .collect::<Result<Vec<()>, _>>()?;
    Ok(())
}

/// Applies the block's steps to each item in order, stopping at the
/// first failure.
async fn run_sequential(
    block: &MapBlock,
    scope: &Scope,
    tools: &ToolSet,
) -> Result<(), StageError> {
    let items = eval_items(&block.items, scope, "sequential")?;

    for item in items {
        let mut child = scope.clone();
        child.set("item", item);
        run_steps(&block.steps, &mut child, tools).await?;
    }
    Ok(())
}

fn eval_items(
    source: &str,
    scope: &Scope,
    combinator: &'static str,
) -> Result<Vec<Value>, StageError> {
    let value = Expr::parse(source)?.eval(scope)?;
    match value {
        Value::Array(items) => Ok(items),
        other => Err(StageError::BadItems {
            combinator,
            got: value_kind(&other),
        }),
    }
}

fn render_text(template: &str, scope: &Scope) -> Result<String, StageError> {
    let rendered = expr::render(&Value::String(template.to_string()), scope)?;
    Ok(match rendered {
        Value::String(s) => s,
        other => other.to_string(),
    })
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "sequence",
        Value::Object(_) => "mapping",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ToolError;
    use crate::manifest::model::PipelineDoc;
    use crate::tools::{Tool, ToolInstance};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    /// Records every invocation; `boom` fails, anything else succeeds.
    struct ProbeTool {
        calls: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Tool for ProbeTool {
        async fn invoke(&self, action: &str, args: &Value) -> Result<Value, ToolError> {
            self.calls.lock().unwrap().push(format!(
                "{}:{}",
                action,
                args.get("target").and_then(Value::as_str).unwrap_or("-")
            ));

            if action == "boom" {
                return Err(ToolError::failed("probe", "requested failure"));
            }
            Ok(json!({ "ran": action }))
        }
    }

    fn probe_tools() -> (ToolSet, Arc<Mutex<Vec<String>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut tools = ToolSet::new();
        tools.insert(
            "probe",
            Arc::new(ProbeTool {
                calls: Arc::clone(&calls),
            }) as ToolInstance,
        );
        (tools, calls)
    }

    fn pipeline(yaml: &str) -> PipelineSpec {
        let doc: PipelineDoc = serde_yaml::from_str(yaml).unwrap();
        PipelineSpec::from_doc(doc, &Map::new()).unwrap()
    }

    #[tokio::test]
    async fn test_stages_run_in_order_and_skip() {
        let spec = pipeline(
            r#"
name: ordered
stages:
  - name: first
    script:
      - { tool: probe, action: one }
  - name: gated-off
    when: "false"
    script:
      - { tool: probe, action: never }
  - name: last
    script:
      - { tool: probe, action: two }
"#,
        );

        let (tools, calls) = probe_tools();
        let journal = Journal::new();
        let ok = run_stages(&spec, &json!({}), &tools, &Map::new(), &journal).await;

        assert!(ok);
        assert_eq!(*calls.lock().unwrap(), vec!["one:-", "two:-"]);

        let events: Vec<_> = journal
            .records()
            .iter()
            .map(|r| (r.stage().map(str::to_string), r.event))
            .collect();
        assert_eq!(
            events,
            vec![
                (Some("first".to_string()), EventKind::Started),
                (Some("first".to_string()), EventKind::Succeeded),
                (Some("gated-off".to_string()), EventKind::Skipped),
                (Some("last".to_string()), EventKind::Started),
                (Some("last".to_string()), EventKind::Succeeded),
                (None, EventKind::Succeeded),
            ]
        );
    }

    #[tokio::test]
    async fn test_fail_fast_aborts_remaining_stages() {
        let spec = pipeline(
            r#"
name: failing
stages:
  - name: explode
    script:
      - { tool: probe, action: boom }
  - name: after
    script:
      - { tool: probe, action: never }
"#,
        );

        let (tools, calls) = probe_tools();
        let journal = Journal::new();
        let ok = run_stages(&spec, &json!({}), &tools, &Map::new(), &journal).await;

        assert!(!ok);
        assert_eq!(*calls.lock().unwrap(), vec!["boom:-"]);
        assert!(journal.for_stage("after").is_empty());

        let failed = journal.with_event(EventKind::Failed);
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].stage(), Some("explode"));
        assert_eq!(failed[0].level, Level::Error);

        // No trailing pipeline-level succeeded record after a failure.
        assert!(journal
            .with_event(EventKind::Succeeded)
            .iter()
            .all(|r| r.stage().is_some()));
    }

    #[tokio::test]
    async fn test_predicate_error_is_a_stage_failure() {
        let spec = pipeline(
            r#"
name: bad-gate
stages:
  - name: gate
    when: "env.missing.deeper"
  - name: after
    script:
      - { tool: probe, action: never }
"#,
        );

        let (tools, calls) = probe_tools();
        let journal = Journal::new();
        let ok = run_stages(
            &spec,
            &json!({ "missing": null }),
            &tools,
            &Map::new(),
            &journal,
        )
        .await;

        assert!(!ok);
        assert!(calls.lock().unwrap().is_empty());
        assert_eq!(journal.with_event(EventKind::Failed).len(), 1);
    }

    #[tokio::test]
    async fn test_when_reads_environment_and_tools() {
        let spec = pipeline(
            r#"
name: gated
stages:
  - name: only-release
    when: "env.release && tools.probe == null"
    script:
      - { tool: probe, action: one }
"#,
        );

        let (tools, calls) = probe_tools();
        let journal = Journal::new();
        // probe has no properties entry named in the expression, but the
        // tool itself appears under tools with an empty mapping.
        let ok = run_stages(
            &spec,
            &json!({ "release": true }),
            &tools,
            &Map::new(),
            &journal,
        )
        .await;

        assert!(ok);
        // tools.probe is {} (truthy object) so the gate is falsy.
        assert!(calls.lock().unwrap().is_empty());
        assert_eq!(journal.with_event(EventKind::Skipped).len(), 1);
    }

    #[tokio::test]
    async fn test_register_binds_results_for_later_steps() {
        let spec = pipeline(
            r#"
name: chained
stages:
  - name: work
    script:
      - { tool: probe, action: one, register: first }
      - { tool: probe, action: two, args: { target: "{{ first.ran }}" } }
"#,
        );

        let (tools, calls) = probe_tools();
        let journal = Journal::new();
        let ok = run_stages(&spec, &json!({}), &tools, &Map::new(), &journal).await;

        assert!(ok);
        assert_eq!(*calls.lock().unwrap(), vec!["one:-", "two:one"]);
    }

    #[tokio::test]
    async fn test_sequential_maps_in_order() {
        let spec = pipeline(
            r#"
name: fanout
stages:
  - name: work
    script:
      - sequential:
          items: "env.targets"
          steps:
            - { tool: probe, action: deploy, args: { target: "{{ item }}" } }
"#,
        );

        let (tools, calls) = probe_tools();
        let journal = Journal::new();
        let ok = run_stages(
            &spec,
            &json!({ "targets": ["a", "b", "c"] }),
            &tools,
            &Map::new(),
            &journal,
        )
        .await;

        assert!(ok);
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["deploy:a", "deploy:b", "deploy:c"]
        );
    }

    #[tokio::test]
    async fn test_sequential_short_circuits() {
        let spec = pipeline(
            r#"
name: fanout
stages:
  - name: work
    script:
      - sequential:
          items: "env.targets"
          steps:
            - { tool: probe, action: "{{ item }}" }
"#,
        );

        let (tools, calls) = probe_tools();
        let journal = Journal::new();
        let ok = run_stages(
            &spec,
            &json!({ "targets": ["one", "boom", "never"] }),
            &tools,
            &Map::new(),
            &journal,
        )
        .await;

        assert!(!ok);
        assert_eq!(*calls.lock().unwrap(), vec!["one:-", "boom:-"]);
    }

    #[tokio::test]
    async fn test_parallel_runs_all_and_surfaces_failure() {
        let spec = pipeline(
            r#"
name: fanout
stages:
  - name: work
    script:
      - parallel:
          items: "env.targets"
          steps:
            - { tool: probe, action: "{{ item }}" }
"#,
        );

        let (tools, calls) = probe_tools();
        let journal = Journal::new();
        let ok = run_stages(
            &spec,
            &json!({ "targets": ["one", "boom", "two"] }),
            &tools,
            &Map::new(),
            &journal,
        )
        .await;

        // All applications run to completion, the failure is surfaced.
        assert!(!ok);
        assert_eq!(calls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_combinator_items_must_be_a_sequence() {
        let spec = pipeline(
            r#"
name: fanout
stages:
  - name: work
    script:
      - parallel:
          items: "env.count"
          steps: []
"#,
        );

        let (tools, _) = probe_tools();
        let journal = Journal::new();
        let ok = run_stages(
            &spec,
            &json!({ "count": 3 }),
            &tools,
            &Map::new(),
            &journal,
        )
        .await;

        assert!(!ok);
    }

    #[tokio::test]
    async fn test_missing_tool_fails_the_stage() {
        let spec = pipeline(
            r#"
name: undeclared
stages:
  - name: work
    script:
      - { tool: ghost, action: run }
"#,
        );

        let journal = Journal::new();
        let ok = run_stages(
            &spec,
            &json!({}),
            &ToolSet::new(),
            &Map::new(),
            &journal,
        )
        .await;

        assert!(!ok);
        assert_eq!(journal.with_event(EventKind::Failed).len(), 1);
    }

    #[tokio::test]
    async fn test_file_facade_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("version.txt");
        let target = dir.path().join("out.txt");
        tokio::fs::write(&source, "1.2.3").await.unwrap();

        let spec = pipeline(&format!(
            r#"
name: files
stages:
  - name: copy
    script:
      - read_file: {}
        register: version
      - write_file: {}
        contents: "version={{{{ version }}}}"
"#,
            source.display(),
            target.display()
        ));

        let journal = Journal::new();
        let ok = run_stages(
            &spec,
            &json!({}),
            &ToolSet::new(),
            &Map::new(),
            &journal,
        )
        .await;

        assert!(ok);
        let written = tokio::fs::read_to_string(&target).await.unwrap();
        assert_eq!(written, "version=1.2.3");
    }

    #[tokio::test]
    async fn test_sleep_step_suspends() {
        let spec = pipeline(
            r#"
name: sleepy
stages:
  - name: nap
    script:
      - sleep: 10
"#,
        );

        let journal = Journal::new();
        let started = std::time::Instant::now();
        let ok = run_stages(
            &spec,
            &json!({}),
            &ToolSet::new(),
            &Map::new(),
            &journal,
        )
        .await;

        assert!(ok);
        assert!(started.elapsed() >= Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_exports_visible_to_expressions() {
        let spec = pipeline(
            r#"
name: exported
stages:
  - name: gated
    when: "registry == 'example.com'"
    script:
      - { tool: probe, action: one }
"#,
        );

        let (tools, calls) = probe_tools();
        let mut exports = Map::new();
        exports.insert("registry".to_string(), json!("example.com"));

        let journal = Journal::new();
        let ok = run_stages(&spec, &json!({}), &tools, &exports, &journal).await;

        assert!(ok);
        assert_eq!(calls.lock().unwrap().len(), 1);
    }
}
