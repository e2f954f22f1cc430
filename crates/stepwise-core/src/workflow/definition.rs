//! Workflow definition parsing, validation, and run-input resolution.
//!
//! Converts YAML documents into a `WorkflowDefinition`, validates structural
//! constraints (unique names across the step tree, well-formed expressions,
//! declared references, compilable output schemas), and checks run inputs
//! against the declared input types before dispatch.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde_json::Value;
use stepwise_types::workflow::{StepDefinition, StepKind, WorkflowDefinition};
use thiserror::Error;

use super::expression::{Expression, Root, SyntaxError, Template};
use super::schema;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised while loading a workflow or resolving its inputs.
#[derive(Debug, Error)]
pub enum DefinitionError {
    /// YAML parse failure.
    #[error("parse error: {0}")]
    Parse(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// An expression or template does not parse.
    #[error("expression error in {location}: {source}")]
    Expression {
        location: String,
        #[source]
        source: SyntaxError,
    },

    /// `steps.<name>` names a step that does not exist.
    #[error("{location} references unknown step '{reference}'")]
    UnknownStepReference { location: String, reference: String },

    /// `inputs.<name>` names an input that is not declared.
    #[error("{location} references undeclared input '{input}'")]
    UnknownInput { location: String, input: String },

    #[error("missing required input '{0}'")]
    MissingInput(String),

    #[error("input '{name}' expects {expected}, got {actual}")]
    InputType {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("unexpected input '{0}' (not declared by the workflow)")]
    UndeclaredInput(String),

    /// A subworkflow reference could not be resolved.
    #[error("workflow '{0}' not found")]
    NotFound(String),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated `WorkflowDefinition`.
///
/// Runs `validate_definition` after deserialization, so the returned value
/// is guaranteed to be structurally valid.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, DefinitionError> {
    let def: WorkflowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| DefinitionError::Parse(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Load a workflow definition from a YAML file.
pub fn load_workflow_file(path: &Path) -> Result<WorkflowDefinition, DefinitionError> {
    let content = std::fs::read_to_string(path).map_err(|source| DefinitionError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_workflow_yaml(&content)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a `WorkflowDefinition`.
///
/// Checks:
/// - Name is non-empty and contains only alphanumerics, `-` and `_`
/// - Version is a semantic version
/// - At least one step exists; step names are unique across the whole tree
/// - Type-specific fields are well formed (non-empty bodies, bounds >= 1)
/// - Input defaults match their declared type
/// - Every expression and template parses
/// - `steps.*` / `inputs.*` references name declared steps and inputs, and
///   `item` / `index` only appear inside loop bodies
/// - Output schemas compile
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), DefinitionError> {
    if def.name.is_empty() {
        return Err(DefinitionError::Validation(
            "workflow name must not be empty".to_string(),
        ));
    }
    if !valid_name(&def.name) {
        return Err(DefinitionError::Validation(format!(
            "workflow name '{}' contains invalid characters (only alphanumerics, '-' and '_' allowed)",
            def.name
        )));
    }
    semver::Version::parse(&def.version).map_err(|e| {
        DefinitionError::Validation(format!("version '{}' is not semver: {e}", def.version))
    })?;

    if def.steps.is_empty() {
        return Err(DefinitionError::Validation(
            "workflow must have at least one step".to_string(),
        ));
    }

    for (name, decl) in &def.inputs {
        if let Some(default) = &decl.default {
            if !decl.kind.accepts(default) {
                return Err(DefinitionError::Validation(format!(
                    "default for input '{name}' is not a {}",
                    decl.kind
                )));
            }
        }
    }

    let all = def.all_steps();
    let mut names = HashSet::new();
    for step in &all {
        if step.name.is_empty() || !valid_name(&step.name) {
            return Err(DefinitionError::Validation(format!(
                "invalid step name '{}' (only alphanumerics, '-' and '_' allowed)",
                step.name
            )));
        }
        if !names.insert(step.name.as_str()) {
            return Err(DefinitionError::Validation(format!(
                "duplicate step name: '{}'",
                step.name
            )));
        }
    }

    let refs = References {
        steps: names,
        inputs: def.inputs.keys().map(String::as_str).collect(),
    };
    for step in &def.steps {
        validate_step(step, &refs, false)?;
    }

    for (name, template) in &def.outputs {
        refs.check_template(&format!("outputs.{name}"), template, false)?;
    }

    Ok(())
}

fn valid_name(name: &str) -> bool {
    name.chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

struct References<'a> {
    steps: HashSet<&'a str>,
    inputs: HashSet<&'a str>,
}

impl References<'_> {
    /// Parse a bare expression (or `{{ }}` template) and check its paths.
    fn check_expression(
        &self,
        location: &str,
        source: &str,
        in_loop: bool,
    ) -> Result<(), DefinitionError> {
        if source.contains("{{") {
            return self.check_template(location, source, in_loop);
        }
        let expr = Expression::parse(source.trim()).map_err(|e| DefinitionError::Expression {
            location: location.to_string(),
            source: e,
        })?;
        self.check_paths(location, &expr, in_loop)
    }

    fn check_template(
        &self,
        location: &str,
        source: &str,
        in_loop: bool,
    ) -> Result<(), DefinitionError> {
        let template = Template::parse(source).map_err(|e| DefinitionError::Expression {
            location: location.to_string(),
            source: e,
        })?;
        for expr in template.expressions() {
            self.check_paths(location, expr, in_loop)?;
        }
        Ok(())
    }

    /// Check every string inside a JSON value as a template.
    fn check_value(
        &self,
        location: &str,
        value: &Value,
        in_loop: bool,
    ) -> Result<(), DefinitionError> {
        match value {
            Value::String(s) => self.check_template(location, s, in_loop),
            Value::Array(items) => items
                .iter()
                .try_for_each(|v| self.check_value(location, v, in_loop)),
            Value::Object(map) => map
                .values()
                .try_for_each(|v| self.check_value(location, v, in_loop)),
            _ => Ok(()),
        }
    }

    fn check_inputs(
        &self,
        step: &str,
        inputs: &BTreeMap<String, Value>,
        in_loop: bool,
    ) -> Result<(), DefinitionError> {
        for (key, value) in inputs {
            self.check_value(&format!("step '{step}' input '{key}'"), value, in_loop)?;
        }
        Ok(())
    }

    fn check_paths(
        &self,
        location: &str,
        expr: &Expression,
        in_loop: bool,
    ) -> Result<(), DefinitionError> {
        for path in expr.paths() {
            match path.root {
                Root::Steps => match path.head() {
                    Some(name) if self.steps.contains(name) => {}
                    Some(name) => {
                        return Err(DefinitionError::UnknownStepReference {
                            location: location.to_string(),
                            reference: name.to_string(),
                        });
                    }
                    None => {
                        return Err(DefinitionError::Validation(format!(
                            "{location}: `{}` must name a step",
                            path.text()
                        )));
                    }
                },
                Root::Inputs => {
                    if let Some(name) = path.head() {
                        if !self.inputs.contains(name) {
                            return Err(DefinitionError::UnknownInput {
                                location: location.to_string(),
                                input: name.to_string(),
                            });
                        }
                    }
                }
                Root::Item | Root::Index if !in_loop => {
                    return Err(DefinitionError::Validation(format!(
                        "{location}: `{}` is only available inside a loop body",
                        path.text()
                    )));
                }
                Root::Item | Root::Index => {}
            }
        }
        Ok(())
    }
}

fn validate_step(
    step: &StepDefinition,
    refs: &References<'_>,
    in_loop: bool,
) -> Result<(), DefinitionError> {
    let name = step.name.as_str();
    let invalid = |message: &str| DefinitionError::Validation(format!("step '{name}': {message}"));

    if let Some(when) = &step.when {
        refs.check_expression(&format!("step '{name}' when"), when, in_loop)?;
    }
    if step.timeout_secs == Some(0) {
        return Err(invalid("timeout_secs must be > 0"));
    }
    if let Some(suffix) = &step.config.prompt_suffix {
        refs.check_template(&format!("step '{name}' prompt_suffix"), suffix, in_loop)?;
    }

    match &step.kind {
        StepKind::Python {
            action,
            inputs,
            output_schema,
        } => {
            if action.trim().is_empty() {
                return Err(invalid("python step requires an action"));
            }
            refs.check_inputs(name, inputs, in_loop)?;
            check_schema(name, output_schema.as_ref())?;
        }
        StepKind::Agent {
            prompt,
            inputs,
            output_schema,
        } => {
            refs.check_template(&format!("step '{name}' prompt"), prompt, in_loop)?;
            refs.check_inputs(name, inputs, in_loop)?;
            check_schema(name, output_schema.as_ref())?;
        }
        StepKind::Generate { prompt, inputs } => {
            refs.check_template(&format!("step '{name}' prompt"), prompt, in_loop)?;
            refs.check_inputs(name, inputs, in_loop)?;
        }
        StepKind::Validate { stages, inputs } => {
            if stages.is_empty() {
                return Err(invalid("validate step requires at least one stage"));
            }
            refs.check_inputs(name, inputs, in_loop)?;
        }
        StepKind::Parallel {
            steps,
            max_concurrent,
        } => {
            if steps.is_empty() {
                return Err(invalid("parallel step requires at least one child"));
            }
            if *max_concurrent == Some(0) {
                return Err(invalid("max_concurrent must be >= 1"));
            }
            for child in steps {
                validate_step(child, refs, in_loop)?;
            }
        }
        StepKind::Branch {
            condition,
            then,
            otherwise,
        } => {
            refs.check_expression(&format!("step '{name}' condition"), condition, in_loop)?;
            if then.is_empty() {
                return Err(invalid("branch step requires a non-empty 'then'"));
            }
            for child in then.iter().chain(otherwise.iter()) {
                validate_step(child, refs, in_loop)?;
            }
        }
        StepKind::Loop {
            items,
            steps,
            max_iterations,
        } => {
            refs.check_expression(&format!("step '{name}' items"), items, in_loop)?;
            if steps.is_empty() {
                return Err(invalid("loop step requires a non-empty body"));
            }
            if *max_iterations == Some(0) {
                return Err(invalid("max_iterations must be >= 1"));
            }
            for child in steps {
                validate_step(child, refs, true)?;
            }
        }
        StepKind::Checkpoint { .. } => {}
        StepKind::Subworkflow { workflow, inputs } => {
            if workflow.trim().is_empty() {
                return Err(invalid("subworkflow step requires a workflow reference"));
            }
            refs.check_inputs(name, inputs, in_loop)?;
        }
    }

    Ok(())
}

fn check_schema(step: &str, schema: Option<&Value>) -> Result<(), DefinitionError> {
    match schema {
        Some(schema) => schema::compile_check(schema).map_err(|e| {
            DefinitionError::Validation(format!("step '{step}': invalid output_schema: {e}"))
        }),
        None => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Run inputs
// ---------------------------------------------------------------------------

/// Resolve the caller's inputs against the workflow's declarations.
///
/// Applies defaults, rejects missing required inputs, type mismatches and
/// undeclared names. Optional inputs without a default stay absent.
pub fn resolve_inputs(
    def: &WorkflowDefinition,
    provided: BTreeMap<String, Value>,
) -> Result<BTreeMap<String, Value>, DefinitionError> {
    if let Some(unknown) = provided.keys().find(|k| !def.inputs.contains_key(*k)) {
        return Err(DefinitionError::UndeclaredInput(unknown.clone()));
    }

    let mut provided = provided;
    let mut resolved = BTreeMap::new();
    for (name, decl) in &def.inputs {
        let value = match provided.remove(name).or_else(|| decl.default.clone()) {
            Some(value) => value,
            None if decl.is_required() => return Err(DefinitionError::MissingInput(name.clone())),
            None => continue,
        };
        if !decl.kind.accepts(&value) {
            return Err(DefinitionError::InputType {
                name: name.clone(),
                expected: decl.kind.to_string(),
                actual: describe_value(&value).to_string(),
            });
        }
        resolved.insert(name.clone(), value);
    }
    Ok(resolved)
}

fn describe_value(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "map",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
