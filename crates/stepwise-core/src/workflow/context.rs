//! Per-run execution context: frozen inputs, one output slot per step, and
//! loop bindings.
//!
//! Slots are allocated once from the definition's step tree, so every step
//! name maps to a fixed index. A slot is written at most once unless a loop
//! iteration re-arms it. Parallel children run on forked copies and their
//! writes are merged back with [`ExecutionContext::absorb`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::Value;
use stepwise_types::workflow::WorkflowDefinition;

use super::expression::{Scope, SlotValue};

// ---------------------------------------------------------------------------
// Slot layout
// ---------------------------------------------------------------------------

/// Step name -> slot index, computed once per definition.
#[derive(Debug, Clone, Default)]
pub struct SlotLayout {
    index: HashMap<String, usize>,
    names: Vec<String>,
}

impl SlotLayout {
    /// One slot per step in the tree, in depth-first declaration order.
    pub fn for_definition(def: &WorkflowDefinition) -> Self {
        let mut layout = Self::default();
        for step in def.all_steps() {
            if !layout.index.contains_key(&step.name) {
                layout.index.insert(step.name.clone(), layout.names.len());
                layout.names.push(step.name.clone());
            }
        }
        layout
    }

    pub fn slot(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ContextError {
    #[error("unknown step '{0}'")]
    UnknownStep(String),

    #[error("output slot for step '{0}' is already written")]
    SlotAlreadyWritten(String),
}

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct LoopFrame {
    item: SlotValue,
    index: usize,
}

/// Resolved run-time state visible to expressions and handlers.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    layout: Arc<SlotLayout>,
    inputs: Arc<BTreeMap<String, Value>>,
    slots: Vec<Option<SlotValue>>,
    frames: Vec<LoopFrame>,
    /// Slots written since this context was created or forked.
    journal: Vec<usize>,
}

impl ExecutionContext {
    pub fn new(layout: Arc<SlotLayout>, inputs: BTreeMap<String, Value>) -> Self {
        let slots = vec![None; layout.len()];
        Self {
            layout,
            inputs: Arc::new(inputs),
            slots,
            frames: Vec::new(),
            journal: Vec::new(),
        }
    }

    pub fn layout(&self) -> &SlotLayout {
        &self.layout
    }

    pub fn input_values(&self) -> &BTreeMap<String, Value> {
        &self.inputs
    }

    /// Record a step's output. Fails if the slot already holds a value.
    pub fn set_output(&mut self, step: &str, output: Value) -> Result<(), ContextError> {
        self.write(step, SlotValue::ready(output))
    }

    /// Fill a slot with a dry-run placeholder.
    pub fn mark_planned(&mut self, step: &str) -> Result<(), ContextError> {
        self.write(step, SlotValue::Planned)
    }

    fn write(&mut self, step: &str, value: SlotValue) -> Result<(), ContextError> {
        let idx = self
            .layout
            .slot(step)
            .ok_or_else(|| ContextError::UnknownStep(step.to_string()))?;
        if self.slots[idx].is_some() {
            return Err(ContextError::SlotAlreadyWritten(step.to_string()));
        }
        self.slots[idx] = Some(value);
        self.journal.push(idx);
        Ok(())
    }

    pub fn slot(&self, step: &str) -> Option<&SlotValue> {
        self.layout.slot(step).and_then(|idx| self.slots[idx].as_ref())
    }

    /// The recorded output of a completed step.
    pub fn output(&self, step: &str) -> Option<&Value> {
        self.slot(step).and_then(SlotValue::as_value)
    }

    pub fn is_written(&self, step: &str) -> bool {
        self.slot(step).is_some()
    }

    /// Clear the given slots so a loop body can run again.
    pub fn rearm<I, N>(&mut self, steps: I)
    where
        I: IntoIterator<Item = N>,
        N: AsRef<str>,
    {
        for step in steps {
            if let Some(idx) = self.layout.slot(step.as_ref()) {
                self.slots[idx] = None;
                self.journal.retain(|j| *j != idx);
            }
        }
    }

    pub fn push_loop_frame(&mut self, item: SlotValue, index: usize) {
        self.frames.push(LoopFrame { item, index });
    }

    pub fn pop_loop_frame(&mut self) {
        self.frames.pop();
    }

    /// Copy of this context with an empty write journal.
    pub fn fork(&self) -> Self {
        Self {
            layout: Arc::clone(&self.layout),
            inputs: Arc::clone(&self.inputs),
            slots: self.slots.clone(),
            frames: self.frames.clone(),
            journal: Vec::new(),
        }
    }

    /// Merge the slots a forked child wrote back into this context.
    pub fn absorb(&mut self, mut child: ExecutionContext) -> Result<(), ContextError> {
        for idx in std::mem::take(&mut child.journal) {
            let Some(value) = child.slots[idx].take() else {
                continue;
            };
            if self.slots[idx].is_some() {
                return Err(ContextError::SlotAlreadyWritten(
                    self.layout.names[idx].clone(),
                ));
            }
            self.slots[idx] = Some(value);
            self.journal.push(idx);
        }
        Ok(())
    }

    /// Names of steps with a slot written (ready or planned), in layout order.
    pub fn completed_names(&self) -> Vec<&str> {
        self.layout
            .names
            .iter()
            .zip(&self.slots)
            .filter(|(_, slot)| slot.is_some())
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// All ready outputs keyed by step name.
    pub fn outputs_snapshot(&self) -> BTreeMap<String, Value> {
        self.layout
            .names
            .iter()
            .zip(&self.slots)
            .filter_map(|(name, slot)| {
                let value = slot.as_ref()?.as_value()?;
                Some((name.clone(), value.clone()))
            })
            .collect()
    }
}

impl Scope for ExecutionContext {
    fn input(&self, name: &str) -> Option<&Value> {
        self.inputs.get(name)
    }

    fn inputs(&self) -> Value {
        Value::Object(
            self.inputs
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    fn step_output(&self, name: &str) -> Option<SlotValue> {
        self.slot(name).cloned()
    }

    fn loop_item(&self) -> Option<SlotValue> {
        self.frames.last().map(|f| f.item.clone())
    }

    fn loop_index(&self) -> Option<usize> {
        self.frames.last().map(|f| f.index)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::definition::parse_workflow_yaml;
    use crate::workflow::expression::Evaluator;
    use serde_json::json;

    const YAML: &str = r#"
name: ctx-test
version: "1.0.0"
inputs:
  target:
    type: string
steps:
  - name: first
    type: python
    action: echo
  - name: fan
    type: parallel
    steps:
      - name: left
        type: python
        action: echo
      - name: right
        type: python
        action: echo
  - name: each
    type: loop
    items: "inputs.target"
    steps:
      - name: body
        type: python
        action: echo
"#;

    fn context() -> ExecutionContext {
        let def = parse_workflow_yaml(YAML).unwrap();
        let layout = Arc::new(SlotLayout::for_definition(&def));
        let mut inputs = BTreeMap::new();
        inputs.insert("target".to_string(), json!("main"));
        ExecutionContext::new(layout, inputs)
    }

    #[test]
    fn layout_covers_nested_steps_in_declaration_order() {
        let ctx = context();
        assert_eq!(
            ctx.layout().names(),
            &["first", "fan", "left", "right", "each", "body"]
        );
        assert_eq!(ctx.layout().slot("right"), Some(3));
        assert!(ctx.layout().slot("missing").is_none());
    }

    #[test]
    fn slots_are_write_once() {
        let mut ctx = context();
        ctx.set_output("first", json!(1)).unwrap();
        let err = ctx.set_output("first", json!(2)).unwrap_err();
        assert_eq!(err, ContextError::SlotAlreadyWritten("first".to_string()));
        assert_eq!(ctx.output("first"), Some(&json!(1)));
    }

    #[test]
    fn unknown_step_is_rejected() {
        let mut ctx = context();
        assert_eq!(
            ctx.set_output("ghost", json!(null)).unwrap_err(),
            ContextError::UnknownStep("ghost".to_string())
        );
    }

    #[test]
    fn rearm_allows_rewrite() {
        let mut ctx = context();
        ctx.set_output("body", json!("a")).unwrap();
        ctx.rearm(["body"]);
        assert!(!ctx.is_written("body"));
        ctx.set_output("body", json!("b")).unwrap();
        assert_eq!(ctx.output("body"), Some(&json!("b")));
    }

    #[test]
    fn fork_and_absorb_merge_child_writes() {
        let mut parent = context();
        parent.set_output("first", json!("done")).unwrap();

        let mut left = parent.fork();
        let mut right = parent.fork();
        left.set_output("left", json!("L")).unwrap();
        right.set_output("right", json!("R")).unwrap();
        // Children see parent state.
        assert_eq!(left.output("first"), Some(&json!("done")));
        assert!(left.output("right").is_none());

        parent.absorb(left).unwrap();
        parent.absorb(right).unwrap();
        assert_eq!(parent.output("left"), Some(&json!("L")));
        assert_eq!(parent.output("right"), Some(&json!("R")));
        assert_eq!(parent.completed_names(), vec!["first", "left", "right"]);
    }

    #[test]
    fn absorb_detects_conflicting_writes() {
        let mut parent = context();
        let mut child = parent.fork();
        child.set_output("left", json!(1)).unwrap();
        parent.set_output("left", json!(2)).unwrap();
        assert!(parent.absorb(child).is_err());
    }

    #[test]
    fn scope_exposes_outputs_and_loop_bindings() {
        let mut ctx = context();
        let ev = Evaluator::new();
        ctx.set_output("first", json!({ "sha": "abc" })).unwrap();
        ctx.push_loop_frame(SlotValue::ready(json!("pkg-a")), 1);

        assert_eq!(ev.evaluate("steps.first.output.sha", &ctx).unwrap(), json!("abc"));
        assert_eq!(ev.evaluate("item", &ctx).unwrap(), json!("pkg-a"));
        assert_eq!(ev.evaluate("index", &ctx).unwrap(), json!(1));
        assert_eq!(ev.evaluate("inputs.target", &ctx).unwrap(), json!("main"));

        ctx.pop_loop_frame();
        assert!(ev.evaluate("item", &ctx).is_err());
    }

    #[test]
    fn planned_slots_are_not_in_snapshot() {
        let mut ctx = context();
        ctx.mark_planned("first").unwrap();
        ctx.set_output("left", json!(true)).unwrap();
        assert!(ctx.is_written("first"));
        let snapshot = ctx.outputs_snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot["left"], json!(true));
    }
}
