//! # Program Units
//!
//! A [`ProgramUnit`] turns one natural-language query into executed code:
//!
//! ```text
//! build prompt -> infer -> extract -> resolve deps -> merge scope
//!     -> execute -> (update session) -> return
//! ```
//!
//! Units share the fixed and variable scopes of their [`FunctionSynthesizer`],
//! and can be bound into the variable scope as callables so generated code
//! may invoke other units by name.

use crate::backend::{GenerationOptions, InferenceBackend};
use crate::error::{Error, Result};
use crate::extract::extract;
use crate::prompt::PromptTemplate;
use crate::sandbox::{Execution, Sandbox};
use crate::scope::{Binding, FixedScope, HostFn, Namespace, SharedScope};
use crate::synth::FunctionSynthesizer;
use crate::transcript::SharedTranscript;
use rhai::Dynamic;
use std::cell::RefCell;
use std::rc::{Rc, Weak};
use tracing::{debug, info};

/// Return name that yields the executed source instead of a local.
pub const WHOLE_ANSWER: &str = "whole_answer";

/// What an invocation hands back.
#[derive(Debug, Clone)]
pub enum UnitOutput {
    /// A local bound by the executed code
    Value(Dynamic),
    /// The executed source, context included
    Source(String),
}

impl UnitOutput {
    pub fn into_dynamic(self) -> Dynamic {
        match self {
            UnitOutput::Value(value) => value,
            UnitOutput::Source(text) => Dynamic::from(text),
        }
    }
}

/// Flags that shape one unit's invocation.
#[derive(Debug, Clone, Default)]
pub struct UnitBehavior {
    /// Skip execution; prompt, extraction and resolution still happen
    pub debug_mode: bool,
    /// Prepend the context to the code unless the code already contains it
    pub include_context: bool,
    /// Local to return, or [`WHOLE_ANSWER`]
    pub return_val_name: Option<String>,
}

pub struct ProgramUnit {
    name: String,
    template: PromptTemplate,
    options: GenerationOptions,
    behavior: UnitBehavior,
    backend: Rc<dyn InferenceBackend>,
    fixed: Rc<FixedScope>,
    variable: SharedScope,
    fgen: Rc<FunctionSynthesizer>,
    sandbox: Sandbox,
    transcript: SharedTranscript,
    history: String,
}

impl ProgramUnit {
    pub fn new(
        name: impl Into<String>,
        template: PromptTemplate,
        backend: Rc<dyn InferenceBackend>,
        fixed: Rc<FixedScope>,
        fgen: Rc<FunctionSynthesizer>,
        transcript: SharedTranscript,
    ) -> Self {
        let variable = fgen.variable_scope().clone();
        Self {
            name: name.into(),
            template,
            options: GenerationOptions::default(),
            behavior: UnitBehavior::default(),
            backend,
            fixed,
            variable,
            fgen,
            sandbox: Sandbox::new(),
            transcript,
            history: String::new(),
        }
    }

    pub fn with_options(mut self, options: GenerationOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_behavior(mut self, behavior: UnitBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    pub fn with_sandbox(mut self, sandbox: Sandbox) -> Self {
        self.sandbox = sandbox;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn behavior(&self) -> &UnitBehavior {
        &self.behavior
    }

    /// Every snippet this unit executed, newline separated
    pub fn history(&self) -> &str {
        &self.history
    }

    pub fn reset_history(&mut self) {
        self.history.clear();
    }

    /// The prompt an invocation would send, without sending it.
    pub fn prompt(&self, query: &str, context: &str) -> String {
        let names = self.variable.borrow().names();
        self.template.build(&self.history, context, query, &names).0
    }

    /// Run one query through the unit.
    ///
    /// `extra_locals` are visible to the executed code as plain variables.
    /// Returns `None` unless the unit is configured with a return name.
    pub fn invoke(
        &mut self,
        query: &str,
        context: &str,
        extra_locals: &[(String, Dynamic)],
    ) -> Result<Option<UnitOutput>> {
        let names = self.variable.borrow().names();
        let (prompt, use_query) = self.template.build(&self.history, context, query, &names);
        debug!(unit = %self.name, %prompt, "built prompt");

        let reply = self
            .backend
            .generate(&self.options.request(prompt))
            .map_err(|e| e.with_operation("unit::invoke").with_context("unit", self.name.clone()))?;
        let code = extract(&reply)?;

        let (to_exec, to_log) = if self.behavior.include_context && !context.is_empty() && !code.contains(context) {
            (
                format!("{}\n{}", context, code),
                format!("{}\n{}\n{}", context, use_query, code),
            )
        } else {
            (code.clone(), format!("{}\n{}", use_query, code))
        };
        self.transcript.borrow_mut().record_executed(&self.name, &reply, &to_log);
        info!(unit = %self.name, "LMP {} exec:\n\n{}", self.name, to_log);

        let batch = self.fgen.resolve(&code)?;
        if !batch.is_empty() {
            let added = self.fgen.commit(batch);
            debug!(unit = %self.name, added, "merged synthesized functions");
        }

        let execution = if self.behavior.debug_mode {
            Execution::default()
        } else {
            let namespace = Namespace::capture(&self.fixed, &self.variable);
            self.sandbox
                .run(&to_exec, &namespace, extra_locals)
                .map_err(|e| e.with_context("unit", self.name.clone()))?
        };

        self.history.push('\n');
        self.history.push_str(&to_exec);

        if self.template.maintain_session {
            let mut variable = self.variable.borrow_mut();
            for (name, f) in &execution.functions {
                variable.fold(name.clone(), Binding::Script(f.clone()));
            }
            for (name, value) in &execution.locals {
                variable.fold(name.clone(), Binding::Value(value.clone()));
            }
        }

        match self.behavior.return_val_name.as_deref() {
            None => Ok(None),
            Some(WHOLE_ANSWER) => Ok(Some(UnitOutput::Source(to_exec))),
            Some(name) => execution
                .locals
                .get(name)
                .cloned()
                .map(|value| Some(UnitOutput::Value(value)))
                .ok_or_else(|| {
                    Error::missing_return_binding(name)
                        .with_operation("unit::invoke")
                        .with_context("unit", self.name.clone())
                }),
        }
    }

    /// Expose a unit to scripts as `name(query)` / `name(query, context)`.
    ///
    /// The binding holds a weak reference; invoking a unit that is already
    /// running fails with a reentrancy error.
    pub fn binding(unit: &Rc<RefCell<ProgramUnit>>) -> HostFn {
        let name = unit.borrow().name.clone();
        let weak: Weak<RefCell<ProgramUnit>> = Rc::downgrade(unit);
        let unit_name = name.clone();

        HostFn::new(name, [1, 2], move |args| {
            let unit = weak
                .upgrade()
                .ok_or_else(|| format!("unit '{}' is no longer available", unit_name))?;
            let query = text_arg(args, 0)?;
            let context = if args.len() > 1 { text_arg(args, 1)? } else { String::new() };

            let mut unit = unit
                .try_borrow_mut()
                .map_err(|_| Error::reentrant(unit_name.as_str()).to_string())?;
            let output = unit.invoke(&query, &context, &[]).map_err(|e| e.to_string())?;

            Ok(output.map(UnitOutput::into_dynamic).unwrap_or(Dynamic::UNIT))
        })
    }
}

fn text_arg(args: &[Dynamic], index: usize) -> std::result::Result<String, String> {
    args[index]
        .clone()
        .into_string()
        .map_err(|actual| format!("expected a string argument, got {}", actual))
}

impl std::fmt::Debug for ProgramUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgramUnit")
            .field("name", &self.name)
            .field("behavior", &self.behavior)
            .field("options", &self.options)
            .finish()
    }
}
