//! # Function Synthesis
//!
//! Turns the call signature of an unresolved function into a working
//! definition, and does the same for whatever that definition calls.
//!
//! Resolution runs in two passes:
//!
//! 1. **Plan**: request a definition for each missing name, check that it
//!    binds the name, and walk the calls in its body, depth first.
//! 2. **Materialize**: execute the definitions leaves first, each against the
//!    children already materialized, so no function is kept that was built
//!    before its dependencies existed.
//!
//! Results accumulate in a [`Batch`] until the caller commits them into the
//! shared variable scope.

use crate::backend::{GenerationOptions, InferenceBackend};
use crate::callgraph::{defined_functions, extract_calls, function_body};
use crate::error::{Error, Result};
use crate::extract::extract;
use crate::prompt::PromptTemplate;
use crate::sandbox::Sandbox;
use crate::scope::{Batch, Binding, FixedScope, Namespace, ScriptFn, SharedScope};
use crate::transcript::SharedTranscript;
use std::collections::HashSet;
use std::rc::Rc;
use tracing::{debug, info};

/// A requested definition and the definitions it depends on.
#[derive(Debug)]
struct Plan {
    name: String,
    source: String,
    /// Binding from the planning run, valid when there are no children
    defined: ScriptFn,
    children: Vec<Plan>,
}

/// The FGen: fills in functions that generated code calls but nobody defined.
pub struct FunctionSynthesizer {
    template: PromptTemplate,
    options: GenerationOptions,
    backend: Rc<dyn InferenceBackend>,
    fixed: Rc<FixedScope>,
    variable: SharedScope,
    sandbox: Sandbox,
    transcript: SharedTranscript,
}

impl FunctionSynthesizer {
    pub fn new(
        template: PromptTemplate,
        backend: Rc<dyn InferenceBackend>,
        fixed: Rc<FixedScope>,
        variable: SharedScope,
        transcript: SharedTranscript,
    ) -> Self {
        Self {
            template,
            options: GenerationOptions::default(),
            backend,
            fixed,
            variable,
            sandbox: Sandbox::new(),
            transcript,
        }
    }

    pub fn with_options(mut self, options: GenerationOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_sandbox(mut self, sandbox: Sandbox) -> Self {
        self.sandbox = sandbox;
        self
    }

    pub fn variable_scope(&self) -> &SharedScope {
        &self.variable
    }

    /// Fixed scope, current variable scope, then the uncommitted batch.
    fn namespace(&self, batch: &Batch) -> Namespace {
        Namespace::capture(&self.fixed, &self.variable).with_batch(batch)
    }

    /// Synthesize every function `source` calls that nothing defines.
    pub fn resolve(&self, source: &str) -> Result<Batch> {
        let mut batch = Batch::new();
        self.resolve_with(source, &mut batch)?;
        Ok(batch)
    }

    /// Like [`resolve`](Self::resolve), adding to an existing batch.
    ///
    /// Names already in `batch` are never requested again.
    pub fn resolve_with(&self, source: &str, batch: &mut Batch) -> Result<()> {
        let calls = extract_calls(source)?;
        let local: HashSet<String> = defined_functions(source)?.into_iter().collect();

        for (name, signature) in &calls {
            if local.contains(name) {
                continue;
            }
            self.synthesize(name, signature, batch)?;
        }
        Ok(())
    }

    /// Resolve one name from its call signature, recursively.
    ///
    /// Returns the final binding, which is also present in `batch`.
    pub fn synthesize(&self, name: &str, signature: &str, batch: &mut Batch) -> Result<Option<ScriptFn>> {
        if let Some(existing) = batch.get(name) {
            return Ok(Some(existing.clone()));
        }
        if self.namespace(batch).resolves(name) {
            return Ok(None);
        }

        let mut visiting = HashSet::new();
        let plan = self.plan(name, signature, batch, &mut visiting)?;
        self.materialize(plan, batch)?;

        Ok(batch.get(name).cloned())
    }

    /// Move a batch into the shared variable scope. Returns how many names were new.
    pub fn commit(&self, batch: Batch) -> usize {
        let mut variable = self.variable.borrow_mut();
        batch
            .into_iter()
            .filter(|(name, f)| variable.define(name.clone(), Binding::Script(f.clone())))
            .count()
    }

    // ========================================================================
    // Plan pass
    // ========================================================================

    fn plan(&self, name: &str, signature: &str, batch: &Batch, visiting: &mut HashSet<String>) -> Result<Plan> {
        visiting.insert(name.to_string());

        let source = self.request_definition(signature, batch)?;
        let defined = self
            .sandbox
            .define(&source, name, &self.namespace(batch))
            .map_err(|e| e.with_context("signature", signature))?;

        let body = function_body(&source, name)?
            .ok_or_else(|| Error::synthesis_binding(name).with_operation("synth::plan"))?;
        let calls = extract_calls(body)?;
        let local: HashSet<String> = defined_functions(&source)?.into_iter().collect();

        let mut children = Vec::new();
        for (child, child_signature) in &calls {
            if visiting.contains(child) || local.contains(child) || batch.contains_key(child) {
                continue;
            }
            if self.namespace(batch).resolves(child) {
                continue;
            }
            debug!(parent = %name, function = %child, "planning dependency");
            children.push(self.plan(child, child_signature, batch, visiting)?);
        }

        Ok(Plan {
            name: name.to_string(),
            source,
            defined,
            children,
        })
    }

    /// Helpers a definition may call: committed names, then this batch.
    fn import_names(&self, batch: &Batch) -> Vec<String> {
        let mut names = self.variable.borrow().names();
        for name in batch.keys() {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        names
    }

    fn request_definition(&self, signature: &str, batch: &Batch) -> Result<String> {
        let (prompt, query) = self.template.build("", "", signature, &self.import_names(batch));
        debug!(%signature, "requesting definition");

        let reply = self
            .backend
            .generate(&self.options.request(prompt))
            .map_err(|e| e.with_operation("synth::request_definition"))?;
        let source = extract(&reply)?;

        self.transcript.borrow_mut().record_created(&reply, &query, &source);
        Ok(source)
    }

    // ========================================================================
    // Materialize pass
    // ========================================================================

    fn materialize(&self, plan: Plan, batch: &mut Batch) -> Result<()> {
        let Plan {
            name,
            source,
            defined,
            children,
        } = plan;

        let rebuild = !children.is_empty();
        for child in children {
            self.materialize(child, batch)?;
        }
        if batch.contains_key(&name) {
            return Ok(());
        }

        let function = if rebuild {
            self.sandbox.define(&source, &name, &self.namespace(batch))?
        } else {
            defined
        };

        info!(function = %name, rebuilt = rebuild, "materialized function");
        batch.insert(name, function);
        Ok(())
    }
}

impl std::fmt::Debug for FunctionSynthesizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionSynthesizer")
            .field("template", &self.template)
            .field("options", &self.options)
            .field("sandbox", &self.sandbox)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::GenerateRequest;
    use crate::scope::{HostFn, VariableScope};
    use crate::transcript::{Entry, Transcript};
    use lmprog_error::ErrorKind;
    use rhai::Dynamic;
    use std::cell::RefCell;

    /// Replies keyed by a substring of the query line; records every prompt.
    struct StubBackend {
        replies: Vec<(&'static str, &'static str)>,
        prompts: RefCell<Vec<String>>,
    }

    impl StubBackend {
        fn new(replies: Vec<(&'static str, &'static str)>) -> Rc<Self> {
            Rc::new(Self {
                replies,
                prompts: RefCell::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.prompts.borrow().len()
        }
    }

    impl InferenceBackend for StubBackend {
        fn generate(&self, request: &GenerateRequest) -> Result<String> {
            self.prompts.borrow_mut().push(request.prompt.clone());
            let query = request.prompt.lines().last().unwrap_or_default();
            self.replies
                .iter()
                .find(|(key, _)| query.contains(key))
                .map(|(_, reply)| reply.to_string())
                .ok_or_else(|| Error::inference_failed(format!("no reply for {}", query)))
        }
    }

    fn synthesizer(backend: Rc<StubBackend>) -> FunctionSynthesizer {
        let fixed = FixedScope::builder()
            .host_fn(HostFn::new("get_obj_names", [0], |_| Ok(Dynamic::from(rhai::Array::new()))))
            .build();
        FunctionSynthesizer::new(
            PromptTemplate::new("// implement helper functions\n").with_query_decoration("// define function: ", "."),
            backend,
            fixed,
            VariableScope::shared(),
            Transcript::shared(),
        )
    }

    const PARENT: &str = "```rhai\nfn parent(x) {\n    child(x) * 10\n}\n```";
    const CHILD: &str = "```rhai\nfn child(x) {\n    x\n}\n```";

    #[test]
    fn test_recursive_materialization_order() {
        let backend = StubBackend::new(vec![("parent(", PARENT), ("child(", CHILD)]);
        let fgen = synthesizer(backend.clone());

        let batch = fgen.resolve("let total = parent(5);").unwrap();

        assert_eq!(batch.keys().collect::<Vec<_>>(), vec!["child", "parent"]);
        assert_eq!(backend.calls(), 2);

        let ns = fgen.namespace(&batch);
        let value = Sandbox::new()
            .call(&ns, "parent", vec![Dynamic::from(5_i64)])
            .unwrap();
        assert_eq!(value.as_int().unwrap(), 50);
    }

    #[test]
    fn test_prompt_is_template_then_decorated_signature() {
        let backend = StubBackend::new(vec![("child(", CHILD)]);
        let fgen = synthesizer(backend.clone());

        fgen.resolve("let y = child(2);").unwrap();

        assert_eq!(
            backend.prompts.borrow()[0],
            "// implement helper functions\n\n// define function: let y = child(2)."
        );
    }

    #[test]
    fn test_prompt_lists_callable_helpers() {
        let backend = StubBackend::new(vec![("child(", CHILD), ("other(", "```rhai\nfn other() { 1 }\n```")]);
        let fixed = FixedScope::builder().build();
        let variable = VariableScope::shared();
        variable
            .borrow_mut()
            .define("parse_obj_name", Binding::Value(Dynamic::from(1_i64)));
        let fgen = FunctionSynthesizer::new(
            PromptTemplate::new("{helper_imports}\n// helpers"),
            backend.clone(),
            fixed,
            variable,
            Transcript::shared(),
        );

        let mut batch = fgen.resolve("child(1);").unwrap();
        fgen.resolve_with("other();", &mut batch).unwrap();

        let prompts = backend.prompts.borrow();
        assert!(prompts[0].starts_with("// import helpers: parse_obj_name\n"));
        assert!(prompts[1].starts_with("// import helpers: parse_obj_name, child\n"));
    }

    #[test]
    fn test_idempotent_within_batch() {
        let backend = StubBackend::new(vec![("child(", CHILD)]);
        let fgen = synthesizer(backend.clone());

        let mut batch = Batch::new();
        fgen.resolve_with("let a = child(1);", &mut batch).unwrap();
        fgen.resolve_with("let b = child(2);", &mut batch).unwrap();
        let again = fgen.synthesize("child", "child(3)", &mut batch).unwrap();

        assert_eq!(backend.calls(), 1);
        assert_eq!(again.unwrap().name(), "child");
    }

    #[test]
    fn test_committed_names_are_not_requested_again() {
        let backend = StubBackend::new(vec![("child(", CHILD)]);
        let fgen = synthesizer(backend.clone());

        let batch = fgen.resolve("child(1);").unwrap();
        assert_eq!(fgen.commit(batch), 1);
        assert!(fgen.variable_scope().borrow().contains("child"));

        let batch = fgen.resolve("child(2);").unwrap();
        assert!(batch.is_empty());
        assert_eq!(backend.calls(), 1);
    }

    #[test]
    fn test_known_names_are_skipped() {
        let backend = StubBackend::new(vec![]);
        let fgen = synthesizer(backend.clone());

        let source = "fn local(x) { x }\nlet names = get_obj_names();\nprint(local(names));";
        let batch = fgen.resolve(source).unwrap();

        assert!(batch.is_empty());
        assert_eq!(backend.calls(), 0);
    }

    #[test]
    fn test_self_recursive_definition_terminates() {
        let backend = StubBackend::new(vec![(
            "fact(",
            "```rhai\nfn fact(n) {\n    if n <= 1 { 1 } else { n * fact(n - 1) }\n}\n```",
        )]);
        let fgen = synthesizer(backend.clone());

        let batch = fgen.resolve("let f = fact(4);").unwrap();

        assert_eq!(backend.calls(), 1);
        let value = Sandbox::new()
            .call(&fgen.namespace(&batch), "fact", vec![Dynamic::from(4_i64)])
            .unwrap();
        assert_eq!(value.as_int().unwrap(), 24);
    }

    #[test]
    fn test_definition_must_bind_requested_name() {
        let backend = StubBackend::new(vec![("parent(", CHILD)]);
        let fgen = synthesizer(backend);

        let err = fgen.resolve("parent(1);").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SynthesisBinding);
    }

    #[test]
    fn test_created_functions_are_logged() {
        let backend = StubBackend::new(vec![("parent(", PARENT), ("child(", CHILD)]);
        let fgen = synthesizer(backend);

        fgen.resolve("parent(1);").unwrap();

        let transcript = fgen.transcript.borrow();
        let created: Vec<&str> = transcript
            .entries()
            .iter()
            .filter_map(|entry| match entry {
                Entry::Created { query, .. } => Some(query.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(
            created,
            vec!["// define function: parent(1).", "// define function: child(x)."]
        );
    }
}
