//! # Sandboxed Executor
//!
//! Runs a script against a [`Namespace`] and reports the bindings it made.
//!
//! The guard is narrow: import statements are stripped, double-underscore
//! identifiers are refused, and `eval` / `exec` do nothing. Everything in the
//! namespace is callable, and its values are readable from top-level code and
//! from script functions alike. This is not a capability sandbox.

use crate::error::{parse_failed, script_failed, Error, Result};
use crate::scope::{Binding, HostFn, Namespace, ScriptFn, MAX_HOST_ARITY};
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use rhai::{Dynamic, Engine, EvalAltResult, Scope, AST};
use std::collections::HashMap;
use tracing::{debug, info};

static IMPORT_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^[ \t]*import\s.*$").expect("Invalid import regex"));

static EVAL_CALL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\beval\s*\(").expect("Invalid eval regex"));

/// Name `eval(` call sites are rewritten to.
const NOOP_EVAL: &str = "noop_eval";

/// What a run left behind.
#[derive(Debug, Clone, Default)]
pub struct Execution {
    /// `fn` items defined by the script, in definition order
    pub functions: IndexMap<String, ScriptFn>,
    /// Top-level variables, including caller-supplied locals
    pub locals: IndexMap<String, Dynamic>,
}

#[derive(Debug, Clone, Default)]
pub struct Sandbox {
    max_operations: Option<u64>,
    max_call_levels: Option<usize>,
}

impl Sandbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_operations(mut self, max: u64) -> Self {
        self.max_operations = Some(max);
        self
    }

    pub fn with_max_call_levels(mut self, max: usize) -> Self {
        self.max_call_levels = Some(max);
        self
    }

    /// Run `source` with `locals` pushed after every namespace value.
    pub fn run(&self, source: &str, namespace: &Namespace, locals: &[(String, Dynamic)]) -> Result<Execution> {
        let script = prepare(source)?;
        let engine = self.engine(namespace)?;
        let snippet = engine
            .compile(&script)
            .map_err(|e| parse_failed(e).with_operation("sandbox::run"))?;

        let mut scope = Scope::new();
        let library = load_namespace(namespace, &mut scope);
        let base = scope.len();
        for (name, value) in locals {
            scope.push_dynamic(name.clone(), value.clone());
        }

        debug!(lines = script.lines().count(), "executing script");
        engine
            .run_ast_with_scope(&mut scope, &library.merge(&snippet))
            .map_err(|e| script_failed(e).with_operation("sandbox::run"))?;

        let functions = snippet
            .iter_functions()
            .map(|f| (f.name.to_string(), ScriptFn::new(f.name, script.clone(), &snippet)))
            .collect();
        let locals = scope
            .iter()
            .skip(base)
            .map(|(name, _, value)| (name.to_string(), value))
            .collect();

        Ok(Execution { functions, locals })
    }

    /// Run a definition and return the function it binds under `name`.
    pub fn define(&self, source: &str, name: &str, namespace: &Namespace) -> Result<ScriptFn> {
        let mut execution = self.run(source, namespace, &[])?;
        execution
            .functions
            .shift_remove(name)
            .ok_or_else(|| Error::synthesis_binding(name).with_operation("sandbox::define"))
    }

    /// Call a script function of the namespace directly.
    pub fn call(&self, namespace: &Namespace, name: &str, args: Vec<Dynamic>) -> Result<Dynamic> {
        let engine = self.engine(namespace)?;
        let mut scope = Scope::new();
        let library = load_namespace(namespace, &mut scope);
        engine
            .call_fn::<Dynamic>(&mut scope, &library, name, args)
            .map_err(|e| {
                script_failed(e)
                    .with_operation("sandbox::call")
                    .with_context("function", name)
            })
    }

    fn engine(&self, namespace: &Namespace) -> Result<Engine> {
        let mut engine = Engine::new();
        engine.set_module_resolver(rhai::module_resolvers::DummyModuleResolver::new());
        engine.on_print(|text| info!(target: "lmprog::script", "{}", text));
        engine.on_debug(|text, _source, pos| debug!(target: "lmprog::script", %pos, "{}", text));

        if let Some(max) = self.max_operations {
            engine.set_max_operations(max);
        }
        if let Some(max) = self.max_call_levels {
            engine.set_max_call_levels(max);
        }

        for (_, binding, _) in namespace.bindings() {
            if let Binding::Native(f) = binding {
                register_host_fn(&mut engine, f)?;
            }
        }

        // Script functions never see the caller's scope; they reach
        // namespace values through the resolver instead.
        let values = namespace_values(namespace);
        if !values.is_empty() {
            engine.on_var(move |name, index, context| {
                if index > 0 || context.scope().contains(name) {
                    return Ok(None);
                }
                Ok(values.get(name).cloned())
            });
        }

        for arity in 0..=3 {
            register_host_fn(&mut engine, &noop("exec", arity))?;
            register_host_fn(&mut engine, &noop(NOOP_EVAL, arity))?;
        }

        Ok(engine)
    }
}

/// Apply the source-level guards.
fn prepare(source: &str) -> Result<String> {
    if source.contains("__") {
        return Err(Error::forbidden_identifier().with_operation("sandbox::prepare"));
    }
    let stripped = IMPORT_LINE.replace_all(source, "");
    Ok(EVAL_CALL
        .replace_all(&stripped, format!("{}(", NOOP_EVAL).as_str())
        .into_owned())
}

/// Push values into `scope` and gather script functions into one library.
fn load_namespace(namespace: &Namespace, scope: &mut Scope) -> AST {
    let mut library = AST::empty();
    for (name, binding, fixed) in namespace.bindings() {
        match binding {
            Binding::Native(_) => {}
            Binding::Script(f) => {
                library.combine(f.ast().clone());
            }
            Binding::Value(value) if fixed => {
                scope.push_constant_dynamic(name.to_string(), value.clone());
            }
            Binding::Value(value) => {
                scope.push_dynamic(name.to_string(), value.clone());
            }
        }
    }
    library
}

/// Every value binding, later layers shadowing earlier ones.
fn namespace_values(namespace: &Namespace) -> HashMap<String, Dynamic> {
    namespace
        .bindings()
        .filter_map(|(name, binding, _)| match binding {
            Binding::Value(value) => Some((name.to_string(), value.clone())),
            _ => None,
        })
        .collect()
}

fn noop(name: &str, arity: usize) -> HostFn {
    HostFn::new(name, [arity], |_| Ok(Dynamic::UNIT))
}

fn register_host_fn(engine: &mut Engine, f: &HostFn) -> Result<()> {
    for &arity in f.arities() {
        let name = f.name().to_string();
        let host = f.clone();
        match arity {
            0 => {
                engine.register_fn(name, move || forward(&host, &[]));
            }
            1 => {
                engine.register_fn(name, move |a: Dynamic| forward(&host, &[a]));
            }
            2 => {
                engine.register_fn(name, move |a: Dynamic, b: Dynamic| forward(&host, &[a, b]));
            }
            3 => {
                engine.register_fn(name, move |a: Dynamic, b: Dynamic, c: Dynamic| {
                    forward(&host, &[a, b, c])
                });
            }
            4 => {
                engine.register_fn(name, move |a: Dynamic, b: Dynamic, c: Dynamic, d: Dynamic| {
                    forward(&host, &[a, b, c, d])
                });
            }
            5 => {
                engine.register_fn(
                    name,
                    move |a: Dynamic, b: Dynamic, c: Dynamic, d: Dynamic, e: Dynamic| {
                        forward(&host, &[a, b, c, d, e])
                    },
                );
            }
            6 => {
                engine.register_fn(
                    name,
                    move |a: Dynamic, b: Dynamic, c: Dynamic, d: Dynamic, e: Dynamic, g: Dynamic| {
                        forward(&host, &[a, b, c, d, e, g])
                    },
                );
            }
            _ => {
                return Err(Error::unsupported(format!(
                    "host function '{}' takes {} arguments, at most {} are supported",
                    f.name(),
                    arity,
                    MAX_HOST_ARITY
                ))
                .with_operation("sandbox::register_host_fn"));
            }
        }
    }
    Ok(())
}

fn forward(host: &HostFn, args: &[Dynamic]) -> std::result::Result<Dynamic, Box<EvalAltResult>> {
    host.call(args).map_err(|message| message.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::{Batch, FixedScope, VariableScope};
    use lmprog_error::ErrorKind;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn fixed_with_log(log: Rc<RefCell<Vec<String>>>) -> Rc<FixedScope> {
        FixedScope::builder()
            .host_fn(HostFn::new("say", [1], move |args| {
                log.borrow_mut().push(args[0].to_string());
                Ok(Dynamic::UNIT)
            }))
            .constant("table_z", Dynamic::from(0.0_f64))
            .build()
    }

    #[test]
    fn test_locals_and_functions_are_reported() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let ns = Namespace::new(fixed_with_log(log.clone()));
        let locals = vec![("objects".to_string(), Dynamic::from(vec![Dynamic::from("red block".to_string())]))];

        let execution = Sandbox::new()
            .run(
                "fn double(x) { x * 2 }\nlet n = objects.len();\nlet d = double(n);\nsay(`count ${d}`);",
                &ns,
                &locals,
            )
            .unwrap();

        assert_eq!(execution.locals["d"].as_int().unwrap(), 2);
        assert!(execution.locals.contains_key("objects"));
        assert!(!execution.locals.contains_key("table_z"));
        assert!(execution.functions.contains_key("double"));
        assert_eq!(log.borrow().as_slice(), ["count 2"]);
    }

    #[test]
    fn test_double_underscore_rejected_before_running() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let ns = Namespace::new(fixed_with_log(log.clone()));

        let err = Sandbox::new().run("say(\"ran\");\nlet __x = 1;", &ns, &[]).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ForbiddenIdentifier);
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn test_imports_stripped() {
        let ns = Namespace::new(FixedScope::builder().build());
        let execution = Sandbox::new()
            .run("import \"os\" as os;\n  import \"fs\";\nlet ok = true;", &ns, &[])
            .unwrap();
        assert!(execution.locals["ok"].as_bool().unwrap());
    }

    #[test]
    fn test_eval_and_exec_are_noops() {
        let ns = Namespace::new(FixedScope::builder().build());
        let execution = Sandbox::new()
            .run("let x = 1;\neval(\"x = 99\");\nexec(\"x = 42\");\nlet r = eval(\"5\");", &ns, &[])
            .unwrap();
        assert_eq!(execution.locals["x"].as_int().unwrap(), 1);
        assert!(execution.locals["r"].is_unit());
    }

    #[test]
    fn test_define_requires_name() {
        let ns = Namespace::new(FixedScope::builder().build());
        let sandbox = Sandbox::new();

        let f = sandbox.define("fn area(w, h) { w * h }", "area", &ns).unwrap();
        assert_eq!(f.name(), "area");

        let err = sandbox.define("fn other() { 1 }", "area", &ns).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SynthesisBinding);
    }

    #[test]
    fn test_script_functions_from_namespace_are_callable() {
        let ns = Namespace::new(FixedScope::builder().build());
        let sandbox = Sandbox::new();
        let child = sandbox.define("fn child(x) { x + 1 }", "child", &ns).unwrap();

        let mut batch = Batch::new();
        batch.insert("child".into(), child);
        let ns = ns.with_batch(&batch);
        let parent = sandbox.define("fn parent(x) { child(x) * 10 }", "parent", &ns).unwrap();
        batch.insert("parent".into(), parent);

        let ns = Namespace::new(FixedScope::builder().build()).with_batch(&batch);
        let value = sandbox.call(&ns, "parent", vec![Dynamic::from(4_i64)]).unwrap();
        assert_eq!(value.as_int().unwrap(), 50);
    }

    #[test]
    fn test_variable_values_are_visible() {
        let fixed = FixedScope::builder().build();
        let variable = VariableScope::shared();
        variable
            .borrow_mut()
            .define("offset", Binding::Value(Dynamic::from(3_i64)));

        let ns = Namespace::capture(&fixed, &variable);
        let execution = Sandbox::new().run("let y = offset + 1;", &ns, &[]).unwrap();
        assert_eq!(execution.locals["y"].as_int().unwrap(), 4);
    }

    #[test]
    fn test_functions_read_namespace_values() {
        let fixed = FixedScope::builder().constant("table_z", Dynamic::from(0.5_f64)).build();
        let variable = VariableScope::shared();
        variable
            .borrow_mut()
            .define("offset", Binding::Value(Dynamic::from(2.0_f64)));
        let ns = Namespace::capture(&fixed, &variable);
        let sandbox = Sandbox::new();

        let lift = sandbox.define("fn lift(z) { z + table_z + offset }", "lift", &ns).unwrap();
        let own = sandbox
            .define("fn own(table_z) { let offset = 10.0; table_z + offset }", "own", &ns)
            .unwrap();
        let mut batch = Batch::new();
        batch.insert("lift".into(), lift);
        batch.insert("own".into(), own);
        let ns = ns.with_batch(&batch);

        let execution = sandbox.run("let y = lift(1.0);\nlet w = own(1.0);", &ns, &[]).unwrap();
        assert_eq!(execution.locals["y"].as_float().unwrap(), 3.5);
        assert_eq!(execution.locals["w"].as_float().unwrap(), 11.0);

        let value = sandbox.call(&ns, "lift", vec![Dynamic::from(0.0_f64)]).unwrap();
        assert_eq!(value.as_float().unwrap(), 2.5);
    }

    #[test]
    fn test_missing_value_still_fails() {
        let ns = Namespace::new(FixedScope::builder().build());
        let sandbox = Sandbox::new();
        let f = sandbox.define("fn read() { nowhere }", "read", &ns).unwrap();
        let mut batch = Batch::new();
        batch.insert("read".into(), f);

        let err = sandbox.call(&ns.with_batch(&batch), "read", vec![]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ScriptFailed);
    }

    #[test]
    fn test_runtime_error_is_script_failure() {
        let ns = Namespace::new(FixedScope::builder().build());
        let err = Sandbox::new().run("let x = missing_fn(1);", &ns, &[]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ScriptFailed);
    }

    #[test]
    fn test_operation_limit() {
        let ns = Namespace::new(FixedScope::builder().build());
        let err = Sandbox::new()
            .with_max_operations(1_000)
            .run("let i = 0;\nloop { i += 1; }", &ns, &[])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ScriptFailed);
    }
}
