//! # Scopes
//!
//! Two tiers of bindings visible to generated scripts:
//!
//! - [`FixedScope`]: host capabilities and constants, built once per setup
//!   pass and shared read-only by every unit.
//! - [`VariableScope`]: synthesized functions, other program units and
//!   session results, shared by reference between all units of a setup pass.
//!
//! Execution never borrows the shared variable scope directly; it works on a
//! [`Namespace`], an owned snapshot layered `fixed -> variable -> overlays`.

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use rhai::{Dynamic, AST};
use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt;
use std::rc::Rc;

/// Native callables accept at most this many arguments.
pub const MAX_HOST_ARITY: usize = 6;

type NativeCall = Rc<dyn Fn(&[Dynamic]) -> std::result::Result<Dynamic, String>>;

/// A named native function exposed to scripts.
#[derive(Clone)]
pub struct HostFn {
    name: String,
    arities: Vec<usize>,
    call: NativeCall,
}

impl HostFn {
    /// `arities` lists every argument count the function accepts.
    pub fn new(
        name: impl Into<String>,
        arities: impl Into<Vec<usize>>,
        call: impl Fn(&[Dynamic]) -> std::result::Result<Dynamic, String> + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            arities: arities.into(),
            call: Rc::new(call),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arities(&self) -> &[usize] {
        &self.arities
    }

    pub fn call(&self, args: &[Dynamic]) -> std::result::Result<Dynamic, String> {
        (self.call)(args)
    }
}

impl fmt::Debug for HostFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostFn")
            .field("name", &self.name)
            .field("arities", &self.arities)
            .finish()
    }
}

/// A script-defined function, kept with the source it came from.
#[derive(Debug, Clone)]
pub struct ScriptFn {
    name: String,
    source: String,
    ast: AST,
}

impl ScriptFn {
    /// Only the function definitions of `ast` are kept.
    pub fn new(name: impl Into<String>, source: impl Into<String>, ast: &AST) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            ast: ast.clone_functions_only(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn ast(&self) -> &AST {
        &self.ast
    }
}

#[derive(Debug, Clone)]
pub enum Binding {
    Native(HostFn),
    Script(ScriptFn),
    Value(Dynamic),
}

impl Binding {
    pub fn is_native(&self) -> bool {
        matches!(self, Binding::Native(_))
    }
}

/// Functions resolved since the start of one synthesis batch, not yet committed.
pub type Batch = IndexMap<String, ScriptFn>;

// ============================================================================
// Builtins
// ============================================================================

/// Keyword functions Rhai resolves itself.
const KEYWORD_FUNCTIONS: &[&str] = &[
    "print", "debug", "type_of", "Fn", "call", "curry", "eval", "is_def_var", "is_def_fn",
    "is_shared",
];

static BUILTINS: Lazy<HashSet<String>> = Lazy::new(|| {
    let mut names: HashSet<String> = rhai::Engine::new()
        .gen_fn_signatures(true)
        .into_iter()
        .filter_map(|signature| {
            let head = signature.split('(').next()?;
            let name = head.rsplit(|c: char| c.is_whitespace() || c == ':' || c == '.').next()?;
            let valid = !name.is_empty()
                && name.chars().all(|c| c == '_' || c.is_ascii_alphanumeric())
                && !name.starts_with(|c: char| c.is_ascii_digit());
            valid.then(|| name.to_string())
        })
        .collect();
    names.extend(KEYWORD_FUNCTIONS.iter().map(|s| s.to_string()));
    names
});

/// Whether `name` is a function of the Rhai standard packages.
pub fn is_builtin(name: &str) -> bool {
    BUILTINS.contains(name)
}

// ============================================================================
// Fixed scope
// ============================================================================

/// Read-only capability bindings.
#[derive(Debug, Default)]
pub struct FixedScope {
    bindings: IndexMap<String, Binding>,
}

impl FixedScope {
    pub fn builder() -> FixedScopeBuilder {
        FixedScopeBuilder::default()
    }

    pub fn lookup(&self, name: &str) -> Option<&Binding> {
        self.bindings.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.bindings.keys().map(|s| s.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Binding)> {
        self.bindings.iter().map(|(k, v)| (k.as_str(), v))
    }
}

#[derive(Debug, Default)]
pub struct FixedScopeBuilder {
    bindings: IndexMap<String, Binding>,
}

impl FixedScopeBuilder {
    pub fn host_fn(mut self, f: HostFn) -> Self {
        self.bindings.insert(f.name().to_string(), Binding::Native(f));
        self
    }

    pub fn host_fns(mut self, fns: impl IntoIterator<Item = HostFn>) -> Self {
        for f in fns {
            self = self.host_fn(f);
        }
        self
    }

    pub fn constant(mut self, name: impl Into<String>, value: Dynamic) -> Self {
        self.bindings.insert(name.into(), Binding::Value(value));
        self
    }

    pub fn build(self) -> Rc<FixedScope> {
        Rc::new(FixedScope {
            bindings: self.bindings,
        })
    }
}

// ============================================================================
// Variable scope
// ============================================================================

/// Runtime-populated bindings, shared by every unit of one setup pass.
#[derive(Debug, Default)]
pub struct VariableScope {
    bindings: IndexMap<String, Binding>,
}

pub type SharedScope = Rc<RefCell<VariableScope>>;

impl VariableScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedScope {
        Rc::new(RefCell::new(Self::new()))
    }

    /// Add a binding once. Returns false, leaving the first binding in
    /// place, when the name is already bound.
    pub fn define(&mut self, name: impl Into<String>, binding: Binding) -> bool {
        let name = name.into();
        if self.bindings.contains_key(&name) {
            return false;
        }
        self.bindings.insert(name, binding);
        true
    }

    /// Session update: overwrite values and script functions, never natives.
    pub fn fold(&mut self, name: impl Into<String>, binding: Binding) -> bool {
        let name = name.into();
        if self.bindings.get(&name).is_some_and(Binding::is_native) {
            return false;
        }
        self.bindings.insert(name, binding);
        true
    }

    pub fn get(&self, name: &str) -> Option<&Binding> {
        self.bindings.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.bindings.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.bindings.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn snapshot(&self) -> IndexMap<String, Binding> {
        self.bindings.clone()
    }
}

// ============================================================================
// Namespace
// ============================================================================

/// Layered, owned view of everything a script can see.
///
/// Later layers shadow earlier ones; the fixed scope is the base.
#[derive(Debug, Clone)]
pub struct Namespace {
    fixed: Rc<FixedScope>,
    layers: Vec<IndexMap<String, Binding>>,
}

impl Namespace {
    /// Just the fixed scope
    pub fn new(fixed: Rc<FixedScope>) -> Self {
        Self {
            fixed,
            layers: Vec::new(),
        }
    }

    /// Fixed scope plus a snapshot of the shared variable scope
    pub fn capture(fixed: &Rc<FixedScope>, variable: &SharedScope) -> Self {
        Self::new(fixed.clone()).with_layer(variable.borrow().snapshot())
    }

    pub fn with_layer(mut self, layer: IndexMap<String, Binding>) -> Self {
        self.layers.push(layer);
        self
    }

    pub fn with_batch(self, batch: &Batch) -> Self {
        let layer = batch
            .iter()
            .map(|(name, f)| (name.clone(), Binding::Script(f.clone())))
            .collect();
        self.with_layer(layer)
    }

    pub fn lookup(&self, name: &str) -> Option<&Binding> {
        self.layers
            .iter()
            .rev()
            .find_map(|layer| layer.get(name))
            .or_else(|| self.fixed.lookup(name))
    }

    /// Explicit existence check: bound in some layer, or a Rhai builtin.
    pub fn resolves(&self, name: &str) -> bool {
        self.lookup(name).is_some() || is_builtin(name)
    }

    /// Every binding, base first, each tagged with whether it comes from the fixed scope.
    pub fn bindings(&self) -> impl Iterator<Item = (&str, &Binding, bool)> {
        self.fixed
            .iter()
            .map(|(name, binding)| (name, binding, true))
            .chain(
                self.layers
                    .iter()
                    .flat_map(|layer| layer.iter().map(|(k, v)| (k.as_str(), v, false))),
            )
    }
}
