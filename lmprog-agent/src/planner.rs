//! # Tabletop Planner
//!
//! Wires the capability set, the function synthesizer and the program units
//! into one hierarchy:
//!
//! ```text
//! tabletop_ui ──> parse_obj_name / parse_position / parse_question /
//!       │         transform_shape_pts / parse_completion
//!       └──────> capabilities (fixed scope)
//! ```
//!
//! Helper units are bound into the shared variable scope, so the top unit and
//! every synthesized function can call them by name.

use crate::capabilities::Capabilities;
use crate::checker::{frames_from_files, CompletionChecker, CHECKER_SYSTEM_PROMPT};
use crate::coords::TableCoords;
use crate::sim::SharedSimulator;
use lmprog_engine::error::io_error;
use lmprog_engine::{
    Binding, EngineConfig, Error, FixedScope, FunctionSynthesizer, InferenceBackend, ProgramUnit, Result,
    SharedScope, SharedTranscript, Transcript, UnitConfig, UnitOutput, VariableScope,
};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;
use tracing::{debug, info, warn};

pub const TOP_UNIT: &str = "tabletop_ui";
pub const FGEN_UNIT: &str = "fgen";
pub const CHECK_UNIT: &str = "vision_check";
pub const HELPER_UNITS: [&str; 5] = [
    "parse_obj_name",
    "parse_position",
    "parse_question",
    "transform_shape_pts",
    "parse_completion",
];

/// Appended to every episode goal
pub const EPISODE_NOTE: &str = " Write code to complete the task";
/// Appended after [`EPISODE_NOTE`] when the episode should verify itself
pub const CHECK_NOTE: &str = " Finally check the completion of task.";

/// Engine configuration plus the table geometry capabilities work in.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlannerConfig {
    #[serde(flatten)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub table: TableCoords,
}

impl PlannerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| io_error(path, e).with_operation("planner::load"))?;
        let mut config: PlannerConfig = toml::from_str(&content).map_err(|e| {
            Error::config_invalid(e.to_string())
                .with_operation("planner::load")
                .with_context("path", path.display().to_string())
        })?;
        config.engine.prepare(path.parent().unwrap_or(Path::new(".")))?;
        Ok(config)
    }
}

/// What one episode produced
#[derive(Debug)]
pub struct EpisodeOutcome {
    pub result: Option<UnitOutput>,
    pub error: Option<Error>,
    pub transcript: String,
}

impl EpisodeOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Decorate a raw goal the way episodes expect it.
pub fn episode_query(goal: &str, check: bool) -> String {
    let mut query = format!("{}{}", goal, EPISODE_NOTE);
    if check {
        query.push_str(CHECK_NOTE);
    }
    query
}

/// The context line every episode starts from: `let objects = [...];`
pub fn object_context(objects: &[String]) -> String {
    let quoted: Vec<String> = objects.iter().map(|o| format!("{:?}", o)).collect();
    format!("let objects = [{}];", quoted.join(", "))
}

type BackendFactory<'a> = dyn FnMut(&str, &UnitConfig) -> Result<Rc<dyn InferenceBackend>> + 'a;

pub struct Planner {
    config: PlannerConfig,
    transcript: SharedTranscript,
    variable: SharedScope,
    fgen: Rc<FunctionSynthesizer>,
    helpers: Vec<Rc<RefCell<ProgramUnit>>>,
    top: Rc<RefCell<ProgramUnit>>,
    checker: Option<RefCell<CompletionChecker>>,
}

impl Planner {
    /// Build the hierarchy with backends from the configured settings.
    ///
    /// Units without their own system prompt or backend kind share one
    /// backend; the checker defaults to the completion-checking prompt.
    pub fn setup(config: PlannerConfig, sim: SharedSimulator) -> Result<Self> {
        let settings = config.engine.backend.clone();
        let shared = settings.build(None)?;

        Self::setup_with(config, sim, &mut |name: &str, unit: &UnitConfig| -> Result<Rc<dyn InferenceBackend>> {
            let system_prompt = unit
                .system_prompt
                .as_deref()
                .or((name == CHECK_UNIT).then_some(CHECKER_SYSTEM_PROMPT));
            if system_prompt.is_none() && unit.backend_kind.is_none() {
                return Ok(shared.clone());
            }
            settings.for_unit(unit).build(system_prompt)
        })
    }

    /// Build the hierarchy, asking `backend_for` for each unit's backend.
    pub fn setup_with(config: PlannerConfig, sim: SharedSimulator, backend_for: &mut BackendFactory<'_>) -> Result<Self> {
        let transcript = Transcript::shared();
        let capabilities = Capabilities::new(sim, config.table.clone(), transcript.clone());
        let fixed = capabilities.fixed_scope();
        let variable = VariableScope::shared();

        let fgen_config = config.engine.unit(FGEN_UNIT)?;
        let fgen = Rc::new(
            FunctionSynthesizer::new(
                fgen_config.template(),
                backend_for(FGEN_UNIT, fgen_config)?,
                fixed.clone(),
                variable.clone(),
                transcript.clone(),
            )
            .with_options(fgen_config.options())
            .with_sandbox(fgen_config.sandbox()),
        );

        let parts = UnitParts {
            engine: &config.engine,
            fixed: &fixed,
            fgen: &fgen,
            transcript: &transcript,
        };

        let mut helpers = Vec::with_capacity(HELPER_UNITS.len());
        for name in HELPER_UNITS {
            let unit = parts.build(name, backend_for)?;
            variable
                .borrow_mut()
                .define(name, Binding::Native(ProgramUnit::binding(&unit)));
            helpers.push(unit);
        }
        let top = parts.build(TOP_UNIT, backend_for)?;

        let checker = match config.engine.units.get(CHECK_UNIT) {
            Some(unit_config) => {
                let behavior = unit_config.behavior();
                let mut checker = CompletionChecker::new(
                    CHECK_UNIT,
                    unit_config.template(),
                    backend_for(CHECK_UNIT, unit_config)?,
                    transcript.clone(),
                )
                .with_options(unit_config.options())
                .with_debug_mode(behavior.debug_mode)
                .with_sandbox(unit_config.sandbox());
                if let Some(name) = behavior.return_val_name {
                    checker = checker.with_verdict_name(name);
                }
                Some(RefCell::new(checker))
            }
            None => None,
        };

        info!(
            helpers = helpers.len(),
            checker = checker.is_some(),
            fixed = fixed.names().count(),
            "planner ready"
        );

        Ok(Self {
            config,
            transcript,
            variable,
            fgen,
            helpers,
            top,
            checker,
        })
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    pub fn transcript(&self) -> &SharedTranscript {
        &self.transcript
    }

    pub fn variable_scope(&self) -> &SharedScope {
        &self.variable
    }

    pub fn synthesizer(&self) -> &Rc<FunctionSynthesizer> {
        &self.fgen
    }

    /// The prompt the top unit would receive for `goal`.
    pub fn prompt(&self, goal: &str, objects: &[String], check: bool) -> String {
        self.top.borrow().prompt(&episode_query(goal, check), &object_context(objects))
    }

    /// Run one episode.
    ///
    /// Unit histories and the transcript start empty; functions synthesized
    /// by earlier episodes stay bound. Failures are recorded in the transcript
    /// and returned in the outcome rather than propagated.
    pub fn run_episode(&self, goal: &str, objects: &[String], check: bool) -> EpisodeOutcome {
        self.transcript.borrow_mut().reset();
        for unit in self.helpers.iter().chain(std::iter::once(&self.top)) {
            if let Ok(mut unit) = unit.try_borrow_mut() {
                unit.reset_history();
            }
        }

        let query = episode_query(goal, check);
        let context = object_context(objects);
        debug!(%query, %context, "starting episode");

        let invoked = match self.top.try_borrow_mut() {
            Ok(mut top) => top.invoke(&query, &context, &[]),
            Err(_) => Err(Error::reentrant(TOP_UNIT)),
        };

        let (result, error) = match invoked {
            Ok(result) => (result, None),
            Err(e) => {
                warn!(error = %e, "episode failed");
                self.transcript.borrow_mut().note(e.to_string());
                (None, Some(e))
            }
        };

        EpisodeOutcome {
            result,
            error,
            transcript: self.transcript.borrow().text(),
        }
    }

    /// Ask the completion checker whether `goal` was achieved.
    pub fn check(&self, goal: &str, image_paths: &[impl AsRef<Path>]) -> Result<bool> {
        let checker = self.checker.as_ref().ok_or_else(|| {
            Error::config_invalid(format!("no configuration for unit '{}'", CHECK_UNIT))
                .with_operation("planner::check")
        })?;
        let frames = frames_from_files(image_paths)?;
        checker.borrow_mut().check(goal, frames)
    }
}

/// Shared pieces every unit of the hierarchy is built from
struct UnitParts<'a> {
    engine: &'a EngineConfig,
    fixed: &'a Rc<FixedScope>,
    fgen: &'a Rc<FunctionSynthesizer>,
    transcript: &'a SharedTranscript,
}

impl UnitParts<'_> {
    fn build(&self, name: &str, backend_for: &mut BackendFactory<'_>) -> Result<Rc<RefCell<ProgramUnit>>> {
        let unit_config = self.engine.unit(name)?;
        let unit = ProgramUnit::new(
            name,
            unit_config.template(),
            backend_for(name, unit_config)?,
            self.fixed.clone(),
            self.fgen.clone(),
            self.transcript.clone(),
        )
        .with_options(unit_config.options())
        .with_behavior(unit_config.behavior())
        .with_sandbox(unit_config.sandbox());
        Ok(Rc::new(RefCell::new(unit)))
    }
}

impl std::fmt::Debug for Planner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Planner")
            .field("helpers", &self.helpers.len())
            .field("variables", &self.variable.borrow().names())
            .field("checker", &self.checker.is_some())
            .finish()
    }
}

/// A fixed scope with nothing but the capability set, for tools that only
/// need to inspect what generated code may call.
pub fn capability_scope(sim: SharedSimulator, table: TableCoords) -> Rc<FixedScope> {
    Capabilities::new(sim, table, Transcript::shared()).fixed_scope()
}
