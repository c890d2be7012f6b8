//! # lmprog CLI
//!
//! Command-line interface for the tabletop planner.
//!
//! Usage:
//!   lmprog run <goal>...
//!   lmprog prompt <goal>...
//!   lmprog calls <file.rhai>
//!   lmprog exec <file.rhai>
//!   lmprog check <goal>... --images <rgb0> <depth0> <rgb1> <depth1>
//!
//! Examples:
//!   lmprog run -o "red block,blue block,green bowl" "put the red block in the bowl"
//!   lmprog run --check --out runs/episode1.txt "stack all the blocks"
//!   lmprog prompt "put the blocks in a line"
//!   lmprog calls plan.rhai --json

use clap::{Parser, Subcommand};
use lmprog_agent::{
    capability_scope, Planner, PlannerConfig, SharedSimulator, Simulator, TableCoords, TableTop, CHECK_UNIT, TOP_UNIT,
};
use lmprog_engine::{extract_calls, Error, GenerateRequest, InferenceBackend, Namespace, Result, Sandbox, UnitConfig};
use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tracing_subscriber::EnvFilter;

const DEFAULT_OBJECTS: &str = "blue block,red block,green block,yellow bowl,green bowl";

#[derive(Parser)]
#[command(name = "lmprog")]
#[command(author, version, about = "lmprog - language-model programs for a tabletop robot")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Planner configuration
    #[arg(short, long, global = true, default_value = "lmprog.toml")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one episode
    Run {
        /// The goal, in plain words
        #[arg(trailing_var_arg = true, required = true)]
        goal: Vec<String>,

        /// Objects on the table, comma separated
        #[arg(short, long, value_delimiter = ',', default_value = DEFAULT_OBJECTS)]
        objects: Vec<String>,

        /// Ask the planner to verify completion at the end
        #[arg(long)]
        check: bool,

        /// Print generated code without executing it
        #[arg(long)]
        debug: bool,

        /// Write the transcript here
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Show the prompt the top unit would receive
    Prompt {
        #[arg(trailing_var_arg = true, required = true)]
        goal: Vec<String>,

        #[arg(short, long, value_delimiter = ',', default_value = DEFAULT_OBJECTS)]
        objects: Vec<String>,

        #[arg(long)]
        check: bool,
    },
    /// List the calls a script makes
    Calls {
        file: PathBuf,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Execute a script against the robot capabilities on a fresh table
    Exec {
        file: PathBuf,

        #[arg(short, long, value_delimiter = ',', default_value = DEFAULT_OBJECTS)]
        objects: Vec<String>,
    },
    /// Judge completion from before/after color and depth frames
    Check {
        #[arg(trailing_var_arg = true, required = true)]
        goal: Vec<String>,

        /// Color before, depth before, color after, depth after
        #[arg(long, num_args = 4, required = true)]
        images: Vec<PathBuf>,
    },
}

/// Backend for commands that never generate
struct Offline;

impl InferenceBackend for Offline {
    fn generate(&self, _request: &GenerateRequest) -> Result<String> {
        Err(Error::unsupported("generation is disabled for this command").with_operation("cli::offline"))
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug,reqwest=info,hyper=info,hyper_util=info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,reqwest=warn,hyper=warn"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn table(objects: &[String], coords: &TableCoords) -> SharedSimulator {
    Rc::new(RefCell::new(TableTop::layout(objects, coords)))
}

fn load_config(path: &Path) -> PlannerConfig {
    match PlannerConfig::load(path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading {}: {}", path.display(), e);
            std::process::exit(1);
        }
    }
}

fn read_source(path: &Path) -> String {
    match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("Error reading {}: {}", path.display(), e);
            std::process::exit(1);
        }
    }
}

fn fail(e: Error) -> ! {
    eprintln!("Error: {}", e);
    std::process::exit(1);
}

fn run_episode(config: &Path, goal: &str, objects: &[String], check: bool, debug: bool, out: Option<&Path>) {
    let mut config = load_config(config);
    if debug {
        if let Some(top) = config.engine.units.get_mut(TOP_UNIT) {
            top.debug_mode = true;
        }
    }

    let sim = table(objects, &config.table);
    let planner = Planner::setup(config, sim).unwrap_or_else(|e| fail(e));
    let outcome = planner.run_episode(goal, objects, check);

    println!("{}", outcome.transcript);
    if let Some(path) = out {
        if let Err(e) = planner.transcript().borrow().flush(path) {
            eprintln!("Error writing transcript: {}", e);
        }
    }

    match outcome.error {
        None => {
            if let Some(result) = outcome.result {
                println!("\n--- RESULT ---\n");
                println!("{}", result.into_dynamic());
            }
        }
        Some(e) => {
            eprintln!("\n=== EPISODE FAILED ===\n");
            fail(e);
        }
    }
}

fn show_prompt(config: &Path, goal: &str, objects: &[String], check: bool) {
    let config = load_config(config);
    let sim = table(objects, &config.table);
    let planner = Planner::setup_with(config, sim, &mut |_: &str, _: &UnitConfig| -> Result<Rc<dyn InferenceBackend>> {
        Ok(Rc::new(Offline))
    })
    .unwrap_or_else(|e| fail(e));
    println!("{}", planner.prompt(goal, objects, check));
}

fn show_calls(file: &Path, json: bool) {
    let calls = extract_calls(&read_source(file)).unwrap_or_else(|e| fail(e));
    if json {
        let map: serde_json::Map<String, serde_json::Value> = calls
            .into_iter()
            .map(|(name, signature)| (name, serde_json::Value::String(signature)))
            .collect();
        println!("{}", serde_json::to_string_pretty(&map).unwrap_or_default());
        return;
    }
    if calls.is_empty() {
        println!("(no calls)");
    }
    for (name, signature) in &calls {
        println!("  {:24} {}", name, signature);
    }
}

fn exec_script(config: &Path, file: &Path, objects: &[String]) {
    let coords = if config.exists() {
        load_config(config).table
    } else {
        TableCoords::default()
    };
    let sim = table(objects, &coords);
    let namespace = Namespace::new(capability_scope(sim.clone(), coords));
    let source = format!("{}\n{}", lmprog_agent::object_context(objects), read_source(file));

    let execution = Sandbox::new().run(&source, &namespace, &[]).unwrap_or_else(|e| fail(e));
    for f in execution.functions.values() {
        println!("  fn {}", f.name());
    }
    for (name, value) in &execution.locals {
        println!("  {} = {}", name, value);
    }

    let sim = sim.borrow();
    println!("\n--- Table ({} objects) ---", sim.object_names().len());
    for name in sim.object_names() {
        if let Ok(poses) = sim.object_poses(&name) {
            for pose in poses {
                let [x, y, z] = pose.position;
                println!("  {:20} [{:.3}, {:.3}, {:.3}]", name, x, y, z);
            }
        }
    }
}

fn check_completion(path: &Path, goal: &str, images: &[PathBuf]) {
    let config = load_config(path);
    if !config.engine.units.contains_key(CHECK_UNIT) {
        eprintln!("Error: {} has no [units.{}] section", path.display(), CHECK_UNIT);
        std::process::exit(1);
    }
    let sim = table(&[], &config.table);
    let planner = Planner::setup(config, sim).unwrap_or_else(|e| fail(e));
    let done = planner.check(goal, images).unwrap_or_else(|e| fail(e));
    println!("{}", if done { "completed" } else { "not completed" });
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Run {
            goal,
            objects,
            check,
            debug,
            out,
        } => run_episode(&cli.config, &goal.join(" "), &objects, check, debug, out.as_deref()),
        Commands::Prompt { goal, objects, check } => show_prompt(&cli.config, &goal.join(" "), &objects, check),
        Commands::Calls { file, json } => show_calls(&file, json),
        Commands::Exec { file, objects } => exec_script(&cli.config, &file, &objects),
        Commands::Check { goal, images } => check_completion(&cli.config, &goal.join(" "), &images),
    }
}
