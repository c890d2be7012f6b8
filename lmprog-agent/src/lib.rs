//! # lmprog Agent
//!
//! A tabletop manipulation planner built on the lmprog engine:
//! 1. The goal and visible objects go to the top program unit
//! 2. Generated code calls robot capabilities and helper units
//! 3. Calls to functions nobody defined are synthesized on demand
//! 4. Optionally, a multimodal checker judges whether the goal was met
//!
//! The [`Simulator`] trait is the seam to a physics backend; [`TableTop`] is a
//! kinematic stand-in good enough for planning and tests.

mod capabilities;
mod checker;
mod coords;
mod planner;
mod sim;
mod tabletop;

pub use capabilities::Capabilities;
pub use checker::{frames_from_files, CompletionChecker, CHECKER_SYSTEM_PROMPT, DEFAULT_VERDICT_NAME};
pub use coords::{TableCoords, Xy};
pub use planner::{
    capability_scope, episode_query, object_context, EpisodeOutcome, Planner, PlannerConfig, CHECK_NOTE,
    CHECK_UNIT, EPISODE_NOTE, FGEN_UNIT, HELPER_UNITS, TOP_UNIT,
};
pub use sim::{Aabb, Pose, Quat, SharedSimulator, Simulator, Vec3, IDENTITY};
pub use tabletop::{default_size, TableObject, TableTop};
