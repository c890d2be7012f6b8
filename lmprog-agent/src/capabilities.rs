//! # Tabletop capabilities
//!
//! The host functions generated code uses to look at and change the scene.
//! Every function validates its own arguments and reports problems as
//! script errors.

use crate::coords::{TableCoords, Xy};
use crate::sim::{Pose, Quat, SharedSimulator, Vec3, IDENTITY};
use lmprog_engine::{Error, FixedScope, HostFn, SharedTranscript};
use rhai::{Array, Dynamic, Map};
use std::collections::HashMap;
use std::rc::Rc;
use tracing::warn;

type HostResult = std::result::Result<Dynamic, String>;
type Capability = fn(&Capabilities, &[Dynamic]) -> HostResult;

/// Radius used when checking whether a position is occupied.
const OCCUPIED_RADIUS: f64 = 0.02;
/// Spacing of candidate positions for free-spot search.
const FREE_GRID: f64 = 0.01;

const COLORS: &[(&str, [f64; 3])] = &[
    ("blue", [78.0, 121.0, 167.0]),
    ("red", [255.0, 87.0, 89.0]),
    ("green", [89.0, 169.0, 79.0]),
    ("orange", [242.0, 142.0, 43.0]),
    ("yellow", [237.0, 201.0, 72.0]),
    ("purple", [176.0, 122.0, 161.0]),
    ("pink", [255.0, 157.0, 167.0]),
    ("cyan", [118.0, 183.0, 178.0]),
    ("brown", [156.0, 117.0, 95.0]),
    ("white", [255.0, 255.0, 255.0]),
    ("gray", [186.0, 176.0, 172.0]),
];

pub struct Capabilities {
    sim: SharedSimulator,
    coords: TableCoords,
    transcript: SharedTranscript,
}

impl Capabilities {
    pub fn new(sim: SharedSimulator, coords: TableCoords, transcript: SharedTranscript) -> Rc<Self> {
        Rc::new(Self { sim, coords, transcript })
    }

    /// Fixed scope holding every capability plus `table_z`.
    pub fn fixed_scope(self: &Rc<Self>) -> Rc<FixedScope> {
        FixedScope::builder()
            .host_fns(self.host_fns())
            .host_fns(geometry_fns())
            .constant("table_z", Dynamic::from_float(self.coords.table_z))
            .build()
    }

    pub fn host_fns(self: &Rc<Self>) -> Vec<HostFn> {
        let table: &[(&str, &[usize], Capability)] = &[
            ("get_obj_names", &[0, 1], Self::get_obj_names),
            ("is_obj_visible", &[1], Self::is_obj_visible),
            ("get_obj_pos", &[1, 2], Self::get_obj_pos),
            ("get_obj_rot", &[1, 2], Self::get_obj_rot),
            ("get_obj_positions", &[1], Self::get_obj_positions),
            ("get_obj_rotations", &[1], Self::get_obj_rotations),
            ("get_obj_pos_dict", &[0], Self::get_obj_pos_dict),
            ("get_bbox", &[1], Self::get_bbox),
            ("get_color", &[1], Self::get_color),
            ("denormalize_xy", &[1, 2], Self::denormalize_xy),
            ("denormalize_bbox", &[1], Self::denormalize_bbox),
            ("get_corner_name", &[1], Self::get_corner_name),
            ("get_side_name", &[1], Self::get_side_name),
            ("put_first_on_second", &[2], Self::put_first_on_second),
            ("pick_place", &[2], Self::put_first_on_second),
            ("stack_objects_in_order", &[1, 2], Self::stack_objects_in_order),
            ("is_target_occupied", &[1, 2], Self::is_target_occupied),
            ("get_free_pos", &[0, 1, 2], Self::get_free_pos),
            ("get_robot_pos", &[0], Self::get_robot_pos),
            ("goto_pos", &[1], Self::goto_pos),
            ("follow_traj", &[1], Self::follow_traj),
            ("reset", &[0], Self::reset),
            ("say", &[1], Self::say),
        ];

        table
            .iter()
            .map(|&(name, arities, f)| {
                let caps = Rc::clone(self);
                HostFn::new(name, arities.to_vec(), move |args| f(&caps, args))
            })
            .collect()
    }

    // ========================================================================
    // Scene queries
    // ========================================================================

    fn get_obj_names(&self, args: &[Dynamic]) -> HostResult {
        let names = self.sim.borrow().object_names();
        let Some(id) = args.first() else {
            return Ok(strings(names));
        };

        if let Ok(id) = id.as_int() {
            return Ok(strings(vec![self.name_by_id(&names, id)?]));
        }
        if id.is_string() {
            return Ok(strings(vec![text(id)?]));
        }
        if id.is_array() {
            return Ok(id.clone());
        }
        Err(format!("get_obj_names expects an id, a name or a list, got {}", id.type_name()))
    }

    fn is_obj_visible(&self, args: &[Dynamic]) -> HostResult {
        let name = text(&args[0])?;
        Ok(Dynamic::from(self.sim.borrow().object_names().contains(&name)))
    }

    fn get_obj_pos(&self, args: &[Dynamic]) -> HostResult {
        self.instances(args, |pose| floats(pose.position))
    }

    fn get_obj_rot(&self, args: &[Dynamic]) -> HostResult {
        self.instances(args, |pose| floats(pose.rotation))
    }

    fn get_obj_positions(&self, args: &[Dynamic]) -> HostResult {
        self.per_name(&args[0], |pose| floats(pose.position))
    }

    fn get_obj_rotations(&self, args: &[Dynamic]) -> HostResult {
        self.per_name(&args[0], |pose| floats(pose.rotation))
    }

    fn get_obj_pos_dict(&self, _args: &[Dynamic]) -> HostResult {
        let sim = self.sim.borrow();
        let mut catalog = Map::new();
        for name in sim.object_names() {
            let pose = sim.object_poses(&name).map_err(message)?[0];
            let entry: Array = vec![floats(pose.position), floats(quat_to_euler(pose.rotation))];
            catalog.insert(name.into(), Dynamic::from_array(entry));
        }
        Ok(Dynamic::from_map(catalog))
    }

    fn get_bbox(&self, args: &[Dynamic]) -> HostResult {
        let name = self.object_name(&head(&args[0]))?;
        let size = self.sim.borrow().bounding_box(&name).map_err(message)?.size();
        let scale = if name.contains("scaled") { scale_of(&name) } else { 1.0 };
        Ok(floats(size.map(|s| s * scale)))
    }

    fn get_color(&self, args: &[Dynamic]) -> HostResult {
        let name = text(&args[0])?;
        Ok(COLORS
            .iter()
            .find(|(color, _)| name.contains(color))
            .map(|(_, rgb)| floats(rgb.map(|c| c / 255.0)))
            .unwrap_or(Dynamic::UNIT))
    }

    // ========================================================================
    // Table geometry
    // ========================================================================

    fn denormalize_xy(&self, args: &[Dynamic]) -> HostResult {
        let pos = xy(&args[0])?;
        let out = match args.get(1) {
            Some(size) => self.coords.denormalize_in(pos, xy(size)?),
            None => self.coords.denormalize_xy(pos),
        };
        Ok(floats(out))
    }

    fn denormalize_bbox(&self, args: &[Dynamic]) -> HostResult {
        let bbox = numbers(&args[0])?;
        let bbox: [f64; 4] = bbox
            .try_into()
            .map_err(|_| "denormalize_bbox expects [x_min, y_min, x_max, y_max]".to_string())?;
        Ok(floats(self.coords.denormalize_bbox(bbox)))
    }

    fn get_corner_name(&self, args: &[Dynamic]) -> HostResult {
        Ok(Dynamic::from(self.coords.corner_name(xy(&args[0])?).to_string()))
    }

    fn get_side_name(&self, args: &[Dynamic]) -> HostResult {
        Ok(Dynamic::from(self.coords.side_name(xy(&args[0])?).to_string()))
    }

    // ========================================================================
    // Manipulation
    // ========================================================================

    fn put_first_on_second(&self, args: &[Dynamic]) -> HostResult {
        if is_missing(&args[0]) || is_missing(&args[1]) {
            warn!("missing argument");
            return Ok(Dynamic::UNIT);
        }
        let pick = self.target_pose(&args[0])?;
        let place = self.target_pose(&args[1])?;
        self.sim.borrow_mut().step(pick, place).map_err(message)?;
        Ok(Dynamic::UNIT)
    }

    fn stack_objects_in_order(&self, args: &[Dynamic]) -> HostResult {
        if is_missing(&args[0]) {
            return Ok(Dynamic::UNIT);
        }
        let names = match args[0].clone().into_array() {
            Ok(names) => names,
            Err(_) => vec![args[0].clone()],
        };

        if let Some(target) = args.get(1).filter(|t| !is_missing(t)) {
            self.put_first_on_second(&[names[0].clone(), target.clone()])?;
        }
        for pair in names.windows(2) {
            self.put_first_on_second(&[pair[1].clone(), pair[0].clone()])?;
        }
        Ok(Dynamic::UNIT)
    }

    fn is_target_occupied(&self, args: &[Dynamic]) -> HostResult {
        let radius = match args.get(1) {
            Some(r) => number(r)?,
            None => OCCUPIED_RADIUS,
        };
        let (center, radius, skip) = if args[0].is_array() {
            let pos = if is_position(&args[0]) {
                numbers(&args[0])?
            } else {
                numbers(&head(&args[0]))?
            };
            if pos.len() != 2 && pos.len() != 3 {
                return Err("target position must be 2D or 3D".to_string());
            }
            ([pos[0], pos[1]], radius, None)
        } else {
            let name = self.object_name(&args[0])?;
            let sim = self.sim.borrow();
            let size = sim.bounding_box(&name).map_err(message)?.size();
            let pos = sim.object_poses(&name).map_err(message)?[0].position;
            ([pos[0], pos[1]], 0.5 * size[0].hypot(size[1]), Some(name))
        };

        Ok(strings(self.occupants(center, radius, skip.as_deref())?))
    }

    /// A free spot nearest the middle of the table, as `[position, rotation]`.
    fn get_free_pos(&self, args: &[Dynamic]) -> HostResult {
        let radius = match args.get(1) {
            Some(r) => number(r)?,
            None => OCCUPIED_RADIUS,
        };
        let mut keep_out: Vec<(Xy, f64)> = Vec::new();
        if let Some(targets) = args.first().filter(|t| !is_missing(t)) {
            let targets = if targets.is_string() || targets.as_int().is_ok() || is_position(targets) || is_pose_pair(targets) {
                vec![targets.clone()]
            } else {
                targets.clone().into_array().map_err(|t| format!("unsupported target {}", t))?
            };
            for target in &targets {
                keep_out.push(self.keep_out_zone(target, radius)?);
            }
        }

        let (min_x, min_y, max_x, max_y) = self.coords.bounds();
        let middle = self.coords.middle;
        let mut best: Option<(Xy, f64)> = None;
        let mut x = min_x;
        while x < max_x {
            let mut y = min_y;
            while y < max_y {
                let candidate = [x, y];
                let clear = keep_out.iter().all(|(c, r)| distance2(candidate, *c) > *r);
                if clear && self.occupants(candidate, radius, None)?.is_empty() {
                    let d = distance2(candidate, middle);
                    if best.map_or(true, |(_, bd)| d < bd) {
                        best = Some((candidate, d));
                    }
                }
                y += FREE_GRID;
            }
            x += FREE_GRID;
        }

        Ok(match best {
            Some(([x, y], _)) => {
                let pose: Array = vec![floats([x, y, 0.001]), floats(IDENTITY)];
                Dynamic::from_array(pose)
            }
            None => {
                warn!("no suitable position");
                Dynamic::UNIT
            }
        })
    }

    fn get_robot_pos(&self, _args: &[Dynamic]) -> HostResult {
        Ok(floats(self.sim.borrow().ee_position()))
    }

    fn goto_pos(&self, args: &[Dynamic]) -> HostResult {
        let target = if is_position(&args[0]) {
            let pos = numbers(&args[0])?;
            match pos.len() {
                2 => Pose::at([pos[0], pos[1], self.sim.borrow().ee_position()[2]]),
                3 => Pose::at([pos[0], pos[1], pos[2]]),
                n => return Err(format!("goto_pos expects a 2D or 3D position, got {} values", n)),
            }
        } else {
            pose_from_pair(&args[0])?
        };
        self.sim.borrow_mut().move_ee(target).map_err(message)?;
        Ok(Dynamic::UNIT)
    }

    fn follow_traj(&self, args: &[Dynamic]) -> HostResult {
        let traj = args[0]
            .clone()
            .into_array()
            .map_err(|t| format!("follow_traj expects a list of positions, got {}", t))?;
        for pos in traj {
            self.goto_pos(&[pos])?;
        }
        Ok(Dynamic::UNIT)
    }

    fn reset(&self, _args: &[Dynamic]) -> HostResult {
        self.sim.borrow_mut().reset().map_err(message)?;
        Ok(Dynamic::UNIT)
    }

    fn say(&self, args: &[Dynamic]) -> HostResult {
        self.transcript.borrow_mut().say(&args[0].to_string());
        Ok(Dynamic::UNIT)
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn name_by_id(&self, names: &[String], id: i64) -> std::result::Result<String, String> {
        names
            .iter()
            .find(|name| {
                name.split_whitespace()
                    .last()
                    .and_then(|part| part.parse::<i64>().ok())
                    == Some(id)
            })
            .cloned()
            .ok_or_else(|| format!("no matching obj with id {}", id))
    }

    /// Object name from a name or a numeric id.
    fn object_name(&self, value: &Dynamic) -> std::result::Result<String, String> {
        match value.as_int() {
            Ok(id) => self.name_by_id(&self.sim.borrow().object_names(), id),
            Err(_) => text(value),
        }
    }

    /// `f(name)` gives the first instance, `f(name, count)` the first `count`, `-1` all.
    fn instances(&self, args: &[Dynamic], project: fn(&Pose) -> Dynamic) -> HostResult {
        let name = self.object_name(&args[0])?;
        let poses = self.sim.borrow().object_poses(&name).map_err(message)?;
        let Some(count) = args.get(1) else {
            return Ok(project(&poses[0]));
        };
        let count = count.as_int().map_err(|t| format!("count must be an integer, got {}", t))?;
        let take = if count < 0 { poses.len() } else { count as usize };
        Ok(Dynamic::from_array(poses.iter().take(take).map(project).collect()))
    }

    /// One pose per listed name; repeated names walk through their instances.
    fn per_name(&self, names: &Dynamic, project: fn(&Pose) -> Dynamic) -> HostResult {
        let names = names
            .clone()
            .into_array()
            .map_err(|t| format!("expected a list of object names, got {}", t))?;
        let sim = self.sim.borrow();
        let mut seen: HashMap<String, usize> = HashMap::new();
        let mut out = Array::new();
        for name in &names {
            let name = match name.as_int() {
                Ok(id) => self.name_by_id(&sim.object_names(), id)?,
                Err(_) => text(name)?,
            };
            let index = seen.entry(name.clone()).or_insert(0);
            let poses = sim.object_poses(&name).map_err(message)?;
            let pose = poses
                .get(*index)
                .ok_or_else(|| format!("only {} instance(s) of '{}'", poses.len(), name))?;
            out.push(project(pose));
            *index += 1;
        }
        Ok(Dynamic::from_array(out))
    }

    /// Pose for a pick or place target: a name, an id, a position, or `[position, rotation]`.
    fn target_pose(&self, target: &Dynamic) -> std::result::Result<Pose, String> {
        if target.is_string() || target.as_int().is_ok() {
            let name = self.object_name(target)?;
            let sim = self.sim.borrow();
            return sim.object_poses(&name).map(|p| p[0]).map_err(message);
        }
        if is_position(target) {
            return Ok(Pose::at(position(&numbers(target)?)?));
        }
        pose_from_pair(target)
    }

    fn keep_out_zone(&self, target: &Dynamic, radius: f64) -> std::result::Result<(Xy, f64), String> {
        if target.is_string() || target.as_int().is_ok() {
            let name = self.object_name(target)?;
            let sim = self.sim.borrow();
            let size = sim.bounding_box(&name).map_err(message)?.size();
            let pos = sim.object_poses(&name).map_err(message)?[0].position;
            return Ok(([pos[0], pos[1]], 0.5 * size[0].hypot(size[1])));
        }
        let pose = self.target_pose(target)?;
        Ok(([pose.position[0], pose.position[1]], radius))
    }

    fn occupants(&self, center: Xy, radius: f64, skip: Option<&str>) -> std::result::Result<Vec<String>, String> {
        let sim = self.sim.borrow();
        let mut occupied = Vec::new();
        for name in sim.object_names() {
            if Some(name.as_str()) == skip {
                continue;
            }
            let bbox = sim.bounding_box(&name).map_err(message)?;
            if bbox.distance_to(&center, 2) <= radius {
                occupied.push(name);
            }
        }
        Ok(occupied)
    }
}

// ============================================================================
// Geometry helpers
// ============================================================================

fn geometry_fns() -> Vec<HostFn> {
    vec![
        HostFn::new("distance", [2], |args| {
            let a = numbers(&args[0])?;
            let b = numbers(&args[1])?;
            if a.len() != b.len() {
                return Err(format!("distance between {}D and {}D points", a.len(), b.len()));
            }
            Ok(Dynamic::from_float(
                a.iter().zip(&b).map(|(x, y)| (x - y).powi(2)).sum::<f64>().sqrt(),
            ))
        }),
        HostFn::new("norm", [1], |args| {
            let v = numbers(&args[0])?;
            Ok(Dynamic::from_float(v.iter().map(|x| x * x).sum::<f64>().sqrt()))
        }),
        HostFn::new("linspace", [3], |args| {
            let n = args[2].as_int().map_err(|t| format!("linspace count must be an integer, got {}", t))?;
            if n < 1 {
                return Ok(Dynamic::from_array(Array::new()));
            }
            let points = if args[0].is_array() {
                let start = numbers(&args[0])?;
                let end = numbers(&args[1])?;
                if start.len() != end.len() {
                    return Err("linspace endpoints differ in length".to_string());
                }
                lerp_steps(n, |t| floats_vec(start.iter().zip(&end).map(|(a, b)| a * (1.0 - t) + b * t).collect()))
            } else {
                let start = number(&args[0])?;
                let end = number(&args[1])?;
                lerp_steps(n, |t| Dynamic::from_float(start * (1.0 - t) + end * t))
            };
            Ok(Dynamic::from_array(points))
        }),
    ]
}

fn lerp_steps(n: i64, point: impl Fn(f64) -> Dynamic) -> Array {
    (0..n)
        .map(|i| {
            let t = if n == 1 { 0.0 } else { i as f64 / (n - 1) as f64 };
            point(t)
        })
        .collect()
}

fn quat_to_euler([x, y, z, w]: Quat) -> Vec3 {
    let roll = (2.0 * (w * x + y * z)).atan2(1.0 - 2.0 * (x * x + y * y));
    let pitch = (2.0 * (w * y - z * x)).clamp(-1.0, 1.0).asin();
    let yaw = (2.0 * (w * z + x * y)).atan2(1.0 - 2.0 * (y * y + z * z));
    [roll, pitch, yaw]
}

fn distance2(a: Xy, b: Xy) -> f64 {
    (a[0] - b[0]).hypot(a[1] - b[1])
}

/// `2.5x` in a scaled object's name
fn scale_of(name: &str) -> f64 {
    name.split_whitespace()
        .find_map(|word| word.strip_suffix('x')?.parse::<f64>().ok())
        .unwrap_or(1.0)
}

// ============================================================================
// Dynamic conversions
// ============================================================================

fn message(err: Error) -> String {
    err.message().to_string()
}

fn text(value: &Dynamic) -> std::result::Result<String, String> {
    value
        .clone()
        .into_string()
        .map_err(|t| format!("expected a string, got {}", t))
}

fn number(value: &Dynamic) -> std::result::Result<f64, String> {
    if let Ok(f) = value.as_float() {
        return Ok(f);
    }
    value
        .as_int()
        .map(|i| i as f64)
        .map_err(|t| format!("expected a number, got {}", t))
}

fn numbers(value: &Dynamic) -> std::result::Result<Vec<f64>, String> {
    value
        .clone()
        .into_array()
        .map_err(|t| format!("expected a list of numbers, got {}", t))?
        .iter()
        .map(number)
        .collect()
}

fn xy(value: &Dynamic) -> std::result::Result<Xy, String> {
    let v = numbers(value)?;
    if v.len() < 2 {
        return Err(format!("expected an [x, y] position, got {} values", v.len()));
    }
    Ok([v[0], v[1]])
}

fn position(v: &[f64]) -> std::result::Result<Vec3, String> {
    match v.len() {
        2 => Ok([v[0], v[1], 0.0]),
        3 => Ok([v[0], v[1], v[2]]),
        n => Err(format!("expected a 2D or 3D position, got {} values", n)),
    }
}

/// `[position, rotation]`
fn pose_from_pair(value: &Dynamic) -> std::result::Result<Pose, String> {
    let pair = value
        .clone()
        .into_array()
        .map_err(|t| format!("expected [position, rotation], got {}", t))?;
    if pair.len() != 2 {
        return Err("expected [position, rotation]".to_string());
    }
    let pos = position(&numbers(&pair[0])?)?;
    let rot: Quat = numbers(&pair[1])?
        .try_into()
        .map_err(|_| "rotation must be a quaternion [x, y, z, w]".to_string())?;
    Ok(Pose::new(pos, rot))
}

/// A flat list of numbers
fn is_position(value: &Dynamic) -> bool {
    value
        .read_lock::<Array>()
        .is_some_and(|a| !a.is_empty() && a.iter().all(|v| v.is_float() || v.is_int()))
}

/// First element of a list, or the value itself.
fn head(value: &Dynamic) -> Dynamic {
    match value.read_lock::<Array>() {
        Some(list) if !list.is_empty() => list[0].clone(),
        _ => value.clone(),
    }
}

/// `[position, rotation]` with a quaternion rotation
fn is_pose_pair(value: &Dynamic) -> bool {
    value.read_lock::<Array>().is_some_and(|pair| {
        pair.len() == 2 && is_position(&pair[0]) && pair[1].read_lock::<Array>().is_some_and(|r| r.len() == 4)
    })
}

fn is_missing(value: &Dynamic) -> bool {
    value.is_unit()
        || value.read_lock::<rhai::ImmutableString>().is_some_and(|s| s.is_empty())
        || value.read_lock::<Array>().is_some_and(|a| a.is_empty())
}

fn floats<const N: usize>(values: [f64; N]) -> Dynamic {
    floats_vec(values.to_vec())
}

fn floats_vec(values: Vec<f64>) -> Dynamic {
    Dynamic::from_array(values.into_iter().map(Dynamic::from_float).collect())
}

fn strings(values: Vec<String>) -> Dynamic {
    Dynamic::from_array(values.into_iter().map(Dynamic::from).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tabletop::{TableObject, TableTop};
    use crate::sim::Simulator;
    use lmprog_engine::{Namespace, Sandbox, Transcript};
    use std::cell::RefCell;

    struct Scene {
        table: Rc<RefCell<TableTop>>,
        transcript: SharedTranscript,
        ns: Namespace,
    }

    fn scene() -> Scene {
        let table = Rc::new(RefCell::new(TableTop::new(vec![
            TableObject::new("red block 1", [0.4, -0.2, 0.02], [0.04, 0.04, 0.04]),
            TableObject::new("blue block 2", [0.6, 0.2, 0.02], [0.04, 0.04, 0.04]),
            TableObject::new("green bowl 3", [0.5, 0.35, 0.03], [0.12, 0.12, 0.06]),
        ])));
        let transcript = Transcript::shared();
        let sim: SharedSimulator = table.clone();
        let caps = Capabilities::new(sim, TableCoords::default(), transcript.clone());
        Scene {
            table,
            transcript,
            ns: Namespace::new(caps.fixed_scope()),
        }
    }

    fn run(scene: &Scene, source: &str) -> lmprog_engine::Execution {
        Sandbox::new().run(source, &scene.ns, &[]).unwrap()
    }

    #[test]
    fn test_put_first_on_second() {
        let scene = scene();
        run(&scene, "put_first_on_second(\"red block 1\", \"blue block 2\");");

        let table = scene.table.borrow();
        let red = table.object("red block 1").unwrap();
        assert_eq!(&red.pose.position[..2], &[0.6, 0.2]);
        assert!((red.pose.position[2] - 0.06).abs() < 1e-9);
    }

    #[test]
    fn test_place_at_position_and_by_id() {
        let scene = scene();
        run(&scene, "put_first_on_second(1, [0.3, 0.1]);");

        let red = scene.table.borrow().object("red block 1").unwrap().clone();
        assert_eq!(&red.pose.position[..2], &[0.3, 0.1]);
    }

    #[test]
    fn test_missing_argument_is_ignored() {
        let scene = scene();
        run(&scene, "put_first_on_second(\"\", \"blue block 2\");");
        assert!(scene.table.borrow().steps().is_empty());
    }

    #[test]
    fn test_stack_in_order() {
        let scene = scene();
        run(&scene, "stack_objects_in_order([\"blue block 2\", \"red block 1\"], \"green bowl 3\");");

        let table = scene.table.borrow();
        let blue = table.object("blue block 2").unwrap();
        let red = table.object("red block 1").unwrap();
        assert!((blue.pose.position[2] - 0.08).abs() < 1e-9);
        assert!((red.pose.position[2] - 0.12).abs() < 1e-9);
        assert_eq!(table.steps().len(), 2);
    }

    #[test]
    fn test_queries() {
        let scene = scene();
        let execution = run(
            &scene,
            "let names = get_obj_names();\n\
             let by_id = get_obj_names(2);\n\
             let visible = is_obj_visible(\"green bowl 3\");\n\
             let pos = get_obj_pos(\"red block 1\");\n\
             let all = get_obj_pos(\"red block\", -1);\n\
             let size = get_bbox(\"green bowl 3\");\n\
             let color = get_color(\"red block 1\");\n\
             let no_color = get_color(\"metal block\");",
        );

        let locals = &execution.locals;
        assert_eq!(locals["names"].clone().into_array().unwrap().len(), 3);
        assert_eq!(locals["by_id"].clone().into_array().unwrap()[0].to_string(), "blue block 2");
        assert!(locals["visible"].as_bool().unwrap());
        assert_eq!(locals["pos"].clone().into_array().unwrap()[0].as_float().unwrap(), 0.4);
        assert_eq!(locals["all"].clone().into_array().unwrap().len(), 1);
        assert_eq!(locals["size"].clone().into_array().unwrap()[2].as_float().unwrap(), 0.06);
        assert_eq!(locals["color"].clone().into_array().unwrap()[0].as_float().unwrap(), 1.0);
        assert!(locals["no_color"].is_unit());
    }

    #[test]
    fn test_unknown_object_is_a_script_error() {
        let scene = scene();
        let err = Sandbox::new()
            .run("get_obj_pos(\"purple block\");", &scene.ns, &[])
            .unwrap_err();
        assert!(err.to_string().contains("no object named 'purple block'"));
    }

    #[test]
    fn test_occupancy_and_free_position() {
        let scene = scene();
        run(&scene, "put_first_on_second(\"red block 1\", \"green bowl 3\");");

        let execution = run(
            &scene,
            "let on_bowl = is_target_occupied(\"green bowl 3\");\n\
             let at_blue = is_target_occupied([0.6, 0.2]);\n\
             let free = get_free_pos();\n\
             let free_occupied = is_target_occupied(free);",
        );

        let names = |key: &str| -> Vec<String> {
            execution.locals[key]
                .clone()
                .into_array()
                .unwrap()
                .iter()
                .map(|v| v.to_string())
                .collect()
        };
        assert_eq!(names("on_bowl"), vec!["red block 1"]);
        assert_eq!(names("at_blue"), vec!["blue block 2"]);
        assert!(names("free_occupied").is_empty());
    }

    #[test]
    fn test_table_geometry() {
        let scene = scene();
        let execution = run(
            &scene,
            "let middle = denormalize_xy([0.5, 0.5]);\n\
             let corner = get_corner_name([0.26, -0.49]);\n\
             let side = get_side_name([0.75, 0.0]);",
        );

        let middle = execution.locals["middle"].clone().into_array().unwrap();
        assert_eq!(middle[0].as_float().unwrap(), 0.5);
        assert_eq!(middle[1].as_float().unwrap(), 0.0);
        assert_eq!(execution.locals["corner"].to_string(), "top left corner");
        assert_eq!(execution.locals["side"].to_string(), "bottom side");
    }

    #[test]
    fn test_robot_motion() {
        let scene = scene();
        run(&scene, "goto_pos([0.3, 0.2]);");
        assert_eq!(scene.table.borrow().ee_position(), [0.3, 0.2, 0.3]);

        run(&scene, "follow_traj(linspace([0.3, 0.0, 0.1], [0.5, 0.0, 0.1], 3));");
        assert_eq!(scene.table.borrow().ee_position(), [0.5, 0.0, 0.1]);

        let execution = run(&scene, "let ee = get_robot_pos();");
        assert_eq!(execution.locals["ee"].clone().into_array().unwrap().len(), 3);
    }

    #[test]
    fn test_say_and_math() {
        let scene = scene();
        let execution = run(
            &scene,
            "say(\"done\");\n\
             let d = distance([0.0, 0.0], [3.0, 4.0]);\n\
             let n = norm([3, 4]);\n\
             let steps = linspace(0.0, 1.0, 3);",
        );

        assert_eq!(scene.transcript.borrow().text(), "robot says: done\n");
        assert_eq!(execution.locals["d"].as_float().unwrap(), 5.0);
        assert_eq!(execution.locals["n"].as_float().unwrap(), 5.0);
        let steps = execution.locals["steps"].clone().into_array().unwrap();
        assert_eq!(steps[1].as_float().unwrap(), 0.5);
    }

    #[test]
    fn test_reset() {
        let scene = scene();
        run(&scene, "put_first_on_second(\"red block 1\", \"blue block 2\");\nreset();");
        assert_eq!(
            scene.table.borrow().object("red block 1").unwrap().pose.position,
            [0.4, -0.2, 0.02]
        );
    }
}
