//! The simulator seam: everything generated code may do to the world goes
//! through [`Simulator`].

use lmprog_engine::Result;
use std::cell::RefCell;
use std::rc::Rc;

pub type Vec3 = [f64; 3];
/// Quaternion, xyzw
pub type Quat = [f64; 4];

pub const IDENTITY: Quat = [0.0, 0.0, 0.0, 1.0];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub position: Vec3,
    pub rotation: Quat,
}

impl Pose {
    pub fn new(position: Vec3, rotation: Quat) -> Self {
        Self { position, rotation }
    }

    pub fn at(position: Vec3) -> Self {
        Self::new(position, IDENTITY)
    }
}

/// Axis-aligned bounding box in the robot base frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub fn around(center: Vec3, size: Vec3) -> Self {
        let half = [size[0] / 2.0, size[1] / 2.0, size[2] / 2.0];
        Self {
            min: [center[0] - half[0], center[1] - half[1], center[2] - half[2]],
            max: [center[0] + half[0], center[1] + half[1], center[2] + half[2]],
        }
    }

    pub fn size(&self) -> Vec3 {
        [
            self.max[0] - self.min[0],
            self.max[1] - self.min[1],
            self.max[2] - self.min[2],
        ]
    }

    /// Distance from `point` to the closest point of the box, in the first `dims` axes.
    pub fn distance_to(&self, point: &[f64], dims: usize) -> f64 {
        (0..dims.min(3))
            .map(|i| {
                let closest = point[i].clamp(self.min[i], self.max[i]);
                (point[i] - closest).powi(2)
            })
            .sum::<f64>()
            .sqrt()
    }
}

pub trait Simulator {
    /// Names of every object in the scene, in scene order
    fn object_names(&self) -> Vec<String>;

    /// Poses of every instance answering to `name`, in scene order
    fn object_poses(&self, name: &str) -> Result<Vec<Pose>>;

    fn bounding_box(&self, name: &str) -> Result<Aabb>;

    /// Pick whatever is at `pick` and release it at `place`
    fn step(&mut self, pick: Pose, place: Pose) -> Result<()>;

    fn ee_position(&self) -> Vec3;

    fn move_ee(&mut self, target: Pose) -> Result<()>;

    fn reset(&mut self) -> Result<()>;
}

pub type SharedSimulator = Rc<RefCell<dyn Simulator>>;
