//! In-memory tabletop: objects are boxes, picking and placing is instant.

use crate::coords::TableCoords;
use crate::sim::{Aabb, Pose, Simulator, Vec3};
use lmprog_engine::{Error, Result};
use tracing::debug;

/// How close a pick pose must be to an object's position, in xy.
const PICK_TOLERANCE: f64 = 0.01;

#[derive(Debug, Clone, PartialEq)]
pub struct TableObject {
    pub name: String,
    pub pose: Pose,
    pub size: Vec3,
}

impl TableObject {
    pub fn new(name: impl Into<String>, position: Vec3, size: Vec3) -> Self {
        Self {
            name: name.into(),
            pose: Pose::at(position),
            size,
        }
    }

    pub fn aabb(&self) -> Aabb {
        Aabb::around(self.pose.position, self.size)
    }

    fn answers_to(&self, query: &str) -> bool {
        self.name == query
            || self
                .name
                .strip_prefix(query)
                .is_some_and(|rest| rest.starts_with(' '))
    }
}

/// Box size guessed from the object's name.
pub fn default_size(name: &str) -> Vec3 {
    if name.contains("zone") {
        [0.12, 0.12, 0.001]
    } else if name.contains("bowl") {
        [0.12, 0.12, 0.06]
    } else if name.contains("pallet") {
        [0.2, 0.2, 0.02]
    } else {
        [0.04, 0.04, 0.04]
    }
}

#[derive(Debug, Clone)]
pub struct TableTop {
    objects: Vec<TableObject>,
    initial: Vec<TableObject>,
    table_z: f64,
    home: Vec3,
    ee: Vec3,
    steps: Vec<(Pose, Pose)>,
}

impl TableTop {
    pub fn new(objects: Vec<TableObject>) -> Self {
        let home = [0.5, 0.0, 0.3];
        Self {
            initial: objects.clone(),
            objects,
            table_z: 0.0,
            home,
            ee: home,
            steps: Vec::new(),
        }
    }

    /// Spread `names` over the table in a grid, resting on its surface.
    pub fn layout(names: &[String], coords: &TableCoords) -> Self {
        let (min_x, min_y, max_x, max_y) = coords.bounds();
        let cols = (names.len() as f64).sqrt().ceil().max(1.0) as usize;
        let rows = names.len().div_ceil(cols).max(1);

        let objects = names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let (row, col) = (i / cols, i % cols);
                let size = default_size(name);
                let x = min_x + (max_x - min_x) * (row as f64 + 0.5) / rows as f64;
                let y = min_y + (max_y - min_y) * (col as f64 + 0.5) / cols as f64;
                TableObject::new(name.clone(), [x, y, coords.table_z + size[2] / 2.0], size)
            })
            .collect();

        let mut table = Self::new(objects);
        table.table_z = coords.table_z;
        table
    }

    pub fn objects(&self) -> &[TableObject] {
        &self.objects
    }

    pub fn object(&self, name: &str) -> Option<&TableObject> {
        self.objects.iter().find(|o| o.name == name)
    }

    /// Every pick/place pair executed since the last reset
    pub fn steps(&self) -> &[(Pose, Pose)] {
        &self.steps
    }

    fn matching(&self, name: &str) -> Result<Vec<&TableObject>> {
        let found: Vec<&TableObject> = self.objects.iter().filter(|o| o.answers_to(name)).collect();
        if found.is_empty() {
            return Err(Error::invalid_argument(format!("no object named '{}'", name))
                .with_operation("tabletop::lookup"));
        }
        Ok(found)
    }

    /// Height of the highest surface under `xy`, ignoring object `skip`.
    fn surface_at(&self, x: f64, y: f64, skip: usize) -> f64 {
        self.objects
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != skip)
            .map(|(_, o)| o.aabb())
            .filter(|b| b.min[0] <= x && x <= b.max[0] && b.min[1] <= y && y <= b.max[1])
            .map(|b| b.max[2])
            .fold(self.table_z, f64::max)
    }
}

impl Simulator for TableTop {
    fn object_names(&self) -> Vec<String> {
        self.objects.iter().map(|o| o.name.clone()).collect()
    }

    fn object_poses(&self, name: &str) -> Result<Vec<Pose>> {
        Ok(self.matching(name)?.into_iter().map(|o| o.pose).collect())
    }

    fn bounding_box(&self, name: &str) -> Result<Aabb> {
        Ok(self.matching(name)?[0].aabb())
    }

    fn step(&mut self, pick: Pose, place: Pose) -> Result<()> {
        let [px, py, _] = pick.position;
        let picked = self
            .objects
            .iter()
            .enumerate()
            .map(|(i, o)| (i, (o.pose.position[0] - px).hypot(o.pose.position[1] - py)))
            .filter(|(_, d)| *d <= PICK_TOLERANCE)
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(i, _)| i)
            .ok_or_else(|| {
                Error::invalid_argument(format!("nothing to pick at ({:.3}, {:.3})", px, py))
                    .with_operation("tabletop::step")
            })?;

        let [x, y, _] = place.position;
        let z = self.surface_at(x, y, picked) + self.objects[picked].size[2] / 2.0;
        let object = &mut self.objects[picked];
        object.pose = Pose::new([x, y, z], place.rotation);
        debug!(object = %object.name, x, y, z, "placed object");

        self.steps.push((pick, place));
        Ok(())
    }

    fn ee_position(&self) -> Vec3 {
        self.ee
    }

    fn move_ee(&mut self, target: Pose) -> Result<()> {
        self.ee = target.position;
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.objects = self.initial.clone();
        self.ee = self.home;
        self.steps.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> TableTop {
        TableTop::new(vec![
            TableObject::new("red block 1", [0.4, -0.2, 0.02], [0.04, 0.04, 0.04]),
            TableObject::new("blue block 1", [0.6, 0.2, 0.02], [0.04, 0.04, 0.04]),
            TableObject::new("blue block 2", [0.6, -0.3, 0.02], [0.04, 0.04, 0.04]),
        ])
    }

    #[test]
    fn test_instance_lookup() {
        let table = table();
        assert_eq!(table.object_poses("blue block").unwrap().len(), 2);
        assert_eq!(table.object_poses("blue block 2").unwrap().len(), 1);
        assert!(table.object_poses("blue").is_err());
        assert!(table.object_poses("green block").is_err());
    }

    #[test]
    fn test_place_on_top() {
        let mut table = table();
        let pick = table.object_poses("red block 1").unwrap()[0];
        let place = table.object_poses("blue block 1").unwrap()[0];

        table.step(pick, place).unwrap();

        let red = table.object("red block 1").unwrap();
        assert!((red.pose.position[2] - 0.06).abs() < 1e-9);
        assert_eq!(&red.pose.position[..2], &[0.6, 0.2]);
        assert_eq!(table.steps().len(), 1);
    }

    #[test]
    fn test_place_on_table() {
        let mut table = table();
        let pick = table.object_poses("red block 1").unwrap()[0];
        table.step(pick, Pose::at([0.3, 0.3, 0.0])).unwrap();

        let red = table.object("red block 1").unwrap();
        assert!((red.pose.position[2] - 0.02).abs() < 1e-9);
    }

    #[test]
    fn test_nothing_to_pick() {
        let mut table = table();
        assert!(table.step(Pose::at([0.0, 0.0, 0.0]), Pose::at([0.5, 0.0, 0.0])).is_err());
    }

    #[test]
    fn test_reset_restores_scene() {
        let mut table = table();
        let pick = table.object_poses("red block 1").unwrap()[0];
        table.step(pick, Pose::at([0.3, 0.3, 0.0])).unwrap();
        table.move_ee(Pose::at([0.1, 0.1, 0.1])).unwrap();

        table.reset().unwrap();

        assert_eq!(table.object("red block 1").unwrap().pose.position, [0.4, -0.2, 0.02]);
        assert_eq!(table.ee_position(), [0.5, 0.0, 0.3]);
        assert!(table.steps().is_empty());
    }

    #[test]
    fn test_layout_stays_on_table() {
        let names: Vec<String> = ["red block", "blue bowl", "green zone"].iter().map(|s| s.to_string()).collect();
        let coords = TableCoords::default();
        let table = TableTop::layout(&names, &coords);

        let (min_x, min_y, max_x, max_y) = coords.bounds();
        for object in table.objects() {
            let [x, y, z] = object.pose.position;
            assert!(min_x < x && x < max_x && min_y < y && y < max_y);
            assert!((z - object.size[2] / 2.0).abs() < 1e-9);
        }
        assert_eq!(table.object_names(), names);
    }
}
