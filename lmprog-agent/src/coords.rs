//! Table geometry in the robot base frame.
//!
//! Normalized coordinates put `[0, 0]` at the bottom left of the table and
//! `[1, 1]` at the top right, first axis running left to right.

use serde::{Deserialize, Serialize};

pub type Xy = [f64; 2];

const CORNER_NAMES: [&str; 4] = ["top left corner", "top right corner", "bottom left corner", "bottom right corner"];
const CORNERS: [Xy; 4] = [[0.0, 1.0], [1.0, 1.0], [0.0, 0.0], [1.0, 0.0]];

const SIDE_NAMES: [&str; 4] = ["top side", "right side", "bottom side", "left side"];
const SIDES: [Xy; 4] = [[0.5, 1.0], [1.0, 0.5], [0.5, 0.0], [0.0, 0.5]];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableCoords {
    pub top_left: Xy,
    pub top_side: Xy,
    pub top_right: Xy,
    pub left_side: Xy,
    pub middle: Xy,
    pub right_side: Xy,
    pub bottom_left: Xy,
    pub bottom_side: Xy,
    pub bottom_right: Xy,
    pub table_z: f64,
}

impl Default for TableCoords {
    fn default() -> Self {
        Self {
            top_left: [0.25, -0.5],
            top_side: [0.25, 0.0],
            top_right: [0.25, 0.5],
            left_side: [0.5, -0.5],
            middle: [0.5, 0.0],
            right_side: [0.5, 0.5],
            bottom_left: [0.75, -0.5],
            bottom_side: [0.75, 0.0],
            bottom_right: [0.75, 0.5],
            table_z: 0.0,
        }
    }
}

impl TableCoords {
    /// Map a normalized `[u, v]` onto the table.
    pub fn denormalize_xy(&self, normalized: Xy) -> Xy {
        let min = self.bottom_left;
        let max = self.top_right;
        [
            normalized[1] * (max[0] - min[0]) + min[0],
            normalized[0] * (max[1] - min[1]) + min[1],
        ]
    }

    /// Map a normalized `[u, v]` into a box of `size`, centered on the origin.
    pub fn denormalize_in(&self, normalized: Xy, size: Xy) -> Xy {
        [
            normalized[1] * size[0] - size[0] / 2.0,
            normalized[0] * size[1] - size[1] / 2.0,
        ]
    }

    /// `[u_min, v_min, u_max, v_max]` to table coordinates, as `[left, right]` corner pairs.
    pub fn denormalize_bbox(&self, bbox: [f64; 4]) -> [f64; 4] {
        let left = self.denormalize_xy([bbox[0], bbox[3]]);
        let right = self.denormalize_xy([bbox[2], bbox[1]]);
        [left[0], left[1], right[0], right[1]]
    }

    pub fn corner_name(&self, pos: Xy) -> &'static str {
        CORNER_NAMES[self.nearest(&CORNERS, pos)]
    }

    pub fn side_name(&self, pos: Xy) -> &'static str {
        SIDE_NAMES[self.nearest(&SIDES, pos)]
    }

    /// `(min_x, min_y, max_x, max_y)` of the usable table area.
    pub fn bounds(&self) -> (f64, f64, f64, f64) {
        (self.top_left[0], self.top_left[1], self.bottom_right[0], self.bottom_right[1])
    }

    fn nearest(&self, normalized: &[Xy; 4], pos: Xy) -> usize {
        let mut best = (0, f64::INFINITY);
        for (i, point) in normalized.iter().enumerate() {
            let target = self.denormalize_xy(*point);
            let d = ((target[0] - pos[0]).powi(2) + (target[1] - pos[1]).powi(2)).sqrt();
            if d < best.1 {
                best = (i, d);
            }
        }
        best.0
    }
}
