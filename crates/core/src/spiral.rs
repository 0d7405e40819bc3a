//! De-overlap of visually coincident map points.
//!
//! Points are grouped by single-pass anchor clustering over an id-sorted
//! order, then each multi-member cluster is laid out on a golden-angle
//! (Vogel) spiral around its centroid. The result is a presentation
//! transform only and must never be persisted.

use crate::geo::Coordinates;

/// Members within this many degrees of a cluster's anchor join the cluster.
pub const DEFAULT_CLUSTER_THRESHOLD_DEG: f64 = 0.003;

/// Base spacing of the spiral, in degrees.
pub const DEFAULT_BASE_SPACING_DEG: f64 = 0.0003;

/// pi * (3 - sqrt(5)), roughly 137.5 degrees.
pub const GOLDEN_ANGLE_RAD: f64 = 2.399_963_229_728_653;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpiralParams {
    pub cluster_threshold: f64,
    pub base_spacing: f64,
}

impl Default for SpiralParams {
    fn default() -> Self {
        Self {
            cluster_threshold: DEFAULT_CLUSTER_THRESHOLD_DEG,
            base_spacing: DEFAULT_BASE_SPACING_DEG,
        }
    }
}

/// Radius of the `i`-th member (0-based) of a cluster.
pub fn spiral_radius(i: usize, base_spacing: f64) -> f64 {
    base_spacing * (1.0 + ((i + 1) as f64).sqrt())
}

/// Upper bound on any member's distance from its cluster centroid.
pub fn max_radius(cluster_size: usize, base_spacing: f64) -> f64 {
    spiral_radius(cluster_size.saturating_sub(1), base_spacing)
}

/// Return every input point with an adjusted position, in input order.
///
/// Deterministic for a given set of ids regardless of input order.
pub fn spread<Id>(points: &[(Id, Coordinates)], params: &SpiralParams) -> Vec<(Id, Coordinates)>
where
    Id: Ord + Clone,
{
    let mut order: Vec<usize> = (0..points.len()).collect();
    order.sort_by(|&a, &b| points[a].0.cmp(&points[b].0));

    let mut output: Vec<Coordinates> = points.iter().map(|(_, p)| *p).collect();
    let mut assigned = vec![false; points.len()];

    for (pos, &anchor) in order.iter().enumerate() {
        if assigned[anchor] {
            continue;
        }
        assigned[anchor] = true;
        let anchor_at = points[anchor].1;

        let mut members = vec![anchor];
        for &candidate in &order[pos + 1..] {
            if !assigned[candidate]
                && points[candidate].1.degree_distance(&anchor_at) <= params.cluster_threshold
            {
                assigned[candidate] = true;
                members.push(candidate);
            }
        }

        if members.len() < 2 {
            continue;
        }

        let n = members.len() as f64;
        let centroid_lat = members.iter().map(|&m| points[m].1.lat).sum::<f64>() / n;
        let centroid_lng = members.iter().map(|&m| points[m].1.lng).sum::<f64>() / n;

        for (i, &member) in members.iter().enumerate() {
            let theta = i as f64 * GOLDEN_ANGLE_RAD;
            let radius = spiral_radius(i, params.base_spacing);
            output[member] = Coordinates {
                lat: centroid_lat + radius * theta.cos(),
                lng: centroid_lng + radius * theta.sin(),
            };
        }
    }

    points
        .iter()
        .zip(output)
        .map(|((id, _), position)| (id.clone(), position))
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
