use nalgebra::{Point3, Vector3};

use crate::core::chemistry::InteractionGrid;
use crate::core::domain::{Lattice, Structure};

/// Squared distance between two points, under the minimum image convention
/// when a lattice is given.
#[inline]
pub fn distance_sq(p1: &Point3<f64>, p2: &Point3<f64>, lattice: Option<&Lattice>) -> f64 {
    match lattice {
        Some(lat) => {
            let mut d_frac = lat.inverse * (p2 - p1);
            d_frac.iter_mut().for_each(|c| *c -= c.round());
            (lat.vectors * d_frac).norm_squared()
        }
        None => nalgebra::distance_squared(p1, p2),
    }
}

/// Returns `true` if no atom pair sits closer than the grid allows.
pub fn check_overlap(structure: &Structure, grid: &InteractionGrid) -> bool {
    let atoms = &structure.atoms;
    let lattice = structure.lattice.as_ref();

    for (i, a_i) in atoms.iter().enumerate() {
        for a_j in &atoms[i + 1..] {
            let threshold_sq = grid.get_collision_sq(a_i.element_id, a_j.element_id);
            if distance_sq(&a_i.position, &a_j.position, lattice) < threshold_sq {
                return false;
            }
        }
    }
    true
}

/// Periodic: wraps atoms into the [0, 1) fractional box.
/// Cluster: moves the geometric center to the origin.
///
/// Modifies positions in place and never reorders atoms.
pub fn wrap_or_center(structure: &mut Structure) {
    if let Some(lat) = &structure.lattice {
        for atom in &mut structure.atoms {
            let mut frac = lat.to_fractional(&atom.position);
            frac.coords.iter_mut().for_each(|c| *c = c.rem_euclid(1.0));
            atom.position = lat.to_cartesian(&frac);
        }
    } else {
        if structure.atoms.is_empty() {
            return;
        }
        let n = structure.atoms.len() as f64;
        let center = structure
            .atoms
            .iter()
            .fold(Vector3::zeros(), |acc, a| acc + a.position.coords)
            / n;

        for atom in &mut structure.atoms {
            atom.position -= center;
        }
    }
}
