use nalgebra::{Rotation3, Unit, Vector3};
use rand::seq::SliceRandom;
use rand::Rng;

use crate::core::domain::{Atom, Lattice, Structure};
use crate::core::spatial;

/// A composable mutation builder.
#[derive(Clone, Debug, Default)]
pub struct Mutator {
    rotation_intensity: Option<f64>,  // Max angle
    rattle_intensity: Option<f64>,    // Max atom displacement
    breathing_intensity: Option<f64>, // Scaling factor range
    swap_count: Option<usize>,        // Pairs to swap
}

impl Mutator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rotate(mut self, max_angle: f64) -> Self {
        self.rotation_intensity = Some(max_angle);
        self
    }

    pub fn rattle(mut self, max_dist: f64) -> Self {
        self.rattle_intensity = Some(max_dist);
        self
    }

    pub fn breathing(mut self, intensity: f64) -> Self {
        self.breathing_intensity = Some(intensity);
        self
    }

    pub fn swap(mut self, count: usize) -> Self {
        self.swap_count = Some(count);
        self
    }

    /// Applies the configured moves to a copy of `structure`.
    ///
    /// Rotation only applies to clusters; a periodic cell breathes by scaling
    /// its lattice, so fractional coordinates are kept.
    pub fn apply(&self, structure: &Structure, rng: &mut impl Rng) -> Structure {
        let mut s = structure.clone();
        s.uid = uuid::Uuid::new_v4();
        s.origin = "Mutation".to_string();

        spatial::wrap_or_center(&mut s);

        if let Some(mag) = self.breathing_intensity.filter(|m| *m > 0.0) {
            let scale = 1.0 + rng.gen_range(-mag..mag);
            let scaled_lattice = s.lattice.as_ref().and_then(|lat| {
                Lattice::new(
                    lat.vectors.column(0) * scale,
                    lat.vectors.column(1) * scale,
                    lat.vectors.column(2) * scale,
                )
            });
            if let Some(lat) = scaled_lattice {
                s.lattice = Some(lat);
            }
            for atom in &mut s.atoms {
                atom.position.coords *= scale;
            }
        }

        if let Some(mag) = self.rotation_intensity.filter(|m| *m > 0.0) {
            if s.lattice.is_none() {
                let rot = random_rotation(rng, mag);
                for atom in &mut s.atoms {
                    atom.position = rot * atom.position;
                }
            }
        }

        if let Some(mag) = self.rattle_intensity.filter(|m| *m > 0.0) {
            for atom in &mut s.atoms {
                atom.position.x += rng.gen_range(-mag..mag);
                atom.position.y += rng.gen_range(-mag..mag);
                atom.position.z += rng.gen_range(-mag..mag);
            }
        }

        // Exchange positions of unlike species
        if let Some(count) = self.swap_count {
            let n = s.atoms.len();
            if n >= 2 {
                for _ in 0..count {
                    let i = rng.gen_range(0..n);
                    let j = rng.gen_range(0..n);
                    if s.atoms[i].element_id != s.atoms[j].element_id {
                        let tmp = s.atoms[i].position;
                        s.atoms[i].position = s.atoms[j].position;
                        s.atoms[j].position = tmp;
                    }
                }
            }
        }

        spatial::wrap_or_center(&mut s);
        s
    }
}

fn random_rotation<R: Rng + ?Sized>(rng: &mut R, max_angle: f64) -> Rotation3<f64> {
    let axis = Unit::new_normalize(Vector3::new(
        rng.gen::<f64>() - 0.5,
        rng.gen::<f64>() - 0.5,
        rng.gen::<f64>() - 0.5,
    ));
    Rotation3::from_axis_angle(&axis, rng.gen_range(-max_angle..max_angle))
}

/// Centers and randomly rotates a set of cluster atoms.
fn center_and_rotate<R: Rng + ?Sized>(atoms: &mut [Atom], rng: &mut R) {
    if atoms.is_empty() {
        return;
    }
    let com = atoms
        .iter()
        .fold(Vector3::zeros(), |acc, a| acc + a.position.coords)
        / atoms.len() as f64;
    let rot = random_rotation(rng, std::f64::consts::PI);
    for a in atoms.iter_mut() {
        a.position = rot * (a.position - com);
    }
}

/// "Cut and Splice" crossover.
///
/// Clusters are centered and rotated before the cut; periodic parents are
/// cut along fractional z of the first parent's cell. The child keeps the
/// first parent's stoichiometry.
pub fn crossover_cut_splice(p1: &Structure, p2: &Structure, rng: &mut impl Rng) -> Option<Structure> {
    if p1.atoms.len() != p2.atoms.len() {
        return None;
    }
    let n = p1.atoms.len();
    if n < 2 {
        return None;
    }

    let max_id = p1.atoms.iter().map(|a| a.element_id).max().unwrap_or(0);
    let mut target_counts = vec![0; max_id + 1];
    for a in &p1.atoms {
        target_counts[a.element_id] += 1;
    }

    let mut child = p1.clone();
    child.uid = uuid::Uuid::new_v4();
    child.origin = format!("X({},{})", &p1.uid.to_string()[0..4], &p2.uid.to_string()[0..4]);

    let mut p1_atoms = p1.atoms.clone();
    let mut p2_atoms = p2.atoms.clone();

    // Sort key along the cut direction
    let cut_axis = |a: &Atom| match &p1.lattice {
        Some(lat) => lat.to_fractional(&a.position).z.rem_euclid(1.0),
        None => a.position.z,
    };

    if p1.lattice.is_none() {
        center_and_rotate(&mut p1_atoms, rng);
        center_and_rotate(&mut p2_atoms, rng);
    } else if let (Some(l1), Some(l2)) = (&p1.lattice, &p2.lattice) {
        // Re-express p2 in p1's cell
        for a in p2_atoms.iter_mut() {
            a.position = l1.to_cartesian(&l2.to_fractional(&a.position));
        }
    }

    p1_atoms.sort_by(|a, b| cut_axis(a).total_cmp(&cut_axis(b)));
    p2_atoms.sort_by(|a, b| cut_axis(a).total_cmp(&cut_axis(b)));

    // range 1..n ensures at least 1 atom from each parent
    let cut_point = rng.gen_range(1..n);

    child.atoms.clear();
    child.atoms.extend_from_slice(&p1_atoms[0..cut_point]);
    child.atoms.extend_from_slice(&p2_atoms[cut_point..n]);

    // Repair stoichiometry by relabelling surplus atoms
    let mut child_counts = vec![0; max_id + 1];
    for a in &child.atoms {
        if a.element_id < child_counts.len() {
            child_counts[a.element_id] += 1;
        }
    }

    let mut deficits = Vec::new();
    for (id, &tgt) in target_counts.iter().enumerate() {
        let curr = child_counts[id];
        if curr < tgt {
            deficits.extend(std::iter::repeat(id).take(tgt - curr));
        }
    }
    deficits.shuffle(rng);

    for (id, &tgt) in target_counts.iter().enumerate() {
        let curr = child_counts[id];
        if curr <= tgt {
            continue;
        }
        let mut indices: Vec<usize> = child
            .atoms
            .iter()
            .enumerate()
            .filter(|(_, a)| a.element_id == id)
            .map(|(i, _)| i)
            .collect();
        indices.shuffle(rng);

        for &idx in indices.iter().take(curr - tgt) {
            if let Some(new_id) = deficits.pop() {
                child.atoms[idx].element_id = new_id;
            }
        }
    }

    spatial::wrap_or_center(&mut child);
    Some(child)
}
