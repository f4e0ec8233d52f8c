use std::collections::BTreeMap;

use nalgebra::{Matrix3, Point3, Vector3};
use rand::seq::SliceRandom; // Required for shuffling species
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::chemistry::InteractionGrid;
use crate::core::spatial;

/// Integer handle of a candidate inside a generation's working set.
/// Stable across relaxation so results can be re-associated with their source.
pub type CandidateId = usize;

/// Candidate id -> structure. Used for both the initial and the optimized set.
pub type StructureSet = BTreeMap<CandidateId, Structure>;

// --- Physics Types ---

/// Represents a single chemical element/species properties.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Species {
    pub symbol: String,
    pub atomic_number: u8,
    pub mass: f64,            // amu
    pub charge: f64,          // e
    pub radius_covalent: f64, // Å
}

impl Default for Species {
    fn default() -> Self {
        Self {
            symbol: "X".to_string(),
            atomic_number: 0,
            mass: 1.0,
            charge: 0.0,
            radius_covalent: 1.0,
        }
    }
}

/// A single atom instance in a structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Atom {
    pub element_id: usize, // Index into the species list
    pub position: Point3<f64>,
}

impl Atom {
    pub fn new(element_id: usize, position: Point3<f64>) -> Self {
        Self { element_id, position }
    }
}

/// Periodic cell. Columns are a, b, c.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lattice {
    pub vectors: Matrix3<f64>,
    pub inverse: Matrix3<f64>, // Precomputed for fractional conversion
}

impl Lattice {
    pub fn new(a: Vector3<f64>, b: Vector3<f64>, c: Vector3<f64>) -> Option<Self> {
        let vectors = Matrix3::from_columns(&[a, b, c]);
        let inverse = vectors.try_inverse()?;
        Some(Self { vectors, inverse })
    }

    pub fn cubic(length: f64) -> Option<Self> {
        Self::new(
            Vector3::new(length, 0.0, 0.0),
            Vector3::new(0.0, length, 0.0),
            Vector3::new(0.0, 0.0, length),
        )
    }

    /// Cell volume in Å^3.
    pub fn volume(&self) -> f64 {
        self.vectors.determinant().abs()
    }

    pub fn to_fractional(&self, p: &Point3<f64>) -> Point3<f64> {
        Point3::from(self.inverse * p.coords)
    }

    pub fn to_cartesian(&self, p: &Point3<f64>) -> Point3<f64> {
        Point3::from(self.vectors * p.coords)
    }
}

// --- The Core Entity ---

/// An atomic configuration handed to the calculator and the search backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Structure {
    /// Provenance handle, used as the results table's structure reference.
    pub uid: Uuid,
    pub generation: u32,
    pub origin: String,

    pub atoms: Vec<Atom>,
    pub lattice: Option<Lattice>,
}

impl Structure {
    pub fn new(origin: &str) -> Self {
        Self {
            uid: Uuid::new_v4(),
            generation: 0,
            origin: origin.to_string(),
            atoms: Vec::new(),
            lattice: None,
        }
    }

    pub fn num_atoms(&self) -> usize {
        self.atoms.len()
    }

    /// Cell volume, or 0.0 for a non-periodic cluster.
    pub fn volume(&self) -> f64 {
        self.lattice.as_ref().map(Lattice::volume).unwrap_or(0.0)
    }

    /// Tries to generate a random structure respecting stoichiometry constraints.
    ///
    /// # Arguments
    /// * `atom_counts`: A slice where index `i` is the count of species `i`.
    ///   Example: `[6, 6]` for 6 Mg and 6 O.
    /// * `cell`: when set, atoms are placed in this periodic cell and overlap is
    ///   checked under the minimum image convention; otherwise a cluster is
    ///   built inside `[-box_size, box_size)^3` and centered.
    pub fn new_random<R: Rng + ?Sized>(
        atom_counts: &[usize],
        box_size: f64,
        cell: Option<&Lattice>,
        grid: &InteractionGrid,
        rng: &mut R,
    ) -> Option<Self> {
        let mut s = Structure::new("Random");
        s.lattice = cell.cloned();

        // 1. Build the exact multiset of element IDs required.
        let mut elements_to_place = Vec::new();
        for (id, &count) in atom_counts.iter().enumerate() {
            elements_to_place.extend(std::iter::repeat(id).take(count));
        }

        // 2. Shuffle to randomize initial topology.
        elements_to_place.shuffle(rng);

        // 3. Place atoms (Random Sequential Adsorption)
        for &elem_id in &elements_to_place {
            let mut placed = false;

            for _ in 0..100 {
                let pos = match &s.lattice {
                    Some(lat) => lat.to_cartesian(&Point3::new(
                        rng.gen::<f64>(),
                        rng.gen::<f64>(),
                        rng.gen::<f64>(),
                    )),
                    None => Point3::new(
                        rng.gen_range(-box_size..box_size),
                        rng.gen_range(-box_size..box_size),
                        rng.gen_range(-box_size..box_size),
                    ),
                };

                let clash = s.atoms.iter().any(|existing| {
                    let limit_sq = grid.get_collision_sq(elem_id, existing.element_id);
                    spatial::distance_sq(&pos, &existing.position, s.lattice.as_ref()) < limit_sq
                });

                if !clash {
                    s.atoms.push(Atom::new(elem_id, pos));
                    placed = true;
                    break;
                }
            }
            if !placed {
                return None; // Failed to pack
            }
        }

        spatial::wrap_or_center(&mut s);
        Some(s)
    }

    /// Verifies if the structure matches the target stoichiometry.
    pub fn check_stoichiometry(&self, target_counts: &[usize]) -> bool {
        let mut actual_counts = vec![0; target_counts.len()];

        for atom in &self.atoms {
            if atom.element_id >= actual_counts.len() {
                return false;
            }
            actual_counts[atom.element_id] += 1;
        }

        actual_counts == target_counts
    }

    /// Calculator-independent dictionary form used in packed result summaries.
    pub fn to_portable(&self) -> serde_json::Value {
        let portable = PortableStructure::from(self);
        serde_json::to_value(portable).unwrap_or(serde_json::Value::Null)
    }
}

/// Plain-array view of a structure, free of nalgebra types.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PortableStructure {
    pub uid: String,
    pub lattice: Option<[[f64; 3]; 3]>,
    pub element_ids: Vec<usize>,
    pub cartesian: Vec<[f64; 3]>,
    pub volume: f64,
}

impl From<&Structure> for PortableStructure {
    fn from(s: &Structure) -> Self {
        let lattice = s.lattice.as_ref().map(|lat| {
            let v = lat.vectors;
            [
                [v[(0, 0)], v[(1, 0)], v[(2, 0)]],
                [v[(0, 1)], v[(1, 1)], v[(2, 1)]],
                [v[(0, 2)], v[(1, 2)], v[(2, 2)]],
            ]
        });
        Self {
            uid: s.uid.to_string(),
            lattice,
            element_ids: s.atoms.iter().map(|a| a.element_id).collect(),
            cartesian: s
                .atoms
                .iter()
                .map(|a| [a.position.x, a.position.y, a.position.z])
                .collect(),
            volume: s.volume(),
        }
    }
}
