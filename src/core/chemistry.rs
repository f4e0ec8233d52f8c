use serde::{Deserialize, Serialize};

use crate::core::domain::Species;

/// Pairwise minimum-separation table used when placing and breeding candidates.
/// Flattened `n x n` matrix, indexed `i * n + j`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionGrid {
    num_species: usize,
    /// ((r_i + r_j) * scale)^2, squared to skip sqrt() in overlap checks.
    collision_matrix_sq: Vec<f64>,
}

impl InteractionGrid {
    /// `covalent_scale`: fraction of the summed covalent radii below which two
    /// atoms count as colliding (usually ~0.7-0.8).
    pub fn new(species: &[Species], covalent_scale: f64) -> Self {
        let n = species.len();
        let collision_matrix_sq = species
            .iter()
            .flat_map(|a| {
                species.iter().map(move |b| {
                    let threshold = (a.radius_covalent + b.radius_covalent) * covalent_scale;
                    threshold * threshold
                })
            })
            .collect();

        Self {
            num_species: n,
            collision_matrix_sq,
        }
    }

    pub fn num_species(&self) -> usize {
        self.num_species
    }

    /// Squared distance below which two atoms collide. Unknown ids never collide.
    #[inline(always)]
    pub fn get_collision_sq(&self, id_a: usize, id_b: usize) -> f64 {
        if id_a >= self.num_species || id_b >= self.num_species {
            return 0.0;
        }
        self.collision_matrix_sq[id_a * self.num_species + id_b]
    }
}
