use anyhow::Result;

use crate::core::domain::Structure;

/// Output of one structural relaxation.
#[derive(Debug, Clone)]
pub struct Relaxation {
    /// Final potential energy of the whole cell (eV).
    pub energy: f64,
    /// The relaxed geometry; same atom count and order as the input.
    pub structure: Structure,
}

/// A calculator that relaxes a single structure.
/// Implementations must be thread-safe: a batch runs them concurrently.
pub trait Relaxer: Send + Sync {
    fn relax(&self, structure: &Structure) -> Result<Relaxation>;

    /// Returns the name of the engine (e.g., "GULP").
    fn name(&self) -> &str;
}
