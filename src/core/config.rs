//! Run configuration, loaded from a JSON file.

use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use log::warn;
use serde::{Deserialize, Serialize};

use crate::core::domain::Species;

fn default_algorithm() -> String {
    "EA".to_string()
}
fn default_threads() -> usize {
    4
}
fn default_max_generations() -> u32 {
    50
}
fn default_batch_size() -> usize {
    2
}
fn default_work_dir() -> PathBuf {
    PathBuf::from(".")
}

/// Top-level search configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Search backend identifier ("EA" or "RS").
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
    /// Seed for the backend RNG. `None` draws one from the OS.
    #[serde(default)]
    pub seed: Option<u64>,
    /// Worker threads for in-batch relaxations.
    #[serde(default = "default_threads")]
    pub threads: usize,
    /// Generation ceiling for the master loop.
    #[serde(default = "default_max_generations")]
    pub max_generations: u32,
    /// Relaxations submitted per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Target pressure in GPa. Kept raw so a malformed value degrades to 0.0
    /// instead of rejecting the whole file.
    #[serde(default)]
    pub pressure: Option<serde_json::Value>,
    /// Directory holding the run markers and the run outputs.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    #[serde(default)]
    pub structure: StructureParams,
    #[serde(default)]
    pub evolution: EvolutionParams,
    #[serde(default)]
    pub calculator: CalculatorParams,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            algorithm: default_algorithm(),
            seed: None,
            threads: default_threads(),
            max_generations: default_max_generations(),
            batch_size: default_batch_size(),
            pressure: None,
            work_dir: default_work_dir(),
            structure: StructureParams::default(),
            evolution: EvolutionParams::default(),
            calculator: CalculatorParams::default(),
        }
    }
}

/// How random candidates are built.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StructureParams {
    pub species: Vec<Species>,
    /// Explicit counts per species (e.g., [6, 6]).
    pub atom_counts: Vec<usize>,
    /// Cluster half-width, or cubic cell edge when `periodic` is set (Å).
    pub box_size: f64,
    pub periodic: bool,
    /// Fraction of summed covalent radii treated as a hard collision.
    pub covalent_scale: f64,
}

impl Default for StructureParams {
    fn default() -> Self {
        Self {
            species: vec![
                Species {
                    symbol: "Mg".to_string(),
                    atomic_number: 12,
                    mass: 24.305,
                    charge: 2.0,
                    radius_covalent: 1.30,
                },
                Species {
                    symbol: "O".to_string(),
                    atomic_number: 8,
                    mass: 15.999,
                    charge: -2.0,
                    radius_covalent: 0.73,
                },
            ],
            atom_counts: vec![4, 4],
            box_size: 6.0,
            periodic: false,
            covalent_scale: 0.75,
        }
    }
}

/// Population settings shared by both backends; selection settings are EA only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvolutionParams {
    pub population_size: usize,
    pub elitism_count: usize,
    pub crossover_rate: f64,
    pub mutation_rate: f64,
    pub tournament_size: usize,
}

impl Default for EvolutionParams {
    fn default() -> Self {
        Self {
            population_size: 10,
            elitism_count: 2,
            crossover_rate: 0.6,
            mutation_rate: 0.3,
            tournament_size: 2,
        }
    }
}

/// External relaxation code invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalculatorParams {
    pub executable: String,
    /// Potential block appended verbatim to every input deck.
    pub potentials: String,
    /// Extra keywords on the GULP header line.
    pub keywords: Vec<String>,
}

impl Default for CalculatorParams {
    fn default() -> Self {
        Self {
            executable: "gulp".to_string(),
            potentials: String::new(),
            keywords: Vec::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("batch size must be non-zero")]
    InvalidBatchSize,
    #[error("population size must be non-zero")]
    InvalidPopulation,
    #[error("elitism count {elites} exceeds population size {population}")]
    InvalidElitism { elites: usize, population: usize },
    #[error("atom counts list {counts} species but {species} are defined")]
    StoichiometryMismatch { counts: usize, species: usize },
    #[error("structure must contain at least one atom")]
    EmptyStructure,
    #[error("box size must be positive")]
    InvalidBoxSize,
}

impl SearchConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: SearchConfig =
            serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidBatchSize);
        }
        let evo = &self.evolution;
        if evo.population_size == 0 {
            return Err(ConfigError::InvalidPopulation);
        }
        if evo.elitism_count > evo.population_size {
            return Err(ConfigError::InvalidElitism {
                elites: evo.elitism_count,
                population: evo.population_size,
            });
        }
        let st = &self.structure;
        if st.atom_counts.len() != st.species.len() {
            return Err(ConfigError::StoichiometryMismatch {
                counts: st.atom_counts.len(),
                species: st.species.len(),
            });
        }
        if st.atom_counts.iter().sum::<usize>() == 0 {
            return Err(ConfigError::EmptyStructure);
        }
        if !(st.box_size > 0.0) {
            return Err(ConfigError::InvalidBoxSize);
        }
        Ok(())
    }

    pub fn batch_size(&self) -> Result<NonZeroUsize, ConfigError> {
        NonZeroUsize::new(self.batch_size).ok_or(ConfigError::InvalidBatchSize)
    }

    /// Target pressure in GPa; see [`resolve_pressure`].
    pub fn target_pressure(&self) -> f64 {
        resolve_pressure(self.pressure.as_ref())
    }
}

/// Reads a pressure setting. Accepts a number or a numeric string; anything
/// missing, non-numeric or non-finite falls back to 0.0 with a warning.
pub fn resolve_pressure(raw: Option<&serde_json::Value>) -> f64 {
    let Some(raw) = raw else {
        warn!("No target pressure configured, using 0.0 GPa");
        return 0.0;
    };

    let parsed = match raw {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };

    match parsed {
        Some(p) if p.is_finite() => p,
        _ => {
            warn!("Unreadable target pressure {}, using 0.0 GPa", raw);
            0.0
        }
    }
}
