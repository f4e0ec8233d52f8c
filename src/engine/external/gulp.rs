use std::fmt::Write as _;
use std::io::Write;
use std::process::{Command, Stdio};

use anyhow::{anyhow, bail, Context, Result};
use nalgebra::{Point3, Vector3};
use regex::Regex;

use crate::core::domain::{Lattice, Species, Structure};
use crate::engine::relaxer::{Relaxation, Relaxer};

/// GULP wrapper. Streams the input deck through stdin and parses stdout,
/// so no scratch files are left behind per candidate.
pub struct GulpRelaxer {
    executable: String,
    potential_parameters: String,
    keywords: Vec<String>,
    species_map: Vec<Species>,
    pressure_gpa: Option<f64>,
    final_energy: Regex,
    lattice_energy: Regex,
}

impl GulpRelaxer {
    /// # Arguments
    /// * `executable` - Path to GULP binary (e.g., "gulp").
    /// * `potential_parameters` - The potential block (buckingham, spring, etc.).
    /// * `species_map` - Ordered species matching `element_id` in structures.
    pub fn new(executable: &str, potential_parameters: &str, species_map: Vec<Species>) -> Result<Self> {
        Ok(Self {
            executable: executable.to_string(),
            potential_parameters: potential_parameters.trim().to_string(),
            keywords: Vec::new(),
            species_map,
            pressure_gpa: None,
            final_energy: Regex::new(r"(?im)^\s*final energy\s*=\s*(\S+)\s*eV")?,
            lattice_energy: Regex::new(r"(?im)^\s*total lattice energy\s*=\s*(\S+)\s*eV")?,
        })
    }

    /// Relax periodic cells at this external pressure.
    pub fn with_pressure(mut self, gpa: f64) -> Self {
        if gpa != 0.0 {
            self.pressure_gpa = Some(gpa);
        }
        self
    }

    pub fn with_keywords(mut self, keywords: Vec<String>) -> Self {
        self.keywords = keywords;
        self
    }

    fn symbol(&self, element_id: usize) -> Result<&str> {
        self.species_map
            .get(element_id)
            .map(|s| s.symbol.as_str())
            .ok_or_else(|| anyhow!("Invalid element_id {}", element_id))
    }

    fn generate_input(&self, structure: &Structure) -> Result<String> {
        let mut s = String::with_capacity(1024);

        let mut header = match structure.lattice {
            Some(_) => "opti conv conp properties".to_string(),
            None => "opti conv cartesian".to_string(),
        };
        for kw in &self.keywords {
            header.push(' ');
            header.push_str(kw);
        }
        writeln!(s, "{}", header)?;

        if let Some(lat) = &structure.lattice {
            s.push_str("vectors\n");
            let v = lat.vectors;
            // GULP reads vectors as rows
            for col in 0..3 {
                writeln!(s, "{:.9} {:.9} {:.9}", v[(0, col)], v[(1, col)], v[(2, col)])?;
            }
            s.push_str("fractional\n");
            for atom in &structure.atoms {
                let frac = lat.to_fractional(&atom.position);
                writeln!(s, "{:<3} core {:.9} {:.9} {:.9}", self.symbol(atom.element_id)?, frac.x, frac.y, frac.z)?;
            }
            if let Some(p) = self.pressure_gpa {
                writeln!(s, "pressure {:.6} GPa", p)?;
            }
        } else {
            s.push_str("cartesian\n");
            for atom in &structure.atoms {
                let p = atom.position;
                writeln!(s, "{:<3} core {:.9} {:.9} {:.9}", self.symbol(atom.element_id)?, p.x, p.y, p.z)?;
            }
        }

        s.push('\n');
        s.push_str(&self.potential_parameters);
        s.push('\n');

        Ok(s)
    }

    fn run_process(&self, input_data: &str) -> Result<String> {
        let mut child = Command::new(&self.executable)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("Failed to spawn GULP executable")?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(input_data.as_bytes())
                .context("Failed to write to GULP stdin")?;
        }

        let output = child.wait_with_output().context("Failed to read GULP output")?;

        if !output.status.success() {
            bail!("GULP exited with error: {}", String::from_utf8_lossy(&output.stderr));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn parse_energy(&self, output: &str) -> Result<f64> {
        let capture = self
            .final_energy
            .captures_iter(output)
            .last()
            .or_else(|| self.lattice_energy.captures_iter(output).last())
            .ok_or_else(|| anyhow!("Could not find final energy in GULP output"))?;

        capture[1]
            .parse::<f64>()
            .context("Failed to parse energy float")
    }

    /// Reads the 3 rows following "Final Cartesian lattice vectors".
    fn parse_lattice(&self, output: &str) -> Result<Option<Lattice>> {
        let lines: Vec<&str> = output.lines().collect();
        let Some(start) = lines
            .iter()
            .rposition(|l| l.to_ascii_lowercase().contains("final cartesian lattice vectors"))
        else {
            return Ok(None);
        };

        let rows: Vec<Vector3<f64>> = lines[start + 1..]
            .iter()
            .filter(|l| !l.trim().is_empty())
            .take(3)
            .map(|l| -> Result<Vector3<f64>> {
                let vals: Vec<f64> = l
                    .split_whitespace()
                    .take(3)
                    .map(|t| t.parse::<f64>())
                    .collect::<Result<_, _>>()
                    .context("Malformed lattice vector")?;
                if vals.len() != 3 {
                    bail!("Lattice vector row has {} components", vals.len());
                }
                Ok(Vector3::new(vals[0], vals[1], vals[2]))
            })
            .collect::<Result<_>>()?;

        if rows.len() != 3 {
            bail!("Incomplete final lattice vectors");
        }
        Lattice::new(rows[0], rows[1], rows[2])
            .map(Some)
            .ok_or_else(|| anyhow!("Singular final lattice"))
    }

    fn parse_geometry(&self, output: &str, original: &Structure) -> Result<Structure> {
        let mut relaxed = original.clone();
        if original.lattice.is_some() {
            if let Some(lat) = self.parse_lattice(output)? {
                relaxed.lattice = Some(lat);
            }
        }

        let lines: Vec<&str> = output.lines().collect();
        let (header, is_fractional) = lines
            .iter()
            .enumerate()
            .rev()
            .find_map(|(i, line)| {
                let lower = line.to_ascii_lowercase();
                if lower.contains("final fractional coordinates") {
                    Some((i, true))
                } else if lower.contains("final cartesian coordinates") {
                    Some((i, false))
                } else {
                    None
                }
            })
            .ok_or_else(|| anyhow!("No final coordinates found in GULP output"))?;

        // Table layout: rule, column titles, rule, rows..., rule
        let mut rules_seen = 0;
        let mut coords = Vec::with_capacity(original.atoms.len());
        for line in &lines[header + 1..] {
            if line.contains("-------") {
                rules_seen += 1;
                if rules_seen == 3 {
                    break;
                }
                continue;
            }
            if rules_seen < 2 {
                continue;
            }
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 6 {
                continue;
            }
            // Only cores are tracked
            if parts[2].to_ascii_lowercase().starts_with('s') {
                continue;
            }
            let xyz: Vec<f64> = parts[3..6]
                .iter()
                .map(|t| t.trim_end_matches('*').parse::<f64>())
                .collect::<Result<_, _>>()
                .context("Malformed coordinate row")?;
            if xyz.iter().any(|c| c.is_nan()) {
                bail!("Parsed NaN coordinates from GULP output");
            }
            coords.push(Point3::new(xyz[0], xyz[1], xyz[2]));
        }

        if coords.len() != original.atoms.len() {
            bail!(
                "GULP atom count mismatch: expected {}, got {}",
                original.atoms.len(),
                coords.len()
            );
        }

        for (atom, p) in relaxed.atoms.iter_mut().zip(coords) {
            atom.position = if is_fractional {
                let lat = relaxed
                    .lattice
                    .as_ref()
                    .ok_or_else(|| anyhow!("GULP returned fractional coords but structure has no lattice"))?;
                lat.to_cartesian(&p)
            } else {
                p
            };
        }

        Ok(relaxed)
    }

    fn check_errors(&self, output: &str) -> Result<()> {
        if output.contains("Conditions for a minimum have not been satisfied") {
            bail!("Convergence failure");
        }
        if output.contains("Interatomic distance too small") {
            bail!("Geometric collapse");
        }
        if output.contains("Dump of error info") {
            bail!("Internal GULP error");
        }
        Ok(())
    }
}

impl Relaxer for GulpRelaxer {
    fn name(&self) -> &str {
        "GULP (Pipe)"
    }

    fn relax(&self, structure: &Structure) -> Result<Relaxation> {
        let input = self.generate_input(structure)?;
        let output = self.run_process(&input)?;

        self.check_errors(&output)?;

        let energy = self.parse_energy(&output)?;
        let relaxed = self
            .parse_geometry(&output, structure)
            .context("Geometry parsing failed")?;

        Ok(Relaxation {
            energy,
            structure: relaxed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::domain::Atom;

    const PERIODIC_OUTPUT: &str = "
  Total lattice energy       =         -40.00000000 eV

  Final energy =     -41.07551691 eV
  Final Gnorm  =       0.00000123

  Final fractional coordinates of atoms :

--------------------------------------------------------------------------------
   No.  Atomic        x           y          z          Radius
        Label       (Frac)      (Frac)     (Frac)       (Angs)
--------------------------------------------------------------------------------
     1  Mg    c     0.000000    0.000000    0.000000    0.000000
     2  O     c     0.500000    0.500000    0.500000    0.000000
--------------------------------------------------------------------------------

  Final Cartesian lattice vectors (Angstroms) :

        4.000000    0.000000    0.000000
        0.000000    4.000000    0.000000
        0.000000    0.000000    4.000000
";

    fn relaxer() -> GulpRelaxer {
        let species = vec![
            Species { symbol: "Mg".into(), ..Default::default() },
            Species { symbol: "O".into(), ..Default::default() },
        ];
        GulpRelaxer::new("gulp", "buckingham\n", species).unwrap()
    }

    fn rock_salt_pair() -> Structure {
        let mut s = Structure::new("Test");
        s.lattice = Lattice::cubic(3.0);
        s.atoms.push(Atom::new(0, Point3::new(0.1, 0.0, 0.0)));
        s.atoms.push(Atom::new(1, Point3::new(1.4, 1.5, 1.5)));
        s
    }

    #[test]
    fn parses_final_energy_over_lattice_energy() {
        let e = relaxer().parse_energy(PERIODIC_OUTPUT).unwrap();
        assert!((e + 41.07551691).abs() < 1e-9);
    }

    #[test]
    fn parses_relaxed_cell_and_positions() {
        let relaxed = relaxer().parse_geometry(PERIODIC_OUTPUT, &rock_salt_pair()).unwrap();
        assert!((relaxed.volume() - 64.0).abs() < 1e-6);
        assert!((relaxed.atoms[1].position.x - 2.0).abs() < 1e-9);
        assert!(relaxed.atoms[0].position.coords.norm() < 1e-9);
    }

    #[test]
    fn rejects_truncated_coordinates() {
        let mut s = rock_salt_pair();
        s.atoms.push(Atom::new(0, Point3::new(1.0, 1.0, 1.0)));
        assert!(relaxer().parse_geometry(PERIODIC_OUTPUT, &s).is_err());
    }

    #[test]
    fn periodic_input_carries_pressure() {
        let input = relaxer().with_pressure(2.5).generate_input(&rock_salt_pair()).unwrap();
        assert!(input.starts_with("opti conv conp"));
        assert!(input.contains("pressure 2.500000 GPa"));
        assert!(input.contains("Mg  core"));
    }
}
