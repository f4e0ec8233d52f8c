mod common;

use common::line_cluster;
use csp_workflow::core::domain::{Atom, Lattice, Structure};
use csp_workflow::engine::operators::{crossover_cut_splice, Mutator};
use nalgebra::Point3;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

#[test]
fn test_mutation_rattle() {
    let c = line_cluster(2);
    let mut rng = ChaCha8Rng::seed_from_u64(11);

    // Rattle should change positions relative to each other
    let mutated = Mutator::new().rattle(0.5).apply(&c, &mut rng);

    let dist_orig = (c.atoms[0].position - c.atoms[1].position).norm();
    let dist_new = (mutated.atoms[0].position - mutated.atoms[1].position).norm();

    assert!((dist_orig - dist_new).abs() > 1e-9);
    assert_ne!(mutated.uid, c.uid);
    assert_eq!(mutated.origin, "Mutation");
}

#[test]
fn test_swap_keeps_stoichiometry() {
    let c = line_cluster(6);
    let mut rng = ChaCha8Rng::seed_from_u64(5);

    let mutated = Mutator::new().swap(2).apply(&c, &mut rng);
    assert!(mutated.check_stoichiometry(&[3, 3]));
}

#[test]
fn test_breathing_scales_cell() {
    let mut s = Structure::new("Cell");
    s.lattice = Lattice::cubic(5.0);
    s.atoms.push(Atom::new(0, Point3::new(1.0, 1.0, 1.0)));
    s.atoms.push(Atom::new(1, Point3::new(3.5, 3.5, 3.5)));

    let mut rng = ChaCha8Rng::seed_from_u64(9);
    let mutated = Mutator::new().breathing(0.1).apply(&s, &mut rng);

    let ratio = mutated.volume() / s.volume();
    assert!(ratio > 0.9f64.powi(3) - 1e-9 && ratio < 1.1f64.powi(3) + 1e-9);
    assert_eq!(mutated.num_atoms(), 2);
}

#[test]
fn test_crossover() {
    let p1 = line_cluster(4); // 2 of type 0, 2 of type 1
    let p2 = line_cluster(4);

    let mut rng = ChaCha8Rng::seed_from_u64(2);
    let c = crossover_cut_splice(&p1, &p2, &mut rng).expect("crossover failed");
    assert_eq!(c.atoms.len(), 4);

    // Stoichiometry is repaired after the splice
    let count0 = c.atoms.iter().filter(|a| a.element_id == 0).count();
    let count1 = c.atoms.iter().filter(|a| a.element_id == 1).count();
    assert_eq!(count0, 2);
    assert_eq!(count1, 2);
}
