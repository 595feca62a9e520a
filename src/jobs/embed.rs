// 3D geometry for parsed structures

use nalgebra::Vector3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::smiles::{BondOrder, Structure};
use crate::types::{StageError, StageResult};

/// Atom with cartesian coordinates in Ångström
#[derive(Debug, Clone, PartialEq)]
pub struct Atom {
    pub element: String,
    pub position: Vector3<f64>,
}

/// Turns a parsed structure into an all-atom 3D geometry.
///
/// Implementations must be deterministic for a given seed so that rebuilding a
/// batch reproduces the same coordinate files.
pub trait GeometryBuilder: Send + Sync {
    fn embed(&self, structure: &Structure, seed: u64) -> StageResult<Vec<Atom>>;
}

/// Seeded random start followed by a relaxation of harmonic bond and angle
/// springs with a soft non-bonded repulsion.
///
/// Good enough as a starting geometry for a quantum-chemical optimization;
/// not a conformer search.
#[derive(Debug, Clone)]
pub struct SpringEmbedder {
    pub iterations: usize,
    pub step: f64,
}

impl Default for SpringEmbedder {
    fn default() -> Self {
        Self::new(400)
    }
}

struct Spring {
    a: usize,
    b: usize,
    length: f64,
    stiffness: f64,
}

const REPULSION_RANGE: f64 = 2.5;
const MAX_DISPLACEMENT: f64 = 0.2;

impl SpringEmbedder {
    pub fn new(iterations: usize) -> Self {
        Self {
            iterations,
            step: 0.05,
        }
    }

    fn relax(&self, positions: &mut [Vector3<f64>], springs: &[Spring], bonded: &[Vec<bool>]) {
        let n = positions.len();
        let mut forces: Vec<Vector3<f64>> = vec![Vector3::zeros(); n];

        for _ in 0..self.iterations {
            forces.iter_mut().for_each(|f| *f = Vector3::zeros());

            for spring in springs {
                let delta = positions[spring.b] - positions[spring.a];
                let distance = delta.norm().max(1e-6);
                let force = delta / distance * (spring.stiffness * (distance - spring.length));
                forces[spring.a] += force;
                forces[spring.b] -= force;
            }

            for i in 0..n {
                for j in (i + 1)..n {
                    if bonded[i][j] {
                        continue;
                    }
                    let delta = positions[j] - positions[i];
                    let distance = delta.norm();
                    if distance >= REPULSION_RANGE {
                        continue;
                    }
                    let direction = if distance < 1e-6 {
                        // coincident atoms: separate along a fixed axis
                        Vector3::new(1.0, 0.0, 0.0)
                    } else {
                        delta / distance
                    };
                    let force = direction * (0.3 * (REPULSION_RANGE - distance));
                    forces[i] -= force;
                    forces[j] += force;
                }
            }

            for (position, force) in positions.iter_mut().zip(&forces) {
                let mut displacement = force * self.step;
                let length = displacement.norm();
                if length > MAX_DISPLACEMENT {
                    displacement *= MAX_DISPLACEMENT / length;
                }
                *position += displacement;
            }
        }
    }
}

impl GeometryBuilder for SpringEmbedder {
    fn embed(&self, structure: &Structure, seed: u64) -> StageResult<Vec<Atom>> {
        if structure.atoms.is_empty() {
            return Err(StageError::Parse("structure has no atoms".to_string()));
        }

        // heavy atoms first, then one hydrogen per missing valence
        let mut elements: Vec<String> = structure.atoms.iter().map(|a| a.element.clone()).collect();
        let mut edges: Vec<(usize, usize, BondOrder)> =
            structure.bonds.iter().map(|b| (b.a, b.b, b.order)).collect();
        for heavy in 0..structure.atoms.len() {
            for _ in 0..structure.implicit_hydrogens(heavy) {
                edges.push((heavy, elements.len(), BondOrder::Single));
                elements.push("H".to_string());
            }
        }

        let n = elements.len();
        let mut neighbours: Vec<Vec<(usize, f64)>> = vec![Vec::new(); n];
        let mut bonded = vec![vec![false; n]; n];
        let mut springs = Vec::with_capacity(edges.len() * 2);
        let mut unsaturated = vec![false; n];
        let mut triple = vec![false; n];

        for &(a, b, order) in &edges {
            let length = bond_length(&elements[a], &elements[b], order);
            neighbours[a].push((b, length));
            neighbours[b].push((a, length));
            bonded[a][b] = true;
            bonded[b][a] = true;
            springs.push(Spring {
                a,
                b,
                length,
                stiffness: 2.0,
            });
            if order != BondOrder::Single {
                unsaturated[a] = true;
                unsaturated[b] = true;
            }
            if order == BondOrder::Triple {
                triple[a] = true;
                triple[b] = true;
            }
        }

        // 1-3 springs hold the bond angles
        for centre in 0..n {
            let angle: f64 = if triple[centre] {
                180.0
            } else if unsaturated[centre] {
                120.0
            } else {
                109.47
            };
            let cos = angle.to_radians().cos();
            let around = &neighbours[centre];
            for (i, &(a, la)) in around.iter().enumerate() {
                for &(b, lb) in &around[i + 1..] {
                    let length = (la * la + lb * lb - 2.0 * la * lb * cos).sqrt();
                    bonded[a][b] = true;
                    bonded[b][a] = true;
                    springs.push(Spring {
                        a,
                        b,
                        length,
                        stiffness: 0.8,
                    });
                }
            }
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let spread = (n as f64).cbrt() * 1.5;
        let mut positions: Vec<Vector3<f64>> = (0..n)
            .map(|_| {
                Vector3::new(
                    rng.gen_range(-spread..=spread),
                    rng.gen_range(-spread..=spread),
                    rng.gen_range(-spread..=spread),
                )
            })
            .collect();

        self.relax(&mut positions, &springs, &bonded);

        let centroid = positions.iter().fold(Vector3::<f64>::zeros(), |acc, p| acc + p) / n as f64;
        Ok(elements
            .into_iter()
            .zip(positions)
            .map(|(element, position)| Atom {
                element,
                position: position - centroid,
            })
            .collect())
    }
}

fn covalent_radius(element: &str) -> f64 {
    match element {
        "H" => 0.31,
        "B" => 0.84,
        "C" => 0.76,
        "N" => 0.71,
        "O" => 0.66,
        "F" => 0.57,
        "Si" => 1.11,
        "P" => 1.07,
        "S" => 1.05,
        "Cl" => 1.02,
        "Se" => 1.20,
        "Br" => 1.20,
        "I" => 1.39,
        _ => 1.20,
    }
}

fn bond_length(a: &str, b: &str, order: BondOrder) -> f64 {
    let single = covalent_radius(a) + covalent_radius(b);
    match order {
        BondOrder::Single => single,
        BondOrder::Aromatic => single * 0.93,
        BondOrder::Double => single * 0.87,
        BondOrder::Triple => single * 0.78,
    }
}
