//! Minimal SMILES reader.
//!
//! Understands the organic subset, aromatic lower-case atoms, bracket atoms
//! with isotope, chirality, hydrogen count, charge and atom class, branches,
//! bond symbols, ring closures (`1`..`9`, `%nn`) and `.`-separated fragments.
//! Stereo bond marks are read as single bonds.

use std::collections::HashMap;

use crate::types::{StageError, StageResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BondOrder {
    Single,
    Double,
    Triple,
    Aromatic,
}

impl BondOrder {
    /// Valence contribution; aromatic bonds count one, the extra electron is
    /// accounted for per aromatic atom
    fn valence(self) -> u32 {
        match self {
            BondOrder::Single | BondOrder::Aromatic => 1,
            BondOrder::Double => 2,
            BondOrder::Triple => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SmilesAtom {
    /// Element symbol with normal capitalisation (`C`, `Cl`, `Se`)
    pub element: String,
    pub aromatic: bool,
    pub charge: i32,
    /// Hydrogen count given inside brackets
    pub explicit_h: Option<u32>,
    pub bracket: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bond {
    pub a: usize,
    pub b: usize,
    pub order: BondOrder,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Structure {
    pub atoms: Vec<SmilesAtom>,
    pub bonds: Vec<Bond>,
}

impl Structure {
    pub fn formal_charge(&self) -> i32 {
        self.atoms.iter().map(|a| a.charge).sum()
    }

    pub fn neighbours(&self, atom: usize) -> impl Iterator<Item = (usize, BondOrder)> + '_ {
        self.bonds.iter().filter_map(move |bond| {
            if bond.a == atom {
                Some((bond.b, bond.order))
            } else if bond.b == atom {
                Some((bond.a, bond.order))
            } else {
                None
            }
        })
    }

    /// Hydrogens to add to an atom: the bracket count, or for organic-subset
    /// atoms the gap to the lowest default valence that fits the bonds
    pub fn implicit_hydrogens(&self, atom: usize) -> u32 {
        let a = &self.atoms[atom];
        if a.bracket {
            return a.explicit_h.unwrap_or(0);
        }
        let mut used: u32 = self.neighbours(atom).map(|(_, order)| order.valence()).sum();
        if a.aromatic {
            used += 1;
        }
        default_valences(&a.element)
            .iter()
            .find(|&&v| v >= used)
            .map(|v| v - used)
            .unwrap_or(0)
    }
}

fn default_valences(element: &str) -> &'static [u32] {
    match element {
        "B" => &[3],
        "C" => &[4],
        "N" => &[3, 5],
        "O" => &[2],
        "P" => &[3, 5],
        "S" => &[2, 4, 6],
        "F" | "Cl" | "Br" | "I" => &[1],
        _ => &[],
    }
}

const ORGANIC: [&str; 10] = ["Cl", "Br", "B", "C", "N", "O", "P", "S", "F", "I"];
const AROMATIC_ORGANIC: [&str; 6] = ["b", "c", "n", "o", "p", "s"];
const AROMATIC_BRACKET: [&str; 8] = ["se", "as", "b", "c", "n", "o", "p", "s"];

struct Parser<'a> {
    text: &'a str,
    pos: usize,
    structure: Structure,
    previous: Option<usize>,
    branches: Vec<Option<usize>>,
    pending_bond: Option<BondOrder>,
    rings: HashMap<u32, (usize, Option<BondOrder>)>,
}

/// Parse a SMILES string into atoms and bonds
pub fn parse(smiles: &str) -> StageResult<Structure> {
    let smiles = smiles.trim();
    if smiles.is_empty() {
        return Err(StageError::Parse("empty SMILES".to_string()));
    }

    let mut parser = Parser {
        text: smiles,
        pos: 0,
        structure: Structure::default(),
        previous: None,
        branches: Vec::new(),
        pending_bond: None,
        rings: HashMap::new(),
    };
    parser.run()?;
    Ok(parser.structure)
}

impl<'a> Parser<'a> {
    fn rest(&self) -> &'a str {
        &self.text[self.pos..]
    }

    fn error(&self, message: &str) -> StageError {
        StageError::Parse(format!("{} at position {} in '{}'", message, self.pos, self.text))
    }

    fn run(&mut self) -> StageResult<()> {
        while let Some(c) = self.rest().chars().next() {
            match c {
                '(' => {
                    if self.previous.is_none() {
                        return Err(self.error("branch without a preceding atom"));
                    }
                    self.branches.push(self.previous);
                    self.pos += 1;
                }
                ')' => {
                    self.previous = self
                        .branches
                        .pop()
                        .ok_or_else(|| self.error("unbalanced ')'"))?;
                    self.pos += 1;
                }
                '-' | '/' | '\\' => self.bond(BondOrder::Single),
                '=' => self.bond(BondOrder::Double),
                '#' => self.bond(BondOrder::Triple),
                ':' => self.bond(BondOrder::Aromatic),
                '.' => {
                    self.previous = None;
                    self.pos += 1;
                }
                '%' => {
                    let digits = self.rest().get(1..3).unwrap_or("");
                    let number = digits
                        .parse::<u32>()
                        .map_err(|_| self.error("'%' must be followed by two digits"))?;
                    self.pos += 3;
                    self.ring(number)?;
                }
                d if d.is_ascii_digit() => {
                    self.pos += 1;
                    self.ring(d.to_digit(10).unwrap_or(0))?;
                }
                '[' => self.bracket_atom()?,
                _ => self.organic_atom()?,
            }
        }

        if !self.branches.is_empty() {
            return Err(self.error("unclosed branch"));
        }
        if let Some(number) = self.rings.keys().next() {
            return Err(self.error(&format!("unclosed ring {number}")));
        }
        if self.structure.atoms.is_empty() {
            return Err(self.error("no atoms"));
        }
        Ok(())
    }

    fn bond(&mut self, order: BondOrder) {
        self.pending_bond = Some(order);
        self.pos += 1;
    }

    fn ring(&mut self, number: u32) -> StageResult<()> {
        let current = self
            .previous
            .ok_or_else(|| self.error("ring closure without a preceding atom"))?;
        let pending = self.pending_bond.take();
        match self.rings.remove(&number) {
            Some((opened, opened_bond)) => {
                let order = pending
                    .or(opened_bond)
                    .unwrap_or_else(|| self.default_order(opened, current));
                self.structure.bonds.push(Bond {
                    a: opened,
                    b: current,
                    order,
                });
            }
            None => {
                self.rings.insert(number, (current, pending));
            }
        }
        Ok(())
    }

    fn default_order(&self, a: usize, b: usize) -> BondOrder {
        if self.structure.atoms[a].aromatic && self.structure.atoms[b].aromatic {
            BondOrder::Aromatic
        } else {
            BondOrder::Single
        }
    }

    fn add_atom(&mut self, atom: SmilesAtom) {
        let index = self.structure.atoms.len();
        self.structure.atoms.push(atom);
        if let Some(previous) = self.previous {
            let order = self
                .pending_bond
                .take()
                .unwrap_or_else(|| self.default_order(previous, index));
            self.structure.bonds.push(Bond {
                a: previous,
                b: index,
                order,
            });
        }
        self.pending_bond = None;
        self.previous = Some(index);
    }

    fn organic_atom(&mut self) -> StageResult<()> {
        let rest = self.rest();
        let (symbol, aromatic) = if let Some(s) = ORGANIC.iter().find(|s| rest.starts_with(**s)) {
            (s.to_string(), false)
        } else if let Some(s) = AROMATIC_ORGANIC.iter().find(|s| rest.starts_with(**s)) {
            (s.to_uppercase(), true)
        } else if rest.starts_with('*') {
            ("*".to_string(), false)
        } else {
            return Err(self.error("unexpected character"));
        };

        self.pos += if symbol == "*" { 1 } else { symbol.len() };
        self.add_atom(SmilesAtom {
            element: symbol,
            aromatic,
            charge: 0,
            explicit_h: None,
            bracket: false,
        });
        Ok(())
    }

    fn bracket_atom(&mut self) -> StageResult<()> {
        let close = self
            .rest()
            .find(']')
            .ok_or_else(|| self.error("unclosed '['"))?;
        let body = &self.rest()[1..close];
        let atom = parse_bracket(body).map_err(|message| self.error(&message))?;
        self.pos += close + 1;
        self.add_atom(atom);
        Ok(())
    }
}

/// Parse the inside of `[...]`
fn parse_bracket(body: &str) -> Result<SmilesAtom, String> {
    let mut rest = body.trim_start_matches(|c: char| c.is_ascii_digit());

    let (element, aromatic) = if let Some(s) = AROMATIC_BRACKET.iter().find(|s| rest.starts_with(**s)) {
        rest = &rest[s.len()..];
        (capitalise(s), true)
    } else {
        let mut chars = rest.chars();
        match chars.next() {
            Some('*') => {
                rest = &rest[1..];
                ("*".to_string(), false)
            }
            Some(first) if first.is_ascii_uppercase() => {
                let len = match chars.next() {
                    Some(second) if second.is_ascii_lowercase() => 2,
                    _ => 1,
                };
                let symbol = rest[..len].to_string();
                rest = &rest[len..];
                (symbol, false)
            }
            _ => return Err(format!("bad bracket atom '[{body}]'")),
        }
    };

    rest = rest.trim_start_matches('@');
    // tetrahedral/allene classes such as @TH1 or @AL2
    for class in ["TH", "AL", "SP", "TB", "OH"] {
        if let Some(stripped) = rest.strip_prefix(class) {
            rest = stripped.trim_start_matches(|c: char| c.is_ascii_digit());
        }
    }

    let mut explicit_h = Some(0);
    if let Some(after) = rest.strip_prefix('H') {
        let digits: String = after.chars().take_while(|c| c.is_ascii_digit()).collect();
        explicit_h = Some(if digits.is_empty() {
            1
        } else {
            digits.parse().map_err(|_| format!("bad hydrogen count in '[{body}]'"))?
        });
        rest = &after[digits.len()..];
    }

    let mut charge = 0;
    if let Some(sign) = rest.chars().next().filter(|c| *c == '+' || *c == '-') {
        let unit = if sign == '+' { 1 } else { -1 };
        let repeated = rest.chars().take_while(|c| *c == sign).count();
        let after = &rest[repeated..];
        let digits: String = after.chars().take_while(|c| c.is_ascii_digit()).collect();
        charge = if !digits.is_empty() && repeated == 1 {
            unit * digits
                .parse::<i32>()
                .map_err(|_| format!("bad charge in '[{body}]'"))?
        } else {
            unit * repeated as i32
        };
        rest = &after[digits.len()..];
    }

    if let Some(class) = rest.strip_prefix(':') {
        if !class.chars().all(|c| c.is_ascii_digit()) {
            return Err(format!("bad atom class in '[{body}]'"));
        }
        rest = "";
    }
    if !rest.is_empty() {
        return Err(format!("trailing '{rest}' in '[{body}]'"));
    }

    Ok(SmilesAtom {
        element,
        aromatic,
        charge,
        explicit_h,
        bracket: true,
    })
}

fn capitalise(symbol: &str) -> String {
    let mut chars = symbol.chars();
    match chars.next() {
        Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_chain_and_branch() {
        let s = parse("CC(=O)O").unwrap();
        assert_eq!(s.atoms.len(), 4);
        assert_eq!(s.bonds.len(), 3);
        assert_eq!(s.bonds[1].order, BondOrder::Double);
        assert_eq!(s.bonds[2].a, 1);
        assert_eq!(s.implicit_hydrogens(0), 3);
        assert_eq!(s.implicit_hydrogens(1), 0);
        assert_eq!(s.implicit_hydrogens(3), 1);
    }

    #[test]
    fn test_parse_aromatic_ring() {
        let s = parse("c1ccccc1").unwrap();
        assert_eq!(s.atoms.len(), 6);
        assert_eq!(s.bonds.len(), 6);
        assert!(s.bonds.iter().all(|b| b.order == BondOrder::Aromatic));
        assert!((0..6).all(|i| s.implicit_hydrogens(i) == 1));
    }

    #[test]
    fn test_bracket_atoms_and_charge() {
        let s = parse("[NH4+].[O-]C(=O)C(F)(F)F").unwrap();
        assert_eq!(s.formal_charge(), 0);
        assert_eq!(s.atoms[0].explicit_h, Some(4));
        assert_eq!(s.implicit_hydrogens(0), 4);

        assert_eq!(parse("[O-]C(=O)C").unwrap().formal_charge(), -1);
        assert_eq!(parse("[Fe+2]").unwrap().formal_charge(), 2);
        assert_eq!(parse("[N++]").unwrap().formal_charge(), 2);
        assert_eq!(parse("[13CH3-]").unwrap().atoms[0].element, "C");
        assert!(parse("[nH]1cccc1").unwrap().atoms[0].aromatic);
    }

    #[test]
    fn test_two_digit_ring_closure() {
        let s = parse("C%12CCC%12").unwrap();
        assert_eq!(s.bonds.len(), 4);
        assert_eq!(s.implicit_hydrogens(0), 2);
    }

    #[test]
    fn test_invalid_smiles() {
        assert!(parse("").is_err());
        assert!(parse("C1CC").is_err());
        assert!(parse("C(C").is_err());
        assert!(parse("C)C").is_err());
        assert!(parse("[C").is_err());
        assert!(parse("Xy").is_err());
    }
}
