/// Sequence CRDT for card descriptions.
///
/// The text is an ordered run of character atoms, each stamped with the
/// `Hlc` that was ticked when it was typed. Atoms are never mutated and
/// deletion removes them outright (no tombstones). Two replicas holding
/// the same atom set render the same string: merge keeps the relative
/// order of atoms both sides know, and orders concurrent runs at a
/// divergence point by their head stamp, newest first.
use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::clock::{Hlc, HybridClock};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Atom {
    pub id: Hlc,
    pub value: char,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Text {
    atoms: Vec<Atom>,
}

impl Text {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a text owned by a synthetic node, used for seed content.
    pub fn seeded(s: &str, node_id: &str) -> Self {
        let atoms = s
            .chars()
            .enumerate()
            .map(|(i, value)| Atom {
                id: Hlc::new(i as u64 + 1, node_id),
                value,
            })
            .collect();
        Self { atoms }
    }

    pub fn len(&self) -> usize {
        self.atoms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.atoms.is_empty()
    }

    pub fn atoms(&self) -> &[Atom] {
        &self.atoms
    }

    /// Insert `text` before the atom at visible position `pos`, ticking
    /// the clock once per character. Positions past the end append.
    pub fn insert(&mut self, pos: usize, text: &str, clock: &mut HybridClock) {
        let mut at = pos.min(self.atoms.len());
        for value in text.chars() {
            let atom = Atom {
                id: clock.now(),
                value,
            };
            self.atoms.insert(at, atom);
            at += 1;
        }
    }

    /// Splice pre-stamped atoms in before visible position `pos`,
    /// skipping any atom already present. Used when replaying a patch
    /// from another replica.
    pub fn splice(&mut self, pos: usize, atoms: &[Atom]) -> bool {
        let have: HashSet<&Hlc> = self.atoms.iter().map(|a| &a.id).collect();
        let fresh: Vec<Atom> = atoms
            .iter()
            .filter(|a| !have.contains(&a.id))
            .cloned()
            .collect();
        if fresh.is_empty() {
            return false;
        }
        let at = pos.min(self.atoms.len());
        self.atoms.splice(at..at, fresh);
        true
    }

    /// Remove up to `len` atoms starting at visible position `pos`.
    pub fn delete(&mut self, pos: usize, len: usize) -> bool {
        if pos >= self.atoms.len() || len == 0 {
            return false;
        }
        let end = (pos + len).min(self.atoms.len());
        self.atoms.drain(pos..end);
        true
    }

    /// Union with another replica's atom sequence. Returns true iff the
    /// local sequence changed.
    pub fn merge(&mut self, other: &Text) -> bool {
        if self.atoms == other.atoms {
            return false;
        }
        let merged = merge_sequences(&self.atoms, &other.atoms);
        let changed = merged != self.atoms;
        self.atoms = merged;
        changed
    }

    pub fn to_string(&self) -> String {
        self.atoms.iter().map(|a| a.value).collect()
    }
}

/// Two-way sequence merge. Atoms present in both sides keep their common
/// relative order; a run of atoms only one side knows stays contiguous
/// and is placed at its divergence point, runs with the larger head
/// stamp first.
fn merge_sequences(a: &[Atom], b: &[Atom]) -> Vec<Atom> {
    let ids_a: HashSet<&Hlc> = a.iter().map(|x| &x.id).collect();
    let ids_b: HashSet<&Hlc> = b.iter().map(|x| &x.id).collect();

    fn push(out: &mut Vec<Atom>, emitted: &mut HashSet<Hlc>, atom: &Atom) {
        if emitted.insert(atom.id.clone()) {
            out.push(atom.clone());
        }
    }

    let mut out: Vec<Atom> = Vec::with_capacity(a.len().max(b.len()));
    let mut emitted: HashSet<Hlc> = HashSet::new();
    let mut i = 0;
    let mut j = 0;

    while i < a.len() || j < b.len() {
        if i < a.len() && j < b.len() && a[i].id == b[j].id {
            push(&mut out, &mut emitted, &a[i]);
            i += 1;
            j += 1;
            continue;
        }

        // Collect the exclusive run at each head.
        let run_a: &[Atom] = {
            let start = i;
            let mut end = i;
            while end < a.len() && !ids_b.contains(&a[end].id) {
                end += 1;
            }
            &a[start..end]
        };
        let run_b: &[Atom] = {
            let start = j;
            let mut end = j;
            while end < b.len() && !ids_a.contains(&b[end].id) {
                end += 1;
            }
            &b[start..end]
        };

        if run_a.is_empty() && run_b.is_empty() {
            // Both heads are shared atoms appearing in different order;
            // emit the smaller head to stay deterministic either way.
            if j >= b.len() || (i < a.len() && a[i].id < b[j].id) {
                push(&mut out, &mut emitted, &a[i]);
                i += 1;
            } else {
                push(&mut out, &mut emitted, &b[j]);
                j += 1;
            }
            continue;
        }

        let take_a = !run_a.is_empty()
            && (run_b.is_empty() || run_a[0].id > run_b[0].id);
        if take_a {
            for atom in run_a {
                push(&mut out, &mut emitted, atom);
            }
            i += run_a.len();
        } else {
            for atom in run_b {
                push(&mut out, &mut emitted, atom);
            }
            j += run_b.len();
        }
    }

    out
}
