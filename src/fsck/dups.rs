/* Bloques reclamados por más de un dueño. Aquí solo se junta la evidencia;
decidir quién se queda con el bloque le toca a un paso posterior. */

use std::collections::BTreeMap;

use log::{debug, info};

/// Cómo referencia el inodo al bloque.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    Meta = 0,
    Data = 1,
    Eattr = 2,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub inode: u64,
    /// Referencias por tipo, indexado por RefKind.
    pub ref_counts: [u32; 3],
    pub dup_count: u32,
}

impl Claim {
    fn new(inode: u64) -> Self {
        Self { inode, ref_counts: [0; 3], dup_count: 0 }
    }

    pub fn refs_of(&self, kind: RefKind) -> u32 {
        self.ref_counts[kind as usize]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DupRecord {
    pub block: u64,
    /// Referencias totales, incluida la del primer dueño.
    pub refs: u32,
    pub first_ref_found: bool,
    /// Reclamos de inodos que se consideran válidos.
    pub valid: Vec<Claim>,
    /// Reclamos de inodos dañados; no compiten por el bloque.
    pub invalid: Vec<Claim>,
}

impl DupRecord {
    fn new(block: u64) -> Self {
        Self { block, refs: 1, first_ref_found: false, valid: Vec::new(), invalid: Vec::new() }
    }

    pub fn claim(&self, inode: u64) -> Option<&Claim> {
        self.valid.iter().chain(&self.invalid).find(|c| c.inode == inode)
    }

    pub fn claimants(&self) -> impl Iterator<Item = &Claim> {
        self.valid.iter().chain(&self.invalid)
    }
}

#[derive(Debug, Default)]
pub struct DupTracker {
    records: BTreeMap<u64, DupRecord>,
}

impl DupTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Anota que `inode` referencia `block`. `first` indica que es el dueño
    /// original (el que marcó el bloque en el mapa), que ya está contado.
    pub fn add_claim(&mut self, block: u64, inode: u64, kind: RefKind, first: bool, valid: bool) {
        let rec = self.records.entry(block).or_insert_with(|| {
            info!("bloque {} (0x{:x}) tiene más de una referencia", block, block);
            DupRecord::new(block)
        });
        if first {
            rec.first_ref_found = true;
        } else {
            rec.refs += 1;
        }

        let in_valid = rec.valid.iter().position(|c| c.inode == inode);
        let in_invalid = rec.invalid.iter().position(|c| c.inode == inode);
        let claim = match (in_valid, in_invalid) {
            (Some(i), _) => &mut rec.valid[i],
            (None, Some(i)) => &mut rec.invalid[i],
            (None, None) => {
                let list = if valid { &mut rec.valid } else { &mut rec.invalid };
                list.push(Claim::new(inode));
                let last = list.len() - 1;
                &mut list[last]
            }
        };
        claim.ref_counts[kind as usize] += 1;
        claim.dup_count += 1;
        debug!(
            "inodo {} reclama el bloque {} como {:?} ({} referencias)",
            inode, block, kind, rec.refs
        );
    }

    /// Pasa el reclamo de `inode` a la lista de inodos inválidos.
    pub fn move_to_invalid(&mut self, block: u64, inode: u64) -> bool {
        let Some(rec) = self.records.get_mut(&block) else {
            return false;
        };
        let Some(i) = rec.valid.iter().position(|c| c.inode == inode) else {
            return false;
        };
        let claim = rec.valid.remove(i);
        rec.invalid.push(claim);
        true
    }

    /// Quita las referencias de `inode` a `block`. Devuelve true si el bloque
    /// sigue duplicado.
    pub fn find_remove(&mut self, block: u64, inode: u64) -> bool {
        let Some(rec) = self.records.get_mut(&block) else {
            return false;
        };
        let removed = if let Some(i) = rec.valid.iter().position(|c| c.inode == inode) {
            rec.valid.remove(i).dup_count
        } else if let Some(i) = rec.invalid.iter().position(|c| c.inode == inode) {
            rec.invalid.remove(i).dup_count
        } else {
            1
        };
        rec.refs = rec.refs.saturating_sub(removed);
        if rec.refs <= 1 {
            debug!("el bloque {} ya no está duplicado", block);
            self.records.remove(&block);
            return false;
        }
        true
    }

    pub fn get(&self, block: u64) -> Option<&DupRecord> {
        self.records.get(&block)
    }

    pub fn get_mut(&mut self, block: u64) -> Option<&mut DupRecord> {
        self.records.get_mut(&block)
    }

    pub fn contains(&self, block: u64) -> bool {
        self.records.contains_key(&block)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DupRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_owner_creates_record() {
        let mut dups = DupTracker::new();
        dups.add_claim(42, 200, RefKind::Data, false, true);
        let rec = dups.get(42).unwrap();
        assert_eq!(rec.refs, 2);
        assert!(!rec.first_ref_found);
        assert_eq!(rec.valid.len(), 1);
        assert_eq!(rec.valid[0].refs_of(RefKind::Data), 1);

        dups.add_claim(42, 100, RefKind::Meta, true, true);
        let rec = dups.get(42).unwrap();
        assert_eq!(rec.refs, 2);
        assert!(rec.first_ref_found);
        assert_eq!(rec.claim(100).unwrap().refs_of(RefKind::Meta), 1);
        assert_eq!(rec.claimants().count(), 2);
    }

    #[test]
    fn test_invalid_claims_are_kept_apart() {
        let mut dups = DupTracker::new();
        dups.add_claim(7, 300, RefKind::Meta, false, false);
        dups.add_claim(7, 301, RefKind::Eattr, false, true);
        let rec = dups.get(7).unwrap();
        assert_eq!(rec.invalid.len(), 1);
        assert_eq!(rec.valid.len(), 1);

        assert!(dups.move_to_invalid(7, 301));
        assert!(!dups.move_to_invalid(7, 301));
        let rec = dups.get(7).unwrap();
        assert!(rec.valid.is_empty());
        assert_eq!(rec.invalid.len(), 2);
    }

    #[test]
    fn test_repeated_claims_accumulate() {
        let mut dups = DupTracker::new();
        dups.add_claim(9, 400, RefKind::Data, false, true);
        dups.add_claim(9, 400, RefKind::Data, false, true);
        let rec = dups.get(9).unwrap();
        assert_eq!(rec.refs, 3);
        assert_eq!(rec.valid.len(), 1);
        assert_eq!(rec.valid[0].dup_count, 2);
    }

    #[test]
    fn test_find_remove_drops_record_when_single_owner_left() {
        let mut dups = DupTracker::new();
        dups.add_claim(11, 500, RefKind::Data, false, true);
        dups.add_claim(11, 501, RefKind::Data, false, true);
        assert!(dups.find_remove(11, 500));
        assert!(!dups.find_remove(11, 501));
        assert!(!dups.contains(11));
        assert!(!dups.find_remove(11, 501));
    }
}
