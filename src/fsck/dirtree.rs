/* Tabla de directorios encontrados en la pasada 1, con los dos padres que
se conocen de cada uno: el que dice su entrada ".." y el directorio donde
apareció como entrada durante el recorrido. */

use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirInfo {
    pub dinode: u64,
    pub treewalk_parent: u64,
    pub dotdot_parent: u64,
    /// Alcanzable desde la raíz.
    pub checked: bool,
}

#[derive(Debug, Default)]
pub struct DirTree {
    dirs: BTreeMap<u64, DirInfo>,
}

impl DirTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, dinode: u64) -> &mut DirInfo {
        self.dirs.entry(dinode).or_insert(DirInfo { dinode, ..Default::default() })
    }

    pub fn get(&self, dinode: u64) -> Option<&DirInfo> {
        self.dirs.get(&dinode)
    }

    pub fn get_mut(&mut self, dinode: u64) -> Option<&mut DirInfo> {
        self.dirs.get_mut(&dinode)
    }

    pub fn remove(&mut self, dinode: u64) -> Option<DirInfo> {
        self.dirs.remove(&dinode)
    }

    pub fn contains(&self, dinode: u64) -> bool {
        self.dirs.contains_key(&dinode)
    }

    pub fn is_checked(&self, dinode: u64) -> bool {
        self.dirs.get(&dinode).is_some_and(|d| d.checked)
    }

    pub fn set_checked(&mut self, dinode: u64) {
        if let Some(d) = self.dirs.get_mut(&dinode) {
            d.checked = true;
        }
    }

    pub fn set_dotdot(&mut self, dinode: u64, parent: u64) {
        if let Some(d) = self.dirs.get_mut(&dinode) {
            d.dotdot_parent = parent;
        }
    }

    /// Anota el padre por recorrido; el primero que se encuentra gana.
    /// Devuelve false si ya tenía otro.
    pub fn set_treewalk(&mut self, dinode: u64, parent: u64) -> bool {
        match self.dirs.get_mut(&dinode) {
            Some(d) if d.treewalk_parent == 0 || d.treewalk_parent == parent => {
                d.treewalk_parent = parent;
                true
            }
            Some(_) => false,
            None => true,
        }
    }

    pub fn keys(&self) -> Vec<u64> {
        self.dirs.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DirInfo> {
        self.dirs.values()
    }

    pub fn len(&self) -> usize {
        self.dirs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_treewalk_parent_wins() {
        let mut dt = DirTree::new();
        dt.insert(500);
        assert!(dt.set_treewalk(500, 8));
        assert!(dt.set_treewalk(500, 8));
        assert!(!dt.set_treewalk(500, 9));
        assert_eq!(dt.get(500).unwrap().treewalk_parent, 8);
    }

    #[test]
    fn test_insert_keeps_existing_entry() {
        let mut dt = DirTree::new();
        dt.insert(500).dotdot_parent = 7;
        dt.insert(500);
        assert_eq!(dt.get(500).unwrap().dotdot_parent, 7);
        assert!(!dt.is_checked(500));
        dt.set_checked(500);
        assert!(dt.is_checked(500));
    }
}
