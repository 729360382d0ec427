/* Conteo de enlaces: lo que dice cada dinode (di_nlink) contra las
referencias que se van encontrando. La comparación final es de un paso
posterior. */

use std::collections::BTreeMap;

use log::{debug, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InodeInfo {
    pub di_nlink: u32,
    pub counted_links: u32,
}

#[derive(Debug, Default)]
pub struct LinkCounts {
    inodes: BTreeMap<u64, InodeInfo>,
}

impl LinkCounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_di_nlink(&mut self, inode: u64, nlink: u32) {
        self.inodes.entry(inode).or_default().di_nlink = nlink;
    }

    pub fn incr(&mut self, inode: u64, from: u64, why: &str) {
        let info = self.inodes.entry(inode).or_default();
        info.counted_links += 1;
        debug!(
            "enlaces de {} (0x{:x}): {} -> {} por {} desde {}",
            inode,
            inode,
            info.counted_links - 1,
            info.counted_links,
            why,
            from
        );
    }

    pub fn decr(&mut self, inode: u64, from: u64, why: &str) {
        let info = self.inodes.entry(inode).or_default();
        if info.counted_links == 0 {
            warn!("enlaces de {}: no se puede bajar de 0 ({} desde {})", inode, why, from);
            return;
        }
        info.counted_links -= 1;
        debug!(
            "enlaces de {} (0x{:x}): {} -> {} por {} desde {}",
            inode,
            inode,
            info.counted_links + 1,
            info.counted_links,
            why,
            from
        );
    }

    pub fn get(&self, inode: u64) -> Option<&InodeInfo> {
        self.inodes.get(&inode)
    }

    pub fn counted(&self, inode: u64) -> u32 {
        self.inodes.get(&inode).map_or(0, |i| i.counted_links)
    }

    pub fn remove(&mut self, inode: u64) {
        self.inodes.remove(&inode);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incr_decr() {
        let mut lc = LinkCounts::new();
        lc.set_di_nlink(100, 2);
        lc.incr(100, 100, ".");
        lc.incr(100, 50, "entrada");
        lc.decr(100, 50, "entrada");
        assert_eq!(lc.get(100).unwrap(), &InodeInfo { di_nlink: 2, counted_links: 1 });

        lc.decr(200, 1, "..");
        assert_eq!(lc.counted(200), 0);
    }
}
