/* Lee las entradas de cada directorio clasificado para saber, de cada
subdirectorio, quién dice ser su padre ("..") y dónde apareció de verdad.
Cada entrada cuenta como un enlace hacia su destino. */

use log::{debug, warn};

use super::blockmap::BlockMark;
use super::fsck::Fsck;
use super::fsck_types::PassStatus;
use super::metawalk::{check_dir, MetaWalk, Walk};
use crate::dir::DirEntry;
use crate::error::Result;
use crate::inode::Inode;

struct ParentScan;

impl MetaWalk for ParentScan {
    fn visits_dentries(&self) -> bool {
        true
    }

    fn check_dentry(&mut self, cx: &mut Fsck, ip: &mut Inode, de: &DirEntry, _blk: u64) -> Result<Walk> {
        let target = de.inum.addr;
        if !cx.fs.check_range(target) {
            debug!("directorio {}: \"{}\" apunta fuera del sistema de archivos", ip.addr, de.name);
            return Ok(Walk::Continue);
        }
        match de.name.as_str() {
            "." => {
                if target != ip.addr {
                    warn!("directorio {} (0x{:x}): \".\" apunta a {}", ip.addr, ip.addr, target);
                }
                cx.links.incr(target, ip.addr, "\".\"");
            }
            ".." => {
                cx.dirtree.set_dotdot(ip.addr, target);
                cx.links.incr(target, ip.addr, "\"..\"");
            }
            name => {
                cx.links.incr(target, ip.addr, "entrada");
                if cx.dirtree.contains(target) && !cx.dirtree.set_treewalk(target, ip.addr) {
                    warn!(
                        "el directorio {} (0x{:x}) aparece como \"{}\" en {} pero ya tenía padre {}",
                        target,
                        target,
                        name,
                        ip.addr,
                        cx.dirtree.get(target).map_or(0, |d| d.treewalk_parent)
                    );
                }
            }
        }
        Ok(Walk::Continue)
    }
}

pub fn scan_dirs(cx: &mut Fsck) -> Result<PassStatus> {
    for dinode in cx.dirtree.keys() {
        if cx.aborted() {
            return Ok(PassStatus::Aborted);
        }
        if cx.bl.query(dinode)? != BlockMark::InodeDir {
            continue;
        }
        let mut ip = cx.fs.inode_read(dinode)?;
        let res = check_dir(cx, &mut ip, &mut ParentScan)?;
        if res.errors > 0 {
            warn!("directorio {} (0x{:x}): {} bloques de entradas ilegibles", dinode, dinode, res.errors);
        }
    }
    Ok(PassStatus::Done)
}
