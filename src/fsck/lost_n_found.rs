/* lost+found: se crea la primera vez que hace falta y recibe los inodos
que quedaron sin padre, con un nombre armado a partir de su tipo y su
número de bloque. */

use log::{debug, error, info, warn};

use super::blockmap::BlockMark;
use super::fsck::{CheckedAllocator, Fsck};
use crate::dir::DirError;
use crate::error::{FsError, Result};
use crate::format::FileType;
use crate::inode::Inode;
use crate::mkfs;
use crate::ondisk::Inum;

pub const LOST_FOUND: &[u8] = b"lost+found";

/// Prefijo del nombre que recibe un inodo huérfano.
pub fn lost_prefix(ft: FileType) -> &'static str {
    match ft {
        FileType::Directory => "lost_dir_",
        FileType::Regular => "lost_file_",
        FileType::Symlink => "lost_link_",
        FileType::BlockDev => "lost_blkdev_",
        FileType::CharDev => "lost_chrdev_",
        FileType::Fifo => "lost_fifo_",
        FileType::Socket => "lost_socket_",
        FileType::Unknown => "lost_",
    }
}

/// Devuelve el bloque de lost+found, creándolo bajo la raíz si no existe.
pub fn make_sure_lf_exists(cx: &mut Fsck) -> Result<u64> {
    if let Some(lf) = cx.lf_dip {
        return Ok(lf);
    }
    info!("buscando lost+found");
    let root_addr = cx.fs.md.root_dir;
    if root_addr == 0 || !matches!(cx.bl.query(root_addr), Ok(BlockMark::InodeDir)) {
        return Err(FsError::Fatal("no hay un directorio raíz donde crear lost+found".into()));
    }
    let mut root = cx.fs.inode_read(root_addr)?;

    if let Some(de) = cx.fs.dir_search(&root, LOST_FOUND)? {
        let addr = de.inum.addr;
        if matches!(cx.bl.query(addr), Ok(BlockMark::InodeDir)) {
            info!("lost+found es el dinode {} (0x{:x})", addr, addr);
            cx.lf_dip = Some(addr);
            cx.dirtree.set_checked(addr);
            return Ok(addr);
        }
        error!("la entrada lost+found de la raíz apunta a {}, que no es un directorio", addr);
        cx.report.dir_error(format!("lost+found ({}) no es un directorio", addr));
        if !cx.query("¿Quitar la entrada lost+found de la raíz?") {
            return Err(FsError::Fatal("lost+found no es un directorio".into()));
        }
        cx.fs.dirent_del(&mut root, LOST_FOUND)?;
        cx.links.decr(addr, root_addr, "lost+found");
    }

    let blocks_before = root.di.blocks;
    let lf = {
        let mut alloc = CheckedAllocator { bl: &cx.bl };
        mkfs::new_dir(&mut cx.fs, &mut alloc, Some(root.di.num), 0o700, 0)?
    };
    let lf_addr = lf.addr;
    let dt = cx.fs.format.dirent_type(FileType::Directory);
    cx.dir_add(&mut root, LOST_FOUND, lf.di.num, dt)?;
    root.di.nlink += 1;
    root.mark_dirty();

    cx.fsck_blockmap_set(lf_addr, lf_addr, "lost+found", BlockMark::InodeDir)?;
    cx.links.set_di_nlink(root_addr, root.di.nlink);
    cx.links.set_di_nlink(lf_addr, lf.di.nlink);
    cx.links.incr(root_addr, lf_addr, "\"..\" de lost+found");
    cx.links.incr(lf_addr, lf_addr, "\".\"");
    cx.links.incr(lf_addr, root_addr, "lost+found");
    let di = cx.dirtree.insert(lf_addr);
    di.dotdot_parent = root_addr;
    di.treewalk_parent = root_addr;
    di.checked = true;

    if root.di.blocks != blocks_before {
        cx.reprocess_inode(&mut root, "raíz")?;
    }
    cx.fs.inode_put(lf)?;
    cx.fs.inode_put(root)?;
    info!("lost+found creado en {} (0x{:x})", lf_addr, lf_addr);
    cx.lf_dip = Some(lf_addr);
    Ok(lf_addr)
}

/// Cambia ".." de un directorio huérfano para que apunte a lost+found.
fn add_dotdot(cx: &mut Fsck, ip: &mut Inode, lf_num: Inum) -> Result<()> {
    info!("\"..\" del directorio {} (0x{:x}) pasa a lost+found", ip.addr, ip.addr);
    let old = cx.dirtree.get(ip.addr).map_or(0, |d| d.dotdot_parent);
    if old != 0 && cx.fs.valid_block(old) {
        debug!("el directorio {} tenía \"..\" hacia {}", ip.addr, old);
        cx.links.decr(old, ip.addr, "\"..\" movido a lost+found");
        if old == ip.addr {
            ip.di.nlink = ip.di.nlink.saturating_sub(1);
            ip.mark_dirty();
            cx.links.set_di_nlink(ip.addr, ip.di.nlink);
        } else if cx.bl.query(old)? == BlockMark::InodeDir {
            let mut dip = cx.fs.inode_read(old)?;
            if dip.di.nlink > 0 {
                dip.di.nlink -= 1;
                dip.mark_dirty();
                cx.links.set_di_nlink(old, dip.di.nlink);
            }
            cx.fs.inode_put(dip)?;
        }
    }
    match cx.fs.dirent_del(ip, b"..") {
        Ok(()) => {}
        Err(FsError::Dir(e)) => warn!("no se pudo quitar \"..\" de {}: {}", ip.addr, e),
        Err(e) => return Err(e),
    }
    let dt = cx.fs.format.dirent_type(FileType::Directory);
    cx.dir_add(ip, b"..", lf_num, dt)
}

/// Agrega `ip` a lost+found. El llamador escribe `ip` después.
pub fn add_inode_to_lf(cx: &mut Fsck, ip: &mut Inode) -> Result<()> {
    let lf_addr = make_sure_lf_exists(cx)?;
    if ip.addr == lf_addr {
        error!("no se puede agregar lost+found a sí mismo");
        return Ok(());
    }
    let ft = cx.fs.file_type(ip);
    if ft == FileType::Directory {
        let lf_num = cx.fs.inode_read(lf_addr)?.di.num;
        add_dotdot(cx, ip, lf_num)?;
    }
    let mut lf = cx.fs.inode_read(lf_addr)?;
    let blocks_before = lf.di.blocks;

    let name = format!("{}{}", lost_prefix(ft), ip.addr);
    let dt_ft = if ft == FileType::Unknown { FileType::Regular } else { ft };
    let dt = cx.fs.format.dirent_type(dt_ft);
    match cx.dir_add(&mut lf, name.as_bytes(), ip.di.num, dt) {
        Ok(()) => {}
        Err(FsError::Dir(DirError::Exists)) => {
            warn!("lost+found ya tiene una entrada {}", name);
        }
        Err(e) => return Err(e),
    }
    if ft == FileType::Directory {
        lf.di.nlink += 1;
        lf.mark_dirty();
        cx.links.set_di_nlink(lf_addr, lf.di.nlink);
        cx.links.incr(lf_addr, ip.addr, "\"..\" hacia lost+found");
        if let Some(d) = cx.dirtree.get_mut(ip.addr) {
            d.dotdot_parent = lf_addr;
            d.treewalk_parent = lf_addr;
        }
    }
    if lf.di.blocks != blocks_before {
        cx.reprocess_inode(&mut lf, "lost+found")?;
    }
    cx.fs.inode_put(lf)?;
    cx.links.incr(ip.addr, lf_addr, "desde lost+found");
    info!("inodo {} (0x{:x}) agregado a lost+found como {}", ip.addr, ip.addr, name);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lost_prefixes() {
        assert_eq!(format!("{}{}", lost_prefix(FileType::Regular), 0x500), "lost_file_1280");
        assert_eq!(lost_prefix(FileType::Directory), "lost_dir_");
        assert_eq!(lost_prefix(FileType::Unknown), "lost_");
    }
}
