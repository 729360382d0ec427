/* Pasada 3: cada directorio tiene que poder alcanzarse desde la raíz.

Desde cada directorio sin revisar se sube por los padres hasta dar con uno
ya revisado. Si ".." y el padre del recorrido no coinciden se decide cuál
vale; lo que queda suelto se borra o se manda a lost+found. */

use std::collections::BTreeSet;

use log::{debug, error, info, warn};

use super::blockmap::BlockMark;
use super::fsck::Fsck;
use super::fsck_types::PassStatus;
use super::lost_n_found::add_inode_to_lf;
use crate::error::{FsError, Result};
use crate::format::FileType;
use crate::ondisk::{check_meta, METATYPE_DI};

fn is_dir(cx: &Fsck, blk: u64) -> bool {
    blk != 0 && matches!(cx.bl.query(blk), Ok(BlockMark::InodeDir))
}

/// Reescribe ".." de `dir` para que apunte a `new` en vez de `old`.
fn attach_dotdot_to(cx: &mut Fsck, new: u64, old: u64, dir: u64) -> Result<()> {
    if !cx.query(&format!("¿Cambiar \"..\" del directorio {} de {} a {}?", dir, old, new)) {
        warn!("\"..\" del directorio {} no se cambió", dir);
        return Ok(());
    }
    let new_num = cx.fs.inode_read(new)?.di.num;
    let mut ip = cx.fs.inode_read(dir)?;
    match cx.fs.dirent_del(&mut ip, b"..") {
        Ok(()) => cx.links.decr(old, dir, "\"..\" viejo"),
        Err(FsError::Dir(e)) => warn!("no se pudo quitar \"..\" de {}: {}", dir, e),
        Err(e) => return Err(e),
    }
    let blocks_before = ip.di.blocks;
    let dt = cx.fs.format.dirent_type(FileType::Directory);
    cx.dir_add(&mut ip, b"..", new_num, dt)?;
    if ip.di.blocks != blocks_before {
        cx.reprocess_inode(&mut ip, "directorio con \"..\" nuevo")?;
    }
    cx.links.incr(new, dir, "\"..\" nuevo");
    cx.dirtree.set_dotdot(dir, new);
    cx.fs.inode_put(ip)
}

/// Marca `dir` como revisado y devuelve el padre por donde seguir subiendo;
/// None si el directorio quedó suelto.
fn mark_and_return_parent(cx: &mut Fsck, dir: u64) -> Result<Option<u64>> {
    cx.dirtree.set_checked(dir);
    let Some(info) = cx.dirtree.get(dir).copied() else {
        return Ok(None);
    };
    if cx.bl.query(dir)? == BlockMark::BadBlock {
        return Ok(None);
    }
    if info.treewalk_parent == 0 {
        return Ok(None);
    }

    let parent = if info.dotdot_parent == info.treewalk_parent {
        if !is_dir(cx, info.dotdot_parent) {
            error!(
                "directorio {} (0x{:x}): su padre {} no es un directorio",
                dir, dir, info.dotdot_parent
            );
            return Ok(None);
        }
        info.dotdot_parent
    } else {
        let msg = format!(
            "directorio {} (0x{:x}): \"..\" dice {} pero aparece en {}",
            dir, dir, info.dotdot_parent, info.treewalk_parent
        );
        warn!("{}", msg);
        cx.report.dir_error(msg);
        let dotdot_ok = is_dir(cx, info.dotdot_parent);
        let treewalk_ok = is_dir(cx, info.treewalk_parent);
        match (dotdot_ok, treewalk_ok) {
            (false, false) => {
                error!("directorio {} (0x{:x}) huérfano", dir, dir);
                return Ok(None);
            }
            (false, true) => {
                warn!("el padre del recorrido es el correcto");
                attach_dotdot_to(cx, info.treewalk_parent, info.dotdot_parent, dir)?;
            }
            (true, true) => {
                warn!("los dos padres son directorios; se usa el del recorrido");
                attach_dotdot_to(cx, info.treewalk_parent, info.dotdot_parent, dir)?;
            }
            (true, false) => {
                warn!("\"..\" es válido pero el padre del recorrido no");
                if !cx.query(&format!(
                    "¿Quitar la entrada hacia {} en {}?",
                    dir, info.treewalk_parent
                )) {
                    return Ok(None);
                }
                let tw = info.treewalk_parent;
                if cx.fs.valid_block(tw) {
                    let mut tip = cx.fs.inode_read(tw)?;
                    if check_meta(&tip.bh.data, METATYPE_DI) && cx.fs.is_dir(&tip) {
                        match cx.fs.dir_remove_inum(&mut tip, dir) {
                            Ok(_) => {}
                            Err(FsError::Dir(e)) => warn!("no se pudo quitar la entrada: {}", e),
                            Err(e) => return Err(e),
                        }
                        cx.fs.inode_put(tip)?;
                    }
                }
                cx.links.decr(dir, tw, "entrada quitada");
                return Ok(None);
            }
        }
        info.treewalk_parent
    };
    Ok(cx.dirtree.contains(parent).then_some(parent))
}

/// Un directorio que no llega a la raíz.
fn handle_orphan(cx: &mut Fsck, dir: u64) -> Result<()> {
    let q = cx.bl.query(dir)?;
    if q == BlockMark::BadBlock {
        let msg = format!("directorio {} (0x{:x}) con bloques dañados", dir, dir);
        error!("{}", msg);
        cx.report.dir_error(msg);
        if cx.query("¿Liberar el directorio con bloques dañados?") {
            cx.fsck_blockmap_set(dir, dir, "directorio dañado", BlockMark::Free)?;
            cx.links.remove(dir);
        } else {
            warn!("el directorio {} con bloques dañados se queda", dir);
        }
        return Ok(());
    }
    if !q.is_inode() {
        error!("el bloque suelto {} no es un inodo", dir);
        if cx.query("¿Liberar el bloque suelto?") {
            cx.fsck_blockmap_set(dir, dir, "no es inodo", BlockMark::Free)?;
        }
        return Ok(());
    }

    let msg = format!("directorio desconectado en {} (0x{:x})", dir, dir);
    error!("{}", msg);
    cx.report.dir_error(msg);
    let mut ip = cx.fs.inode_read(dir)?;
    if ip.di.size == 0 && ip.di.eattr == 0 {
        error!("el directorio suelto {} está vacío", dir);
        if cx.query("¿Borrar el directorio vacío?") {
            return cx.fsck_blockmap_set(dir, dir, "directorio vacío suelto", BlockMark::Free);
        }
    }
    if cx.query("¿Agregar el directorio a lost+found?") {
        add_inode_to_lf(cx, &mut ip)?;
        warn!("directorio {} movido a lost+found", dir);
    } else {
        error!("el directorio {} sigue desconectado", dir);
    }
    cx.fs.inode_put(ip)
}

pub fn pass3(cx: &mut Fsck) -> Result<PassStatus> {
    let root = cx.fs.md.root_dir;
    cx.dirtree.set_checked(root);
    let master = cx.fs.md.master_dir;
    if master != 0 {
        cx.dirtree.set_checked(master);
    }

    info!("revisando la conexión de {} directorios", cx.dirtree.len());
    for start in cx.dirtree.keys() {
        let mut dir = start;
        let mut chain = BTreeSet::new();
        while !cx.dirtree.is_checked(dir) {
            if cx.aborted() {
                return Ok(PassStatus::Aborted);
            }
            chain.insert(dir);
            match mark_and_return_parent(cx, dir)? {
                Some(parent) if chain.contains(&parent) => {
                    error!("ciclo de directorios en {} (0x{:x})", parent, parent);
                    handle_orphan(cx, parent)?;
                    break;
                }
                Some(parent) => {
                    debug!("directorio {} conectado a {}", dir, parent);
                    dir = parent;
                }
                None => {
                    handle_orphan(cx, dir)?;
                    break;
                }
            }
        }
    }
    if let Some(lf) = cx.lf_dip {
        debug!("lost+found ({}) al final de la pasada 3", lf);
    }
    Ok(PassStatus::Done)
}
