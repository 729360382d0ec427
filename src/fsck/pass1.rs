/* Pasada 1: clasifica cada bloque del sistema de archivos.

Primero se revisan (y si hace falta se reconstruyen) los inodos de sistema;
después se recorre cada bloque que el bitmap marca como dinode y se
clasifican todos los bloques que cuelgan de él. Lo que ya tenía dueño queda
anotado como duplicado; los inodos que no se pueden recorrer se deshacen y
se liberan. */

use std::collections::BTreeSet;

use log::{debug, error, info, warn};

use super::blockmap::BlockMark;
use super::dups::RefKind;
use super::fsck::{CheckedAllocator, Fsck};
use super::fsck_types::{BlockCount, PassStatus};
use super::metawalk::{check_dir, check_inode_eattr, check_metatree, HashTable, MetaWalk, Walk};
use crate::dir::DirEntry;
use crate::error::{FsError, Result};
use crate::format::FileType;
use crate::fs::{BlockAllocator, Gfs2Fs, SystemInodes};
use crate::inode::Inode;
use crate::mkfs;
use crate::ondisk::*;

/// Punteros malos que se le perdonan a un inodo antes de darlo por perdido.
pub const BAD_POINTER_TOLERANCE: u32 = 10;

// -----------------------------------------------------------------------------
// Estrategias
// -----------------------------------------------------------------------------

/// Solo cuenta punteros fuera de rango o hacia bloques ya reclamados.
#[derive(Default)]
struct RangeCheck {
    bad: u32,
}

impl RangeCheck {
    fn check(&mut self, cx: &Fsck, blk: u64) -> Result<Walk> {
        let bad = !cx.fs.valid_block(blk) || cx.bl.query(blk)? != BlockMark::Free;
        if !bad {
            return Ok(Walk::Continue);
        }
        self.bad += 1;
        if self.bad > BAD_POINTER_TOLERANCE {
            return Ok(Walk::Abort);
        }
        Ok(Walk::Skip)
    }
}

impl MetaWalk for RangeCheck {
    fn check_metalist(&mut self, cx: &mut Fsck, _ip: &mut Inode, blk: u64, _height: u16) -> Result<Walk> {
        self.check(cx, blk)
    }

    fn check_leaf(&mut self, cx: &mut Fsck, _ip: &mut Inode, blk: u64) -> Result<Walk> {
        self.check(cx, blk)
    }

    fn check_data(&mut self, cx: &mut Fsck, _ip: &mut Inode, blk: u64) -> Result<Walk> {
        self.check(cx, blk)
    }

    fn check_eattr_indir(&mut self, cx: &mut Fsck, _ip: &mut Inode, blk: u64, _parent: u64) -> Result<Walk> {
        self.check(cx, blk)
    }

    fn check_eattr_leaf(&mut self, cx: &mut Fsck, _ip: &mut Inode, blk: u64, _parent: u64) -> Result<Walk> {
        self.check(cx, blk)
    }

    fn check_eattr_extentry(&mut self, cx: &mut Fsck, _ip: &mut Inode, ptr: u64, _leaf: u64, _ea: &EaHeader) -> Result<Walk> {
        self.check(cx, ptr)
    }
}

/// Marca cada bloque con su tipo y lleva la cuenta de bloques del inodo.
#[derive(Default)]
struct Classify {
    bc: BlockCount,
    leaves: BTreeSet<u64>,
}

impl Classify {
    /// Si `blk` ya tiene dueño anota el reclamo y devuelve la marca que tenía.
    fn claim_if_dup(&self, cx: &mut Fsck, ip: &Inode, blk: u64, kind: RefKind) -> Result<Option<BlockMark>> {
        let q = cx.bl.query(blk)?;
        if q == BlockMark::Free {
            return Ok(None);
        }
        warn!(
            "inodo {} (0x{:x}): el bloque {} (0x{:x}) ya estaba marcado como {:?}",
            ip.addr, ip.addr, blk, blk, q
        );
        cx.dups.add_claim(blk, ip.addr, kind, false, true);
        Ok(Some(q))
    }

    /// El puntero malo se anota contra el inodo dueño.
    fn out_of_range(cx: &mut Fsck, ip: &Inode, blk: u64, what: &str) -> Result<Walk> {
        error!(
            "inodo {} (0x{:x}): puntero {} fuera de rango: {} (0x{:x})",
            ip.addr, ip.addr, what, blk, blk
        );
        cx.report
            .inode_error(format!("inodo {}: puntero {} fuera de rango {}", ip.addr, what, blk));
        cx.fsck_blockmap_set(ip.addr, ip.addr, "inodo con punteros malos", BlockMark::BadBlock)?;
        Ok(Walk::Error)
    }

    /// Bloque de atributos con el tipo `mh_type`.
    fn eattr_block(&mut self, cx: &mut Fsck, ip: &mut Inode, blk: u64, mh_type: u32, what: &str) -> Result<Walk> {
        if !cx.fs.valid_block(blk) {
            return Self::out_of_range(cx, ip, blk, what);
        }
        if self.claim_if_dup(cx, ip, blk, RefKind::Eattr)?.is_some() {
            self.bc.ea += 1;
            return Ok(Walk::Skip);
        }
        let bh = cx.fs.cache.bread(blk)?;
        if !check_meta(&bh.data, mh_type) {
            error!("inodo {} (0x{:x}): {} {} no tiene el tipo esperado", ip.addr, ip.addr, what, blk);
            cx.report.inode_error(format!("inodo {}: {} {} inválido", ip.addr, what, blk));
            cx.fsck_blockmap_set(ip.addr, blk, what, BlockMark::MetaInval)?;
            return Ok(Walk::Error);
        }
        cx.fsck_blockmap_set(ip.addr, blk, what, BlockMark::Eattr)?;
        cx.eattr_blocks.insert(ip.addr);
        self.bc.ea += 1;
        Ok(Walk::Continue)
    }
}

impl MetaWalk for Classify {
    fn check_metalist(&mut self, cx: &mut Fsck, ip: &mut Inode, blk: u64, height: u16) -> Result<Walk> {
        if !cx.fs.valid_block(blk) {
            return Self::out_of_range(cx, ip, blk, "indirecto");
        }
        if self.claim_if_dup(cx, ip, blk, RefKind::Meta)?.is_some() {
            self.bc.indir += 1;
            return Ok(Walk::Skip);
        }
        // el último nivel de un directorio con hash es la tabla
        let want = if ip.is_exhash() && height == ip.di.height { METATYPE_JD } else { METATYPE_IN };
        let bh = cx.fs.cache.bread(blk)?;
        if !check_meta(&bh.data, want) {
            error!(
                "inodo {} (0x{:x}): el bloque indirecto {} (0x{:x}) no tiene el tipo {}",
                ip.addr, ip.addr, blk, blk, want
            );
            cx.report.inode_error(format!("inodo {}: bloque indirecto {} inválido", ip.addr, blk));
            cx.fsck_blockmap_set(ip.addr, blk, "indirecto inválido", BlockMark::MetaInval)?;
            return Ok(Walk::Error);
        }
        cx.fsck_blockmap_set(ip.addr, blk, "indirecto", BlockMark::Indir)?;
        self.bc.indir += 1;
        Ok(Walk::Continue)
    }

    fn check_leaf(&mut self, cx: &mut Fsck, ip: &mut Inode, blk: u64) -> Result<Walk> {
        if !self.leaves.insert(blk) {
            return Ok(Walk::Skip);
        }
        if self.claim_if_dup(cx, ip, blk, RefKind::Meta)?.is_some() {
            self.bc.indir += 1;
            return Ok(Walk::Skip);
        }
        cx.fsck_blockmap_set(ip.addr, blk, "hoja", BlockMark::Leaf)?;
        self.bc.indir += 1;
        Ok(Walk::Continue)
    }

    fn check_data(&mut self, cx: &mut Fsck, ip: &mut Inode, blk: u64) -> Result<Walk> {
        if !cx.fs.valid_block(blk) {
            return Self::out_of_range(cx, ip, blk, "de datos");
        }
        if let Some(prev) = self.claim_if_dup(cx, ip, blk, RefKind::Data)? {
            // solo cuenta si el otro dueño también lo usa como datos
            if matches!(prev, BlockMark::Used | BlockMark::JData) {
                self.bc.data += 1;
            }
            return Ok(Walk::Skip);
        }
        self.bc.data += 1;
        let mark = if ip.is_jdata() { BlockMark::JData } else { BlockMark::Used };
        cx.fsck_blockmap_set(ip.addr, blk, "datos", mark)?;
        Ok(Walk::Continue)
    }

    fn fixes_leaf_pointers(&self) -> bool {
        true
    }

    fn check_num_ptrs(
        &mut self,
        cx: &mut Fsck,
        ip: &mut Inode,
        leaf_no: u64,
        ref_count: &mut u64,
        lindex: &mut u64,
        leaf: &Leaf,
        table: &mut HashTable,
    ) -> Result<Walk> {
        let multiple = pow2_floor(*ref_count);
        if *ref_count != multiple {
            let msg = format!(
                "directorio {} (0x{:x}): {} punteros a la hoja {} (0x{:x}), no es potencia de 2",
                ip.addr, ip.addr, *ref_count, leaf_no, leaf_no
            );
            error!("{}", msg);
            cx.report.inode_error(msg);
            if cx.query("¿Corregir los punteros de la tabla?") {
                if *lindex < table.len() {
                    shift_table(table, *lindex, *ref_count, multiple);
                    *lindex -= *ref_count - multiple;
                    *ref_count = multiple;
                } else if let Some(prev_start) = give_to_previous(table, *lindex, *ref_count, multiple) {
                    // la corrida anterior creció: hay que volver a contarla
                    *lindex = prev_start;
                    *ref_count = multiple;
                }
                info!("tabla del directorio {} corregida", ip.addr);
            }
        }

        let di_depth = ip.di.depth;
        let factor = (*ref_count).max(1).ilog2() as u16;
        let expected = if leaf.depth <= di_depth { 1u64 << (di_depth - leaf.depth) } else { 0 };
        if *ref_count != expected {
            let msg = format!(
                "directorio {} (0x{:x}): la hoja {} (0x{:x}) tiene {} punteros, se esperaban {}",
                ip.addr, ip.addr, leaf_no, leaf_no, *ref_count, expected
            );
            error!("{}", msg);
            cx.report.inode_error(msg);
            if cx.query("¿Corregir la profundidad de la hoja?") {
                let mut bh = cx.fs.cache.bread(leaf_no)?;
                let mut lf = Leaf::decode(&bh.data);
                let depth = di_depth.saturating_sub(factor);
                info!("profundidad de la hoja {}: {} -> {}", leaf_no, lf.depth, depth);
                lf.depth = depth;
                lf.encode(&mut bh.data);
                bh.mark_modified();
                cx.fs.cache.brelse(bh)?;
            }
        }
        Ok(Walk::Continue)
    }

    fn check_eattr_indir(&mut self, cx: &mut Fsck, ip: &mut Inode, blk: u64, _parent: u64) -> Result<Walk> {
        self.eattr_block(cx, ip, blk, METATYPE_IN, "indirecto de atributos")
    }

    fn check_eattr_leaf(&mut self, cx: &mut Fsck, ip: &mut Inode, blk: u64, parent: u64) -> Result<Walk> {
        let w = self.eattr_block(cx, ip, blk, METATYPE_EA, "hoja de atributos")?;
        if w == Walk::Error && parent == ip.addr && cx.query("¿Quitar los atributos extendidos del inodo?") {
            ip.di.eattr = 0;
            ip.mark_dirty();
        }
        Ok(w)
    }

    fn check_eattr_entry(&mut self, cx: &mut Fsck, ip: &mut Inode, leaf_blk: u64, off: usize, ea: &EaHeader) -> Result<Walk> {
        if ea.ea_type > EATYPE_LAST || (ea.ea_type != EATYPE_UNUSED && ea.name_len == 0) {
            warn!(
                "inodo {} (0x{:x}): atributo inválido en el bloque {} offset {}",
                ip.addr, ip.addr, leaf_blk, off
            );
            cx.report.inode_error(format!("inodo {}: atributo inválido en {}", ip.addr, leaf_blk));
            return Ok(Walk::Error);
        }
        Ok(Walk::Continue)
    }

    fn check_eattr_extentry(&mut self, cx: &mut Fsck, ip: &mut Inode, ptr: u64, _leaf: u64, _ea: &EaHeader) -> Result<Walk> {
        self.eattr_block(cx, ip, ptr, METATYPE_ED, "datos de atributos")
    }

    fn finish_eattr_indir(&mut self, cx: &mut Fsck, ip: &mut Inode, leaf_pointers: u32, leaf_pointer_errors: u32) -> Result<()> {
        if leaf_pointers == 0 || leaf_pointer_errors < leaf_pointers {
            return Ok(());
        }
        error!("inodo {} (0x{:x}): todas las hojas de atributos están dañadas", ip.addr, ip.addr);
        if !cx.query("¿Quitar los atributos extendidos del inodo?") {
            return Ok(());
        }
        let indir = ip.di.eattr;
        cx.fsck_blockmap_set(ip.addr, indir, "indirecto de atributos", BlockMark::Free)?;
        self.bc.ea = self.bc.ea.saturating_sub(1);
        cx.eattr_blocks.remove(&ip.addr);
        ip.di.eattr = 0;
        ip.di.flags &= !DIF_EA_INDIRECT;
        ip.mark_dirty();
        Ok(())
    }

    fn big_file_msg(&mut self, _cx: &mut Fsck, ip: &mut Inode, lblock: u64, total: u64) {
        info!("inodo {} (0x{:x}): {} de {} bloques revisados", ip.addr, ip.addr, lblock, total);
    }
}

/// Corre `count` punteros que terminan en `lindex` para que queden
/// `multiple`: se conservan los últimos y el hueco al final queda en 0.
fn shift_table(table: &mut HashTable, lindex: u64, count: u64, multiple: u64) {
    let start = lindex - count;
    let off_by = count - multiple;
    let len = table.len();
    for i in start..len - off_by {
        let v = table.get(i + off_by);
        table.set(i, v);
    }
    for i in len - off_by..len {
        table.set(i, 0);
    }
}

/// Última corrida de la tabla: sus primeros `count - multiple` punteros
/// pasan a la hoja anterior. Devuelve dónde empieza la corrida anterior,
/// o None si no hay hoja antes.
fn give_to_previous(table: &mut HashTable, lindex: u64, count: u64, multiple: u64) -> Option<u64> {
    let start = lindex - count;
    if start == 0 {
        return None;
    }
    let prev = table.get(start - 1);
    for i in start..start + (count - multiple) {
        table.set(i, prev);
    }
    let mut prev_start = start - 1;
    while prev_start > 0 && table.get(prev_start - 1) == prev {
        prev_start -= 1;
    }
    Some(prev_start)
}

fn pow2_floor(n: u64) -> u64 {
    if n == 0 {
        0
    } else {
        1 << (63 - n.leading_zeros())
    }
}

/// Deshace lo que Classify alcanzó a marcar de un inodo que no sirve.
struct Undo;

impl Undo {
    fn undo(&self, cx: &mut Fsck, ip: &Inode, blk: u64, descend: Option<u32>) -> Result<Walk> {
        if !cx.fs.valid_block(blk) {
            return Ok(Walk::Skip);
        }
        if cx.dups.get(blk).is_some_and(|d| d.claim(ip.addr).is_some()) {
            cx.dups.find_remove(blk, ip.addr);
            return Ok(Walk::Skip);
        }
        match cx.bl.query(blk)? {
            BlockMark::Free => Ok(Walk::Skip),
            BlockMark::MetaInval => {
                cx.fsck_blockmap_set(ip.addr, blk, "deshacer", BlockMark::Free)?;
                Ok(Walk::Skip)
            }
            _ => {
                cx.fsck_blockmap_set(ip.addr, blk, "deshacer", BlockMark::Free)?;
                let Some(mh_type) = descend else {
                    return Ok(Walk::Continue);
                };
                let bh = cx.fs.cache.bread(blk)?;
                Ok(if check_meta(&bh.data, mh_type) { Walk::Continue } else { Walk::Skip })
            }
        }
    }
}

impl MetaWalk for Undo {
    fn check_metalist(&mut self, cx: &mut Fsck, ip: &mut Inode, blk: u64, height: u16) -> Result<Walk> {
        let want = if ip.is_exhash() && height == ip.di.height { METATYPE_JD } else { METATYPE_IN };
        self.undo(cx, ip, blk, Some(want))
    }

    fn check_leaf(&mut self, cx: &mut Fsck, ip: &mut Inode, blk: u64) -> Result<Walk> {
        self.undo(cx, ip, blk, None)
    }

    fn check_data(&mut self, cx: &mut Fsck, ip: &mut Inode, blk: u64) -> Result<Walk> {
        self.undo(cx, ip, blk, None)
    }
}

/// Para inodos con un modo inválido: sus bloques no cuentan como de nadie.
struct Invalidate;

impl Invalidate {
    fn invalidate(&self, cx: &mut Fsck, ip: &Inode, blk: u64, kind: RefKind, descend: Option<u32>) -> Result<Walk> {
        if !cx.fs.valid_block(blk) {
            return Ok(Walk::Skip);
        }
        if cx.bl.query(blk)? != BlockMark::Free {
            cx.dups.add_claim(blk, ip.addr, kind, false, false);
            return Ok(Walk::Skip);
        }
        cx.fsck_blockmap_set(ip.addr, blk, "invalidar", BlockMark::MetaInval)?;
        let Some(mh_type) = descend else {
            return Ok(Walk::Continue);
        };
        let bh = cx.fs.cache.bread(blk)?;
        Ok(if check_meta(&bh.data, mh_type) { Walk::Continue } else { Walk::Skip })
    }
}

impl MetaWalk for Invalidate {
    fn check_metalist(&mut self, cx: &mut Fsck, ip: &mut Inode, blk: u64, _height: u16) -> Result<Walk> {
        let bh_ok = cx.fs.valid_block(blk);
        let want = if bh_ok && check_meta(&cx.fs.cache.bread(blk)?.data, METATYPE_JD) {
            METATYPE_JD
        } else {
            METATYPE_IN
        };
        self.invalidate(cx, ip, blk, RefKind::Meta, Some(want))
    }

    fn check_leaf(&mut self, cx: &mut Fsck, ip: &mut Inode, blk: u64) -> Result<Walk> {
        self.invalidate(cx, ip, blk, RefKind::Meta, None)
    }

    fn check_data(&mut self, cx: &mut Fsck, ip: &mut Inode, blk: u64) -> Result<Walk> {
        self.invalidate(cx, ip, blk, RefKind::Data, None)
    }

    fn check_eattr_indir(&mut self, cx: &mut Fsck, ip: &mut Inode, blk: u64, _parent: u64) -> Result<Walk> {
        self.invalidate(cx, ip, blk, RefKind::Eattr, Some(METATYPE_IN))
    }

    fn check_eattr_leaf(&mut self, cx: &mut Fsck, ip: &mut Inode, blk: u64, _parent: u64) -> Result<Walk> {
        self.invalidate(cx, ip, blk, RefKind::Eattr, Some(METATYPE_EA))
    }
}

/// Anota al primer dueño de cada bloque duplicado.
struct FirstOwner;

impl FirstOwner {
    fn visit(&self, cx: &mut Fsck, ip: &Inode, blk: u64, kind: RefKind) -> Walk {
        let Some(rec) = cx.dups.get(blk) else {
            return Walk::Continue;
        };
        // este inodo llegó tarde al bloque: lo de abajo no es suyo
        if rec.claim(ip.addr).is_some() && rec.first_ref_found {
            return Walk::Skip;
        }
        if !rec.first_ref_found && rec.claim(ip.addr).is_none() {
            debug!("inodo {} es el primer dueño del bloque {}", ip.addr, blk);
            cx.dups.add_claim(blk, ip.addr, kind, true, true);
            return Walk::Continue;
        }
        Walk::Skip
    }
}

impl MetaWalk for FirstOwner {
    fn check_metalist(&mut self, cx: &mut Fsck, ip: &mut Inode, blk: u64, _height: u16) -> Result<Walk> {
        if !cx.fs.valid_block(blk) {
            return Ok(Walk::Skip);
        }
        Ok(self.visit(cx, ip, blk, RefKind::Meta))
    }

    fn check_leaf(&mut self, cx: &mut Fsck, ip: &mut Inode, blk: u64) -> Result<Walk> {
        Ok(self.visit(cx, ip, blk, RefKind::Meta))
    }

    fn check_data(&mut self, cx: &mut Fsck, ip: &mut Inode, blk: u64) -> Result<Walk> {
        if !cx.fs.valid_block(blk) {
            return Ok(Walk::Skip);
        }
        Ok(self.visit(cx, ip, blk, RefKind::Data))
    }

    fn check_eattr_indir(&mut self, cx: &mut Fsck, ip: &mut Inode, blk: u64, _parent: u64) -> Result<Walk> {
        if !cx.fs.valid_block(blk) {
            return Ok(Walk::Skip);
        }
        Ok(self.visit(cx, ip, blk, RefKind::Eattr))
    }

    fn check_eattr_leaf(&mut self, cx: &mut Fsck, ip: &mut Inode, blk: u64, _parent: u64) -> Result<Walk> {
        if !cx.fs.valid_block(blk) {
            return Ok(Walk::Skip);
        }
        Ok(self.visit(cx, ip, blk, RefKind::Eattr))
    }

    fn check_eattr_extentry(&mut self, cx: &mut Fsck, ip: &mut Inode, ptr: u64, _leaf: u64, _ea: &EaHeader) -> Result<Walk> {
        if !cx.fs.valid_block(ptr) {
            return Ok(Walk::Skip);
        }
        Ok(self.visit(cx, ip, ptr, RefKind::Eattr))
    }
}

/// Directorios de sistema: sus entradas apuntan a dinodos aunque el bitmap
/// diga otra cosa.
struct Resuscitate;

impl MetaWalk for Resuscitate {
    fn visits_dentries(&self) -> bool {
        true
    }

    fn check_dentry(&mut self, cx: &mut Fsck, ip: &mut Inode, de: &DirEntry, _blk: u64) -> Result<Walk> {
        let target = de.inum.addr;
        if de.name == "." || de.name == ".." || cx.fs.is_system_inode(target) || !cx.fs.valid_block(target) {
            return Ok(Walk::Continue);
        }
        if cx.fs.get_bitmap(target)? == BlockState::Dinode {
            return Ok(Walk::Continue);
        }
        let msg = format!(
            "\"{}\" en el directorio de sistema {} apunta a {} (0x{:x}), que el bitmap no marca como dinode",
            de.name, ip.addr, target, target
        );
        error!("{}", msg);
        cx.report.block_error(msg);
        if cx.query("¿Marcar el bloque como dinode?") {
            cx.fs.set_bitmap(target, BlockState::Dinode)?;
        }
        Ok(Walk::Continue)
    }
}

// -----------------------------------------------------------------------------
// Un inodo
// -----------------------------------------------------------------------------

/// Libera el dinode en el mapa (y en el bitmap, si se acepta).
fn free_inode(cx: &mut Fsck, ip: &Inode, why: &str) -> Result<()> {
    cx.report.inode_error(format!("inodo {} (0x{:x}): {}", ip.addr, ip.addr, why));
    cx.fsck_blockmap_set(ip.addr, ip.addr, why, BlockMark::Free)?;
    cx.dirtree.remove(ip.addr);
    cx.links.remove(ip.addr);
    Ok(())
}

/// Clasifica un dinode ya leído. Deja `ip` listo para inode_put.
fn handle_ip(cx: &mut Fsck, ip: &mut Inode) -> Result<()> {
    // --- Paso 1: ¿vale la pena? ---
    let mut rc = RangeCheck::default();
    let mut res = check_metatree(cx, ip, &mut rc)?;
    if !res.aborted {
        res = check_inode_eattr(cx, ip, &mut rc)?;
    }
    if cx.aborted() {
        return Ok(());
    }
    if res.aborted || rc.bad > BAD_POINTER_TOLERANCE {
        error!(
            "inodo {} (0x{:x}): más de {} punteros malos, se libera",
            ip.addr, ip.addr, BAD_POINTER_TOLERANCE
        );
        return free_inode(cx, ip, "demasiados punteros malos");
    }

    // --- Paso 2: tipo de archivo ---
    let ft = cx.fs.file_type(ip);
    let Some(mark) = BlockMark::for_inode(ft) else {
        error!("inodo {} (0x{:x}): modo inválido {:o}", ip.addr, ip.addr, ip.di.mode);
        cx.report.inode_error(format!("inodo {}: modo inválido", ip.addr));
        cx.fsck_blockmap_set(ip.addr, ip.addr, "modo inválido", BlockMark::MetaInval)?;
        check_metatree(cx, ip, &mut Invalidate)?;
        check_inode_eattr(cx, ip, &mut Invalidate)?;
        return Ok(());
    };
    cx.fsck_blockmap_set(ip.addr, ip.addr, "dinode", mark)?;
    if ft == FileType::Directory {
        cx.dirtree.insert(ip.addr);
    }
    cx.links.set_di_nlink(ip.addr, ip.di.nlink);

    // --- Paso 3: tabla de hash ---
    if ft == FileType::Directory
        && ip.is_exhash()
        && (ip.di.depth > DIR_MAX_DEPTH || (1u64 << ip.di.depth) * 8 != ip.di.size)
    {
        error!(
            "directorio {} (0x{:x}): profundidad {} no corresponde al tamaño {}",
            ip.addr, ip.addr, ip.di.depth, ip.di.size
        );
        if cx.query("¿Borrar el directorio?") {
            return free_inode(cx, ip, "profundidad de hash inválida");
        }
    }

    // --- Paso 4: clasificación ---
    let mut pass = Classify::default();
    let res = check_metatree(cx, ip, &mut pass)?;
    if res.aborted {
        return Ok(());
    }
    if res.errors > 0 {
        warn!(
            "inodo {} (0x{:x}): {} punteros malos, se deshace su clasificación",
            ip.addr, ip.addr, res.errors
        );
        check_metatree(cx, ip, &mut Undo)?;
        if ft == FileType::Directory {
            // la pasada 3 lo libera cuando lo encuentre
            cx.report
                .inode_error(format!("directorio {} (0x{:x}): metadatos dañados", ip.addr, ip.addr));
            return cx.fsck_blockmap_set(ip.addr, ip.addr, "directorio dañado", BlockMark::BadBlock);
        }
        return free_inode(cx, ip, "metadatos dañados");
    }
    check_inode_eattr(cx, ip, &mut pass)?;

    // --- Paso 5: cuenta de bloques ---
    let counted = 1 + pass.bc.total();
    if ip.di.blocks != counted {
        let msg = format!(
            "inodo {} (0x{:x}): di_blocks es {} pero se contaron {} (indirectos {}, datos {}, atributos {})",
            ip.addr, ip.addr, ip.di.blocks, counted, pass.bc.indir, pass.bc.data, pass.bc.ea
        );
        error!("{}", msg);
        cx.report.inode_error(msg);
        if cx.query("¿Corregir la cuenta de bloques?") {
            ip.di.blocks = counted;
            ip.mark_dirty();
        }
    }
    cx.classified.push(ip.addr);
    Ok(())
}

/// Un bloque que el bitmap marca como dinode.
fn handle_di(cx: &mut Fsck, blk: u64) -> Result<()> {
    let bh = cx.fs.cache.bread(blk)?;
    if !check_meta(&bh.data, METATYPE_DI) {
        if cx.fs.format.dinode_state_is_ambiguous() && check_meta(&bh.data, METATYPE_NONE) {
            // en el formato heredado el estado también cubre otros metadatos
            return Ok(());
        }
        if cx.bl.query(blk)? != BlockMark::Free {
            return Ok(());
        }
        warn!("bloque {} (0x{:x}): marcado como dinode pero no lo es", blk, blk);
        return cx.fsck_blockmap_set(blk, blk, "no es dinode", BlockMark::Free);
    }
    if cx.bl.query(blk)? != BlockMark::Free {
        cx.dups.add_claim(blk, blk, RefKind::Meta, false, true);
        return Ok(());
    }
    let mut ip = cx.fs.inode_get(bh);
    if ip.di.num.addr != blk {
        let msg = format!(
            "inodo {} (0x{:x}): el dinode dice estar en {} (0x{:x})",
            blk, blk, ip.di.num.addr, ip.di.num.addr
        );
        error!("{}", msg);
        cx.report.inode_error(msg);
        if cx.query("¿Corregir la dirección del dinode?") {
            ip.di.num.addr = blk;
            ip.mark_dirty();
        }
    }
    handle_ip(cx, &mut ip)?;
    cx.fs.inode_put(ip)
}

// -----------------------------------------------------------------------------
// Inodos de sistema
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SysInode {
    Master,
    Root,
    Inum,
    Statfs,
    Jindex,
    Rindex,
    Quota,
    PerNode,
    Journal(usize),
}

impl SysInode {
    fn name(self) -> String {
        match self {
            SysInode::Master => "directorio maestro".into(),
            SysInode::Root => "directorio raíz".into(),
            SysInode::Inum => "inum".into(),
            SysInode::Statfs => "statfs".into(),
            SysInode::Jindex => "jindex".into(),
            SysInode::Rindex => "rindex".into(),
            SysInode::Quota => "quota".into(),
            SysInode::PerNode => "per_node".into(),
            SysInode::Journal(j) => format!("journal{}", j),
        }
    }

    fn addr(self, md: &SystemInodes) -> u64 {
        match self {
            SysInode::Master => md.master_dir,
            SysInode::Root => md.root_dir,
            SysInode::Inum => md.inum,
            SysInode::Statfs => md.statfs,
            SysInode::Jindex => md.jindex,
            SysInode::Rindex => md.rindex,
            SysInode::Quota => md.quota,
            SysInode::PerNode => md.per_node,
            SysInode::Journal(j) => md.journals.get(j).copied().unwrap_or(0),
        }
    }

    fn is_dir(self, legacy: bool) -> bool {
        match self {
            SysInode::Master | SysInode::Root | SysInode::PerNode => true,
            SysInode::Jindex => !legacy,
            _ => false,
        }
    }

    /// Directorios cuyas entradas son de sistema.
    fn is_system_dir(self) -> bool {
        matches!(self, SysInode::Master | SysInode::Jindex | SysInode::PerNode)
    }

    fn build(self, fs: &mut Gfs2Fs, alloc: &mut dyn BlockAllocator) -> Result<u64> {
        match self {
            SysInode::Master => mkfs::build_master(fs, alloc),
            SysInode::Root => mkfs::build_root(fs, alloc),
            SysInode::Inum => mkfs::build_inum(fs, alloc),
            SysInode::Statfs => mkfs::build_statfs(fs, alloc),
            SysInode::Jindex => mkfs::build_jindex(fs, alloc),
            SysInode::Rindex => mkfs::build_rindex(fs, alloc),
            SysInode::Quota => mkfs::build_quota(fs, alloc),
            SysInode::PerNode => mkfs::build_per_node(fs, alloc),
            SysInode::Journal(j) => mkfs::build_journal(fs, j, mkfs::REBUILT_JOURNAL_BLOCKS, alloc),
        }
    }
}

fn system_inode_ok(cx: &mut Fsck, sys: SysInode) -> Result<bool> {
    let addr = sys.addr(&cx.fs.md);
    if addr == 0 || !cx.fs.valid_block(addr) {
        return Ok(false);
    }
    let ip = cx.fs.inode_read(addr)?;
    if !check_meta(&ip.bh.data, METATYPE_DI) {
        return Ok(false);
    }
    if sys.is_dir(cx.fs.format.is_legacy()) && !cx.fs.is_dir(&ip) {
        return Ok(false);
    }
    Ok(true)
}

fn check_system_inode(cx: &mut Fsck, sys: SysInode) -> Result<()> {
    if !system_inode_ok(cx, sys)? {
        let msg = format!("falta el inodo de sistema {} o está dañado", sys.name());
        error!("{}", msg);
        cx.report.inode_error(msg);
        if !cx.query(&format!("¿Reconstruir {}?", sys.name())) {
            error!("{} no se reconstruyó", sys.name());
            return Err(FsError::Fatal(format!(
                "no se puede seguir sin un inodo {} válido",
                sys.name()
            )));
        }
        let mut alloc = CheckedAllocator { bl: &cx.bl };
        let addr = sys.build(&mut cx.fs, &mut alloc)?;
        info!("{} reconstruido en {} (0x{:x})", sys.name(), addr, addr);
        if sys == SysInode::Jindex {
            // los journals colgaban del jindex viejo
            let n = cx.fs.md.journals.len().max(1);
            cx.fs.md.journals = vec![0; n];
        }
        let master = cx.fs.md.master_dir;
        if sys != SysInode::Master && master != 0 && cx.bl.query(master)?.is_inode() {
            let mut mip = cx.fs.inode_read(master)?;
            cx.reprocess_inode(&mut mip, "inodo de sistema reconstruido")?;
        }
    }

    let addr = sys.addr(&cx.fs.md);
    if cx.bl.query(addr)? != BlockMark::Free {
        return Ok(());
    }
    let mut ip = cx.fs.inode_read(addr)?;
    handle_ip(cx, &mut ip)?;
    if sys.is_system_dir() && cx.fs.is_dir(&ip) {
        check_dir(cx, &mut ip, &mut Resuscitate)?;
    }
    if sys == SysInode::Rindex && cx.fs.format.is_legacy() {
        let nblocks = ip.di.size.div_ceil(cx.fs.jbsize());
        for lblock in 0..nblocks {
            if let Some(b) = cx.fs.block_map(&ip, lblock)? {
                cx.gfs1_rindex_blks.insert(b);
            }
        }
    }
    cx.fs.inode_put(ip)
}

fn check_system_inodes(cx: &mut Fsck) -> Result<()> {
    let legacy = cx.fs.format.is_legacy();
    let list: &[SysInode] = if legacy {
        &[SysInode::Root, SysInode::Statfs, SysInode::Jindex, SysInode::Rindex, SysInode::Quota]
    } else {
        &[
            SysInode::Master,
            SysInode::Root,
            SysInode::Inum,
            SysInode::Statfs,
            SysInode::Jindex,
            SysInode::Rindex,
            SysInode::Quota,
            SysInode::PerNode,
        ]
    };
    for &sys in list {
        check_system_inode(cx, sys)?;
    }
    if !legacy {
        for j in 0..cx.fs.md.journals.len() {
            check_system_inode(cx, SysInode::Journal(j))?;
        }
    }
    Ok(())
}

// -----------------------------------------------------------------------------
// Pasada
// -----------------------------------------------------------------------------

pub fn pass1(cx: &mut Fsck) -> Result<PassStatus> {
    // --- Paso 1: inodos de sistema ---
    check_system_inodes(cx)?;
    if cx.aborted() {
        return Ok(PassStatus::Aborted);
    }

    // --- Paso 2: barrido de los grupos de recursos ---
    let addrs = cx.fs.rgrps.addrs();
    let total = addrs.len();
    for (n, rg_addr) in addrs.into_iter().enumerate() {
        let Some(ri) = cx.fs.rgrps.get(rg_addr).map(|rg| rg.ri) else {
            continue;
        };
        for b in ri.addr..ri.data0 {
            cx.bl.mark(b, BlockMark::Rgrp)?;
        }
        if let Some(state) = cx.fs.format.free_meta_state() {
            let mut goal = ri.data0;
            while let Some(blk) = cx.fs.rgrps.get(rg_addr).and_then(|rg| rg.find_state(goal, state)) {
                goal = blk + 1;
                if cx.bl.query(blk)? == BlockMark::Free {
                    cx.bl.mark(blk, BlockMark::FreeMeta)?;
                }
            }
        }

        let mut goal = ri.data0;
        loop {
            if cx.aborted() {
                return Ok(PassStatus::Aborted);
            }
            let Some(blk) = cx
                .fs
                .rgrps
                .get(rg_addr)
                .and_then(|rg| rg.find_state(goal, BlockState::Dinode))
            else {
                break;
            };
            goal = blk + 1;
            if cx.fs.is_system_inode(blk) || cx.gfs1_rindex_blks.contains(&blk) {
                continue;
            }
            handle_di(cx, blk)?;
        }
        info!("pasada 1: {}% ({} de {} grupos)", (n + 1) * 100 / total.max(1), n + 1, total);
    }

    // --- Paso 3: primer dueño de cada duplicado ---
    if !cx.dups.is_empty() {
        let order = cx.classified.clone();
        for addr in order {
            if cx.dups.iter().all(|d| d.first_ref_found) {
                break;
            }
            let mut ip = cx.fs.inode_read(addr)?;
            check_metatree(cx, &mut ip, &mut FirstOwner)?;
            check_inode_eattr(cx, &mut ip, &mut FirstOwner)?;
        }
    }
    Ok(PassStatus::Done)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pow2_floor() {
        assert_eq!(pow2_floor(0), 0);
        assert_eq!(pow2_floor(1), 1);
        assert_eq!(pow2_floor(3), 2);
        assert_eq!(pow2_floor(12), 8);
        assert_eq!(pow2_floor(16), 16);
    }

    #[test]
    fn test_system_dirs() {
        assert!(SysInode::Jindex.is_dir(false));
        assert!(!SysInode::Jindex.is_dir(true));
        assert!(SysInode::PerNode.is_system_dir());
        assert!(!SysInode::Root.is_system_dir());
        assert_eq!(SysInode::Journal(2).name(), "journal2");
    }
}
