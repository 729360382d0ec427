/* Recorrido de los metadatos de un inodo: árbol de punteros indirectos por
niveles, hojas de directorio (con sus cadenas), bloques de datos y la
cadena de atributos extendidos. Lo que se hace con cada bloque lo decide la
estrategia (MetaWalk); el recorrido no toca el mapa ni el bitmap. */

use std::collections::{BTreeMap, BTreeSet};

use log::{error, warn};

use super::fsck::Fsck;
use crate::buf::Buffer;
use crate::dir::DirEntry;
use crate::error::Result;
use crate::inode::Inode;
use crate::ondisk::*;

/// Lo que decide la estrategia sobre un bloque.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Walk {
    /// Bloque bueno: seguir (y bajar si es de metadatos).
    Continue,
    /// No bajar, sin que cuente como error (p. ej. un duplicado).
    Skip,
    /// Puntero malo: cuenta contra el inodo.
    Error,
    /// Dejar el inodo.
    Abort,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalkOutcome {
    pub errors: u32,
    pub aborted: bool,
}

impl WalkOutcome {
    fn merge(&mut self, other: WalkOutcome) {
        self.errors += other.errors;
        self.aborted |= other.aborted;
    }

    /// Aplica `w`; devuelve true si hay que dejar de recorrer.
    fn apply(&mut self, w: Walk) -> bool {
        match w {
            Walk::Error => self.errors += 1,
            Walk::Abort => self.aborted = true,
            Walk::Continue | Walk::Skip => {}
        }
        self.aborted
    }
}

/// Cada cuántos bloques de datos se avisa de un archivo grande.
const BIG_FILE_STEP: u64 = 0x10000;

#[allow(unused_variables)]
pub trait MetaWalk {
    /// Bloque indirecto (o de tabla de hash) en el nivel `height`.
    fn check_metalist(&mut self, cx: &mut Fsck, ip: &mut Inode, blk: u64, height: u16) -> Result<Walk> {
        Ok(Walk::Continue)
    }

    fn check_leaf(&mut self, cx: &mut Fsck, ip: &mut Inode, blk: u64) -> Result<Walk> {
        Ok(Walk::Continue)
    }

    fn check_data(&mut self, cx: &mut Fsck, ip: &mut Inode, blk: u64) -> Result<Walk> {
        Ok(Walk::Continue)
    }

    fn visits_dentries(&self) -> bool {
        false
    }

    fn check_dentry(&mut self, cx: &mut Fsck, ip: &mut Inode, de: &DirEntry, blk: u64) -> Result<Walk> {
        Ok(Walk::Continue)
    }

    /// Si la estrategia repara punteros de hoja (y por lo tanto pregunta).
    fn fixes_leaf_pointers(&self) -> bool {
        false
    }

    /// Al terminar una corrida de `ref_count` punteros a `leaf_no` que
    /// acaba en `lindex`. Puede reescribir la tabla y mover `lindex`.
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
        Ok(Walk::Continue)
    }

    fn check_eattr_indir(&mut self, cx: &mut Fsck, ip: &mut Inode, blk: u64, parent: u64) -> Result<Walk> {
        Ok(Walk::Continue)
    }

    fn check_eattr_leaf(&mut self, cx: &mut Fsck, ip: &mut Inode, blk: u64, parent: u64) -> Result<Walk> {
        Ok(Walk::Continue)
    }

    fn check_eattr_entry(&mut self, cx: &mut Fsck, ip: &mut Inode, leaf_blk: u64, off: usize, ea: &EaHeader) -> Result<Walk> {
        Ok(Walk::Continue)
    }

    fn check_eattr_extentry(&mut self, cx: &mut Fsck, ip: &mut Inode, ptr: u64, leaf_blk: u64, ea: &EaHeader) -> Result<Walk> {
        Ok(Walk::Continue)
    }

    fn finish_eattr_indir(
        &mut self,
        cx: &mut Fsck,
        ip: &mut Inode,
        leaf_pointers: u32,
        leaf_pointer_errors: u32,
    ) -> Result<()> {
        Ok(())
    }

    fn big_file_msg(&mut self, cx: &mut Fsck, ip: &mut Inode, lblock: u64, total: u64) {}
}

// -----------------------------------------------------------------------------
// Tabla de hash de un directorio
// -----------------------------------------------------------------------------

/// Punteros a hojas de un directorio con hash, junto con los bloques que los
/// guardan para poder reescribirlos.
#[derive(Debug)]
pub struct HashTable {
    slots: Vec<u64>,
    locs: Vec<(usize, usize)>,
    bufs: Vec<Buffer>,
    stuffed: bool,
    dirty: bool,
}

impl HashTable {
    fn load(bufs: Vec<Buffer>, head: usize, stuffed: bool, max: u64) -> Self {
        let mut slots = Vec::new();
        let mut locs = Vec::new();
        'outer: for (bi, b) in bufs.iter().enumerate() {
            let mut off = head;
            while off + 8 <= b.data.len() {
                if slots.len() as u64 == max {
                    break 'outer;
                }
                slots.push(b.ptr(off));
                locs.push((bi, off));
                off += 8;
            }
        }
        Self { slots, locs, bufs, stuffed, dirty: false }
    }

    pub fn len(&self) -> u64 {
        self.slots.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, i: u64) -> u64 {
        self.slots.get(i as usize).copied().unwrap_or(0)
    }

    pub fn set(&mut self, i: u64, val: u64) {
        let i = i as usize;
        if i >= self.slots.len() {
            return;
        }
        self.slots[i] = val;
        let (bi, off) = self.locs[i];
        self.bufs[bi].set_ptr(off, val);
        self.dirty = true;
    }

    fn store(self, cx: &mut Fsck, ip: &mut Inode) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        if self.stuffed {
            if let Some(b) = self.bufs.first() {
                ip.bh.data[DINODE_SIZE..].copy_from_slice(&b.data[DINODE_SIZE..]);
                ip.mark_dirty();
            }
            return Ok(());
        }
        for b in self.bufs {
            if b.is_modified() {
                cx.fs.cache.brelse(b)?;
            }
        }
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// Árbol de metadatos
// -----------------------------------------------------------------------------

/// Recorre el árbol de punteros de `ip` nivel por nivel y después sus
/// datos (archivos) o sus hojas (directorios con hash).
pub fn check_metatree(cx: &mut Fsck, ip: &mut Inode, pass: &mut dyn MetaWalk) -> Result<WalkOutcome> {
    let mut out = WalkOutcome::default();
    let exhash = ip.is_exhash() && cx.fs.is_dir(ip);
    let height = ip.di.height;
    if height == 0 && !exhash {
        return Ok(out);
    }
    if height > MAX_META_HEIGHT {
        error!("inodo {} (0x{:x}): altura {} inválida", ip.addr, ip.addr, height);
        out.errors += 1;
        return Ok(out);
    }
    let ihead = cx.fs.format.indirect_header_len();
    // en un directorio con hash el último nivel es la tabla
    let max_level = if exhash { height } else { height - 1 };

    let mut level: Vec<Buffer> = vec![ip.bh.clone()];
    for h in 1..=max_level {
        let head = if h == 1 { DINODE_SIZE } else { ihead };
        let mut next = Vec::new();
        for bh in &level {
            for ptr in pointers(&bh.data, head) {
                if ptr == 0 {
                    continue;
                }
                if cx.aborted() {
                    out.aborted = true;
                    return Ok(out);
                }
                match pass.check_metalist(cx, ip, ptr, h)? {
                    Walk::Continue => next.push(cx.fs.cache.bread(ptr)?),
                    w => {
                        if out.apply(w) {
                            return Ok(out);
                        }
                    }
                }
            }
        }
        level = next;
    }

    if exhash {
        if ip.di.depth > DIR_MAX_DEPTH {
            error!("directorio {} (0x{:x}): profundidad {} inválida", ip.addr, ip.addr, ip.di.depth);
            out.errors += 1;
            return Ok(out);
        }
        let stuffed = max_level == 0;
        let head = if stuffed { DINODE_SIZE } else { META_HEADER_SIZE };
        let mut table = HashTable::load(level, head, stuffed, 1u64 << ip.di.depth);
        let res = check_leaf_blks(cx, ip, pass, &mut table)?;
        table.store(cx, ip)?;
        out.merge(res);
        return Ok(out);
    }

    let head = if max_level == 0 { DINODE_SIZE } else { ihead };
    let total: u64 = level
        .iter()
        .map(|bh| pointers(&bh.data, head).filter(|&p| p != 0).count() as u64)
        .sum();
    let mut done = 0u64;
    for bh in &level {
        for ptr in pointers(&bh.data, head) {
            if ptr == 0 {
                continue;
            }
            if cx.aborted() {
                out.aborted = true;
                return Ok(out);
            }
            if out.apply(pass.check_data(cx, ip, ptr)?) {
                return Ok(out);
            }
            done += 1;
            if total > BIG_FILE_STEP && done % BIG_FILE_STEP == 0 {
                pass.big_file_msg(cx, ip, done, total);
            }
        }
    }
    Ok(out)
}

// -----------------------------------------------------------------------------
// Hojas de directorio
// -----------------------------------------------------------------------------

fn valid_leaf(cx: &mut Fsck, blk: u64) -> Result<bool> {
    if blk == 0 || !cx.fs.valid_block(blk) {
        return Ok(false);
    }
    let bh = cx.fs.cache.bread(blk)?;
    Ok(check_meta(&bh.data, METATYPE_LF))
}

struct Run {
    leaf: u64,
    count: u64,
    /// La hoja cabeza la aceptó la estrategia (no es duplicado ni error).
    checkable: bool,
    hdr: Leaf,
}

/// Recorre la tabla de hash: corrige punteros malos, visita cada hoja (y
/// las encadenadas) y revisa cuántos punteros recibe cada una.
pub fn check_leaf_blks(
    cx: &mut Fsck,
    ip: &mut Inode,
    pass: &mut dyn MetaWalk,
    table: &mut HashTable,
) -> Result<WalkOutcome> {
    let mut out = WalkOutcome::default();
    let hsize = table.len();
    let expected = 1u64 << ip.di.depth;
    if hsize < expected {
        error!(
            "directorio {} (0x{:x}): la tabla tiene {} punteros, se esperaban {}",
            ip.addr, ip.addr, hsize, expected
        );
        out.errors += 1;
    }

    let mut first_good = None;
    for i in 0..hsize {
        let blk = table.get(i);
        if valid_leaf(cx, blk)? {
            first_good = Some(blk);
            break;
        }
    }
    let Some(mut prev_good) = first_good else {
        error!("directorio {} (0x{:x}): ninguna hoja válida", ip.addr, ip.addr);
        out.errors += 1;
        return Ok(out);
    };

    let mut decisions: BTreeMap<u64, bool> = BTreeMap::new();
    // cada hoja se recorre una sola vez aunque la tabla vuelva a pasar por ella
    let mut walked: BTreeMap<u64, Walk> = BTreeMap::new();
    let mut run: Option<Run> = None;
    let mut lindex = 0u64;
    let mut restarts = 0u64;

    loop {
        while lindex < hsize {
            if cx.aborted() {
                out.aborted = true;
                return Ok(out);
            }
            let mut leaf_no = table.get(lindex);
            if !valid_leaf(cx, leaf_no)? {
                if !pass.fixes_leaf_pointers() {
                    lindex += 1;
                    continue;
                }
                let fix = match decisions.get(&leaf_no) {
                    Some(&d) => d,
                    None => {
                        let msg = format!(
                            "directorio {} (0x{:x}): puntero de hoja inválido {} (0x{:x}) en la posición {}",
                            ip.addr, ip.addr, leaf_no, leaf_no, lindex
                        );
                        error!("{}", msg);
                        cx.report.inode_error(msg);
                        let d = cx.query(&format!(
                            "¿Reemplazar los punteros {} por la hoja {}?",
                            leaf_no, prev_good
                        ));
                        decisions.insert(leaf_no, d);
                        d
                    }
                };
                if !fix {
                    lindex += 1;
                    continue;
                }
                table.set(lindex, prev_good);
                leaf_no = prev_good;
            }

            if let Some(r) = run.as_mut() {
                if r.leaf == leaf_no {
                    r.count += 1;
                    lindex += 1;
                    continue;
                }
            }
            if let Some(r) = run.take() {
                let before = lindex;
                if out.apply(close_run(cx, ip, pass, r, &mut lindex, table)?) {
                    return Ok(out);
                }
                if lindex != before && restarts < hsize {
                    // la tabla cambió: seguir desde la nueva posición
                    restarts += 1;
                    continue;
                }
            }

            prev_good = leaf_no;
            let (head_walk, hdr) = match walked.get(&leaf_no) {
                Some(&w) => {
                    let bh = cx.fs.cache.bread(leaf_no)?;
                    (w, Leaf::decode(&bh.data))
                }
                None => {
                    let (w, hdr) = walk_leaf_chain(cx, ip, pass, leaf_no, &mut out)?;
                    if out.aborted {
                        return Ok(out);
                    }
                    walked.insert(leaf_no, w);
                    (w, hdr)
                }
            };
            run = Some(Run { leaf: leaf_no, count: 1, checkable: head_walk == Walk::Continue, hdr });
            lindex += 1;
        }

        let Some(r) = run.take() else {
            break;
        };
        let before = lindex;
        if out.apply(close_run(cx, ip, pass, r, &mut lindex, table)?) {
            return Ok(out);
        }
        if lindex == before || restarts >= hsize {
            break;
        }
        restarts += 1;
    }
    Ok(out)
}

fn close_run(
    cx: &mut Fsck,
    ip: &mut Inode,
    pass: &mut dyn MetaWalk,
    run: Run,
    lindex: &mut u64,
    table: &mut HashTable,
) -> Result<Walk> {
    if !run.checkable {
        return Ok(Walk::Continue);
    }
    let mut count = run.count;
    pass.check_num_ptrs(cx, ip, run.leaf, &mut count, lindex, &run.hdr, table)
}

/// Visita `leaf_no` y las hojas encadenadas. Devuelve lo que la estrategia
/// dijo de la hoja cabeza y su encabezado.
fn walk_leaf_chain(
    cx: &mut Fsck,
    ip: &mut Inode,
    pass: &mut dyn MetaWalk,
    leaf_no: u64,
    out: &mut WalkOutcome,
) -> Result<(Walk, Leaf)> {
    let mut head = (Walk::Continue, Leaf::default());
    let mut seen = BTreeSet::from([leaf_no]);
    let mut blk = leaf_no;
    loop {
        let w = pass.check_leaf(cx, ip, blk)?;
        if blk == leaf_no {
            head.0 = w;
        }
        if w != Walk::Continue {
            out.apply(w);
            break;
        }
        let mut bh = cx.fs.cache.bread(blk)?;
        let mut leaf = Leaf::decode(&bh.data);
        if blk == leaf_no {
            head.1 = leaf;
        }
        if pass.visits_dentries() {
            let data = bh.data.clone();
            visit_dentries(cx, ip, pass, &data, LEAF_SIZE, blk, out)?;
            if out.aborted {
                break;
            }
        }
        let next = leaf.next;
        if next == 0 {
            break;
        }
        let why = if seen.contains(&next) {
            Some("forma un ciclo")
        } else if !valid_leaf(cx, next)? {
            Some("no es una hoja válida")
        } else {
            None
        };
        if let Some(why) = why {
            warn!(
                "directorio {} (0x{:x}): la hoja {} encadena a {}, que {}",
                ip.addr, ip.addr, blk, next, why
            );
            if pass.fixes_leaf_pointers() {
                cx.report
                    .inode_error(format!("directorio {}: cadena de hojas rota en {}", ip.addr, blk));
                if cx.query("¿Cortar la cadena de hojas?") {
                    leaf.next = 0;
                    leaf.encode(&mut bh.data);
                    bh.mark_modified();
                    cx.fs.cache.brelse(bh)?;
                }
            }
            break;
        }
        seen.insert(next);
        blk = next;
    }
    Ok(head)
}

#[allow(clippy::too_many_arguments)]
fn visit_dentries(
    cx: &mut Fsck,
    ip: &mut Inode,
    pass: &mut dyn MetaWalk,
    data: &[u8],
    start: usize,
    blk: u64,
    out: &mut WalkOutcome,
) -> Result<()> {
    let entries = match cx.fs.block_entries(data, start, blk) {
        Ok(e) => e,
        Err(e) => {
            warn!("directorio {} (0x{:x}): {}", ip.addr, ip.addr, e);
            out.errors += 1;
            return Ok(());
        }
    };
    for de in &entries {
        if out.apply(pass.check_dentry(cx, ip, de, blk)?) {
            break;
        }
    }
    Ok(())
}

/// Entradas de un directorio, tenga hash o no.
pub fn check_dir(cx: &mut Fsck, ip: &mut Inode, pass: &mut dyn MetaWalk) -> Result<WalkOutcome> {
    if ip.is_exhash() {
        return check_metatree(cx, ip, pass);
    }
    check_linear_dir(cx, ip, pass)
}

pub fn check_linear_dir(cx: &mut Fsck, ip: &mut Inode, pass: &mut dyn MetaWalk) -> Result<WalkOutcome> {
    let mut out = WalkOutcome::default();
    if pass.visits_dentries() {
        let data = ip.bh.data.clone();
        let addr = ip.addr;
        visit_dentries(cx, ip, pass, &data, DINODE_SIZE, addr, &mut out)?;
    }
    Ok(out)
}

// -----------------------------------------------------------------------------
// Atributos extendidos
// -----------------------------------------------------------------------------

pub fn check_inode_eattr(cx: &mut Fsck, ip: &mut Inode, pass: &mut dyn MetaWalk) -> Result<WalkOutcome> {
    let mut out = WalkOutcome::default();
    let ea = ip.di.eattr;
    if ea == 0 {
        return Ok(out);
    }
    if ip.di.flags & DIF_EA_INDIRECT == 0 {
        out.merge(check_eattr_leaf_blk(cx, ip, pass, ea, ip.addr)?);
        return Ok(out);
    }

    let w = pass.check_eattr_indir(cx, ip, ea, ip.addr)?;
    if w != Walk::Continue {
        out.apply(w);
        return Ok(out);
    }
    let bh = cx.fs.cache.bread(ea)?;
    let (mut leaf_pointers, mut leaf_pointer_errors) = (0u32, 0u32);
    for ptr in pointers(&bh.data, META_HEADER_SIZE) {
        if ptr == 0 {
            break;
        }
        leaf_pointers += 1;
        let res = check_eattr_leaf_blk(cx, ip, pass, ptr, ea)?;
        if res.errors > 0 {
            leaf_pointer_errors += 1;
        }
        out.merge(res);
        if out.aborted {
            return Ok(out);
        }
    }
    pass.finish_eattr_indir(cx, ip, leaf_pointers, leaf_pointer_errors)?;
    Ok(out)
}

fn check_eattr_leaf_blk(
    cx: &mut Fsck,
    ip: &mut Inode,
    pass: &mut dyn MetaWalk,
    blk: u64,
    parent: u64,
) -> Result<WalkOutcome> {
    let mut out = WalkOutcome::default();
    let w = pass.check_eattr_leaf(cx, ip, blk, parent)?;
    if w != Walk::Continue {
        out.apply(w);
        return Ok(out);
    }
    let bh = cx.fs.cache.bread(blk)?;
    let bsize = bh.data.len();
    let mut off = META_HEADER_SIZE;
    loop {
        if off + EA_HEADER_SIZE > bsize {
            warn!("atributos del bloque {} (0x{:x}): lista truncada", blk, blk);
            out.errors += 1;
            break;
        }
        let ea = EaHeader::decode(&bh.data[off..]);
        if out.apply(pass.check_eattr_entry(cx, ip, blk, off, &ea)?) {
            break;
        }
        let rec_len = ea.rec_len as usize;
        if rec_len < EA_HEADER_SIZE || off + rec_len > bsize {
            out.errors += 1;
            break;
        }
        if ea.num_ptrs > 0 {
            let first = off + ea.data_ptrs_offset();
            for i in 0..ea.num_ptrs as usize {
                let at = first + i * 8;
                if at + 8 > off + rec_len {
                    out.errors += 1;
                    break;
                }
                let ptr = read_be64(&bh.data, at);
                if out.apply(pass.check_eattr_extentry(cx, ip, ptr, blk, &ea)?) {
                    return Ok(out);
                }
            }
        }
        if ea.is_last() {
            break;
        }
        off += rec_len;
    }
    Ok(out)
}
