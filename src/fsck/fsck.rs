/*EL ARCHIVO PRINCIPAL DE FSCK. Aquí está el contexto de la corrida (mapa
de bloques, duplicados, directorios, enlaces), las preguntas al operador,
la corrección del bitmap en disco y run_fsck, que encadena los pasos. */

use std::collections::BTreeSet;
use std::io::{self, BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, error, info, warn};

use super::blockmap::{BlockMap, BlockMark};
use super::dirscan;
use super::dirtree::DirTree;
use super::dups::DupTracker;
use super::fsck_backend::BlockDevice;
use super::fsck_types::*;
use super::link::LinkCounts;
use super::metawalk::{check_inode_eattr, check_metatree, MetaWalk, Walk};
use super::pass1;
use super::pass3;
use crate::error::Result;
use crate::fs::{BlockAllocator, Gfs2Fs};
use crate::inode::Inode;
use crate::ondisk::{BlockState, Inum};

/// Lo pone el manejador de SIGINT; los pasos lo revisan entre inodos.
pub static FSCK_ABORT: AtomicBool = AtomicBool::new(false);

pub fn request_abort() {
    FSCK_ABORT.store(true, Ordering::SeqCst);
}

pub struct Fsck {
    pub fs: Gfs2Fs,
    pub opts: FsckOptions,
    pub bl: BlockMap,
    pub dups: DupTracker,
    pub dirtree: DirTree,
    pub links: LinkCounts,
    /// Inodos con bloques de atributos extendidos.
    pub eattr_blocks: BTreeSet<u64>,
    pub lf_dip: Option<u64>,
    pub report: FsckReport,
    /// Inodos clasificados sin errores, en el orden de la pasada 1.
    pub classified: Vec<u64>,
    /// Bloques de datos del rindex en el formato heredado.
    pub gfs1_rindex_blks: BTreeSet<u64>,
    answer: AnswerMode,
    abort: bool,
}

impl Fsck {
    pub fn new(fs: Gfs2Fs, opts: FsckOptions) -> Self {
        let answer = if opts.read_only { AnswerMode::No } else { opts.answer };
        let bl = BlockMap::new(fs.fssize);
        Self {
            fs,
            opts,
            bl,
            dups: DupTracker::new(),
            dirtree: DirTree::new(),
            links: LinkCounts::new(),
            eattr_blocks: BTreeSet::new(),
            lf_dip: None,
            report: FsckReport::new(),
            classified: Vec::new(),
            gfs1_rindex_blks: BTreeSet::new(),
            answer,
            abort: false,
        }
    }

    pub fn open(dev: Box<dyn BlockDevice>, opts: FsckOptions) -> Result<Self> {
        let fs = Gfs2Fs::open(dev, opts.read_only)?;
        Ok(Self::new(fs, opts))
    }

    pub fn aborted(&self) -> bool {
        self.abort || FSCK_ABORT.load(Ordering::SeqCst)
    }

    // -------------------------------------------------------------------------
    // Preguntas
    // -------------------------------------------------------------------------

    /// Pregunta si se aplica una reparación.
    pub fn query(&mut self, question: &str) -> bool {
        if self.aborted() {
            self.report.declined += 1;
            return false;
        }
        let yes = match self.answer {
            AnswerMode::Yes => {
                info!("{} (y/n) y", question);
                true
            }
            AnswerMode::No => {
                info!("{} (y/n) n", question);
                false
            }
            AnswerMode::Ask => self.ask(question),
        };
        if yes {
            self.report.fixed += 1;
        } else {
            self.report.declined += 1;
        }
        yes
    }

    fn ask(&mut self, question: &str) -> bool {
        let stdin = io::stdin();
        match self.ask_from(question, &mut stdin.lock(), &mut io::stdout()) {
            Ok(yes) => yes,
            Err(e) => {
                warn!("no se pudo preguntar al operador: {}", e);
                false
            }
        }
    }

    /// Pregunta por `out` hasta leer una respuesta válida de `input`.
    fn ask_from<R: BufRead, W: Write>(&mut self, question: &str, input: &mut R, out: &mut W) -> io::Result<bool> {
        loop {
            write!(out, "{} (y/n/a/q) ", question)?;
            out.flush()?;
            let mut line = String::new();
            if input.read_line(&mut line)? == 0 {
                return Ok(false);
            }
            match line.trim().chars().next() {
                Some('y') | Some('Y') => return Ok(true),
                Some('n') | Some('N') => return Ok(false),
                Some('a') | Some('A') => {
                    self.answer = AnswerMode::Yes;
                    return Ok(true);
                }
                Some('q') | Some('Q') => {
                    warn!("cancelado por el operador");
                    self.abort = true;
                    return Ok(false);
                }
                _ => writeln!(out, "Conteste y (sí), n (no), a (sí a todo) o q (salir).")?,
            }
        }
    }

    // -------------------------------------------------------------------------
    // Mapa de bloques y bitmap
    // -------------------------------------------------------------------------

    /// Estado de bitmap que implica una marca; None si la marca no lo fija.
    fn bitmap_state(&self, mark: BlockMark) -> Option<BlockState> {
        let fmt = self.fs.format;
        match mark {
            BlockMark::Free | BlockMark::MetaInval => Some(BlockState::Free),
            BlockMark::Used => Some(BlockState::Used),
            BlockMark::Indir | BlockMark::Leaf | BlockMark::Eattr => Some(fmt.meta_state()),
            BlockMark::JData => Some(fmt.jdata_state()),
            BlockMark::FreeMeta => fmt.free_meta_state(),
            m if m.is_inode() => Some(BlockState::Dinode),
            _ => None,
        }
    }

    /// Marca `blk` en el mapa y revisa que el bitmap en disco coincida.
    pub fn fsck_blockmap_set(&mut self, inode: u64, blk: u64, what: &str, mark: BlockMark) -> Result<()> {
        let prev = self.bl.mark(blk, mark)?;
        debug!(
            "inodo {} (0x{:x}): bloque {} (0x{:x}) {}: {:?} -> {:?}",
            inode, inode, blk, blk, what, prev, mark
        );
        self.check_n_fix_bitmap(blk, mark)
    }

    pub fn check_n_fix_bitmap(&mut self, blk: u64, mark: BlockMark) -> Result<()> {
        let Some(want) = self.bitmap_state(mark) else {
            return Ok(());
        };
        let Ok(have) = self.fs.get_bitmap(blk) else {
            return Ok(());
        };
        if have == want {
            return Ok(());
        }
        if want == BlockState::Free && Some(have) == self.fs.format.free_meta_state() {
            return Ok(());
        }
        let msg = format!(
            "bloque {} (0x{:x}): el bitmap dice {:?} pero el bloque es {:?}",
            blk, blk, have, mark
        );
        error!("{}", msg);
        self.report.block_error(msg);
        if self.query("¿Corregir el bitmap?") {
            self.fs.set_bitmap(blk, want)?;
            info!("bitmap del bloque {} corregido a {:?}", blk, want);
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Cambios al sistema de archivos durante la reparación
    // -------------------------------------------------------------------------

    pub fn dir_add(&mut self, dip: &mut Inode, name: &[u8], inum: Inum, de_type: u16) -> Result<()> {
        let mut alloc = CheckedAllocator { bl: &self.bl };
        self.fs.dir_add(dip, name, inum, de_type, &mut alloc)
    }

    /// Marca en el mapa los bloques que `ip` ganó por una reparación.
    pub fn reprocess_inode(&mut self, ip: &mut Inode, desc: &str) -> Result<()> {
        info!("reprocesando {} ({})", ip.addr, desc);
        let mut pass = Reprocess;
        check_metatree(self, ip, &mut pass)?;
        check_inode_eattr(self, ip, &mut pass)?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Corrida
    // -------------------------------------------------------------------------

    pub fn run(&mut self) -> Result<()> {
        // --- Paso 1: clasificación de bloques ---
        info!("pasada 1: bloques e inodos");
        if pass1::pass1(self)? == PassStatus::Aborted {
            return self.stop();
        }
        info!(
            "pasada 1 terminada: {} inodos, {} bloques duplicados, {} directorios",
            self.classified.len(),
            self.dups.len(),
            self.dirtree.len()
        );

        // --- Paso 2: padres de cada directorio ---
        info!("pasada 2: padres de los directorios");
        if dirscan::scan_dirs(self)? == PassStatus::Aborted {
            return self.stop();
        }

        // --- Paso 3: conectividad del árbol ---
        info!("pasada 3: conectividad de directorios");
        if pass3::pass3(self)? == PassStatus::Aborted {
            return self.stop();
        }

        // --- Paso 4: a disco ---
        self.flush()
    }

    fn stop(&mut self) -> Result<()> {
        warn!("fsck cancelado; se guardan las reparaciones ya aceptadas");
        self.report.aborted = true;
        self.flush()
    }

    fn flush(&mut self) -> Result<()> {
        if self.opts.read_only {
            return Ok(());
        }
        self.fs.flush()
    }
}

/// Corre todos los pasos sobre `fs` y devuelve el reporte.
pub fn run_fsck(fs: Gfs2Fs, opts: FsckOptions) -> Result<FsckReport> {
    let mut cx = Fsck::new(fs, opts);
    cx.run()?;
    Ok(cx.report)
}

// -----------------------------------------------------------------------------
// Asignación que respeta el mapa de bloques
// -----------------------------------------------------------------------------

/// Toma bloques libres en el bitmap que el mapa tampoco haya reclamado.
pub struct CheckedAllocator<'a> {
    pub bl: &'a BlockMap,
}

impl BlockAllocator for CheckedAllocator<'_> {
    fn alloc(&mut self, fs: &mut Gfs2Fs, state: BlockState) -> Result<u64> {
        let bl = self.bl;
        fs.rgrps.alloc(state, |b| !matches!(bl.query(b), Ok(BlockMark::Free)))
    }
}

/// Marca los bloques libres en el mapa que ahora pertenecen al inodo.
struct Reprocess;

impl MetaWalk for Reprocess {
    fn check_metalist(&mut self, cx: &mut Fsck, ip: &mut Inode, blk: u64, _height: u16) -> Result<Walk> {
        if !cx.fs.valid_block(blk) {
            return Ok(Walk::Skip);
        }
        if cx.bl.query(blk)? == BlockMark::Free {
            cx.fsck_blockmap_set(ip.addr, blk, "bloque indirecto nuevo", BlockMark::Indir)?;
        }
        Ok(Walk::Continue)
    }

    fn check_leaf(&mut self, cx: &mut Fsck, ip: &mut Inode, blk: u64) -> Result<Walk> {
        if cx.bl.query(blk)? == BlockMark::Free {
            cx.fsck_blockmap_set(ip.addr, blk, "hoja nueva", BlockMark::Leaf)?;
        }
        Ok(Walk::Continue)
    }

    fn check_data(&mut self, cx: &mut Fsck, ip: &mut Inode, blk: u64) -> Result<Walk> {
        if !cx.fs.valid_block(blk) {
            return Ok(Walk::Skip);
        }
        if cx.bl.query(blk)? == BlockMark::Free {
            let mark = if ip.is_jdata() { BlockMark::JData } else { BlockMark::Used };
            cx.fsck_blockmap_set(ip.addr, blk, "bloque de datos nuevo", mark)?;
        }
        Ok(Walk::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsck::mock::MemDevice;
    use crate::mkfs::{mkfs, MkfsOptions};

    fn small_fs() -> Gfs2Fs {
        let dev = MemDevice::new(2 * 1024 * 1024);
        let opts = MkfsOptions {
            block_size: 1024,
            rgrp_blocks: 512,
            journal_blocks: 16,
            ..Default::default()
        };
        mkfs(Box::new(dev), &opts).unwrap()
    }

    #[test]
    fn test_answer_modes() {
        let mut cx = Fsck::new(small_fs(), FsckOptions::yes());
        assert!(cx.query("¿Sí?"));
        assert_eq!(cx.report.fixed, 1);

        let mut cx = Fsck::new(small_fs(), FsckOptions::no());
        assert!(!cx.query("¿No?"));
        assert_eq!(cx.report.declined, 1);
    }

    struct BrokenOut;

    impl Write for BrokenOut {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "cerrado"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_prompt_answers() {
        let mut cx = Fsck::new(small_fs(), FsckOptions { answer: AnswerMode::Ask, read_only: false });
        let mut out = Vec::new();
        assert!(cx.ask_from("¿Arreglar?", &mut io::Cursor::new("x\na\n"), &mut out).unwrap());
        assert!(String::from_utf8(out).unwrap().contains("Conteste"));
        // "a" deja el resto en sí
        assert!(cx.query("¿Otra?"));

        let mut cx = Fsck::new(small_fs(), FsckOptions { answer: AnswerMode::Ask, read_only: false });
        assert!(!cx.ask_from("¿Arreglar?", &mut io::Cursor::new("q\n"), &mut Vec::new()).unwrap());
        assert!(cx.aborted());
        // sin entrada se contesta que no
        assert!(!cx.ask_from("¿Arreglar?", &mut io::Cursor::new(""), &mut Vec::new()).unwrap());
    }

    #[test]
    fn test_prompt_write_failure_is_reported() {
        let mut cx = Fsck::new(small_fs(), FsckOptions { answer: AnswerMode::Ask, read_only: false });
        assert!(cx.ask_from("¿Arreglar?", &mut io::Cursor::new("y\n"), &mut BrokenOut).is_err());
    }

    #[test]
    fn test_blockmap_set_fixes_bitmap() {
        let mut cx = Fsck::new(small_fs(), FsckOptions::yes());
        let blk = cx.fs.rgrps.iter().next().unwrap().ri.data_end() - 1;
        assert_eq!(cx.fs.get_bitmap(blk).unwrap(), BlockState::Free);

        cx.fsck_blockmap_set(blk, blk, "prueba", BlockMark::Used).unwrap();
        assert_eq!(cx.bl.query(blk).unwrap(), BlockMark::Used);
        assert_eq!(cx.fs.get_bitmap(blk).unwrap(), BlockState::Used);
        assert!(!cx.report.blocks_ok);
    }

    #[test]
    fn test_declined_bitmap_fix_leaves_disk_alone() {
        let mut cx = Fsck::new(small_fs(), FsckOptions { answer: AnswerMode::No, read_only: false });
        let blk = cx.fs.rgrps.iter().next().unwrap().ri.data_end() - 1;
        cx.fsck_blockmap_set(blk, blk, "prueba", BlockMark::InodeFile).unwrap();
        assert_eq!(cx.fs.get_bitmap(blk).unwrap(), BlockState::Free);
        assert_eq!(cx.report.declined, 1);
    }

    #[test]
    fn test_checked_allocator_skips_claimed_blocks() {
        let mut cx = Fsck::new(small_fs(), FsckOptions::yes());
        let rg = cx.fs.rgrps.iter().next().unwrap();
        let first = rg.find_state(rg.ri.data0, BlockState::Free).unwrap();
        cx.bl.mark(first, BlockMark::Used).unwrap();
        let mut alloc = CheckedAllocator { bl: &cx.bl };
        let got = alloc.alloc(&mut cx.fs, BlockState::Used).unwrap();
        assert_ne!(got, first);
        assert!(got > first);
    }
}
