use log::{debug, info, warn};

use crate::buf::BufferCache;
use crate::error::{FsError, Result};
use crate::format::{self, Format};
use crate::fsck::fsck_backend::BlockDevice;
use crate::ondisk::*;
use crate::rgrp::{Rgrp, RgrpIndex};

// -----------------------------------------------------------------------------
// Inodos de sistema
// -----------------------------------------------------------------------------

/// Direcciones de los inodos de sistema; 0 si falta o no aplica.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SystemInodes {
    pub master_dir: u64,
    pub root_dir: u64,
    pub jindex: u64,
    pub per_node: u64,
    pub inum: u64,
    pub statfs: u64,
    pub rindex: u64,
    pub quota: u64,
    pub journals: Vec<u64>,
}

impl SystemInodes {
    pub fn contains(&self, blk: u64) -> bool {
        blk != 0
            && (blk == self.master_dir
                || blk == self.root_dir
                || blk == self.jindex
                || blk == self.per_node
                || blk == self.inum
                || blk == self.statfs
                || blk == self.rindex
                || blk == self.quota
                || self.journals.contains(&blk))
    }
}

// -----------------------------------------------------------------------------
// Sistema de archivos montado
// -----------------------------------------------------------------------------

pub struct Gfs2Fs {
    pub format: &'static dyn Format,
    pub sb: Superblock,
    pub bsize: u32,
    /// Bloque donde vive el superbloque.
    pub sb_addr: u64,
    /// Primer bloque fuera del sistema de archivos.
    pub fssize: u64,
    pub cache: BufferCache,
    pub rgrps: RgrpIndex,
    pub md: SystemInodes,
}

impl Gfs2Fs {
    /// Arma el handle sin leer el índice de grupos (lo usa mkfs).
    pub fn new(format: &'static dyn Format, sb: Superblock, cache: BufferCache) -> Self {
        let bsize = sb.bsize;
        let fssize = cache.device_blocks();
        Self {
            format,
            sb,
            bsize,
            sb_addr: SB_OFFSET / bsize as u64,
            fssize,
            cache,
            rgrps: RgrpIndex::new(),
            md: SystemInodes::default(),
        }
    }

    /// Lee superbloque, rindex, grupos de recursos e inodos de sistema.
    pub fn open(mut dev: Box<dyn BlockDevice>, read_only: bool) -> Result<Self> {
        let mut raw = vec![0u8; 512];
        dev.read_at(SB_OFFSET, &mut raw)?;
        let format = format::detect(&raw).ok_or_else(|| {
            FsError::BadSuperblock("no se encontró un superbloque GFS2 ni GFS".into())
        })?;
        let sb = format.decode_sb(&raw);
        if !sb.bsize.is_power_of_two() || !(512..=65536).contains(&sb.bsize) {
            return Err(FsError::BadSuperblock(format!("tamaño de bloque inválido: {}", sb.bsize)));
        }
        if 1u32 << sb.bsize_shift != sb.bsize {
            return Err(FsError::BadSuperblock(format!(
                "bsize_shift {} no corresponde a bsize {}",
                sb.bsize_shift, sb.bsize
            )));
        }
        info!("superbloque {} con bloques de {} bytes", format.name(), sb.bsize);

        let cache = BufferCache::new(dev, sb.bsize, read_only);
        let mut fs = Self::new(format, sb, cache);

        fs.md.root_dir = fs.sb.root_dir.addr;
        if format.is_legacy() {
            fs.md.jindex = fs.sb.jindex_di.addr;
            fs.md.rindex = fs.sb.rindex_di.addr;
            fs.md.quota = fs.sb.quota_di.addr;
            fs.md.statfs = fs.sb.license_di.addr;
        } else {
            fs.md.master_dir = fs.sb.master_dir.addr;
            fs.lookup_master()?;
        }

        fs.read_rindex()?;
        fs.fssize = fs.rgrps.fs_end();
        if !format.is_legacy() {
            fs.lookup_journals()?;
        }
        Ok(fs)
    }

    /// true si `blk` puede ser destino de un puntero.
    pub fn check_range(&self, blk: u64) -> bool {
        blk < self.fssize && blk > self.sb_addr
    }

    /// Como check_range, además de tener bits en algún bitmap.
    pub fn valid_block(&self, blk: u64) -> bool {
        self.check_range(blk) && self.rgrps.get_state(blk).is_ok()
    }

    pub fn get_bitmap(&self, blk: u64) -> Result<BlockState> {
        self.rgrps.get_state(blk)
    }

    pub fn set_bitmap(&mut self, blk: u64, state: BlockState) -> Result<()> {
        self.rgrps.set_state(blk, state)
    }

    pub fn is_system_inode(&self, blk: u64) -> bool {
        self.md.contains(blk)
    }

    pub fn write_sb(&mut self) -> Result<()> {
        let mut raw = vec![0u8; self.bsize as usize];
        self.format.encode_sb(&self.sb, &mut raw);
        self.cache.write_raw(SB_OFFSET, &raw)
    }

    /// Escribe los bitmaps y todos los bloques sucios.
    pub fn flush(&mut self) -> Result<()> {
        self.rgrps.write_back(&mut self.cache)?;
        self.cache.flush()
    }

    fn read_rindex(&mut self) -> Result<()> {
        let addr = self.md.rindex;
        if addr == 0 || !self.check_range(addr) {
            return Err(FsError::BadRindex("no se encontró el archivo rindex".into()));
        }
        let ip = self.inode_read(addr)?;
        if !check_meta(&ip.bh.data, METATYPE_DI) {
            return Err(FsError::BadRindex(format!("el rindex en {} no es un dinode", addr)));
        }
        if ip.di.size % RINDEX_SIZE as u64 != 0 {
            warn!("el tamaño del rindex ({}) no es múltiplo de {}", ip.di.size, RINDEX_SIZE);
        }
        let data = self.readi(&ip, 0, ip.di.size as usize)?;
        let device_blocks = self.cache.device_blocks();

        for chunk in data.chunks_exact(RINDEX_SIZE) {
            let ri = Rindex::decode(chunk);
            if ri.addr <= self.sb_addr || ri.data_end() > device_blocks || ri.data0 < ri.addr + ri.length as u64 {
                return Err(FsError::BadRindex(format!(
                    "entrada inválida: grupo en {} con datos {}..{}",
                    ri.addr,
                    ri.data0,
                    ri.data_end()
                )));
            }
            let mut rgrp = Rgrp::new(ri);
            rgrp.compute_bitstructs(self.bsize)?;
            rgrp.read(&mut self.cache)?;
            self.rgrps.insert(rgrp)?;
        }
        if self.rgrps.is_empty() {
            return Err(FsError::BadRindex("el rindex está vacío".into()));
        }
        debug!("{} grupos de recursos", self.rgrps.len());
        Ok(())
    }

    /// Busca `name` en el directorio `dir`; 0 si no está o no se puede leer.
    fn sys_lookup(&mut self, dir: u64, name: &str) -> Result<u64> {
        if dir == 0 || !self.check_range(dir) {
            return Ok(0);
        }
        let dip = self.inode_read(dir)?;
        if !check_meta(&dip.bh.data, METATYPE_DI) || !self.is_dir(&dip) {
            warn!("{} no es un directorio, no se puede buscar \"{}\"", dir, name);
            return Ok(0);
        }
        match self.dir_search(&dip, name.as_bytes()) {
            Ok(Some(de)) => Ok(de.inum.addr),
            Ok(None) => Ok(0),
            Err(e) => {
                warn!("no se pudo buscar \"{}\" en {}: {}", name, dir, e);
                Ok(0)
            }
        }
    }

    fn lookup_master(&mut self) -> Result<()> {
        let master = self.md.master_dir;
        self.md.jindex = self.sys_lookup(master, "jindex")?;
        self.md.per_node = self.sys_lookup(master, "per_node")?;
        self.md.inum = self.sys_lookup(master, "inum")?;
        self.md.statfs = self.sys_lookup(master, "statfs")?;
        self.md.rindex = self.sys_lookup(master, "rindex")?;
        self.md.quota = self.sys_lookup(master, "quota")?;
        Ok(())
    }

    fn lookup_journals(&mut self) -> Result<()> {
        let jindex = self.md.jindex;
        if jindex == 0 || !self.check_range(jindex) {
            return Ok(());
        }
        let dip = self.inode_read(jindex)?;
        if !check_meta(&dip.bh.data, METATYPE_DI) || !self.is_dir(&dip) {
            return Ok(());
        }
        let mut journals: Vec<(u32, u64)> = match self.dir_entries(&dip) {
            Ok(entries) => entries
                .iter()
                .filter_map(|de| {
                    let n = de.name.strip_prefix("journal")?.parse::<u32>().ok()?;
                    Some((n, de.inum.addr))
                })
                .collect(),
            Err(e) => {
                warn!("no se pudieron leer las entradas de jindex: {}", e);
                Vec::new()
            }
        };
        // índice = número de journal; los huecos quedan en 0
        let count = journals.iter().map(|&(n, _)| n as usize + 1).max().unwrap_or(0);
        self.md.journals = vec![0; count];
        for (n, addr) in journals {
            self.md.journals[n as usize] = addr;
        }
        debug!("{} journals", self.md.journals.len());
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// Asignación de bloques
// -----------------------------------------------------------------------------

/// De dónde salen los bloques nuevos (hojas de directorio, dinodos...).
pub trait BlockAllocator {
    fn alloc(&mut self, fs: &mut Gfs2Fs, state: BlockState) -> Result<u64>;
}

/// Confía en el bitmap en disco tal como está.
pub struct BitmapAllocator;

impl BlockAllocator for BitmapAllocator {
    fn alloc(&mut self, fs: &mut Gfs2Fs, state: BlockState) -> Result<u64> {
        fs.rgrps.alloc(state, |_| false)
    }
}
