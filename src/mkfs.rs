/* Construcción de estructuras: los build_* fabrican un inodo de sistema
mínimo y válido (los usa fsck cuando falta uno) y mkfs() arma una imagen
completa con ellos. */

use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, info};

use crate::buf::BufferCache;
use crate::error::{FsError, Result};
use crate::format::{FileType, Format, GFS1, GFS2};
use crate::fs::{BitmapAllocator, BlockAllocator, Gfs2Fs};
use crate::fsck::fsck_backend::BlockDevice;
use crate::inode::Inode;
use crate::ondisk::*;
use crate::rgrp::Rgrp;

#[derive(Debug, Clone)]
pub struct MkfsOptions {
    pub block_size: u32,
    /// Bloques por grupo de recursos (encabezado y bitmap incluidos).
    pub rgrp_blocks: u32,
    pub journals: u32,
    pub journal_blocks: u32,
    pub legacy: bool,
    pub lockproto: String,
    pub locktable: String,
}

impl Default for MkfsOptions {
    fn default() -> Self {
        Self {
            block_size: 4096,
            rgrp_blocks: 2048,
            journals: 1,
            journal_blocks: 64,
            legacy: false,
            lockproto: "lock_nolock".into(),
            locktable: String::new(),
        }
    }
}

/// Bloques que se le dan a un journal reconstruido.
pub const REBUILT_JOURNAL_BLOCKS: u32 = 64;

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// -----------------------------------------------------------------------------
// Inodos nuevos
// -----------------------------------------------------------------------------

/// Dinode nuevo en un bloque recién asignado.
pub fn new_inode(
    fs: &mut Gfs2Fs,
    alloc: &mut dyn BlockAllocator,
    ft: FileType,
    perm: u32,
    flags: u32,
) -> Result<Inode> {
    let blk = alloc.alloc(fs, BlockState::Dinode)?;
    let bh = fs.cache.bget(blk);
    let t = now();
    let mut di = Dinode {
        header: MetaHeader::new(METATYPE_DI, FORMAT_DI),
        num: Inum::new(blk, blk),
        mode: perm & 0o7777,
        nlink: 1,
        blocks: 1,
        atime: t,
        mtime: t,
        ctime: t,
        goal_meta: blk,
        goal_data: blk,
        flags,
        ..Default::default()
    };
    fs.format.set_file_type(&mut di, ft);
    let mut ip = Inode { addr: blk, di, bh };
    ip.mark_dirty();
    Ok(ip)
}

/// Directorio nuevo con "." y "..". Si `parent` es None, ".." apunta a sí mismo.
pub fn new_dir(
    fs: &mut Gfs2Fs,
    alloc: &mut dyn BlockAllocator,
    parent: Option<Inum>,
    perm: u32,
    flags: u32,
) -> Result<Inode> {
    let mut ip = new_inode(fs, alloc, FileType::Directory, perm, flags)?;
    crate::dir::init_region(&mut ip.bh.data, DINODE_SIZE);
    ip.di.size = fs.bsize as u64 - DINODE_SIZE as u64;
    ip.di.nlink = 2;
    let dt = fs.format.dirent_type(FileType::Directory);
    let me = ip.di.num;
    fs.dir_add(&mut ip, b".", me, dt, alloc)?;
    fs.dir_add(&mut ip, b"..", parent.unwrap_or(me), dt, alloc)?;
    Ok(ip)
}

/// Escribe el contenido de un archivo recién creado, armando el árbol de
/// punteros que haga falta.
pub fn write_new_file_data(
    fs: &mut Gfs2Fs,
    ip: &mut Inode,
    data: &[u8],
    alloc: &mut dyn BlockAllocator,
) -> Result<()> {
    let room = fs.bsize as usize - DINODE_SIZE;
    ip.di.size = data.len() as u64;
    if data.len() <= room {
        ip.bh.data[DINODE_SIZE..DINODE_SIZE + data.len()].copy_from_slice(data);
        ip.di.height = 0;
        ip.mark_dirty();
        return Ok(());
    }

    let jdata = ip.is_jdata() || fs.is_dir(ip);
    let (head, per_block) = if jdata {
        (META_HEADER_SIZE, fs.jbsize() as usize)
    } else {
        (0, fs.bsize as usize)
    };
    let state = if jdata { fs.format.jdata_state() } else { BlockState::Used };

    let mut level = Vec::new();
    for chunk in data.chunks(per_block) {
        let blk = alloc.alloc(fs, state)?;
        let mut bh = fs.cache.bget(blk);
        if jdata {
            MetaHeader::new(METATYPE_JD, FORMAT_JD).encode(&mut bh.data);
        }
        bh.data[head..head + chunk.len()].copy_from_slice(chunk);
        fs.cache.brelse(bh)?;
        level.push(blk);
    }
    let nblocks = level.len() as u64;
    let height = fs.calc_tree_height(nblocks);
    let inptrs = fs.inptrs() as usize;
    let ihead = fs.format.indirect_header_len();
    let mut indirect = 0u64;

    for _ in 1..height {
        let mut next = Vec::new();
        for chunk in level.chunks(inptrs) {
            let blk = alloc.alloc(fs, fs.format.meta_state())?;
            let mut bh = fs.cache.bget(blk);
            MetaHeader::new(METATYPE_IN, FORMAT_IN).encode(&mut bh.data);
            for (i, &p) in chunk.iter().enumerate() {
                write_be64(&mut bh.data, ihead + i * 8, p);
            }
            fs.cache.brelse(bh)?;
            next.push(blk);
            indirect += 1;
        }
        level = next;
    }

    ip.bh.data[DINODE_SIZE..].fill(0);
    for (i, &p) in level.iter().enumerate() {
        write_be64(&mut ip.bh.data, DINODE_SIZE + i * 8, p);
    }
    ip.di.height = height;
    ip.di.blocks = 1 + nblocks + indirect;
    ip.mark_dirty();
    debug!("inodo {}: {} bloques de datos, altura {}", ip.addr, nblocks, height);
    Ok(())
}

/// Enlaza un inodo de sistema: en GFS2 como entrada del directorio maestro,
/// en el formato heredado en su ranura del superbloque.
fn register_system(fs: &mut Gfs2Fs, name: &str, ip: &Inode, alloc: &mut dyn BlockAllocator) -> Result<()> {
    if fs.format.is_legacy() {
        let slot = match name {
            "jindex" => &mut fs.sb.jindex_di,
            "rindex" => &mut fs.sb.rindex_di,
            "quota" => &mut fs.sb.quota_di,
            "statfs" => &mut fs.sb.license_di,
            _ => return Err(FsError::Fatal(format!("{} no existe en el formato heredado", name))),
        };
        *slot = ip.di.num;
        return fs.write_sb();
    }
    let mut master = fs.inode_read(fs.md.master_dir)?;
    let dt = fs.format.dirent_type(fs.format.file_type(&ip.di));
    // una entrada vieja con el mismo nombre apunta al inodo dañado
    if fs.dir_search(&master, name.as_bytes())?.is_some() {
        fs.dirent_del(&mut master, name.as_bytes())?;
    }
    fs.dir_add(&mut master, name.as_bytes(), ip.di.num, dt, alloc)?;
    if fs.format.file_type(&ip.di) == FileType::Directory {
        master.di.nlink += 1;
        master.mark_dirty();
    }
    fs.inode_put(master)
}

// -----------------------------------------------------------------------------
// Constructores de inodos de sistema
// -----------------------------------------------------------------------------

pub fn build_master(fs: &mut Gfs2Fs, alloc: &mut dyn BlockAllocator) -> Result<u64> {
    let ip = new_dir(fs, alloc, None, 0o755, DIF_SYSTEM)?;
    let addr = ip.addr;
    fs.sb.master_dir = ip.di.num;
    fs.md.master_dir = addr;
    fs.inode_put(ip)?;
    fs.write_sb()?;
    info!("directorio maestro creado en {} (0x{:x})", addr, addr);
    Ok(addr)
}

pub fn build_root(fs: &mut Gfs2Fs, alloc: &mut dyn BlockAllocator) -> Result<u64> {
    let ip = new_dir(fs, alloc, None, 0o755, 0)?;
    let addr = ip.addr;
    fs.sb.root_dir = ip.di.num;
    fs.md.root_dir = addr;
    fs.inode_put(ip)?;
    fs.write_sb()?;
    info!("directorio raíz creado en {} (0x{:x})", addr, addr);
    Ok(addr)
}

pub fn build_jindex(fs: &mut Gfs2Fs, alloc: &mut dyn BlockAllocator) -> Result<u64> {
    let ip = if fs.format.is_legacy() {
        // en GFS el jindex es un archivo con descriptores de journal
        let mut ip = new_inode(fs, alloc, FileType::Regular, 0o600, DIF_JDATA)?;
        write_new_file_data(fs, &mut ip, &[], alloc)?;
        ip
    } else {
        let master = fs.sb.master_dir;
        new_dir(fs, alloc, Some(master), 0o700, DIF_SYSTEM)?
    };
    let addr = ip.addr;
    register_system(fs, "jindex", &ip, alloc)?;
    fs.md.jindex = addr;
    fs.inode_put(ip)?;
    Ok(addr)
}

pub fn build_journal(fs: &mut Gfs2Fs, j: usize, blocks: u32, alloc: &mut dyn BlockAllocator) -> Result<u64> {
    let mut ip = new_inode(fs, alloc, FileType::Regular, 0o600, DIF_SYSTEM)?;
    let data = vec![0u8; blocks as usize * fs.bsize as usize];
    write_new_file_data(fs, &mut ip, &data, alloc)?;
    let addr = ip.addr;
    let num = ip.di.num;
    fs.inode_put(ip)?;

    let mut jindex = fs.inode_read(fs.md.jindex)?;
    let name = format!("journal{}", j);
    if fs.dir_search(&jindex, name.as_bytes())?.is_some() {
        fs.dirent_del(&mut jindex, name.as_bytes())?;
    }
    let dt = fs.format.dirent_type(FileType::Regular);
    fs.dir_add(&mut jindex, name.as_bytes(), num, dt, alloc)?;
    fs.inode_put(jindex)?;

    if fs.md.journals.len() <= j {
        fs.md.journals.resize(j + 1, 0);
    }
    fs.md.journals[j] = addr;
    Ok(addr)
}

pub fn build_per_node(fs: &mut Gfs2Fs, alloc: &mut dyn BlockAllocator) -> Result<u64> {
    let master = fs.sb.master_dir;
    let mut ip = new_dir(fs, alloc, Some(master), 0o700, DIF_SYSTEM)?;
    let journals = fs.md.journals.len().max(1);
    let dt = fs.format.dirent_type(FileType::Regular);
    for j in 0..journals {
        for (prefix, size) in [("inum_range", 16usize), ("statfs_change", 24), ("quota_change", 0)] {
            let mut f = new_inode(fs, alloc, FileType::Regular, 0o600, DIF_SYSTEM)?;
            write_new_file_data(fs, &mut f, &vec![0u8; size], alloc)?;
            let name = format!("{}{}", prefix, j);
            fs.dir_add(&mut ip, name.as_bytes(), f.di.num, dt, alloc)?;
            fs.inode_put(f)?;
        }
    }
    let addr = ip.addr;
    register_system(fs, "per_node", &ip, alloc)?;
    fs.md.per_node = addr;
    fs.inode_put(ip)?;
    Ok(addr)
}

fn build_small_file(
    fs: &mut Gfs2Fs,
    name: &str,
    size: usize,
    flags: u32,
    alloc: &mut dyn BlockAllocator,
) -> Result<Inode> {
    let mut ip = new_inode(fs, alloc, FileType::Regular, 0o600, flags)?;
    write_new_file_data(fs, &mut ip, &vec![0u8; size], alloc)?;
    register_system(fs, name, &ip, alloc)?;
    Ok(ip)
}

pub fn build_inum(fs: &mut Gfs2Fs, alloc: &mut dyn BlockAllocator) -> Result<u64> {
    let ip = build_small_file(fs, "inum", 8, DIF_SYSTEM, alloc)?;
    let addr = ip.addr;
    fs.md.inum = addr;
    fs.inode_put(ip)?;
    Ok(addr)
}

pub fn build_statfs(fs: &mut Gfs2Fs, alloc: &mut dyn BlockAllocator) -> Result<u64> {
    let ip = build_small_file(fs, "statfs", 24, DIF_SYSTEM, alloc)?;
    let addr = ip.addr;
    fs.md.statfs = addr;
    fs.inode_put(ip)?;
    Ok(addr)
}

pub fn build_quota(fs: &mut Gfs2Fs, alloc: &mut dyn BlockAllocator) -> Result<u64> {
    let ip = build_small_file(fs, "quota", 0, DIF_SYSTEM, alloc)?;
    let addr = ip.addr;
    fs.md.quota = addr;
    fs.inode_put(ip)?;
    Ok(addr)
}

/// Reescribe el rindex a partir de los grupos en memoria.
pub fn build_rindex(fs: &mut Gfs2Fs, alloc: &mut dyn BlockAllocator) -> Result<u64> {
    let mut data = vec![0u8; fs.rgrps.len() * RINDEX_SIZE];
    for (chunk, rg) in data.chunks_exact_mut(RINDEX_SIZE).zip(fs.rgrps.iter()) {
        rg.ri.encode(chunk);
    }
    let flags = if fs.format.is_legacy() { DIF_JDATA } else { DIF_SYSTEM | DIF_JDATA };
    let mut ip = new_inode(fs, alloc, FileType::Regular, 0o600, flags)?;
    write_new_file_data(fs, &mut ip, &data, alloc)?;
    register_system(fs, "rindex", &ip, alloc)?;
    let addr = ip.addr;
    fs.md.rindex = addr;
    fs.inode_put(ip)?;
    Ok(addr)
}

// -----------------------------------------------------------------------------
// Imagen completa
// -----------------------------------------------------------------------------

/// Geometría de un grupo de `size` bloques que empieza en `addr`.
fn rgrp_layout(bsize: u32, addr: u64, size: u32) -> Option<Rindex> {
    let first = bsize - RGRP_SIZE as u32;
    let rest = bsize - META_HEADER_SIZE as u32;
    let mut length = 1u32;
    while length < size {
        let data = (size - length) & !(NBBY - 1);
        let bitbytes = data / NBBY;
        if bitbytes <= first + (length - 1) * rest {
            return (data > 0).then_some(Rindex {
                addr,
                length,
                data0: addr + length as u64,
                data,
                bitbytes,
            });
        }
        length += 1;
    }
    None
}

/// Crea un sistema de archivos nuevo sobre `dev`.
pub fn mkfs(dev: Box<dyn BlockDevice>, opts: &MkfsOptions) -> Result<Gfs2Fs> {
    let bsize = opts.block_size;
    if !bsize.is_power_of_two() || !(512..=65536).contains(&bsize) {
        return Err(FsError::BadSuperblock(format!("tamaño de bloque inválido: {}", bsize)));
    }
    let format: &'static dyn Format = if opts.legacy { &GFS1 } else { &GFS2 };
    let sb = Superblock {
        header: MetaHeader::new(METATYPE_SB, FORMAT_SB),
        fs_format: format.fs_format(),
        multihost_format: if opts.legacy { GFS_FORMAT_MULTI } else { GFS2_FORMAT_MULTI },
        bsize,
        bsize_shift: bsize.trailing_zeros(),
        lockproto: opts.lockproto.clone(),
        locktable: opts.locktable.clone(),
        ..Default::default()
    };
    let cache = BufferCache::new(dev, bsize, false);
    let total = cache.device_blocks();
    let mut fs = Gfs2Fs::new(format, sb, cache);

    // 1. Grupos de recursos
    let mut addr = fs.sb_addr + 1;
    while addr < total {
        let size = (opts.rgrp_blocks as u64).min(total - addr) as u32;
        let Some(ri) = rgrp_layout(bsize, addr, size) else {
            break;
        };
        let mut rgrp = Rgrp::new(ri);
        rgrp.compute_bitstructs(bsize)?;
        for x in 0..ri.length as u64 {
            let mut bh = fs.cache.bget(ri.addr + x);
            if x == 0 {
                rgrp.rg = RgrpHeader {
                    header: MetaHeader::new(METATYPE_RG, FORMAT_RG),
                    free: ri.data,
                    ..Default::default()
                };
                rgrp.rg.encode(&mut bh.data);
            } else {
                MetaHeader::new(METATYPE_RB, FORMAT_RB).encode(&mut bh.data);
            }
            rgrp.bh.push(bh);
        }
        fs.rgrps.insert(rgrp)?;
        addr += size as u64;
    }
    if fs.rgrps.is_empty() {
        return Err(FsError::NoSpace);
    }
    fs.fssize = fs.rgrps.fs_end();

    // 2. Inodos de sistema
    let alloc = &mut BitmapAllocator;
    if !opts.legacy {
        build_master(&mut fs, alloc)?;
    }
    build_root(&mut fs, alloc)?;
    build_jindex(&mut fs, alloc)?;
    if !opts.legacy {
        for j in 0..opts.journals as usize {
            build_journal(&mut fs, j, opts.journal_blocks, alloc)?;
        }
        build_per_node(&mut fs, alloc)?;
        build_inum(&mut fs, alloc)?;
    }
    build_statfs(&mut fs, alloc)?;
    build_rindex(&mut fs, alloc)?;
    build_quota(&mut fs, alloc)?;

    // 3. A disco
    fs.write_sb()?;
    fs.flush()?;
    info!(
        "{}: {} grupos de recursos, {} bloques de {} bytes",
        format.name(),
        fs.rgrps.len(),
        fs.fssize,
        bsize
    );
    Ok(fs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rgrp_layout_grows_bitmap_when_needed() {
        let ri = rgrp_layout(1024, 65, 1024).unwrap();
        assert_eq!(ri.length, 1);
        assert_eq!(ri.data, 1020);
        assert_eq!(ri.bitbytes, 255);

        // 896 bytes en el primer bloque cubren 3584 bloques
        let ri = rgrp_layout(1024, 65, 8000).unwrap();
        assert_eq!(ri.length, 3);
        assert_eq!(ri.data0, 68);
        assert!(ri.bitbytes <= 896 + 2 * 1000);
    }

    #[test]
    fn test_tiny_rgrp_is_rejected() {
        assert!(rgrp_layout(1024, 65, 1).is_none());
    }
}
