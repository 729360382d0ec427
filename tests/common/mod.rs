#![allow(dead_code)]

use gfs2_fsck::fs::BlockAllocator;
use gfs2_fsck::mkfs::{new_dir, new_inode, write_new_file_data};
use gfs2_fsck::ondisk::{write_be64, DINODE_SIZE};
use gfs2_fsck::{mkfs, BitmapAllocator, FileType, Format, Gfs2Fs, MemDevice, MkfsOptions};

pub const IMAGE_SIZE: u64 = 2 * 1024 * 1024;

pub fn small_opts() -> MkfsOptions {
    MkfsOptions {
        block_size: 1024,
        rgrp_blocks: 512,
        journal_blocks: 16,
        ..Default::default()
    }
}

/// Imagen nueva en memoria. El dispositivo devuelto comparte los datos con
/// el que quedó dentro del sistema de archivos.
pub fn small_image() -> (MemDevice, Gfs2Fs) {
    image_with(small_opts())
}

pub fn image_with(opts: MkfsOptions) -> (MemDevice, Gfs2Fs) {
    let dev = MemDevice::new(IMAGE_SIZE);
    let fs = mkfs(Box::new(dev.clone()), &opts).unwrap();
    (dev, fs)
}

pub fn reopen(dev: &MemDevice) -> Gfs2Fs {
    Gfs2Fs::open(Box::new(dev.clone()), false).unwrap()
}

/// Archivo regular sin ninguna entrada que lo nombre.
pub fn orphan_file(fs: &mut Gfs2Fs, data: &[u8]) -> u64 {
    let mut alloc = BitmapAllocator;
    let mut ip = new_inode(fs, &mut alloc, FileType::Regular, 0o644, 0).unwrap();
    write_new_file_data(fs, &mut ip, data, &mut alloc).unwrap();
    let addr = ip.addr;
    fs.inode_put(ip).unwrap();
    addr
}

pub fn link(fs: &mut Gfs2Fs, parent: u64, name: &str, child: u64) {
    let mut alloc = BitmapAllocator;
    let cip = fs.inode_read(child).unwrap();
    let ft = fs.file_type(&cip);
    let dt = fs.format.dirent_type(ft);
    let mut dip = fs.inode_read(parent).unwrap();
    fs.dir_add(&mut dip, name.as_bytes(), cip.di.num, dt, &mut alloc).unwrap();
    if ft == FileType::Directory {
        dip.di.nlink += 1;
        dip.mark_dirty();
    }
    fs.inode_put(dip).unwrap();
}

pub fn add_file(fs: &mut Gfs2Fs, parent: u64, name: &str, data: &[u8]) -> u64 {
    let addr = orphan_file(fs, data);
    link(fs, parent, name, addr);
    addr
}

/// Directorio cuyo ".." apunta a `dotdot`, sin entrada en ningún padre.
pub fn loose_dir(fs: &mut Gfs2Fs, dotdot: u64) -> u64 {
    let mut alloc = BitmapAllocator;
    let parent = fs.inode_read(dotdot).unwrap().di.num;
    let ip = new_dir(fs, &mut alloc, Some(parent), 0o755, 0).unwrap();
    let addr = ip.addr;
    fs.inode_put(ip).unwrap();
    addr
}

pub fn add_dir(fs: &mut Gfs2Fs, parent: u64, name: &str) -> u64 {
    let addr = loose_dir(fs, parent);
    link(fs, parent, name, addr);
    addr
}

/// Bloque nuevo marcado como metadato en el bitmap.
pub fn alloc_meta(fs: &mut Gfs2Fs) -> u64 {
    let state = fs.format.meta_state();
    BitmapAllocator.alloc(fs, state).unwrap()
}

/// Reescribe los punteros directos del dinode.
pub fn set_pointers(fs: &mut Gfs2Fs, addr: u64, ptrs: &[u64]) {
    let mut ip = fs.inode_read(addr).unwrap();
    ip.bh.data[DINODE_SIZE..].fill(0);
    for (i, &p) in ptrs.iter().enumerate() {
        write_be64(&mut ip.bh.data, DINODE_SIZE + i * 8, p);
    }
    ip.mark_dirty();
    fs.inode_put(ip).unwrap();
}

pub fn pointers_of(fs: &mut Gfs2Fs, addr: u64, n: usize) -> Vec<u64> {
    let ip = fs.inode_read(addr).unwrap();
    (0..n)
        .map(|i| gfs2_fsck::ondisk::read_be64(&ip.bh.data, DINODE_SIZE + i * 8))
        .collect()
}
