/* Inodos en memoria: el dinode decodificado más el buffer de su bloque.
También el mapeo bloque lógico -> bloque físico a través del árbol de
punteros indirectos, y lectura/escritura del contenido. */

use log::warn;

use crate::buf::Buffer;
use crate::error::{FsError, Result};
use crate::format::FileType;
use crate::fs::Gfs2Fs;
use crate::ondisk::*;

#[derive(Debug, Clone)]
pub struct Inode {
    pub addr: u64,
    pub di: Dinode,
    pub bh: Buffer,
}

impl Inode {
    pub fn is_exhash(&self) -> bool {
        self.di.flags & DIF_EXHASH != 0
    }

    pub fn is_jdata(&self) -> bool {
        self.di.flags & DIF_JDATA != 0
    }

    pub fn is_stuffed(&self) -> bool {
        self.di.height == 0
    }

    /// Marca el inodo para que inode_put() lo escriba.
    pub fn mark_dirty(&mut self) {
        self.bh.mark_modified();
    }

    pub fn is_dirty(&self) -> bool {
        self.bh.is_modified()
    }
}

impl Gfs2Fs {
    pub fn inode_read(&mut self, blk: u64) -> Result<Inode> {
        let bh = self.cache.bread(blk)?;
        Ok(self.inode_get(bh))
    }

    pub fn inode_get(&self, bh: Buffer) -> Inode {
        Inode { addr: bh.blocknr, di: self.format.decode_dinode(&bh.data), bh }
    }

    /// Devuelve el inodo a la caché, codificando el dinode si cambió.
    pub fn inode_put(&mut self, mut ip: Inode) -> Result<()> {
        if ip.bh.is_modified() {
            self.format.encode_dinode(&ip.di, &mut ip.bh.data);
        }
        self.cache.brelse(ip.bh)
    }

    /// Como inode_put pero el llamador se queda con el inodo.
    pub fn inode_sync(&mut self, ip: &mut Inode) -> Result<()> {
        if ip.bh.is_modified() {
            self.format.encode_dinode(&ip.di, &mut ip.bh.data);
            self.cache.brelse(ip.bh.clone())?;
            ip.bh.clear_modified();
        }
        Ok(())
    }

    pub fn file_type(&self, ip: &Inode) -> FileType {
        self.format.file_type(&ip.di)
    }

    pub fn is_dir(&self, ip: &Inode) -> bool {
        self.file_type(ip) == FileType::Directory
    }

    /// Punteros por bloque en el dinode.
    pub fn diptrs(&self) -> u64 {
        (self.bsize as u64 - DINODE_SIZE as u64) / 8
    }

    /// Punteros por bloque indirecto.
    pub fn inptrs(&self) -> u64 {
        (self.bsize as u64 - self.format.indirect_header_len() as u64) / 8
    }

    pub fn jbsize(&self) -> u64 {
        self.bsize as u64 - META_HEADER_SIZE as u64
    }

    /// Altura mínima para direccionar `nblocks` bloques.
    pub fn calc_tree_height(&self, nblocks: u64) -> u16 {
        let mut height = 1u16;
        let mut capacity = self.diptrs();
        while capacity < nblocks {
            capacity = capacity.saturating_mul(self.inptrs());
            height += 1;
        }
        height
    }

    /// (offset de la carga útil, bytes útiles) por bloque de datos.
    fn payload(&self, ip: &Inode) -> (usize, u64) {
        if ip.is_jdata() || self.is_dir(ip) {
            (META_HEADER_SIZE, self.jbsize())
        } else {
            (0, self.bsize as u64)
        }
    }

    /// Índices por nivel para el bloque lógico `lblock`.
    fn metapath(&self, height: u16, mut lblock: u64) -> Option<Vec<u64>> {
        let mut mp = vec![0u64; height as usize];
        for level in (1..height as usize).rev() {
            mp[level] = lblock % self.inptrs();
            lblock /= self.inptrs();
        }
        if height == 0 || lblock >= self.diptrs() {
            return None;
        }
        mp[0] = lblock;
        Some(mp)
    }

    /// Bloque físico del bloque lógico `lblock`; None si es un hueco.
    pub fn block_map(&mut self, ip: &Inode, lblock: u64) -> Result<Option<u64>> {
        let Some(mp) = self.metapath(ip.di.height, lblock) else {
            return Ok(None);
        };
        let mut ptr = ip.bh.ptr(DINODE_SIZE + mp[0] as usize * 8);
        for &idx in &mp[1..] {
            if ptr == 0 {
                return Ok(None);
            }
            if !self.check_range(ptr) {
                warn!("inodo {}: puntero fuera de rango {}", ip.addr, ptr);
                return Err(FsError::OutOfRange { block: ptr });
            }
            let ind = self.cache.bread(ptr)?;
            ptr = ind.ptr(self.format.indirect_header_len() + idx as usize * 8);
        }
        if ptr == 0 {
            return Ok(None);
        }
        if !self.check_range(ptr) {
            return Err(FsError::OutOfRange { block: ptr });
        }
        Ok(Some(ptr))
    }

    /// Lee hasta `len` bytes desde `offset` (los huecos se leen como ceros).
    pub fn readi(&mut self, ip: &Inode, offset: u64, len: usize) -> Result<Vec<u8>> {
        let end = (offset + len as u64).min(ip.di.size);
        if offset >= end {
            return Ok(Vec::new());
        }
        let mut out = vec![0u8; (end - offset) as usize];

        if ip.is_stuffed() {
            let from = DINODE_SIZE + offset as usize;
            let to = (DINODE_SIZE + end as usize).min(ip.bh.data.len());
            if from < to {
                out[..to - from].copy_from_slice(&ip.bh.data[from..to]);
            }
            return Ok(out);
        }

        let (head, per_block) = self.payload(ip);
        let mut pos = offset;
        while pos < end {
            let lblock = pos / per_block;
            let in_block = (pos % per_block) as usize;
            let n = ((per_block as usize - in_block) as u64).min(end - pos) as usize;
            if let Some(pblk) = self.block_map(ip, lblock)? {
                let bh = self.cache.bread(pblk)?;
                let dst = (pos - offset) as usize;
                out[dst..dst + n].copy_from_slice(&bh.data[head + in_block..head + in_block + n]);
            }
            pos += n as u64;
        }
        Ok(out)
    }

    /// Sobrescribe contenido ya asignado. No asigna bloques nuevos.
    pub fn writei(&mut self, ip: &mut Inode, offset: u64, data: &[u8]) -> Result<()> {
        if ip.is_stuffed() {
            let from = DINODE_SIZE + offset as usize;
            let to = from + data.len();
            if to > ip.bh.data.len() {
                return Err(FsError::Fatal(format!(
                    "inodo {}: escritura fuera del bloque del dinode",
                    ip.addr
                )));
            }
            ip.bh.data[from..to].copy_from_slice(data);
            ip.mark_dirty();
            return Ok(());
        }

        let (head, per_block) = self.payload(ip);
        let mut pos = offset;
        let end = offset + data.len() as u64;
        while pos < end {
            let lblock = pos / per_block;
            let in_block = (pos % per_block) as usize;
            let n = ((per_block as usize - in_block) as u64).min(end - pos) as usize;
            let pblk = self.block_map(ip, lblock)?.ok_or_else(|| {
                FsError::Fatal(format!("inodo {}: bloque lógico {} sin asignar", ip.addr, lblock))
            })?;
            let src = (pos - offset) as usize;
            self.cache.modify(pblk, |d| {
                d[head + in_block..head + in_block + n].copy_from_slice(&data[src..src + n])
            })?;
            pos += n as u64;
        }
        Ok(())
    }
}
