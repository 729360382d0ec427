/* Caché de bloques del dispositivo. bread() entrega una copia del bloque;
quien la modifica la devuelve con brelse() y queda pendiente de escritura
hasta flush() o hasta que el bloque sale de la caché por LRU. */

use std::collections::BTreeMap;

use log::{debug, error};

use crate::error::{FsError, Result};
use crate::fsck::fsck_backend::BlockDevice;
use crate::ondisk::{read_be64, write_be64};

pub const DEFAULT_CACHE_BLOCKS: usize = 256;

/// Copia en memoria de un bloque del dispositivo.
#[derive(Debug, Clone)]
pub struct Buffer {
    pub blocknr: u64,
    pub data: Vec<u8>,
    modified: bool,
}

impl Buffer {
    pub fn new(blocknr: u64, data: Vec<u8>) -> Self {
        Self { blocknr, data, modified: false }
    }

    pub fn mark_modified(&mut self) {
        self.modified = true;
    }

    pub(crate) fn clear_modified(&mut self) {
        self.modified = false;
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    pub fn ptr(&self, off: usize) -> u64 {
        read_be64(&self.data, off)
    }

    pub fn set_ptr(&mut self, off: usize, val: u64) {
        write_be64(&mut self.data, off, val);
        self.modified = true;
    }
}

struct CachedBlock {
    data: Vec<u8>,
    dirty: bool,
    last_access: u64,
}

pub struct BufferCache {
    dev: Box<dyn BlockDevice>,
    bsize: u32,
    read_only: bool,
    cache: BTreeMap<u64, CachedBlock>,
    max_entries: usize,
    access_counter: u64,
    /// Bloques escritos al dispositivo durante la corrida.
    pub writes: u64,
}

impl BufferCache {
    pub fn new(dev: Box<dyn BlockDevice>, bsize: u32, read_only: bool) -> Self {
        Self {
            dev,
            bsize,
            read_only,
            cache: BTreeMap::new(),
            max_entries: DEFAULT_CACHE_BLOCKS,
            access_counter: 0,
            writes: 0,
        }
    }

    pub fn with_capacity(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries.max(1);
        self
    }

    pub fn bsize(&self) -> u32 {
        self.bsize
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Cantidad de bloques que caben en el dispositivo.
    pub fn device_blocks(&self) -> u64 {
        self.dev.len() / self.bsize as u64
    }

    fn touch(&mut self) -> u64 {
        self.access_counter += 1;
        self.access_counter
    }

    /// Lee un bloque (de la caché si está).
    pub fn bread(&mut self, blocknr: u64) -> Result<Buffer> {
        let stamp = self.touch();
        if let Some(cached) = self.cache.get_mut(&blocknr) {
            cached.last_access = stamp;
            return Ok(Buffer::new(blocknr, cached.data.clone()));
        }

        let mut data = vec![0u8; self.bsize as usize];
        self.dev
            .read_at(blocknr * self.bsize as u64, &mut data)
            .map_err(|e| {
                error!("no se pudo leer el bloque {} (0x{:x}): {}", blocknr, blocknr, e);
                FsError::Io(e)
            })?;

        self.make_room()?;
        self.cache.insert(
            blocknr,
            CachedBlock { data: data.clone(), dirty: false, last_access: stamp },
        );
        Ok(Buffer::new(blocknr, data))
    }

    /// Buffer en ceros para un bloque recién asignado, sin leer el disco.
    pub fn bget(&mut self, blocknr: u64) -> Buffer {
        let mut buf = Buffer::new(blocknr, vec![0u8; self.bsize as usize]);
        buf.mark_modified();
        buf
    }

    /// Devuelve un buffer a la caché; si cambió queda sucio.
    pub fn brelse(&mut self, buf: Buffer) -> Result<()> {
        if !buf.is_modified() {
            return Ok(());
        }
        if self.read_only {
            return Err(FsError::ReadOnly);
        }
        let stamp = self.touch();
        if !self.cache.contains_key(&buf.blocknr) {
            self.make_room()?;
        }
        self.cache.insert(
            buf.blocknr,
            CachedBlock { data: buf.data, dirty: true, last_access: stamp },
        );
        Ok(())
    }

    /// Escribe el buffer de inmediato (y actualiza la copia en caché).
    pub fn bwrite(&mut self, buf: &Buffer) -> Result<()> {
        if self.read_only {
            return Err(FsError::ReadOnly);
        }
        self.write_block(buf.blocknr, &buf.data)?;
        if let Some(cached) = self.cache.get_mut(&buf.blocknr) {
            cached.data.copy_from_slice(&buf.data);
            cached.dirty = false;
        }
        Ok(())
    }

    /// Lee, modifica con `f` y deja el bloque sucio en la caché.
    pub fn modify<F>(&mut self, blocknr: u64, f: F) -> Result<()>
    where
        F: FnOnce(&mut [u8]),
    {
        let mut buf = self.bread(blocknr)?;
        f(&mut buf.data);
        buf.mark_modified();
        self.brelse(buf)
    }

    fn write_block(&mut self, blocknr: u64, data: &[u8]) -> Result<()> {
        self.dev
            .write_at(blocknr * self.bsize as u64, data)
            .map_err(|e| {
                error!("falló la escritura del bloque {} (0x{:x}): {}", blocknr, blocknr, e);
                FsError::Io(e)
            })?;
        self.writes += 1;
        Ok(())
    }

    fn make_room(&mut self) -> Result<()> {
        while self.cache.len() >= self.max_entries {
            self.evict_lru()?;
        }
        Ok(())
    }

    fn evict_lru(&mut self) -> Result<()> {
        let victim = self
            .cache
            .iter()
            .min_by_key(|(_, c)| c.last_access)
            .map(|(&blk, _)| blk);
        let Some(blk) = victim else {
            return Ok(());
        };
        if let Some(cached) = self.cache.remove(&blk) {
            if cached.dirty {
                debug!("desalojando bloque sucio {}", blk);
                self.write_block(blk, &cached.data)?;
            }
        }
        Ok(())
    }

    /// Escribe todos los bloques sucios y sincroniza el dispositivo.
    pub fn flush(&mut self) -> Result<()> {
        let dirty: Vec<u64> = self
            .cache
            .iter()
            .filter(|(_, c)| c.dirty)
            .map(|(&blk, _)| blk)
            .collect();
        if dirty.is_empty() {
            return Ok(());
        }
        if self.read_only {
            return Err(FsError::ReadOnly);
        }
        for blk in dirty {
            let data = match self.cache.get(&blk) {
                Some(c) => c.data.clone(),
                None => continue,
            };
            self.write_block(blk, &data)?;
            if let Some(c) = self.cache.get_mut(&blk) {
                c.dirty = false;
            }
        }
        self.dev.sync()?;
        Ok(())
    }

    /// Escribe bytes en un offset absoluto (usado para el superbloque).
    pub fn write_raw(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(FsError::ReadOnly);
        }
        self.dev.write_at(offset, data)?;
        let blk = offset / self.bsize as u64;
        self.cache.remove(&blk);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsck::mock::MemDevice;

    #[test]
    fn test_released_buffer_is_written_on_flush() {
        let dev = MemDevice::new(16 * 1024);
        let mut cache = BufferCache::new(Box::new(dev.clone()), 1024, false);

        let mut buf = cache.bread(3).unwrap();
        buf.data[10] = 0xab;
        buf.mark_modified();
        cache.brelse(buf).unwrap();

        // todavía no llegó al dispositivo
        assert_eq!(dev.snapshot()[3 * 1024 + 10], 0);
        assert_eq!(cache.bread(3).unwrap().data[10], 0xab);

        cache.flush().unwrap();
        assert_eq!(dev.snapshot()[3 * 1024 + 10], 0xab);
    }

    #[test]
    fn test_eviction_writes_dirty_victim() {
        let dev = MemDevice::new(16 * 1024);
        let mut cache = BufferCache::new(Box::new(dev.clone()), 1024, false).with_capacity(2);

        cache.modify(1, |d| d[0] = 1).unwrap();
        cache.bread(2).unwrap();
        cache.bread(4).unwrap();

        assert_eq!(dev.snapshot()[1024], 1);
    }

    #[test]
    fn test_read_only_cache_refuses_writes() {
        let dev = MemDevice::new(8 * 1024);
        let mut cache = BufferCache::new(Box::new(dev), 1024, true);
        let res = cache.modify(1, |d| d[0] = 1);
        assert!(matches!(res, Err(FsError::ReadOnly)));
    }

    #[test]
    fn test_failed_write_is_reported() {
        let dev = MemDevice::new(8 * 1024);
        let mut cache = BufferCache::new(Box::new(dev.clone()), 1024, false);
        cache.modify(1, |d| d[0] = 1).unwrap();
        dev.set_fail_writes(true);
        assert!(matches!(cache.flush(), Err(FsError::Io(_))));
    }
}
