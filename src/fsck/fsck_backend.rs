/*Define la interfaz con el dispositivo de bloques.
El fsck y mkfs leen y escriben a través de este trait, así se puede usar:
un archivo o dispositivo real (FileDevice), una imagen en memoria (MemDevice, en mock.rs)
para las pruebas.
*/

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;

pub trait BlockDevice {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()>;
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()>;
    /// Tamaño del dispositivo en bytes.
    fn len(&self) -> u64;
    fn sync(&mut self) -> io::Result<()>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct FileDevice {
    file: File,
    size: u64,
}

impl FileDevice {
    pub fn open<P: AsRef<Path>>(path: P, read_only: bool) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)?;
        let size = file.metadata()?.len();
        Ok(Self { file, size })
    }

    /// Crea (o trunca) un archivo de imagen de `size` bytes.
    pub fn create<P: AsRef<Path>>(path: P, size: u64) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(size)?;
        Ok(Self { file, size })
    }
}

impl BlockDevice for FileDevice {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.file.read_exact_at(buf, offset)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        self.file.write_all_at(buf, offset)
    }

    fn len(&self) -> u64 {
        self.size
    }

    fn sync(&mut self) -> io::Result<()> {
        self.file.sync_all()
    }
}
