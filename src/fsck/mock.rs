/*Dispositivo en memoria para las pruebas. Los clones comparten el mismo
almacenamiento, así una prueba puede quedarse con una copia, correr el fsck
sobre otra y volver a montar la imagen para revisar el resultado.*/

use std::cell::RefCell;
use std::io;
use std::rc::Rc;

use super::fsck_backend::BlockDevice;

#[derive(Clone)]
pub struct MemDevice {
    data: Rc<RefCell<Vec<u8>>>,
    fail_writes: Rc<RefCell<bool>>,
}

impl MemDevice {
    pub fn new(size: u64) -> Self {
        Self {
            data: Rc::new(RefCell::new(vec![0u8; size as usize])),
            fail_writes: Rc::new(RefCell::new(false)),
        }
    }

    /// Hace que toda escritura posterior falle (simula un disco roto).
    pub fn set_fail_writes(&self, fail: bool) {
        *self.fail_writes.borrow_mut() = fail;
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.data.borrow().clone()
    }
}

fn bounds(len: usize, offset: u64, n: usize) -> io::Result<std::ops::Range<usize>> {
    let start = offset as usize;
    match start.checked_add(n) {
        Some(end) if end <= len => Ok(start..end),
        _ => Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("acceso fuera del dispositivo: offset {} + {}", offset, n),
        )),
    }
}

impl BlockDevice for MemDevice {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let data = self.data.borrow();
        let range = bounds(data.len(), offset, buf.len())?;
        buf.copy_from_slice(&data[range]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        if *self.fail_writes.borrow() {
            return Err(io::Error::new(io::ErrorKind::Other, "escritura rechazada"));
        }
        let mut data = self.data.borrow_mut();
        let range = bounds(data.len(), offset, buf.len())?;
        data[range].copy_from_slice(buf);
        Ok(())
    }

    fn len(&self) -> u64 {
        self.data.borrow().len() as u64
    }

    fn sync(&mut self) -> io::Result<()> {
        Ok(())
    }
}
