/*Tipos compartidos por todos los pasos del fsck:
opciones de la corrida, el reporte donde se acumulan los problemas,
el conteo de bloques por inodo y los códigos de salida */

/// Cómo se contestan las preguntas de reparación.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AnswerMode {
    #[default]
    Ask,
    Yes,
    No,
}

#[derive(Debug, Clone, Default)]
pub struct FsckOptions {
    pub answer: AnswerMode,
    pub read_only: bool,
}

impl FsckOptions {
    /// -y: arreglar todo sin preguntar.
    pub fn yes() -> Self {
        Self { answer: AnswerMode::Yes, read_only: false }
    }

    /// -n: solo revisar; el dispositivo se abre en solo lectura.
    pub fn no() -> Self {
        Self { answer: AnswerMode::No, read_only: true }
    }
}

// Códigos de salida de fsck
pub const EXIT_OK: i32 = 0;
pub const EXIT_NONDESTRUCT: i32 = 1;
pub const EXIT_UNCORRECTED: i32 = 4;
pub const EXIT_ERROR: i32 = 8;
pub const EXIT_USAGE: i32 = 16;
pub const EXIT_CANCELED: i32 = 32;

/// Resultado de un paso.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassStatus {
    Done,
    Aborted,
}

/// Bloques encontrados al recorrer un inodo (sin contar el dinode).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockCount {
    pub indir: u64,
    pub data: u64,
    pub ea: u64,
}

impl BlockCount {
    pub fn total(&self) -> u64 {
        self.indir + self.data + self.ea
    }
}

#[derive(Debug)]
pub struct FsckReport {
    pub blocks_ok: bool,
    pub inodes_ok: bool,
    pub dirs_ok: bool,
    pub errors: Vec<String>,
    /// Reparaciones aceptadas.
    pub fixed: u32,
    /// Reparaciones rechazadas (o no ofrecidas por -n).
    pub declined: u32,
    pub aborted: bool,
}

impl FsckReport {
    pub fn new() -> Self {
        Self {
            blocks_ok: true,
            inodes_ok: true,
            dirs_ok: true,
            errors: Vec::new(),
            fixed: 0,
            declined: 0,
            aborted: false,
        }
    }

    pub fn block_error(&mut self, msg: String) {
        self.blocks_ok = false;
        self.errors.push(msg);
    }

    pub fn inode_error(&mut self, msg: String) {
        self.inodes_ok = false;
        self.errors.push(msg);
    }

    pub fn dir_error(&mut self, msg: String) {
        self.dirs_ok = false;
        self.errors.push(msg);
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn exit_code(&self) -> i32 {
        if self.aborted {
            EXIT_CANCELED
        } else if self.errors.is_empty() {
            EXIT_OK
        } else if self.declined > 0 {
            EXIT_UNCORRECTED
        } else {
            EXIT_NONDESTRUCT
        }
    }
}

impl Default for FsckReport {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_follows_outcome() {
        let mut rep = FsckReport::new();
        assert_eq!(rep.exit_code(), EXIT_OK);

        rep.inode_error("inodo 100: conteo de bloques".into());
        rep.fixed += 1;
        assert_eq!(rep.exit_code(), EXIT_NONDESTRUCT);
        assert!(!rep.inodes_ok);
        assert!(rep.blocks_ok);

        rep.declined += 1;
        assert_eq!(rep.exit_code(), EXIT_UNCORRECTED);

        rep.aborted = true;
        assert_eq!(rep.exit_code(), EXIT_CANCELED);
    }
}
