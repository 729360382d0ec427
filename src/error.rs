/* Errores de la biblioteca. Todo lo que llega aquí es fatal para la corrida:
los problemas de un bloque o de un inodo se manejan dentro de cada paso y
nunca se convierten en FsError. */

use thiserror::Error;

use crate::dir::DirError;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("error de E/S: {0}")]
    Io(#[from] std::io::Error),
    #[error("bloque {block} fuera del sistema de archivos")]
    OutOfRange { block: u64 },
    #[error("estado de bitmap inválido: {0}")]
    InvalidState(u8),
    #[error("superbloque inválido: {0}")]
    BadSuperblock(String),
    #[error("índice de grupos de recursos inválido: {0}")]
    BadRindex(String),
    #[error("el bloque {block} no tiene el tipo de metadatos esperado ({expected})")]
    BadMeta { block: u64, expected: u32 },
    #[error("no quedan bloques libres en los grupos de recursos")]
    NoSpace,
    #[error("el dispositivo se abrió en solo lectura")]
    ReadOnly,
    #[error("directorio: {0}")]
    Dir(#[from] DirError),
    #[error("fsck cancelado por el operador")]
    Aborted,
    #[error("{0}")]
    Fatal(String),
}

pub type Result<T> = std::result::Result<T, FsError>;
