/* Variantes del formato en disco. GFS2 y el GFS heredado comparten casi todos
los registros; lo que cambia (ubicación de los inodos de sistema en el
superbloque, cómo se guarda el tipo de archivo, el encabezado de los bloques
indirectos y el significado de los estados del bitmap) se resuelve aquí, una
sola vez, al montar. */

use std::fmt;

use byteorder::{BigEndian, ByteOrder};

use crate::ondisk::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Directory,
    Regular,
    Symlink,
    BlockDev,
    CharDev,
    Fifo,
    Socket,
    Unknown,
}

impl FileType {
    pub fn from_mode(mode: u32) -> Self {
        match mode & libc::S_IFMT as u32 {
            m if m == libc::S_IFDIR as u32 => FileType::Directory,
            m if m == libc::S_IFREG as u32 => FileType::Regular,
            m if m == libc::S_IFLNK as u32 => FileType::Symlink,
            m if m == libc::S_IFBLK as u32 => FileType::BlockDev,
            m if m == libc::S_IFCHR as u32 => FileType::CharDev,
            m if m == libc::S_IFIFO as u32 => FileType::Fifo,
            m if m == libc::S_IFSOCK as u32 => FileType::Socket,
            _ => FileType::Unknown,
        }
    }

    pub fn mode_bits(self) -> u32 {
        (match self {
            FileType::Directory => libc::S_IFDIR,
            FileType::Regular => libc::S_IFREG,
            FileType::Symlink => libc::S_IFLNK,
            FileType::BlockDev => libc::S_IFBLK,
            FileType::CharDev => libc::S_IFCHR,
            FileType::Fifo => libc::S_IFIFO,
            FileType::Socket => libc::S_IFSOCK,
            FileType::Unknown => 0,
        }) as u32
    }
}

/// Operaciones de codificación que dependen de la variante del formato.
pub trait Format: fmt::Debug + Sync {
    fn name(&self) -> &'static str;

    fn is_legacy(&self) -> bool {
        false
    }

    fn fs_format(&self) -> u32;

    fn decode_sb(&self, buf: &[u8]) -> Superblock;
    fn encode_sb(&self, sb: &Superblock, buf: &mut [u8]);

    fn decode_dinode(&self, buf: &[u8]) -> Dinode {
        Dinode::decode(buf)
    }

    fn encode_dinode(&self, di: &Dinode, buf: &mut [u8]) {
        di.encode(buf)
    }

    /// Bytes que ocupa el encabezado de un bloque indirecto.
    fn indirect_header_len(&self) -> usize;

    fn file_type(&self, di: &Dinode) -> FileType;
    fn set_file_type(&self, di: &mut Dinode, ft: FileType);

    fn dirent_type(&self, ft: FileType) -> u16;
    fn dirent_file_type(&self, de_type: u16) -> FileType;

    /// Estado del bitmap que corresponde a metadatos que no son dinodos.
    fn meta_state(&self) -> BlockState;
    fn jdata_state(&self) -> BlockState;

    /// Estado "metadato libre", si la variante lo tiene.
    fn free_meta_state(&self) -> Option<BlockState> {
        None
    }

    /// true si el estado Dinode del bitmap también cubre otros metadatos.
    fn dinode_state_is_ambiguous(&self) -> bool {
        false
    }
}

fn decode_common_sb(buf: &[u8]) -> Superblock {
    Superblock {
        header: MetaHeader::decode(buf),
        fs_format: BigEndian::read_u32(&buf[24..28]),
        multihost_format: BigEndian::read_u32(&buf[28..32]),
        bsize: BigEndian::read_u32(&buf[36..40]),
        bsize_shift: BigEndian::read_u32(&buf[40..44]),
        root_dir: Inum::decode(&buf[80..96]),
        lockproto: read_cstr(&buf[96..160]),
        locktable: read_cstr(&buf[160..224]),
        ..Default::default()
    }
}

fn encode_common_sb(sb: &Superblock, buf: &mut [u8]) {
    sb.header.encode(buf);
    BigEndian::write_u32(&mut buf[24..28], sb.fs_format);
    BigEndian::write_u32(&mut buf[28..32], sb.multihost_format);
    BigEndian::write_u32(&mut buf[36..40], sb.bsize);
    BigEndian::write_u32(&mut buf[40..44], sb.bsize_shift);
    sb.root_dir.encode(&mut buf[80..96]);
    write_cstr(&mut buf[96..160], &sb.lockproto);
    write_cstr(&mut buf[160..224], &sb.locktable);
}

// -----------------------------------------------------------------------------
// GFS2
// -----------------------------------------------------------------------------

#[derive(Debug)]
pub struct Gfs2Format;

pub static GFS2: Gfs2Format = Gfs2Format;

impl Format for Gfs2Format {
    fn name(&self) -> &'static str {
        "gfs2"
    }

    fn fs_format(&self) -> u32 {
        GFS2_FORMAT_FS
    }

    fn decode_sb(&self, buf: &[u8]) -> Superblock {
        let mut sb = decode_common_sb(buf);
        sb.master_dir = Inum::decode(&buf[48..64]);
        sb
    }

    fn encode_sb(&self, sb: &Superblock, buf: &mut [u8]) {
        encode_common_sb(sb, buf);
        sb.master_dir.encode(&mut buf[48..64]);
    }

    fn indirect_header_len(&self) -> usize {
        META_HEADER_SIZE
    }

    fn file_type(&self, di: &Dinode) -> FileType {
        FileType::from_mode(di.mode)
    }

    fn set_file_type(&self, di: &mut Dinode, ft: FileType) {
        di.mode = (di.mode & !(libc::S_IFMT as u32)) | ft.mode_bits();
    }

    fn dirent_type(&self, ft: FileType) -> u16 {
        (match ft {
            FileType::Directory => libc::DT_DIR,
            FileType::Regular => libc::DT_REG,
            FileType::Symlink => libc::DT_LNK,
            FileType::BlockDev => libc::DT_BLK,
            FileType::CharDev => libc::DT_CHR,
            FileType::Fifo => libc::DT_FIFO,
            FileType::Socket => libc::DT_SOCK,
            FileType::Unknown => libc::DT_UNKNOWN,
        }) as u16
    }

    fn dirent_file_type(&self, de_type: u16) -> FileType {
        match de_type as u8 {
            libc::DT_DIR => FileType::Directory,
            libc::DT_REG => FileType::Regular,
            libc::DT_LNK => FileType::Symlink,
            libc::DT_BLK => FileType::BlockDev,
            libc::DT_CHR => FileType::CharDev,
            libc::DT_FIFO => FileType::Fifo,
            libc::DT_SOCK => FileType::Socket,
            _ => FileType::Unknown,
        }
    }

    fn meta_state(&self) -> BlockState {
        BlockState::Used
    }

    fn jdata_state(&self) -> BlockState {
        BlockState::Used
    }
}

// -----------------------------------------------------------------------------
// GFS heredado
// -----------------------------------------------------------------------------

const GFS_FILE_NON: u16 = 0;
const GFS_FILE_REG: u16 = 1;
const GFS_FILE_DIR: u16 = 2;
const GFS_FILE_LNK: u16 = 5;
const GFS_FILE_BLK: u16 = 7;
const GFS_FILE_CHR: u16 = 8;
const GFS_FILE_FIFO: u16 = 101;
const GFS_FILE_SOCK: u16 = 102;

/// Los bloques indirectos del formato heredado reservan 64 bytes extra.
pub const GFS_INDIRECT_HEADER_SIZE: usize = META_HEADER_SIZE + 64;

#[derive(Debug)]
pub struct Gfs1Format;

pub static GFS1: Gfs1Format = Gfs1Format;

fn gfs1_code(ft: FileType) -> u16 {
    match ft {
        FileType::Directory => GFS_FILE_DIR,
        FileType::Regular => GFS_FILE_REG,
        FileType::Symlink => GFS_FILE_LNK,
        FileType::BlockDev => GFS_FILE_BLK,
        FileType::CharDev => GFS_FILE_CHR,
        FileType::Fifo => GFS_FILE_FIFO,
        FileType::Socket => GFS_FILE_SOCK,
        FileType::Unknown => GFS_FILE_NON,
    }
}

fn gfs1_file_type(code: u16) -> FileType {
    match code {
        GFS_FILE_DIR => FileType::Directory,
        GFS_FILE_REG => FileType::Regular,
        GFS_FILE_LNK => FileType::Symlink,
        GFS_FILE_BLK => FileType::BlockDev,
        GFS_FILE_CHR => FileType::CharDev,
        GFS_FILE_FIFO => FileType::Fifo,
        GFS_FILE_SOCK => FileType::Socket,
        _ => FileType::Unknown,
    }
}

impl Format for Gfs1Format {
    fn name(&self) -> &'static str {
        "gfs"
    }

    fn is_legacy(&self) -> bool {
        true
    }

    fn fs_format(&self) -> u32 {
        GFS_FORMAT_FS
    }

    fn decode_sb(&self, buf: &[u8]) -> Superblock {
        let mut sb = decode_common_sb(buf);
        sb.jindex_di = Inum::decode(&buf[48..64]);
        sb.rindex_di = Inum::decode(&buf[64..80]);
        sb.quota_di = Inum::decode(&buf[224..240]);
        sb.license_di = Inum::decode(&buf[240..256]);
        sb
    }

    fn encode_sb(&self, sb: &Superblock, buf: &mut [u8]) {
        encode_common_sb(sb, buf);
        sb.jindex_di.encode(&mut buf[48..64]);
        sb.rindex_di.encode(&mut buf[64..80]);
        sb.quota_di.encode(&mut buf[224..240]);
        sb.license_di.encode(&mut buf[240..256]);
    }

    fn indirect_header_len(&self) -> usize {
        GFS_INDIRECT_HEADER_SIZE
    }

    fn file_type(&self, di: &Dinode) -> FileType {
        gfs1_file_type(di.di_type)
    }

    fn set_file_type(&self, di: &mut Dinode, ft: FileType) {
        di.di_type = gfs1_code(ft);
        di.mode = (di.mode & !(libc::S_IFMT as u32)) | ft.mode_bits();
    }

    fn dirent_type(&self, ft: FileType) -> u16 {
        gfs1_code(ft)
    }

    fn dirent_file_type(&self, de_type: u16) -> FileType {
        gfs1_file_type(de_type)
    }

    fn meta_state(&self) -> BlockState {
        BlockState::Dinode
    }

    fn jdata_state(&self) -> BlockState {
        BlockState::Dinode
    }

    fn free_meta_state(&self) -> Option<BlockState> {
        Some(BlockState::Invalid)
    }

    fn dinode_state_is_ambiguous(&self) -> bool {
        true
    }
}

/// Elige la variante según el superbloque en `buf`.
pub fn detect(buf: &[u8]) -> Option<&'static dyn Format> {
    if !check_meta(buf, METATYPE_SB) {
        return None;
    }
    match BigEndian::read_u32(&buf[24..28]) {
        GFS2_FORMAT_FS => Some(&GFS2),
        GFS_FORMAT_FS => Some(&GFS1),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_type_comes_from_di_type() {
        let mut di = Dinode::default();
        GFS1.set_file_type(&mut di, FileType::Fifo);
        assert_eq!(di.di_type, GFS_FILE_FIFO);
        assert_eq!(GFS1.file_type(&di), FileType::Fifo);

        di.di_type = GFS_FILE_NON;
        assert_eq!(GFS1.file_type(&di), FileType::Unknown);
        // GFS2 mira el modo, no di_type
        assert_eq!(GFS2.file_type(&di), FileType::Fifo);
    }

    #[test]
    fn test_detect_picks_variant_by_fs_format() {
        let mut buf = vec![0u8; 512];
        let mut sb = Superblock {
            header: MetaHeader::new(METATYPE_SB, FORMAT_SB),
            fs_format: GFS_FORMAT_FS,
            bsize: 4096,
            ..Default::default()
        };
        GFS1.encode_sb(&sb, &mut buf);
        assert!(detect(&buf).map(|f| f.is_legacy()).unwrap_or(false));

        sb.fs_format = GFS2_FORMAT_FS;
        GFS2.encode_sb(&sb, &mut buf);
        assert_eq!(detect(&buf).map(|f| f.name()), Some("gfs2"));

        buf[0] = 0;
        assert!(detect(&buf).is_none());
    }
}
