/* Registros en disco de GFS2. Todo es big-endian y cada bloque de metadatos
empieza con un encabezado de 24 bytes (magic, tipo, formato). Este módulo
solo traduce bytes <-> estructuras; lo que depende de la variante del formato
(GFS2 o el GFS heredado) vive en format.rs. */

use byteorder::{BigEndian, ByteOrder};

// -----------------------------------------------------------------------------
// Constantes
// -----------------------------------------------------------------------------

pub const GFS2_MAGIC: u32 = 0x0116_1970;

/// Offset en bytes del superbloque, sin importar el tamaño de bloque.
pub const SB_OFFSET: u64 = 65536;

pub const METATYPE_NONE: u32 = 0;
pub const METATYPE_SB: u32 = 1;
pub const METATYPE_RG: u32 = 2;
pub const METATYPE_RB: u32 = 3;
pub const METATYPE_DI: u32 = 4;
pub const METATYPE_IN: u32 = 5;
pub const METATYPE_LF: u32 = 6;
pub const METATYPE_JD: u32 = 7;
pub const METATYPE_LH: u32 = 8;
pub const METATYPE_LD: u32 = 9;
pub const METATYPE_EA: u32 = 10;
pub const METATYPE_ED: u32 = 11;
pub const METATYPE_LB: u32 = 12;
pub const METATYPE_QC: u32 = 14;

pub const FORMAT_SB: u32 = 100;
pub const FORMAT_RG: u32 = 200;
pub const FORMAT_RB: u32 = 300;
pub const FORMAT_DI: u32 = 400;
pub const FORMAT_IN: u32 = 500;
pub const FORMAT_LF: u32 = 600;
pub const FORMAT_JD: u32 = 700;
pub const FORMAT_LH: u32 = 800;
pub const FORMAT_EA: u32 = 1600;
pub const FORMAT_ED: u32 = 1700;
pub const FORMAT_DE: u32 = 1200;

pub const GFS2_FORMAT_FS: u32 = 1801;
pub const GFS2_FORMAT_MULTI: u32 = 1900;
pub const GFS_FORMAT_FS: u32 = 1309;
pub const GFS_FORMAT_MULTI: u32 = 1401;

pub const META_HEADER_SIZE: usize = 24;
pub const DINODE_SIZE: usize = 232;
pub const RGRP_SIZE: usize = 128;
pub const RINDEX_SIZE: usize = 96;
pub const LEAF_SIZE: usize = 104;
pub const DIRENT_SIZE: usize = 40;
pub const EA_HEADER_SIZE: usize = 16;

pub const NBBY: u32 = 4;
pub const BIT_SIZE: u32 = 2;
pub const BIT_MASK: u8 = 0x3;

pub const DIF_JDATA: u32 = 0x0000_0001;
pub const DIF_EXHASH: u32 = 0x0000_0002;
pub const DIF_EA_INDIRECT: u32 = 0x0000_0008;
pub const DIF_SYSTEM: u32 = 0x0000_0200;

pub const EAFLAG_LAST: u8 = 0x01;
pub const EATYPE_UNUSED: u8 = 0;
pub const EATYPE_USR: u8 = 1;
pub const EATYPE_SYS: u8 = 2;
pub const EATYPE_SECURITY: u8 = 3;
pub const EATYPE_LAST: u8 = 3;

pub const MAX_META_HEIGHT: u16 = 10;
pub const DIR_MAX_DEPTH: u16 = 17;
pub const FNAME_MAX: usize = 255;

// -----------------------------------------------------------------------------
// Estado de asignación (2 bits por bloque)
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockState {
    Free = 0,
    Used = 1,
    /// "unlinked" en GFS2, "free meta" en el formato heredado.
    Invalid = 2,
    Dinode = 3,
}

impl BlockState {
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(BlockState::Free),
            1 => Some(BlockState::Used),
            2 => Some(BlockState::Invalid),
            3 => Some(BlockState::Dinode),
            _ => None,
        }
    }

    pub fn bits(self) -> u8 {
        self as u8
    }
}

// -----------------------------------------------------------------------------
// Registros
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetaHeader {
    pub magic: u32,
    pub mh_type: u32,
    pub format: u32,
}

impl MetaHeader {
    pub fn new(mh_type: u32, format: u32) -> Self {
        Self { magic: GFS2_MAGIC, mh_type, format }
    }

    pub fn decode(buf: &[u8]) -> Self {
        Self {
            magic: BigEndian::read_u32(&buf[0..4]),
            mh_type: BigEndian::read_u32(&buf[4..8]),
            format: BigEndian::read_u32(&buf[16..20]),
        }
    }

    pub fn encode(&self, buf: &mut [u8]) {
        BigEndian::write_u32(&mut buf[0..4], self.magic);
        BigEndian::write_u32(&mut buf[4..8], self.mh_type);
        BigEndian::write_u64(&mut buf[8..16], 0);
        BigEndian::write_u32(&mut buf[16..20], self.format);
        BigEndian::write_u32(&mut buf[20..24], 0);
    }
}

/// true si el bloque lleva el magic de GFS2 y el tipo pedido.
pub fn check_meta(buf: &[u8], mh_type: u32) -> bool {
    if buf.len() < META_HEADER_SIZE {
        return false;
    }
    let mh = MetaHeader::decode(buf);
    mh.magic == GFS2_MAGIC && (mh_type == METATYPE_NONE || mh.mh_type == mh_type)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Inum {
    pub formal_ino: u64,
    pub addr: u64,
}

impl Inum {
    pub fn new(formal_ino: u64, addr: u64) -> Self {
        Self { formal_ino, addr }
    }

    pub fn decode(buf: &[u8]) -> Self {
        Self {
            formal_ino: BigEndian::read_u64(&buf[0..8]),
            addr: BigEndian::read_u64(&buf[8..16]),
        }
    }

    pub fn encode(&self, buf: &mut [u8]) {
        BigEndian::write_u64(&mut buf[0..8], self.formal_ino);
        BigEndian::write_u64(&mut buf[8..16], self.addr);
    }
}

/// Superbloque. Los campos que no existen en una variante quedan en cero.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Superblock {
    pub header: MetaHeader,
    pub fs_format: u32,
    pub multihost_format: u32,
    pub bsize: u32,
    pub bsize_shift: u32,
    pub master_dir: Inum,
    pub root_dir: Inum,
    pub lockproto: String,
    pub locktable: String,
    pub jindex_di: Inum,
    pub rindex_di: Inum,
    pub quota_di: Inum,
    pub license_di: Inum,
}

pub(crate) fn read_cstr(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

pub(crate) fn write_cstr(buf: &mut [u8], s: &str) {
    buf.fill(0);
    let n = s.len().min(buf.len().saturating_sub(1));
    buf[..n].copy_from_slice(&s.as_bytes()[..n]);
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dinode {
    pub header: MetaHeader,
    pub num: Inum,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub size: u64,
    pub blocks: u64,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
    pub major: u32,
    pub minor: u32,
    pub goal_meta: u64,
    pub goal_data: u64,
    pub generation: u64,
    pub flags: u32,
    pub payload_format: u32,
    /// Tipo de archivo del formato heredado (campo de relleno en GFS2).
    pub di_type: u16,
    pub height: u16,
    pub depth: u16,
    pub entries: u32,
    pub eattr: u64,
}

impl Dinode {
    pub fn decode(buf: &[u8]) -> Self {
        Self {
            header: MetaHeader::decode(buf),
            num: Inum::decode(&buf[24..40]),
            mode: BigEndian::read_u32(&buf[40..44]),
            uid: BigEndian::read_u32(&buf[44..48]),
            gid: BigEndian::read_u32(&buf[48..52]),
            nlink: BigEndian::read_u32(&buf[52..56]),
            size: BigEndian::read_u64(&buf[56..64]),
            blocks: BigEndian::read_u64(&buf[64..72]),
            atime: BigEndian::read_u64(&buf[72..80]),
            mtime: BigEndian::read_u64(&buf[80..88]),
            ctime: BigEndian::read_u64(&buf[88..96]),
            major: BigEndian::read_u32(&buf[96..100]),
            minor: BigEndian::read_u32(&buf[100..104]),
            goal_meta: BigEndian::read_u64(&buf[104..112]),
            goal_data: BigEndian::read_u64(&buf[112..120]),
            generation: BigEndian::read_u64(&buf[120..128]),
            flags: BigEndian::read_u32(&buf[128..132]),
            payload_format: BigEndian::read_u32(&buf[132..136]),
            di_type: BigEndian::read_u16(&buf[136..138]),
            height: BigEndian::read_u16(&buf[138..140]),
            depth: BigEndian::read_u16(&buf[146..148]),
            entries: BigEndian::read_u32(&buf[148..152]),
            eattr: BigEndian::read_u64(&buf[168..176]),
        }
    }

    /// Escribe los campos en los primeros DINODE_SIZE bytes; el resto del
    /// bloque (datos "stuffed" o punteros) no se toca.
    pub fn encode(&self, buf: &mut [u8]) {
        self.header.encode(buf);
        self.num.encode(&mut buf[24..40]);
        BigEndian::write_u32(&mut buf[40..44], self.mode);
        BigEndian::write_u32(&mut buf[44..48], self.uid);
        BigEndian::write_u32(&mut buf[48..52], self.gid);
        BigEndian::write_u32(&mut buf[52..56], self.nlink);
        BigEndian::write_u64(&mut buf[56..64], self.size);
        BigEndian::write_u64(&mut buf[64..72], self.blocks);
        BigEndian::write_u64(&mut buf[72..80], self.atime);
        BigEndian::write_u64(&mut buf[80..88], self.mtime);
        BigEndian::write_u64(&mut buf[88..96], self.ctime);
        BigEndian::write_u32(&mut buf[96..100], self.major);
        BigEndian::write_u32(&mut buf[100..104], self.minor);
        BigEndian::write_u64(&mut buf[104..112], self.goal_meta);
        BigEndian::write_u64(&mut buf[112..120], self.goal_data);
        BigEndian::write_u64(&mut buf[120..128], self.generation);
        BigEndian::write_u32(&mut buf[128..132], self.flags);
        BigEndian::write_u32(&mut buf[132..136], self.payload_format);
        BigEndian::write_u16(&mut buf[136..138], self.di_type);
        BigEndian::write_u16(&mut buf[138..140], self.height);
        BigEndian::write_u16(&mut buf[146..148], self.depth);
        BigEndian::write_u32(&mut buf[148..152], self.entries);
        BigEndian::write_u64(&mut buf[168..176], self.eattr);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RgrpHeader {
    pub header: MetaHeader,
    pub flags: u32,
    pub free: u32,
    pub dinodes: u32,
    pub igeneration: u64,
}

impl RgrpHeader {
    pub fn decode(buf: &[u8]) -> Self {
        Self {
            header: MetaHeader::decode(buf),
            flags: BigEndian::read_u32(&buf[24..28]),
            free: BigEndian::read_u32(&buf[28..32]),
            dinodes: BigEndian::read_u32(&buf[32..36]),
            igeneration: BigEndian::read_u64(&buf[40..48]),
        }
    }

    pub fn encode(&self, buf: &mut [u8]) {
        self.header.encode(buf);
        BigEndian::write_u32(&mut buf[24..28], self.flags);
        BigEndian::write_u32(&mut buf[28..32], self.free);
        BigEndian::write_u32(&mut buf[32..36], self.dinodes);
        BigEndian::write_u64(&mut buf[40..48], self.igeneration);
    }
}

/// Una entrada del archivo rindex.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rindex {
    pub addr: u64,
    pub length: u32,
    pub data0: u64,
    pub data: u32,
    pub bitbytes: u32,
}

impl Rindex {
    pub fn decode(buf: &[u8]) -> Self {
        Self {
            addr: BigEndian::read_u64(&buf[0..8]),
            length: BigEndian::read_u32(&buf[8..12]),
            data0: BigEndian::read_u64(&buf[16..24]),
            data: BigEndian::read_u32(&buf[24..28]),
            bitbytes: BigEndian::read_u32(&buf[28..32]),
        }
    }

    pub fn encode(&self, buf: &mut [u8]) {
        buf[..RINDEX_SIZE].fill(0);
        BigEndian::write_u64(&mut buf[0..8], self.addr);
        BigEndian::write_u32(&mut buf[8..12], self.length);
        BigEndian::write_u64(&mut buf[16..24], self.data0);
        BigEndian::write_u32(&mut buf[24..28], self.data);
        BigEndian::write_u32(&mut buf[28..32], self.bitbytes);
    }

    /// Primer bloque después del área de datos del grupo.
    pub fn data_end(&self) -> u64 {
        self.data0 + self.data as u64
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Leaf {
    pub header: MetaHeader,
    pub depth: u16,
    pub entries: u16,
    pub dirent_format: u32,
    pub next: u64,
}

impl Leaf {
    pub fn new(depth: u16) -> Self {
        Self {
            header: MetaHeader::new(METATYPE_LF, FORMAT_LF),
            depth,
            entries: 0,
            dirent_format: FORMAT_DE,
            next: 0,
        }
    }

    pub fn decode(buf: &[u8]) -> Self {
        Self {
            header: MetaHeader::decode(buf),
            depth: BigEndian::read_u16(&buf[24..26]),
            entries: BigEndian::read_u16(&buf[26..28]),
            dirent_format: BigEndian::read_u32(&buf[28..32]),
            next: BigEndian::read_u64(&buf[32..40]),
        }
    }

    pub fn encode(&self, buf: &mut [u8]) {
        self.header.encode(buf);
        BigEndian::write_u16(&mut buf[24..26], self.depth);
        BigEndian::write_u16(&mut buf[26..28], self.entries);
        BigEndian::write_u32(&mut buf[28..32], self.dirent_format);
        BigEndian::write_u64(&mut buf[32..40], self.next);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dirent {
    pub inum: Inum,
    pub hash: u32,
    pub rec_len: u16,
    pub name_len: u16,
    pub de_type: u16,
}

impl Dirent {
    pub fn decode(buf: &[u8]) -> Self {
        Self {
            inum: Inum::decode(&buf[0..16]),
            hash: BigEndian::read_u32(&buf[16..20]),
            rec_len: BigEndian::read_u16(&buf[20..22]),
            name_len: BigEndian::read_u16(&buf[22..24]),
            de_type: BigEndian::read_u16(&buf[24..26]),
        }
    }

    pub fn encode(&self, buf: &mut [u8]) {
        self.inum.encode(&mut buf[0..16]);
        BigEndian::write_u32(&mut buf[16..20], self.hash);
        BigEndian::write_u16(&mut buf[20..22], self.rec_len);
        BigEndian::write_u16(&mut buf[22..24], self.name_len);
        BigEndian::write_u16(&mut buf[24..26], self.de_type);
        buf[26..DIRENT_SIZE].fill(0);
    }
}

/// Tamaño que ocupa un dirent con un nombre de `name_len` bytes.
pub fn dirent_size(name_len: usize) -> usize {
    (DIRENT_SIZE + name_len + 7) & !7
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EaHeader {
    pub rec_len: u32,
    pub data_len: u32,
    pub name_len: u8,
    pub ea_type: u8,
    pub flags: u8,
    pub num_ptrs: u8,
}

impl EaHeader {
    pub fn decode(buf: &[u8]) -> Self {
        Self {
            rec_len: BigEndian::read_u32(&buf[0..4]),
            data_len: BigEndian::read_u32(&buf[4..8]),
            name_len: buf[8],
            ea_type: buf[9],
            flags: buf[10],
            num_ptrs: buf[11],
        }
    }

    pub fn encode(&self, buf: &mut [u8]) {
        BigEndian::write_u32(&mut buf[0..4], self.rec_len);
        BigEndian::write_u32(&mut buf[4..8], self.data_len);
        buf[8] = self.name_len;
        buf[9] = self.ea_type;
        buf[10] = self.flags;
        buf[11] = self.num_ptrs;
        buf[12..16].fill(0);
    }

    pub fn is_last(&self) -> bool {
        self.flags & EAFLAG_LAST != 0
    }

    /// Offset (desde el inicio del encabezado) del primer puntero a datos.
    pub fn data_ptrs_offset(&self) -> usize {
        EA_HEADER_SIZE + ((self.name_len as usize + 7) & !7)
    }
}

// -----------------------------------------------------------------------------
// Ayudas para leer punteros
// -----------------------------------------------------------------------------

pub fn read_be64(buf: &[u8], off: usize) -> u64 {
    BigEndian::read_u64(&buf[off..off + 8])
}

pub fn write_be64(buf: &mut [u8], off: usize, val: u64) {
    BigEndian::write_u64(&mut buf[off..off + 8], val);
}

/// Punteros de 64 bits que hay en `buf[head..]`.
pub fn pointers(buf: &[u8], head: usize) -> impl Iterator<Item = u64> + '_ {
    buf[head.min(buf.len())..]
        .chunks_exact(8)
        .map(BigEndian::read_u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dinode_fields_land_on_their_offsets() {
        let mut buf = vec![0u8; 1024];
        let di = Dinode {
            header: MetaHeader::new(METATYPE_DI, FORMAT_DI),
            num: Inum::new(7, 0x500),
            mode: libc::S_IFDIR as u32 | 0o755,
            height: 2,
            depth: 6,
            eattr: 99,
            ..Default::default()
        };
        di.encode(&mut buf);

        assert!(check_meta(&buf, METATYPE_DI));
        assert!(!check_meta(&buf, METATYPE_IN));
        assert_eq!(read_be64(&buf, 32), 0x500);
        assert_eq!(BigEndian::read_u16(&buf[138..140]), 2);
        assert_eq!(BigEndian::read_u16(&buf[146..148]), 6);
        assert_eq!(Dinode::decode(&buf), di);
    }

    #[test]
    fn test_dirent_size_is_eight_byte_aligned() {
        assert_eq!(dirent_size(1), 48);
        assert_eq!(dirent_size(2), 48);
        assert_eq!(dirent_size(8), 48);
        assert_eq!(dirent_size(9), 56);
    }

    #[test]
    fn test_ea_pointers_follow_aligned_name() {
        let ea = EaHeader { name_len: 5, ..Default::default() };
        assert_eq!(ea.data_ptrs_offset(), 24);
    }
}
