mod common;

use common::*;
use gfs2_fsck::dir::disk_hash;
use gfs2_fsck::fsck::blockmap::BlockMark;
use gfs2_fsck::fsck::dups::RefKind;
use gfs2_fsck::fsck::fsck_types::EXIT_NONDESTRUCT;
use gfs2_fsck::fsck::lost_n_found::add_inode_to_lf;
use gfs2_fsck::ondisk::*;
use gfs2_fsck::{FileType, Format, FsError, Fsck, FsckOptions, Gfs2Fs, MemDevice};

fn run_yes(fs: Gfs2Fs) -> Fsck {
    let mut cx = Fsck::new(fs, FsckOptions::yes());
    cx.run().unwrap();
    cx
}

fn run_no(dev: &MemDevice) -> Fsck {
    let fs = Gfs2Fs::open(Box::new(dev.clone()), true).unwrap();
    let mut cx = Fsck::new(fs, FsckOptions::no());
    cx.run().unwrap();
    cx
}

fn has_error(cx: &Fsck, needle: &str) -> bool {
    cx.report.errors.iter().any(|e| e.contains(needle))
}

fn put_dirent(buf: &mut [u8], off: usize, rec_len: usize, name: &[u8], inum: Inum, de_type: u16) {
    let de = Dirent {
        inum,
        hash: disk_hash(name),
        rec_len: rec_len as u16,
        name_len: name.len() as u16,
        de_type,
    };
    de.encode(&mut buf[off..]);
    buf[off + DIRENT_SIZE..off + DIRENT_SIZE + name.len()].copy_from_slice(name);
}

// -----------------------------------------------------------------------------
// Pasada 1
// -----------------------------------------------------------------------------

#[test]
fn test_block_count_is_fixed() {
    let (dev, mut fs) = small_image();
    let root = fs.md.root_dir;
    let f = add_file(&mut fs, root, "f", &vec![3u8; 2000]);
    let mut ip = fs.inode_read(f).unwrap();
    assert_eq!(ip.di.blocks, 3);
    ip.di.blocks = 11;
    ip.mark_dirty();
    fs.inode_put(ip).unwrap();
    fs.flush().unwrap();

    let cx = run_yes(reopen(&dev));
    assert!(!cx.report.inodes_ok);
    assert_eq!(cx.report.declined, 0);
    assert_eq!(cx.report.exit_code(), EXIT_NONDESTRUCT);

    let mut fs = reopen(&dev);
    assert_eq!(fs.inode_read(f).unwrap().di.blocks, 3);
}

#[test]
fn test_shared_data_block_is_recorded_as_duplicate() {
    let (dev, mut fs) = small_image();
    let root = fs.md.root_dir;
    let a = add_file(&mut fs, root, "a", &vec![1u8; 2000]);
    let b = add_file(&mut fs, root, "b", &vec![2u8; 2000]);
    assert!(a < b);
    let pa = pointers_of(&mut fs, a, 2);
    let pb = pointers_of(&mut fs, b, 2);
    set_pointers(&mut fs, b, &[pa[0], pb[1]]);
    fs.flush().unwrap();

    let cx = run_yes(reopen(&dev));
    assert_eq!(cx.dups.len(), 1);
    let rec = cx.dups.get(pa[0]).unwrap();
    assert_eq!(rec.refs, 2);
    assert!(rec.first_ref_found);
    assert_eq!(rec.claim(a).unwrap().refs_of(RefKind::Data), 1);
    assert_eq!(rec.claim(b).unwrap().refs_of(RefKind::Data), 1);
    assert_eq!(cx.bl.query(pa[0]).unwrap(), BlockMark::Used);
    // los dos inodos se clasificaron igual
    assert!(cx.classified.contains(&a));
    assert!(cx.classified.contains(&b));
}

#[test]
fn test_too_many_bad_pointers_frees_inode() {
    let (dev, mut fs) = small_image();
    let root = fs.md.root_dir;
    let f = add_file(&mut fs, root, "roto", &vec![5u8; 2000]);
    let good = pointers_of(&mut fs, f, 2);
    let mut ptrs = good.clone();
    ptrs.extend((0..12).map(|i| fs.fssize + 100 + i));
    set_pointers(&mut fs, f, &ptrs);
    fs.flush().unwrap();

    let cx = run_yes(reopen(&dev));
    assert_eq!(cx.bl.query(f).unwrap(), BlockMark::Free);
    assert!(has_error(&cx, "demasiados punteros malos"));
    assert!(!cx.classified.contains(&f));

    let fs = reopen(&dev);
    assert_eq!(fs.get_bitmap(f).unwrap(), BlockState::Free);
}

#[test]
fn test_few_bad_pointers_undo_classification() {
    let (dev, mut fs) = small_image();
    let root = fs.md.root_dir;
    let f = add_file(&mut fs, root, "medio", &vec![5u8; 2000]);
    let good = pointers_of(&mut fs, f, 2);
    let mut ptrs = good.clone();
    ptrs.extend((0..3).map(|i| fs.fssize + 100 + i));
    set_pointers(&mut fs, f, &ptrs);
    fs.flush().unwrap();

    let cx = run_yes(reopen(&dev));
    assert_eq!(cx.bl.query(f).unwrap(), BlockMark::Free);
    assert_eq!(cx.bl.query(good[0]).unwrap(), BlockMark::Free);
    assert!(has_error(&cx, "metadatos dañados"));

    let fs = reopen(&dev);
    assert_eq!(fs.get_bitmap(good[0]).unwrap(), BlockState::Free);
    assert_eq!(fs.get_bitmap(f).unwrap(), BlockState::Free);
}

#[test]
fn test_leaf_pointer_runs_are_made_powers_of_two() {
    let (dev, mut fs) = small_image();
    let root = fs.md.root_dir;
    let dir = add_dir(&mut fs, root, "hash");
    let l = alloc_meta(&mut fs);
    let m = alloc_meta(&mut fs);
    let bsize = fs.bsize as usize;
    let dt = fs.format.dirent_type(FileType::Directory);
    let dnum = fs.inode_read(dir).unwrap().di.num;
    let rnum = fs.inode_read(root).unwrap().di.num;

    // hoja L con "." y "..", profundidad 0
    let mut bh = fs.cache.bget(l);
    let mut leaf = Leaf::new(0);
    leaf.entries = 2;
    leaf.encode(&mut bh.data);
    let dot = dirent_size(1);
    put_dirent(&mut bh.data, LEAF_SIZE, dot, b".", dnum, dt);
    put_dirent(&mut bh.data, LEAF_SIZE + dot, bsize - LEAF_SIZE - dot, b"..", rnum, dt);
    fs.cache.brelse(bh).unwrap();

    // hoja M vacía, profundidad 2
    let mut bh = fs.cache.bget(m);
    Leaf::new(2).encode(&mut bh.data);
    let empty = Dirent { rec_len: (bsize - LEAF_SIZE) as u16, ..Default::default() };
    empty.encode(&mut bh.data[LEAF_SIZE..]);
    fs.cache.brelse(bh).unwrap();

    set_pointers(&mut fs, dir, &[l, l, l, m]);
    let mut ip = fs.inode_read(dir).unwrap();
    ip.di.flags |= DIF_EXHASH;
    ip.di.depth = 2;
    ip.di.size = 32;
    ip.di.blocks = 3;
    ip.di.entries = 2;
    ip.mark_dirty();
    fs.inode_put(ip).unwrap();
    fs.flush().unwrap();

    let cx = run_yes(reopen(&dev));
    assert!(!cx.report.inodes_ok);
    assert_eq!(cx.report.declined, 0);
    assert_eq!(cx.bl.query(l).unwrap(), BlockMark::Leaf);
    assert_eq!(cx.bl.query(m).unwrap(), BlockMark::Leaf);
    assert_eq!(cx.dirtree.get(dir).unwrap().dotdot_parent, root);

    let mut fs = reopen(&dev);
    assert_eq!(pointers_of(&mut fs, dir, 4), vec![l, l, m, m]);
    assert_eq!(Leaf::decode(&fs.cache.bread(l).unwrap().data).depth, 1);
    assert_eq!(Leaf::decode(&fs.cache.bread(m).unwrap().data).depth, 1);
    assert_eq!(fs.inode_read(dir).unwrap().di.blocks, 3);
}

#[test]
fn test_missing_system_inode_is_rebuilt() {
    let (dev, mut fs) = small_image();
    let old = fs.md.quota;
    fs.cache.modify(old, |b| b.fill(0)).unwrap();
    fs.flush().unwrap();

    let cx = run_yes(reopen(&dev));
    assert!(has_error(&cx, "quota"));
    let new = cx.fs.md.quota;
    assert_ne!(new, old);
    assert_eq!(cx.bl.query(new).unwrap(), BlockMark::InodeFile);
    assert_eq!(cx.bl.query(old).unwrap(), BlockMark::Free);

    let mut fs = reopen(&dev);
    assert_eq!(fs.md.quota, new);
    let ip = fs.inode_read(new).unwrap();
    assert!(check_meta(&ip.bh.data, METATYPE_DI));
    assert_eq!(fs.get_bitmap(old).unwrap(), BlockState::Free);
}

#[test]
fn test_block_used_as_metadata_and_data() {
    let (dev, mut fs) = small_image();
    let root = fs.md.root_dir;
    let a = add_file(&mut fs, root, "a", &vec![1u8; 2000]);
    let b = add_file(&mut fs, root, "b", &vec![2u8; 2000]);
    let pa = pointers_of(&mut fs, a, 2);
    let pb = pointers_of(&mut fs, b, 2);

    // A pasa a tener un indirecto con sus dos bloques de datos
    let ind = alloc_meta(&mut fs);
    let mut bh = fs.cache.bget(ind);
    MetaHeader::new(METATYPE_IN, FORMAT_IN).encode(&mut bh.data);
    for (i, &p) in pa.iter().enumerate() {
        write_be64(&mut bh.data, META_HEADER_SIZE + i * 8, p);
    }
    fs.cache.brelse(bh).unwrap();
    set_pointers(&mut fs, a, &[ind]);
    let mut ip = fs.inode_read(a).unwrap();
    ip.di.height = 1;
    ip.di.blocks = 4;
    ip.mark_dirty();
    fs.inode_put(ip).unwrap();

    // B usa ese indirecto como bloque de datos
    set_pointers(&mut fs, b, &[ind, pb[1]]);
    fs.flush().unwrap();

    let cx = run_yes(reopen(&dev));
    let rec = cx.dups.get(ind).unwrap();
    assert_eq!(rec.refs, 2);
    assert!(rec.first_ref_found);
    let ca = rec.claim(a).unwrap();
    assert_eq!(ca.refs_of(RefKind::Meta), 1);
    assert_eq!(ca.refs_of(RefKind::Data), 0);
    let cb = rec.claim(b).unwrap();
    assert_eq!(cb.refs_of(RefKind::Data), 1);
    assert_eq!(cb.refs_of(RefKind::Meta), 0);
    assert_eq!(cx.bl.query(ind).unwrap(), BlockMark::Indir);
    assert!(cx.dups.get(pa[0]).is_none());

    // el indirecto de A no es un bloque de datos de B
    let mut fs = reopen(&dev);
    assert_eq!(fs.inode_read(a).unwrap().di.blocks, 4);
    assert_eq!(fs.inode_read(b).unwrap().di.blocks, 2);
}

#[test]
fn test_rerun_finds_the_same_duplicates() {
    let (dev, mut fs) = small_image();
    let root = fs.md.root_dir;
    let a = add_file(&mut fs, root, "a", &vec![1u8; 3000]);
    let b = add_file(&mut fs, root, "b", &vec![2u8; 3000]);
    let c = add_file(&mut fs, root, "c", &vec![3u8; 3000]);
    let pa = pointers_of(&mut fs, a, 3);
    let pb = pointers_of(&mut fs, b, 3);
    let pc = pointers_of(&mut fs, c, 3);
    set_pointers(&mut fs, b, &[pa[0], pb[1], pa[2]]);
    set_pointers(&mut fs, c, &[pa[0], pb[1], pc[2]]);
    fs.flush().unwrap();
    let before = dev.snapshot();

    let first = run_no(&dev);
    let second = run_no(&dev);
    assert_eq!(first.dups.len(), 3);
    let one: Vec<_> = first.dups.iter().cloned().collect();
    let two: Vec<_> = second.dups.iter().cloned().collect();
    assert_eq!(one, two);
    assert_eq!(first.dups.get(pa[0]).unwrap().refs, 3);
    assert_eq!(dev.snapshot(), before);
}

#[test]
fn test_last_leaf_run_is_made_power_of_two() {
    let (dev, mut fs) = small_image();
    let root = fs.md.root_dir;
    let dir = add_dir(&mut fs, root, "hash");
    let l = alloc_meta(&mut fs);
    let m = alloc_meta(&mut fs);
    let bsize = fs.bsize as usize;
    let dt = fs.format.dirent_type(FileType::Directory);
    let dnum = fs.inode_read(dir).unwrap().di.num;
    let rnum = fs.inode_read(root).unwrap().di.num;

    let mut bh = fs.cache.bget(l);
    let mut leaf = Leaf::new(0);
    leaf.entries = 2;
    leaf.encode(&mut bh.data);
    let dot = dirent_size(1);
    put_dirent(&mut bh.data, LEAF_SIZE, dot, b".", dnum, dt);
    put_dirent(&mut bh.data, LEAF_SIZE + dot, bsize - LEAF_SIZE - dot, b"..", rnum, dt);
    fs.cache.brelse(bh).unwrap();

    let mut bh = fs.cache.bget(m);
    Leaf::new(2).encode(&mut bh.data);
    let empty = Dirent { rec_len: (bsize - LEAF_SIZE) as u16, ..Default::default() };
    empty.encode(&mut bh.data[LEAF_SIZE..]);
    fs.cache.brelse(bh).unwrap();

    // la corrida de L es la última y tiene tres punteros
    set_pointers(&mut fs, dir, &[m, l, l, l]);
    let mut ip = fs.inode_read(dir).unwrap();
    ip.di.flags |= DIF_EXHASH;
    ip.di.depth = 2;
    ip.di.size = 32;
    ip.di.blocks = 3;
    ip.di.entries = 2;
    ip.mark_dirty();
    fs.inode_put(ip).unwrap();
    fs.flush().unwrap();

    let cx = run_yes(reopen(&dev));
    assert!(!cx.report.inodes_ok);
    assert_eq!(cx.report.declined, 0);

    let mut fs = reopen(&dev);
    assert_eq!(pointers_of(&mut fs, dir, 4), vec![m, m, l, l]);
    assert_eq!(Leaf::decode(&fs.cache.bread(l).unwrap().data).depth, 1);
    assert_eq!(Leaf::decode(&fs.cache.bread(m).unwrap().data).depth, 1);

    // la tabla reparada ya no tiene nada que corregir
    let cx = run_yes(reopen(&dev));
    assert!(cx.report.inodes_ok);
    assert!(cx.report.errors.is_empty(), "{:?}", cx.report.errors);
}

#[test]
fn test_huge_hash_depth_frees_directory() {
    let (dev, mut fs) = small_image();
    let root = fs.md.root_dir;
    let dir = add_dir(&mut fs, root, "hondo");
    let mut ip = fs.inode_read(dir).unwrap();
    ip.di.flags |= DIF_EXHASH;
    ip.di.depth = 61;
    ip.mark_dirty();
    fs.inode_put(ip).unwrap();
    fs.flush().unwrap();

    let cx = run_yes(reopen(&dev));
    assert_eq!(cx.bl.query(dir).unwrap(), BlockMark::Free);
    assert!(!cx.dirtree.contains(dir));
    assert!(has_error(&cx, "profundidad de hash inválida"));

    let fs = reopen(&dev);
    assert_eq!(fs.get_bitmap(dir).unwrap(), BlockState::Free);
}

#[test]
fn test_declined_system_inode_rebuild_stops_the_run() {
    let (dev, mut fs) = small_image();
    let root = fs.md.root_dir;
    let f = add_file(&mut fs, root, "f", b"datos");
    let old = fs.md.quota;
    fs.cache.modify(old, |b| b.fill(0)).unwrap();
    fs.flush().unwrap();
    let before = dev.snapshot();

    let fs = Gfs2Fs::open(Box::new(dev.clone()), true).unwrap();
    let mut cx = Fsck::new(fs, FsckOptions::no());
    let err = cx.run().unwrap_err();
    assert!(matches!(err, FsError::Fatal(_)), "{}", err);
    assert!(err.to_string().contains("quota"));
    assert!(has_error(&cx, "quota"));
    // no se llegó a barrer los grupos de recursos
    assert_eq!(cx.bl.query(f).unwrap(), BlockMark::Free);
    assert!(!cx.classified.contains(&f));
    assert_eq!(dev.snapshot(), before);
}

// -----------------------------------------------------------------------------
// Directorios
// -----------------------------------------------------------------------------

#[test]
fn test_dotdot_follows_the_directory_that_names_it() {
    let (dev, mut fs) = small_image();
    let root = fs.md.root_dir;
    let f = add_file(&mut fs, root, "archivo", b"x");
    let d = loose_dir(&mut fs, f);
    link(&mut fs, root, "sub", d);
    fs.flush().unwrap();

    let cx = run_yes(reopen(&dev));
    assert!(!cx.report.dirs_ok);
    let info = cx.dirtree.get(d).unwrap();
    assert_eq!(info.dotdot_parent, root);
    assert_eq!(info.treewalk_parent, root);
    // la entrada "archivo" de la raíz; el ".." viejo ya no cuenta
    assert_eq!(cx.links.counted(f), 1);

    let mut fs = reopen(&dev);
    let dip = fs.inode_read(d).unwrap();
    let dotdot = fs.dir_search(&dip, b"..").unwrap().unwrap();
    assert_eq!(dotdot.inum.addr, root);
}

#[test]
fn test_unreachable_directory_goes_to_lost_found() {
    let (dev, mut fs) = small_image();
    let root = fs.md.root_dir;
    let d = loose_dir(&mut fs, root);
    fs.flush().unwrap();

    let cx = run_yes(reopen(&dev));
    assert!(!cx.report.dirs_ok);
    let lf = cx.lf_dip.unwrap();
    assert_eq!(cx.dirtree.get(d).unwrap().dotdot_parent, lf);

    let mut fs = reopen(&dev);
    let rip = fs.inode_read(root).unwrap();
    let entry = fs.dir_search(&rip, b"lost+found").unwrap().unwrap();
    assert_eq!(entry.inum.addr, lf);

    let lip = fs.inode_read(lf).unwrap();
    assert_eq!(lip.di.nlink, 3);
    let name = format!("lost_dir_{}", d);
    let moved = fs.dir_search(&lip, name.as_bytes()).unwrap().unwrap();
    assert_eq!(moved.inum.addr, d);

    let dip = fs.inode_read(d).unwrap();
    assert_eq!(fs.dir_search(&dip, b"..").unwrap().unwrap().inum.addr, lf);
}

#[test]
fn test_orphan_file_is_named_by_type_and_block() {
    let (dev, mut fs) = small_image();
    let f = orphan_file(&mut fs, b"perdido");
    fs.flush().unwrap();

    let mut cx = run_yes(reopen(&dev));
    assert!(cx.lf_dip.is_none());
    let mut ip = cx.fs.inode_read(f).unwrap();
    add_inode_to_lf(&mut cx, &mut ip).unwrap();
    cx.fs.inode_put(ip).unwrap();

    let lf = cx.lf_dip.unwrap();
    assert!(cx.dirtree.is_checked(lf));
    assert_eq!(cx.links.counted(f), 1);
    let lip = cx.fs.inode_read(lf).unwrap();
    let name = format!("lost_file_{}", f);
    let entry = cx.fs.dir_search(&lip, name.as_bytes()).unwrap().unwrap();
    assert_eq!(entry.inum.addr, f);
    assert_eq!(entry.file_type, FileType::Regular);

    // una segunda vez se reutiliza el mismo lost+found
    let g = {
        let mut alloc = gfs2_fsck::BitmapAllocator;
        let mut gi = gfs2_fsck::mkfs::new_inode(&mut cx.fs, &mut alloc, FileType::Regular, 0o600, 0).unwrap();
        gfs2_fsck::mkfs::write_new_file_data(&mut cx.fs, &mut gi, b"otro", &mut alloc).unwrap();
        let addr = gi.addr;
        cx.fs.inode_put(gi).unwrap();
        addr
    };
    let mut gi = cx.fs.inode_read(g).unwrap();
    add_inode_to_lf(&mut cx, &mut gi).unwrap();
    cx.fs.inode_put(gi).unwrap();
    assert_eq!(cx.lf_dip, Some(lf));
}

#[test]
fn test_damaged_directory_is_freed_in_pass3() {
    let (dev, mut fs) = small_image();
    let root = fs.md.root_dir;
    let dir = add_dir(&mut fs, root, "malo");
    let ptrs: Vec<u64> = (0..3).map(|i| fs.fssize + 50 + i).collect();
    set_pointers(&mut fs, dir, &ptrs);
    let mut ip = fs.inode_read(dir).unwrap();
    ip.di.height = 1;
    ip.mark_dirty();
    fs.inode_put(ip).unwrap();
    fs.flush().unwrap();

    let cx = run_yes(reopen(&dev));
    assert!(has_error(&cx, "metadatos dañados"));
    assert!(has_error(&cx, "bloques dañados"));
    assert!(!cx.report.dirs_ok);
    assert_eq!(cx.bl.query(dir).unwrap(), BlockMark::Free);
    assert!(cx.dirtree.is_checked(dir));

    let fs = reopen(&dev);
    assert_eq!(fs.get_bitmap(dir).unwrap(), BlockState::Free);
}
