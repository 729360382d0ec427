mod common;

use common::*;
use gfs2_fsck::fsck::fsck_types::{EXIT_OK, EXIT_UNCORRECTED};
use gfs2_fsck::{run_fsck, FileDevice, Format, Fsck, FsckOptions, Gfs2Fs, MkfsOptions};

#[test]
fn test_fresh_image_is_clean() {
    let (dev, _fs) = small_image();
    let report = run_fsck(reopen(&dev), FsckOptions::yes()).unwrap();
    assert!(report.is_clean(), "errores: {:?}", report.errors);
    assert_eq!(report.exit_code(), EXIT_OK);
    assert_eq!(report.fixed, 0);
}

#[test]
fn test_populated_image_is_clean() {
    let (dev, mut fs) = small_image();
    let root = fs.md.root_dir;
    let docs = add_dir(&mut fs, root, "docs");
    add_file(&mut fs, docs, "notas.txt", b"hola");
    add_file(&mut fs, docs, "grande.bin", &vec![7u8; 5000]);
    add_dir(&mut fs, docs, "vacio");
    fs.flush().unwrap();

    let mut cx = Fsck::new(reopen(&dev), FsckOptions::yes());
    cx.run().unwrap();
    assert!(cx.report.is_clean(), "errores: {:?}", cx.report.errors);
    assert!(cx.dups.is_empty());
    // raíz, maestro, jindex, per_node y los dos nuevos
    assert_eq!(cx.dirtree.len(), 6);
    assert_eq!(cx.dirtree.get(docs).unwrap().treewalk_parent, root);
    assert_eq!(cx.dirtree.get(docs).unwrap().dotdot_parent, root);
}

#[test]
fn test_second_run_after_repair_is_clean() {
    let (dev, mut fs) = small_image();
    let root = fs.md.root_dir;
    let f = add_file(&mut fs, root, "f", &vec![1u8; 2000]);
    let mut ip = fs.inode_read(f).unwrap();
    ip.di.blocks = 9;
    ip.mark_dirty();
    fs.inode_put(ip).unwrap();
    fs.flush().unwrap();

    let first = run_fsck(reopen(&dev), FsckOptions::yes()).unwrap();
    assert!(!first.is_clean());
    let second = run_fsck(reopen(&dev), FsckOptions::yes()).unwrap();
    assert!(second.is_clean(), "errores: {:?}", second.errors);
}

#[test]
fn test_legacy_image_is_clean() {
    let (dev, mut fs) = image_with(MkfsOptions { legacy: true, ..small_opts() });
    assert!(fs.format.is_legacy());
    let root = fs.md.root_dir;
    add_file(&mut fs, root, "viejo", b"gfs");
    fs.flush().unwrap();

    let report = run_fsck(reopen(&dev), FsckOptions::yes()).unwrap();
    assert!(report.is_clean(), "errores: {:?}", report.errors);
}

#[test]
fn test_read_only_run_leaves_image_untouched() {
    let (dev, mut fs) = small_image();
    let root = fs.md.root_dir;
    let f = add_file(&mut fs, root, "f", &vec![1u8; 2000]);
    let mut ip = fs.inode_read(f).unwrap();
    ip.di.blocks = 9;
    ip.mark_dirty();
    fs.inode_put(ip).unwrap();
    fs.flush().unwrap();

    let before = dev.snapshot();
    let fs = Gfs2Fs::open(Box::new(dev.clone()), true).unwrap();
    let report = run_fsck(fs, FsckOptions::no()).unwrap();
    assert!(!report.inodes_ok);
    assert!(report.declined > 0);
    assert_eq!(report.exit_code(), EXIT_UNCORRECTED);
    assert!(before == dev.snapshot(), "el modo -n escribió en la imagen");
}

#[test]
fn test_file_backed_image() {
    let tmp = tempfile::NamedTempFile::new().unwrap();
    let path = tmp.path().to_path_buf();
    {
        let dev = FileDevice::create(&path, IMAGE_SIZE).unwrap();
        let mut fs = gfs2_fsck::mkfs(Box::new(dev), &small_opts()).unwrap();
        let root = fs.md.root_dir;
        add_file(&mut fs, root, "en_disco", b"contenido");
        fs.flush().unwrap();
    }

    let dev = FileDevice::open(&path, false).unwrap();
    let mut cx = Fsck::open(Box::new(dev), FsckOptions::yes()).unwrap();
    cx.run().unwrap();
    assert!(cx.report.is_clean(), "errores: {:?}", cx.report.errors);
    assert_eq!(cx.report.exit_code(), EXIT_OK);
}
