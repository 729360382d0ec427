pub mod error;
pub mod ondisk;
pub mod format;
pub mod buf;
pub mod rgrp;
pub mod fs;
pub mod inode;
pub mod dir;
pub mod mkfs;
pub mod fsck;

pub use crate::error::{FsError, Result};
pub use crate::format::{FileType, Format, GFS1, GFS2};
pub use crate::fs::{BitmapAllocator, BlockAllocator, Gfs2Fs, SystemInodes};
pub use crate::inode::Inode;
pub use crate::dir::{DirEntry, DirError};
pub use crate::mkfs::{mkfs, MkfsOptions};
pub use crate::fsck::fsck_backend::{BlockDevice, FileDevice};
pub use crate::fsck::mock::MemDevice;
pub use crate::fsck::fsck::{run_fsck, Fsck};
pub use crate::fsck::fsck_types::{AnswerMode, FsckOptions, FsckReport};
