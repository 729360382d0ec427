/* Verificador y reparador. El orden de los pasos está en fsck::run_fsck. */

pub mod fsck_backend;
pub mod mock;
pub mod fsck_types;
#[allow(clippy::module_inception)]
pub mod fsck;
pub mod blockmap;
pub mod dups;
pub mod dirtree;
pub mod link;
pub mod metawalk;
pub mod pass1;
pub mod dirscan;
pub mod pass3;
pub mod lost_n_found;
