use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use gfs2_fsck::{mkfs, FileDevice, MkfsOptions};

/// Crea una imagen GFS2 (o GFS con --legacy) sobre un archivo.
#[derive(Parser, Debug)]
#[command(name = "mkfs.gfs2", version)]
struct Cli {
    /// Tamaño de bloque en bytes
    #[arg(short = 'b', default_value_t = 4096)]
    block_size: u32,

    /// Bloques por grupo de recursos
    #[arg(short = 'r', default_value_t = 2048)]
    rgrp_blocks: u32,

    /// Cantidad de journals
    #[arg(short = 'j', default_value_t = 1)]
    journals: u32,

    /// Bloques por journal
    #[arg(short = 'J', default_value_t = 64)]
    journal_blocks: u32,

    /// Formato GFS heredado
    #[arg(long)]
    legacy: bool,

    /// Tamaño de la imagen en bloques
    #[arg(long)]
    blocks: u64,

    #[arg(value_name = "DEVICE")]
    device: PathBuf,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    // 1. Opciones
    let opts = MkfsOptions {
        block_size: cli.block_size,
        rgrp_blocks: cli.rgrp_blocks,
        journals: cli.journals,
        journal_blocks: cli.journal_blocks,
        legacy: cli.legacy,
        ..Default::default()
    };
    let size = cli
        .blocks
        .checked_mul(cli.block_size as u64)
        .ok_or_else(|| anyhow!("la imagen de {} bloques es demasiado grande", cli.blocks))?;

    // 2. Imagen
    let dev = FileDevice::create(&cli.device, size)
        .with_context(|| format!("no se pudo crear {:?}", cli.device))?;

    // 3. Estructura
    let fs = mkfs(Box::new(dev), &opts).with_context(|| format!("mkfs falló sobre {:?}", cli.device))?;

    println!(
        "mkfs.gfs2: {} creado con {} bloques de {} bytes en {} grupos de recursos.",
        fs.format.name(),
        fs.fssize,
        fs.bsize,
        fs.rgrps.len()
    );
    Ok(())
}
