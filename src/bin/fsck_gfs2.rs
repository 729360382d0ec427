use std::path::PathBuf;
use std::process;

use anyhow::{bail, Context, Result};
use clap::Parser;
use colored::*;
use gfs2_fsck::fsck::fsck::request_abort;
use gfs2_fsck::fsck::fsck_types::{EXIT_ERROR, EXIT_USAGE};
use gfs2_fsck::{AnswerMode, FileDevice, Fsck, FsckOptions, FsckReport};
use log::warn;

/// Revisa y repara un sistema de archivos GFS2 (o GFS).
#[derive(Parser, Debug)]
#[command(name = "fsck.gfs2", version)]
struct Cli {
    /// Contestar que sí a todas las preguntas
    #[arg(short = 'y', conflicts_with = "no")]
    yes: bool,

    /// Contestar que no a todo y abrir en solo lectura
    #[arg(short = 'n')]
    no: bool,

    /// Más mensajes (se puede repetir)
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    verbose: u8,

    /// Solo errores
    #[arg(short = 'q')]
    quiet: bool,

    #[arg(value_name = "DEVICE")]
    device: PathBuf,
}

extern "C" fn on_sigint(_sig: libc::c_int) {
    request_abort();
}

fn init_logging(cli: &Cli) {
    let level = if cli.quiet {
        log::LevelFilter::Error
    } else {
        match cli.verbose {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            2 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format_timestamp(None)
        .init();
}

fn check(cli: &Cli) -> Result<FsckReport> {
    if !cli.device.exists() {
        bail!("no existe el dispositivo {:?}", cli.device);
    }
    let opts = FsckOptions {
        answer: if cli.yes {
            AnswerMode::Yes
        } else if cli.no {
            AnswerMode::No
        } else {
            AnswerMode::Ask
        },
        read_only: cli.no,
    };
    let dev = FileDevice::open(&cli.device, opts.read_only)
        .with_context(|| format!("no se pudo abrir {:?}", cli.device))?;
    let mut cx = Fsck::open(Box::new(dev), opts)
        .with_context(|| format!("{:?} no parece un GFS2 válido", cli.device))?;
    cx.run().context("el fsck no pudo terminar")?;
    Ok(cx.report)
}

fn print_report(rep: &FsckReport) {
    println!("\n{}", " GFS2 FILESYSTEM CHECK ".on_blue().bold());
    println!("{}", "──────────────────────────────────────────".blue());

    // ——————————————————————————————————————————
    //       BLOQUES, INODOS Y DIRECTORIOS
    // ——————————————————————————————————————————
    for (title, ok) in [
        ("Bloques", rep.blocks_ok),
        ("Inodos", rep.inodes_ok),
        ("Directorios", rep.dirs_ok),
    ] {
        println!("\n{}", title.bold().underline());
        if ok {
            println!("  {} {} OK", "✓".green(), title);
        } else {
            println!("  {} Errores en {}", "✗".red(), title.to_lowercase());
        }
    }

    // ——————————————————————————————————————————
    //       ERRORES DETALLADOS
    // ——————————————————————————————————————————
    println!("\n{}", "Errores detectados".bold().underline());
    if rep.errors.is_empty() {
        println!("  {} No se encontraron errores", "✓".green());
    } else {
        for err in &rep.errors {
            println!("  {} {}", "•".red(), err.red());
        }
    }

    // ——————————————————————————————————————————
    //       RESUMEN FINAL
    // ——————————————————————————————————————————
    println!("\n{}", "Resumen".bold().underline());
    if rep.aborted {
        println!("{}\n", "✗ FSCK cancelado por el operador.".yellow().bold());
    } else if rep.errors.is_empty() {
        println!("{} Sistema de archivos limpio.\n", "✓ OK".green().bold());
    } else {
        println!(
            "{} {} errores encontrados, {} corregidos, {} sin corregir.\n",
            "✗ FSCK completado con errores:".red().bold(),
            rep.errors.len().to_string().yellow(),
            rep.fixed.to_string().green(),
            rep.declined.to_string().red()
        );
    }
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            if e.print().is_err() {
                process::exit(EXIT_ERROR);
            }
            let code = if e.use_stderr() { EXIT_USAGE } else { 0 };
            process::exit(code);
        }
    };
    init_logging(&cli);

    // SIGINT: terminar al siguiente inodo guardando lo ya reparado
    let prev = unsafe { libc::signal(libc::SIGINT, on_sigint as libc::sighandler_t) };
    if prev == libc::SIG_ERR {
        warn!("no se pudo instalar el manejador de SIGINT");
    }

    match check(&cli) {
        Ok(rep) => {
            print_report(&rep);
            process::exit(rep.exit_code());
        }
        Err(e) => {
            eprintln!("{} {:#}", "fsck.gfs2:".red().bold(), e);
            process::exit(EXIT_ERROR);
        }
    }
}
