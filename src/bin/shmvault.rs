use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgGroup, Parser};
use env_logger::Env;
use log::error;

use shmvault::{driver, Config, Mode, VersionWindow};

const MAX_THREADS: u32 = 1024;

#[derive(Parser, Debug)]
#[command(
    name = "shmvault",
    version,
    about = "Backs up and restores a server's System V shared memory index segments",
    group(ArgGroup::new("operation").required(true).args(["backup", "restore"]))
)]
struct Cli {
    /// Analyze only: validate and print the equivalent command, perform no I/O
    #[arg(short = 'a')]
    analyze: bool,

    /// Back up segments to files
    #[arg(short = 'b')]
    backup: bool,

    /// Restore segments from files
    #[arg(short = 'r')]
    restore: bool,

    /// Compute and cross-check CRC32 values on both sides
    #[arg(short = 'c', conflicts_with = "analyze")]
    crc32: bool,

    /// Server instance to operate on
    #[arg(short = 'i', default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=15))]
    instance: u8,

    /// Comma-separated namespace names
    #[arg(short = 'n', required = true, value_delimiter = ',')]
    namespaces: Vec<String>,

    /// Directory holding (or to hold) the segment files
    #[arg(short = 'p', required = true)]
    pathdir: PathBuf,

    /// Maximum number of I/O threads (default: host CPU count)
    #[arg(short = 't', value_parser = clap::value_parser!(u32).range(1..=MAX_THREADS as i64))]
    threads: Option<u32>,

    /// Verbose output
    #[arg(short = 'v')]
    verbose: bool,

    /// Gzip stage files on backup (compressed files are always auto-detected
    /// on restore)
    #[arg(short = 'z')]
    compress: bool,
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "info" } else { "warn" };
    let env = Env::default().default_filter_or(default_filter);
    let mut builder = env_logger::Builder::from_env(env);
    builder.format_timestamp_secs();
    builder.format(|buf, record| {
        let ts = buf.timestamp();
        writeln!(
            buf,
            "[{} {:<5} {}] {}",
            ts,
            record.level(),
            record.target(),
            record.args()
        )
    });
    builder.init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    // Echo the command as issued.
    let issued: Vec<String> = std::env::args().collect();
    println!("{}", issued.join(" "));

    // The segment key range belongs to the server's user; operate as root.
    if unsafe { libc::setuid(0) } != 0 || unsafe { libc::setgid(0) } != 0 {
        error!(
            "event=privilege_check error={}; must operate as uid 0, gid 0 (try sudo)",
            std::io::Error::last_os_error()
        );
        return ExitCode::FAILURE;
    }

    let cpus = num_cpus::get().max(1);
    let threads = (cli.threads.map(|t| t as usize).unwrap_or(cpus)).min(cpus);

    let config = Config {
        mode: if cli.backup {
            Mode::Backup
        } else {
            Mode::Restore
        },
        analyze: cli.analyze,
        check_crc: cli.crc32,
        compress: cli.compress,
        verbose: cli.verbose,
        instance: cli.instance,
        namespaces: cli.namespaces,
        dir: cli.pathdir,
        threads,
        version_window: VersionWindow::default(),
    };

    if cli.verbose {
        log::info!(
            "event=operation mode={:?} analyze={} crc32={} compress={} instance={} threads={}",
            config.mode,
            config.analyze,
            config.check_crc,
            config.compress,
            config.instance,
            config.threads
        );
    }

    match driver::run(&config) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            error!("event=run_failed error={}", err);
            ExitCode::FAILURE
        }
    }
}
