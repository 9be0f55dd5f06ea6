//! symdb-server entry point: load the XML configuration, refuse to start
//! when a live server already answers on the socket, unlink the stale socket
//! file, optionally daemonise, then run the main loop.

use std::fs::{self, OpenOptions};
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use symdb::config::Config;
use symdb::error::{Result, SymdbError};
use symdb::server::{self, Server};

#[derive(Parser)]
#[command(name = "symdb-server", about = "C/C++ symbol index daemon")]
struct Args {
    /// Path to the XML configuration file.
    #[arg(short, long, default_value = "Config.xml")]
    config: PathBuf,

    /// Detach from the terminal and run in the background.
    #[arg(long)]
    daemon: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("symdb-server: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<()> {
    let config = Arc::new(Config::load(&args.config)?);
    init_logging(&config.log_dir, args.daemon)?;

    if server::is_server_running(&config.listen_path) {
        return Err(SymdbError::config(format!(
            "server already running on {}",
            config.listen_path.display()
        )));
    }
    let _ = fs::remove_file(&config.listen_path);

    if args.daemon {
        // Keep the working directory; stdio goes to /dev/null.
        let rc = unsafe { libc::daemon(1, 0) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
    }

    let listener = UnixListener::bind(&config.listen_path)?;
    tracing::info!(listen = %config.listen_path.display(), "symdb-server starting");

    let mut server = Server::new(config)?;
    server.run(listener)
}

fn init_logging(log_dir: &Path, daemon: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if daemon {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_dir.join("symdb.log"))?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(std::sync::Mutex::new(file))
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
    Ok(())
}
