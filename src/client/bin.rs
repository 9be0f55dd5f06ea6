//! symcli: query and administration client for symdb-server.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use symdb::client::Client;
use symdb::error::Result;
use symdb::protocol::DEFAULT_SOCK_PATH;

#[derive(Parser)]
#[command(name = "symcli", about = "Query client for the symdb daemon")]
struct Cli {
    /// Path of the server's listening socket.
    #[arg(long, default_value = DEFAULT_SOCK_PATH)]
    socket: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Manage projects.
    #[command(subcommand)]
    Project(ProjectCmd),
    /// Look up symbols.
    #[command(subcommand)]
    Symbol(SymbolCmd),
    /// Inspect files.
    #[command(subcommand)]
    File(FileCmd),
}

#[derive(Subcommand)]
enum ProjectCmd {
    /// Create and index a project from an explicit home directory.
    Create {
        #[arg(long)]
        name: String,
        #[arg(long)]
        home: String,
    },
    /// Re-parse every changed file of a project.
    Update {
        #[arg(long)]
        name: String,
    },
    /// Drop a project and its database.
    Delete {
        #[arg(long)]
        name: String,
    },
    /// List live projects.
    List,
    /// List a project's source files.
    Files {
        #[arg(long)]
        name: String,
    },
}

#[derive(Subcommand)]
enum SymbolCmd {
    /// Where is a symbol defined.
    Definition {
        #[arg(long)]
        project: String,
        #[arg(long)]
        symbol: String,
        /// Prefer the definition from this path's module.
        #[arg(long)]
        path: Option<String>,
    },
    /// Where is a symbol referenced.
    Reference {
        #[arg(long)]
        project: String,
        #[arg(long)]
        symbol: String,
        /// Restrict to references from this path's module.
        #[arg(long)]
        path: Option<String>,
    },
}

#[derive(Subcommand)]
enum FileCmd {
    /// Symbols a file defines.
    Symbols {
        #[arg(long)]
        project: String,
        #[arg(long)]
        path: String,
    },
    /// Symbols a file references.
    Refer {
        #[arg(long)]
        project: String,
        #[arg(long)]
        path: String,
    },
    /// Wipe and re-parse one file.
    Rebuild {
        #[arg(long)]
        project: String,
        #[arg(long)]
        path: String,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("symcli: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Returns `Ok(false)` when the server answered with an error string.
fn run(cli: Cli) -> Result<bool> {
    let mut client = Client::connect(&cli.socket)?;

    let error = match cli.command {
        Command::Project(ProjectCmd::Create { name, home }) => {
            client.create_project(&name, &home)?.error
        }
        Command::Project(ProjectCmd::Update { name }) => client.update_project(&name)?.error,
        Command::Project(ProjectCmd::Delete { name }) => client.delete_project(&name)?.error,
        Command::Project(ProjectCmd::List) => {
            let rsp = client.list_projects()?;
            for project in &rsp.projects {
                println!("{}\t{}", project.name, project.home_path);
            }
            rsp.error
        }
        Command::Project(ProjectCmd::Files { name }) => {
            let rsp = client.list_project_files(&name)?;
            if rsp.error.is_empty() {
                println!("home: {}", rsp.home_path);
                for file in &rsp.files {
                    println!("{file}");
                }
            }
            rsp.error
        }
        Command::Symbol(SymbolCmd::Definition {
            project,
            symbol,
            path,
        }) => {
            let rsp = client.symbol_definition(&project, &symbol, path.as_deref())?;
            for loc in &rsp.locations {
                println!("{}:{}:{}", loc.path, loc.line, loc.column);
            }
            rsp.error
        }
        Command::Symbol(SymbolCmd::Reference {
            project,
            symbol,
            path,
        }) => {
            let rsp = client.symbol_references(&project, &symbol, path.as_deref())?;
            for loc in &rsp.locations {
                println!("{}:{}:{}", loc.path, loc.line, loc.column);
            }
            rsp.error
        }
        Command::File(FileCmd::Symbols { project, path }) => {
            let rsp = client.file_symbols(&project, &path)?;
            for symbol in &rsp.symbols {
                println!("{}\t{}:{}", symbol.name, symbol.line, symbol.column);
            }
            rsp.error
        }
        Command::File(FileCmd::Refer { project, path }) => {
            let rsp = client.file_references(&project, &path)?;
            for symbol in &rsp.symbols {
                let sites: Vec<String> = symbol
                    .locations
                    .iter()
                    .map(|(line, column)| format!("{line}:{column}"))
                    .collect();
                println!("{}\t{}", symbol.name, sites.join(" "));
            }
            rsp.error
        }
        Command::File(FileCmd::Rebuild { project, path }) => {
            client.rebuild_file(&project, &path)?.error
        }
    };

    if error.is_empty() {
        Ok(true)
    } else {
        eprintln!("{error}");
        Ok(false)
    }
}
