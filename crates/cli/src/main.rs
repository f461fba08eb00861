// CoEdit CLI - run the collaboration server, administer accounts

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::{Parser, Subcommand};

use coedit_server::{CollabServer, ServerConfig};
use coedit_store::{DocumentStore, SqliteStore};

#[derive(Parser)]
#[command(name = "coedit")]
#[command(about = "Collaborative text editing over length-prefixed JSON frames")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the collaboration server
    #[command(after_help = "\
Examples:
  coedit serve
  coedit serve --config /etc/coedit/server.toml
  coedit serve --listen 0.0.0.0:8443 --db /var/lib/coedit/coedit.db")]
    Serve {
        /// TOML config file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Listen address (overrides the config file)
        #[arg(long)]
        listen: Option<String>,

        /// SQLite database path (overrides the config file)
        #[arg(long)]
        db: Option<PathBuf>,

        /// Broadcast tick interval in milliseconds (overrides the config file)
        #[arg(long)]
        tick_interval_ms: Option<u64>,
    },

    /// Create an account directly in the database
    AddUser {
        username: String,
        password: String,

        /// SQLite database path
        #[arg(long, default_value = "coedit.db")]
        db: PathBuf,
    },

    /// List the documents a user can read
    ListDocs {
        username: String,

        /// SQLite database path
        #[arg(long, default_value = "coedit.db")]
        db: PathBuf,
    },
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();
    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(command: Commands) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Commands::Serve {
            config,
            listen,
            db,
            tick_interval_ms,
        } => serve(config, listen, db, tick_interval_ms),
        Commands::AddUser {
            username,
            password,
            db,
        } => {
            let store = SqliteStore::open(&db)?;
            let user = store.add_user(&username, &password)?;
            println!("created user {} (id {})", user.username, user.id);
            Ok(())
        }
        Commands::ListDocs { username, db } => {
            let store = SqliteStore::open(&db)?;
            let user = store
                .resolve_user(&username)?
                .ok_or_else(|| format!("no such user: {username}"))?;
            for doc in store.list_documents(user.id)? {
                println!(
                    "{}\t{}\t{}\t{}",
                    doc.id, doc.name, doc.owner_name, doc.created_at
                );
            }
            Ok(())
        }
    }
}

fn serve(
    config: Option<PathBuf>,
    listen: Option<String>,
    db: Option<PathBuf>,
    tick_interval_ms: Option<u64>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match config {
        Some(path) => ServerConfig::load(&path)?,
        None => ServerConfig::default(),
    };
    if let Some(listen) = listen {
        config.listen = listen;
    }
    if let Some(db) = db {
        config.db_path = db;
    }
    if let Some(ms) = tick_interval_ms {
        config.tick_interval_ms = ms;
    }

    let store: Arc<dyn DocumentStore> = Arc::new(SqliteStore::open(&config.db_path)?);
    let server = CollabServer::start(&config, store)?;
    log::info!("serving on {}", server.local_addr());
    println!("coedit server listening on {}", server.local_addr());

    // The listener and scheduler run on their own threads; park here.
    loop {
        thread::sleep(Duration::from_secs(3600));
    }
}
