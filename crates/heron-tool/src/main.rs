//! The Heron admin tool.
//!
//! Three command groups: database provisioning (`db-create`,
//! `db-password-gen`), migration lifecycle (`db-init`, `db-up`,
//! `db-down`, `db-reset`, `db-version`, `db-set-version`), and secret
//! material management (`cert-export`, `cert-import`). Exit code 0 on
//! success, non-zero on failure.

use std::io::{IsTerminal, Read, Write};
use std::path::PathBuf;

use base64::Engine;
use clap::{Parser, Subcommand, ValueEnum};
use rand::RngCore;

use heron_server::store::{migrations, secret, Db};

/// Length of a generated password before encoding.
const PASSWORD_BYTES: usize = 24;

#[derive(Parser, Debug)]
#[command(name = "heron-tool", version, about = "Heron server administration tool")]
struct Cli {
    /// SQLite database file
    #[arg(
        long,
        env = "HERON_DATABASE_PATH",
        default_value = "/var/lib/heron/heron.db",
        global = true
    )]
    database: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SecretObject {
    Cakey,
    Cacert,
    Srvkey,
    Srvcert,
    Srvtkn,
}

impl SecretObject {
    fn name(&self) -> &'static str {
        match self {
            SecretObject::Cakey => "cakey",
            SecretObject::Cacert => "cacert",
            SecretObject::Srvkey => "srvkey",
            SecretObject::Srvcert => "srvcert",
            SecretObject::Srvtkn => "srvtkn",
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the database file
    DbCreate,
    /// Generate a random password for provisioning
    DbPasswordGen,
    /// Initialize the schema on an empty database
    DbInit,
    /// Migrate the schema up (to the latest or to -t VERSION)
    DbUp {
        #[arg(short = 't', long)]
        target: Option<i64>,
    },
    /// Migrate the schema down (one step, or to -t VERSION)
    DbDown {
        #[arg(short = 't', long)]
        target: Option<i64>,
    },
    /// Revert all migrations and re-apply them
    DbReset,
    /// Print the current schema version
    DbVersion,
    /// Force the recorded schema version without running migrations
    DbSetVersion {
        #[arg(short = 't', long)]
        target: i64,
    },
    /// Export a secret object to a file or stdout
    CertExport {
        #[arg(short = 'f', long = "object")]
        object: SecretObject,
        #[arg(short = 'o', long = "output")]
        output: Option<PathBuf>,
    },
    /// Import a secret object from a file or stdin
    CertImport {
        #[arg(short = 'f', long = "object")]
        object: SecretObject,
        #[arg(short = 'i', long = "input")]
        input: Option<PathBuf>,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("HERON_TOOL_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::DbCreate => db_create(&cli.database),
        Command::DbPasswordGen => {
            println!("{}", generate_password());
            Ok(())
        }
        Command::DbInit => {
            let db = open_existing(&cli.database)?;
            let current = migrations::current_version(&db.connection())?;
            if current != 0 {
                anyhow::bail!("schema is already initialized at version {current}");
            }
            let version = migrations::migrate_up(&db.connection(), None)?;
            println!("schema initialized at version {version}");
            Ok(())
        }
        Command::DbUp { target } => {
            let db = open_existing(&cli.database)?;
            let version = migrations::migrate_up(&db.connection(), target)?;
            println!("schema version {version}");
            Ok(())
        }
        Command::DbDown { target } => {
            let db = open_existing(&cli.database)?;
            let current = migrations::current_version(&db.connection())?;
            let target = target.unwrap_or((current - 1).max(0));
            let version = migrations::migrate_down(&db.connection(), target)?;
            println!("schema version {version}");
            Ok(())
        }
        Command::DbReset => {
            let db = open_existing(&cli.database)?;
            migrations::migrate_down(&db.connection(), 0)?;
            let version = migrations::migrate_up(&db.connection(), None)?;
            println!("schema reset to version {version}");
            Ok(())
        }
        Command::DbVersion => {
            let db = open_existing(&cli.database)?;
            println!("{}", migrations::current_version(&db.connection())?);
            Ok(())
        }
        Command::DbSetVersion { target } => {
            let db = open_existing(&cli.database)?;
            migrations::set_version(&db.connection(), target)?;
            println!("schema version {target}");
            Ok(())
        }
        Command::CertExport { object, output } => cert_export(&cli.database, object, output),
        Command::CertImport { object, input } => cert_import(&cli.database, object, input),
    }
}

/// The tool owns migrations explicitly, so the schema is never touched
/// on open. A missing file is refused so typos do not create databases.
fn open_existing(path: &PathBuf) -> anyhow::Result<Db> {
    if !path.exists() {
        anyhow::bail!("database {path:?} does not exist; run db-create first");
    }
    Ok(Db::open_without_migrations(path)?)
}

fn db_create(path: &PathBuf) -> anyhow::Result<()> {
    if path.exists() {
        anyhow::bail!("database {path:?} already exists");
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    // Touch the file without applying the schema; db-init does that.
    std::fs::File::create(path)?;
    println!("created {}", path.display());
    Ok(())
}

fn generate_password() -> String {
    let mut bytes = [0u8; PASSWORD_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn cert_export(
    database: &PathBuf,
    object: SecretObject,
    output: Option<PathBuf>,
) -> anyhow::Result<()> {
    let db = open_existing(database)?;
    let content = secret::get(&db.connection(), object.name())?
        .ok_or_else(|| anyhow::anyhow!("object {} is not present", object.name()))?;
    match output {
        Some(path) => {
            std::fs::write(&path, content)?;
            println!("wrote {} to {}", object.name(), path.display());
        }
        None => {
            std::io::stdout().write_all(content.as_bytes())?;
        }
    }
    Ok(())
}

fn cert_import(
    database: &PathBuf,
    object: SecretObject,
    input: Option<PathBuf>,
) -> anyhow::Result<()> {
    let content = match input {
        Some(path) => std::fs::read_to_string(&path)?,
        None => {
            if std::io::stdin().is_terminal() {
                eprintln!(
                    "paste the {} content, end with EOF (Ctrl-D):",
                    object.name()
                );
            }
            let mut content = String::new();
            std::io::stdin().read_to_string(&mut content)?;
            content
        }
    };
    if content.trim().is_empty() {
        anyhow::bail!("refusing to import an empty {}", object.name());
    }

    let db = open_existing(database)?;
    secret::set(&db.connection(), object.name(), &content)?;
    println!("imported {}", object.name());
    Ok(())
}
