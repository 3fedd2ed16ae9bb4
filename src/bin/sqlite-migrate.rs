use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use sqlite_access::SqlAccessError;
use sqlite_access::migration::triggers::create_fts_sync_triggers_script;
use sqlite_access::migration::{FtsKind, current_version};
use sqlite_access::sqlite::{SqliteOptions, close_connection, open_connection, open_migrated};

#[derive(Parser, Debug)]
#[command(name = "sqlite-migrate", version, about = "Apply versioned SQLite migrations")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply pending `v<N>.sql` migrations to a database file.
    Migrate {
        #[arg(long)]
        db: String,
        #[arg(long)]
        migrations: PathBuf,
        /// Only list the versions that would be applied.
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the FTS sync trigger script for a source table.
    Triggers {
        #[arg(long)]
        source: String,
        #[arg(long)]
        fts: String,
        #[arg(long, value_delimiter = ',', required = true)]
        columns: Vec<String>,
        #[arg(long, value_enum, default_value_t = FtsKind::Stateful)]
        kind: FtsKind,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();
    match run(args.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn run(command: Command) -> Result<(), SqlAccessError> {
    match command {
        Command::Migrate {
            db,
            migrations,
            dry_run,
        } => {
            let options = SqliteOptions::builder(db).migrations_dir(migrations).finish();
            let migrator = options.migrations.load()?;
            if dry_run {
                let conn = open_connection(&options)?;
                let current = current_version(&conn)?;
                let pending = migrator.pending(current);
                if pending.is_empty() {
                    println!("database is at v{current}; nothing to apply");
                } else {
                    for version in pending {
                        println!("v{version}");
                    }
                }
                return Ok(());
            }

            let (conn, report) = open_migrated(&options, &migrator)?;
            close_connection(conn, options.analysis_limit)?;
            info!(
                from = report.from,
                to = report.to,
                applied = report.applied.len(),
                "migration finished"
            );
            Ok(())
        }
        Command::Triggers {
            source,
            fts,
            columns,
            kind,
        } => {
            println!(
                "{}",
                create_fts_sync_triggers_script(&source, &fts, &columns, kind)
            );
            Ok(())
        }
    }
}
