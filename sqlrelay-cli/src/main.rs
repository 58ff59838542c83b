//! Runs the relay end to end: `serve` drives the leader role against a
//! SQLite file, `exec` drives a single statement as either a local leader
//! (`--db`) or a follower dialing out to a running `serve` (`--addr`).

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use sqlrelay::{Connection, ConnectionOptions};
use tokio::{net::TcpStream, sync::Mutex};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sqlrelay", about = "Leader/follower access to a single SQLite database")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Own the SQLite file at `--db` and accept follower connections on `--addr`.
    Serve {
        #[arg(long)]
        db: PathBuf,
        #[arg(long, default_value = "127.0.0.1:7878")]
        addr: SocketAddr,
    },
    /// Run one statement, either against a local SQLite file (`--db`) or
    /// relayed to a leader already listening (`--addr`).
    Exec {
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long)]
        addr: Option<SocketAddr>,
        #[arg(long, default_value_t = 15_000)]
        timeout_ms: u64,
        sql: String,
    },
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { db, addr } => serve(db, addr).await,
        Command::Exec {
            db,
            addr,
            timeout_ms,
            sql,
        } => exec(db, addr, timeout_ms, &sql).await,
    }
}

async fn serve(db: PathBuf, addr: SocketAddr) -> Result<()> {
    let server = sqlrelay_engine::LeaderServer::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(addr = %server.local_addr()?, db = %db.display(), "leader listening");
    server.run(db).await.context("leader server failed")?;
    Ok(())
}

async fn exec(db: Option<PathBuf>, addr: Option<SocketAddr>, timeout_ms: u64, sql: &str) -> Result<()> {
    let assignment = match (db, addr) {
        (Some(db), None) => {
            let engine = sqlrelay_engine::LeaderEngine::open(&db)
                .await
                .with_context(|| format!("failed to open {}", db.display()))?;
            sqlrelay::RoleAssignment::Leader(Arc::new(Mutex::new(engine)))
        }
        (None, Some(addr)) => {
            let stream = TcpStream::connect(addr)
                .await
                .with_context(|| format!("failed to connect to leader at {addr}"))?;
            let (transport, _incoming) = sqlrelay_net::Transport::new(stream);
            sqlrelay::RoleAssignment::Follower(transport)
        }
        (Some(_), Some(_)) => bail!("pass exactly one of --db or --addr, not both"),
        (None, None) => bail!("pass one of --db (run as leader in-process) or --addr (connect to a leader)"),
    };

    let options = ConnectionOptions::parse(&format!("DefaultTimeout={timeout_ms}"))?;
    let connection = Connection::new(sqlrelay::FixedRole::new(assignment), options);
    connection.wait_if_connecting().await?;
    tracing::debug!(role = ?connection.role(), "connection ready");

    let mut command = connection.command(sql);

    if is_query(sql) {
        let mut reader = command.execute_reader(0).await?;
        print_header(&reader);
        let mut rows = 0usize;
        while reader.read().await? {
            print_row(&mut reader).await?;
            rows += 1;
        }
        reader.dispose().await;
        println!("({rows} row{})", if rows == 1 { "" } else { "s" });
    } else {
        let changes = command.execute_non_query().await?;
        println!("changes: {changes}");
    }

    command.dispose().await;
    connection.close();
    Ok(())
}

fn is_query(sql: &str) -> bool {
    sql.trim_start().to_ascii_uppercase().starts_with("SELECT")
}

fn print_header(reader: &sqlrelay::Reader) {
    let names: Vec<&str> = reader.columns().iter().map(|c| c.name.as_str()).collect();
    println!("{}", names.join("\t"));
}

async fn print_row(reader: &mut sqlrelay::Reader) -> Result<()> {
    let mut fields = Vec::with_capacity(reader.columns().len());
    for ordinal in 0..reader.columns().len() as u16 {
        let value = reader.get_string(ordinal).await?;
        fields.push(value.unwrap_or_else(|| "NULL".to_owned()));
    }
    println!("{}", fields.join("\t"));
    Ok(())
}
