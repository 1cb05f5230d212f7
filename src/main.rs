use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, TimeDelta, Utc};
use clap::{Parser, Subcommand};
use command::{CommandResolver, StaticConfig};
use config::Config;
use db::DB;
use log::LevelFilter;
use record::TelemetryRecord;
use server::Server;
use simplelog::{ColorChoice, ConfigBuilder, TermLogger, TerminalMode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

mod command;
mod config;
mod db;
mod error;
mod frame;
mod record;
mod server;

/// Largest frame `fetch` will accept.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const SEED_STEP_MINUTES: i64 = 15;

#[derive(Debug, Parser)]
#[command(version, about = "Serves recent farm telemetry over a framed TCP protocol")]
struct Cli {
    #[arg(short, long, env = "FARM_EXPORT_CONFIG", default_value = config::DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Cmd>,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Run the export server until Ctrl+C
    Serve,
    /// Request one frame from a running server and print it
    Fetch {
        #[arg(short, long, default_value = "127.0.0.1:5003")]
        addr: String,
        #[arg(short, long, default_value_t = 0x01)]
        flag: u8,
    },
    /// Fill the database with synthetic readings for local testing
    Seed {
        #[arg(short, long, default_value_t = 1)]
        device_id: i64,
        #[arg(short = 'n', long, default_value_t = 100)]
        count: usize,
    },
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    let config = Config::load_or_default(&cli.config)?;
    init_logger(config.logging.level_filter()?)?;
    if cli.config.exists() {
        log::info!("Loaded config from {}", cli.config.display());
    } else {
        log::warn!("No config file at {}, using defaults", cli.config.display());
    }

    let result = match cli.command.unwrap_or(Cmd::Serve) {
        Cmd::Serve => serve(config).await,
        Cmd::Fetch { addr, flag } => fetch(&addr, flag).await,
        Cmd::Seed { device_id, count } => seed(&config, device_id, count),
    };

    if let Err(e) = result {
        log::error!("{e:#}");
        std::process::exit(1);
    }

    Ok(())
}

fn init_logger(level: LevelFilter) -> Result<(), anyhow::Error> {
    TermLogger::init(
        level,
        ConfigBuilder::new()
            .set_time_format_rfc3339()
            .set_time_offset_to_local()
            .map_err(|_| anyhow::anyhow!("Failed to set time offset to local"))?
            .build(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )
    .context("Failed to initialize logger")
}

async fn serve(config: Config) -> Result<(), anyhow::Error> {
    let db = DB::new(
        &config.database.path,
        config.database.busy_timeout(),
        config.database.retry_builder(),
    );
    db.init().context("Failed to initialize database")?;

    let resolver = CommandResolver::new(
        config.export.default_device_id,
        Box::new(StaticConfig {
            record_count: config.export.record_count,
        }),
    );

    let server = Server::bind(config.server.bind.as_str(), Arc::new(db), resolver)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind))?
        .with_max_connections(config.server.max_connections)
        .with_read_timeout(config.server.read_timeout());

    log::info!(
        "Serving {} on {} (max {} connections)",
        config.database.path.display(),
        server.local_addr().context("Failed to read local address")?,
        config.server.max_connections,
    );

    server
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to wait for Ctrl+C signal: {e}");
            }
        })
        .await;

    Ok(())
}

async fn fetch(addr: &str, flag: u8) -> Result<(), anyhow::Error> {
    let mut stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("Failed to connect to {addr}"))?;
    stream
        .write_all(&[flag])
        .await
        .context("Failed to send command")?;

    let payload = frame::read_framed(&mut stream, MAX_FRAME_LEN)
        .await
        .context("Failed to read response")?
        .ok_or_else(|| anyhow::anyhow!("Server closed the connection without a response"))?;

    // Anything after the frame means the server misbehaved.
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).await?;
    if !rest.is_empty() {
        log::warn!("Ignoring {} trailing bytes", rest.len());
    }

    let readings = frame::deserialize(&payload).context("Failed to decode response")?;
    log::info!("Received {} records", readings.len());
    for (i, r) in readings.iter().enumerate() {
        println!(
            "{i:>4}  temperature={:.2}  humidity={:.2}  water_level={:.2}",
            r.temperature, r.humidity, r.water_level
        );
    }

    Ok(())
}

fn seed(config: &Config, device_id: i64, count: usize) -> Result<(), anyhow::Error> {
    let db = DB::new(
        &config.database.path,
        config.database.busy_timeout(),
        config.database.retry_builder(),
    );
    db.init().context("Failed to initialize database")?;

    let step = TimeDelta::minutes(SEED_STEP_MINUTES);
    let mut at = seed_start(Utc::now(), count)?;
    for i in 0..count {
        at += step;
        let record = TelemetryRecord::new(
            device_id,
            20.0 + (i as f32 * 0.1),
            45.0 + (i % 20) as f32,
            10.0 - (i as f32 * 0.05).min(9.0),
        )
        .at(at.timestamp());
        db.insert(&record)?;
    }

    log::info!(
        "Seeded {} with {count} records for device {device_id}",
        config.database.path.display()
    );
    Ok(())
}

/// Time just before the first seeded reading, so the last one lands on `now`.
fn seed_start(now: DateTime<Utc>, count: usize) -> Result<DateTime<Utc>, anyhow::Error> {
    i64::try_from(count)
        .ok()
        .and_then(|n| n.checked_mul(SEED_STEP_MINUTES))
        .and_then(TimeDelta::try_minutes)
        .and_then(|span| now.checked_sub_signed(span))
        .ok_or_else(|| anyhow::anyhow!("Seed count {count} spans too far into the past"))
}
