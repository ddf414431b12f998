//! workpool CLI: run a schedule for one work type, or inspect its records.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{TimeDelta, Utc};
use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use tracing::info;
use workpool::bus::PoolBus;
use workpool::config::{Config, ScheduleConfig};
use workpool::db::Db;
use workpool::engine::{
    CommandHandler, PoolPublisher, PoolSubscriber, ScheduleRegistry, WorkSchedule, handler_fn,
};
use workpool::model::{NewWork, PostMode, WorkOutcome, WorkRecord};
use workpool::telemetry::{TelemetryConfig, init_telemetry};

type Json = serde_json::Value;

#[derive(Parser)]
#[command(name = "workpool", about = "Durable distributed work scheduler")]
struct Cli {
    /// Schedule tuning file (TOML). WORKPOOL_* env vars override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a work schedule that executes a command per due record
    Serve {
        /// Work type to serve
        #[arg(long)]
        work_type: String,
        /// Executable run once per claimed record
        #[arg(long)]
        command: PathBuf,
        /// Extra arguments passed to the command
        #[arg(last = true)]
        args: Vec<String>,
    },
    /// Work record operations
    Work {
        #[command(subcommand)]
        action: WorkAction,
    },
    /// Release abandoned claims for a work type now
    Sweep {
        /// Work type to sweep
        work_type: String,
    },
}

#[derive(Subcommand)]
enum WorkAction {
    /// Post (or update) a work record
    Post {
        work_type: String,
        /// Reference id; posting an existing id updates it
        reference_id: String,
        /// JSON payload
        #[arg(long)]
        payload: Option<String>,
        /// scheduled or immediate
        #[arg(long, default_value = "scheduled")]
        mode: String,
        /// Run no earlier than this many seconds from now
        #[arg(long)]
        delay_secs: Option<i64>,
    },
    /// Remove a work record
    Remove { work_type: String, reference_id: String },
    /// Show one work record
    Show { work_type: String, reference_id: String },
    /// List work records, soonest due first
    List {
        work_type: String,
        /// Maximum records to show
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = Config::from_env()?;
    let _guard = init_telemetry(TelemetryConfig::from_config(&config, "workpool"))?;
    let schedule_config = load_schedule_config(cli.config.as_deref())?;

    let db = Db::connect(config.database_url.expose_secret()).await?;
    db.migrate().await?;

    match cli.command {
        Command::Serve {
            work_type,
            command,
            args,
        } => cmd_serve(&db, &config, schedule_config, work_type, command, args).await,
        Command::Work { action } => match action {
            WorkAction::Post {
                work_type,
                reference_id,
                payload,
                mode,
                delay_secs,
            } => {
                let schedule = admin_schedule(&db, &config, schedule_config, &work_type)?;
                cmd_work_post(&schedule, reference_id, payload, &mode, delay_secs).await
            }
            WorkAction::Remove {
                work_type,
                reference_id,
            } => {
                let schedule = admin_schedule(&db, &config, schedule_config, &work_type)?;
                if schedule.remove_work(&reference_id).await? {
                    println!("Removed: {reference_id}");
                } else {
                    println!("No work record '{reference_id}' for type {work_type}.");
                }
                Ok(())
            }
            WorkAction::Show {
                work_type,
                reference_id,
            } => {
                let schedule = admin_schedule(&db, &config, schedule_config, &work_type)?;
                cmd_work_show(&schedule, &reference_id).await
            }
            WorkAction::List { work_type, limit } => {
                let schedule = admin_schedule(&db, &config, schedule_config, &work_type)?;
                cmd_work_list(&schedule, limit).await
            }
        },
        Command::Sweep { work_type } => {
            let schedule = admin_schedule(&db, &config, schedule_config, &work_type)?;
            let released = schedule.sweep_stuck().await?;
            println!("Released {released} abandoned claim(s).");
            Ok(())
        }
    }
}

fn load_schedule_config(path: Option<&Path>) -> anyhow::Result<ScheduleConfig> {
    let base = match path {
        Some(path) => ScheduleConfig::from_toml_file(path)?,
        None => ScheduleConfig::default(),
    };
    Ok(base.with_env_overrides()?)
}

async fn cmd_serve(
    db: &Db,
    config: &Config,
    schedule_config: ScheduleConfig,
    work_type: String,
    command: PathBuf,
    args: Vec<String>,
) -> anyhow::Result<()> {
    let handler = CommandHandler::new(&work_type, command).args(args);
    let schedule = WorkSchedule::new(
        &work_type,
        schedule_config,
        db.work_store::<Json>(&work_type),
        handler,
    )?;

    let bus: Arc<dyn PoolBus> = Arc::new(db.bus());
    schedule.attach_publisher(PoolPublisher::new(Arc::clone(&bus), &config.pool, &work_type));
    let registry = Arc::new(ScheduleRegistry::single(schedule.clone()));
    let subscriber = PoolSubscriber::spawn(bus, &config.pool, &work_type, registry).await?;

    schedule.start()?;
    info!(work_type = %work_type, pool = %config.pool, "serving; ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested, draining local queue");

    subscriber.shutdown().await?;
    schedule.stop().await?;
    Ok(())
}

/// A schedule that is never started. It only posts and inspects records;
/// immediate posts go out over the pool bus to the serving instances.
fn admin_schedule(
    db: &Db,
    config: &Config,
    schedule_config: ScheduleConfig,
    work_type: &str,
) -> anyhow::Result<WorkSchedule<Json>> {
    let schedule = WorkSchedule::new(
        work_type,
        schedule_config,
        db.work_store::<Json>(work_type),
        handler_fn(|_: WorkRecord<Json>| async { WorkOutcome::retry() }),
    )?;
    schedule.attach_publisher(PoolPublisher::new(Arc::new(db.bus()), &config.pool, work_type));
    Ok(schedule)
}

async fn cmd_work_post(
    schedule: &WorkSchedule<Json>,
    reference_id: String,
    payload: Option<String>,
    mode: &str,
    delay_secs: Option<i64>,
) -> anyhow::Result<()> {
    let mode: PostMode = mode.parse()?;
    if mode == PostMode::Local {
        anyhow::bail!("local mode needs a running schedule; use scheduled or immediate");
    }
    let payload: Json = match payload {
        Some(json) => serde_json::from_str(&json)?,
        None => serde_json::json!({}),
    };

    let mut new = NewWork::new(reference_id, payload);
    if let Some(secs) = delay_secs {
        let delay = TimeDelta::try_seconds(secs)
            .ok_or_else(|| anyhow::anyhow!("delay out of range: {secs}"))?;
        new = new.next_time(Utc::now() + delay);
    }

    let record = schedule.post_work(new, mode, None).await?;
    println!(
        "Posted: {} ({}, next run {})",
        record.reference_id,
        mode,
        record.next_time.format("%Y-%m-%d %H:%M:%S")
    );
    Ok(())
}

async fn cmd_work_show(schedule: &WorkSchedule<Json>, reference_id: &str) -> anyhow::Result<()> {
    let Some(record) = schedule.get_work(reference_id).await? else {
        anyhow::bail!(
            "no work record '{reference_id}' for type {}",
            schedule.work_type()
        );
    };

    println!("ID:         {}", record.id.0);
    println!("Type:       {}", schedule.work_type());
    println!("Reference:  {}", record.reference_id);
    println!("Acquired:   {}", record.acquired);
    println!("Next Time:  {}", record.next_time);
    println!(
        "Acquiring:  {}",
        record
            .acquiring_time
            .map(|t| t.to_string())
            .unwrap_or("-".to_string())
    );
    println!(
        "Payload:    {}",
        serde_json::to_string_pretty(&record.payload)?
    );
    println!("Created:    {}", record.created_at);
    println!("Updated:    {}", record.updated_at);
    Ok(())
}

async fn cmd_work_list(schedule: &WorkSchedule<Json>, limit: usize) -> anyhow::Result<()> {
    let records = schedule.list_work(limit).await?;
    if records.is_empty() {
        println!("No work records found.");
        return Ok(());
    }

    println!(
        "{:<8}  {:<30}  {:<8}  {:<19}  CREATED",
        "ID", "REFERENCE", "ACQUIRED", "NEXT_TIME"
    );
    println!("{}", "-".repeat(90));

    for record in &records {
        let reference: String = record.reference_id.chars().take(30).collect();
        println!(
            "{:<8}  {:<30}  {:<8}  {:<19}  {}",
            record.id,
            reference,
            record.acquired,
            record.next_time.format("%Y-%m-%d %H:%M:%S"),
            record.created_at.format("%Y-%m-%d %H:%M")
        );
    }

    println!("\n{} record(s)", records.len());
    Ok(())
}
