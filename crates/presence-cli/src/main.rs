use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use engine::EngineError;
use presence_core::{AttendanceEvent, Decision, EnrollmentError, NotificationSink, Roster};
use presence_store::SqliteRosterStore;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{mpsc, Arc, Mutex};
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;

mod config;
mod engine;
mod manifest;

use config::Config;

#[derive(Parser)]
#[command(name = "presence", about = "Face-recognition attendance CLI")]
struct Cli {
    /// Config file (default: $XDG_CONFIG_HOME/presence/presence.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a student from a manifest of single-face frames
    Enroll {
        /// Student number
        #[arg(long)]
        id: u32,
        #[arg(short, long)]
        name: String,
        /// JSON-lines frame manifest
        manifest: PathBuf,
    },
    /// Take attendance from a manifest of detected frames
    Attend {
        manifest: PathBuf,
        /// Print one JSON object per frame
        #[arg(long)]
        json: bool,
        /// Report detected faces without matching or marking anyone
        #[arg(long)]
        dry_run: bool,
    },
    /// List enrolled students
    List {
        #[arg(long)]
        json: bool,
    },
    /// Remove an enrolled student
    Remove { id: u32 },
    /// Start a new session: clear every attendance mark
    Reset,
    /// Show configuration and roster status
    Status,
}

#[derive(Serialize)]
struct FrameSummary {
    frame: usize,
    image: String,
    resolution: (u32, u32),
    faces: usize,
    marked: Vec<u32>,
    errors: Vec<String>,
}

#[derive(Serialize)]
struct StudentRow<'a> {
    id: u32,
    name: &'a str,
    attended: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    tracing::debug!(?config, "configuration loaded");

    match cli.command {
        Commands::Enroll { id, name, manifest } => enroll(&config, id, name, manifest).await,
        Commands::Attend {
            manifest,
            json,
            dry_run,
        } => attend(&config, manifest, json, dry_run).await,
        Commands::List { json } => {
            let roster = open_roster(&config)?;
            let snapshot = roster.snapshot();
            if json {
                let rows: Vec<StudentRow> = snapshot
                    .iter()
                    .map(|e| StudentRow {
                        id: e.id,
                        name: &e.name,
                        attended: e.attended,
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else if snapshot.is_empty() {
                println!("No students enrolled");
            } else {
                for e in snapshot.iter() {
                    let mark = if e.attended { "attended" } else { "not attended" };
                    println!("{:>8}  {:<32} {mark}", e.id, e.name);
                }
            }
            Ok(())
        }
        Commands::Remove { id } => {
            open_roster(&config)?.remove(id)?;
            println!("Removed student {id}");
            Ok(())
        }
        Commands::Reset => {
            let reset = open_roster(&config)?.reset_session()?;
            println!("New session: cleared {reset} attendance marks");
            Ok(())
        }
        Commands::Status => {
            let roster = open_roster(&config)?;
            let snapshot = roster.snapshot();
            let status = serde_json::json!({
                "version": env!("CARGO_PKG_VERSION"),
                "model": config.model_path,
                "model_present": config.model_path.exists(),
                "database": config.db_path,
                "students": snapshot.len(),
                "attended": snapshot.iter().filter(|e| e.attended).count(),
                "similarity_threshold": config.pipeline.similarity_threshold,
                "embedding_len": config.pipeline.embedding_len,
                "enrollment_samples": config.pipeline.enrollment_samples,
            });
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
    }
}

/// Roster management doesn't need the model, only the database.
fn open_roster(config: &Config) -> Result<Roster> {
    let store = SqliteRosterStore::open(&config.db_path)
        .with_context(|| format!("opening {}", config.db_path.display()))?;
    Ok(Roster::open(Box::new(store), config.pipeline.embedding_len)?)
}

async fn enroll(config: &Config, id: u32, name: String, manifest: PathBuf) -> Result<()> {
    let frames = manifest::read_manifest(&manifest)?;
    let sink: Arc<dyn NotificationSink> = Arc::new(presence_core::LogSink);
    let engine = engine::spawn_engine(config, sink).context("starting engine")?;

    println!(
        "Enrolling {name} ({id}) from {} frames, {} samples needed. Ctrl-C to stop.",
        frames.len(),
        config.pipeline.enrollment_samples
    );

    // Registered before it is queued, so Ctrl-C always reaches the session.
    let pending = engine.begin_enrollment(id, name, frames)?;
    let cancel = pending.cancel_handle();
    let mut task = tokio::spawn(pending.finish());
    let result = tokio::select! {
        joined = &mut task => joined?,
        _ = tokio::signal::ctrl_c() => {
            cancel.cancel();
            task.await?
        }
    };

    match result {
        Ok(entry) => {
            println!("Enrolled {} ({})", entry.name, entry.id);
            Ok(())
        }
        Err(EngineError::Enrollment(EnrollmentError::Cancelled { collected })) => {
            println!("Enrollment cancelled after {collected} samples; no student added");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

async fn attend(config: &Config, manifest: PathBuf, json: bool, dry_run: bool) -> Result<()> {
    let records = manifest::read_manifest(&manifest)?;
    let (tx, events) = mpsc::channel::<AttendanceEvent>();
    let sink: Arc<dyn NotificationSink> = Arc::new(Mutex::new(tx));
    let engine = engine::spawn_engine(config, sink).context("starting engine")?;
    if dry_run {
        engine.set_active(false);
    }

    let mut tasks = JoinSet::new();
    for (i, record) in records.into_iter().enumerate() {
        let engine = engine.clone();
        tasks.spawn(async move {
            let image = record.image.display().to_string();
            (i, image, engine.recognize(record).await)
        });
    }

    let mut summaries = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        let (frame, image, result) = joined?;
        let summary = match result {
            Ok(report) => FrameSummary {
                frame,
                image,
                resolution: report.resolution,
                faces: report.faces.len(),
                marked: report
                    .marked()
                    .filter_map(|d| match d {
                        Decision::Marked { id, .. } => Some(*id),
                        _ => None,
                    })
                    .collect(),
                errors: report
                    .outcomes
                    .iter()
                    .filter_map(|o| o.as_ref().err().map(|e| e.to_string()))
                    .collect(),
            },
            Err(e) => FrameSummary {
                frame,
                image,
                resolution: (0, 0),
                faces: 0,
                marked: Vec::new(),
                errors: vec![e.to_string()],
            },
        };
        summaries.push(summary);
    }
    summaries.sort_by_key(|s| s.frame);

    for s in &summaries {
        if json {
            println!("{}", serde_json::to_string(s)?);
        } else {
            println!(
                "frame {:>4}  {}x{}  faces={} marked={:?}{}",
                s.frame,
                s.resolution.0,
                s.resolution.1,
                s.faces,
                s.marked,
                if s.errors.is_empty() {
                    String::new()
                } else {
                    format!("  errors={:?}", s.errors)
                }
            );
        }
    }

    if !json {
        for event in events.try_iter() {
            println!("{} ({}) attendance is recorded", event.name, event.id);
        }
        let snapshot = engine.roster().snapshot();
        println!(
            "{} of {} students present",
            snapshot.iter().filter(|e| e.attended).count(),
            snapshot.len()
        );
    }
    Ok(())
}
