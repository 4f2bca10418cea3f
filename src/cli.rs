//! cli — тонкая обёртка над движком: запуск репликации и инспекция состояния.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::StreamConfig;
use crate::db::{CheckpointMode, Db};
use crate::monitor::Replica;
use crate::pos::Position;

#[derive(Parser, Debug)]
#[command(
    name = "walstream",
    version,
    about = "Continuous SQLite replication by shadowing the write-ahead log",
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
pub enum Cmd {
    /// Непрерывная репликация одной или нескольких БД (до прерывания процесса).
    Replicate {
        #[arg(long, required = true, num_args = 1..)]
        path: Vec<PathBuf>,
        /// Период монитора в мс (default из WALSTREAM_MONITOR_INTERVAL_MS или 1000).
        #[arg(long)]
        interval_ms: Option<u64>,
    },
    /// Один тик синхронизации.
    Sync {
        #[arg(long)]
        path: PathBuf,
    },
    /// Текущая позиция репликации.
    Pos {
        #[arg(long)]
        path: PathBuf,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Список поколений теневого каталога.
    Generations {
        #[arg(long)]
        path: PathBuf,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Ручной чекпоинт (passive | restart | truncate).
    Checkpoint {
        #[arg(long)]
        path: PathBuf,
        #[arg(long, default_value = "passive")]
        mode: String,
    },
}

/// Лог-транспорт: просто печатает принятые позиции.
struct LogReplica {
    name: String,
}

impl Replica for LogReplica {
    fn name(&self) -> &str {
        &self.name
    }

    fn notify(&self, pos: &Position) {
        info!("{}: pos {}", self.name, pos);
    }
}

#[derive(Serialize)]
struct PosReport {
    generation: String,
    index: u64,
    offset: u64,
    page_size: u32,
}

#[derive(Serialize)]
struct GenerationsReport {
    current: Option<String>,
    generations: Vec<String>,
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.cmd {
        Cmd::Replicate { path, interval_ms } => cmd_replicate(path, interval_ms),
        Cmd::Sync { path } => cmd_sync(path),
        Cmd::Pos { path, json } => cmd_pos(path, json),
        Cmd::Generations { path, json } => cmd_generations(path, json),
        Cmd::Checkpoint { path, mode } => cmd_checkpoint(path, mode),
    }
}

fn cmd_replicate(paths: Vec<PathBuf>, interval_ms: Option<u64>) -> Result<()> {
    let mut cfg = StreamConfig::from_env();
    if let Some(ms) = interval_ms {
        cfg.monitor_interval = Duration::from_millis(ms);
    }
    if cfg.monitor_interval.is_zero() {
        anyhow::bail!("replicate requires a non-zero monitor interval");
    }

    let mut dbs = Vec::new();
    for path in paths {
        let mut db = Db::with_config(&path, &cfg);
        db.open()
            .with_context(|| format!("open {}", path.display()))?;
        db.subscribe(Arc::new(LogReplica {
            name: format!("log:{}", path.display()),
        }))?;
        info!("replicating {} every {:?}", path.display(), cfg.monitor_interval);
        dbs.push(db);
    }

    // Мониторы работают в фоне; процесс живёт до прерывания снаружи.
    loop {
        std::thread::sleep(Duration::from_secs(3600));
    }
}

fn cmd_sync(path: PathBuf) -> Result<()> {
    let mut db = open_foreground(&path)?;
    db.sync()?;
    println!("{}", db.pos());
    db.close()
}

fn cmd_pos(path: PathBuf, json: bool) -> Result<()> {
    let mut db = open_foreground(&path)?;
    let pos = db.pos();
    if json {
        let report = PosReport {
            generation: pos.generation.clone(),
            index: pos.index,
            offset: pos.offset,
            page_size: db.page_size(),
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", pos);
    }
    db.close()
}

fn cmd_generations(path: PathBuf, json: bool) -> Result<()> {
    let mut db = open_foreground(&path)?;
    let current = db.store.current_generation()?;
    let generations = db.generations()?;
    if json {
        let report = GenerationsReport {
            current,
            generations,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for generation in &generations {
            let marker = if Some(generation) == current.as_ref() {
                "*"
            } else {
                " "
            };
            println!("{} {}", marker, generation);
        }
    }
    db.close()
}

fn cmd_checkpoint(path: PathBuf, mode: String) -> Result<()> {
    let mode: CheckpointMode = mode.parse()?;
    let mut db = open_foreground(&path)?;
    db.checkpoint(mode)?;
    db.close()
}

/// Открыть хэндл без фонового монитора (одноразовые команды).
fn open_foreground(path: &PathBuf) -> Result<Db> {
    let mut db = Db::new(path);
    db.monitor_interval = Duration::ZERO;
    db.open().with_context(|| format!("open {}", path.display()))?;
    Ok(db)
}
