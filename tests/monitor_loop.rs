use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use rusqlite::Connection;

use walstream::{Db, Position, Replica};

// ---------- helpers ----------

fn unique_root(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!("walstream-{}-{}-{}", prefix, pid, t))
}

fn open_sqlite(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(1))?;
    let _mode: String = conn.query_row("PRAGMA journal_mode = wal", [], |row| row.get(0))?;
    Ok(conn)
}

/// Транспорт-регистратор: складывает принятые позиции.
struct RecordingReplica {
    seen: Mutex<Vec<Position>>,
}

impl RecordingReplica {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
        })
    }

    fn positions(&self) -> Vec<Position> {
        self.seen.lock().unwrap().clone()
    }
}

impl Replica for RecordingReplica {
    fn name(&self) -> &str {
        "recording"
    }

    fn notify(&self, pos: &Position) {
        self.seen.lock().unwrap().push(pos.clone());
    }
}

// ---------- tests ----------

#[test]
fn monitor_publishes_latest_position() -> Result<()> {
    let root = unique_root("monitor");
    fs::create_dir_all(&root)?;
    let path = root.join("db");

    let mut db = Db::new(&path);
    db.monitor_interval = Duration::from_millis(25);
    db.open()?;

    let replica = RecordingReplica::new();
    db.subscribe(replica.clone())?;

    let conn = open_sqlite(&path)?;
    conn.execute("CREATE TABLE t (id INTEGER)", [])?;
    conn.execute("INSERT INTO t (id) VALUES (1)", [])?;

    // Ждём, пока фоновый цикл дотянется до записи.
    let mut waited = Duration::ZERO;
    while replica.positions().is_empty() && waited < Duration::from_secs(10) {
        std::thread::sleep(Duration::from_millis(20));
        waited += Duration::from_millis(20);
    }

    let seen = replica.positions();
    assert!(!seen.is_empty(), "monitor must publish at least one position");
    for pos in &seen {
        assert!(!pos.is_empty());
    }
    // Внутри одного поколения позиции не убывают.
    for pair in seen.windows(2) {
        if let Some(ord) = pair[0].cmp_same_generation(&pair[1]) {
            assert_ne!(ord, std::cmp::Ordering::Greater, "{} then {}", pair[0], pair[1]);
        }
    }

    db.close()?;

    // После close() публикаций больше нет.
    let count = replica.positions().len();
    conn.execute("INSERT INTO t (id) VALUES (2)", [])?;
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(replica.positions().len(), count);
    Ok(())
}

#[test]
fn close_is_idempotent_with_running_monitor() -> Result<()> {
    let root = unique_root("monitor-close");
    fs::create_dir_all(&root)?;

    let mut db = Db::new(&root.join("db"));
    db.monitor_interval = Duration::from_millis(10);
    db.open()?;

    db.close()?;
    db.close()?;
    Ok(())
}

#[test]
fn second_open_handle_is_rejected_by_lock() -> Result<()> {
    let root = unique_root("monitor-lock");
    fs::create_dir_all(&root)?;
    let path = root.join("db");

    let mut first = Db::new(&path);
    first.monitor_interval = Duration::ZERO;
    first.open()?;

    let mut second = Db::new(&path);
    second.monitor_interval = Duration::ZERO;
    assert!(second.open().is_err(), "meta root LOCK must be exclusive");

    first.close()?;

    // После освобождения LOCK открытие проходит.
    let mut third = Db::new(&path);
    third.monitor_interval = Duration::ZERO;
    third.open()?;
    third.close()?;
    Ok(())
}
