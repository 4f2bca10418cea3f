//! db/checkpoint — режимы чекпоинта и политика его запуска.
//!
//! Политика (по числу кадров в настоящем WAL и времени):
//! - frame_count >= max_checkpoint_page_count           => TRUNCATE;
//! - прошло checkpoint_interval и есть хоть один кадр   => TRUNCATE;
//! - frame_count >= min_checkpoint_page_count           => PASSIVE.
//!
//! PASSIVE не трогает salt'ы и не рождает новый сегмент; TRUNCATE обнуляет
//! WAL, и следующий тик увидит смену salt'ов и перейдёт на следующий сегмент.
//! Чекпоинт никогда не исполняется под нашей read-блокировкой.

use anyhow::{anyhow, Result};
use log::debug;
use rusqlite::Connection;
use std::fmt;
use std::str::FromStr;
use std::time::Instant;

use super::core::{Engine, SyncState};
use crate::consts::{WAL_FRAME_HEADER_SIZE, WAL_HEADER_SIZE};
use crate::metrics::{
    record_checkpoint_passive, record_checkpoint_restart, record_checkpoint_truncate,
};

/// Режим PRAGMA wal_checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointMode {
    Passive,
    Restart,
    Truncate,
}

impl CheckpointMode {
    pub fn as_sql(&self) -> &'static str {
        match self {
            CheckpointMode::Passive => "PASSIVE",
            CheckpointMode::Restart => "RESTART",
            CheckpointMode::Truncate => "TRUNCATE",
        }
    }
}

impl fmt::Display for CheckpointMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

impl FromStr for CheckpointMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "passive" => Ok(CheckpointMode::Passive),
            "restart" => Ok(CheckpointMode::Restart),
            "truncate" => Ok(CheckpointMode::Truncate),
            other => Err(anyhow!("unknown checkpoint mode {:?}", other)),
        }
    }
}

impl Engine {
    /// Ручной чекпоинт (вне read-блокировки движка).
    pub(crate) fn checkpoint(&self, mode: CheckpointMode) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        if !self.db_path.exists() {
            return Err(anyhow!("database {} does not exist", self.db_path.display()));
        }
        self.ensure_conn(&mut st)?;
        let conn = st
            .conn
            .take()
            .ok_or_else(|| anyhow!("sqlite connection missing"))?;
        let res = self.checkpoint_with_conn(&conn, &mut st, mode);
        st.conn = Some(conn);
        res
    }

    /// Шаг G тика: решить, нужен ли чекпоинт, и выполнить его.
    pub(crate) fn maybe_checkpoint(&self, conn: &Connection, st: &mut SyncState) -> Result<()> {
        if st.page_size == 0 {
            return Ok(());
        }
        let wal_len = match std::fs::metadata(&self.wal_path) {
            Ok(meta) => meta.len(),
            Err(_) => return Ok(()),
        };
        let frame_size = WAL_FRAME_HEADER_SIZE + st.page_size as u64;
        let frame_count = if wal_len > WAL_HEADER_SIZE {
            (wal_len - WAL_HEADER_SIZE) / frame_size
        } else {
            0
        };

        let mode = if frame_count >= self.max_checkpoint_page_count {
            Some(CheckpointMode::Truncate)
        } else if frame_count > 0 && st.last_checkpoint_at.elapsed() >= self.checkpoint_interval {
            Some(CheckpointMode::Truncate)
        } else if frame_count >= self.min_checkpoint_page_count {
            Some(CheckpointMode::Passive)
        } else {
            None
        };

        match mode {
            Some(mode) => self.checkpoint_with_conn(conn, st, mode),
            None => Ok(()),
        }
    }

    fn checkpoint_with_conn(
        &self,
        conn: &Connection,
        st: &mut SyncState,
        mode: CheckpointMode,
    ) -> Result<()> {
        let sql = format!("PRAGMA wal_checkpoint({})", mode.as_sql());
        let (busy, wal_frames, moved): (i64, i64, i64) =
            conn.query_row(&sql, [], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?;
        if busy != 0 {
            // Конкуренция с читателями/писателями; следующий тик повторит.
            return Err(anyhow!(
                "wal_checkpoint({}) busy on {}",
                mode,
                self.db_path.display()
            ));
        }
        st.last_checkpoint_at = Instant::now();
        match mode {
            CheckpointMode::Passive => record_checkpoint_passive(),
            CheckpointMode::Restart => record_checkpoint_restart(),
            CheckpointMode::Truncate => record_checkpoint_truncate(),
        }
        debug!(
            "db {}: checkpoint {} moved {} of {} frame(s)",
            self.db_path.display(),
            mode,
            moved,
            wal_frames
        );
        Ok(())
    }
}
