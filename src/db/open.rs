//! db/open — открытие и закрытие хэндла.
//!
//! open():
//! - создаёт meta-корень и берёт эксклюзивный LOCK (fs2): два репликатора на
//!   одной БД — ошибка, а не тихая порча теневого каталога;
//! - восстанавливает позицию с диска: файл `generation` + последний сегмент;
//!   порванный хвост сегмента усекается сразу до границы последнего валидного
//!   кадра (I1 держится уже на старте);
//! - запускает монитор, если monitor_interval > 0.
//!
//! close() идемпотентен: останавливает монитор, дожидается форвардеров,
//! закрывает SQLite-соединение и отпускает LOCK.

use anyhow::{Context, Result};
use fs2::FileExt;
use log::{info, warn};
use std::fs::OpenOptions;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use super::core::{Db, Engine, SyncState};
use crate::consts::LOCK_FILE;
use crate::metrics::record_shadow_truncation;
use crate::monitor::{spawn_monitor, Notifier};
use crate::pos::Position;
use crate::shadow::ShadowStore;
use crate::walfile::verify_chain;

impl Db {
    /// Открыть хэндл: meta-корень, LOCK, восстановление позиции, монитор.
    pub fn open(&mut self) -> Result<()> {
        if self.engine.is_some() {
            return Ok(());
        }

        self.store.ensure_root()?;

        let lock_path = self.store.root().join(LOCK_FILE);
        let lock = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&lock_path)
            .with_context(|| format!("open lock file {}", lock_path.display()))?;
        lock.try_lock_exclusive().with_context(|| {
            format!(
                "another process is replicating {} (lock {})",
                self.path.display(),
                lock_path.display()
            )
        })?;

        let pos = recover_position(&self.store)?;
        if !pos.is_empty() {
            info!("db {}: resuming at {}", self.path.display(), pos);
        }

        let engine = Arc::new(Engine {
            db_path: self.path.clone(),
            wal_path: self.wal_path(),
            store: self.store.clone(),
            min_checkpoint_page_count: self.min_checkpoint_page_count,
            max_checkpoint_page_count: self.max_checkpoint_page_count,
            checkpoint_interval: self.checkpoint_interval,
            notifier: Notifier::new(),
            state: Mutex::new(SyncState {
                conn: None,
                wal_mode_verified: false,
                page_size: 0,
                pos,
                last_checkpoint_at: Instant::now(),
                _lock: lock,
            }),
        });

        if !self.monitor_interval.is_zero() {
            self.monitor = Some(spawn_monitor(engine.clone(), self.monitor_interval));
        }
        self.engine = Some(engine);
        Ok(())
    }

    /// Остановить монитор и освободить ресурсы. Повторный вызов — no-op.
    pub fn close(&mut self) -> Result<()> {
        if let Some(mut monitor) = self.monitor.take() {
            monitor.stop();
        }
        if let Some(engine) = self.engine.take() {
            engine.notifier().shutdown();
            let mut st = engine.state.lock().unwrap();
            st.conn = None; // закрывает соединение; LOCK отпустится с движком
        }
        Ok(())
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        // Ошибки в Drop игнорируем.
        let _ = self.close();
    }
}

/// Позиция из файлов теневого каталога. Любая невозможность дочитаться до
/// валидного сегмента даёт пустую позицию: следующий sync начнёт новое
/// поколение вместо ремонта.
fn recover_position(store: &ShadowStore) -> Result<Position> {
    let Some(generation) = store.current_generation()? else {
        return Ok(Position::default());
    };
    let indexes = match store.list_segment_indexes(&generation) {
        Ok(v) => v,
        Err(_) => return Ok(Position::default()),
    };
    let Some(&index) = indexes.last() else {
        return Ok(Position::default());
    };
    let bytes = match store.read_segment(&generation, index) {
        Ok(b) => b,
        Err(_) => return Ok(Position::default()),
    };
    let hdr = match crate::walfile::read_header(&bytes) {
        Ok(h) if h.page_size.is_power_of_two() && (512..=65_536).contains(&h.page_size) => h,
        _ => {
            warn!(
                "shadow segment {} of generation {} has no readable header, position reset",
                index, generation
            );
            return Ok(Position::default());
        }
    };
    // Err здесь невозможен: заголовок уже проверен выше.
    let info = match verify_chain(&bytes, hdr.page_size) {
        Ok(info) => info,
        Err(_) => return Ok(Position::default()),
    };
    if info.valid_len < bytes.len() as u64 {
        warn!(
            "shadow segment {} of generation {}: truncating torn tail {} -> {} bytes",
            index,
            generation,
            bytes.len(),
            info.valid_len
        );
        store.truncate_segment(&generation, index, info.valid_len)?;
        record_shadow_truncation();
    }
    Ok(Position::new(generation, index, info.valid_len))
}
