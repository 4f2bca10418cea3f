//! db/core — хэндл Db: деривация путей, состояние движка, файловые проверки.
//!
//! Db::new не делает I/O: все пути — чистые функции от пути к БД. Движок
//! (Engine) появляется в open() и живёт в Arc, чтобы монитор-поток разделял
//! его с хэндлом. Все вызовы sync()/checkpoint() сериализуются мьютексом
//! состояния — на хэндл в каждый момент работает ровно один тик.

use anyhow::{anyhow, Context, Result};
use crc::{Crc, CRC_64_GO_ISO};
use rusqlite::Connection;
use std::fmt;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use crate::config::StreamConfig;
use crate::consts::{
    DEFAULT_CHECKPOINT_INTERVAL_MS, DEFAULT_MAX_CHECKPOINT_PAGES, DEFAULT_MIN_CHECKPOINT_PAGES,
    DEFAULT_MONITOR_INTERVAL_MS, META_DIR_SUFFIX,
};
use crate::monitor::{MonitorHandle, Notifier, Replica};
use crate::pos::Position;
use crate::shadow::ShadowStore;
use crate::util::open_ro;

/// CRC-64/GO-ISO по файлу основной БД (внешние проверки целостности).
const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_GO_ISO);

/// БД не в журнальном режиме WAL. Фатально, пока оператор не переключит режим.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalModeRequired;

impl fmt::Display for WalModeRequired {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "database is not in wal journal mode")
    }
}

impl std::error::Error for WalModeRequired {}

/// Хэндл одной реплицируемой БД.
///
/// Тюнинг — публичные поля, читаются в open(); менять их после open()
/// бессмысленно (монитор уже запущен со старыми значениями).
pub struct Db {
    pub(crate) path: PathBuf,
    pub(crate) store: ShadowStore,

    /// Период монитора; Duration::ZERO выключает фоновый цикл.
    pub monitor_interval: Duration,
    /// Порог PASSIVE-чекпоинта (кадров в настоящем WAL).
    pub min_checkpoint_page_count: u64,
    /// Порог TRUNCATE-чекпоинта.
    pub max_checkpoint_page_count: u64,
    /// Принудительный чекпоинт по времени.
    pub checkpoint_interval: Duration,

    pub(crate) engine: Option<Arc<Engine>>,
    pub(crate) monitor: Option<MonitorHandle>,
}

impl Db {
    /// Новый хэндл; никакого I/O.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let store = ShadowStore::new(meta_path_of(&path));
        Self {
            path,
            store,
            monitor_interval: Duration::from_millis(DEFAULT_MONITOR_INTERVAL_MS),
            min_checkpoint_page_count: DEFAULT_MIN_CHECKPOINT_PAGES,
            max_checkpoint_page_count: DEFAULT_MAX_CHECKPOINT_PAGES,
            checkpoint_interval: Duration::from_millis(DEFAULT_CHECKPOINT_INTERVAL_MS),
            engine: None,
            monitor: None,
        }
    }

    /// Хэндл с тюнингом из конфига.
    pub fn with_config(path: impl Into<PathBuf>, cfg: &StreamConfig) -> Self {
        let mut db = Self::new(path);
        db.monitor_interval = cfg.monitor_interval;
        db.min_checkpoint_page_count = cfg.min_checkpoint_page_count;
        db.max_checkpoint_page_count = cfg.max_checkpoint_page_count;
        db.checkpoint_interval = cfg.checkpoint_interval;
        db
    }

    // -------- чистая деривация путей --------

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Путь настоящего WAL: <P>-wal (конкатенация, не замена расширения).
    pub fn wal_path(&self) -> PathBuf {
        let mut s = self.path.as_os_str().to_os_string();
        s.push("-wal");
        PathBuf::from(s)
    }

    /// Meta-корень: <dir(P)>/.<base(P)>-litestream (для относительного P — рядом).
    pub fn meta_path(&self) -> PathBuf {
        self.store.root().to_path_buf()
    }

    pub fn generation_name_path(&self) -> PathBuf {
        self.store.generation_name_path()
    }

    pub fn generation_path(&self, generation: &str) -> PathBuf {
        self.store.generation_path(generation)
    }

    pub fn shadow_wal_dir(&self, generation: &str) -> PathBuf {
        self.store.segment_dir(generation)
    }

    pub fn shadow_wal_path(&self, generation: &str, index: u64) -> PathBuf {
        self.store.segment_path(generation, index)
    }

    // -------- состояние движка --------

    /// Текущая позиция; пустая до первого успешного sync (и до open()).
    pub fn pos(&self) -> Position {
        self.engine.as_ref().map(|e| e.pos()).unwrap_or_default()
    }

    /// Размер страницы БД; 0 до обнаружения.
    pub fn page_size(&self) -> u32 {
        self.engine.as_ref().map(|e| e.page_size()).unwrap_or(0)
    }

    /// Один тик машины состояний синхронизации.
    pub fn sync(&self) -> Result<()> {
        self.engine()?.sync()
    }

    /// Ручной чекпоинт заданного режима (вне read-lock).
    pub fn checkpoint(&self, mode: crate::db::CheckpointMode) -> Result<()> {
        self.engine()?.checkpoint(mode)
    }

    /// Подписать транспорт реплики на обновления позиции.
    pub fn subscribe(&self, replica: Arc<dyn Replica>) -> Result<()> {
        self.engine()?.notifier().attach(replica);
        Ok(())
    }

    /// Известные поколения (отсортированные id), текущее — generation_name_path.
    pub fn generations(&self) -> Result<Vec<String>> {
        self.store.list_generations()
    }

    pub(crate) fn engine(&self) -> Result<&Arc<Engine>> {
        self.engine
            .as_ref()
            .ok_or_else(|| anyhow!("db {} is not open", self.path.display()))
    }

    // -------- файловые проверки (не требуют open()) --------

    /// max(mtime(P), mtime(P-wal)); io NotFound, если нет ни того, ни другого.
    pub fn updated_at(&self) -> Result<SystemTime> {
        let mut latest: Option<SystemTime> = None;
        for path in [self.path.clone(), self.wal_path()] {
            match fs::metadata(&path) {
                Ok(meta) => {
                    let mtime = meta.modified()?;
                    latest = Some(latest.map_or(mtime, |t: SystemTime| t.max(mtime)));
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e).with_context(|| format!("stat {}", path.display())),
            }
        }
        latest.ok_or_else(|| {
            anyhow::Error::new(io::Error::new(
                io::ErrorKind::NotFound,
                format!("database {} does not exist", self.path.display()),
            ))
        })
    }

    /// CRC-64/GO-ISO и размер файла БД (WAL не учитывается: изменения,
    /// оставшиеся в WAL, сумму не двигают — её двигает чекпоинт).
    pub fn crc64(&self) -> Result<(u64, u64)> {
        let mut f = open_ro(&self.path)?;
        let mut digest = CRC64.digest();
        let mut buf = vec![0u8; 64 * 1024];
        let mut size = 0u64;
        loop {
            let n = f.read(&mut buf)?;
            if n == 0 {
                break;
            }
            digest.update(&buf[..n]);
            size += n as u64;
        }
        Ok((digest.finalize(), size))
    }
}

/// <dir(P)>/.<base(P)>-litestream; чистая функция от P.
pub(crate) fn meta_path_of(path: &Path) -> PathBuf {
    let base = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = format!(".{}{}", base, META_DIR_SUFFIX);
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.join(name),
        _ => PathBuf::from(name),
    }
}

/// Движок синхронизации: всё разделяемое с монитор-потоком.
pub(crate) struct Engine {
    pub(crate) db_path: PathBuf,
    pub(crate) wal_path: PathBuf,
    pub(crate) store: ShadowStore,
    pub(crate) min_checkpoint_page_count: u64,
    pub(crate) max_checkpoint_page_count: u64,
    pub(crate) checkpoint_interval: Duration,
    pub(crate) notifier: Notifier,
    pub(crate) state: Mutex<SyncState>,
}

/// Мутабельное состояние под мьютексом: ровно один тик за раз.
pub(crate) struct SyncState {
    pub(crate) conn: Option<Connection>,
    /// Режим WAL подтверждён (кэшируется только успех).
    pub(crate) wal_mode_verified: bool,
    /// 0 — ещё не обнаружен.
    pub(crate) page_size: u32,
    pub(crate) pos: Position,
    pub(crate) last_checkpoint_at: Instant,
    /// Эксклюзивный LOCK meta-корня (fs2); держим дескриптор до close().
    pub(crate) _lock: fs::File,
}

impl Engine {
    pub(crate) fn pos(&self) -> Position {
        self.state.lock().unwrap().pos.clone()
    }

    pub(crate) fn page_size(&self) -> u32 {
        self.state.lock().unwrap().page_size
    }

    pub(crate) fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub(crate) fn notifier(&self) -> &Notifier {
        &self.notifier
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_path_for_absolute_and_relative() {
        assert_eq!(
            meta_path_of(Path::new("/tmp/db")),
            PathBuf::from("/tmp/.db-litestream")
        );
        assert_eq!(meta_path_of(Path::new("db")), PathBuf::from(".db-litestream"));
        assert_eq!(
            meta_path_of(Path::new("sub/dir/db")),
            PathBuf::from("sub/dir/.db-litestream")
        );
    }
}
