//! shadow — теневой каталог: поколения и нумерованные сегменты WAL.
//!
//! Раскладка под meta-корнем (<dir(P)>/.<base(P)>-litestream/):
//! - generation                     — id текущего поколения (16 hex);
//! - generations/<id>/wal/<index:016x>.wal — сегменты, байт-в-байт копии префикса
//!   сессии настоящего WAL (32-байтовый заголовок + целое число кадров).
//!
//! Политика:
//! - Файл `generation` пишется атомарно: tmp + rename + fsync родительского
//!   каталога. Сегмент 0 нового поколения попадает на диск ДО переключения
//!   `generation`, так что файл никогда не указывает на пустое поколение.
//! - Чужие имена в каталогах сегментов игнорируются при листинге.
//! - Пишет сюда только движок синхронизации; читатели не мутируют.

use anyhow::{anyhow, Context, Result};
use log::warn;
use rand::RngCore;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::consts::{
    GENERATIONS_DIR, GENERATION_ID_LEN, GENERATION_NAME_FILE, SHADOW_WAL_DIR, SHADOW_WAL_EXT,
    WAL_HEADER_SIZE,
};
use crate::util::{fsync_dir, hex_encode, is_hex_id};

/// Хранилище теневого WAL. Никакого знания о SQLite: только файлы и каталоги.
#[derive(Debug, Clone)]
pub struct ShadowStore {
    root: PathBuf,
}

impl ShadowStore {
    /// Конструктор без I/O.
    pub fn new(meta_root: impl Into<PathBuf>) -> Self {
        Self {
            root: meta_root.into(),
        }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    // -------- чистые path-хелперы --------

    pub fn generation_name_path(&self) -> PathBuf {
        self.root.join(GENERATION_NAME_FILE)
    }

    pub fn generation_path(&self, generation: &str) -> PathBuf {
        self.root.join(GENERATIONS_DIR).join(generation)
    }

    pub fn segment_dir(&self, generation: &str) -> PathBuf {
        self.generation_path(generation).join(SHADOW_WAL_DIR)
    }

    pub fn segment_path(&self, generation: &str, index: u64) -> PathBuf {
        self.segment_dir(generation)
            .join(format!("{:016x}.{}", index, SHADOW_WAL_EXT))
    }

    // -------- операции --------

    /// Создать meta-корень, если его нет.
    pub fn ensure_root(&self) -> Result<()> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("create meta root {}", self.root.display()))
    }

    /// Текущее поколение из файла `generation`.
    /// None — файла нет либо содержимое не похоже на id (мусор после сбоя
    /// трактуем как отсутствие: откат в новое поколение безопаснее ремонта).
    pub fn current_generation(&self) -> Result<Option<String>> {
        let path = self.generation_name_path();
        let raw = match fs::read_to_string(&path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("read generation {}", path.display()))
            }
        };
        let id = raw.trim();
        if !is_hex_id(id, GENERATION_ID_LEN) {
            warn!(
                "shadow: malformed generation file {} ({:?}), treating as absent",
                path.display(),
                raw
            );
            return Ok(None);
        }
        Ok(Some(id.to_string()))
    }

    /// Начать новое поколение: свежий id, каталог, сегмент 0 с копией заголовка
    /// настоящего WAL, затем атомарное переключение файла `generation`.
    pub fn create_generation(&self, wal_header: &[u8]) -> Result<String> {
        let id = generate_id();
        let dir = self.segment_dir(&id);
        fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        self.create_segment(&id, 0, wal_header)?;
        self.set_current_generation(&id)?;
        Ok(id)
    }

    /// Атомарная замена файла `generation` (tmp + rename + fsync каталога).
    pub fn set_current_generation(&self, generation: &str) -> Result<()> {
        if !is_hex_id(generation, GENERATION_ID_LEN) {
            return Err(anyhow!("bad generation id {:?}", generation));
        }
        let path = self.generation_name_path();
        let tmp = self.root.join(format!("{}.tmp", GENERATION_NAME_FILE));
        let _ = fs::remove_file(&tmp); // best-effort

        let mut f = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)
            .with_context(|| format!("open generation tmp {}", tmp.display()))?;
        f.write_all(generation.as_bytes())?;
        f.sync_all()?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
        let _ = fsync_dir(&path);
        Ok(())
    }

    /// Отсортированные индексы сегментов поколения. Имена, не являющиеся
    /// <016x>.wal, пропускаются.
    pub fn list_segment_indexes(&self, generation: &str) -> Result<Vec<u64>> {
        let dir = self.segment_dir(generation);
        let entries = fs::read_dir(&dir).with_context(|| format!("read {}", dir.display()))?;
        let mut out = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some(stem) = name.strip_suffix(&format!(".{}", SHADOW_WAL_EXT)) else {
                continue;
            };
            if stem.len() != 16 {
                continue;
            }
            if let Ok(index) = u64::from_str_radix(stem, 16) {
                out.push(index);
            }
        }
        out.sort_unstable();
        Ok(out)
    }

    /// Все известные поколения (отсортированные id); отсутствие каталога — пусто.
    pub fn list_generations(&self) -> Result<Vec<String>> {
        let dir = self.root.join(GENERATIONS_DIR);
        let entries = match fs::read_dir(&dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("read {}", dir.display())),
        };
        let mut out = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_hex_id(&name, GENERATION_ID_LEN) {
                out.push(name);
            }
        }
        out.sort_unstable();
        Ok(out)
    }

    pub fn segment_len(&self, generation: &str, index: u64) -> Result<u64> {
        let path = self.segment_path(generation, index);
        Ok(fs::metadata(&path)
            .with_context(|| format!("stat {}", path.display()))?
            .len())
    }

    pub fn read_segment(&self, generation: &str, index: u64) -> Result<Vec<u8>> {
        let path = self.segment_path(generation, index);
        fs::read(&path).with_context(|| format!("read {}", path.display()))
    }

    /// Создать сегмент, записав в него 32-байтовый заголовок WAL. fsync файла
    /// и каталога до возврата — сегмент либо есть целиком, либо его нет.
    pub fn create_segment(&self, generation: &str, index: u64, wal_header: &[u8]) -> Result<()> {
        if wal_header.len() != WAL_HEADER_SIZE as usize {
            return Err(anyhow!(
                "wal header must be {} bytes, got {}",
                WAL_HEADER_SIZE,
                wal_header.len()
            ));
        }
        let path = self.segment_path(generation, index);
        let mut f = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("create segment {}", path.display()))?;
        f.write_all(wal_header)?;
        f.sync_all()?;
        let _ = fsync_dir(&path);
        Ok(())
    }

    /// Дописать байты в хвост сегмента и fsync. Возвращает новую длину файла.
    pub fn append_to_segment(&self, generation: &str, index: u64, bytes: &[u8]) -> Result<u64> {
        let path = self.segment_path(generation, index);
        let mut f = OpenOptions::new()
            .append(true)
            .open(&path)
            .with_context(|| format!("open segment {}", path.display()))?;
        f.write_all(bytes)?;
        f.sync_all()?;
        Ok(f.metadata()?.len())
    }

    /// Усечь сегмент до `len` (только для сброса порванного хвоста после сбоя).
    pub fn truncate_segment(&self, generation: &str, index: u64, len: u64) -> Result<()> {
        let path = self.segment_path(generation, index);
        let f = OpenOptions::new()
            .write(true)
            .open(&path)
            .with_context(|| format!("open segment {}", path.display()))?;
        f.set_len(len)?;
        f.sync_all()?;
        Ok(())
    }
}

/// Свежий id поколения: 8 случайных байт в hex (16 символов).
fn generate_id() -> String {
    let mut raw = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut raw);
    hex_encode(&raw)
}
