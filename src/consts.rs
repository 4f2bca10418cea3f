//! Общие константы: формат SQLite WAL, раскладка теневого каталога, дефолты тюнинга.

// -------- SQLite WAL --------

/// Размер заголовка WAL-файла (байт).
pub const WAL_HEADER_SIZE: u64 = 32;
/// Размер заголовка кадра WAL (байт).
pub const WAL_FRAME_HEADER_SIZE: u64 = 24;

// Magic заголовка WAL. Младший бит выбирает порядок 32-битных слов
// при вычислении контрольной суммы: 0 => little-endian, 1 => big-endian.
pub const WAL_MAGIC_CKSUM_LE: u32 = 0x377f_0682;
pub const WAL_MAGIC_CKSUM_BE: u32 = 0x377f_0683;
pub const WAL_MAGIC_MASK: u32 = 0xffff_fffe;

/// Версия формата WAL (поле version заголовка).
pub const WAL_FORMAT_VERSION: u32 = 3_007_000;

// Offsets внутри 32-байтового заголовка WAL (все поля u32 BE):
// [magic][version][page_size][checkpoint_seq][salt1][salt2][cksum1][cksum2]
pub const WAL_HDR_OFF_MAGIC: usize = 0;
pub const WAL_HDR_OFF_VERSION: usize = 4;
pub const WAL_HDR_OFF_PAGE_SIZE: usize = 8;
pub const WAL_HDR_OFF_CHECKPOINT_SEQ: usize = 12;
pub const WAL_HDR_OFF_SALT1: usize = 16;
pub const WAL_HDR_OFF_SALT2: usize = 20;
pub const WAL_HDR_OFF_CKSUM1: usize = 24;
pub const WAL_HDR_OFF_CKSUM2: usize = 28;

// Offsets внутри 24-байтового заголовка кадра (все поля u32 BE):
// [page_no][db_size][salt1][salt2][cksum1][cksum2]
pub const WAL_FRAME_OFF_PAGE_NO: usize = 0;
pub const WAL_FRAME_OFF_DB_SIZE: usize = 4;
pub const WAL_FRAME_OFF_SALT1: usize = 8;
pub const WAL_FRAME_OFF_SALT2: usize = 12;
pub const WAL_FRAME_OFF_CKSUM1: usize = 16;
pub const WAL_FRAME_OFF_CKSUM2: usize = 20;

// -------- Заголовок основной БД --------

/// Offset поля page_size в заголовке БД (u16 BE; значение 1 означает 65536).
pub const DB_HDR_PAGE_SIZE_OFFSET: u64 = 16;

// -------- Теневой каталог --------

// Раскладка (стабильная, см. ShadowStore):
// <dir(P)>/.<base(P)>-litestream/
//     generation                   текущий id поколения (16 hex)
//     generations/<id>/wal/<index:016x>.wal
pub const META_DIR_SUFFIX: &str = "-litestream";
pub const GENERATION_NAME_FILE: &str = "generation";
pub const GENERATIONS_DIR: &str = "generations";
pub const SHADOW_WAL_DIR: &str = "wal";
pub const SHADOW_WAL_EXT: &str = "wal";
pub const LOCK_FILE: &str = "LOCK";

/// Длина id поколения в hex-символах (8 случайных байт).
pub const GENERATION_ID_LEN: usize = 16;

// -------- Тюнинг по умолчанию --------

pub const DEFAULT_MONITOR_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_MIN_CHECKPOINT_PAGES: u64 = 1_000;
pub const DEFAULT_MAX_CHECKPOINT_PAGES: u64 = 10_000;
pub const DEFAULT_CHECKPOINT_INTERVAL_MS: u64 = 60_000;

/// busy_timeout для SQLite-соединения (мс).
pub const SQLITE_BUSY_TIMEOUT_MS: u64 = 1_000;
