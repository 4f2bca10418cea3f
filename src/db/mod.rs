//! db — хэндл реплицируемой БД и движок синхронизации.
//!
//! Разделение по подмодулям:
//! - core.rs       — структура Db, деривация путей, контрольная сумма файла БД,
//!                   UpdatedAt, типы ошибок
//! - open.rs       — open()/close(): meta-корень, LOCK, восстановление позиции,
//!                   запуск/остановка монитора
//! - sync.rs       — один тик машины состояний: read-lock, сверка заголовков,
//!                   докопирование кадров, обновление позиции
//! - checkpoint.rs — режимы чекпоинта и политика его запуска

pub mod checkpoint;
pub mod core;
pub mod open;
pub mod sync;

pub use checkpoint::CheckpointMode;
pub use core::{Db, WalModeRequired};
