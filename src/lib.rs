// Базовые модули
pub mod config;
pub mod consts;
pub mod metrics;
pub mod util;

// Ядро: чтение WAL, теневой каталог, позиция
pub mod pos;
pub mod shadow;
pub mod walfile; // src/walfile/{mod,reader}.rs

// Движок и фоновый цикл
pub mod db; // src/db/{mod,core,open,sync,checkpoint}.rs
pub mod monitor;

// CLI
pub mod cli;

// Удобные реэкспорты
pub use config::StreamConfig;
pub use db::{CheckpointMode, Db, WalModeRequired};
pub use monitor::Replica;
pub use pos::Position;
pub use shadow::ShadowStore;
