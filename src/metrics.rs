//! Lightweight global metrics for walstream.
//!
//! Потокобезопасные атомарные счётчики по подсистемам:
//! - Sync engine (тики, ошибки, скопированные кадры/байты)
//! - Shadow store (роллы сегментов, новые поколения, усечения хвостов)
//! - Checkpoint (по режимам)
//! - Monitor (опубликованные позиции)

use std::sync::atomic::{AtomicU64, Ordering};

// ----- Sync engine -----
static SYNC_TICKS: AtomicU64 = AtomicU64::new(0);
static SYNC_ERRORS: AtomicU64 = AtomicU64::new(0);
static WAL_FRAMES_COPIED: AtomicU64 = AtomicU64::new(0);
static WAL_BYTES_COPIED: AtomicU64 = AtomicU64::new(0);

// ----- Shadow store -----
static SEGMENT_ROLLOVERS: AtomicU64 = AtomicU64::new(0);
static GENERATIONS_STARTED: AtomicU64 = AtomicU64::new(0);
static SHADOW_TRUNCATIONS: AtomicU64 = AtomicU64::new(0);

// ----- Checkpoint -----
static CHECKPOINTS_PASSIVE: AtomicU64 = AtomicU64::new(0);
static CHECKPOINTS_RESTART: AtomicU64 = AtomicU64::new(0);
static CHECKPOINTS_TRUNCATE: AtomicU64 = AtomicU64::new(0);

// ----- Monitor -----
static POSITIONS_PUBLISHED: AtomicU64 = AtomicU64::new(0);

pub fn record_sync_tick() {
    SYNC_TICKS.fetch_add(1, Ordering::Relaxed);
}

pub fn record_sync_error() {
    SYNC_ERRORS.fetch_add(1, Ordering::Relaxed);
}

pub fn record_frames_copied(frames: u64, bytes: u64) {
    WAL_FRAMES_COPIED.fetch_add(frames, Ordering::Relaxed);
    WAL_BYTES_COPIED.fetch_add(bytes, Ordering::Relaxed);
}

pub fn record_segment_rollover() {
    SEGMENT_ROLLOVERS.fetch_add(1, Ordering::Relaxed);
}

pub fn record_generation_started() {
    GENERATIONS_STARTED.fetch_add(1, Ordering::Relaxed);
}

pub fn record_shadow_truncation() {
    SHADOW_TRUNCATIONS.fetch_add(1, Ordering::Relaxed);
}

pub fn record_checkpoint_passive() {
    CHECKPOINTS_PASSIVE.fetch_add(1, Ordering::Relaxed);
}

pub fn record_checkpoint_restart() {
    CHECKPOINTS_RESTART.fetch_add(1, Ordering::Relaxed);
}

pub fn record_checkpoint_truncate() {
    CHECKPOINTS_TRUNCATE.fetch_add(1, Ordering::Relaxed);
}

pub fn record_position_published() {
    POSITIONS_PUBLISHED.fetch_add(1, Ordering::Relaxed);
}

/// Снимок всех счётчиков (для status/CLI и тестов).
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub sync_ticks: u64,
    pub sync_errors: u64,
    pub wal_frames_copied: u64,
    pub wal_bytes_copied: u64,
    pub segment_rollovers: u64,
    pub generations_started: u64,
    pub shadow_truncations: u64,
    pub checkpoints_passive: u64,
    pub checkpoints_restart: u64,
    pub checkpoints_truncate: u64,
    pub positions_published: u64,
}

pub fn metrics_snapshot() -> MetricsSnapshot {
    MetricsSnapshot {
        sync_ticks: SYNC_TICKS.load(Ordering::Relaxed),
        sync_errors: SYNC_ERRORS.load(Ordering::Relaxed),
        wal_frames_copied: WAL_FRAMES_COPIED.load(Ordering::Relaxed),
        wal_bytes_copied: WAL_BYTES_COPIED.load(Ordering::Relaxed),
        segment_rollovers: SEGMENT_ROLLOVERS.load(Ordering::Relaxed),
        generations_started: GENERATIONS_STARTED.load(Ordering::Relaxed),
        shadow_truncations: SHADOW_TRUNCATIONS.load(Ordering::Relaxed),
        checkpoints_passive: CHECKPOINTS_PASSIVE.load(Ordering::Relaxed),
        checkpoints_restart: CHECKPOINTS_RESTART.load(Ordering::Relaxed),
        checkpoints_truncate: CHECKPOINTS_TRUNCATE.load(Ordering::Relaxed),
        positions_published: POSITIONS_PUBLISHED.load(Ordering::Relaxed),
    }
}
