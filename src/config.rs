//! Centralized configuration for walstream.
//!
//! Цели:
//! - Одно место для тюнинга вместо разбросанных env-чтений.
//! - StreamConfig::from_env() читает WALSTREAM_*-переменные; builder-сеттеры
//!   позволяют переопределить конкретные поля программно.
//!
//! Поля покрывают политику чекпоинтов и период монитора; сам движок получает
//! их копии при создании хэндла (Db::with_config).

use std::fmt;
use std::time::Duration;

use crate::consts::{
    DEFAULT_CHECKPOINT_INTERVAL_MS, DEFAULT_MAX_CHECKPOINT_PAGES, DEFAULT_MIN_CHECKPOINT_PAGES,
    DEFAULT_MONITOR_INTERVAL_MS,
};

/// Конфигурация репликации одной БД.
#[derive(Clone, Debug)]
pub struct StreamConfig {
    /// Период фонового цикла sync. Zero — монитор выключен (тесты зовут sync() сами).
    /// Env: WALSTREAM_MONITOR_INTERVAL_MS (default 1000)
    pub monitor_interval: Duration,

    /// Порог PASSIVE-чекпоинта (кадров в настоящем WAL).
    /// Env: WALSTREAM_MIN_CHECKPOINT_PAGES (default 1000)
    pub min_checkpoint_page_count: u64,

    /// Порог TRUNCATE-чекпоинта (кадров в настоящем WAL).
    /// Env: WALSTREAM_MAX_CHECKPOINT_PAGES (default 10000)
    pub max_checkpoint_page_count: u64,

    /// Интервал принудительного чекпоинта по времени.
    /// Env: WALSTREAM_CHECKPOINT_INTERVAL_MS (default 60000)
    pub checkpoint_interval: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            monitor_interval: Duration::from_millis(DEFAULT_MONITOR_INTERVAL_MS),
            min_checkpoint_page_count: DEFAULT_MIN_CHECKPOINT_PAGES,
            max_checkpoint_page_count: DEFAULT_MAX_CHECKPOINT_PAGES,
            checkpoint_interval: Duration::from_millis(DEFAULT_CHECKPOINT_INTERVAL_MS),
        }
    }
}

impl StreamConfig {
    /// Конфигурация из окружения поверх дефолтов.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(ms) = read_env_u64("WALSTREAM_MONITOR_INTERVAL_MS") {
            cfg.monitor_interval = Duration::from_millis(ms);
        }
        if let Some(n) = read_env_u64("WALSTREAM_MIN_CHECKPOINT_PAGES") {
            cfg.min_checkpoint_page_count = n;
        }
        if let Some(n) = read_env_u64("WALSTREAM_MAX_CHECKPOINT_PAGES") {
            cfg.max_checkpoint_page_count = n;
        }
        if let Some(ms) = read_env_u64("WALSTREAM_CHECKPOINT_INTERVAL_MS") {
            cfg.checkpoint_interval = Duration::from_millis(ms);
        }

        cfg
    }

    // Fluent-сеттеры.

    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval = interval;
        self
    }

    pub fn with_min_checkpoint_page_count(mut self, n: u64) -> Self {
        self.min_checkpoint_page_count = n;
        self
    }

    pub fn with_max_checkpoint_page_count(mut self, n: u64) -> Self {
        self.max_checkpoint_page_count = n;
        self
    }

    pub fn with_checkpoint_interval(mut self, interval: Duration) -> Self {
        self.checkpoint_interval = interval;
        self
    }
}

impl fmt::Display for StreamConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "StreamConfig {{ monitor_interval: {:?}, min_checkpoint_page_count: {}, \
             max_checkpoint_page_count: {}, checkpoint_interval: {:?} }}",
            self.monitor_interval,
            self.min_checkpoint_page_count,
            self.max_checkpoint_page_count,
            self.checkpoint_interval,
        )
    }
}

fn read_env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok()?.trim().parse::<u64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let cfg = StreamConfig::default()
            .with_monitor_interval(Duration::from_millis(50))
            .with_min_checkpoint_page_count(10)
            .with_max_checkpoint_page_count(20)
            .with_checkpoint_interval(Duration::from_secs(5));
        assert_eq!(cfg.monitor_interval, Duration::from_millis(50));
        assert_eq!(cfg.min_checkpoint_page_count, 10);
        assert_eq!(cfg.max_checkpoint_page_count, 20);
        assert_eq!(cfg.checkpoint_interval, Duration::from_secs(5));
    }
}
