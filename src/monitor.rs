//! monitor — фоновый цикл sync() и доставка позиций подписчикам.
//!
//! Scope:
//! - Один поток-монитор на хэндл БД: каждые monitor_interval зовёт sync();
//!   успешный тик публикует текущую позицию.
//! - Доставка через одноместный слот на подписчика (latest-wins): публикация
//!   перезаписывает слот, форвардер-поток подписчика забирает последнее
//!   значение и зовёт notify(). Медленный транспорт видит меньше промежуточных
//!   позиций, но последнюю не теряет.
//!
//! Notes:
//! - notify() исполняется в потоке форвардера, не в потоке монитора; долгий
//!   транспорт не тормозит sync.
//! - Остановка (shutdown) добивает слот и дожидается форвардеров.

use log::{debug, warn};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::db::core::Engine;
use crate::metrics::{record_position_published, record_sync_error};
use crate::pos::Position;

/// Способности транспорта реплики: имя и приём позиции.
pub trait Replica: Send + Sync + 'static {
    fn name(&self) -> &str;
    fn notify(&self, pos: &Position);
}

#[derive(Default)]
struct SlotState {
    latest: Option<Position>,
    closed: bool,
}

/// Одноместный rendezvous: publish перезаписывает, take забирает последнее.
struct Slot {
    state: Mutex<SlotState>,
    cv: Condvar,
}

impl Slot {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SlotState::default()),
            cv: Condvar::new(),
        })
    }

    fn publish(&self, pos: &Position) {
        let mut st = self.state.lock().unwrap();
        st.latest = Some(pos.clone());
        self.cv.notify_one();
    }

    fn close(&self) {
        let mut st = self.state.lock().unwrap();
        st.closed = true;
        self.cv.notify_one();
    }

    /// None — слот закрыт и пуст (пора выходить).
    fn take(&self) -> Option<Position> {
        let mut st = self.state.lock().unwrap();
        loop {
            if let Some(pos) = st.latest.take() {
                return Some(pos);
            }
            if st.closed {
                return None;
            }
            st = self.cv.wait(st).unwrap();
        }
    }
}

struct Forwarder {
    slot: Arc<Slot>,
    thread: Option<JoinHandle<()>>,
}

/// Реестр подписчиков (живёт внутри движка).
pub(crate) struct Notifier {
    subs: Mutex<Vec<Forwarder>>,
}

impl Notifier {
    pub(crate) fn new() -> Self {
        Self {
            subs: Mutex::new(Vec::new()),
        }
    }

    /// Подключить транспорт: отдельный форвардер-поток со своим слотом.
    pub(crate) fn attach(&self, replica: Arc<dyn Replica>) {
        debug!("monitor: replica {} attached", replica.name());
        let slot = Slot::new();
        let thread_slot = slot.clone();
        let thread = std::thread::spawn(move || {
            while let Some(pos) = thread_slot.take() {
                replica.notify(&pos);
            }
        });
        self.subs.lock().unwrap().push(Forwarder {
            slot,
            thread: Some(thread),
        });
    }

    /// Разослать позицию во все слоты (неблокирующе).
    pub(crate) fn publish(&self, pos: &Position) {
        let subs = self.subs.lock().unwrap();
        for fwd in subs.iter() {
            fwd.slot.publish(pos);
        }
        if !subs.is_empty() {
            record_position_published();
        }
    }

    /// Закрыть слоты и дождаться форвардеров. Идемпотентно.
    pub(crate) fn shutdown(&self) {
        let mut subs = self.subs.lock().unwrap();
        for fwd in subs.iter() {
            fwd.slot.close();
        }
        for fwd in subs.iter_mut() {
            if let Some(t) = fwd.thread.take() {
                let _ = t.join();
            }
        }
        subs.clear();
    }
}

struct StopFlag {
    stop: Mutex<bool>,
    cv: Condvar,
}

/// Хэндл фонового монитора; close() сигналит и дожидается потока.
pub(crate) struct MonitorHandle {
    flag: Arc<StopFlag>,
    thread: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    pub(crate) fn stop(&mut self) {
        {
            let mut stop = self.flag.stop.lock().unwrap();
            *stop = true;
            self.flag.cv.notify_all();
        }
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

/// Запустить цикл монитора. interval > 0 гарантирует вызывающий код.
pub(crate) fn spawn_monitor(engine: Arc<Engine>, interval: Duration) -> MonitorHandle {
    let flag = Arc::new(StopFlag {
        stop: Mutex::new(false),
        cv: Condvar::new(),
    });
    let thread_flag = flag.clone();
    let thread = std::thread::spawn(move || loop {
        {
            let stop = thread_flag.stop.lock().unwrap();
            let (stop, _timeout) = thread_flag
                .cv
                .wait_timeout_while(stop, interval, |s| !*s)
                .unwrap();
            if *stop {
                return;
            }
        }
        match engine.sync() {
            Ok(()) => {
                let pos = engine.pos();
                if !pos.is_empty() {
                    engine.notifier().publish(&pos);
                }
            }
            Err(e) => {
                record_sync_error();
                warn!("monitor: sync {} failed: {:#}", engine.db_path().display(), e);
            }
        }
    });
    MonitorHandle {
        flag,
        thread: Some(thread),
    }
}
