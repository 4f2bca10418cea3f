//! db/sync — один тик синхронизации настоящего WAL в теневой.
//!
//! Порядок тика:
//! 1. Нет файла БД — успех без работы (БД может появиться позже).
//! 2. Режим журнала обязан быть WAL (успех кэшируется, отказ — нет).
//! 3. Разделяемая read-блокировка через отложенную транзакцию клиента:
//!    писатели не могут рестартовать WAL, пока мы его читаем.
//! 4. Сверка заголовков настоящего и теневого WAL:
//!    - совпали salt'ы — чистое продолжение, докопируем кадры;
//!    - salt'ы разошлись — WAL рестартовал: новый сегмент того же поколения;
//!    - тень не читается / цепочка не сходится / настоящий WAL короче тени /
//!      сменился размер страницы — новое поколение. Откат в новое поколение —
//!      предохранитель: никакого хирургического ремонта тени.
//! 5. Кадры копируются байт-в-байт с проверкой цепочки контрольных сумм;
//!    невалидный кадр означает недописанный хвост и просто останавливает тик.
//! 6. Чекпоинт — строго после снятия read-блокировки.

use anyhow::{anyhow, Context, Result};
use byteorder::{BigEndian, ByteOrder};
use log::{debug, info, warn};
use rusqlite::{Connection, OpenFlags};
use std::path::Path;
use std::time::Duration;

use super::core::{Engine, SyncState, WalModeRequired};
use crate::consts::{
    DB_HDR_PAGE_SIZE_OFFSET, SQLITE_BUSY_TIMEOUT_MS, WAL_FRAME_HEADER_SIZE, WAL_FRAME_OFF_CKSUM1,
    WAL_HEADER_SIZE,
};
use crate::metrics::{
    record_frames_copied, record_generation_started, record_segment_rollover, record_sync_tick,
};
use crate::pos::Position;
use crate::util::{open_ro, read_at, try_read_at};
use crate::walfile::{read_header, verify_chain, FrameValidator, WalHeader};

/// Итог сверки теневого сегмента с настоящим WAL.
enum ShadowCheck {
    /// Чистое продолжение; (s1, s2) — цепочка после последнего кадра тени.
    Stream { s1: u32, s2: u32 },
    /// WAL рестартовал (salt'ы разошлись): нужен следующий сегмент.
    Restarted,
    /// Непоправимое расхождение: новое поколение.
    Reset,
}

impl Engine {
    /// Один тик. Сериализуется мьютексом состояния.
    pub(crate) fn sync(&self) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        record_sync_tick();

        if !self.db_path.exists() {
            return Ok(());
        }

        self.ensure_conn(&mut st)?;
        self.ensure_wal_mode(&mut st)?;

        // Соединение временно забираем из состояния: транзакция живёт на
        // ссылке, пока мы мутируем остальные поля.
        let conn = st
            .conn
            .take()
            .ok_or_else(|| anyhow!("sqlite connection missing"))?;
        let res = self.sync_with_conn(&conn, &mut st);
        st.conn = Some(conn);
        res
    }

    fn sync_with_conn(&self, conn: &Connection, st: &mut SyncState) -> Result<()> {
        {
            let tx = conn.unchecked_transaction()?;
            // Отложенная транзакция берёт разделяемую блокировку первым чтением.
            tx.query_row("SELECT COUNT(1) FROM sqlite_master", [], |row| {
                row.get::<_, i64>(0)
            })
            .with_context(|| format!("acquire read lock on {}", self.db_path.display()))?;
            self.copy_new_frames(st)?;
            // drop(tx) => ROLLBACK, блокировка снята на любом пути выхода.
        }
        self.maybe_checkpoint(conn, st)
    }

    /// Шаги A–F: размер страницы, поколение, сверка, докопирование, позиция.
    fn copy_new_frames(&self, st: &mut SyncState) -> Result<()> {
        // A. Размер страницы из заголовка БД; смена — новое поколение.
        let page_size = read_db_page_size(&self.db_path)?;
        let mut reset = false;
        if st.page_size == 0 {
            st.page_size = page_size;
        } else if st.page_size != page_size {
            warn!(
                "db {}: page size changed {} -> {}, starting new generation",
                self.db_path.display(),
                st.page_size,
                page_size
            );
            st.page_size = page_size;
            reset = true;
        }

        // Настоящий WAL: нет файла либо нет целого заголовка — кадров ещё нет.
        let mut wal = match open_ro(&self.wal_path) {
            Ok(f) => f,
            Err(e) if crate::util::is_not_found(&e) => return Ok(()),
            Err(e) => return Err(e),
        };
        let wal_len = wal.metadata()?.len();
        if wal_len < WAL_HEADER_SIZE {
            return Ok(());
        }
        let mut hdr_bytes = [0u8; WAL_HEADER_SIZE as usize];
        read_at(&mut wal, 0, &mut hdr_bytes)?;
        let real_hdr = match read_header(&hdr_bytes) {
            Ok(h) => h,
            Err(e) => {
                // Заголовок дописывается прямо сейчас; дождёмся следующего тика.
                debug!("db {}: wal header not yet valid: {:#}", self.db_path.display(), e);
                return Ok(());
            }
        };

        let frame_size = WAL_FRAME_HEADER_SIZE + st.page_size as u64;

        // B/C/D. Поколение и точка продолжения цепочки.
        let mut seed = (real_hdr.cksum1, real_hdr.cksum2);
        if !reset {
            match self.store.current_generation()? {
                None => reset = true,
                Some(generation) => {
                    if st.pos.is_empty() || st.pos.generation != generation {
                        // Позицию восстановить не удалось — сверять нечего.
                        reset = true;
                    } else {
                        match self.verify_shadow(st, &real_hdr, wal_len, &mut wal)? {
                            ShadowCheck::Stream { s1, s2 } => seed = (s1, s2),
                            ShadowCheck::Restarted => {
                                let index = st.pos.index + 1;
                                self.store.create_segment(&generation, index, &hdr_bytes)?;
                                st.pos = Position::new(generation.clone(), index, WAL_HEADER_SIZE);
                                record_segment_rollover();
                                info!(
                                    "db {}: wal restarted, shadow segment {} started",
                                    self.db_path.display(),
                                    index
                                );
                            }
                            ShadowCheck::Reset => reset = true,
                        }
                    }
                }
            }
        }

        if reset {
            let generation = self.store.create_generation(&hdr_bytes)?;
            st.pos = Position::new(generation.clone(), 0, WAL_HEADER_SIZE);
            seed = (real_hdr.cksum1, real_hdr.cksum2);
            record_generation_started();
            info!(
                "db {}: new generation {}",
                self.db_path.display(),
                generation
            );
        }

        // E. Докопировать валидный префикс новых кадров.
        let mut validator = FrameValidator::with_seed(&real_hdr, st.page_size, seed.0, seed.1);
        let mut off = st.pos.offset;
        let mut pending: Vec<u8> = Vec::new();
        while off + frame_size <= wal_len {
            let Some(frame) = try_read_at(&mut wal, off, frame_size as usize)? else {
                break;
            };
            match validator.accept(&frame)? {
                Some(_) => {
                    pending.extend_from_slice(&frame);
                    off += frame_size;
                }
                // Недописанный хвост либо кадры прошлой сессии WAL.
                None => break,
            }
        }
        if pending.is_empty() {
            return Ok(());
        }

        // I1: длина сегмента на диске обязана совпадать с курсором.
        let seg_len = self.store.segment_len(&st.pos.generation, st.pos.index)?;
        if seg_len != st.pos.offset {
            return Err(anyhow!(
                "shadow segment {} length {} != tracked offset {} (invariant violation)",
                self.store.segment_path(&st.pos.generation, st.pos.index).display(),
                seg_len,
                st.pos.offset
            ));
        }

        let frames = pending.len() as u64 / frame_size;
        let new_off = self
            .store
            .append_to_segment(&st.pos.generation, st.pos.index, &pending)?;
        if new_off != off {
            return Err(anyhow!(
                "shadow segment {} grew to {} instead of {} (invariant violation)",
                self.store.segment_path(&st.pos.generation, st.pos.index).display(),
                new_off,
                off
            ));
        }

        // F. Позиция продвигается только после fsync сегмента.
        st.pos.offset = new_off;
        record_frames_copied(frames, pending.len() as u64);
        debug!(
            "db {}: copied {} frame(s), pos {}",
            self.db_path.display(),
            frames,
            st.pos
        );
        Ok(())
    }

    /// Шаги C/D для существующего сегмента: заголовок, цепочка, последний общий кадр.
    fn verify_shadow(
        &self,
        st: &SyncState,
        real_hdr: &WalHeader,
        wal_len: u64,
        wal: &mut std::fs::File,
    ) -> Result<ShadowCheck> {
        let bytes = match self.store.read_segment(&st.pos.generation, st.pos.index) {
            Ok(b) => b,
            Err(_) => return Ok(ShadowCheck::Reset),
        };
        let shadow_hdr = match read_header(&bytes) {
            Ok(h) => h,
            Err(_) => return Ok(ShadowCheck::Reset),
        };
        if shadow_hdr.page_size != st.page_size {
            return Ok(ShadowCheck::Reset);
        }
        if shadow_hdr.salts() != real_hdr.salts() {
            return Ok(ShadowCheck::Restarted);
        }

        let info = verify_chain(&bytes, st.page_size)?;
        if info.valid_len != bytes.len() as u64 {
            // Внутри тени оказался невалидный кадр: доверия к сегменту нет.
            return Ok(ShadowCheck::Reset);
        }
        if info.valid_len != st.pos.offset {
            return Err(anyhow!(
                "shadow segment {} verified length {} != tracked offset {} (invariant violation)",
                self.store.segment_path(&st.pos.generation, st.pos.index).display(),
                info.valid_len,
                st.pos.offset
            ));
        }

        let frame_size = WAL_FRAME_HEADER_SIZE + st.page_size as u64;
        if info.frame_count > 0 {
            // Настоящий WAL короче тени — тоже повод для нового поколения.
            let last_off = WAL_HEADER_SIZE + (info.frame_count - 1) * frame_size;
            if last_off + frame_size > wal_len {
                return Ok(ShadowCheck::Reset);
            }
            let mut fh = [0u8; WAL_FRAME_HEADER_SIZE as usize];
            read_at(wal, last_off, &mut fh)?;
            let real_cksum = (
                BigEndian::read_u32(&fh[WAL_FRAME_OFF_CKSUM1..WAL_FRAME_OFF_CKSUM1 + 4]),
                BigEndian::read_u32(&fh[WAL_FRAME_OFF_CKSUM1 + 4..WAL_FRAME_OFF_CKSUM1 + 8]),
            );
            if real_cksum != (info.s1, info.s2) {
                return Ok(ShadowCheck::Reset);
            }
        }

        Ok(ShadowCheck::Stream {
            s1: info.s1,
            s2: info.s2,
        })
    }

    pub(crate) fn ensure_conn(&self, st: &mut SyncState) -> Result<()> {
        if st.conn.is_some() {
            return Ok(());
        }
        // Без SQLITE_OPEN_CREATE: отсутствие БД — не повод её создавать.
        let conn = Connection::open_with_flags(
            &self.db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("open sqlite db {}", self.db_path.display()))?;
        conn.busy_timeout(Duration::from_millis(SQLITE_BUSY_TIMEOUT_MS))?;
        st.conn = Some(conn);
        Ok(())
    }

    /// Проверка журнального режима; кэшируется только положительный ответ,
    /// чтобы смена режима оператором подхватилась следующим тиком.
    fn ensure_wal_mode(&self, st: &mut SyncState) -> Result<()> {
        if st.wal_mode_verified {
            return Ok(());
        }
        let conn = st
            .conn
            .as_ref()
            .ok_or_else(|| anyhow!("sqlite connection missing"))?;
        let mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
        if !mode.eq_ignore_ascii_case("wal") {
            return Err(anyhow::Error::new(WalModeRequired).context(format!(
                "db {}: journal_mode is {:?}",
                self.db_path.display(),
                mode
            )));
        }
        st.wal_mode_verified = true;
        Ok(())
    }
}

/// Размер страницы из заголовка БД (offset 16, u16 BE; 1 => 65536).
fn read_db_page_size(path: &Path) -> Result<u32> {
    let mut f = open_ro(path)?;
    let mut buf = [0u8; 2];
    read_at(&mut f, DB_HDR_PAGE_SIZE_OFFSET, &mut buf)
        .with_context(|| format!("read page size of {}", path.display()))?;
    let raw = BigEndian::read_u16(&buf) as u32;
    let page_size = if raw == 1 { 65_536 } else { raw };
    if !page_size.is_power_of_two() || !(512..=65_536).contains(&page_size) {
        return Err(anyhow!(
            "implausible page size {} in {}",
            page_size,
            path.display()
        ));
    }
    Ok(page_size)
}
