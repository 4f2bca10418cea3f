//! walfile — чтение настоящего SQLite WAL: заголовок, кадры, цепочка контрольных сумм.
//!
//! Формат (BE-поля на диске):
//! - 32-байтовый заголовок: magic, version, page_size, checkpoint_seq, salt1, salt2, cksum1, cksum2.
//! - Далее кадры: 24-байтовый заголовок (page_no, db_size, salt1, salt2, cksum1, cksum2) + страница.
//!
//! Контрольная сумма — кумулятивная по парам 32-битных слов; порядок слов выбирается
//! младшим битом magic (0x377f0682 => LE, 0x377f0683 => BE). Заголовок считает сумму
//! по своим первым 24 байтам от (0,0); кадр продолжает цепочку предыдущего кадра по
//! байтам 0..8 своего заголовка и телу страницы.
//!
//! Поведение:
//! - Кадр с неверной суммой или чужими salt'ами завершает валидный префикс (torn tail);
//!   это не ошибка, а сигнал для вызывающего кода.
//! - Err — только непарсящийся заголовок или невозможные аргументы.

pub mod reader;

pub use reader::{
    read_frame_header, read_header, verify_chain, ChainInfo, FrameValidator, WalFrameHeader,
    WalHeader,
};

use byteorder::{BigEndian, ByteOrder, LittleEndian};

/// Порядок 32-битных слов при вычислении суммы (выбирается magic'ом).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CksumByteOrder {
    Little,
    Big,
}

/// Кумулятивная сумма SQLite WAL: s1 += x1 + s2; s2 += x2 + s1 (wrapping),
/// где (x1, x2) — очередная пара слов в порядке `bo`. len данных кратна 8.
pub fn wal_checksum(bo: CksumByteOrder, mut s1: u32, mut s2: u32, data: &[u8]) -> (u32, u32) {
    debug_assert_eq!(data.len() % 8, 0);
    for chunk in data.chunks_exact(8) {
        let (x1, x2) = match bo {
            CksumByteOrder::Little => (
                LittleEndian::read_u32(&chunk[0..4]),
                LittleEndian::read_u32(&chunk[4..8]),
            ),
            CksumByteOrder::Big => (
                BigEndian::read_u32(&chunk[0..4]),
                BigEndian::read_u32(&chunk[4..8]),
            ),
        };
        s1 = s1.wrapping_add(x1).wrapping_add(s2);
        s2 = s2.wrapping_add(x2).wrapping_add(s1);
    }
    (s1, s2)
}
