//! walfile/reader — разбор заголовка WAL и последовательная проверка кадров.
//!
//! Stateful API по образцу последовательного чтения:
//! - FrameValidator хранит бегущую пару (s1, s2) и принимает кадры по одному;
//!   невалидный кадр не продвигает цепочку.
//! - verify_chain(..) — проверка сегмента целиком: заголовок + кадры до первого
//!   невалидного; возвращает число валидных кадров и бегущую сумму для продолжения.

use anyhow::{anyhow, Result};
use byteorder::{BigEndian, ByteOrder};

use super::{wal_checksum, CksumByteOrder};
use crate::consts::{
    WAL_FORMAT_VERSION, WAL_FRAME_HEADER_SIZE, WAL_FRAME_OFF_CKSUM1, WAL_FRAME_OFF_CKSUM2,
    WAL_FRAME_OFF_DB_SIZE, WAL_FRAME_OFF_PAGE_NO, WAL_FRAME_OFF_SALT1, WAL_FRAME_OFF_SALT2,
    WAL_HDR_OFF_CHECKPOINT_SEQ, WAL_HDR_OFF_CKSUM1, WAL_HDR_OFF_CKSUM2, WAL_HDR_OFF_MAGIC,
    WAL_HDR_OFF_PAGE_SIZE, WAL_HDR_OFF_SALT1, WAL_HDR_OFF_SALT2, WAL_HDR_OFF_VERSION,
    WAL_HEADER_SIZE, WAL_MAGIC_CKSUM_LE, WAL_MAGIC_MASK,
};

/// Заголовок WAL-файла (32 байта).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalHeader {
    pub magic: u32,
    pub version: u32,
    pub page_size: u32,
    pub checkpoint_seq: u32,
    pub salt1: u32,
    pub salt2: u32,
    pub cksum1: u32,
    pub cksum2: u32,
}

impl WalHeader {
    /// Порядок слов контрольной суммы, закодированный в magic.
    #[inline]
    pub fn byte_order(&self) -> CksumByteOrder {
        if self.magic & 1 == 0 {
            CksumByteOrder::Little
        } else {
            CksumByteOrder::Big
        }
    }

    #[inline]
    pub fn salts(&self) -> (u32, u32) {
        (self.salt1, self.salt2)
    }
}

/// Заголовок кадра WAL (24 байта).
#[derive(Debug, Clone, Copy)]
pub struct WalFrameHeader {
    pub page_no: u32,
    /// Размер БД в страницах после коммита; 0 для не-commit кадров.
    pub db_size: u32,
    pub salt1: u32,
    pub salt2: u32,
    pub cksum1: u32,
    pub cksum2: u32,
}

impl WalFrameHeader {
    #[inline]
    pub fn is_commit(&self) -> bool {
        self.db_size > 0
    }
}

/// Разобрать и проверить 32-байтовый заголовок WAL.
/// Err: короткий буфер, чужой magic или несошедшаяся самосумма заголовка.
pub fn read_header(buf: &[u8]) -> Result<WalHeader> {
    if buf.len() < WAL_HEADER_SIZE as usize {
        return Err(anyhow!("wal header too short: {} bytes", buf.len()));
    }
    let magic = BigEndian::read_u32(&buf[WAL_HDR_OFF_MAGIC..WAL_HDR_OFF_MAGIC + 4]);
    if magic & WAL_MAGIC_MASK != WAL_MAGIC_CKSUM_LE & WAL_MAGIC_MASK {
        return Err(anyhow!("bad wal magic {:#010x}", magic));
    }
    let hdr = WalHeader {
        magic,
        version: BigEndian::read_u32(&buf[WAL_HDR_OFF_VERSION..WAL_HDR_OFF_VERSION + 4]),
        page_size: BigEndian::read_u32(&buf[WAL_HDR_OFF_PAGE_SIZE..WAL_HDR_OFF_PAGE_SIZE + 4]),
        checkpoint_seq: BigEndian::read_u32(
            &buf[WAL_HDR_OFF_CHECKPOINT_SEQ..WAL_HDR_OFF_CHECKPOINT_SEQ + 4],
        ),
        salt1: BigEndian::read_u32(&buf[WAL_HDR_OFF_SALT1..WAL_HDR_OFF_SALT1 + 4]),
        salt2: BigEndian::read_u32(&buf[WAL_HDR_OFF_SALT2..WAL_HDR_OFF_SALT2 + 4]),
        cksum1: BigEndian::read_u32(&buf[WAL_HDR_OFF_CKSUM1..WAL_HDR_OFF_CKSUM1 + 4]),
        cksum2: BigEndian::read_u32(&buf[WAL_HDR_OFF_CKSUM2..WAL_HDR_OFF_CKSUM2 + 4]),
    };
    if hdr.version != WAL_FORMAT_VERSION {
        return Err(anyhow!("unsupported wal format version {}", hdr.version));
    }
    // Самосумма заголовка: первые 24 байта от (0, 0).
    let (s1, s2) = wal_checksum(hdr.byte_order(), 0, 0, &buf[..WAL_HDR_OFF_CKSUM1]);
    if (s1, s2) != (hdr.cksum1, hdr.cksum2) {
        return Err(anyhow!(
            "wal header checksum mismatch: computed ({:#x},{:#x}), stored ({:#x},{:#x})",
            s1,
            s2,
            hdr.cksum1,
            hdr.cksum2
        ));
    }
    Ok(hdr)
}

/// Разобрать 24-байтовый заголовок кадра (без проверки цепочки).
pub fn read_frame_header(buf: &[u8]) -> Result<WalFrameHeader> {
    if buf.len() < WAL_FRAME_HEADER_SIZE as usize {
        return Err(anyhow!("wal frame header too short: {} bytes", buf.len()));
    }
    Ok(WalFrameHeader {
        page_no: BigEndian::read_u32(&buf[WAL_FRAME_OFF_PAGE_NO..WAL_FRAME_OFF_PAGE_NO + 4]),
        db_size: BigEndian::read_u32(&buf[WAL_FRAME_OFF_DB_SIZE..WAL_FRAME_OFF_DB_SIZE + 4]),
        salt1: BigEndian::read_u32(&buf[WAL_FRAME_OFF_SALT1..WAL_FRAME_OFF_SALT1 + 4]),
        salt2: BigEndian::read_u32(&buf[WAL_FRAME_OFF_SALT2..WAL_FRAME_OFF_SALT2 + 4]),
        cksum1: BigEndian::read_u32(&buf[WAL_FRAME_OFF_CKSUM1..WAL_FRAME_OFF_CKSUM1 + 4]),
        cksum2: BigEndian::read_u32(&buf[WAL_FRAME_OFF_CKSUM2..WAL_FRAME_OFF_CKSUM2 + 4]),
    })
}

/// Последовательная проверка кадров против цепочки контрольных сумм заголовка `hdr`.
pub struct FrameValidator {
    bo: CksumByteOrder,
    salt1: u32,
    salt2: u32,
    page_size: usize,
    s1: u32,
    s2: u32,
}

impl FrameValidator {
    /// Цепочка, засеянная самосуммой заголовка (кадр 0 идёт первым).
    pub fn new(hdr: &WalHeader, page_size: u32) -> Self {
        Self::with_seed(hdr, page_size, hdr.cksum1, hdr.cksum2)
    }

    /// Продолжение цепочки с произвольной позиции (s1, s2) — после verify_chain.
    pub fn with_seed(hdr: &WalHeader, page_size: u32, s1: u32, s2: u32) -> Self {
        Self {
            bo: hdr.byte_order(),
            salt1: hdr.salt1,
            salt2: hdr.salt2,
            page_size: page_size as usize,
            s1,
            s2,
        }
    }

    /// Текущая бегущая пара (s1, s2) == сумма последнего принятого кадра.
    #[inline]
    pub fn running(&self) -> (u32, u32) {
        (self.s1, self.s2)
    }

    /// Проверить очередной кадр (24 + page_size байт).
    /// Some(header) — кадр валиден, цепочка продвинута; None — torn/чужой кадр,
    /// цепочка не тронута. Err — только буфер неверной длины.
    pub fn accept(&mut self, frame: &[u8]) -> Result<Option<WalFrameHeader>> {
        let want = WAL_FRAME_HEADER_SIZE as usize + self.page_size;
        if frame.len() != want {
            return Err(anyhow!(
                "frame buffer must be {} bytes, got {}",
                want,
                frame.len()
            ));
        }
        let fh = read_frame_header(frame)?;
        if (fh.salt1, fh.salt2) != (self.salt1, self.salt2) {
            return Ok(None);
        }
        // Цепочка: заголовочные байты 0..8 кадра + тело страницы.
        let (mut s1, mut s2) = (self.s1, self.s2);
        let (a, b) = wal_checksum(self.bo, s1, s2, &frame[..8]);
        s1 = a;
        s2 = b;
        let (a, b) = wal_checksum(
            self.bo,
            s1,
            s2,
            &frame[WAL_FRAME_HEADER_SIZE as usize..],
        );
        s1 = a;
        s2 = b;
        if (s1, s2) != (fh.cksum1, fh.cksum2) {
            return Ok(None);
        }
        self.s1 = s1;
        self.s2 = s2;
        Ok(Some(fh))
    }
}

/// Итог проверки сегмента: валидный префикс и состояние цепочки на его конце.
#[derive(Debug, Clone, Copy)]
pub struct ChainInfo {
    pub header: WalHeader,
    /// Число валидных кадров.
    pub frame_count: u64,
    /// Длина валидного префикса в байтах (заголовок + целые кадры).
    pub valid_len: u64,
    /// Бегущая сумма после последнего валидного кадра (== самосумма заголовка при 0 кадров).
    pub s1: u32,
    pub s2: u32,
}

/// Проверить сегмент целиком: заголовок, затем кадры до первого невалидного.
/// Err — только при невалидном заголовке.
pub fn verify_chain(bytes: &[u8], page_size: u32) -> Result<ChainInfo> {
    let header = read_header(bytes)?;
    let frame_size = WAL_FRAME_HEADER_SIZE as usize + page_size as usize;
    let mut v = FrameValidator::new(&header, page_size);
    let mut off = WAL_HEADER_SIZE as usize;
    let mut frame_count = 0u64;
    while off + frame_size <= bytes.len() {
        match v.accept(&bytes[off..off + frame_size])? {
            Some(_) => {
                frame_count += 1;
                off += frame_size;
            }
            None => break,
        }
    }
    let (s1, s2) = v.running();
    Ok(ChainInfo {
        header,
        frame_count,
        valid_len: off as u64,
        s1,
        s2,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::WAL_MAGIC_CKSUM_BE;
    use byteorder::{BigEndian, ByteOrder};

    const PAGE_SIZE: u32 = 512;

    fn make_header(magic: u32, salt1: u32, salt2: u32) -> [u8; 32] {
        let mut buf = [0u8; 32];
        BigEndian::write_u32(&mut buf[0..4], magic);
        BigEndian::write_u32(&mut buf[4..8], WAL_FORMAT_VERSION);
        BigEndian::write_u32(&mut buf[8..12], PAGE_SIZE);
        BigEndian::write_u32(&mut buf[12..16], 7);
        BigEndian::write_u32(&mut buf[16..20], salt1);
        BigEndian::write_u32(&mut buf[20..24], salt2);
        let bo = if magic & 1 == 0 {
            CksumByteOrder::Little
        } else {
            CksumByteOrder::Big
        };
        let (s1, s2) = wal_checksum(bo, 0, 0, &buf[..24]);
        BigEndian::write_u32(&mut buf[24..28], s1);
        BigEndian::write_u32(&mut buf[28..32], s2);
        buf
    }

    fn make_frame(hdr: &WalHeader, prev: (u32, u32), page_no: u32, db_size: u32) -> Vec<u8> {
        let mut frame = vec![0u8; 24 + PAGE_SIZE as usize];
        BigEndian::write_u32(&mut frame[0..4], page_no);
        BigEndian::write_u32(&mut frame[4..8], db_size);
        BigEndian::write_u32(&mut frame[8..12], hdr.salt1);
        BigEndian::write_u32(&mut frame[12..16], hdr.salt2);
        for (i, b) in frame[24..].iter_mut().enumerate() {
            *b = (page_no as usize + i) as u8;
        }
        let bo = hdr.byte_order();
        let (s1, s2) = wal_checksum(bo, prev.0, prev.1, &frame[..8]);
        let (s1, s2) = wal_checksum(bo, s1, s2, &frame[24..]);
        BigEndian::write_u32(&mut frame[16..20], s1);
        BigEndian::write_u32(&mut frame[20..24], s2);
        frame
    }

    #[test]
    fn header_roundtrip_and_self_checksum() {
        let raw = make_header(WAL_MAGIC_CKSUM_LE, 0xdead_beef, 0x0bad_f00d);
        let hdr = read_header(&raw).unwrap();
        assert_eq!(hdr.page_size, PAGE_SIZE);
        assert_eq!(hdr.salts(), (0xdead_beef, 0x0bad_f00d));
        assert_eq!(hdr.byte_order(), CksumByteOrder::Little);

        // Порча любого байта первых 24 ломает самосумму.
        let mut bad = raw;
        bad[9] ^= 0xff;
        assert!(read_header(&bad).is_err());
    }

    #[test]
    fn big_endian_magic_selects_word_order() {
        let raw = make_header(WAL_MAGIC_CKSUM_BE, 1, 2);
        let hdr = read_header(&raw).unwrap();
        assert_eq!(hdr.byte_order(), CksumByteOrder::Big);
    }

    #[test]
    fn chain_walks_valid_frames_and_stops_at_torn_tail() {
        let raw = make_header(WAL_MAGIC_CKSUM_LE, 11, 22);
        let hdr = read_header(&raw).unwrap();

        let mut seg = raw.to_vec();
        let f1 = make_frame(&hdr, (hdr.cksum1, hdr.cksum2), 1, 0);
        let c1 = (
            BigEndian::read_u32(&f1[16..20]),
            BigEndian::read_u32(&f1[20..24]),
        );
        let f2 = make_frame(&hdr, c1, 2, 2);
        seg.extend_from_slice(&f1);
        seg.extend_from_slice(&f2);

        let info = verify_chain(&seg, PAGE_SIZE).unwrap();
        assert_eq!(info.frame_count, 2);
        assert_eq!(info.valid_len, seg.len() as u64);

        // Порванный хвост: часть третьего кадра не учитывается.
        let c2 = (
            BigEndian::read_u32(&f2[16..20]),
            BigEndian::read_u32(&f2[20..24]),
        );
        let f3 = make_frame(&hdr, c2, 3, 3);
        let mut torn = seg.clone();
        torn.extend_from_slice(&f3[..100]);
        let info = verify_chain(&torn, PAGE_SIZE).unwrap();
        assert_eq!(info.frame_count, 2);
        assert_eq!(info.valid_len, seg.len() as u64);

        // Испорченный кадр посреди хвоста обрезает префикс на нём же.
        let mut corrupt = seg.clone();
        corrupt.extend_from_slice(&f3);
        let body_off = WAL_HEADER_SIZE as usize + 2 * (24 + PAGE_SIZE as usize) + 24 + 5;
        corrupt[body_off] ^= 0xff;
        let info = verify_chain(&corrupt, PAGE_SIZE).unwrap();
        assert_eq!(info.frame_count, 2);
    }

    #[test]
    fn foreign_salts_terminate_prefix() {
        let raw = make_header(WAL_MAGIC_CKSUM_LE, 11, 22);
        let hdr = read_header(&raw).unwrap();

        // Кадр из «прошлой жизни» WAL (другие salt'ы) после рестарта.
        let old_raw = make_header(WAL_MAGIC_CKSUM_LE, 10, 99);
        let old_hdr = read_header(&old_raw).unwrap();

        let mut seg = raw.to_vec();
        let f1 = make_frame(&hdr, (hdr.cksum1, hdr.cksum2), 1, 1);
        seg.extend_from_slice(&f1);
        let stale = make_frame(&old_hdr, (old_hdr.cksum1, old_hdr.cksum2), 9, 9);
        seg.extend_from_slice(&stale);

        let info = verify_chain(&seg, PAGE_SIZE).unwrap();
        assert_eq!(info.frame_count, 1);
        assert_eq!(
            info.valid_len,
            WAL_HEADER_SIZE + (24 + PAGE_SIZE as u64)
        );
    }

    #[test]
    fn validator_resumes_from_seed() {
        let raw = make_header(WAL_MAGIC_CKSUM_LE, 5, 6);
        let hdr = read_header(&raw).unwrap();
        let f1 = make_frame(&hdr, (hdr.cksum1, hdr.cksum2), 1, 0);
        let c1 = (
            BigEndian::read_u32(&f1[16..20]),
            BigEndian::read_u32(&f1[20..24]),
        );
        let f2 = make_frame(&hdr, c1, 2, 2);

        let mut v = FrameValidator::with_seed(&hdr, PAGE_SIZE, c1.0, c1.1);
        let fh = v.accept(&f2).unwrap().expect("frame 2 must chain from seed");
        assert!(fh.is_commit());
        assert_eq!(v.running(), (fh.cksum1, fh.cksum2));
    }
}
