use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use byteorder::{BigEndian, ByteOrder};
use rusqlite::Connection;

use walstream::consts::WAL_HEADER_SIZE;
use walstream::walfile::{read_header, wal_checksum};
use walstream::Db;

// ---------- helpers ----------

fn unique_root(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!("walstream-{}-{}-{}", prefix, pid, t))
}

fn open_db(path: &Path) -> Result<Db> {
    let mut db = Db::new(path);
    db.monitor_interval = Duration::ZERO;
    db.open()?;
    Ok(db)
}

fn open_sqlite(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(1))?;
    let _mode: String = conn.query_row("PRAGMA journal_mode = wal", [], |row| row.get(0))?;
    Ok(conn)
}

/// БД с таблицей и первым синком; возвращает (db, conn, generation).
fn bootstrap(path: &Path) -> Result<(Db, Connection, String)> {
    let db = open_db(path)?;
    let conn = open_sqlite(path)?;
    conn.execute("CREATE TABLE t (id INTEGER)", [])?;
    db.sync()?;
    let generation = db.pos().generation;
    assert!(!generation.is_empty());
    Ok((db, conn, generation))
}

// ---------- tests ----------

#[test]
fn scrambled_shadow_header_starts_new_generation() -> Result<()> {
    let root = unique_root("scramble");
    fs::create_dir_all(&root)?;
    let path = root.join("db");
    let (mut db, _conn, gen0) = bootstrap(&path)?;

    // Портим заголовок тени: самосумма перестаёт сходиться.
    let seg = db.shadow_wal_path(&gen0, 0);
    let mut f = fs::OpenOptions::new().read(true).write(true).open(&seg)?;
    f.seek(SeekFrom::Start(5))?;
    let mut b = [0u8; 1];
    f.read_exact(&mut b)?;
    f.seek(SeekFrom::Start(5))?;
    f.write_all(&[b[0] ^ 0xff])?;
    drop(f);

    db.sync()?;
    let pos = db.pos();
    assert_ne!(pos.generation, gen0, "corrupt shadow header => new generation");
    assert_eq!(pos.index, 0);
    assert_eq!(pos.offset, fs::metadata(db.wal_path())?.len());

    db.close()?;
    Ok(())
}

#[test]
fn missing_shadow_segment_starts_new_generation() -> Result<()> {
    let root = unique_root("missing-seg");
    fs::create_dir_all(&root)?;
    let path = root.join("db");
    let (mut db, _conn, gen0) = bootstrap(&path)?;

    fs::remove_file(db.shadow_wal_path(&gen0, 0))?;

    db.sync()?;
    assert_ne!(db.pos().generation, gen0);

    db.close()?;
    Ok(())
}

#[test]
fn deleted_generation_dir_starts_new_generation() -> Result<()> {
    let root = unique_root("deleted-gen");
    fs::create_dir_all(&root)?;
    let path = root.join("db");
    let (mut db, _conn, gen0) = bootstrap(&path)?;

    fs::remove_dir_all(db.generation_path(&gen0))?;

    db.sync()?;
    let pos = db.pos();
    assert_ne!(pos.generation, gen0);
    assert_eq!(pos.offset, fs::metadata(db.wal_path())?.len());

    db.close()?;
    Ok(())
}

#[test]
fn partial_shadow_header_resets_on_reopen() -> Result<()> {
    let root = unique_root("part-hdr");
    fs::create_dir_all(&root)?;
    let path = root.join("db");
    let (mut db, _conn, gen0) = bootstrap(&path)?;
    db.close()?;

    // Недописанный заголовок сегмента — как после сбоя в момент создания.
    let seg = {
        let probe = Db::new(&path);
        probe.shadow_wal_path(&gen0, 0)
    };
    let f = fs::OpenOptions::new().write(true).open(&seg)?;
    f.set_len(10)?;
    drop(f);

    let mut db = open_db(&path)?;
    assert!(db.pos().is_empty(), "unreadable shadow header => empty position");

    db.sync()?;
    assert_ne!(db.pos().generation, gen0);

    db.close()?;
    Ok(())
}

#[test]
fn partial_shadow_frame_is_truncated_and_resynced() -> Result<()> {
    let root = unique_root("part-frame");
    fs::create_dir_all(&root)?;
    let path = root.join("db");
    let (mut db, conn, gen0) = bootstrap(&path)?;

    for i in 0..5 {
        conn.execute("INSERT INTO t (id) VALUES (?1)", [i])?;
    }
    db.sync()?;
    let frame_size = 24 + db.page_size() as u64;
    db.close()?;

    // Половина кадра в хвосте — как после сбоя посреди append.
    let seg = {
        let probe = Db::new(&path);
        probe.shadow_wal_path(&gen0, 0)
    };
    let f = fs::OpenOptions::new().write(true).open(&seg)?;
    f.set_len(WAL_HEADER_SIZE + frame_size + frame_size / 2)?;
    drop(f);

    let mut db = open_db(&path)?;
    // open() усёк хвост до границы последнего валидного кадра.
    let pos = db.pos();
    assert_eq!(pos.generation, gen0);
    assert_eq!(pos.offset, WAL_HEADER_SIZE + frame_size);
    assert_eq!(fs::metadata(&seg)?.len(), WAL_HEADER_SIZE + frame_size);

    // Следующий тик докопирует недостающее без смены поколения.
    db.sync()?;
    let pos = db.pos();
    assert_eq!(pos.generation, gen0);
    assert_eq!(pos.index, 0);
    assert_eq!(pos.offset, fs::metadata(db.wal_path())?.len());
    assert_eq!(fs::read(&seg)?, fs::read(db.wal_path())?);

    db.close()?;
    Ok(())
}

#[test]
fn header_only_segment_with_foreign_salts_rolls_index() -> Result<()> {
    let root = unique_root("foreign-salts");
    fs::create_dir_all(&root)?;
    let path = root.join("db");
    let (mut db, _conn, gen0) = bootstrap(&path)?;
    db.close()?;

    // Валидный, но «чужой» заголовок: другой salt1, пересчитанная самосумма,
    // и ни одного кадра. Так выглядит сегмент, созданный перед самым рестартом WAL.
    let seg = {
        let probe = Db::new(&path);
        probe.shadow_wal_path(&gen0, 0)
    };
    let mut hdr = [0u8; WAL_HEADER_SIZE as usize];
    {
        let mut f = fs::OpenOptions::new().read(true).open(&seg)?;
        f.read_exact(&mut hdr)?;
    }
    let parsed = read_header(&hdr)?;
    let salt1 = parsed.salt1.wrapping_add(1);
    BigEndian::write_u32(&mut hdr[16..20], salt1);
    let (s1, s2) = wal_checksum(parsed.byte_order(), 0, 0, &hdr[..24]);
    BigEndian::write_u32(&mut hdr[24..28], s1);
    BigEndian::write_u32(&mut hdr[28..32], s2);
    {
        let mut f = fs::OpenOptions::new().write(true).open(&seg)?;
        f.set_len(0)?;
        f.seek(SeekFrom::Start(0))?;
        f.write_all(&hdr)?;
    }

    let mut db = open_db(&path)?;
    db.sync()?;

    // Salt'ы разошлись при валидном заголовке — это рестарт, не сброс поколения.
    let pos = db.pos();
    assert_eq!(pos.generation, gen0);
    assert_eq!(pos.index, 1);
    assert_eq!(pos.offset, fs::metadata(db.wal_path())?.len());

    db.close()?;
    Ok(())
}

#[test]
fn page_size_change_starts_new_generation() -> Result<()> {
    let root = unique_root("page-size");
    fs::create_dir_all(&root)?;
    let path = root.join("db");
    let (mut db, conn, gen0) = bootstrap(&path)?;
    let page_size0 = db.page_size();
    db.close()?;

    // Сменить размер страницы можно только вне WAL: delete-журнал + VACUUM.
    let new_page_size = if page_size0 == 4096 { 8192 } else { 4096 };
    let _mode: String = conn.query_row("PRAGMA journal_mode = delete", [], |row| row.get(0))?;
    conn.execute_batch(&format!("PRAGMA page_size = {}; VACUUM;", new_page_size))?;
    let _mode: String = conn.query_row("PRAGMA journal_mode = wal", [], |row| row.get(0))?;
    conn.execute("INSERT INTO t (id) VALUES (1)", [])?;

    let mut db = open_db(&path)?;
    db.sync()?;

    assert_eq!(db.page_size(), new_page_size);
    assert_ne!(db.pos().generation, gen0, "page size change => new generation");

    db.close()?;
    Ok(())
}
