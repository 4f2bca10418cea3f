use anyhow::{Context, Result};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

pub fn read_at(f: &mut File, offset: u64, buf: &mut [u8]) -> Result<()> {
    f.seek(SeekFrom::Start(offset))?;
    f.read_exact(buf)?;
    Ok(())
}

/// Прочитать ровно `len` байт с offset; Ok(None), если файл короче (torn tail).
pub fn try_read_at(f: &mut File, offset: u64, len: usize) -> Result<Option<Vec<u8>>> {
    let file_len = f.metadata()?.len();
    if offset + len as u64 > file_len {
        return Ok(None);
    }
    let mut buf = vec![0u8; len];
    read_at(f, offset, &mut buf)?;
    Ok(Some(buf))
}

/// fsync родительского каталога (best-effort на не-unix платформах).
#[cfg(unix)]
pub fn fsync_dir(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            let dir = File::open(parent)?;
            dir.sync_all()?;
        }
    }
    Ok(())
}
#[cfg(not(unix))]
pub fn fsync_dir(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

pub fn open_ro(path: &Path) -> Result<File> {
    std::fs::OpenOptions::new()
        .read(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))
}

/// Сводится ли ошибка к io NotFound (отсутствие файла).
pub fn is_not_found(err: &anyhow::Error) -> bool {
    err.root_cause()
        .downcast_ref::<std::io::Error>()
        .map(|e| e.kind() == std::io::ErrorKind::NotFound)
        .unwrap_or(false)
}

pub fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

/// 16 hex-символов в нижнем регистре?
pub fn is_hex_id(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
}
