//! pos — курсор репликации: (generation, index, offset).
//!
//! Позиция не персистится отдельно: она восстанавливается из файла `generation`
//! и длины последнего сегмента. Внутри одного поколения (index, offset) строго
//! монотонны; новое поколение целиком вытесняет предыдущее.

use serde::Serialize;
use std::cmp::Ordering;
use std::fmt;

/// Позиция в теневом WAL. Пустая позиция — до первого успешного sync.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Position {
    pub generation: String,
    pub index: u64,
    pub offset: u64,
}

impl Position {
    pub fn new(generation: impl Into<String>, index: u64, offset: u64) -> Self {
        Self {
            generation: generation.into(),
            index,
            offset,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.generation.is_empty()
    }

    /// Сравнение внутри одного поколения; None, если поколения различаются
    /// (их порядок определяется временем создания, не именем).
    pub fn cmp_same_generation(&self, other: &Self) -> Option<Ordering> {
        if self.generation != other.generation {
            return None;
        }
        Some((self.index, self.offset).cmp(&(other.index, other.offset)))
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "-");
        }
        write!(f, "{}/{:016x}:{}", self.generation, self.index, self.offset)
    }
}
