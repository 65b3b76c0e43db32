//! Translation between platform-native opaque identifiers and the compact
//! numeric identifiers downstream bots expect.

use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
};

use sha2::{Digest, Sha256};
use thiserror::Error;

const HASHED_ID_MODULUS: u64 = 10_000_000_000;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdStoreError {
    #[error("native id must be non-empty")]
    EmptyNativeId,
    #[error("no native id is recorded for compact id {0}")]
    UnknownId(i64),
    #[error("id store lock is poisoned")]
    Poisoned,
    #[error("id store backend error: {0}")]
    Backend(String),
}

impl<T> From<PoisonError<T>> for IdStoreError {
    fn from(_: PoisonError<T>) -> Self {
        Self::Poisoned
    }
}

/// Trait contract for the identifier store collaborator.
pub trait IdStore: Send + Sync {
    /// Returns the compact id for `native_id`, allocating one on first sight.
    fn store(&self, native_id: &str) -> Result<i64, IdStoreError>;

    /// Returns the native id previously stored under `id`.
    fn resolve(&self, id: i64) -> Result<String, IdStoreError>;

    /// Compact id for a value that is reported downstream but never resolved
    /// back, such as a message id. Stores that can derive ids without
    /// keeping a mapping should avoid persisting one here.
    fn alias(&self, native_id: &str) -> Result<i64, IdStoreError> {
        self.store(native_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdAllocation {
    /// 1, 2, 3, ... in order of first sight. Not stable across restarts.
    Sequential,
    /// Derived from a SHA-256 of the native id, so the same native id maps to
    /// the same compact id in every process.
    #[default]
    Hashed,
}

#[derive(Debug, Default)]
struct IdTables {
    forward: HashMap<String, i64>,
    reverse: HashMap<i64, String>,
    next_sequential: i64,
}

#[derive(Debug, Default)]
/// Process-local `IdStore`. Mappings live as long as the process.
pub struct MemoryIdStore {
    allocation: IdAllocation,
    tables: Mutex<IdTables>,
}

impl MemoryIdStore {
    pub fn new(allocation: IdAllocation) -> Self {
        Self {
            allocation,
            tables: Mutex::new(IdTables {
                next_sequential: 1,
                ..IdTables::default()
            }),
        }
    }

    pub fn sequential() -> Self {
        Self::new(IdAllocation::Sequential)
    }

    pub fn hashed() -> Self {
        Self::new(IdAllocation::Hashed)
    }

    pub fn len(&self) -> usize {
        self.tables
            .lock()
            .map(|tables| tables.forward.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn allocate(&self, tables: &mut IdTables, native_id: &str) -> i64 {
        match self.allocation {
            IdAllocation::Sequential => {
                let id = tables.next_sequential.max(1);
                tables.next_sequential = id.saturating_add(1);
                id
            }
            IdAllocation::Hashed => {
                let mut candidate = hashed_candidate(native_id);
                while tables.reverse.contains_key(&candidate) {
                    candidate = if candidate as u64 + 1 >= HASHED_ID_MODULUS {
                        1
                    } else {
                        candidate + 1
                    };
                }
                candidate
            }
        }
    }
}

fn hashed_candidate(native_id: &str) -> i64 {
    let digest = Sha256::digest(native_id.as_bytes());
    let mut prefix = [0_u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    let folded = u64::from_be_bytes(prefix) % HASHED_ID_MODULUS;
    // 0 is the "absent" value on the downstream side.
    folded.max(1) as i64
}

impl IdStore for MemoryIdStore {
    fn store(&self, native_id: &str) -> Result<i64, IdStoreError> {
        let native_id = native_id.trim();
        if native_id.is_empty() {
            return Err(IdStoreError::EmptyNativeId);
        }
        let mut tables = self.tables.lock()?;
        if let Some(existing) = tables.forward.get(native_id) {
            return Ok(*existing);
        }
        let id = self.allocate(&mut tables, native_id);
        tables.forward.insert(native_id.to_string(), id);
        tables.reverse.insert(id, native_id.to_string());
        Ok(id)
    }

    fn resolve(&self, id: i64) -> Result<String, IdStoreError> {
        let tables = self.tables.lock()?;
        tables
            .reverse
            .get(&id)
            .cloned()
            .ok_or(IdStoreError::UnknownId(id))
    }

    fn alias(&self, native_id: &str) -> Result<i64, IdStoreError> {
        let native_id = native_id.trim();
        if native_id.is_empty() {
            return Err(IdStoreError::EmptyNativeId);
        }
        let mut tables = self.tables.lock()?;
        if let Some(existing) = tables.forward.get(native_id) {
            return Ok(*existing);
        }
        Ok(match self.allocation {
            IdAllocation::Hashed => hashed_candidate(native_id),
            IdAllocation::Sequential => self.allocate(&mut tables, native_id),
        })
    }
}
