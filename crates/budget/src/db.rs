//! # Budget snapshot (budget.dat)
//!
//! Persistensi state budget manager ke satu file flat:
//!
//! ```text
//! [magic message "MasternodeBudget"] [4-byte network magic] [body] [sha3-256]
//! ```
//!
//! Checksum di akhir file menutup seluruh byte sebelumnya. Urutan verifikasi
//! saat load: checksum → magic message → network magic → body. File corrupt
//! atau dari network lain dibuang; node lanjut dengan store kosong dan
//! re-sync dari peers.
//!
//! ## Atomic Write
//!
//! Write selalu ke temp file dulu, lalu rename. Ini mencegah corruption
//! jika node crash di tengah write.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::crypto::sha3_256_bytes;
use crate::manager::{BudgetManager, BudgetSnapshot};
use crate::params::ChainParams;

/// Budget cache file specific magic message.
const MAGIC_MESSAGE: &str = "MasternodeBudget";

#[derive(Debug, Error)]
pub enum DbError {
    #[error("failed to open budget file: {0}")]
    File(#[from] std::io::Error),

    #[error("file too small to carry a checksum")]
    HashRead,

    #[error("checksum mismatch, data corrupted")]
    IncorrectHash,

    #[error("invalid budget cache magic message")]
    IncorrectMagicMessage,

    #[error("invalid network magic number")]
    IncorrectMagicNumber,

    #[error("magic is ok but data has invalid format: {0}")]
    IncorrectFormat(String),
}

pub struct BudgetDb {
    path: PathBuf,
    message_start: [u8; 4],
}

impl BudgetDb {
    pub fn new<P: AsRef<Path>>(data_dir: P, params: &ChainParams) -> Self {
        BudgetDb {
            path: data_dir.as_ref().join("budget.dat"),
            message_start: params.message_start,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serialize a snapshot, checksum everything up to that point, then
    /// append the checksum.
    fn encode(&self, snapshot: &BudgetSnapshot) -> anyhow::Result<Vec<u8>> {
        let mut bytes: Vec<u8> = Vec::new();
        bincode::serialize_into(&mut bytes, MAGIC_MESSAGE)?;
        bincode::serialize_into(&mut bytes, &self.message_start)?;
        bincode::serialize_into(&mut bytes, snapshot)?;
        let checksum = sha3_256_bytes(&bytes);
        bytes.extend_from_slice(&checksum);
        Ok(bytes)
    }

    pub fn write(&self, snapshot: &BudgetSnapshot) -> anyhow::Result<()> {
        let start = Instant::now();
        let bytes = self.encode(snapshot)?;

        let tmp_path = self.path.with_extension("dat.tmp");
        std::fs::write(&tmp_path, &bytes)?;
        std::fs::rename(&tmp_path, &self.path)?;

        debug!(elapsed_ms = start.elapsed().as_millis() as u64, "written info to budget.dat");
        Ok(())
    }

    pub fn read(&self) -> Result<BudgetSnapshot, DbError> {
        let start = Instant::now();
        let bytes = std::fs::read(&self.path)?;
        if bytes.len() < 32 {
            return Err(DbError::HashRead);
        }

        // verify stored checksum matches the data preceding it
        let (data, stored_hash) = bytes.split_at(bytes.len() - 32);
        if sha3_256_bytes(data) != *stored_hash {
            return Err(DbError::IncorrectHash);
        }

        let mut cursor = Cursor::new(data);
        let magic: String = bincode::deserialize_from(&mut cursor)
            .map_err(|e| DbError::IncorrectFormat(e.to_string()))?;
        if magic != MAGIC_MESSAGE {
            return Err(DbError::IncorrectMagicMessage);
        }

        let network: [u8; 4] = bincode::deserialize_from(&mut cursor)
            .map_err(|e| DbError::IncorrectFormat(e.to_string()))?;
        if network != self.message_start {
            return Err(DbError::IncorrectMagicNumber);
        }

        let snapshot: BudgetSnapshot = bincode::deserialize_from(&mut cursor)
            .map_err(|e| DbError::IncorrectFormat(e.to_string()))?;

        debug!(elapsed_ms = start.elapsed().as_millis() as u64, "loaded info from budget.dat");
        Ok(snapshot)
    }

    /// Dry-run read: verify the file format without touching any state.
    pub fn verify(&self) -> Result<(), DbError> {
        self.read().map(|_| ())
    }
}

/// Flush the manager state to disk, first verifying the existing file the
/// way the masternode caches do: a missing or recreatable file is
/// overwritten, an unrecognized one is left for the operator.
pub fn dump_budgets(manager: &BudgetManager, db: &BudgetDb) -> bool {
    let start = Instant::now();

    debug!("verifying budget.dat format");
    match db.verify() {
        Ok(()) => {}
        Err(DbError::File(_)) => {
            debug!("missing budgets file - budget.dat, will try to recreate");
        }
        Err(DbError::IncorrectFormat(e)) => {
            debug!(error = %e, "magic is ok but data has invalid format, will try to recreate");
        }
        Err(e) => {
            warn!(error = %e, "error reading budget.dat, file format is unknown or invalid, please fix it manually");
            return false;
        }
    }

    debug!("writing info to budget.dat");
    if let Err(e) = db.write(&manager.snapshot()) {
        warn!(error = %e, "failed to write budget.dat");
        return false;
    }

    debug!(elapsed_ms = start.elapsed().as_millis() as u64, "budget dump finished");
    true
}

/// Load the snapshot into the manager at startup. Errors are tolerated: the
/// node continues with an empty store and re-syncs from peers.
pub fn load_budgets(manager: &BudgetManager, db: &BudgetDb) -> Result<(), DbError> {
    match db.read() {
        Ok(snapshot) => {
            manager.restore(snapshot);
            debug!("budget manager - cleaning");
            manager.check_and_remove();
            info!(state = %manager, "budget manager - result");
            Ok(())
        }
        Err(e) => {
            warn!(error = %e, "could not load budget.dat, starting with an empty budget store");
            Err(e)
        }
    }
}
