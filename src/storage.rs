//! Bet persistence.
//!
//! Bets are stored by an external collaborator behind the [`BetStore`]
//! trait. The production store appends rows to a CSV file; tests use an
//! in-memory store. Neither is thread-safe on its own, the ledger wraps
//! them in a lock.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, info};

/// Number that wins the draw.
pub const LOTTERY_WINNER_NUMBER: u32 = 7574;

/// Date format used on the wire and on disk.
pub const BIRTHDATE_FORMAT: &str = "%Y-%m-%d";

/// A single bet placed through an agency. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bet {
    /// Agency the bet was placed at (1..=N)
    pub agency: u32,
    /// Gambler's identity document
    pub document: String,
    /// Gambler's full name
    pub name: String,
    pub birthdate: NaiveDate,
    /// Number the gambler bet on
    pub number: u32,
}

/// Decides whether a bet won the draw.
pub type WinnerPredicate = fn(&Bet) -> bool;

/// Default draw rule: the bet number matches the winning number.
pub fn has_won(bet: &Bet) -> bool {
    bet.number == LOTTERY_WINNER_NUMBER
}

/// Errors raised by a bet store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("bet store I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("bet store CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("corrupt bet record: {0}")]
    Corrupt(String),
}

/// Persistence capability for bets.
pub trait BetStore: Send {
    /// Append bets. Either every bet is visible to a later load or the call fails.
    fn append_bets(&mut self, bets: &[Bet]) -> Result<(), StoreError>;

    /// Load every bet stored so far.
    fn load_bets(&self) -> Result<Vec<Bet>, StoreError>;
}

/// On-disk row layout: `agency,name,document,birthdate,number`
#[derive(Debug, Serialize, Deserialize)]
struct BetRecord {
    agency: u32,
    name: String,
    document: String,
    birthdate: String,
    number: u32,
}

impl From<&Bet> for BetRecord {
    fn from(bet: &Bet) -> Self {
        Self {
            agency: bet.agency,
            name: bet.name.clone(),
            document: bet.document.clone(),
            birthdate: bet.birthdate.format(BIRTHDATE_FORMAT).to_string(),
            number: bet.number,
        }
    }
}

impl TryFrom<BetRecord> for Bet {
    type Error = StoreError;

    fn try_from(record: BetRecord) -> Result<Self, Self::Error> {
        let birthdate = NaiveDate::parse_from_str(&record.birthdate, BIRTHDATE_FORMAT)
            .map_err(|e| StoreError::Corrupt(format!("birthdate '{}': {e}", record.birthdate)))?;
        Ok(Bet {
            agency: record.agency,
            document: record.document,
            name: record.name,
            birthdate,
            number: record.number,
        })
    }
}

/// Append-only CSV file of bets.
pub struct CsvBetStore {
    path: PathBuf,
}

impl CsvBetStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        info!(path = %path.display(), "Initializing bet storage");
        Self { path }
    }
}

impl BetStore for CsvBetStore {
    fn append_bets(&mut self, bets: &[Bet]) -> Result<(), StoreError> {
        if bets.is_empty() {
            return Ok(());
        }

        // Serialize the whole batch first so a bad record never leaves a partial write
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(Vec::new());
        for bet in bets {
            writer.serialize(BetRecord::from(bet))?;
        }
        let rows = writer
            .into_inner()
            .map_err(|e| StoreError::Io(io::Error::new(e.error().kind(), e.error().to_string())))?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        io::Write::write_all(&mut file, &rows)?;
        file.sync_data()?;

        debug!(count = bets.len(), "Bets appended to storage");
        Ok(())
    }

    fn load_bets(&self) -> Result<Vec<Bet>, StoreError> {
        let file = match std::fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .from_reader(file);

        reader
            .deserialize::<BetRecord>()
            .map(|record| Bet::try_from(record?))
            .collect()
    }
}

/// Bet store kept entirely in memory.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MemoryBetStore {
    bets: Vec<Bet>,
}

#[cfg(test)]
impl MemoryBetStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
impl BetStore for MemoryBetStore {
    fn append_bets(&mut self, bets: &[Bet]) -> Result<(), StoreError> {
        self.bets.extend_from_slice(bets);
        Ok(())
    }

    fn load_bets(&self) -> Result<Vec<Bet>, StoreError> {
        Ok(self.bets.clone())
    }
}

#[cfg(test)]
pub(crate) fn test_bet(agency: u32, document: &str, number: u32) -> Bet {
    Bet {
        agency,
        document: document.to_string(),
        name: "Santiago Lorca".to_string(),
        birthdate: NaiveDate::from_ymd_opt(1999, 3, 17).unwrap(),
        number,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn temp_path() -> PathBuf {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        let n = COUNTER.fetch_add(1, Ordering::SeqCst);
        std::env::temp_dir().join(format!("lottery-bets-{}-{n}.csv", std::process::id()))
    }

    #[test]
    fn test_has_won() {
        assert!(has_won(&test_bet(1, "30904465", LOTTERY_WINNER_NUMBER)));
        assert!(!has_won(&test_bet(1, "30904465", 7723)));
    }

    #[test]
    fn test_missing_file_loads_empty() {
        let store = CsvBetStore::new(temp_path());
        assert!(store.load_bets().unwrap().is_empty());
    }

    #[test]
    fn test_csv_append_and_load() {
        let path = temp_path();
        let mut store = CsvBetStore::new(&path);

        store
            .append_bets(&[test_bet(1, "30904465", 7723), test_bet(2, "22333444", 7574)])
            .unwrap();
        store.append_bets(&[test_bet(3, "11222333", 12)]).unwrap();

        let bets = store.load_bets().unwrap();
        assert_eq!(bets.len(), 3);
        assert_eq!(bets[0], test_bet(1, "30904465", 7723));
        assert_eq!(bets[1].agency, 2);
        assert_eq!(bets[2].document, "11222333");

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_csv_name_with_comma() {
        let path = temp_path();
        let mut store = CsvBetStore::new(&path);

        let mut bet = test_bet(1, "30904465", 7723);
        bet.name = "Lorca, Santiago".to_string();
        store.append_bets(&[bet.clone()]).unwrap();

        assert_eq!(store.load_bets().unwrap(), vec![bet]);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_corrupt_birthdate() {
        let path = temp_path();
        std::fs::write(&path, "1,Juan,30904465,not-a-date,7723\n").unwrap();

        let store = CsvBetStore::new(&path);
        assert!(matches!(store.load_bets(), Err(StoreError::Corrupt(_))));
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_memory_store() {
        let mut store = MemoryBetStore::new();
        store.append_bets(&[test_bet(1, "1", 1)]).unwrap();
        store.append_bets(&[]).unwrap();
        assert_eq!(store.load_bets().unwrap().len(), 1);
    }
}
