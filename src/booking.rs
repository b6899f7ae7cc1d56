use std::io::{self, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use ulid::Ulid;

use crate::model::BookingRecord;

/// Downstream system of record for confirmed bookings. The coordinator
/// records here BEFORE marking the slot booked; a failure here aborts
/// the confirmation and leaves the hold in place.
#[async_trait]
pub trait BookingStore: Send + Sync {
    /// Durably record a booking.
    async fn record(&self, booking: &BookingRecord) -> io::Result<()>;

    /// Remove a previously recorded booking. Compensation path for when
    /// the slot transition fails after the record already landed.
    async fn remove(&self, id: Ulid) -> io::Result<()>;
}

/// One journal line. Removals are appended rather than rewritten in
/// place, keeping the file append-only and crash-tolerant.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum JournalLine {
    Record { booking: BookingRecord },
    Remove { id: Ulid },
}

/// Booking store journaling to a JSON-lines file, one object per line.
pub struct FileBookingStore {
    path: PathBuf,
    // Serializes appends so concurrent confirms don't interleave lines.
    file: Mutex<std::fs::File>,
}

impl FileBookingStore {
    /// Open (or create) the journal at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the journal back and fold removals, returning live bookings
    /// in record order. A torn trailing line (crash mid-append) is
    /// discarded, like a truncated WAL entry.
    pub fn read_live(path: &Path) -> io::Result<Vec<BookingRecord>> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut live: Vec<BookingRecord> = Vec::new();
        for line in contents.lines() {
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<JournalLine>(line) {
                Ok(JournalLine::Record { booking }) => live.push(booking),
                Ok(JournalLine::Remove { id }) => live.retain(|b| b.id != id),
                Err(_) => break, // torn trailing line
            }
        }
        Ok(live)
    }

    async fn append_line(&self, line: &JournalLine) -> io::Result<()> {
        let mut buf = serde_json::to_vec(line)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        buf.push(b'\n');
        let mut file = self.file.lock().await;
        file.write_all(&buf)?;
        file.sync_all()
    }
}

#[async_trait]
impl BookingStore for FileBookingStore {
    async fn record(&self, booking: &BookingRecord) -> io::Result<()> {
        self.append_line(&JournalLine::Record {
            booking: booking.clone(),
        })
        .await
    }

    async fn remove(&self, id: Ulid) -> io::Result<()> {
        self.append_line(&JournalLine::Remove { id }).await
    }
}
