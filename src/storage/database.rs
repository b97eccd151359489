//! SQLite database for drivers, violation types and confirmed detections
//!
//! Table and column names (`vozac`, `prekrsaji`, `detektovano`) are shared
//! with existing databases and clients, so they are kept as-is. JSON field
//! names follow the columns.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Format of `detektovano.vrijeme`
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS vozac (
    vozac_id INTEGER PRIMARY KEY AUTOINCREMENT,
    ime TEXT,
    tablica TEXT UNIQUE,
    auto_tip TEXT,
    invalid INTEGER DEFAULT 0,
    rezervacija INTEGER DEFAULT 0
);

CREATE TABLE IF NOT EXISTS prekrsaji (
    prekrsaj_id INTEGER PRIMARY KEY AUTOINCREMENT,
    opis TEXT,
    kazna INTEGER
);

CREATE TABLE IF NOT EXISTS detektovano (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    vozac_id INTEGER,
    prekrsaj_id INTEGER,
    vrijeme TEXT,
    slika1 TEXT,
    slika2 TEXT,
    FOREIGN KEY(vozac_id) REFERENCES vozac(vozac_id),
    FOREIGN KEY(prekrsaj_id) REFERENCES prekrsaji(prekrsaj_id)
);
"#;

/// A registered driver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Driver {
    #[serde(rename = "vozac_id")]
    pub id: i64,
    #[serde(rename = "ime")]
    pub name: String,
    #[serde(rename = "tablica")]
    pub plate: String,
    #[serde(rename = "auto_tip")]
    pub vehicle_type: String,
    /// Holds an invalid-parking permit
    #[serde(rename = "invalid")]
    pub invalid_permit: bool,
    /// Holds a parking reservation
    #[serde(rename = "rezervacija")]
    pub reservation: bool,
}

/// Driver registration payload
#[derive(Debug, Clone, Deserialize)]
pub struct NewDriver {
    #[serde(rename = "ime")]
    pub name: String,
    #[serde(rename = "tablica")]
    pub plate: String,
    #[serde(rename = "auto_tip")]
    pub vehicle_type: String,
    #[serde(rename = "invalid", default)]
    pub invalid_permit: bool,
    #[serde(rename = "rezervacija", default)]
    pub reservation: bool,
}

/// A violation definition. `description` doubles as the detector class label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViolationType {
    #[serde(rename = "prekrsaj_id")]
    pub id: i64,
    #[serde(rename = "opis")]
    pub description: String,
    #[serde(rename = "kazna")]
    pub fine: i64,
}

/// Violation type registration payload
#[derive(Debug, Clone, Deserialize)]
pub struct NewViolationType {
    #[serde(rename = "opis")]
    pub description: String,
    #[serde(rename = "kazna")]
    pub fine: i64,
}

/// A confirmed violation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionRecord {
    pub id: i64,
    #[serde(rename = "vozac_id")]
    pub driver_id: i64,
    #[serde(rename = "prekrsaj_id")]
    pub violation_type_id: i64,
    #[serde(rename = "vrijeme")]
    pub timestamp: String,
    #[serde(rename = "slika1")]
    pub first_image: String,
    #[serde(rename = "slika2")]
    pub zoom_image: Option<String>,
}

/// Payload for recording a violation
#[derive(Debug, Clone, Deserialize)]
pub struct NewDetection {
    #[serde(rename = "vozac_id")]
    pub driver_id: i64,
    #[serde(rename = "prekrsaj_id")]
    pub violation_type_id: i64,
    #[serde(rename = "slika1")]
    pub first_image: String,
    #[serde(rename = "slika2", default)]
    pub zoom_image: Option<String>,
}

/// Database connection wrapper.
///
/// Every method is a single statement; there are no multi-statement
/// transactions.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at path
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database {:?}", path))?;
        info!("Opened database {:?}", path);
        Self::from_connection(conn)
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Initialize database schema
    pub fn init_schema(&self) -> Result<()> {
        self.conn
            .lock()
            .execute_batch(SCHEMA)
            .context("Failed to create database schema")?;
        debug!("Database schema ready");
        Ok(())
    }

    /// Register a driver, returning the new id
    pub fn insert_driver(&self, driver: &NewDriver) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO vozac (ime, tablica, auto_tip, invalid, rezervacija) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                driver.name,
                driver.plate,
                driver.vehicle_type,
                driver.invalid_permit,
                driver.reservation
            ],
        )?;
        let id = conn.last_insert_rowid();
        debug!("Inserted driver {} ({})", id, driver.plate);
        Ok(id)
    }

    /// Find a driver by exact plate
    pub fn driver_by_plate(&self, plate: &str) -> Result<Option<Driver>> {
        let conn = self.conn.lock();
        let driver = conn
            .query_row(
                "SELECT vozac_id, ime, tablica, auto_tip, invalid, rezervacija FROM vozac WHERE tablica = ?1",
                params![plate],
                driver_from_row,
            )
            .optional()?;
        Ok(driver)
    }

    /// All drivers in insertion order
    pub fn list_drivers(&self) -> Result<Vec<Driver>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT vozac_id, ime, tablica, auto_tip, invalid, rezervacija FROM vozac ORDER BY vozac_id",
        )?;
        let drivers = stmt
            .query_map([], driver_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(drivers)
    }

    /// Register a violation type, returning the new id
    pub fn insert_violation_type(&self, violation: &NewViolationType) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO prekrsaji (opis, kazna) VALUES (?1, ?2)",
            params![violation.description, violation.fine],
        )?;
        let id = conn.last_insert_rowid();
        debug!("Inserted violation type {} ({})", id, violation.description);
        Ok(id)
    }

    /// Find a violation type by its description (detector class label)
    pub fn violation_type_by_description(&self, description: &str) -> Result<Option<ViolationType>> {
        let conn = self.conn.lock();
        let violation = conn
            .query_row(
                "SELECT prekrsaj_id, opis, kazna FROM prekrsaji WHERE opis = ?1",
                params![description],
                violation_type_from_row,
            )
            .optional()?;
        Ok(violation)
    }

    /// Find a violation type by id
    pub fn violation_type_by_id(&self, id: i64) -> Result<Option<ViolationType>> {
        let conn = self.conn.lock();
        let violation = conn
            .query_row(
                "SELECT prekrsaj_id, opis, kazna FROM prekrsaji WHERE prekrsaj_id = ?1",
                params![id],
                violation_type_from_row,
            )
            .optional()?;
        Ok(violation)
    }

    /// All violation types in insertion order
    pub fn list_violation_types(&self) -> Result<Vec<ViolationType>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT prekrsaj_id, opis, kazna FROM prekrsaji ORDER BY prekrsaj_id")?;
        let violations = stmt
            .query_map([], violation_type_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(violations)
    }

    /// Record a confirmed violation with the given timestamp
    pub fn insert_detection(&self, detection: &NewDetection, timestamp: &str) -> Result<DetectionRecord> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO detektovano (vozac_id, prekrsaj_id, vrijeme, slika1, slika2) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                detection.driver_id,
                detection.violation_type_id,
                timestamp,
                detection.first_image,
                detection.zoom_image
            ],
        )?;
        let id = conn.last_insert_rowid();
        info!(
            "Recorded violation {} (driver {}, type {})",
            id, detection.driver_id, detection.violation_type_id
        );

        Ok(DetectionRecord {
            id,
            driver_id: detection.driver_id,
            violation_type_id: detection.violation_type_id,
            timestamp: timestamp.to_string(),
            first_image: detection.first_image.clone(),
            zoom_image: detection.zoom_image.clone(),
        })
    }

    /// All confirmed violations in insertion order
    pub fn list_detections(&self) -> Result<Vec<DetectionRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, vozac_id, prekrsaj_id, vrijeme, slika1, slika2 FROM detektovano ORDER BY id",
        )?;
        let detections = stmt
            .query_map([], |row| {
                Ok(DetectionRecord {
                    id: row.get(0)?,
                    driver_id: row.get(1)?,
                    violation_type_id: row.get(2)?,
                    timestamp: row.get(3)?,
                    first_image: row.get(4)?,
                    zoom_image: row.get(5)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(detections)
    }
}

/// Current local time in [`TIMESTAMP_FORMAT`]
pub fn now_timestamp() -> String {
    chrono::Local::now().format(TIMESTAMP_FORMAT).to_string()
}

/// True when the error chain holds a UNIQUE / FOREIGN KEY violation
pub fn is_constraint_violation(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<rusqlite::Error>(),
            Some(rusqlite::Error::SqliteFailure(failure, _))
                if failure.code == rusqlite::ErrorCode::ConstraintViolation
        )
    })
}

fn driver_from_row(row: &Row<'_>) -> rusqlite::Result<Driver> {
    Ok(Driver {
        id: row.get(0)?,
        name: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
        plate: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
        vehicle_type: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
        invalid_permit: row.get::<_, Option<bool>>(4)?.unwrap_or(false),
        reservation: row.get::<_, Option<bool>>(5)?.unwrap_or(false),
    })
}

fn violation_type_from_row(row: &Row<'_>) -> rusqlite::Result<ViolationType> {
    Ok(ViolationType {
        id: row.get(0)?,
        description: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
        fine: row.get::<_, Option<i64>>(2)?.unwrap_or(0),
    })
}
