use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;

use crate::models::{IpRecord, Location, OffenderSummary, SubnetCluster, TIMESTAMP_FORMAT};

/// SQLite-backed store for addresses, attempts, bans and subnets.
///
/// Inserts are guarded by explicit existence checks; unique constraints are
/// a backstop, not control flow.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open or create database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(&path)
            .with_context(|| format!("Failed to open database: {}", path.as_ref().display()))?;

        let db = Self { conn };
        db.init_schema()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_memory() -> Result<Self> {
        let db = Self {
            conn: Connection::open_in_memory()?,
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            -- Derived network blocks
            CREATE TABLE IF NOT EXISTS subnets (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                subnet_id TEXT NOT NULL UNIQUE,
                cidr TEXT NOT NULL,
                netmask TEXT NOT NULL,
                host_count INTEGER NOT NULL
            );

            -- Offending addresses
            CREATE TABLE IF NOT EXISTS ip_addrs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ip TEXT NOT NULL UNIQUE,
                region TEXT,
                country TEXT,
                subnet_ref INTEGER REFERENCES subnets(id)
            );

            -- Rejected ssh logins
            CREATE TABLE IF NOT EXISTS breakin_attempts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                username TEXT,
                ip_ref INTEGER NOT NULL REFERENCES ip_addrs(id)
            );
            CREATE INDEX IF NOT EXISTS idx_attempts_ts_user ON breakin_attempts(timestamp, username);
            CREATE INDEX IF NOT EXISTS idx_attempts_ip ON breakin_attempts(ip_ref);

            -- fail2ban bans
            CREATE TABLE IF NOT EXISTS bans (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                ip_ref INTEGER NOT NULL REFERENCES ip_addrs(id)
            );
            CREATE INDEX IF NOT EXISTS idx_bans_ts ON bans(timestamp);
            CREATE INDEX IF NOT EXISTS idx_bans_ip ON bans(ip_ref);
            "#,
        )?;

        Ok(())
    }

    // ==================== IP Operations ====================

    pub fn find_ip(&self, ip: &str) -> Result<Option<IpRecord>> {
        self.conn
            .query_row(
                "SELECT id, ip, region, country, subnet_ref FROM ip_addrs WHERE ip = ?",
                [ip],
                row_to_ip,
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn create_ip(&self, ip: &str, location: &Location) -> Result<IpRecord> {
        self.conn.execute(
            "INSERT INTO ip_addrs (ip, region, country) VALUES (?, ?, ?)",
            params![ip, location.region, location.country],
        )?;

        Ok(IpRecord {
            id: self.conn.last_insert_rowid(),
            ip: ip.to_string(),
            region: location.region.clone(),
            country: location.country.clone(),
            subnet_ref: None,
        })
    }

    /// Point `ip` at a subnet. Returns false if the address is unknown.
    pub fn set_ip_subnet(&self, ip: &str, subnet_ref: i64) -> Result<bool> {
        let rows = self.conn.execute(
            "UPDATE ip_addrs SET subnet_ref = ? WHERE ip = ?",
            params![subnet_ref, ip],
        )?;
        Ok(rows > 0)
    }

    /// Addresses with at least `min` recorded attempts, in address order
    pub fn ips_with_attempt_count_at_least(&self, min: u32) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT i.ip FROM ip_addrs i
             JOIN breakin_attempts a ON a.ip_ref = i.id
             GROUP BY i.id HAVING COUNT(a.id) >= ?
             ORDER BY i.ip",
        )?;

        let ips = stmt
            .query_map([min], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;

        Ok(ips)
    }

    // ==================== Attempt Operations ====================

    pub fn attempt_exists(&self, timestamp: NaiveDateTime, username: Option<&str>) -> Result<bool> {
        let exists = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM breakin_attempts WHERE timestamp = ? AND username IS ?)",
            params![format_ts(timestamp), username],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    pub fn insert_attempt(
        &self,
        timestamp: NaiveDateTime,
        username: Option<&str>,
        ip_ref: i64,
    ) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO breakin_attempts (timestamp, username, ip_ref) VALUES (?, ?, ?)",
            params![format_ts(timestamp), username, ip_ref],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn count_attempts(&self) -> Result<u64> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM breakin_attempts", [], |row| row.get(0))?;
        Ok(count)
    }

    // ==================== Ban Operations ====================

    pub fn ban_exists(&self, timestamp: NaiveDateTime, ip: &str) -> Result<bool> {
        let exists = self.conn.query_row(
            "SELECT EXISTS(
                SELECT 1 FROM bans b JOIN ip_addrs i ON b.ip_ref = i.id
                WHERE b.timestamp = ? AND i.ip = ?
            )",
            params![format_ts(timestamp), ip],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    pub fn insert_ban(&self, timestamp: NaiveDateTime, ip_ref: i64) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO bans (timestamp, ip_ref) VALUES (?, ?)",
            params![format_ts(timestamp), ip_ref],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn count_bans(&self) -> Result<u64> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM bans", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Delete every stored attempt and ban. Returns (attempts, bans) removed.
    pub fn clear_events(&self) -> Result<(usize, usize)> {
        let attempts = self.conn.execute("DELETE FROM breakin_attempts", [])?;
        let bans = self.conn.execute("DELETE FROM bans", [])?;
        Ok((attempts, bans))
    }

    // ==================== Subnet Operations ====================

    pub fn find_subnet(&self, subnet_id: &str) -> Result<Option<SubnetCluster>> {
        self.conn
            .query_row(
                "SELECT id, subnet_id, cidr, netmask, host_count FROM subnets WHERE subnet_id = ?",
                [subnet_id],
                row_to_subnet,
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn insert_subnet(&self, subnet: &SubnetCluster) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO subnets (subnet_id, cidr, netmask, host_count) VALUES (?, ?, ?, ?)",
            params![subnet.subnet_id, subnet.cidr, subnet.netmask, subnet.host_count],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn count_subnets(&self) -> Result<u64> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM subnets", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Every stored subnet with its member addresses
    pub fn list_subnets(&self) -> Result<Vec<(SubnetCluster, Vec<String>)>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, subnet_id, cidr, netmask, host_count FROM subnets ORDER BY subnet_id",
        )?;
        let subnets = stmt
            .query_map([], row_to_subnet)?
            .collect::<Result<Vec<_>, _>>()?;

        let mut members_stmt = self
            .conn
            .prepare("SELECT ip FROM ip_addrs WHERE subnet_ref = ? ORDER BY ip")?;

        let mut listed = Vec::with_capacity(subnets.len());
        for subnet in subnets {
            let members = members_stmt
                .query_map([subnet.id], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            listed.push((subnet, members));
        }

        Ok(listed)
    }

    // ==================== Statistics ====================

    /// Addresses with at least `min` attempts, most active first
    pub fn offenders(&self, min: u32) -> Result<Vec<OffenderSummary>> {
        let mut stmt = self.conn.prepare(
            "SELECT * FROM (
                SELECT i.ip, i.region, i.country, s.subnet_id, s.cidr,
                    (SELECT COUNT(*) FROM breakin_attempts a WHERE a.ip_ref = i.id) AS attempts,
                    (SELECT COUNT(*) FROM bans b WHERE b.ip_ref = i.id) AS bans
                FROM ip_addrs i LEFT JOIN subnets s ON i.subnet_ref = s.id
             ) WHERE attempts >= ?
             ORDER BY attempts DESC, ip",
        )?;

        let offenders = stmt
            .query_map([min], |row| {
                let record = IpRecord {
                    id: 0,
                    ip: row.get(0)?,
                    region: row.get(1)?,
                    country: row.get(2)?,
                    subnet_ref: None,
                };
                let subnet = row
                    .get::<_, Option<String>>(3)?
                    .map(|id| format!("{}{}", id, row.get::<_, String>(4).unwrap_or_default()));

                Ok(OffenderSummary {
                    location: record.location(),
                    ip: record.ip,
                    attempts: row.get(5)?,
                    bans: row.get(6)?,
                    subnet,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(offenders)
    }
}

fn format_ts(timestamp: NaiveDateTime) -> String {
    timestamp.format(TIMESTAMP_FORMAT).to_string()
}

fn row_to_ip(row: &Row<'_>) -> rusqlite::Result<IpRecord> {
    Ok(IpRecord {
        id: row.get(0)?,
        ip: row.get(1)?,
        region: row.get(2)?,
        country: row.get(3)?,
        subnet_ref: row.get(4)?,
    })
}

fn row_to_subnet(row: &Row<'_>) -> rusqlite::Result<SubnetCluster> {
    Ok(SubnetCluster {
        id: Some(row.get(0)?),
        subnet_id: row.get(1)?,
        cidr: row.get(2)?,
        netmask: row.get(3)?,
        host_count: row.get(4)?,
    })
}
