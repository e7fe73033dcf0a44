//! # crsentry
//!
//! Monthly aggregator for ssh break-in attempts and fail2ban bans.
//!
//! A run reads last month's `auth.log*` and `fail2ban.log*` files, stores each
//! rejected login and ban against the offending address (geolocated once, on
//! first sight), then groups repeat offenders into estimated subnets.
//!
//! ```text
//! scanner -> extractor -> database <- geolocate
//!                            |
//!                         cluster
//! ```

pub mod cluster;
pub mod config;
pub mod database;
pub mod extractor;
pub mod geolocate;
pub mod matcher;
pub mod models;
pub mod scanner;

use anyhow::Result;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use config::Config;
use database::Database;
use extractor::{EventAccumulator, EventExtractor, ReportMonth};
use geolocate::Geolocator;
use matcher::LineMatcher;
use models::{IpRecord, OffenderSummary, RunSummary, SubnetCluster};
use scanner::LogCorpusScanner;

/// Core crsentry instance
pub struct Crsentry {
    config: Config,
    db: Database,
    locator: Box<dyn Geolocator>,
}

impl Crsentry {
    /// Open the configured database and geolocation service
    pub fn new(config: Config) -> Result<Self> {
        let db = Database::open(config.db_path())?;
        let locator = geolocate::from_config(&config.geolocation)?;

        Ok(Self {
            config,
            db,
            locator,
        })
    }

    /// Assemble from already-built parts
    pub fn with_parts(config: Config, db: Database, locator: Box<dyn Geolocator>) -> Self {
        Self {
            config,
            db,
            locator,
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Full run over the month before today
    pub async fn run(&self) -> Result<RunSummary> {
        self.run_for(ReportMonth::current()).await
    }

    /// Full run over `month`: scan, extract, enrich, persist, cluster
    pub async fn run_for(&self, month: ReportMonth) -> Result<RunSummary> {
        info!(
            "Processing {} {} from {}",
            month.abbreviation(),
            month.year(),
            self.config.log_dir().display()
        );

        let mut summary = RunSummary::default();

        let acc = self.read_logs(month, &mut summary)?;
        info!(
            "Found {} break-in attempts and {} bans",
            summary.attempts_found, summary.bans_found
        );

        self.insert_events(&acc, &mut summary).await?;

        let (found, created) = self.calculate_common_subnets()?;
        summary.subnets_found = found;
        summary.subnets_created = created;

        info!(
            "Run finished: {} new addresses, {} attempts and {} bans stored, {} subnets ({} new)",
            summary.new_ips,
            summary.attempts_inserted,
            summary.bans_inserted,
            summary.subnets_found,
            summary.subnets_created
        );
        Ok(summary)
    }

    /// Scan the log directory and extract every event from `month`
    pub fn read_logs(&self, month: ReportMonth, summary: &mut RunSummary) -> Result<EventAccumulator> {
        let matcher = LineMatcher::new()?
            .with_host_name(self.config.matcher.host_name.clone())
            .with_ban_jail(self.config.matcher.ban_jail.clone());
        let extractor = EventExtractor::new(matcher, month);

        let scanner = LogCorpusScanner::new(self.config.log_dir(), month.retention_cutoff());
        let sources = scanner.scan()?;
        summary.files_scanned = sources.len();

        let mut acc = EventAccumulator::new();
        for source in &sources {
            let accepted = extractor.extract(&source.lines, source.kind, &mut acc);
            debug!("{}: {} events", source.path.display(), accepted);
        }

        summary.attempts_found = acc.attempts().len();
        summary.bans_found = acc.bans().len();
        Ok(acc)
    }

    /// Persist extracted events, skipping any already stored
    pub async fn insert_events(
        &self,
        acc: &EventAccumulator,
        summary: &mut RunSummary,
    ) -> Result<()> {
        let mut ip_refs: HashMap<String, i64> = HashMap::new();

        for ip in acc.attempt_ips() {
            self.ip_ref(&ip, &mut ip_refs, summary).await?;
        }

        for attempt in acc.breakin_attempts() {
            let username = attempt.username.as_deref();
            if self.db.attempt_exists(attempt.timestamp, username)? {
                continue;
            }
            let ip_ref = self.ip_ref(&attempt.source_ip, &mut ip_refs, summary).await?;
            self.db.insert_attempt(attempt.timestamp, username, ip_ref)?;
            summary.attempts_inserted += 1;
        }

        for ban in acc.bans() {
            if self.db.ban_exists(ban.timestamp, &ban.source_ip)? {
                continue;
            }
            // Banned addresses may have no attempts in this run
            let ip_ref = self.ip_ref(&ban.source_ip, &mut ip_refs, summary).await?;
            self.db.insert_ban(ban.timestamp, ip_ref)?;
            summary.bans_inserted += 1;
        }

        Ok(())
    }

    async fn ip_ref(
        &self,
        ip: &str,
        cache: &mut HashMap<String, i64>,
        summary: &mut RunSummary,
    ) -> Result<i64> {
        if let Some(id) = cache.get(ip) {
            return Ok(*id);
        }

        let (record, created) = self.find_or_create_ip(ip).await?;
        if created {
            summary.new_ips += 1;
        }
        cache.insert(ip.to_string(), record.id);
        Ok(record.id)
    }

    /// Look up a stored address, creating and geolocating it on first sight.
    /// Returns whether it was created.
    pub async fn find_or_create_ip(&self, ip: &str) -> Result<(IpRecord, bool)> {
        if let Some(record) = self.db.find_ip(ip)? {
            return Ok((record, false));
        }

        let location = match self.locator.locate(ip).await {
            Ok(location) => location,
            Err(e) => {
                warn!("Location lookup for {} failed: {:#}", ip, e);
                Default::default()
            }
        };

        let delay = self.locator.request_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let record = self.db.create_ip(ip, &location)?;
        debug!("Stored new address {} ({})", ip, record.location());
        Ok((record, true))
    }

    /// Recompute subnets from stored attempt counts and link their members.
    /// Returns (clusters found, clusters newly stored).
    pub fn calculate_common_subnets(&self) -> Result<(usize, usize)> {
        let min_attempts = self.config.subnets.min_attempts;
        let ips = self.db.ips_with_attempt_count_at_least(min_attempts)?;
        info!(
            "{} addresses with at least {} attempts",
            ips.len(),
            min_attempts
        );

        let clusters = cluster::find_clusters(&ips);
        let mut created = 0;

        for found in &clusters {
            let stored = self.db.find_subnet(&found.subnet.subnet_id)?;
            let subnet_ref = match stored.as_ref().and_then(|s| s.id) {
                Some(id) => id,
                None => {
                    created += 1;
                    self.db.insert_subnet(&found.subnet)?
                }
            };

            if let Some(existing) = stored.filter(|s| s.cidr != found.subnet.cidr) {
                debug!(
                    "Group {} estimated {}{}, linking members to stored {}{}",
                    found.prefix,
                    found.subnet.subnet_id,
                    found.subnet.cidr,
                    existing.subnet_id,
                    existing.cidr
                );
            }

            for member in &found.members {
                if !self.db.set_ip_subnet(member, subnet_ref)? {
                    warn!(
                        "No stored address {} to link to subnet {}",
                        member, found.subnet.subnet_id
                    );
                }
            }

            info!(
                "Subnet {}{} ({} members)",
                found.subnet.subnet_id,
                found.subnet.cidr,
                found.members.len()
            );
        }

        Ok((clusters.len(), created))
    }

    pub fn list_subnets(&self) -> Result<Vec<(SubnetCluster, Vec<String>)>> {
        self.db.list_subnets()
    }

    pub fn offenders(&self, min_attempts: u32) -> Result<Vec<OffenderSummary>> {
        self.db.offenders(min_attempts)
    }

    /// Delete stored attempts and bans. Addresses and subnets are kept.
    pub fn clear_events(&self) -> Result<(usize, usize)> {
        let (attempts, bans) = self.db.clear_events()?;
        info!("Deleted {} attempts and {} bans", attempts, bans);
        Ok((attempts, bans))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::NaiveDateTime;
    use geolocate::OfflineGeolocator;
    use models::{AttemptDetails, BanEvent, Location};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::Instant;

    fn ts(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    fn offline() -> Crsentry {
        Crsentry::with_parts(
            Config::default(),
            Database::open_memory().unwrap(),
            Box::new(OfflineGeolocator),
        )
    }

    struct FailingLocator;

    #[async_trait]
    impl Geolocator for FailingLocator {
        async fn locate(&self, _ip: &str) -> Result<Location> {
            anyhow::bail!("connection refused")
        }

        fn name(&self) -> &'static str {
            "failing"
        }
    }

    /// Rate-limited service; `fail` makes every lookup error out
    struct ThrottledLocator {
        fail: bool,
    }

    #[async_trait]
    impl Geolocator for ThrottledLocator {
        async fn locate(&self, _ip: &str) -> Result<Location> {
            if self.fail {
                anyhow::bail!("503 Service Unavailable");
            }
            Ok(Location::default())
        }

        fn request_delay(&self) -> Duration {
            Duration::from_secs(2)
        }

        fn name(&self) -> &'static str {
            "throttled"
        }
    }

    fn throttled(fail: bool) -> Crsentry {
        Crsentry::with_parts(
            Config::default(),
            Database::open_memory().unwrap(),
            Box::new(ThrottledLocator { fail }),
        )
    }

    struct CountingLocator(Arc<AtomicUsize>);

    #[async_trait]
    impl Geolocator for CountingLocator {
        async fn locate(&self, _ip: &str) -> Result<Location> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Location {
                region: Some("McMurdo".to_string()),
                country: Some("Antarctica".to_string()),
            })
        }

        fn name(&self) -> &'static str {
            "counting"
        }
    }

    fn seed_attempts(app: &Crsentry, ip: &str, count: u32) {
        let record = app.db.create_ip(ip, &Location::default()).unwrap();
        for minute in 0..count {
            app.db
                .insert_attempt(
                    ts(&format!("2024-06-10 12:{:02}:00", minute)),
                    Some(&format!("{}-{}", ip, minute)),
                    record.id,
                )
                .unwrap();
        }
    }

    fn sample_events() -> EventAccumulator {
        let mut acc = EventAccumulator::new();
        for (when, ip, user) in [
            ("2024-06-10 12:40:05", "61.174.51.217", "admin"),
            ("2024-06-10 12:40:05", "61.174.51.217", "oracle"),
            ("2024-06-11 08:00:00", "116.10.191.234", "root"),
        ] {
            acc.insert_attempt(
                ts(when),
                AttemptDetails {
                    source_ip: ip.to_string(),
                    username: Some(user.to_string()),
                },
            );
        }
        acc.insert_ban(BanEvent {
            timestamp: ts("2024-06-10 12:40:07"),
            source_ip: "61.174.51.217".to_string(),
        });
        acc.insert_ban(BanEvent {
            timestamp: ts("2024-06-12 09:00:00"),
            source_ip: "203.0.113.50".to_string(),
        });
        acc
    }

    #[tokio::test]
    async fn test_insert_events_is_idempotent() {
        let app = offline();
        let acc = sample_events();

        let mut first = RunSummary::default();
        app.insert_events(&acc, &mut first).await.unwrap();
        assert_eq!(first.attempts_inserted, 3);
        assert_eq!(first.bans_inserted, 2);
        assert_eq!(first.new_ips, 3);

        let mut second = RunSummary::default();
        app.insert_events(&acc, &mut second).await.unwrap();
        assert_eq!(second.attempts_inserted, 0);
        assert_eq!(second.bans_inserted, 0);
        assert_eq!(second.new_ips, 0);

        assert_eq!(app.db.count_attempts().unwrap(), 3);
        assert_eq!(app.db.count_bans().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_ban_only_address_is_created() {
        let app = offline();
        let mut summary = RunSummary::default();
        app.insert_events(&sample_events(), &mut summary).await.unwrap();

        let record = app.db.find_ip("203.0.113.50").unwrap().unwrap();
        assert_eq!(record.region, None);
        assert!(app.db.ban_exists(ts("2024-06-12 09:00:00"), "203.0.113.50").unwrap());
    }

    #[tokio::test]
    async fn test_failed_lookup_still_stores_address() {
        let app = Crsentry::with_parts(
            Config::default(),
            Database::open_memory().unwrap(),
            Box::new(FailingLocator),
        );

        let (record, created) = app.find_or_create_ip("10.0.0.1").await.unwrap();
        assert!(created);
        assert_eq!(record.location(), "-");
        assert!(app.db.find_ip("10.0.0.1").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_known_address_not_looked_up_again() {
        let calls = Arc::new(AtomicUsize::new(0));
        let app = Crsentry::with_parts(
            Config::default(),
            Database::open_memory().unwrap(),
            Box::new(CountingLocator(calls.clone())),
        );

        let mut summary = RunSummary::default();
        app.insert_events(&sample_events(), &mut summary).await.unwrap();
        app.insert_events(&sample_events(), &mut summary).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let record = app.db.find_ip("61.174.51.217").unwrap().unwrap();
        assert_eq!(record.location(), "McMurdo, Antarctica");
    }

    #[test]
    fn test_common_subnets() {
        let app = offline();
        for ip in ["192.168.1.1", "192.168.1.30", "192.168.1.26"] {
            seed_attempts(&app, ip, 3);
        }

        assert_eq!(app.calculate_common_subnets().unwrap(), (1, 1));
        let subnet = app.db.find_subnet("192.168.1.0").unwrap().unwrap();
        assert_eq!(subnet.cidr, "/27");
        assert_eq!(subnet.netmask, "255.255.255.224");
        assert_eq!(subnet.host_count, 30);

        for ip in ["172.16.64.1", "172.16.111.30", "172.16.123.26"] {
            seed_attempts(&app, ip, 3);
        }

        // The /24 cluster is found again but not stored twice
        assert_eq!(app.calculate_common_subnets().unwrap(), (2, 1));
        assert_eq!(app.db.count_subnets().unwrap(), 2);

        let subnet = app.db.find_subnet("172.16.64.0").unwrap().unwrap();
        assert_eq!(subnet.cidr, "/18");
        assert_eq!(subnet.netmask, "255.255.192.0");
        assert_eq!(subnet.host_count, 16382);

        let member = app.db.find_ip("172.16.111.30").unwrap().unwrap();
        assert_eq!(member.subnet_ref, subnet.id);
    }

    #[test]
    fn test_light_offenders_not_clustered() {
        let app = offline();
        seed_attempts(&app, "192.168.1.1", 3);
        seed_attempts(&app, "192.168.1.30", 3);
        seed_attempts(&app, "192.168.1.31", 2);

        assert_eq!(app.calculate_common_subnets().unwrap(), (1, 1));
        let listed = app.list_subnets().unwrap();
        assert_eq!(listed[0].1, vec!["192.168.1.1", "192.168.1.30"]);
        assert_eq!(
            app.db.find_ip("192.168.1.31").unwrap().unwrap().subnet_ref,
            None
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookups_wait_request_delay() {
        let app = throttled(false);

        let start = Instant::now();
        app.find_or_create_ip("10.0.0.1").await.unwrap();
        app.find_or_create_ip("10.0.0.2").await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(4));

        // Known addresses are not looked up, so no wait
        let before = Instant::now();
        let (_, created) = app.find_or_create_ip("10.0.0.1").await.unwrap();
        assert!(!created);
        assert_eq!(before.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_lookup_still_waits() {
        let app = throttled(true);

        let start = Instant::now();
        let (record, created) = app.find_or_create_ip("10.0.0.1").await.unwrap();
        assert!(created);
        assert_eq!(record.location(), "-");
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[test]
    fn test_same_network_address_shares_stored_subnet() {
        let app = offline();
        // /24 spread 1..200 -> 10.1.0.0/24, /16 spread 0..3 -> 10.1.0.0/22
        for ip in ["10.1.0.1", "10.1.0.200", "10.1.3.5"] {
            seed_attempts(&app, ip, 3);
        }

        assert_eq!(app.calculate_common_subnets().unwrap(), (2, 1));
        assert_eq!(app.db.count_subnets().unwrap(), 1);

        let subnet = app.db.find_subnet("10.1.0.0").unwrap().unwrap();
        assert_eq!(subnet.cidr, "/22");
        for ip in ["10.1.0.1", "10.1.0.200", "10.1.3.5"] {
            assert_eq!(app.db.find_ip(ip).unwrap().unwrap().subnet_ref, subnet.id);
        }
    }
}
