use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use tabled::{Table, Tabled};

use crsentry::config::Config;
use crsentry::models::RunSummary;
use crsentry::Crsentry;

#[derive(Parser)]
#[command(name = "crsentry")]
#[command(author, version, about = "Monthly ssh break-in and fail2ban ban aggregator")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    /// Directory holding auth.log* and fail2ban.log* (overrides config)
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,

    /// Database path (overrides config)
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    /// Skip geolocation lookups
    #[arg(long, global = true)]
    pub offline: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Process last month's logs and update subnets
    Run,

    /// Show stored subnets
    Subnets {
        /// Recompute subnets from stored attempts first
        #[arg(short, long)]
        recompute: bool,

        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// List repeat offenders
    Offenders {
        /// Minimum number of attempts
        #[arg(short, long, default_value = "3")]
        min: u32,

        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Delete all stored attempts and bans
    Clear {
        /// Skip confirmation
        #[arg(short, long)]
        yes: bool,
    },

    /// Generate default configuration
    GenConfig {
        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Table row for subnet list
#[derive(Tabled)]
struct SubnetRow {
    #[tabled(rename = "Subnet")]
    subnet: String,
    #[tabled(rename = "Netmask")]
    netmask: String,
    #[tabled(rename = "Hosts")]
    hosts: u32,
    #[tabled(rename = "Members")]
    members: String,
}

/// Table row for offender list
#[derive(Tabled)]
struct OffenderRow {
    #[tabled(rename = "IP")]
    ip: String,
    #[tabled(rename = "Attempts")]
    attempts: u32,
    #[tabled(rename = "Bans")]
    bans: u32,
    #[tabled(rename = "Location")]
    location: String,
    #[tabled(rename = "Subnet")]
    subnet: String,
}

/// Load the configuration named on the command line (or the default one)
/// and apply the override flags.
pub fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default()?,
    };

    if let Some(dir) = &cli.log_dir {
        config.general.log_dir = dir.display().to_string();
    }
    if let Some(db) = &cli.db {
        config.general.db_path = db.display().to_string();
    }
    if cli.offline {
        config.geolocation.enabled = false;
    }

    Ok(config)
}

pub async fn run_command(cli: Cli, config: Config) -> Result<()> {
    match cli.command {
        Commands::Run => cmd_run(config).await,
        Commands::Subnets { recompute, json } => cmd_subnets(config, recompute, json),
        Commands::Offenders { min, json } => cmd_offenders(config, min, json),
        Commands::Clear { yes } => cmd_clear(config, yes),
        Commands::GenConfig { output } => cmd_gen_config(output),
    }
}

async fn cmd_run(config: Config) -> Result<()> {
    let sentry = Crsentry::new(config)?;
    let summary = sentry.run().await?;
    print_summary(&summary);
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!("{}", "Run complete".green().bold());
    println!("  Files scanned:     {}", summary.files_scanned);
    println!(
        "  Attempts:          {} found, {} new",
        summary.attempts_found, summary.attempts_inserted
    );
    println!(
        "  Bans:              {} found, {} new",
        summary.bans_found, summary.bans_inserted
    );
    println!("  New addresses:     {}", summary.new_ips);
    println!(
        "  Subnets:           {} found, {} new",
        summary.subnets_found, summary.subnets_created
    );
}

fn cmd_subnets(config: Config, recompute: bool, json: bool) -> Result<()> {
    let sentry = Crsentry::new(config)?;

    if recompute {
        let (found, created) = sentry.calculate_common_subnets()?;
        if !json {
            println!(
                "{}",
                format!("{} subnets found, {} new", found, created).green().bold()
            );
        }
    }

    let subnets = sentry.list_subnets()?;

    if json {
        let listing: Vec<serde_json::Value> = subnets
            .iter()
            .map(|(subnet, members)| {
                serde_json::json!({
                    "subnet": subnet,
                    "members": members,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&listing)?);
        return Ok(());
    }

    if subnets.is_empty() {
        println!("No subnets stored");
        return Ok(());
    }

    let rows: Vec<SubnetRow> = subnets
        .into_iter()
        .map(|(subnet, members)| SubnetRow {
            subnet: format!("{}{}", subnet.subnet_id, subnet.cidr),
            netmask: subnet.netmask,
            hosts: subnet.host_count,
            members: members.join(", "),
        })
        .collect();

    println!("{}", Table::new(rows));
    Ok(())
}

fn cmd_offenders(config: Config, min: u32, json: bool) -> Result<()> {
    let sentry = Crsentry::new(config)?;
    let offenders = sentry.offenders(min)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&offenders)?);
        return Ok(());
    }

    if offenders.is_empty() {
        println!("No addresses with at least {} attempts", min);
        return Ok(());
    }

    let rows: Vec<OffenderRow> = offenders
        .into_iter()
        .map(|o| OffenderRow {
            ip: o.ip,
            attempts: o.attempts,
            bans: o.bans,
            location: o.location,
            subnet: o.subnet.unwrap_or_else(|| "-".to_string()),
        })
        .collect();

    println!("{}", Table::new(rows));
    Ok(())
}

fn cmd_clear(config: Config, yes: bool) -> Result<()> {
    if !yes {
        println!(
            "{}",
            "WARNING: This will delete ALL stored attempts and bans!".red().bold()
        );
        println!("Run with --yes to confirm");
        return Ok(());
    }

    let sentry = Crsentry::new(config)?;
    let (attempts, bans) = sentry.clear_events()?;
    println!(
        "{}",
        format!("Deleted {} attempts and {} bans", attempts, bans)
            .yellow()
            .bold()
    );
    Ok(())
}

fn cmd_gen_config(output: Option<PathBuf>) -> Result<()> {
    let config = Config::default();

    match output {
        Some(path) => {
            config.save(&path)?;
            println!("Configuration written to {}", path.display());
        }
        None => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
