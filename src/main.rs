use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use fieldvisits::db::models::NewTag;
use fieldvisits::visits::{Visit, VisitRequest};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "fieldvisits", version, about = "Group field recordings into station visits and classify them")]
struct Cli {
    /// Path to the SQLite database
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    /// Verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage monitoring stations
    Station {
        #[command(subcommand)]
        action: StationCommand,
    },

    /// Import recordings from JSON manifests (files or directories)
    Import {
        /// Manifest files or directories to walk
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Add a tag to a track
    Tag {
        track_id: i64,
        label: String,

        /// Tag as this person (defaults to the configured viewer)
        #[arg(long, conflicts_with = "model")]
        user: Option<String>,

        /// Tag as this AI model instead of a person
        #[arg(long)]
        model: Option<String>,
    },

    /// Show one page of classified visits
    Visits {
        #[command(flatten)]
        query: QueryArgs,

        /// Print the visits as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the page window for a visit query without fetching visits
    Pages {
        #[command(flatten)]
        query: QueryArgs,
    },

    /// Summarise visits per station over a recent period
    Digest {
        /// Hours back from now (defaults to config digest.hours)
        #[arg(long)]
        hours: Option<i64>,

        /// Group to include (repeatable; defaults to config digest.groups)
        #[arg(short, long = "group")]
        groups: Vec<i64>,

        /// AI model to compare against
        #[arg(long)]
        compare_ai: Option<String>,

        /// Print the digest as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show store statistics
    Stats,
}

#[derive(Subcommand)]
enum StationCommand {
    /// Add a station (rejected within 60m of an active station of the group)
    Add {
        #[arg(long)]
        group: i64,
        name: String,
        #[arg(allow_hyphen_values = true)]
        lat: f64,
        #[arg(allow_hyphen_values = true)]
        lng: f64,

        /// In service from (RFC 3339 or YYYY-MM-DD; defaults to now)
        #[arg(long, value_parser = parse_time)]
        active_at: Option<DateTime<Utc>>,
    },

    /// Take a station out of service
    Retire {
        id: i64,

        /// Retired from (RFC 3339 or YYYY-MM-DD; defaults to now)
        #[arg(long, value_parser = parse_time)]
        at: Option<DateTime<Utc>>,
    },

    /// List stations
    List {
        #[arg(long)]
        group: Option<i64>,
    },
}

#[derive(Args)]
struct QueryArgs {
    /// Group to include (repeatable)
    #[arg(short, long = "group")]
    groups: Vec<i64>,

    /// Station to include (repeatable)
    #[arg(short, long = "station")]
    stations: Vec<i64>,

    /// Search start (RFC 3339 or YYYY-MM-DD)
    #[arg(long, value_parser = parse_time)]
    from: Option<DateTime<Utc>>,

    /// Search end, exclusive (RFC 3339 or YYYY-MM-DD; defaults to now)
    #[arg(long, value_parser = parse_time)]
    until: Option<DateTime<Utc>>,

    #[arg(short, long, default_value = "1")]
    page: u32,

    /// Visits per page (defaults to config page_size)
    #[arg(short = 'n', long)]
    page_size: Option<u32>,

    /// AI model to compare against (defaults to config compare_ai)
    #[arg(long)]
    compare_ai: Option<String>,

    /// Super users: look past your own groups
    #[arg(long)]
    all: bool,
}

impl QueryArgs {
    fn request(self, config: &fieldvisits::config::AppConfig) -> VisitRequest {
        VisitRequest {
            groups: self.groups,
            stations: self.stations,
            from: self.from,
            until: self.until,
            page: self.page,
            page_size: self.page_size.unwrap_or(config.page_size),
            compare_ai: self.compare_ai.or_else(|| Some(config.compare_ai.clone())),
        }
    }
}

fn parse_time(s: &str) -> std::result::Result<DateTime<Utc>, String> {
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Ok(t.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
        .ok_or_else(|| format!("expected RFC 3339 or YYYY-MM-DD, got \"{s}\""))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .init();

    // Load config file (optional, defaults if missing)
    let config = fieldvisits::config::AppConfig::load();
    let viewer = config.viewer();

    // Resolve database path: CLI > config > XDG default
    let db_path = cli
        .db_path
        .or(config.db_path.clone())
        .unwrap_or_else(fieldvisits::config::default_db_path);
    log::info!("Database: {}", db_path.display());

    let db = fieldvisits::db::Database::open(&db_path).context("Failed to open database")?;

    match cli.command {
        Commands::Station { action } => match action {
            StationCommand::Add { group, name, lat, lng, active_at } => {
                let station = fieldvisits::db::models::NewStation {
                    group_id: group,
                    name,
                    location: fieldvisits::db::models::LatLng { lat, lng },
                    active_at: active_at.unwrap_or_else(Utc::now),
                };
                let id = fieldvisits::location::add_station(&db, &station)
                    .context("Failed to add station")?;
                let stamped = fieldvisits::ingest::stamp_unassigned(&db)
                    .context("Failed to stamp waiting recordings")?;
                println!("Added station {} \"{}\"", id, station.name);
                if stamped > 0 {
                    println!("Stamped {} waiting recordings", stamped);
                }
            }

            StationCommand::Retire { id, at } => {
                let at = at.unwrap_or_else(Utc::now);
                db.retire_station(id, at).context("Failed to retire station")?;
                println!("Station {} retired from {}", id, at.format("%Y-%m-%d %H:%M"));
            }

            StationCommand::List { group } => {
                let stations = db.list_stations(group).context("Query failed")?;
                if stations.is_empty() {
                    println!("No stations.");
                    return Ok(());
                }
                println!(
                    "{:>5} {:>5}  {:<24} {:>10} {:>11}  {:<16} {:<16}",
                    "Id", "Group", "Name", "Lat", "Lng", "Active", "Retired"
                );
                println!("{}", "-".repeat(96));
                for s in &stations {
                    println!(
                        "{:>5} {:>5}  {:<24} {:>10.5} {:>11.5}  {:<16} {:<16}",
                        s.id,
                        s.group_id,
                        truncate(&s.name, 24),
                        s.location.lat,
                        s.location.lng,
                        s.active_at.format("%Y-%m-%d %H:%M"),
                        s.retired_at
                            .map(|r| r.format("%Y-%m-%d %H:%M").to_string())
                            .unwrap_or_default(),
                    );
                }
            }
        },

        Commands::Import { paths } => {
            let result = fieldvisits::ingest::import_paths(&db, &paths).context("Import failed")?;
            println!(
                "Import complete: {} files, {} recordings ({} at stations), {} errors",
                result.files, result.recordings, result.stamped, result.errors
            );
        }

        Commands::Tag { track_id, label, user, model } => {
            let tag = match model {
                Some(model) => NewTag::automatic(&label, &model),
                None => NewTag::human(&label, user.as_deref().unwrap_or(&viewer.user)),
            };
            let id = db.add_track_tag(track_id, &tag).context("Failed to add tag")?;
            println!("Tag {} added to track {}", id, track_id);
        }

        Commands::Visits { query, json } => {
            let elevated = query.all;
            let request = query.request(&config);
            let criteria = fieldvisits::visits::visit_criteria(&db, &viewer, &request, elevated)
                .context("Invalid visit query")?;
            let visits = fieldvisits::visits::generate_visits(&db, &viewer, &criteria)
                .context("Query failed")?;

            if json {
                println!("{}", serde_json::to_string_pretty(&visits)?);
                return Ok(());
            }
            if visits.is_empty() {
                println!("No visits found.");
                return Ok(());
            }

            println!(
                "Page {} of ~{} ({} visits, comparing {}):",
                criteria.page,
                criteria.pages_estimate,
                visits.len(),
                criteria.compare_ai
            );
            println!();
            print_visit_table(&visits);
        }

        Commands::Pages { query } => {
            let elevated = query.all;
            let request = query.request(&config);
            let criteria = fieldvisits::visits::visit_criteria(&db, &viewer, &request, elevated)
                .context("Invalid visit query")?;
            println!("{}", serde_json::to_string_pretty(&criteria)?);
        }

        Commands::Digest { hours, groups, compare_ai, json } => {
            let hours = hours.unwrap_or(config.digest.hours);
            let until = Utc::now();
            let Some(from) = fieldvisits::digest::period_start(until, hours) else {
                anyhow::bail!("Digest period of {} hours is out of range", hours);
            };
            let groups = if groups.is_empty() { config.digest.groups.clone() } else { groups };
            let compare_ai = compare_ai.unwrap_or_else(|| config.compare_ai.clone());

            let digest = fieldvisits::digest::build_digest(
                &db,
                &viewer,
                &groups,
                from,
                until,
                Some(&compare_ai),
            )
            .context("Digest failed")?;

            if json {
                println!("{}", serde_json::to_string_pretty(&digest)?);
                return Ok(());
            }

            println!(
                "Visits {} .. {}: {} at {} stations",
                digest.from.format("%Y-%m-%d %H:%M"),
                digest.until.format("%Y-%m-%d %H:%M"),
                digest.visits,
                digest.stations.len()
            );
            for s in &digest.stations {
                println!();
                let incomplete = if s.incomplete > 0 {
                    format!(" ({} continuing from earlier)", s.incomplete)
                } else {
                    String::new()
                };
                println!("{} [#{}]: {} visits{}", s.name, s.station_id, s.visits, incomplete);
                let mut counts: Vec<(&String, &u64)> = s.classifications.iter().collect();
                counts.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
                for (label, count) in counts {
                    println!("  {:<20} {}", label, count);
                }
            }
        }

        Commands::Stats => {
            let stats = db.stats().context("Failed to get stats")?;
            println!("Store Statistics");
            println!("================");
            println!("Stations:         {} ({} active)", stats.stations, stats.active_stations);
            println!(
                "Recordings:       {} ({} without a station)",
                stats.recordings, stats.unassigned_recordings
            );
            println!("Tracks:           {}", stats.tracks);
            println!("Human tags:       {}", stats.human_tags);
            println!("Automatic tags:   {}", stats.automatic_tags);

            if !stats.models.is_empty() {
                println!();
                println!("Models:");
                for (model, count) in &stats.models {
                    println!("  {:<20} {}", model, count);
                }
            }
        }
    }

    Ok(())
}

fn truncate(s: &str, width: usize) -> String {
    if s.chars().count() > width {
        let cut: String = s.chars().take(width - 3).collect();
        format!("{}...", cut)
    } else {
        s.to_string()
    }
}

/// Print a table of visits, newest first.
fn print_visit_table(visits: &[Visit]) {
    println!(
        "{:>7}  {:<16} {:>6} {:>4} {:>4}  {:<18} {:<18}",
        "Station", "Start", "Min", "Recs", "Trk", "Classification", "AI"
    );
    println!("{}", "-".repeat(84));

    for v in visits {
        let minutes = (v.end - v.start).num_seconds() as f64 / 60.0;
        let marker = if v.incomplete { "*" } else { "" };
        println!(
            "{:>7}  {:<16} {:>6.1} {:>4} {:>4}  {:<18} {:<18}",
            v.station_id,
            format!("{}{}", v.start.format("%Y-%m-%d %H:%M"), marker),
            minutes,
            v.recordings.len(),
            v.track_count(),
            truncate(&v.classification, 18),
            truncate(&v.ai_classification, 18),
        );
    }

    if visits.iter().any(|v| v.incomplete) {
        println!();
        println!("* visit started before the searched range");
    }
}
