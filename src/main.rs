mod config;
mod db;
mod fetch;
mod importer;
mod normalize;
mod parser;
mod scheduler;
mod server;

use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use crate::config::Config;
use crate::server::AppState;

#[derive(Parser)]
#[command(name = "sei_tracker", about = "SEI process tracker and portal scraper")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database schema
    Init,
    /// Capture one portal page by URL
    Capture {
        url: String,
    },
    /// Capture a list of URLs (args, or one per line via --file)
    Batch {
        urls: Vec<String>,
        /// File with one URL per line
        #[arg(short, long)]
        file: Option<String>,
    },
    /// Import a saved HTML file without touching the network
    Import {
        file: String,
        /// Source URL to record for later refreshes
        #[arg(short, long)]
        url: Option<String>,
    },
    /// Re-fetch every process that has a stored source URL
    Update,
    /// Run the schedule check once (cron entrypoint)
    Cron,
    /// Show or change the refresh schedule
    Schedule {
        /// "manual" or "scheduled"; omit to show the current config
        #[arg(short, long)]
        mode: Option<String>,
        /// "daily" or "interval"
        #[arg(short = 't', long = "type")]
        schedule_type: Option<String>,
        /// HH:MM (UTC), for daily schedules
        #[arg(long)]
        daily_time: Option<String>,
        /// Hours between runs, for interval schedules
        #[arg(long)]
        interval_hours: Option<i64>,
    },
    /// Show database statistics
    Stats,
    /// Run the HTTP server
    Serve {
        #[arg(short, long, default_value = "0.0.0.0:3000")]
        addr: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let cfg = Config::from_env();

    let result = match cli.command {
        Commands::Init => {
            let conn = db::connect(&cfg.db_path)?;
            db::init_schema(&conn)?;
            println!("Schema ready at {}", cfg.db_path);
            Ok(())
        }
        Commands::Capture { url } => {
            let state = open_state(&cfg)?;
            let html = fetch::fetch_html(&state.client, &url, &cfg).await?;
            let scrape = parser::parse_sei(&html);
            let guard = state.conn.lock().await;
            let outcome = importer::import_scrape(&guard, &scrape, Some(&url))?;
            println!(
                "{}: +{} protocolos, +{} andamentos{}",
                outcome.numero,
                outcome.novos_protocolos,
                outcome.novos_andamentos,
                if outcome.acesso_restrito {
                    " (acesso restrito)"
                } else {
                    ""
                }
            );
            Ok(())
        }
        Commands::Batch { urls, file } => {
            let mut urls = urls;
            if let Some(path) = file {
                let content = std::fs::read_to_string(&path)?;
                urls.extend(
                    content
                        .lines()
                        .map(str::trim)
                        .filter(|l| !l.is_empty())
                        .map(str::to_owned),
                );
            }
            if urls.is_empty() {
                println!("No URLs given.");
                return Ok(());
            }
            let state = open_state(&cfg)?;
            let bar = spinner(&format!("Capturing {} URLs...", urls.len()));
            let items = scheduler::import_urls(&state.conn, &state.client, &cfg, urls).await;
            bar.finish_and_clear();
            let success = items.iter().filter(|i| i.success).count();
            for item in &items {
                match (&item.outcome, &item.error) {
                    (Some(out), _) => println!(
                        "  ok   {} -> {} (+{}/+{})",
                        item.url, out.numero, out.novos_protocolos, out.novos_andamentos
                    ),
                    (None, Some(err)) => println!("  fail {} ({})", item.url, err),
                    (None, None) => println!("  fail {}", item.url),
                }
            }
            println!("Done: {} ok, {} failed.", success, items.len() - success);
            Ok(())
        }
        Commands::Import { file, url } => {
            let html = std::fs::read_to_string(&file)?;
            let scrape = parser::parse_sei(&html);
            let conn = db::connect(&cfg.db_path)?;
            db::init_schema(&conn)?;
            let outcome = importer::import_scrape(&conn, &scrape, url.as_deref())?;
            println!(
                "{}: +{} protocolos, +{} andamentos",
                outcome.numero, outcome.novos_protocolos, outcome.novos_andamentos
            );
            Ok(())
        }
        Commands::Update => {
            let state = open_state(&cfg)?;
            let bar = spinner("Updating stored processes...");
            let job = scheduler::update_all_processes(&state.conn, &state.client, &cfg).await?;
            bar.finish_and_clear();
            for item in job.items.iter().filter(|i| !i.success) {
                println!(
                    "  fail {} ({})",
                    item.numero,
                    item.error.as_deref().unwrap_or("unknown")
                );
            }
            println!(
                "Updated {} processes ({} ok, {} failed): +{} protocolos, +{} andamentos",
                job.total, job.success, job.failed, job.novos_protocolos, job.novos_andamentos
            );
            Ok(())
        }
        Commands::Cron => {
            let state = open_state(&cfg)?;
            let outcome =
                scheduler::check_and_run_schedules(&state.conn, &state.client, &cfg).await?;
            if outcome.ran {
                if let Some(job) = &outcome.job {
                    println!("Ran: {} ok, {} failed.", job.success, job.failed);
                }
            } else {
                println!("Nothing due.");
            }
            if let Some(next) = &outcome.next_run {
                println!("Next run: {}", next);
            }
            Ok(())
        }
        Commands::Schedule {
            mode,
            schedule_type,
            daily_time,
            interval_hours,
        } => {
            let conn = db::connect(&cfg.db_path)?;
            db::init_schema(&conn)?;
            let row = match mode {
                Some(mode) => scheduler::save_schedule_config(
                    &conn,
                    &scheduler::ScheduleInput {
                        mode,
                        schedule_type,
                        daily_time,
                        interval_hours,
                    },
                )?,
                None => db::get_schedule(&conn)?.unwrap_or(db::ScheduleRow {
                    mode: "manual".into(),
                    schedule_type: None,
                    daily_time: None,
                    interval_hours: None,
                    next_run: None,
                }),
            };
            println!("Mode:     {}", row.mode);
            if let Some(t) = &row.schedule_type {
                println!("Type:     {}", t);
            }
            if let Some(t) = &row.daily_time {
                println!("Daily at: {} UTC", t);
            }
            if let Some(h) = row.interval_hours {
                println!("Every:    {}h", h);
            }
            if let Some(next) = &row.next_run {
                println!("Next run: {}", next);
            }
            Ok(())
        }
        Commands::Stats => {
            let conn = db::connect(&cfg.db_path)?;
            db::init_schema(&conn)?;
            let s = db::get_stats(&conn)?;
            println!("Processos:  {}", s.processos);
            println!("Com fonte:  {}", s.com_fonte);
            println!("Protocolos: {}", s.protocolos);
            println!("Andamentos: {}", s.andamentos);
            Ok(())
        }
        Commands::Serve { addr } => {
            let conn = db::connect(&cfg.db_path)?;
            db::init_schema(&conn)?;
            server::serve(AppState::new(conn, cfg.clone()), &addr).await
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }
    result
}

fn open_state(cfg: &Config) -> anyhow::Result<AppState> {
    let conn = db::connect(&cfg.db_path)?;
    db::init_schema(&conn)?;
    Ok(AppState::new(conn, cfg.clone()))
}

fn spinner(message: &str) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::with_template("{spinner} {msg}").unwrap_or(ProgressStyle::default_spinner()),
    );
    bar.set_message(message.to_string());
    bar.enable_steady_tick(Duration::from_millis(100));
    bar
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 60 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{:.1}s", d.as_secs_f64())
    }
}
