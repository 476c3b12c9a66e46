use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, NaiveTime, Utc};
use reqwest::Client;
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::config::Config;
use crate::db::{self, SharedConn};
use crate::fetch::fetch_html;
use crate::importer::{self, ImportOutcome};
use crate::parser;

/// Refresh runs walk the stored processes in fixed-size slices so a large
/// database cannot fan out into hundreds of simultaneous portal requests.
const UPDATE_BATCH_SIZE: usize = 5;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateResult {
    pub processo_id: i64,
    pub numero: String,
    pub success: bool,
    pub novos_protocolos: usize,
    pub novos_andamentos: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateJobResult {
    pub job_id: String,
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    pub novos_protocolos: usize,
    pub novos_andamentos: usize,
    pub items: Vec<UpdateResult>,
}

/// Re-fetch one stored process from its source URL and merge the page.
pub async fn update_single_process(
    conn: &SharedConn,
    client: &Client,
    cfg: &Config,
    target: &db::ProcessoSource,
) -> UpdateResult {
    let failed = |error: String| UpdateResult {
        processo_id: target.id,
        numero: target.numero.clone(),
        success: false,
        novos_protocolos: 0,
        novos_andamentos: 0,
        error: Some(error),
    };

    let html = match fetch_html(client, &target.source_url, cfg).await {
        Ok(html) => html,
        Err(e) => {
            warn!(
                component = "scheduler",
                numero = %target.numero,
                error = %e,
                "update fetch failed"
            );
            return failed(e.to_string());
        }
    };
    let scrape = parser::parse_sei(&html);

    let outcome = {
        let guard = conn.lock().await;
        importer::import_scrape(&guard, &scrape, Some(&target.source_url))
    };
    match outcome {
        Ok(out) => UpdateResult {
            processo_id: out.processo_id,
            numero: target.numero.clone(),
            success: true,
            novos_protocolos: out.novos_protocolos,
            novos_andamentos: out.novos_andamentos,
            error: None,
        },
        Err(e) => failed(e.to_string()),
    }
}

/// Walk every process with a source URL in slices of `UPDATE_BATCH_SIZE`,
/// fetching each slice concurrently. One bad page never aborts the run;
/// per-item failures land in `items` and the counters aggregate successes.
pub async fn update_all_processes(
    conn: &SharedConn,
    client: &Client,
    cfg: &Config,
) -> anyhow::Result<UpdateJobResult> {
    let targets = {
        let guard = conn.lock().await;
        db::list_processos_with_source(&guard)?
    };

    let mut items: Vec<UpdateResult> = Vec::with_capacity(targets.len());
    for chunk in targets.chunks(UPDATE_BATCH_SIZE) {
        let mut set = JoinSet::new();
        for target in chunk {
            let conn = Arc::clone(conn);
            let client = client.clone();
            let cfg = cfg.clone();
            let target = db::ProcessoSource {
                id: target.id,
                numero: target.numero.clone(),
                source_url: target.source_url.clone(),
            };
            set.spawn(async move { update_single_process(&conn, &client, &cfg, &target).await });
        }
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(result) => items.push(result),
                Err(e) => warn!(component = "scheduler", error = %e, "update task panicked"),
            }
        }
    }

    let success = items.iter().filter(|i| i.success).count();
    let result = UpdateJobResult {
        job_id: format!("upd-{}", Utc::now().format("%Y%m%dT%H%M%S%3fZ")),
        total: items.len(),
        success,
        failed: items.len() - success,
        novos_protocolos: items
            .iter()
            .filter(|i| i.success)
            .map(|i| i.novos_protocolos)
            .sum(),
        novos_andamentos: items
            .iter()
            .filter(|i| i.success)
            .map(|i| i.novos_andamentos)
            .sum(),
        items,
    };
    info!(
        component = "scheduler",
        total = result.total,
        success = result.success,
        failed = result.failed,
        novos_protocolos = result.novos_protocolos,
        novos_andamentos = result.novos_andamentos,
        "update run finished"
    );
    Ok(result)
}

/// Dry-run verdict for one submitted URL: what extraction would yield,
/// without touching storage.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewResult {
    pub url: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub numero: Option<String>,
    pub acesso_restrito: bool,
    pub protocolos: usize,
    pub andamentos: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Validate a list of URLs with a bounded worker pool: fetch and extract
/// only, nothing persisted. Results come back in request order regardless
/// of completion order.
pub async fn preview_urls(client: &Client, cfg: &Config, urls: Vec<String>) -> Vec<PreviewResult> {
    let workers = cfg.import_concurrency.min(urls.len().max(1));
    let queue: Arc<tokio::sync::Mutex<VecDeque<(usize, String)>>> = Arc::new(
        tokio::sync::Mutex::new(urls.iter().cloned().enumerate().collect()),
    );
    let slots: Arc<tokio::sync::Mutex<Vec<Option<PreviewResult>>>> =
        Arc::new(tokio::sync::Mutex::new(vec![None; urls.len()]));

    let mut set = JoinSet::new();
    for _ in 0..workers {
        let client = client.clone();
        let cfg = cfg.clone();
        let queue = Arc::clone(&queue);
        let slots = Arc::clone(&slots);
        set.spawn(async move {
            loop {
                let Some((idx, url)) = queue.lock().await.pop_front() else {
                    return;
                };
                let result = preview_one(&client, &cfg, &url).await;
                slots.lock().await[idx] = Some(result);
            }
        });
    }
    while set.join_next().await.is_some() {}

    let mut filled = slots.lock().await;
    filled
        .drain(..)
        .zip(urls)
        .map(|(slot, url)| {
            slot.unwrap_or(PreviewResult {
                url,
                success: false,
                numero: None,
                acesso_restrito: false,
                protocolos: 0,
                andamentos: 0,
                error: Some("worker aborted".to_string()),
            })
        })
        .collect()
}

pub async fn preview_one(client: &Client, cfg: &Config, url: &str) -> PreviewResult {
    let failed = |error: String| PreviewResult {
        url: url.to_string(),
        success: false,
        numero: None,
        acesso_restrito: false,
        protocolos: 0,
        andamentos: 0,
        error: Some(error),
    };

    if let Err(e) = crate::fetch::validate_url(url) {
        return failed(e);
    }
    let html = match fetch_html(client, url, cfg).await {
        Ok(html) => html,
        Err(e) => return failed(e.to_string()),
    };
    let scrape = parser::parse_sei(&html);
    let recognized = !scrape.autuacao.numero.is_empty() || scrape.autuacao.acesso_restrito;
    PreviewResult {
        url: url.to_string(),
        success: recognized,
        numero: (!scrape.autuacao.numero.is_empty()).then(|| scrape.autuacao.numero.clone()),
        acesso_restrito: scrape.autuacao.acesso_restrito,
        protocolos: scrape.protocolos.len(),
        andamentos: scrape.andamentos.len(),
        error: (!recognized).then(|| "page does not look like a process view".to_string()),
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureResult {
    pub url: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<ImportOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Fetch and persist a list of URLs in slices of `UPDATE_BATCH_SIZE`,
/// recording per-URL outcomes. One bad URL never aborts the rest.
pub async fn import_urls(
    conn: &SharedConn,
    client: &Client,
    cfg: &Config,
    urls: Vec<String>,
) -> Vec<CaptureResult> {
    let mut items: Vec<CaptureResult> = Vec::with_capacity(urls.len());
    for chunk in urls.chunks(UPDATE_BATCH_SIZE) {
        let mut set = JoinSet::new();
        for (offset, url) in chunk.iter().enumerate() {
            let conn = Arc::clone(conn);
            let client = client.clone();
            let cfg = cfg.clone();
            let url = url.clone();
            set.spawn(async move { (offset, import_one(&conn, &client, &cfg, &url).await) });
        }
        let mut slice: Vec<Option<CaptureResult>> = vec![None; chunk.len()];
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((offset, result)) => slice[offset] = Some(result),
                Err(e) => warn!(component = "scheduler", error = %e, "import task panicked"),
            }
        }
        items.extend(slice.into_iter().flatten());
    }
    items
}

pub async fn import_one(
    conn: &SharedConn,
    client: &Client,
    cfg: &Config,
    url: &str,
) -> CaptureResult {
    let failed = |error: String| CaptureResult {
        url: url.to_string(),
        success: false,
        outcome: None,
        error: Some(error),
    };

    if let Err(e) = crate::fetch::validate_url(url) {
        return failed(e);
    }
    let html = match fetch_html(client, url, cfg).await {
        Ok(html) => html,
        Err(e) => return failed(e.to_string()),
    };
    let scrape = parser::parse_sei(&html);
    let outcome = {
        let guard = conn.lock().await;
        importer::import_scrape(&guard, &scrape, Some(url))
    };
    match outcome {
        Ok(out) => CaptureResult {
            url: url.to_string(),
            success: true,
            outcome: Some(out),
            error: None,
        },
        Err(e) => failed(e.to_string()),
    }
}

// ── Cadence ──

#[derive(Debug, Clone)]
pub struct ScheduleInput {
    pub mode: String,
    pub schedule_type: Option<String>,
    pub daily_time: Option<String>,
    pub interval_hours: Option<i64>,
}

/// Next firing instant for a schedule config, or None when the config is
/// manual or incomplete.
pub fn compute_next_run(now: DateTime<Utc>, input: &ScheduleInput) -> Option<DateTime<Utc>> {
    if input.mode != "scheduled" {
        return None;
    }
    match input.schedule_type.as_deref() {
        Some("daily") => {
            let time = NaiveTime::parse_from_str(input.daily_time.as_deref()?, "%H:%M").ok()?;
            let today = now.date_naive().and_time(time).and_utc();
            Some(if today <= now {
                today + chrono::Duration::days(1)
            } else {
                today
            })
        }
        Some("interval") => {
            let hours = input.interval_hours.filter(|h| *h > 0)?;
            Some(now + chrono::Duration::hours(hours))
        }
        _ => None,
    }
}

fn format_instant(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Persist a schedule config and its freshly-computed next firing instant.
pub fn save_schedule_config(
    conn: &rusqlite::Connection,
    input: &ScheduleInput,
) -> anyhow::Result<db::ScheduleRow> {
    let next_run = compute_next_run(Utc::now(), input).map(format_instant);
    let row = db::ScheduleRow {
        mode: input.mode.clone(),
        schedule_type: input.schedule_type.clone(),
        daily_time: input.daily_time.clone(),
        interval_hours: input.interval_hours,
        next_run,
    };
    db::save_schedule(conn, &row)?;
    Ok(row)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CronOutcome {
    pub ran: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_run: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job: Option<UpdateJobResult>,
}

/// Cron hook: run the refresh when the stored schedule is due, then roll
/// the next firing instant forward. A tick with nothing due is a no-op.
pub async fn check_and_run_schedules(
    conn: &SharedConn,
    client: &Client,
    cfg: &Config,
) -> anyhow::Result<CronOutcome> {
    let now = Utc::now();
    let schedule = {
        let guard = conn.lock().await;
        db::get_schedule(&guard)?
    };
    let Some(schedule) = schedule else {
        return Ok(CronOutcome {
            ran: false,
            next_run: None,
            job: None,
        });
    };

    let due = schedule.mode == "scheduled"
        && schedule
            .next_run
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|at| at.with_timezone(&Utc) <= now)
            .unwrap_or(false);
    if !due {
        return Ok(CronOutcome {
            ran: false,
            next_run: schedule.next_run,
            job: None,
        });
    }

    info!(component = "scheduler", "schedule due, running update");
    let job = update_all_processes(conn, client, cfg).await?;

    let input = ScheduleInput {
        mode: schedule.mode,
        schedule_type: schedule.schedule_type,
        daily_time: schedule.daily_time,
        interval_hours: schedule.interval_hours,
    };
    let next_run = compute_next_run(Utc::now(), &input).map(format_instant);
    {
        let guard = conn.lock().await;
        db::update_next_run(&guard, next_run.as_deref())?;
    }

    Ok(CronOutcome {
        ran: true,
        next_run,
        job: Some(job),
    })
}
