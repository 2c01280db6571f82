//! bpmcrawl CLI: worker and operator interface to the job queue.

use bpmcrawl::clock::SystemClock;
use bpmcrawl::config::Config;
use bpmcrawl::db::Db;
use bpmcrawl::engine::{CycleOutcome, Janitor, Scheduler, Submitted};
use bpmcrawl::job::Jobs;
use bpmcrawl::kinds;
use bpmcrawl::kinds::calc_bpm::CommandAnalyzer;
use bpmcrawl::model::{Job, JobFilter, JobId, JobRequest, JobState, Service, WorkerId};
use bpmcrawl::store::JobStore;
use bpmcrawl::telemetry::{TelemetryConfig, TelemetryGuard, init_telemetry};
use clap::{Args, Parser, Subcommand};
use secrecy::ExposeSecret;
use std::sync::Arc;
use tracing::warn;

#[derive(Parser)]
#[command(name = "bpmcrawl", about = "Distributed job queue for BPM crawler workers")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one scheduling cycle: enqueue (optional), claim, execute, finish
    Pick {
        #[command(flatten)]
        request: TrackArgs,
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Enqueue a job without running anything
    Submit {
        #[command(flatten)]
        request: TrackArgs,
        /// Full request as JSON: {"kind": ..., "def": {...}}
        #[arg(long, conflicts_with_all = ["user", "service", "track_id"])]
        json: Option<String>,
    },
    /// Release jobs whose worker stopped heartbeating
    Janitor {
        /// Keep sweeping until Ctrl-C
        #[arg(long)]
        watch: bool,
    },
    /// Inspect stored jobs
    Jobs {
        #[command(subcommand)]
        action: JobsAction,
    },
}

/// A calc_bpm request given as flags.
#[derive(Args)]
struct TrackArgs {
    /// Account the track is fetched with
    #[arg(long, requires_all = ["service", "track_id"])]
    user: Option<String>,
    /// Music service (gmusic, spotify, yandexmusic)
    #[arg(long, requires_all = ["user", "track_id"])]
    service: Option<Service>,
    /// Track id on the service
    #[arg(long, requires_all = ["user", "service"])]
    track_id: Option<String>,
}

impl TrackArgs {
    fn into_request(self) -> Option<JobRequest> {
        match (self.user, self.service, self.track_id) {
            (Some(user), Some(service), Some(track_id)) => {
                Some(JobRequest::calc_bpm(user, service, track_id))
            }
            _ => None,
        }
    }
}

#[derive(Args)]
struct FilterArgs {
    /// Only pick jobs of this kind
    #[arg(long)]
    kind: Option<String>,
    /// Only pick jobs for this service
    #[arg(long)]
    filter_service: Option<Service>,
}

impl FilterArgs {
    fn into_filter(self) -> JobFilter {
        let mut filter = JobFilter::any();
        if let Some(kind) = self.kind {
            filter = filter.kind(kind);
        }
        if let Some(service) = self.filter_service {
            filter = filter.service(service);
        }
        filter
    }
}

#[derive(Subcommand)]
enum JobsAction {
    /// List jobs, newest first
    List {
        /// Filter by state (unclaimed, claimed, finished)
        #[arg(long)]
        state: Option<JobState>,
        #[command(flatten)]
        filter: FilterArgs,
        /// Maximum jobs to show
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show a job
    Show {
        /// Job ID (full UUID or prefix)
        id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let _guard = telemetry(&config)?;

    let db = Arc::new(Db::connect(config.database_url.expose_secret()).await?);
    db.migrate().await?;
    check_clock_skew(&config, &db).await?;

    let registry = kinds::registry(Arc::new(CommandAnalyzer::new(config.analyzer_cmd.clone())))?;
    let store: Arc<dyn JobStore> = db.clone();
    let jobs = Jobs::new(store, Arc::new(registry));

    match cli.command {
        Command::Pick { request, filter } => {
            cmd_pick(&config, jobs, request.into_request(), filter.into_filter()).await
        }
        Command::Submit { request, json } => {
            let request = match json {
                Some(json) => Some(serde_json::from_str::<JobRequest>(&json)?),
                None => request.into_request(),
            };
            let Some(request) = request else {
                anyhow::bail!("nothing to submit: pass --user/--service/--track-id or --json");
            };
            cmd_submit(&config, jobs, &request).await
        }
        Command::Janitor { watch } => cmd_janitor(&config, db, watch).await,
        Command::Jobs { action } => match action {
            JobsAction::List {
                state,
                filter,
                limit,
            } => cmd_jobs_list(&db, state, filter.into_filter(), limit).await,
            JobsAction::Show { id } => cmd_jobs_show(&db, &id).await,
        },
    }
}

fn telemetry(config: &Config) -> anyhow::Result<TelemetryGuard> {
    Ok(init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "bpmcrawl".to_string(),
        default_filter: config.log_level.clone(),
    })?)
}

async fn check_clock_skew(config: &Config, db: &Db) -> anyhow::Result<()> {
    let skew = db.clock_skew(&SystemClock).await?;
    let interval = config.staleness.heartbeat_interval();
    if skew.abs().to_std()? > interval {
        warn!(
            skew_ms = skew.num_milliseconds(),
            heartbeat_interval_ms = interval.as_millis() as u64,
            "local clock disagrees with the database by more than one heartbeat interval; \
             live jobs may be released as stale"
        );
    }
    Ok(())
}

async fn cmd_pick(
    config: &Config,
    jobs: Jobs,
    request: Option<JobRequest>,
    filter: JobFilter,
) -> anyhow::Result<()> {
    let scheduler = Scheduler::new(jobs, WorkerId::generate(), config.scheduler());
    let report = scheduler.run_cycle(request.as_ref(), &filter).await?;

    if let Some(submitted) = &report.submitted {
        print_submitted(submitted);
    }

    match report.outcome {
        CycleOutcome::Idle => println!("No job to pick up."),
        CycleOutcome::LostRaces(n) => {
            println!("All {n} candidate(s) were taken by other workers.")
        }
        CycleOutcome::Executed {
            job_id,
            job_uri,
            status,
            time_took_ms,
        } => println!("Finished {job_id} ({job_uri}): {status} in {time_took_ms}ms"),
        CycleOutcome::Abandoned { job_id } => {
            println!("Lost ownership of {job_id}; left it to its new owner.")
        }
    }
    Ok(())
}

async fn cmd_submit(config: &Config, jobs: Jobs, request: &JobRequest) -> anyhow::Result<()> {
    let scheduler = Scheduler::new(jobs, WorkerId::generate(), config.scheduler());
    let submitted = scheduler.submit(request).await?;
    print_submitted(&submitted);
    if let Submitted::Rejected(reason) = submitted {
        anyhow::bail!("request rejected: {reason}");
    }
    Ok(())
}

fn print_submitted(submitted: &Submitted) {
    match submitted {
        Submitted::Created(job) => println!("Created: {} ({})", job.job_id, job.job_uri),
        Submitted::AlreadyExists(uri) => println!("Already exists: {uri}"),
        Submitted::Rejected(reason) => println!("Rejected: {reason}"),
    }
}

async fn cmd_janitor(config: &Config, db: Arc<Db>, watch: bool) -> anyhow::Result<()> {
    let janitor = Janitor::new(db, config.janitor());

    if !watch {
        let released = janitor.sweep_once().await?;
        println!("Released {} stale job(s).", released.len());
        for job_id in released {
            println!("  {job_id}");
        }
        return Ok(());
    }

    let shutdown = janitor.shutdown_handle();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        shutdown.notify_one();
    });

    janitor.run().await?;
    Ok(())
}

async fn cmd_jobs_list(
    db: &Db,
    state: Option<JobState>,
    filter: JobFilter,
    limit: usize,
) -> anyhow::Result<()> {
    let jobs = db.list(&filter, state, limit).await?;

    if jobs.is_empty() {
        println!("No jobs found.");
        return Ok(());
    }

    println!(
        "{:<8}  {:<10}  {:<10}  {:<44}  CREATED",
        "ID", "KIND", "STATE", "URI"
    );
    println!("{}", "-".repeat(100));

    for job in &jobs {
        let uri = if job.job_uri.len() > 44 {
            job.job_uri.chars().take(44).collect::<String>()
        } else {
            job.job_uri.clone()
        };
        println!(
            "{:<8}  {:<10}  {:<10}  {:<44}  {}",
            job.job_id.to_string(),
            job.kind,
            job.state(),
            uri,
            job.created_at.format("%Y-%m-%d %H:%M")
        );
    }

    println!("\n{} job(s)", jobs.len());
    Ok(())
}

async fn cmd_jobs_show(db: &Db, id: &str) -> anyhow::Result<()> {
    let job = match uuid::Uuid::parse_str(id) {
        Ok(uuid) => db.get(JobId(uuid)).await?,
        Err(_) => db.find_by_id_prefix(id).await?,
    };
    let Some(job) = job else {
        anyhow::bail!("no single job matching '{id}'");
    };
    print_job(&job)
}

fn print_job(job: &Job) -> anyhow::Result<()> {
    let or_dash = |v: Option<String>| v.unwrap_or_else(|| "-".to_string());

    println!("ID:         {}", job.job_id.0);
    println!("Kind:       {}", job.kind);
    println!("URI:        {}", job.job_uri);
    println!("State:      {}", job.state());
    println!("Worker:     {}", or_dash(job.worker_id.as_ref().map(|w| w.to_string())));
    println!("Definition: {}", serde_json::to_string_pretty(&job.def)?);
    println!("Pickups:    {}", job.pickups);
    println!("Created:    {}", job.created_at);
    println!("Started:    {}", or_dash(job.started_at.map(|t| t.to_string())));
    println!("Heartbeat:  {}", or_dash(job.heartbeat_at.map(|t| t.to_string())));
    if let Some(finished) = job.finished_at {
        println!("Finished:   {finished}");
    }
    if let Some(ms) = job.time_took_ms {
        println!("Took:       {ms}ms");
    }
    if let Some(ref stats) = job.stats {
        println!("---");
        println!("Status:     {}", stats.status);
        if let Some(ref err) = stats.error {
            println!("Error:      {err}");
        }
        if let Some(ref data) = stats.data {
            println!("Data:       {}", serde_json::to_string_pretty(data)?);
        }
    }
    Ok(())
}
