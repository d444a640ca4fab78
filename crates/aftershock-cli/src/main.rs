use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::time::{Duration, sleep};
use tracing::{info, warn};

use aftershock_core::app::{
    DispatchContext, HandlerError, IdleCallback, IdleContext, OpcodeHandler, ServerBuilder,
    ServerReport, Staging, TaskDispatcher,
};
use aftershock_core::config::ServerConfig;
use aftershock_core::domain::{
    NewTask, Opcode, RelayId, RelayItemKind, RelayMode, Rescode, SCHED_TIME_SHUTDOWN, Task,
};
use aftershock_core::impls::InMemoryDatabase;
use aftershock_core::observability::init_tracing;
use aftershock_core::ports::{Clock, SystemClock, TaskQueue};

#[derive(Parser)]
#[command(name = "aftershock", version)]
struct Cli {
    /// TOML config; built-in defaults when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run two servers against each other in one process
    Pair {
        #[arg(long, default_value_t = 30)]
        seconds: u64,
    },

    /// Run a single server in solo mode
    Solo {
        #[arg(long, default_value_t = 10)]
        seconds: u64,
    },

    /// Validate the config and print it with defaults filled in
    CheckConfig,
}

/// Generates the timeline in a few stages.
struct TimelineHandler {
    stages: i32,
    step: i64,
}

#[async_trait]
impl OpcodeHandler for TimelineHandler {
    async fn handle(
        &self,
        task: &Task,
        cx: &mut DispatchContext<'_>,
    ) -> Result<Rescode, HandlerError> {
        if task.stage < self.stages {
            info!(event_id = %task.event_id, stage = task.stage, "timeline stage");
            cx.set_staging(Staging::new(cx.effective_ms() + self.step, task.stage + 1));
            return Ok(Rescode::StageRetry);
        }
        cx.set_remark(format!("timeline complete after {} stages", task.stage));
        Ok(Rescode::Success)
    }
}

/// Publishes a report when primary and replicates the completion record.
struct PdlReportHandler;

#[async_trait]
impl OpcodeHandler for PdlReportHandler {
    async fn handle(
        &self,
        task: &Task,
        cx: &mut DispatchContext<'_>,
    ) -> Result<Rescode, HandlerError> {
        if !cx.is_primary() {
            cx.set_remark("not primary, report left to partner");
            return Ok(Rescode::Skipped);
        }
        let body = serde_json::json!({ "event_id": task.event_id, "sent_at": cx.true_ms() });
        let payload =
            serde_json::to_vec(&body).map_err(|e| HandlerError::BadDetails(e.to_string()))?;
        cx.publish_relay(RelayId::new(RelayItemKind::Completion, &task.event_id), payload);
        info!(event_id = %task.event_id, "report published");
        cx.set_remark("report published");
        Ok(Rescode::Success)
    }
}

struct AnnounceHandler;

#[async_trait]
impl OpcodeHandler for AnnounceHandler {
    async fn handle(
        &self,
        task: &Task,
        cx: &mut DispatchContext<'_>,
    ) -> Result<Rescode, HandlerError> {
        info!(opcode = %task.opcode, primary_state = %cx.primary_state(), "role announced");
        Ok(Rescode::Success)
    }
}

/// Logs queue depth at most once per interval.
struct QueueWatch {
    interval_ms: i64,
    last_ms: i64,
}

#[async_trait]
impl IdleCallback for QueueWatch {
    async fn on_idle(&mut self, cx: &IdleContext<'_>) -> bool {
        let now = cx.clock.true_ms();
        if now - self.last_ms < self.interval_ms {
            return false;
        }
        self.last_ms = now;
        match cx.db.tasks.counts().await {
            Ok(counts) => info!(
                queued = counts.queued,
                logged = counts.logged,
                primary_state = %cx.primary_state,
                "idle"
            ),
            Err(e) => warn!(error = %e, "queue counts unavailable"),
        }
        true
    }
}

#[derive(Serialize)]
struct DemoReport {
    server: ServerReport,
    relay_items: usize,
}

fn build_server(
    config: &ServerConfig,
    server_number: u8,
    relay_mode: RelayMode,
    clock: Arc<dyn Clock>,
    databases: &[Arc<InMemoryDatabase>],
) -> Result<TaskDispatcher, Box<dyn std::error::Error>> {
    let mut config = config.clone();
    config.server.server_number = server_number;
    config.negotiation.relay_mode = relay_mode;

    let local = databases
        .get(usize::from(server_number - 1))
        .cloned()
        .ok_or("no database for server")?;
    let mut builder = ServerBuilder::new(config.clone())
        .clock(clock)
        .database(local)
        .register(Opcode::GEN_TIMELINE, Arc::new(TimelineHandler { stages: 2, step: 1_000 }))?
        .register(Opcode::GEN_PDL_REPORT, Arc::new(PdlReportHandler))?
        .register(Opcode::ANNOUNCE_PRIMARY, Arc::new(AnnounceHandler))?
        .register(Opcode::ANNOUNCE_SECONDARY, Arc::new(AnnounceHandler))?
        .idle_callback(Box::new(QueueWatch {
            interval_ms: 5_000,
            last_ms: 0,
        }))
        .expect_opcodes(&[Opcode::GEN_TIMELINE, Opcode::GEN_PDL_REPORT, Opcode::SHUTDOWN]);
    if let Some(partner) = databases.get(usize::from(config.server.partner_number() - 1)) {
        builder = builder.partner(partner.clone());
    }
    Ok(builder.build()?)
}

async fn submit_demo_tasks(
    db: &InMemoryDatabase,
    now: i64,
) -> Result<(), Box<dyn std::error::Error>> {
    for (i, event_id) in ["us7000abcd", "us7000efgh"].into_iter().enumerate() {
        let offset = i64::try_from(i)? * 2_000;
        db.tasks
            .submit(NewTask::new(event_id, Opcode::GEN_TIMELINE, now + offset))
            .await?;
        db.tasks
            .submit(NewTask::new(event_id, Opcode::GEN_PDL_REPORT, now + offset + 500))
            .await?;
    }
    Ok(())
}

async fn run_servers(
    config: &ServerConfig,
    relay_mode: RelayMode,
    server_count: u8,
    seconds: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let databases: Vec<Arc<InMemoryDatabase>> = (1..=server_count)
        .map(|n| Arc::new(InMemoryDatabase::new(n, clock.clone())))
        .collect();

    let mut joins = Vec::new();
    for n in 1..=server_count {
        let mut dispatcher = build_server(config, n, relay_mode, clock.clone(), &databases)?;
        joins.push(tokio::spawn(async move {
            let result = dispatcher.run().await;
            (dispatcher, result)
        }));
    }

    for db in &databases {
        submit_demo_tasks(db, clock.effective_ms()).await?;
    }
    sleep(Duration::from_secs(seconds)).await;

    info!("queueing shutdown");
    for db in &databases {
        db.tasks
            .submit(NewTask::new("", Opcode::SHUTDOWN, SCHED_TIME_SHUTDOWN))
            .await?;
    }

    for (db, join) in databases.iter().zip(joins) {
        let (dispatcher, result) = join.await?;
        result?;
        let report = DemoReport {
            server: dispatcher.report().await?,
            relay_items: db.relay.items().len(),
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => ServerConfig::load_from(path)?,
        None => ServerConfig::default(),
    };

    match cli.cmd {
        Command::Pair { seconds } => run_servers(&config, RelayMode::Pair, 2, seconds).await?,
        Command::Solo { seconds } => run_servers(&config, RelayMode::Solo, 1, seconds).await?,
        Command::CheckConfig => {
            config.validate()?;
            print!("{}", toml::to_string_pretty(&config)?);
        }
    }
    Ok(())
}
