use std::{process, sync::Arc, time::Duration};

use fractory::{
    application::{
        clock::{Clock, SystemClock},
        context::PipelineContext,
        error::AppError,
        identity::{IdentityVerifier, StaticTokenVerifier},
        jobs::{WorkerContext, WorkerOptions, run_sweeper, spawn_workers, wait_for_settled},
        ledger::JobLedger,
        ports::{ArtifactStore, WorkQueue},
        render::{RenderOutcome, encode_png, render},
        repos::{GalleryRepo, HistoryRepo, LedgerRepo},
    },
    cache::{CacheConfig, LocalCacheBackend, ReadCache},
    config,
    domain::{entities::Requester, lifecycle::StalenessPolicy, types::Role},
    infra::{
        artifacts::FsArtifactStore,
        db::{PostgresRepositories, PostgresWorkQueue},
        error::InfraError,
        memory::{MemoryQueue, MemoryRepositories},
        telemetry,
    },
};
use futures::future::join_all;
use tokio::sync::watch;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

const LOCAL_REQUESTER_ID: &str = "local";

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Worker(config::WorkerArgs::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Worker(_) => run_worker(settings).await,
        config::Command::Render(args) => run_render(settings, args).await,
        config::Command::Local(args) => run_local(settings, args).await,
        config::Command::Migrate(_) => run_migrate(settings).await,
    }
}

/// Storage adapters a pipeline is assembled from.
struct Adapters {
    ledger: Arc<dyn LedgerRepo>,
    gallery: Arc<dyn GalleryRepo>,
    history: Arc<dyn HistoryRepo>,
    queue: Arc<dyn WorkQueue>,
    artifacts: Arc<dyn ArtifactStore>,
}

fn build_pipeline(adapters: Adapters, settings: &config::Settings) -> Result<PipelineContext, AppError> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let cache_config = CacheConfig::from(&settings.cache);
    let read_cache = ReadCache::new(
        Arc::new(LocalCacheBackend::new(&cache_config)),
        cache_config,
    );

    let staleness = StalenessPolicy {
        pending_timeout: to_time_duration(settings.status.pending_timeout, "status.pending_timeout")?,
        generating_timeout: to_time_duration(
            settings.status.generating_timeout,
            "status.generating_timeout",
        )?,
    };

    Ok(PipelineContext {
        ledger: JobLedger::new(adapters.ledger, clock),
        gallery: adapters.gallery,
        history: adapters.history,
        queue: adapters.queue,
        artifacts: adapters.artifacts,
        read_cache,
        staleness,
        presign_ttl: settings.artifacts.presign_ttl,
    })
}

fn worker_options(settings: &config::Settings) -> WorkerOptions {
    WorkerOptions {
        max_render_time: settings.render.max_time,
        receive_batch: settings.worker.receive_batch.get() as usize,
        receive_wait: settings.worker.wait,
        idle_backoff: settings.worker.idle_backoff,
        max_receive_count: settings.worker.max_receive_count.get(),
    }
}

fn artifact_store(settings: &config::Settings) -> Result<FsArtifactStore, AppError> {
    FsArtifactStore::new(
        settings.artifacts.root.clone(),
        settings.artifacts.base_url.clone(),
        settings.artifacts.signing_secret.clone().into_bytes(),
    )
    .map_err(|err| AppError::from(InfraError::from(err)))
}

fn to_time_duration(value: Duration, key: &str) -> Result<time::Duration, AppError> {
    time::Duration::try_from(value)
        .map_err(|err| AppError::from(InfraError::configuration(format!("{key}: {err}"))))
}

async fn connect_database(settings: &config::Settings) -> Result<PostgresRepositories, AppError> {
    let database_url = settings
        .database
        .url
        .as_ref()
        .ok_or_else(|| InfraError::configuration("database url is not configured"))
        .map_err(AppError::from)?;

    let pool = PostgresRepositories::connect(database_url, settings.database.max_connections.get())
        .await
        .map_err(InfraError::from)?;

    PostgresRepositories::run_migrations(&pool)
        .await
        .map_err(InfraError::from)?;

    let repositories = PostgresRepositories::new(pool);
    repositories
        .health_check()
        .await
        .map_err(InfraError::from)?;
    Ok(repositories)
}

async fn run_worker(settings: config::Settings) -> Result<(), AppError> {
    let repositories = Arc::new(connect_database(&settings).await?);
    let queue = PostgresWorkQueue::new(
        repositories.pool().clone(),
        settings.worker.visibility_timeout,
    );

    let pipeline = build_pipeline(
        Adapters {
            ledger: repositories.clone(),
            gallery: repositories.clone(),
            history: repositories,
            queue: Arc::new(queue),
            artifacts: Arc::new(artifact_store(&settings)?),
        },
        &settings,
    )?;
    let ctx = WorkerContext::new(pipeline.clone(), worker_options(&settings));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = spawn_workers(
        &ctx,
        settings.worker.concurrency.get() as usize,
        &shutdown_rx,
    );
    handles.push(tokio::spawn(run_sweeper(
        pipeline.status_resolver(),
        settings.status.sweep_interval,
        settings.status.sweep_limit.get(),
        shutdown_rx,
    )));

    info!(
        target = "fractory::worker",
        concurrency = settings.worker.concurrency.get(),
        "worker pool running; press ctrl-c to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .map_err(InfraError::from)?;
    info!(target = "fractory::worker", "shutdown requested; finishing in-flight messages");
    let _ = shutdown_tx.send(true);

    for result in join_all(handles).await {
        if let Err(err) = result {
            warn!(target = "fractory::worker", error = %err, "worker task ended abnormally");
        }
    }
    Ok(())
}

async fn run_render(settings: config::Settings, args: config::RenderArgs) -> Result<(), AppError> {
    let request = args.request.to_input().resolve()?;

    let raster = match render(&request, settings.render.max_time).await {
        RenderOutcome::Complete(raster) => raster,
        RenderOutcome::TooComplex { elapsed, rows_done } => {
            return Err(AppError::validation(format!(
                "render exceeded {}s after {rows_done} rows ({}ms)",
                settings.render.max_time.as_secs(),
                elapsed.as_millis()
            )));
        }
    };

    let png = encode_png(&raster).map_err(|err| AppError::unexpected(err.to_string()))?;
    tokio::fs::write(&args.output, &png)
        .await
        .map_err(InfraError::from)?;

    info!(
        target = "fractory::render",
        path = %args.output.display(),
        bytes = png.len(),
        "render written"
    );
    Ok(())
}

async fn run_local(settings: config::Settings, args: config::LocalArgs) -> Result<(), AppError> {
    let requester = resolve_requester(&settings, args.token.as_deref()).await?;
    let repositories = Arc::new(MemoryRepositories::new());
    let pipeline = build_pipeline(
        Adapters {
            ledger: repositories.clone(),
            gallery: repositories.clone(),
            history: repositories,
            queue: Arc::new(MemoryQueue::new(settings.worker.visibility_timeout)),
            artifacts: Arc::new(artifact_store(&settings)?),
        },
        &settings,
    )?;

    let options = WorkerOptions {
        receive_wait: Duration::from_millis(200),
        ..worker_options(&settings)
    };
    let ctx = WorkerContext::new(pipeline.clone(), options);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = spawn_workers(&ctx, 1, &shutdown_rx);

    let submitted = pipeline
        .submissions()
        .submit_input(&args.request.to_input(), &requester)
        .await?;
    info!(
        target = "fractory::local",
        fingerprint = %submitted.fingerprint,
        status = %submitted.status,
        "{}",
        submitted.message
    );

    let settled = wait_for_settled(
        &pipeline.ledger,
        &submitted.fingerprint,
        Duration::from_secs(args.wait_seconds),
    )
    .await;
    let _ = shutdown_tx.send(true);
    join_all(handles).await;
    settled?;

    let report = pipeline
        .status_resolver()
        .query(&submitted.fingerprint, &requester)
        .await?;
    let rendered = serde_json::to_string_pretty(&report)
        .map_err(|err| AppError::unexpected(err.to_string()))?;
    println!("{rendered}");
    Ok(())
}

async fn resolve_requester(
    settings: &config::Settings,
    token: Option<&str>,
) -> Result<Requester, AppError> {
    let Some(token) = token else {
        return Ok(Requester::new(LOCAL_REQUESTER_ID, LOCAL_REQUESTER_ID, Role::User));
    };

    let mut verifier = StaticTokenVerifier::new();
    for entry in &settings.identity.tokens {
        verifier = verifier
            .with_digest(
                &entry.digest,
                Requester::new(entry.id.clone(), entry.display_name.clone(), entry.role),
            )
            .map_err(|err| AppError::from(InfraError::configuration(err.to_string())))?;
    }
    Ok(verifier.verify(token).await?)
}

async fn run_migrate(settings: config::Settings) -> Result<(), AppError> {
    connect_database(&settings).await?;
    info!(target = "fractory::migrate", "migrations applied");
    Ok(())
}
