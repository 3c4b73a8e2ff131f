use std::{collections::HashSet, num::NonZeroUsize, sync::Arc, time::Duration};

use fractory::{
    application::{
        clock::ManualClock,
        context::PipelineContext,
        jobs::{WorkerContext, WorkerOptions, poll_once},
        ledger::JobLedger,
        repos::GalleryQuery,
    },
    cache::{CacheConfig, LocalCacheBackend, ReadCache},
    domain::{
        entities::Requester, lifecycle::StalenessPolicy, request::RenderRequestInput, types::Role,
    },
    infra::memory::{MemoryArtifactStore, MemoryQueue, MemoryRepositories},
};
use metrics_util::debugging::DebuggingRecorder;
use time::macros::datetime;

fn request(width: u32) -> RenderRequestInput {
    RenderRequestInput {
        width: Some(width),
        height: Some(16),
        max_iterations: Some(30),
        ..RenderRequestInput::default()
    }
}

#[tokio::test]
async fn pipeline_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");

    let repos = Arc::new(MemoryRepositories::new());
    let artifacts = Arc::new(MemoryArtifactStore::new());
    let clock = Arc::new(ManualClock::new(datetime!(2026-01-01 00:00 UTC)));
    let cache_config = CacheConfig {
        capacity: 1,
        ..CacheConfig::default()
    };
    assert_eq!(cache_config.capacity_non_zero(), NonZeroUsize::MIN);

    let ctx = PipelineContext {
        ledger: JobLedger::new(repos.clone(), clock.clone()),
        gallery: repos.clone(),
        history: repos.clone(),
        queue: Arc::new(MemoryQueue::new(Duration::from_secs(30))),
        artifacts: artifacts.clone(),
        read_cache: ReadCache::new(
            Arc::new(LocalCacheBackend::new(&cache_config)),
            cache_config,
        ),
        staleness: StalenessPolicy::default(),
        presign_ttl: Duration::from_secs(3600),
    };
    let options = WorkerOptions {
        receive_wait: Duration::ZERO,
        ..WorkerOptions::default()
    };
    let worker = WorkerContext::new(ctx.clone(), options);
    let rushed = WorkerContext::new(
        ctx.clone(),
        WorkerOptions {
            max_render_time: Duration::ZERO,
            ..options
        },
    );
    let user = Requester::new("u-1", "metrics", Role::User);
    let submissions = ctx.submissions();

    // Completed render: render histogram plus worker disposition counter.
    submissions.submit_input(&request(20), &user).await.expect("submit");
    assert_eq!(poll_once(&worker).await, 1);

    // Too complex.
    submissions.submit_input(&request(21), &user).await.expect("submit");
    assert_eq!(poll_once(&rushed).await, 1);

    // Storage failure.
    artifacts.set_fail_puts(true);
    submissions.submit_input(&request(22), &user).await.expect("submit");
    assert_eq!(poll_once(&worker).await, 1);
    artifacts.set_fail_puts(false);

    // Stale pending job.
    let stuck = submissions.submit_input(&request(23), &user).await.expect("submit");
    clock.advance(time::Duration::seconds(11));
    ctx.status_resolver()
        .query(&stuck.fingerprint, &user)
        .await
        .expect("status");

    // Read cache: miss, hit, then a second page evicts the first.
    let galleries = ctx.galleries();
    for query in [
        GalleryQuery::default(),
        GalleryQuery::default(),
        GalleryQuery {
            offset: 5,
            ..GalleryQuery::default()
        },
    ] {
        galleries
            .list_gallery(&user, false, query)
            .await
            .expect("gallery lists");
    }

    let names: HashSet<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    let expected = [
        "fractory_render_ms",
        "fractory_render_too_complex_total",
        "fractory_worker_messages_total",
        "fractory_worker_failures_total",
        "fractory_status_stale_total",
        "fractory_read_cache_hit_total",
        "fractory_read_cache_miss_total",
        "fractory_read_cache_evict_total",
    ];

    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
}
