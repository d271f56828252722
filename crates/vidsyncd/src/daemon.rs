//! Daemon lifecycle: startup, worker pools, control API, shutdown

use anyhow::{Context, Result};
use prometheus_client::registry::Registry;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

use vidsync_core::config::VidsyncConfig;
use vidsync_core::device::DeviceRegistry;
use vidsync_core::Publisher;
use vidsync_pipeline::cache::{self, CacheBackend, FingerprintStore, SharedCache};
use vidsync_pipeline::merge::MergeSettings;
use vidsync_pipeline::mount::MountAdapter;
use vidsync_pipeline::stabilize::{probe_gpu, StabilizeSettings};
use vidsync_pipeline::sync::SyncSettings;
use vidsync_pipeline::{MergeStage, StabilizeStage, SyncStage, SystemRunner, ToolRunner};
use vidsync_queue::{JobQueue, QueuePolicy, Scheduler, SchedulerSettings};

use crate::api::{ApiState, Capabilities};
use crate::handlers::{MergeHandler, StabilizeHandler, SyncHandler};
use crate::metrics::{HealthState, JobMetrics, Metered};
use crate::publisher::BroadcastPublisher;

pub async fn run(config: VidsyncConfig) -> Result<()> {
    info!("daemon starting");

    let runner: Arc<dyn ToolRunner> = Arc::new(SystemRunner);

    // ── Event fan-out ────────────────────────────────────────────────────
    let publisher = build_publisher(&config).await;

    // ── Device registry ──────────────────────────────────────────────────
    match DeviceRegistry::load(&config.paths.devices_file) {
        Ok(registry) => info!(
            devices = registry.devices.len(),
            active = registry.active_devices().count(),
            path = %config.paths.devices_file.display(),
            "device registry loaded"
        ),
        Err(e) => warn!("device registry unreadable: {e:#}  (requests will fail until fixed)"),
    }

    // ── Persistent state ─────────────────────────────────────────────────
    let policy = QueuePolicy::from_config(
        &config.queue,
        config.parallel_processing.priority_mode,
    );
    let queue = Arc::new(
        JobQueue::open(&config.paths.queue_db, policy)
            .with_context(|| format!("opening job queue: {}", config.paths.queue_db.display()))?,
    );
    let counts = queue.counts();
    info!(
        waiting = counts.waiting,
        delayed = counts.delayed,
        path = %config.paths.queue_db.display(),
        "job queue opened"
    );

    let fingerprints = cache::shared(
        CacheBackend::open(&config.paths.cache_db)
            .with_context(|| format!("opening file cache: {}", config.paths.cache_db.display()))?,
    );

    // ── Capabilities ─────────────────────────────────────────────────────
    let stab = &config.stabilization;
    let gpu = probe_gpu(runner.as_ref(), &stab.gpu_probe_program, &stab.gpu_probe_args).await;
    if gpu.available {
        info!(gpu = %gpu.detail, "GPU detected");
    } else {
        warn!(detail = %gpu.detail, "no GPU detected");
    }
    let capabilities = Capabilities {
        gpu_support: stab.require_gpu,
        gpu_available: gpu.available,
        stabilization_enabled: stab.enabled && (gpu.available || !stab.require_gpu),
        merge_enabled: true,
        sync_enabled: true,
    };
    publisher.emit(capabilities.to_event());

    // ── Stages and pools ─────────────────────────────────────────────────
    let mut registry = Registry::default();
    let metrics = JobMetrics::new(&mut registry);

    let scheduler = Arc::new(Scheduler::new(
        queue.clone(),
        publisher.clone(),
        SchedulerSettings::from_config(&config.queue),
    ));

    let mount = MountAdapter::new(
        runner.clone(),
        config.tools.clone(),
        config.paths.mount_point.clone(),
    );
    let sync = SyncStage::new(
        SyncSettings::from_config(&config)?,
        runner.clone(),
        mount,
        fingerprints.clone(),
    );
    let merge = MergeStage::new(MergeSettings::from_config(&config), runner.clone());
    let stabilize = StabilizeStage::new(StabilizeSettings::from_config(&config), runner.clone(), gpu);

    let parallel = &config.parallel_processing;
    scheduler.register(
        Metered::wrap(
            Arc::new(SyncHandler::new(sync, config.merge.output_folder.clone())),
            metrics.clone(),
        ),
        parallel.sync_concurrency(),
    );
    scheduler.register(
        Metered::wrap(Arc::new(MergeHandler::new(merge)), metrics.clone()),
        parallel.job_concurrency(),
    );
    scheduler.register(
        Metered::wrap(Arc::new(StabilizeHandler::new(stabilize)), metrics),
        parallel.job_concurrency(),
    );
    scheduler.start_watchdog();

    // ── Background maintenance ───────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    if config.incremental_sync.enabled {
        let interval = Duration::from_secs(config.incremental_sync.sweep_interval_hours.max(1) * 3600);
        tokio::spawn(sweep_loop(
            fingerprints.clone(),
            config.incremental_sync.cache_expiry_days,
            interval,
            shutdown_rx.clone(),
        ));
    }

    // ── HTTP ─────────────────────────────────────────────────────────────
    if let Some(addr) = config.daemon.metrics_addr.clone() {
        let health = HealthState {
            registry: Arc::new(registry),
            dest_root: config.paths.dest_root.clone(),
        };
        tokio::spawn(async move {
            if let Err(e) = crate::metrics::serve(addr, health).await {
                error!("metrics server failed: {e}");
            }
        });
    }

    let api_state = ApiState {
        scheduler: scheduler.clone(),
        publisher: publisher.clone(),
        runner,
        findfs: config.tools.findfs.clone(),
        devices_file: config.paths.devices_file.clone(),
        dest_root: config.paths.dest_root.clone(),
        capabilities,
    };
    let api = tokio::spawn(crate::api::serve(
        config.daemon.listen.clone(),
        api_state,
        shutdown_rx,
    ));

    notify_ready();

    // ── Shutdown ─────────────────────────────────────────────────────────
    let mut sigterm = signal(SignalKind::terminate()).context("registering SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("registering SIGINT handler")?;
    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }

    let _ = shutdown_tx.send(true);
    info!("draining in-flight jobs");
    scheduler.shutdown().await;
    match api.await {
        Ok(Err(e)) => error!("{e:#}"),
        Err(e) => error!("api task: {e}"),
        Ok(Ok(())) => {}
    }
    if let Err(e) = fingerprints.lock().unwrap_or_else(|e| e.into_inner()).flush() {
        warn!("flushing file cache failed: {e:#}");
    }

    info!("daemon exiting cleanly");
    Ok(())
}

async fn build_publisher(config: &VidsyncConfig) -> Arc<BroadcastPublisher> {
    #[allow(unused_mut)]
    let mut publisher = BroadcastPublisher::new();

    #[cfg(feature = "nats")]
    if let Some(url) = &config.daemon.nats_url {
        match crate::publisher::NatsPublisher::connect(url).await {
            Ok(nats) => publisher = publisher.with_mirror(Arc::new(nats)),
            Err(e) => warn!("{e:#}  (events stay local)"),
        }
    }
    #[cfg(not(feature = "nats"))]
    if config.daemon.nats_url.is_some() {
        warn!("nats_url is set but vidsyncd was built without the 'nats' feature");
    }

    Arc::new(publisher)
}

/// Evict stale fingerprints once per `interval`.
async fn sweep_loop(
    fingerprints: SharedCache,
    expiry_days: u64,
    interval: Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.wait_for(|stop| *stop) => break,
        }
        let fingerprints = fingerprints.clone();
        let swept = tokio::task::spawn_blocking(move || {
            let mut store = fingerprints.lock().unwrap_or_else(|e| e.into_inner());
            let removed = cache::evict_expired(&mut *store, expiry_days);
            store.flush().map(|()| (removed, store.len()))
        })
        .await;
        match swept {
            Ok(Ok((removed, remaining))) => info!(removed, remaining, "file cache swept"),
            Ok(Err(e)) => warn!("file cache sweep flush failed: {e:#}"),
            Err(e) => error!("file cache sweep panicked: {e}"),
        }
    }
}

fn notify_ready() {
    // sd_notify(READY=1) via $NOTIFY_SOCKET; no-op outside systemd
    if let Ok(socket) = std::env::var("NOTIFY_SOCKET") {
        use std::os::unix::net::UnixDatagram;
        if let Ok(sock) = UnixDatagram::unbound() {
            let _ = sock.send_to(b"READY=1\n", &socket);
            tracing::debug!(notify_socket = %socket, "sent systemd READY=1");
        }
    }
}
