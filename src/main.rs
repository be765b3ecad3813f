use std::{process, sync::Arc};

use kura::{
    application::{
        error::AppError,
        fetch::{DegradingFetcher, FetchPolicy},
        page::PageService,
        revalidate::{RegenerationHook, RevalidationService},
        warmup::{WarmupPlan, WarmupScheduler},
    },
    cache::{self, CacheConfig, CacheHandle, StatsReporter},
    config,
    infra::{
        content_client::HttpContentSource,
        error::InfraError,
        http::{self, HttpState},
        regenerate::{LoggingRegenerationHook, WebhookRegenerationHook},
        telemetry,
    },
};
use tokio_util::sync::CancellationToken;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

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
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;
    for issue in &settings.issues {
        warn!(key = issue.key, value = %issue.value, reason = %issue.reason, "{issue}");
    }

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Warmup(_) => run_warmup(settings).await,
    }
}

struct ApplicationContext {
    cache: CacheHandle,
    pages: PageService,
    stats: StatsReporter,
    warmup: WarmupScheduler,
    revalidation: RevalidationService,
    plan: WarmupPlan,
}

fn build_application_context(settings: &config::Settings) -> Result<ApplicationContext, AppError> {
    let cache_config = CacheConfig::from(&settings.cache);
    let plan = WarmupPlan::from_config(&cache_config);
    let cache = cache::global(&cache_config).clone();
    info!(backend = ?cache.kind(), "cache backend selected");

    let source = Arc::new(HttpContentSource::new(&settings.content)?);
    if settings.content.base_url.is_none() {
        warn!("CONTENT_API_BASE_URL is not set; every fetch will fail");
    }
    let fetcher = DegradingFetcher::new(
        source,
        FetchPolicy {
            disable_auxiliary: settings.content.disable_auxiliary,
        },
    );
    let pages = PageService::new(cache.clone(), fetcher);

    let hook: Arc<dyn RegenerationHook> = match settings.revalidate.hook_url.clone() {
        Some(url) => Arc::new(WebhookRegenerationHook::new(url)?),
        None => Arc::new(LoggingRegenerationHook),
    };
    if settings.revalidate.secret.is_none() {
        warn!("REVALIDATE_SECRET is not set; revalidation requests will be rejected");
    }

    Ok(ApplicationContext {
        stats: StatsReporter::new(cache.clone()),
        warmup: WarmupScheduler::new(pages.clone()),
        revalidation: RevalidationService::new(settings.revalidate.secret.as_deref(), hook),
        cache,
        pages,
        plan,
    })
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let app = build_application_context(&settings)?;
    let shutdown = CancellationToken::new();

    let sweeper = app.cache.spawn_sweeper(shutdown.child_token());

    let warmup_ids = Arc::new(settings.warmup.page_ids.clone());
    if settings.warmup.on_startup && !warmup_ids.is_empty() {
        let scheduler = app.warmup.clone();
        let ids = warmup_ids.clone();
        let plan = app.plan;
        let cancel = shutdown.child_token();
        tokio::spawn(async move {
            if let Err(err) = scheduler.warm(&ids, plan, cancel).await {
                warn!(error = %err, "startup warmup skipped");
            }
        });
    }

    let state = HttpState {
        pages: app.pages,
        stats: app.stats,
        warmup: app.warmup,
        revalidation: app.revalidation,
        warmup_plan: app.plan,
        warmup_ids,
        shutdown: shutdown.clone(),
    };
    let result = serve_http(&settings, state, shutdown.clone()).await;

    shutdown.cancel();
    if let Some(handle) = sweeper {
        let _ = handle.await;
    }
    result
}

async fn run_warmup(settings: config::Settings) -> Result<(), AppError> {
    if settings.warmup.page_ids.is_empty() {
        return Err(AppError::validation(
            "no page ids to warm; pass them as arguments or set WARMUP_PAGE_IDS",
        ));
    }

    let app = build_application_context(&settings)?;
    let cancel = CancellationToken::new();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };

    let report = app
        .warmup
        .warm(&settings.warmup.page_ids, app.plan, cancel)
        .await?;
    watcher.abort();

    info!(
        run_id = %report.run_id,
        total = report.total,
        succeeded = report.succeeded,
        failed = report.failed,
        timed_out = report.timed_out,
        cancelled = report.cancelled,
        "warmup complete"
    );
    if report.failed + report.timed_out > 0 {
        for item in report.batches.iter().flat_map(|batch| &batch.items) {
            info!(id = %item.id, outcome = ?item.outcome, "warmup item");
        }
    }
    Ok(())
}

async fn serve_http(
    settings: &config::Settings,
    state: HttpState,
    shutdown: CancellationToken,
) -> Result<(), AppError> {
    let router = http::build_router(state);

    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::bind(settings.server.addr, err)))?;
    info!(addr = %settings.server.addr, "listening");

    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(async move {
            let ctrl_c = async {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => info!("shutdown requested"),
                    Err(err) => {
                        warn!(error = %err, "failed to listen for shutdown signal");
                        std::future::pending::<()>().await;
                    }
                }
            };
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = ctrl_c => shutdown.cancel(),
            }
        })
        .await
        .map_err(|err| AppError::unexpected(format!("server error: {err}")))?;

    Ok(())
}
