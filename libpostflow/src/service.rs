//! Service facade for Postflow
//!
//! `PostflowService` wires the shared pieces (database, platform factory,
//! rate-limited API manager, clock) into the sub-services and is the single
//! entry point the binaries use:
//!
//! - [`Scheduler`]: schedule, edit and publish posts
//! - [`PostMonitor`]: reconcile submitted posts, retry and notify failures
//! - [`AccountService`]: connect platform accounts and hand out credentials
//!
//! # Example
//!
//! ```no_run
//! use libpostflow::service::PostflowService;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> libpostflow::Result<()> {
//! let service = PostflowService::new().await?;
//! let report = service.run_cycle(&CancellationToken::new()).await?;
//! println!("Published {} posts", report.processed.completed);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::accounts::AccountService;
use crate::api_manager::ApiManager;
use crate::clock::{system_clock, SharedClock};
use crate::media::MediaFetcher;
use crate::monitor::{MonitorResult, PostMonitor};
use crate::notify::{LogNotifier, Notifier};
use crate::platforms::PlatformFactory;
use crate::rate_limiter::RateLimiter;
use crate::scheduler::{ProcessSummary, Scheduler};
use crate::{Config, Database, Result};

/// What one [`PostflowService::run_cycle`] did
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub processed: ProcessSummary,
    pub monitor: MonitorResult,
    /// Users told about failed posts
    pub notified: usize,
    /// Finished posts deleted by retention cleanup
    pub cleaned_up: u64,
}

/// Main service facade that coordinates all sub-services
///
/// All sub-services share one [`Database`] handle, one [`PlatformFactory`]
/// and one [`ApiManager`], so rate limits are enforced across all of them.
pub struct PostflowService {
    config: Arc<Config>,
    db: Database,
    factory: Arc<PlatformFactory>,
    api: Arc<ApiManager>,
    accounts: Arc<AccountService>,
    scheduler: Scheduler,
    monitor: PostMonitor,
}

impl PostflowService {
    /// Create a service from the default configuration file
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be loaded or the
    /// database cannot be opened and migrated.
    pub async fn new() -> Result<Self> {
        let config = Config::load()?;
        Self::from_config(config).await
    }

    /// Create a service from an already loaded configuration
    ///
    /// Uses the system clock, real platform adapters and log notifications.
    pub async fn from_config(config: Config) -> Result<Self> {
        let db = Database::new(&config.database.path).await?;
        let factory = Arc::new(PlatformFactory::from_config(&config)?);
        Self::from_parts(
            config,
            db,
            factory,
            system_clock(),
            Arc::new(LogNotifier),
        )
    }

    /// Assemble a service around caller-provided parts
    ///
    /// Tests use this to inject mock adapters, a manual clock and a
    /// recording notifier.
    pub fn from_parts(
        config: Config,
        db: Database,
        factory: Arc<PlatformFactory>,
        clock: SharedClock,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let media = MediaFetcher::new(config.http.timeout())?;
        // Rate-limit windows live in the database so every process shares them
        let limiter = RateLimiter::new(Arc::new(db.clone()), clock.clone());
        let api = Arc::new(ApiManager::from_config(limiter, &config));
        let accounts = Arc::new(AccountService::new(
            db.clone(),
            factory.clone(),
            clock.clone(),
        ));
        let scheduler = Scheduler::new(
            db.clone(),
            factory.clone(),
            api.clone(),
            accounts.clone(),
            media.clone(),
            clock.clone(),
        )
        .with_concurrency(config.scheduling.concurrency)
        .with_max_retries(config.scheduling.max_retries);
        let monitor = PostMonitor::new(
            db.clone(),
            factory.clone(),
            api.clone(),
            accounts.clone(),
            media,
            clock,
            notifier,
        )
        .with_max_check_failures(config.scheduling.max_check_failures);

        Ok(Self {
            config: Arc::new(config),
            db,
            factory,
            api,
            accounts,
            scheduler,
            monitor,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Access the database directly
    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn factory(&self) -> &PlatformFactory {
        &self.factory
    }

    pub fn api(&self) -> &ApiManager {
        &self.api
    }

    pub fn accounts(&self) -> &AccountService {
        &self.accounts
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn monitor(&self) -> &PostMonitor {
        &self.monitor
    }

    /// One batch of background work
    ///
    /// Publishes due posts, reconciles submitted ones, notifies users about
    /// failures and applies retention. Nothing after publishing runs once
    /// `cancel` has fired.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> Result<CycleReport> {
        let mut report = CycleReport {
            processed: self.scheduler.process_due_posts_until(cancel).await?,
            ..Default::default()
        };
        if cancel.is_cancelled() {
            debug!("Cycle cancelled after publishing");
            return Ok(report);
        }

        report.monitor = self.monitor.monitor_scheduled_posts().await;
        if !report.monitor.failed_posts.is_empty() {
            report.notified = self.monitor.notify_failed_posts(&report.monitor).await;
        }

        report.cleaned_up = self
            .scheduler
            .cleanup_expired(self.config.scheduling.retention_days)
            .await?;
        let purged = self.api.limiter().purge_expired().await?;
        if purged > 0 {
            debug!(purged, "Expired rate-limit entries removed");
        }

        info!(
            completed = report.processed.completed,
            failed = report.processed.failed,
            published = report.monitor.published,
            "Cycle finished"
        );
        Ok(report)
    }
}
