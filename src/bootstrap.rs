use sqlx::{postgres::PgPoolOptions, PgPool};
use std::{sync::Arc, time::Duration};
use tracing::info;

use crate::{
    api::handler::AppState,
    config::{Config, DatabaseConfig, QueueBackend, StoreBackend},
    error::{AppError, AppResult},
    ledger::{InMemoryLedgerStore, LedgerRepository, LedgerStore, TokenLedger},
    orders::{JobDispatcher, OrderService, TokenPricing, UploadStorage},
    payments::PaymentService,
    queue::{InMemoryJobQueue, JobQueue, RedisJobQueue},
    reconcile::DispatchReconciler,
};

/// Balance given to the demo user created for standalone in-memory runs.
const DEMO_USER_BALANCE: i64 = 10;

/// Everything the binary needs: request state plus the background reconciler.
pub struct Application {
    pub state: AppState,
    pub reconciler: Arc<DispatchReconciler>,
}

pub async fn initialize_app_state(config: Config) -> AppResult<Application> {
    info!("Initializing application components ...");

    let lock_timeout = Duration::from_millis(config.ledger.lock_timeout_ms);

    let store: Arc<dyn LedgerStore> = match config.database.backend {
        StoreBackend::Postgres => {
            let pool = initialize_database(&config.database).await?;
            Arc::new(LedgerRepository::new(pool, lock_timeout))
        }
        StoreBackend::Memory => {
            let store = InMemoryLedgerStore::new(lock_timeout).with_default_catalog();
            let demo = store.seed_user(DEMO_USER_BALANCE);
            info!(
                user_id = demo.id,
                balance = demo.token_balance,
                "⚠️  In-memory ledger: data is lost on restart, demo user seeded"
            );
            Arc::new(store)
        }
    };

    let queue: Arc<dyn JobQueue> = match config.queue.backend {
        QueueBackend::Redis => Arc::new(
            RedisJobQueue::new(&config.queue.redis_url, &config.queue.queue_name).await?,
        ),
        QueueBackend::Memory => {
            info!("⚠️  In-memory job queue: jobs are not visible to external workers");
            Arc::new(InMemoryJobQueue::new())
        }
    };

    build_application(Arc::new(config), store, queue)
}

/// Wire services over an already-open store and queue.
pub fn build_application(
    config: Arc<Config>,
    store: Arc<dyn LedgerStore>,
    queue: Arc<dyn JobQueue>,
) -> AppResult<Application> {
    let pricing = TokenPricing::from_config(&config.pricing)?;
    info!(mode = ?config.pricing.mode, "✓ Token pricing configured");

    let storage = UploadStorage::new(config.storage.root.clone());

    let dispatcher = Arc::new(JobDispatcher::new(
        store.clone(),
        queue.clone(),
        config.queue.output_dir.clone(),
    ));

    let orders = Arc::new(OrderService::new(
        store.clone(),
        pricing,
        storage.clone(),
        dispatcher.clone(),
        config.storage.max_upload_bytes,
    ));

    let payments = Arc::new(PaymentService::new(
        store.clone(),
        storage,
        config.storage.max_proof_bytes,
        config.storage.proof_url_prefix.clone(),
    ));

    let ledger = Arc::new(TokenLedger::new(store.clone()));

    let reconciler = Arc::new(DispatchReconciler::new(
        store.clone(),
        dispatcher,
        config.reconcile.clone(),
    ));

    let state = AppState {
        config,
        store,
        queue,
        ledger,
        orders,
        payments,
    };

    Ok(Application { state, reconciler })
}

async fn initialize_database(config: &DatabaseConfig) -> AppResult<PgPool> {
    info!("📊 Connecting to database...");

    let url = config.url.as_deref().ok_or_else(|| {
        AppError::Config("DATABASE_URL must be set for the postgres backend".to_string())
    })?;

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(url)
        .await?;

    info!(max_connections = config.max_connections, "✓ Database pool configured");

    info!("🔄 Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;

    info!("✓ Database initialized");
    Ok(pool)
}
