//! A small Postgres connection pool with a per-connection statement cache.
//!
//! Compared to an off-the-shelf pool we:
//! - limit the number of cached prepared statements owned by each connection
//!   to keep memory on the Postgres server bounded
//! - automatically clean up idle connections
//! - wrap every statement in a watchdog timeout that poisons the connection,
//!   so a hung statement can never wedge a collection or upload cycle.

use std::{
    collections::VecDeque,
    env,
    fs,
    path::Path,
    sync::{
        atomic::{
            self,
            AtomicBool,
        },
        Arc,
        Weak,
    },
};

use anyhow::Context as _;
use common::{
    knobs::{
        PG_INACTIVE_CONNECTION_LIFETIME,
        PG_MAX_CACHED_STATEMENTS,
        PG_MAX_CONNECTIONS,
        PG_TIMEOUT,
    },
    runtime::tokio_spawn,
};
use futures::{
    select_biased,
    Future,
    FutureExt as _,
};
use lru::LruCache;
use parking_lot::Mutex;
use rustls::{
    ClientConfig,
    RootCertStore,
};
use rustls_pki_types::{
    pem::PemObject,
    CertificateDer,
};
use tokio::{
    sync::{
        oneshot,
        Semaphore,
        SemaphorePermit,
    },
    task::JoinHandle,
    time::{
        sleep,
        Instant,
    },
};
use tokio_postgres::{
    config::SslMode,
    types::ToSql,
    NoTls,
    Row,
    Statement,
    Transaction,
};
use tokio_postgres_rustls::MakeRustlsConnect;

#[derive(Debug, thiserror::Error)]
#[error("Postgres timeout")]
pub struct PostgresTimeout;

// A hung statement would otherwise stall a whole cycle, so anything that
// talks to Postgres is wrapped in with_timeout; on expiry the connection is
// poisoned and dropped instead of being returned to the pool.
pub(crate) async fn with_timeout<R, E, Fut: Future<Output = Result<R, E>>>(
    f: Fut,
) -> anyhow::Result<R>
where
    E: Into<anyhow::Error>,
{
    select_biased! {
        r = f.fuse() => {
            match r {
                Ok(r) => Ok(r),
                Err(e) => Err(e.into())
            }
        },
        _ = sleep(*PG_TIMEOUT).fuse() => {
            Err(anyhow::anyhow!(PostgresTimeout))
        },
    }
}

type StatementCache = LruCache<String, Statement>;

/// A Postgres connection, owned by either the pool ([`PgPool`]) or an active
/// caller ([`PgConnection`]).
struct PooledConnection {
    client: tokio_postgres::Client,
    statement_cache: Mutex<StatementCache>,
    last_used: Instant,
}

impl PooledConnection {
    fn new(client: tokio_postgres::Client) -> Self {
        let capacity = (*PG_MAX_CACHED_STATEMENTS)
            .try_into()
            .unwrap_or(std::num::NonZeroUsize::MIN);
        Self {
            client,
            statement_cache: Mutex::new(LruCache::new(capacity)),
            last_used: Instant::now(),
        }
    }
}

async fn prepare_cached(
    client: &tokio_postgres::Client,
    cache: &Mutex<StatementCache>,
    statement: &str,
) -> anyhow::Result<Statement> {
    if let Some(prepared) = cache.lock().get(statement) {
        return Ok(prepared.clone());
    }
    let prepared = client.prepare(statement).await?;
    // N.B.: if the cache is at capacity, this drops the oldest statement,
    // which sends a message on the connection asking to deallocate it.
    cache.lock().put(statement.to_owned(), prepared.clone());
    Ok(prepared)
}

fn handle_error(poisoned: &AtomicBool, e: impl Into<anyhow::Error>) -> anyhow::Error {
    let e: anyhow::Error = e.into();
    if e.downcast_ref::<tokio_postgres::Error>()
        .is_some_and(|e| e.is_closed())
        || e.downcast_ref::<PostgresTimeout>().is_some()
    {
        tracing::error!("Not reusing connection after error: {e:#}");
        poisoned.store(true, atomic::Ordering::Relaxed);
    }
    e
}

/// An active Postgres connection from a [`PgPool`].
///
/// Returns the underlying connection to the pool when dropped (unless it has
/// been poisoned by a timeout or a closed socket).
pub struct PgConnection<'a> {
    pool: &'a PgPool,
    _permit: SemaphorePermit<'a>,
    conn: Option<PooledConnection>,
    poisoned: AtomicBool,
}

impl PgConnection<'_> {
    fn conn(&self) -> &PooledConnection {
        self.conn
            .as_ref()
            .expect("connection is only taken in Drop")
    }

    pub async fn batch_execute(&self, query: &str) -> anyhow::Result<()> {
        with_timeout(self.conn().client.batch_execute(query))
            .await
            .map_err(|e| handle_error(&self.poisoned, e))
    }

    pub async fn prepare_cached(&self, query: &str) -> anyhow::Result<Statement> {
        let conn = self.conn();
        with_timeout(prepare_cached(&conn.client, &conn.statement_cache, query))
            .await
            .map_err(|e| handle_error(&self.poisoned, e))
    }

    pub async fn query(
        &self,
        statement: &Statement,
        params: &[&(dyn ToSql + Sync)],
    ) -> anyhow::Result<Vec<Row>> {
        with_timeout(self.conn().client.query(statement, params))
            .await
            .map_err(|e| handle_error(&self.poisoned, e))
    }

    pub async fn query_opt(
        &self,
        statement: &Statement,
        params: &[&(dyn ToSql + Sync)],
    ) -> anyhow::Result<Option<Row>> {
        with_timeout(self.conn().client.query_opt(statement, params))
            .await
            .map_err(|e| handle_error(&self.poisoned, e))
    }

    pub async fn execute(
        &self,
        statement: &Statement,
        params: &[&(dyn ToSql + Sync)],
    ) -> anyhow::Result<u64> {
        with_timeout(self.conn().client.execute(statement, params))
            .await
            .map_err(|e| handle_error(&self.poisoned, e))
    }

    pub async fn transaction(&mut self) -> anyhow::Result<PgTransaction<'_>> {
        let conn = self
            .conn
            .as_mut()
            .expect("connection is only taken in Drop");
        let inner = match with_timeout(conn.client.transaction()).await {
            Ok(t) => t,
            Err(e) => return Err(handle_error(&self.poisoned, e)),
        };
        Ok(PgTransaction {
            inner,
            statement_cache: &conn.statement_cache,
            poisoned: &self.poisoned,
        })
    }
}

impl Drop for PgConnection<'_> {
    fn drop(&mut self) {
        if *self.poisoned.get_mut() {
            tracing::warn!("Dropping poisoned Postgres connection");
            return;
        }
        let mut conn = self.conn.take().expect("connection is only taken in Drop");
        conn.last_used = Instant::now();
        let mut idle_conns = self.pool.connections.lock();
        // don't return connections to a closed pool
        if !self.pool.semaphore.is_closed() {
            idle_conns.push_back(conn);
        }
    }
}

/// An active transaction on a [`PgConnection`].
pub struct PgTransaction<'a> {
    inner: Transaction<'a>,
    statement_cache: &'a Mutex<StatementCache>,
    poisoned: &'a AtomicBool,
}

impl PgTransaction<'_> {
    pub async fn prepare_cached(&self, query: &str) -> anyhow::Result<Statement> {
        with_timeout(prepare_cached(
            self.inner.client(),
            self.statement_cache,
            query,
        ))
        .await
        .map_err(|e| handle_error(self.poisoned, e))
    }

    pub async fn execute(
        &self,
        statement: &Statement,
        params: &[&(dyn ToSql + Sync)],
    ) -> anyhow::Result<u64> {
        with_timeout(self.inner.execute(statement, params))
            .await
            .map_err(|e| handle_error(self.poisoned, e))
    }

    pub async fn commit(self) -> anyhow::Result<()> {
        with_timeout(self.inner.commit())
            .await
            .map_err(|e| handle_error(self.poisoned, e))
    }
}

enum TlsMode {
    Disabled,
    Rustls(Box<MakeRustlsConnect>),
}

/// A Postgres connection pool. Always used behind an `Arc`; the agent holds
/// one for the local store and, in the downstream sync agent, one for the
/// remote configuration database.
pub struct PgPool {
    pg_config: tokio_postgres::Config,
    tls: TlsMode,
    /// Limits the total number of connections handed out simultaneously.
    semaphore: Semaphore,
    /// Idle connections, ordered by `last_used` from oldest to newest.
    connections: Mutex<VecDeque<PooledConnection>>,
    idle_worker: Mutex<Option<JoinHandle<()>>>,
}

impl PgPool {
    pub fn new(pg_config: tokio_postgres::Config) -> anyhow::Result<Arc<Self>> {
        let max_size = *PG_MAX_CONNECTIONS;
        tracing::info!("Postgres connection pool max size {max_size}");
        let tls = match pg_config.get_ssl_mode() {
            SslMode::Disable => TlsMode::Disabled,
            _ => TlsMode::Rustls(Box::new(MakeRustlsConnect::new(build_tls_config()?))),
        };
        // The idle worker needs a (weak) reference to the created pool, but
        // the pool also wants a handle on the worker; resolve this cyclic
        // situation by sneaking the weak reference through a channel.
        let (this_tx, this_rx) = oneshot::channel();
        let idle_worker = tokio_spawn("postgres_idle_worker", async move {
            Self::idle_worker(this_rx.await.expect("nothing sent on this_tx?")).await
        });
        let this = Arc::new(PgPool {
            pg_config,
            tls,
            semaphore: Semaphore::new(max_size),
            connections: Mutex::new(VecDeque::new()),
            idle_worker: Mutex::new(Some(idle_worker)),
        });
        _ = this_tx.send(Arc::downgrade(&this));
        Ok(this)
    }

    /// Assumes that we already have a semaphore permit.
    async fn get_connection_internal(&self) -> anyhow::Result<PooledConnection> {
        {
            let mut conns = self.connections.lock();
            // Always reuse the newest connection
            while let Some(conn) = conns.pop_back() {
                if conn.client.is_closed() {
                    continue;
                }
                return Ok(conn);
            }
        }
        self.create_connection().await
    }

    async fn create_connection(&self) -> anyhow::Result<PooledConnection> {
        let client = match &self.tls {
            TlsMode::Disabled => {
                let (client, conn) = self.pg_config.connect(NoTls).await?;
                tokio_spawn("postgres_connection", async move {
                    if let Err(e) = conn.await {
                        tracing::error!("postgres connection error: {e}");
                    }
                });
                client
            },
            TlsMode::Rustls(connector) => {
                let (client, conn) = self.pg_config.connect((**connector).clone()).await?;
                tokio_spawn("postgres_connection", async move {
                    if let Err(e) = conn.await {
                        tracing::error!("postgres connection error: {e}");
                    }
                });
                client
            },
        };
        Ok(PooledConnection::new(client))
    }

    pub async fn get_connection(&self) -> anyhow::Result<PgConnection<'_>> {
        let (permit, conn) = with_timeout(async {
            let permit = self
                .semaphore
                .acquire()
                .await
                .context("PgPool has been shut down")?;
            let conn = self.get_connection_internal().await?;
            anyhow::Ok((permit, conn))
        })
        .await?;
        Ok(PgConnection {
            pool: self,
            _permit: permit,
            conn: Some(conn),
            poisoned: AtomicBool::new(false),
        })
    }

    /// Drops all pooled connections and prevents the creation of new ones.
    pub fn shutdown(&self) {
        // N.B.: this doesn't abort in-progress connections, but they won't be
        // returned to the pool on drop
        self.semaphore.close();
        self.connections.lock().clear();
        if let Some(worker) = self.idle_worker.lock().take() {
            worker.abort();
        }
    }

    async fn idle_worker(this: Weak<Self>) {
        loop {
            let oldest = if let Some(this) = this.upgrade() {
                this.cleanup_idle_connections()
            } else {
                break;
            };
            let next_wakeup =
                oldest.unwrap_or_else(Instant::now) + *PG_INACTIVE_CONNECTION_LIFETIME;
            tokio::time::sleep_until(next_wakeup).await;
        }
    }

    // Returns the last_used time of the oldest connection
    fn cleanup_idle_connections(&self) -> Option<Instant> {
        let mut connections = self.connections.lock();
        while let Some(c) = connections.front() {
            if c.last_used.elapsed() <= *PG_INACTIVE_CONNECTION_LIFETIME {
                break;
            }
            connections.pop_front();
        }
        connections.front().map(|c| c.last_used)
    }
}

impl Drop for PgPool {
    fn drop(&mut self) {
        if let Some(worker) = self.idle_worker.lock().take() {
            worker.abort();
        }
    }
}

pub(crate) fn build_tls_config() -> anyhow::Result<ClientConfig> {
    let mut roots = RootCertStore::empty();
    let native_certs = rustls_native_certs::load_native_certs();
    anyhow::ensure!(
        native_certs.errors.is_empty(),
        "failed to load native certs: {:?}",
        native_certs.errors
    );
    for cert in native_certs.certs {
        roots.add(cert)?;
    }
    if let Some(ca_file_path) = env::var_os("PG_CA_FILE") {
        if !ca_file_path.is_empty() {
            let ca_file_path = Path::new(&ca_file_path);
            let ca_file_content = fs::read(ca_file_path)
                .with_context(|| format!("Failed to read CA file: {}", ca_file_path.display()))?;
            for ca_cert in CertificateDer::pem_slice_iter(&ca_file_content) {
                roots.add(ca_cert.with_context(|| {
                    format!("Failed to parse CA file as PEM: {}", ca_file_path.display())
                })?)?;
            }
        }
    }
    Ok(ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth())
}
