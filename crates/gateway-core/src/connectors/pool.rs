//! Per-agent connection pooling
//!
//! Each agent gets its own pool bounded by `max_open`; saturated
//! acquires wait up to the acquire timeout and then fail with
//! `pool_timeout`. Idle connections are reused newest-first and retired
//! by age, either on acquire or by the background sweeper.

use super::{ConnectorFactory, DriverConnection, EndpointFailover};
use dashmap::DashMap;
use shared::config::PoolConfig;
use shared::models::{ConnectionParams, DatabaseBinding};
use shared::{GatewayError, Result};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

struct IdleConn {
    conn: Box<dyn DriverConnection>,
    idle_since: Instant,
}

struct AgentPool {
    /// Permits bound live connections (idle + in use)
    slots: Arc<Semaphore>,
    idle: Mutex<VecDeque<IdleConn>>,
}

impl AgentPool {
    fn new(max_open: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(max_open)),
            idle: Mutex::new(VecDeque::new()),
        }
    }
}

/// A connection checked out of a pool
///
/// Return it with [`PoolSet::release`]. A handle dropped without
/// release still frees its pool slot (the permit it carries), but the
/// driver connection is torn down abruptly instead of through
/// [`DriverConnection::close`]; take that path only on error unwinds.
pub struct PooledConnection {
    conn: Option<Box<dyn DriverConnection>>,
    agent_id: String,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("agent_id", &self.agent_id)
            .finish()
    }
}

impl PooledConnection {
    /// The underlying driver connection
    pub fn conn(&mut self) -> &mut dyn DriverConnection {
        self.conn
            .as_mut()
            .expect("connection taken before release")
            .as_mut()
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }
}

/// All per-agent pools
pub struct PoolSet {
    factory: Arc<ConnectorFactory>,
    config: PoolConfig,
    pools: DashMap<String, Arc<AgentPool>>,
}

impl PoolSet {
    pub fn new(factory: Arc<ConnectorFactory>, config: PoolConfig) -> Self {
        Self {
            factory,
            config,
            pools: DashMap::new(),
        }
    }

    pub fn factory(&self) -> &ConnectorFactory {
        &self.factory
    }

    fn pool_for(&self, agent_id: &str) -> Arc<AgentPool> {
        self.pools
            .entry(agent_id.to_string())
            .or_insert_with(|| Arc::new(AgentPool::new(self.config.max_open)))
            .clone()
    }

    /// Acquire a connection for an agent, waiting up to `timeout`
    ///
    /// Reuses a live idle connection when one exists; otherwise opens a
    /// fresh one through the factory (endpoint failovers bubble up for
    /// auditing).
    pub async fn acquire(
        &self,
        agent_id: &str,
        binding: &DatabaseBinding,
        params: &ConnectionParams,
        timeout: Duration,
    ) -> Result<(PooledConnection, Vec<EndpointFailover>)> {
        let pool = self.pool_for(agent_id);
        let wait_started = Instant::now();

        let permit = match tokio::time::timeout(
            timeout,
            pool.slots.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(GatewayError::internal("pool semaphore closed"));
            }
            Err(_) => {
                let waited_ms = wait_started.elapsed().as_millis() as u64;
                metrics::counter!("pool_acquire_timeouts_total").increment(1);
                tracing::warn!(
                    agent_id = agent_id,
                    waited_ms = waited_ms,
                    "Pool acquire timed out"
                );
                return Err(GatewayError::PoolTimeout {
                    waited_ms,
                    retry_after_ms: timeout.as_millis() as u64,
                });
            }
        };

        metrics::histogram!("pool_acquire_wait_seconds")
            .record(wait_started.elapsed().as_secs_f64());

        // Prefer a warm connection, discarding any that aged out or died
        loop {
            let candidate = {
                let mut idle = pool.idle.lock().await;
                idle.pop_front()
            };
            let Some(mut entry) = candidate else { break };

            if entry.idle_since.elapsed() > self.config.max_idle_age {
                entry.conn.close().await;
                continue;
            }
            if !entry.conn.ping().await {
                entry.conn.close().await;
                continue;
            }

            return Ok((
                PooledConnection {
                    conn: Some(entry.conn),
                    agent_id: agent_id.to_string(),
                    _permit: permit,
                },
                Vec::new(),
            ));
        }

        let (conn, failovers) = self.factory.connect(agent_id, binding, params).await?;
        Ok((
            PooledConnection {
                conn: Some(conn),
                agent_id: agent_id.to_string(),
                _permit: permit,
            },
            failovers,
        ))
    }

    /// Return a connection to its pool
    ///
    /// `discard` drops the handle instead of pooling it; use it after
    /// driver-fatal errors or abandoned statements.
    pub async fn release(&self, mut handle: PooledConnection, discard: bool) {
        let Some(conn) = handle.conn.take() else {
            return;
        };

        if discard {
            conn.close().await;
            metrics::counter!("pool_connections_discarded_total").increment(1);
            return;
        }

        if let Some(pool) = self.pools.get(&handle.agent_id).map(|p| p.value().clone()) {
            let mut idle = pool.idle.lock().await;
            idle.push_front(IdleConn {
                conn,
                idle_since: Instant::now(),
            });
        } else {
            // Pool was closed while this handle was out
            conn.close().await;
        }
        // The permit in `handle` drops here, freeing the slot
    }

    /// Close an agent's pool and every idle connection in it
    ///
    /// In-flight handles keep working; their release finds no pool and
    /// closes the connection.
    pub async fn close_agent(&self, agent_id: &str) {
        self.factory.forget_agent(agent_id);
        let Some((_, pool)) = self.pools.remove(agent_id) else {
            return;
        };
        let mut idle = pool.idle.lock().await;
        while let Some(entry) = idle.pop_front() {
            entry.conn.close().await;
        }
        tracing::info!(agent_id = agent_id, "Agent pool closed");
    }

    /// Retire idle connections past `max_idle_age` in every pool
    ///
    /// The newest `min_idle` connections stay warm regardless of age.
    pub async fn sweep(&self) {
        let pools: Vec<Arc<AgentPool>> =
            self.pools.iter().map(|entry| entry.value().clone()).collect();

        for pool in pools {
            let mut idle = pool.idle.lock().await;
            let mut keep = VecDeque::new();
            while let Some(entry) = idle.pop_front() {
                let aged = entry.idle_since.elapsed() > self.config.max_idle_age;
                if aged && keep.len() >= self.config.min_idle {
                    entry.conn.close().await;
                    metrics::counter!("pool_connections_swept_total").increment(1);
                } else {
                    keep.push_back(entry);
                }
            }
            *idle = keep;
        }
    }

    /// Spawn the background sweeper
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let pools = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => pools.sweep().await,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use std::sync::atomic::Ordering;

    fn pool_config(max_open: usize, max_idle_age: Duration) -> PoolConfig {
        PoolConfig {
            max_open,
            min_idle: 0,
            max_idle_age,
            acquire_timeout: Duration::from_millis(50),
        }
    }

    fn pool_set(driver: Arc<FakeDriver>, config: PoolConfig) -> Arc<PoolSet> {
        Arc::new(PoolSet::new(
            Arc::new(factory_with_fake(driver)),
            config,
        ))
    }

    #[tokio::test]
    async fn test_acquire_release_reuses_connection() {
        let driver = Arc::new(FakeDriver::new(FakeBehavior::default()));
        let pools = pool_set(driver.clone(), pool_config(2, Duration::from_secs(60)));
        let binding = binding_for("a1", 3);
        let params = params_with_hosts(&["db1"]);

        let (handle, _) = pools
            .acquire("a1", &binding, &params, Duration::from_secs(1))
            .await
            .unwrap();
        pools.release(handle, false).await;

        let (handle, _) = pools
            .acquire("a1", &binding, &params, Duration::from_secs(1))
            .await
            .unwrap();
        pools.release(handle, false).await;

        assert_eq!(driver.opened.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_discard_forces_fresh_connection() {
        let driver = Arc::new(FakeDriver::new(FakeBehavior::default()));
        let pools = pool_set(driver.clone(), pool_config(2, Duration::from_secs(60)));
        let binding = binding_for("a1", 3);
        let params = params_with_hosts(&["db1"]);

        let (handle, _) = pools
            .acquire("a1", &binding, &params, Duration::from_secs(1))
            .await
            .unwrap();
        pools.release(handle, true).await;

        let (handle, _) = pools
            .acquire("a1", &binding, &params, Duration::from_secs(1))
            .await
            .unwrap();
        pools.release(handle, false).await;

        assert_eq!(driver.opened.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_saturated_pool_times_out() {
        let driver = Arc::new(FakeDriver::new(FakeBehavior::default()));
        let pools = pool_set(driver, pool_config(1, Duration::from_secs(60)));
        let binding = binding_for("a1", 3);
        let params = params_with_hosts(&["db1"]);

        let (held, _) = pools
            .acquire("a1", &binding, &params, Duration::from_secs(1))
            .await
            .unwrap();

        let err = pools
            .acquire("a1", &binding, &params, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), shared::ErrorKind::PoolTimeout);

        pools.release(held, false).await;
        // Slot freed: the next acquire succeeds
        let (handle, _) = pools
            .acquire("a1", &binding, &params, Duration::from_millis(100))
            .await
            .unwrap();
        pools.release(handle, false).await;
    }

    #[tokio::test]
    async fn test_zero_capacity_pool_always_times_out() {
        let driver = Arc::new(FakeDriver::new(FakeBehavior::default()));
        let pools = pool_set(driver, pool_config(0, Duration::from_secs(60)));

        let err = pools
            .acquire(
                "a1",
                &binding_for("a1", 3),
                &params_with_hosts(&["db1"]),
                Duration::from_millis(10),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), shared::ErrorKind::PoolTimeout);
    }

    #[tokio::test]
    async fn test_agents_have_separate_pools() {
        let driver = Arc::new(FakeDriver::new(FakeBehavior::default()));
        let pools = pool_set(driver, pool_config(1, Duration::from_secs(60)));
        let params = params_with_hosts(&["db1"]);

        let (held_a, _) = pools
            .acquire("a1", &binding_for("a1", 3), &params, Duration::from_secs(1))
            .await
            .unwrap();

        // a2's pool is unaffected by a1 holding its only slot
        let (held_b, _) = pools
            .acquire("a2", &binding_for("a2", 3), &params, Duration::from_secs(1))
            .await
            .unwrap();

        pools.release(held_a, false).await;
        pools.release(held_b, false).await;
    }

    #[tokio::test]
    async fn test_sweep_retires_aged_connections() {
        let driver = Arc::new(FakeDriver::new(FakeBehavior::default()));
        let pools = pool_set(driver.clone(), pool_config(2, Duration::from_millis(10)));
        let binding = binding_for("a1", 3);
        let params = params_with_hosts(&["db1"]);

        let (handle, _) = pools
            .acquire("a1", &binding, &params, Duration::from_secs(1))
            .await
            .unwrap();
        pools.release(handle, false).await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        pools.sweep().await;

        // The aged connection is gone; a fresh acquire opens a new one
        let (handle, _) = pools
            .acquire("a1", &binding, &params, Duration::from_secs(1))
            .await
            .unwrap();
        pools.release(handle, false).await;
        assert_eq!(driver.opened.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_close_agent_drains_idle() {
        let driver = Arc::new(FakeDriver::new(FakeBehavior::default()));
        let pools = pool_set(driver.clone(), pool_config(2, Duration::from_secs(60)));
        let binding = binding_for("a1", 3);
        let params = params_with_hosts(&["db1"]);

        let (handle, _) = pools
            .acquire("a1", &binding, &params, Duration::from_secs(1))
            .await
            .unwrap();
        pools.release(handle, false).await;

        pools.close_agent("a1").await;

        // New pool, new connection
        let (handle, _) = pools
            .acquire("a1", &binding, &params, Duration::from_secs(1))
            .await
            .unwrap();
        pools.release(handle, false).await;
        assert_eq!(driver.opened.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_sweeper_task_runs_and_stops() {
        let driver = Arc::new(FakeDriver::new(FakeBehavior::default()));
        let pools = pool_set(driver, pool_config(2, Duration::from_millis(5)));

        let cancel = CancellationToken::new();
        let handle = pools.spawn_sweeper(Duration::from_millis(5), cancel.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        handle.await.unwrap();
    }
}
