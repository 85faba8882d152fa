//! Distributed leader lock over the shared Redis cache.
//!
//! Horizontally scaled replicas race for one key; only the holder runs the
//! gateway. Without a configured Redis the process is a single-replica
//! deployment and elects itself at startup.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use redis::aio::ConnectionManager;
use redis::Script;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const LEADER_KEY: &str = "mqtt:leader:lock";
const LOCK_TTL_MS: u64 = 10_000;
const RENEW_EVERY: Duration = Duration::from_secs(5);
const RETRY_BASE_MS: u64 = 1_000;
const RETRY_SPREAD_MS: u64 = 1_000;

const RENEW_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('pexpire', KEYS[1], ARGV[2])
else
    return 0
end
"#;

const RELEASE_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
else
    return 0
end
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderEvent {
    Elected,
    Revoked,
}

pub struct LeaderHandle {
    pub events: mpsc::UnboundedReceiver<LeaderEvent>,
    am_leader: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl LeaderHandle {
    pub fn am_leader(&self) -> bool {
        self.am_leader.load(Ordering::SeqCst)
    }

    pub async fn join(self) {
        let _ = self.task.await;
    }
}

/// Start the election loop. Events arrive on the returned handle; the loop
/// ends (releasing the lock) when `shutdown` flips true.
pub fn spawn_leader(
    conn: Option<ConnectionManager>,
    shutdown: watch::Receiver<bool>,
) -> LeaderHandle {
    let (events_tx, events) = mpsc::unbounded_channel();
    let am_leader = Arc::new(AtomicBool::new(false));
    let flag = am_leader.clone();
    let task = tokio::spawn(run(conn, flag, events_tx, shutdown));
    LeaderHandle {
        events,
        am_leader,
        task,
    }
}

async fn run(
    conn: Option<ConnectionManager>,
    am_leader: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<LeaderEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let Some(mut conn) = conn else {
        info!("no shared cache configured, assuming standalone leadership");
        am_leader.store(true, Ordering::SeqCst);
        let _ = events.send(LeaderEvent::Elected);
        let _ = shutdown.changed().await;
        am_leader.store(false, Ordering::SeqCst);
        let _ = events.send(LeaderEvent::Revoked);
        return;
    };

    let token = new_token();
    let renew = Script::new(RENEW_SCRIPT);
    let release = Script::new(RELEASE_SCRIPT);
    let mut leading = false;

    loop {
        if *shutdown.borrow() {
            break;
        }
        if !leading {
            if try_acquire(&mut conn, &token).await {
                leading = true;
                am_leader.store(true, Ordering::SeqCst);
                info!(key = LEADER_KEY, "leader lock acquired");
                let _ = events.send(LeaderEvent::Elected);
                continue;
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(retry_delay()) => {}
            }
        } else {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(RENEW_EVERY) => {
                    let renewed: Result<i64, _> = renew
                        .key(LEADER_KEY)
                        .arg(&token)
                        .arg(LOCK_TTL_MS)
                        .invoke_async(&mut conn)
                        .await;
                    match renewed {
                        Ok(1) => debug!("leader lock renewed"),
                        Ok(_) | Err(_) => {
                            warn!("leader lock renewal failed, stepping down");
                            leading = false;
                            am_leader.store(false, Ordering::SeqCst);
                            let _ = events.send(LeaderEvent::Revoked);
                        }
                    }
                }
            }
        }
    }

    if leading {
        let released: Result<i64, _> = release
            .key(LEADER_KEY)
            .arg(&token)
            .invoke_async(&mut conn)
            .await;
        if let Err(err) = released {
            warn!(error = %err, "could not release leader lock");
        }
        am_leader.store(false, Ordering::SeqCst);
        let _ = events.send(LeaderEvent::Revoked);
    }
}

async fn try_acquire(conn: &mut ConnectionManager, token: &str) -> bool {
    let outcome: Result<Option<String>, _> = redis::cmd("SET")
        .arg(LEADER_KEY)
        .arg(token)
        .arg("NX")
        .arg("PX")
        .arg(LOCK_TTL_MS)
        .query_async(conn)
        .await;
    match outcome {
        Ok(Some(_)) => true,
        Ok(None) => false,
        Err(err) => {
            warn!(error = %err, "leader lock acquisition errored");
            false
        }
    }
}

/// 1.5 s ± 500 ms so racing replicas do not hammer the lock in lockstep.
fn retry_delay() -> Duration {
    Duration::from_millis(RETRY_BASE_MS + rand::thread_rng().gen_range(0..=RETRY_SPREAD_MS))
}

fn new_token() -> String {
    let mut raw = [0u8; 16];
    rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut raw);
    hex::encode(raw)
}
