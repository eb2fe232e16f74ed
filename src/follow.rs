//! Session follower - keeps one merge view in sync with its log and push stream.
//!
//! The follower subscribes to the event hub before the bulk load starts, so
//! pushes that race the load are buffered by the merge engine instead of lost.

use crate::events::EventHub;
use crate::merge::MergeEngine;
use crate::normalizer;
use crate::sessions::Provider;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Where a followed session's log lives
#[derive(Debug, Clone)]
pub struct SessionSource {
    pub dir: PathBuf,
    pub project_id: String,
    pub provider: Provider,
    pub session_id: String,
}

/// Running follower. Dropping the handle stops the task.
pub struct FollowerHandle {
    stop: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl FollowerHandle {
    /// Stop the follower and wait for it to detach its view.
    pub async fn shutdown(mut self) {
        let _ = self.stop.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for FollowerHandle {
    fn drop(&mut self) {
        let _ = self.stop.send(true);
    }
}

/// Attach a view for `source` and keep it current until stopped.
pub fn spawn(
    engine: Arc<MergeEngine>,
    hub: Arc<EventHub>,
    source: SessionSource,
    poll_interval: Duration,
) -> FollowerHandle {
    let (stop, stop_rx) = watch::channel(false);
    let task = tokio::spawn(run(engine, hub, source, poll_interval, stop_rx));
    FollowerHandle {
        stop,
        task: Some(task),
    }
}

async fn run(
    engine: Arc<MergeEngine>,
    hub: Arc<EventHub>,
    source: SessionSource,
    poll_interval: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let sid = source.session_id.clone();
    if !engine.attach(&sid, source.provider) {
        return;
    }
    let mut events = hub.subscribe(&sid);
    info!("Following {} session {}", source.provider, sid);

    if let Some(ticket) = engine.begin_fetch(&sid) {
        let messages = match normalizer::get_session(
            &source.dir,
            &source.project_id,
            source.provider,
            &sid,
            None,
        )
        .await
        {
            Ok(session) => session.messages,
            Err(e) => {
                // Not written yet, or unreadable: start empty and let polling catch up
                debug!("Initial load of {} failed: {}", sid, e);
                Vec::new()
            }
        };
        engine.complete_bulk_load(&ticket, messages);
    }

    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
            received = events.recv() => match received {
                Ok((seq, event)) => {
                    debug!("Applying event {} ({}) to {}", seq, event.name(), sid);
                    engine.apply_event(&sid, &event);
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    // Dropped pushes are recovered by the next poll
                    warn!("Follower for {} lagged by {} events", sid, n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = ticker.tick() => poll(&engine, &source).await,
        }
    }

    engine.detach(&sid);
    info!("Stopped following {}", sid);
}

/// Fetch everything after the view's last file-backed message.
async fn poll(engine: &MergeEngine, source: &SessionSource) {
    let sid = &source.session_id;
    let Some(ticket) = engine.begin_fetch(sid) else {
        return;
    };
    let since = engine.last_jsonl_id(sid);
    match normalizer::get_session(
        &source.dir,
        &source.project_id,
        source.provider,
        sid,
        since.as_deref(),
    )
    .await
    {
        Ok(session) => {
            if !session.messages.is_empty() {
                debug!("Poll for {} fetched {} messages", sid, session.messages.len());
            }
            engine.apply_incremental(&ticket, session.messages);
        }
        Err(e) => debug!("Poll for {} failed, retrying next tick: {}", sid, e),
    }
}
