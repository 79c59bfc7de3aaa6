//! Deadline-bounded worker fan-out and reply selection.
//!
//! One logical request goes to every worker in a pool; replies are
//! collected until all workers answered or the per-method deadline
//! passed. Replies keep worker age order (newest last): the newest
//! worker reflects the latest edit, so when it answers, its answer wins,
//! and older workers cover for one still bootstrapping.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::worker::WorkerPool;

pub const HOVER_DEADLINE: Duration = Duration::from_secs(2);
pub const DEFINITION_DEADLINE: Duration = Duration::from_secs(1);
pub const COMPLETION_DEADLINE: Duration = Duration::from_secs(2);
pub const OPTION_DECLARATION_DEADLINE: Duration = Duration::from_millis(20);
pub const OPTION_COMPLETION_DEADLINE: Duration = Duration::from_millis(100);

/// Broadcast `method` to every worker in `pool` and collect replies
/// until the deadline. Undeliverable requests, timeouts and undecodable
/// replies are dropped.
pub async fn ask_workers<R: DeserializeOwned>(
    pool: &WorkerPool,
    method: &str,
    params: &impl Serialize,
    deadline: Duration,
) -> Vec<R> {
    let params = match serde_json::to_value(params) {
        Ok(v) => v,
        Err(err) => {
            tracing::error!("cannot serialize params for {method}: {err}");
            return Vec::new();
        }
    };

    let workers = pool.snapshot().await;
    let mut receivers = Vec::with_capacity(workers.len());
    for worker in &workers {
        if let Some(rx) = worker.request(method, params.clone()).await {
            receivers.push(rx);
        }
    }

    let replies = futures::future::join_all(
        receivers
            .into_iter()
            .map(|rx| tokio::time::timeout(deadline, rx)),
    )
    .await;

    replies
        .into_iter()
        .filter_map(|r| r.ok()?.ok())
        .filter_map(|value| serde_json::from_value(value).ok())
        .collect()
}

/// Newest-first selection: the last reply satisfying `pred`, else
/// `default`.
pub fn latest_match_or<R>(replies: Vec<R>, pred: impl Fn(&R) -> bool, default: R) -> R {
    replies.into_iter().rev().find(|r| pred(r)).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latest_match_prefers_newest() {
        let replies = vec![Some(1), Some(2), Some(3)];
        assert_eq!(latest_match_or(replies, |r| r.is_some(), None), Some(3));
    }

    #[test]
    fn latest_match_skips_non_matching_newest() {
        let replies = vec![Some(1), Some(2), None];
        assert_eq!(latest_match_or(replies, |r| r.is_some(), None), Some(2));
    }

    #[test]
    fn latest_match_falls_back_to_default() {
        let replies: Vec<Option<i32>> = vec![None, None];
        assert_eq!(latest_match_or(replies, |r| r.is_some(), Some(9)), Some(9));
    }

    #[test]
    fn empty_replies_use_default() {
        let replies: Vec<i32> = Vec::new();
        assert_eq!(latest_match_or(replies, |_| true, 7), 7);
    }
}
