//! Keyed background jobs
//!
//! Observers run one job per tunnel (or per tunnel session). A job is a
//! spawned task plus a child of the owner's cancellation scope, so
//! cancelling the owner cancels every job.

use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

struct Job {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub(crate) struct JobSet<K> {
    scope: CancellationToken,
    jobs: HashMap<K, Job>,
}

impl<K: Eq + Hash + Copy + Debug> JobSet<K> {
    pub(crate) fn new(scope: CancellationToken) -> Self {
        Self {
            scope,
            jobs: HashMap::new(),
        }
    }

    /// Live job for `key`; finished jobs do not count
    pub(crate) fn contains(&self, key: &K) -> bool {
        self.jobs.get(key).is_some_and(|job| !job.handle.is_finished())
    }

    /// Spawn `job` under `key`, replacing any previous job
    pub(crate) fn spawn<F, Fut>(&mut self, key: K, job: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.cancel(&key);
        let cancel = self.scope.child_token();
        let handle = tokio::spawn(job(cancel.clone()));
        debug!("Job {:?} started", key);
        self.jobs.insert(key, Job { cancel, handle });
    }

    pub(crate) fn cancel(&mut self, key: &K) -> bool {
        match self.jobs.remove(key) {
            Some(job) => {
                job.cancel.cancel();
                debug!("Job {:?} cancelled", key);
                true
            }
            None => false,
        }
    }

    /// Cancel every job whose key fails `keep`
    pub(crate) fn retain(&mut self, keep: impl Fn(&K) -> bool) {
        let stale: Vec<K> = self.jobs.keys().filter(|k| !keep(k)).copied().collect();
        for key in stale {
            self.cancel(&key);
        }
    }

}

impl<K> Drop for JobSet<K> {
    fn drop(&mut self) {
        for job in self.jobs.values() {
            job.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_retain_cancels_dropped_keys() {
        let mut jobs = JobSet::new(CancellationToken::new());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        for key in 1..=3u32 {
            let tx = tx.clone();
            jobs.spawn(key, move |cancel| async move {
                cancel.cancelled().await;
                let _ = tx.send(key);
            });
        }
        assert!((1..=3).all(|k| jobs.contains(&k)));

        jobs.retain(|k| *k != 2);
        assert_eq!(rx.recv().await, Some(2));
        assert!(!jobs.contains(&2));
        assert!(jobs.contains(&1));

        drop(jobs);
        let mut rest = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
        rest.sort();
        assert_eq!(rest, vec![1, 3]);
    }

    #[tokio::test]
    async fn test_scope_cancels_children() {
        let scope = CancellationToken::new();
        let mut jobs = JobSet::new(scope.clone());
        let (tx, rx) = tokio::sync::oneshot::channel();
        jobs.spawn("ping", move |cancel| async move {
            cancel.cancelled().await;
            let _ = tx.send(());
        });

        scope.cancel();
        assert!(rx.await.is_ok());
    }
}
