use std::{ops::RangeInclusive, time::Duration};

use chrono::Local;
use rand::Rng;
use tokio::{signal, time::sleep};
use tracing::{error, info, warn};

use crate::api::ProfileSink;
use crate::request::ProfileSource;
use crate::store::{PendingUpdates, ProfileStatus, ProfileStore};
use crate::vpn::Tunnel;
use crate::{
    info_time, Result, BATCH_SIZE, MAX_REQUEST_DELAY_SECS, MIN_REQUEST_DELAY_SECS,
    RATE_LIMIT_PENALTY, RECONNECT_PAUSE_SECS, REQUEST_LIMIT,
};

/// When to switch servers and how fast to go.
#[derive(Clone, Debug)]
pub struct RotationPolicy {
    pub request_limit: u32,
    pub rate_limit_penalty: u32,
    pub batch_size: usize,
    /// Seconds to wait before each fetch, drawn uniformly.
    pub request_delay: RangeInclusive<f64>,
    pub reconnect_pause: Duration,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        RotationPolicy {
            request_limit: REQUEST_LIMIT,
            rate_limit_penalty: RATE_LIMIT_PENALTY,
            batch_size: BATCH_SIZE,
            request_delay: MIN_REQUEST_DELAY_SECS..=MAX_REQUEST_DELAY_SECS,
            reconnect_pause: Duration::from_secs(RECONNECT_PAUSE_SECS),
        }
    }
}

impl RotationPolicy {
    fn next_delay(&self) -> Duration {
        let (lo, hi) = (*self.request_delay.start(), *self.request_delay.end());
        if hi <= lo {
            return Duration::from_secs_f64(lo.max(0.0));
        }
        Duration::from_secs_f64(rand::rng().random_range(lo..=hi))
    }
}

/// Requests spent on the current server.
#[derive(Debug)]
pub struct RequestBudget {
    count: u32,
    limit: u32,
    penalty: u32,
}

impl RequestBudget {
    pub fn new(limit: u32, penalty: u32) -> Self {
        RequestBudget {
            count: 0,
            limit,
            penalty,
        }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn record_request(&mut self) {
        self.count = self.count.saturating_add(1);
    }

    pub fn record_rate_limit(&mut self) {
        self.count = self.count.saturating_add(self.penalty);
    }

    pub fn exhausted(&self) -> bool {
        self.count >= self.limit
    }

    pub fn reset(&mut self) {
        self.count = 0;
    }
}

/// Outcome counters of one run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunStats {
    pub collected: usize,
    pub not_collected: usize,
    pub errors: usize,
    pub rotations: usize,
}

pub struct Collector<T, F, A, S> {
    tunnel: T,
    source: F,
    sink: A,
    store: S,
    policy: RotationPolicy,
    budget: RequestBudget,
    pending: PendingUpdates,
    stats: RunStats,
}

impl<T, F, A, S> Collector<T, F, A, S>
where
    T: Tunnel,
    F: ProfileSource,
    A: ProfileSink,
    S: ProfileStore,
{
    pub fn new(tunnel: T, source: F, sink: A, store: S, policy: RotationPolicy) -> Self {
        let budget = RequestBudget::new(policy.request_limit, policy.rate_limit_penalty);
        Collector {
            tunnel,
            source,
            sink,
            store,
            policy,
            budget,
            pending: PendingUpdates::default(),
            stats: RunStats::default(),
        }
    }

    /// Collects until the store runs dry or Ctrl-C, then always shuts down cleanly.
    /// The loop's own error is returned after shutdown.
    pub async fn run(mut self) -> Result<RunStats> {
        let start_time = Local::now();
        let outcome = tokio::select! {
            res = self.process_batches() => res,
            _ = signal::ctrl_c() => {
                warn!("Interrupted, shutting down...");
                Ok(())
            }
        };
        if let Err(e) = &outcome {
            error!("Collection stopped: {e}");
        }
        let stats = self.shutdown().await;
        info_time!(
            start_time,
            "Run finished: {} collected, {} not collected, {} errors, {} rotations.",
            stats.collected,
            stats.not_collected,
            stats.errors,
            stats.rotations
        );
        outcome.map(|_| stats)
    }

    async fn process_batches(&mut self) -> Result<()> {
        loop {
            let usernames = self.store.pending_usernames(self.policy.batch_size).await?;
            if usernames.is_empty() {
                info!("No more profiles to process.");
                return Ok(());
            }

            // Only bring the tunnel up once there is work for it.
            if !self.tunnel.is_connected() {
                self.tunnel.connect_next().await?;
            }

            for username in usernames {
                sleep(self.policy.next_delay()).await;
                if self.budget.exhausted() {
                    self.rotate().await?;
                }
                self.collect_one(&username).await;
            }
        }
    }

    async fn rotate(&mut self) -> Result<()> {
        let start_time = Local::now();
        info!(
            "Reached {} requests. Switching VPN server...",
            self.budget.count()
        );
        self.tunnel.disconnect().await?;
        sleep(self.policy.reconnect_pause).await;
        self.pending.flush(&self.store).await;
        self.tunnel.connect_next().await?;
        self.budget.reset();
        self.stats.rotations += 1;
        info_time!(start_time, "VPN server switched.");
        Ok(())
    }

    async fn collect_one(&mut self, username: &str) {
        info!("Collecting profile: {username}");
        let status = match self.source.fetch_profile(username).await {
            Ok(profile) => {
                self.budget.record_request();
                info!("Collected profile {username}, sending it to the API.");
                match self.sink.submit(&profile).await {
                    Ok(()) => {
                        info!("Profile {username} delivered.");
                        ProfileStatus::Collected
                    }
                    Err(e) => {
                        error!("Couldn't deliver profile {username}: {e}");
                        ProfileStatus::Error
                    }
                }
            }
            Err(e) if e.is_rate_limit() => {
                error!("Rate limited on {username}: {e}");
                self.budget.record_rate_limit();
                ProfileStatus::NotCollected
            }
            Err(e) => {
                error!("Couldn't collect profile {username}: {e}");
                ProfileStatus::Error
            }
        };
        match status {
            ProfileStatus::Collected => self.stats.collected += 1,
            ProfileStatus::NotCollected => self.stats.not_collected += 1,
            ProfileStatus::Error => self.stats.errors += 1,
        }
        self.pending.push(username, status);
    }

    /// Disconnects, flushes and closes. Each step runs even if the previous one failed.
    async fn shutdown(mut self) -> RunStats {
        info!("Shutting down...");
        if self.tunnel.is_connected() {
            match self.tunnel.disconnect().await {
                Ok(()) => info!("VPN disconnected."),
                Err(e) => error!("Couldn't disconnect the VPN: {e}"),
            }
        }
        self.pending.flush(&self.store).await;
        if let Err(e) = self.store.close().await {
            error!("Couldn't close the store: {e}");
        }
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::{HashMap, VecDeque},
        sync::{Arc, Mutex},
    };

    use async_trait::async_trait;
    use chrono::Utc;

    use super::*;
    use crate::request::Profile;
    use crate::store::StatusUpdate;
    use crate::Error;

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Connect,
        Disconnect,
        Fetch(String),
        Flush(Vec<StatusUpdate>),
        Close,
    }

    type Log = Arc<Mutex<Vec<Event>>>;

    struct FakeTunnel {
        log: Log,
        up: bool,
        fail_connect: bool,
    }

    #[async_trait]
    impl Tunnel for FakeTunnel {
        async fn connect_next(&mut self) -> Result<()> {
            self.log.lock().unwrap().push(Event::Connect);
            if self.fail_connect {
                return Err(Error::VpnExhausted(1));
            }
            self.up = true;
            Ok(())
        }
        async fn disconnect(&mut self) -> Result<()> {
            self.log.lock().unwrap().push(Event::Disconnect);
            self.up = false;
            Ok(())
        }
        fn is_connected(&mut self) -> bool {
            self.up
        }
    }

    #[derive(Clone, Copy)]
    enum Reply {
        Ok,
        RateLimited,
        NotFound,
    }

    struct FakeSource {
        log: Log,
        replies: HashMap<String, Reply>,
    }

    #[async_trait]
    impl ProfileSource for FakeSource {
        async fn fetch_profile(&self, username: &str) -> Result<Profile> {
            self.log.lock().unwrap().push(Event::Fetch(username.into()));
            match self.replies.get(username).copied().unwrap_or(Reply::Ok) {
                Reply::Ok => Ok(Profile {
                    username: username.into(),
                    full_name: String::new(),
                    profile_url: Profile::url_for(username),
                    userid: 1,
                    biography: format!("bio of {username}"),
                    external_url: None,
                    followers: 0,
                    following: 0,
                    collected_at: Utc::now(),
                }),
                Reply::RateLimited => Err(Error::RateLimited(username.into())),
                Reply::NotFound => Err(Error::ProfileNotFound(username.into())),
            }
        }
    }

    struct FakeSink {
        reject: Vec<String>,
    }

    #[async_trait]
    impl ProfileSink for FakeSink {
        async fn submit(&self, profile: &Profile) -> Result<()> {
            if self.reject.contains(&profile.username) {
                return Err(Error::ApiRejected {
                    status: 500,
                    body: String::new(),
                });
            }
            Ok(())
        }
    }

    struct FakeStore {
        log: Log,
        batches: Mutex<VecDeque<Result<Vec<String>>>>,
    }

    #[async_trait]
    impl ProfileStore for FakeStore {
        async fn pending_usernames(&self, _limit: usize) -> Result<Vec<String>> {
            self.batches.lock().unwrap().pop_front().unwrap_or(Ok(Vec::new()))
        }
        async fn apply_updates(&self, updates: &[StatusUpdate]) -> Result<u64> {
            self.log.lock().unwrap().push(Event::Flush(updates.to_vec()));
            Ok(updates.len() as u64)
        }
        async fn close(&self) -> Result<()> {
            self.log.lock().unwrap().push(Event::Close);
            Ok(())
        }
    }

    fn quick_policy(limit: u32, penalty: u32) -> RotationPolicy {
        RotationPolicy {
            request_limit: limit,
            rate_limit_penalty: penalty,
            batch_size: 100,
            request_delay: 0.0..=0.0,
            reconnect_pause: Duration::ZERO,
        }
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn update(username: &str, status: ProfileStatus) -> StatusUpdate {
        StatusUpdate {
            username: username.into(),
            status,
        }
    }

    fn collector(
        log: &Log,
        batches: Vec<Result<Vec<String>>>,
        replies: &[(&str, Reply)],
        reject: &[&str],
        policy: RotationPolicy,
    ) -> Collector<FakeTunnel, FakeSource, FakeSink, FakeStore> {
        Collector::new(
            FakeTunnel {
                log: log.clone(),
                up: false,
                fail_connect: false,
            },
            FakeSource {
                log: log.clone(),
                replies: replies.iter().map(|(u, r)| (u.to_string(), *r)).collect(),
            },
            FakeSink {
                reject: names(reject),
            },
            FakeStore {
                log: log.clone(),
                batches: Mutex::new(batches.into()),
            },
            policy,
        )
    }

    #[test]
    fn test_budget_threshold_and_penalty() {
        let mut budget = RequestBudget::new(120, 30);
        for _ in 0..119 {
            budget.record_request();
        }
        assert!(!budget.exhausted());
        budget.record_request();
        assert!(budget.exhausted());

        budget.reset();
        assert_eq!(budget.count(), 0);
        budget.record_rate_limit();
        assert_eq!(budget.count(), 30);
        for _ in 0..3 {
            budget.record_rate_limit();
        }
        assert!(budget.exhausted());
    }

    #[test]
    fn test_default_policy() {
        let policy = RotationPolicy::default();
        assert_eq!(policy.request_limit, 120);
        assert_eq!(policy.rate_limit_penalty, 30);
        assert_eq!(policy.batch_size, 100);
        for _ in 0..50 {
            let delay = policy.next_delay();
            assert!(delay >= Duration::from_secs(2) && delay <= Duration::from_secs(5));
        }
    }

    #[tokio::test]
    async fn test_rotates_after_request_limit() {
        let log = Log::default();
        let batch = names(&["a", "b", "c", "d", "e"]);
        let stats = collector(&log, vec![Ok(batch)], &[], &[], quick_policy(3, 30))
            .run()
            .await
            .unwrap();
        assert_eq!(stats.collected, 5);
        assert_eq!(stats.rotations, 1);

        let collected = |u: &str| update(u, ProfileStatus::Collected);
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                Event::Connect,
                Event::Fetch("a".into()),
                Event::Fetch("b".into()),
                Event::Fetch("c".into()),
                Event::Disconnect,
                Event::Flush(vec![collected("a"), collected("b"), collected("c")]),
                Event::Connect,
                Event::Fetch("d".into()),
                Event::Fetch("e".into()),
                Event::Disconnect,
                Event::Flush(vec![collected("d"), collected("e")]),
                Event::Close,
            ]
        );
    }

    #[tokio::test]
    async fn test_rate_limit_penalty_forces_rotation() {
        let log = Log::default();
        let batch = names(&["slow", "next"]);
        let stats = collector(
            &log,
            vec![Ok(batch)],
            &[("slow", Reply::RateLimited)],
            &[],
            quick_policy(30, 30),
        )
        .run()
        .await
        .unwrap();
        assert_eq!(stats.not_collected, 1);
        assert_eq!(stats.collected, 1);
        assert_eq!(stats.rotations, 1);

        let events = log.lock().unwrap();
        assert_eq!(events[0], Event::Connect);
        assert_eq!(events[1], Event::Fetch("slow".into()));
        assert_eq!(events[2], Event::Disconnect);
        assert_eq!(
            events[3],
            Event::Flush(vec![update("slow", ProfileStatus::NotCollected)])
        );
        assert_eq!(events[4], Event::Connect);
        assert_eq!(events[5], Event::Fetch("next".into()));
    }

    #[tokio::test]
    async fn test_statuses_for_failures() {
        let log = Log::default();
        let batch = names(&["ok", "gone", "rejected"]);
        let stats = collector(
            &log,
            vec![Ok(batch)],
            &[("gone", Reply::NotFound)],
            &["rejected"],
            quick_policy(120, 30),
        )
        .run()
        .await
        .unwrap();
        assert_eq!(stats.collected, 1);
        assert_eq!(stats.errors, 2);
        assert_eq!(stats.rotations, 0);

        let events = log.lock().unwrap();
        let flush = events
            .iter()
            .find_map(|e| match e {
                Event::Flush(updates) => Some(updates.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(
            flush,
            vec![
                update("ok", ProfileStatus::Collected),
                update("gone", ProfileStatus::Error),
                update("rejected", ProfileStatus::Error),
            ]
        );
    }

    #[tokio::test]
    async fn test_tunnel_reused_across_batches() {
        let log = Log::default();
        let batches = vec![Ok(names(&["a"])), Ok(names(&["b"]))];
        collector(&log, batches, &[], &[], quick_policy(120, 30))
            .run()
            .await
            .unwrap();
        let connects = log
            .lock()
            .unwrap()
            .iter()
            .filter(|e| **e == Event::Connect)
            .count();
        assert_eq!(connects, 1);
    }

    #[tokio::test]
    async fn test_empty_queue_never_connects() {
        let log = Log::default();
        let stats = collector(&log, vec![], &[], &[], quick_policy(120, 30))
            .run()
            .await
            .unwrap();
        assert_eq!(stats, RunStats::default());
        assert_eq!(*log.lock().unwrap(), vec![Event::Close]);
    }

    #[tokio::test]
    async fn test_shutdown_runs_after_store_error() {
        let log = Log::default();
        let batches = vec![
            Ok(names(&["a"])),
            Err(Error::Io(std::io::Error::other("cursor died"))),
        ];
        let err = collector(&log, batches, &[], &[], quick_policy(120, 30))
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                Event::Connect,
                Event::Fetch("a".into()),
                Event::Disconnect,
                Event::Flush(vec![update("a", ProfileStatus::Collected)]),
                Event::Close,
            ]
        );
    }

    #[tokio::test]
    async fn test_connect_failure_still_closes_store() {
        let log = Log::default();
        let mut collector = collector(&log, vec![Ok(names(&["a"]))], &[], &[], quick_policy(120, 30));
        collector.tunnel.fail_connect = true;
        let err = collector.run().await.unwrap_err();
        assert!(matches!(err, Error::VpnExhausted(1)));
        assert_eq!(*log.lock().unwrap(), vec![Event::Connect, Event::Close]);
    }
}
