//! Host selection
//!
//! Picks where a new invocation runs. The choice is a greedy least-load pick
//! over a snapshot of the store; two dispatchers may read the same snapshot and
//! both pick the same host. That only skews balance, nothing is lost.

use crate::config::SelectorConfig;
use crate::model::{Host, HostState, Snapshot, LOCAL_HOST_ID};
use crate::store::{Store, StoreError};
use chrono::{DateTime, Duration, Utc};
use std::cmp::Ordering;
use tracing::debug;

/// Where an invocation runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Remote(Host),
    Local,
}

impl Target {
    /// Host id recorded in process and state rows
    pub fn host_id(&self) -> i64 {
        match self {
            Target::Remote(host) => host.id,
            Target::Local => LOCAL_HOST_ID,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Target::Remote(host) => &host.servername,
            Target::Local => "localhost",
        }
    }
}

/// Why a target was chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionReason {
    /// The invocation only queries static tool information
    SpecialFlag,
    /// Least loaded eligible remote host
    LeastLoaded { active: usize, weight: u32 },
    /// Every remote host is dead, already tried, or none is registered
    NoEligibleHost,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub target: Target,
    pub reason: SelectionReason,
}

impl Selection {
    /// Whether a `fallback` state row should be appended for this pick
    pub fn is_fallback(&self) -> bool {
        self.reason == SelectionReason::NoEligibleHost
    }
}

/// Rules for reading `dead` rows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectionPolicy {
    /// How long a `dead` row excludes its host; `None` = until cleared
    pub dead_window: Option<Duration>,
}

impl SelectionPolicy {
    pub fn from_config(cfg: &SelectorConfig) -> Self {
        let dead_window = match cfg.dead_window_secs {
            0 => None,
            secs => Some(
                i64::try_from(secs)
                    .ok()
                    .and_then(Duration::try_seconds)
                    .unwrap_or(Duration::MAX),
            ),
        };
        Self { dead_window }
    }

    /// True when the host's most recent state marks it dead at `now`
    pub fn is_dead(&self, snapshot: &Snapshot, host_id: i64, now: DateTime<Utc>) -> bool {
        match snapshot.current_state(host_id) {
            Some(state) if state.state == HostState::Dead => match self.dead_window {
                None => true,
                Some(window) => now.signed_duration_since(state.created) < window,
            },
            _ => false,
        }
    }
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        Self::from_config(&SelectorConfig::default())
    }
}

/// Compare `a_active / a_weight` with `b_active / b_weight` without floats
fn compare_load(a_active: usize, a_weight: u32, b_active: usize, b_weight: u32) -> Ordering {
    let lhs = a_active as u128 * u128::from(b_weight.max(1));
    let rhs = b_active as u128 * u128::from(a_weight.max(1));
    lhs.cmp(&rhs)
}

/// Pick a target from `snapshot`.
///
/// Hosts listed in `excluded` (already tried by this dispatch) and hosts whose
/// current state is `dead` are skipped. Among the rest the lowest
/// `active / weight` wins, ties going to the lowest id. With nothing left the
/// local target is returned.
pub fn select_host(
    snapshot: &Snapshot,
    policy: &SelectionPolicy,
    excluded: &[i64],
    now: DateTime<Utc>,
) -> Selection {
    let mut best: Option<(&Host, usize)> = None;

    for host in &snapshot.hosts {
        if excluded.contains(&host.id) || policy.is_dead(snapshot, host.id, now) {
            continue;
        }
        let active = snapshot.active_process_count(host.id);
        best = match best {
            None => Some((host, active)),
            Some((current, current_active)) => {
                match compare_load(active, host.weight, current_active, current.weight) {
                    Ordering::Less => Some((host, active)),
                    Ordering::Equal if host.id < current.id => Some((host, active)),
                    _ => Some((current, current_active)),
                }
            }
        };
    }

    match best {
        Some((host, active)) => Selection {
            target: Target::Remote(host.clone()),
            reason: SelectionReason::LeastLoaded {
                active,
                weight: host.weight,
            },
        },
        None => Selection {
            target: Target::Local,
            reason: SelectionReason::NoEligibleHost,
        },
    }
}

/// Store-backed selector. Reads only; recording the outcome is the
/// dispatcher's job.
pub struct Selector<'a> {
    store: &'a Store,
    policy: SelectionPolicy,
}

impl<'a> Selector<'a> {
    pub fn new(store: &'a Store, policy: SelectionPolicy) -> Self {
        Self { store, policy }
    }

    /// Choose a target for one attempt
    ///
    /// Special invocations go local without touching the store.
    pub fn select(&self, special: bool, excluded: &[i64]) -> Result<Selection, StoreError> {
        if special {
            return Ok(Selection {
                target: Target::Local,
                reason: SelectionReason::SpecialFlag,
            });
        }

        let snapshot = self.store.snapshot()?;
        let selection = select_host(&snapshot, &self.policy, excluded, Utc::now());
        debug!(
            host = selection.target.name(),
            reason = ?selection.reason,
            hosts = snapshot.hosts.len(),
            "selected host"
        );
        Ok(selection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Process, State};
    use crate::tracker::Tracker;
    use proptest::prelude::*;

    fn at(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(ms).unwrap()
    }

    fn host(id: i64, weight: u32) -> Host {
        Host {
            id,
            servername: format!("host{}", id),
            hostname: format!("host{}.lan", id),
            weight,
            created: at(0),
        }
    }

    fn processes_on(host_id: i64, count: usize, first_id: i64) -> Vec<Process> {
        (0..count)
            .map(|i| Process {
                id: first_id + i as i64,
                host_id,
                process_id: 1000 + i as u32,
                cmd: "ffmpeg".to_string(),
                created: at(0),
            })
            .collect()
    }

    fn dead(id: i64, host_id: i64, ms: i64) -> State {
        State {
            id,
            host_id,
            state: HostState::Dead,
            created: at(ms),
        }
    }

    fn never_expire() -> SelectionPolicy {
        SelectionPolicy { dead_window: None }
    }

    #[test]
    fn test_tie_breaks_on_lowest_id_then_balances() {
        // A weight 1, B weight 2, both idle: A wins the tie
        let mut snapshot = Snapshot {
            hosts: vec![host(1, 1), host(2, 2)],
            ..Snapshot::default()
        };
        let first = select_host(&snapshot, &never_expire(), &[], at(0));
        assert_eq!(first.target.host_id(), 1);

        // one job on A: load(A) = 1, load(B) = 0
        snapshot.processes = processes_on(1, 1, 1);
        let second = select_host(&snapshot, &never_expire(), &[], at(0));
        assert_eq!(second.target.host_id(), 2);
        assert_eq!(
            second.reason,
            SelectionReason::LeastLoaded { active: 0, weight: 2 }
        );
    }

    #[test]
    fn test_weight_scales_load() {
        // A: 1 job / weight 1 = 1.0, B: 3 jobs / weight 4 = 0.75
        let snapshot = Snapshot {
            hosts: vec![host(1, 1), host(2, 4)],
            processes: [processes_on(1, 1, 1), processes_on(2, 3, 10)].concat(),
            states: Vec::new(),
        };
        assert_eq!(select_host(&snapshot, &never_expire(), &[], at(0)).target.host_id(), 2);
    }

    #[test]
    fn test_empty_pool_falls_back() {
        let selection = select_host(&Snapshot::default(), &never_expire(), &[], at(0));
        assert_eq!(selection.target, Target::Local);
        assert!(selection.is_fallback());
    }

    #[test]
    fn test_all_dead_falls_back() {
        let snapshot = Snapshot {
            hosts: vec![host(1, 1), host(2, 1)],
            processes: Vec::new(),
            states: vec![dead(2, 2, 20), dead(1, 1, 10)],
        };
        let selection = select_host(&snapshot, &never_expire(), &[], at(1_000_000));
        assert_eq!(selection.target, Target::Local);
        assert_eq!(selection.reason, SelectionReason::NoEligibleHost);
    }

    #[test]
    fn test_excluded_hosts_are_skipped() {
        let snapshot = Snapshot {
            hosts: vec![host(1, 1), host(2, 1)],
            ..Snapshot::default()
        };
        assert_eq!(select_host(&snapshot, &never_expire(), &[1], at(0)).target.host_id(), 2);
        assert_eq!(select_host(&snapshot, &never_expire(), &[1, 2], at(0)).target, Target::Local);
    }

    #[test]
    fn test_dead_window_readmits_host() {
        let policy = SelectionPolicy {
            dead_window: Some(Duration::seconds(60)),
        };
        let snapshot = Snapshot {
            hosts: vec![host(1, 1)],
            processes: Vec::new(),
            states: vec![dead(1, 1, 0)],
        };

        // 59s after the failure the host is still out
        assert_eq!(select_host(&snapshot, &policy, &[], at(59_000)).target, Target::Local);
        // at 60s it is eligible again
        assert_eq!(select_host(&snapshot, &policy, &[], at(60_000)).target.host_id(), 1);
        // without a window it stays out
        assert_eq!(
            select_host(&snapshot, &never_expire(), &[], at(86_400_000)).target,
            Target::Local
        );
    }

    #[test]
    fn test_only_most_recent_state_counts() {
        let snapshot = Snapshot {
            hosts: vec![host(1, 1)],
            processes: Vec::new(),
            states: vec![
                State {
                    id: 2,
                    host_id: 1,
                    state: HostState::Fallback,
                    created: at(20),
                },
                dead(1, 1, 10),
            ],
        };
        assert_eq!(select_host(&snapshot, &never_expire(), &[], at(30)).target.host_id(), 1);
    }

    #[test]
    fn test_policy_from_config() {
        let cfg = SelectorConfig { dead_window_secs: 0 };
        assert_eq!(SelectionPolicy::from_config(&cfg).dead_window, None);

        let cfg = SelectorConfig { dead_window_secs: 90 };
        assert_eq!(
            SelectionPolicy::from_config(&cfg).dead_window,
            Some(Duration::seconds(90))
        );
    }

    #[test]
    fn test_special_invocation_never_reads_pool() {
        let store = Store::open_in_memory().unwrap();
        store.insert_host("a", "a.lan", 1, Utc::now()).unwrap();
        let selector = Selector::new(&store, SelectionPolicy::default());

        let special = selector.select(true, &[]).unwrap();
        assert_eq!(special.target, Target::Local);
        assert_eq!(special.reason, SelectionReason::SpecialFlag);
        assert!(!special.is_fallback());

        let normal = selector.select(false, &[]).unwrap();
        assert_eq!(normal.target.name(), "a");
    }

    fn pool_strategy() -> impl Strategy<Value = Snapshot> {
        proptest::collection::vec((1u32..8, 0usize..6, proptest::bool::ANY), 0..8)
            .prop_map(|specs| {
                let mut snapshot = Snapshot::default();
                let mut next_process = 1;
                for (i, (weight, active, is_dead)) in specs.into_iter().enumerate() {
                    let id = i as i64 + 1;
                    snapshot.hosts.push(host(id, weight));
                    snapshot.processes.extend(processes_on(id, active, next_process));
                    next_process += active as i64;
                    if is_dead {
                        snapshot.states.push(dead(id, id, 0));
                    }
                }
                snapshot
            })
    }

    /// Two dispatcher processes reading the pool before either has started
    /// its child both see the same loads and pick the same host. Balance skews
    /// for that round; both runs stay tracked as separate rows.
    #[test]
    fn test_concurrent_dispatchers_may_pick_the_same_host() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("rffmpeg.db");
        let first = Store::open(&path).unwrap();
        let second = Store::open(&path).unwrap();
        let a = first.insert_host("a", "a.lan", 1, Utc::now()).unwrap();
        let b = second.insert_host("b", "b.lan", 1, Utc::now()).unwrap();

        let policy = SelectionPolicy::default();
        let pick_first = Selector::new(&first, policy).select(false, &[]).unwrap();
        let pick_second = Selector::new(&second, policy).select(false, &[]).unwrap();
        assert_eq!(pick_first.target.host_id(), a.id);
        assert_eq!(pick_second.target.host_id(), a.id);

        let guard_first = Tracker::new(&first)
            .begin_process(&pick_first.target, 100, "ffmpeg -i one.mkv")
            .unwrap();
        let guard_second = Tracker::new(&second)
            .begin_process(&pick_second.target, 200, "ffmpeg -i two.mkv")
            .unwrap();

        let mut pids: Vec<u32> = first
            .processes_for_host(a.id)
            .unwrap()
            .iter()
            .map(|p| p.process_id)
            .collect();
        pids.sort_unstable();
        assert_eq!(pids, vec![100, 200]);
        assert_ne!(guard_first.row().id, guard_second.row().id);

        // the next reader sees both rows and moves on
        let next = Selector::new(&first, policy).select(false, &[]).unwrap();
        assert_eq!(next.target.host_id(), b.id);

        guard_first.end().unwrap();
        let left = second.processes_for_host(a.id).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].process_id, 200);

        drop(guard_second);
        assert!(first.processes().unwrap().is_empty());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        // The pick has globally minimal load among live hosts and the lowest
        // id among equally loaded ones; with no live host it is local.
        #[test]
        fn prop_selection_is_minimal_load_lowest_id(snapshot in pool_strategy()) {
            let policy = never_expire();
            let selection = select_host(&snapshot, &policy, &[], at(1_000));

            let live: Vec<&Host> = snapshot
                .hosts
                .iter()
                .filter(|h| !policy.is_dead(&snapshot, h.id, at(1_000)))
                .collect();

            match selection.target {
                Target::Local => prop_assert!(live.is_empty()),
                Target::Remote(ref chosen) => {
                    let chosen_active = snapshot.active_process_count(chosen.id);
                    for other in &live {
                        let other_active = snapshot.active_process_count(other.id);
                        let ord = compare_load(chosen_active, chosen.weight, other_active, other.weight);
                        prop_assert!(ord != Ordering::Greater);
                        if ord == Ordering::Equal {
                            prop_assert!(chosen.id <= other.id);
                        }
                    }
                }
            }
        }

        #[test]
        fn prop_idle_hosts_have_zero_load(weights in proptest::collection::vec(1u32..16, 1..8)) {
            let snapshot = Snapshot {
                hosts: weights.iter().enumerate().map(|(i, w)| host(i as i64 + 1, *w)).collect(),
                ..Snapshot::default()
            };
            // every host has load 0, so the first registered one wins
            let selection = select_host(&snapshot, &never_expire(), &[], at(0));
            prop_assert_eq!(selection.target.host_id(), 1);
        }
    }
}
