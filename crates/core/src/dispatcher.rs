//! Dispatcher
//!
//! Runs one codec tool invocation end to end: pick a host, rewrite the
//! command, spawn and supervise the child, and retry on another host when the
//! remote side cannot be reached. Once remote hosts are exhausted the
//! invocation runs locally. The child's exit code is returned untouched;
//! bookkeeping failures are logged and never change it.
//!
//! A termination request received during the dispatch is forwarded to the
//! running child and ends the dispatch: no further host is tried and the
//! host is not marked dead, whatever the remote shell exits with.

use crate::command::{
    build_local_command, build_remote_command, CommandLine, Invocation,
    REMOTE_SHELL_TRANSPORT_FAILURE,
};
use crate::config::Config;
use crate::model::{HostState, LOCAL_HOST_ID};
use crate::selector::{Selection, SelectionPolicy, SelectionReason, Selector, Target};
use crate::signals::{cancelled_exit_code, exit_code, SignalForwarder};
use crate::store::Store;
use crate::tracker::Tracker;
use std::io;
use thiserror::Error;
use tracing::{error, info, warn};

/// Error type for dispatch operations
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The child process could not be started
    #[error("failed to start `{command}`: {source}")]
    SpawnFailure {
        command: String,
        #[source]
        source: io::Error,
    },

    /// The remote shell reported a transport failure
    #[error("remote host {host} unreachable")]
    RemoteUnreachable { host: String },

    /// Waiting on a running child failed
    #[error("failed to supervise `{command}`: {source}")]
    Supervision {
        command: String,
        #[source]
        source: io::Error,
    },

    /// Every host, local execution included, failed
    #[error("dispatch failed on every host: {0}")]
    FatalDispatchFailure(#[source] Box<DispatchError>),
}

impl DispatchError {
    /// Whether another host should be tried after this error
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            DispatchError::SpawnFailure { .. } | DispatchError::RemoteUnreachable { .. }
        )
    }
}

pub struct Dispatcher<'a> {
    store: &'a Store,
    config: &'a Config,
    policy: SelectionPolicy,
    special_flags: Vec<String>,
}

impl<'a> Dispatcher<'a> {
    pub fn new(store: &'a Store, config: &'a Config) -> Self {
        Self {
            store,
            config,
            policy: SelectionPolicy::from_config(&config.selector),
            special_flags: config.commands.effective_special_flags(),
        }
    }

    /// Run `invocation` and return the wrapped command's exit code
    pub async fn dispatch(&self, invocation: &Invocation) -> Result<i32, DispatchError> {
        let special = invocation.is_special(&self.special_flags);
        let selector = Selector::new(self.store, self.policy);
        let tracker = Tracker::new(self.store);
        let mut signals = SignalForwarder::install();
        let mut tried: Vec<i64> = Vec::new();

        loop {
            if let Some(sig) = signals.poll_pending().await {
                info!(signal = %sig, tried = tried.len(), "dispatch cancelled, not starting another attempt");
                return Ok(cancelled_exit_code(sig));
            }

            let selection = selector.select(special, &tried).unwrap_or_else(|e| {
                error!(error = %e, "host selection failed, running locally");
                Selection {
                    target: Target::Local,
                    reason: SelectionReason::NoEligibleHost,
                }
            });

            let host = match &selection.target {
                Target::Local => {
                    if selection.is_fallback() {
                        if let Err(e) = tracker.record_state(LOCAL_HOST_ID, HostState::Fallback) {
                            warn!(error = %e, "failed to record fallback state");
                        }
                    }
                    let command = build_local_command(self.config, invocation);
                    info!(reason = ?selection.reason, "running locally");
                    return self
                        .run(&tracker, &mut signals, &selection.target, &command)
                        .await
                        .map_err(|e| DispatchError::FatalDispatchFailure(Box::new(e)));
                }
                Target::Remote(host) => host,
            };

            let command = build_remote_command(self.config, host, invocation);
            info!(
                host = %host.servername,
                hostname = %host.hostname,
                "running on remote host"
            );

            let outcome = match self
                .run(&tracker, &mut signals, &selection.target, &command)
                .await
            {
                Ok(REMOTE_SHELL_TRANSPORT_FAILURE) if signals.cancelled().is_none() => {
                    Err(DispatchError::RemoteUnreachable {
                        host: host.servername.clone(),
                    })
                }
                other => other,
            };

            match outcome {
                Ok(code) => return Ok(code),
                Err(e) if e.is_retryable() && signals.cancelled().is_none() => {
                    warn!(host = %host.servername, error = %e, "remote attempt failed, marking host dead");
                    if let Err(e) = tracker.record_state(host.id, HostState::Dead) {
                        warn!(error = %e, "failed to record dead state");
                    }
                    tried.push(host.id);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Spawn `command` for `target`, track it and wait for it
    async fn run(
        &self,
        tracker: &Tracker<'_>,
        signals: &mut SignalForwarder,
        target: &Target,
        command: &CommandLine,
    ) -> Result<i32, DispatchError> {
        let cmd_string = command.to_string();
        let mut child = command
            .to_command()
            .spawn()
            .map_err(|source| DispatchError::SpawnFailure {
                command: cmd_string.clone(),
                source,
            })?;

        let guard = child
            .id()
            .and_then(|pid| match tracker.begin_process(target, pid, &cmd_string) {
                Ok(guard) => Some(guard),
                Err(e) => {
                    warn!(pid, error = %e, "failed to record process");
                    None
                }
            });

        let status = signals.wait(&mut child).await;

        if let Some(guard) = guard {
            if let Err(e) = guard.end() {
                warn!(error = %e, "failed to remove process row");
            }
        }

        let status = status.map_err(|source| DispatchError::Supervision {
            command: cmd_string,
            source,
        })?;
        let code = exit_code(status);

        info!(host = target.name(), code, "child exited");
        Ok(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Tool;
    use crate::registry::HostRegistry;
    use crate::signals::{serial_signal_tests, signal_self_after};
    use nix::sys::signal::Signal;
    use std::time::Duration;

    /// Config whose local binary is `sh` and whose remote shell is replaced
    /// by whatever the test puts in `commands.pre`
    fn test_config() -> Config {
        let mut config = Config::default();
        config.remote.persist = 0;
        config.remote.user = String::new();
        config.remote.args = Vec::new();
        config.commands.fallback_ffmpeg = "sh".to_string();
        config.selector.dead_window_secs = 0;
        config
    }

    fn sh(script: &str) -> Invocation {
        Invocation::new(Tool::Ffmpeg, vec!["-c".to_string(), script.to_string()])
    }

    /// Make the "remote shell" a local `sh -c <script>`
    fn fake_remote(config: &mut Config, script: &str) {
        config.commands.pre = vec!["sh".to_string(), "-c".to_string(), script.to_string()];
    }

    #[tokio::test]
    async fn test_empty_pool_runs_locally_and_records_fallback() {
        let _serial = serial_signal_tests();
        let store = Store::open_in_memory().unwrap();
        let config = test_config();

        let code = Dispatcher::new(&store, &config).dispatch(&sh("exit 7")).await.unwrap();

        assert_eq!(code, 7);
        let states = store.states_for_host(LOCAL_HOST_ID).unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].state, HostState::Fallback);
        assert!(store.processes().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remote_success_propagates_exit_code() {
        let _serial = serial_signal_tests();
        let store = Store::open_in_memory().unwrap();
        let mut config = test_config();
        fake_remote(&mut config, "exit 3");
        HostRegistry::new(&store).add_host("a", "a.lan", None).unwrap();

        let code = Dispatcher::new(&store, &config).dispatch(&sh("exit 9")).await.unwrap();

        // 3 came from the "remote" side, so no fallback happened
        assert_eq!(code, 3);
        assert!(store.states().unwrap().is_empty());
        assert!(store.processes().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remote_spawn_failure_marks_dead_and_falls_back() {
        let _serial = serial_signal_tests();
        let store = Store::open_in_memory().unwrap();
        let mut config = test_config();
        config.commands.ssh = "/nonexistent/rffmpeg-test/ssh".to_string();
        let a = HostRegistry::new(&store).add_host("a", "a.lan", Some(1)).unwrap();

        let code = Dispatcher::new(&store, &config).dispatch(&sh("exit 4")).await.unwrap();

        assert_eq!(code, 4);
        let a_states = store.states_for_host(a.id).unwrap();
        assert_eq!(a_states.len(), 1);
        assert_eq!(a_states[0].state, HostState::Dead);
        assert_eq!(
            store.states_for_host(LOCAL_HOST_ID).unwrap()[0].state,
            HostState::Fallback
        );
        assert!(store.processes().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_hosts_are_each_tried_once() {
        let _serial = serial_signal_tests();
        let store = Store::open_in_memory().unwrap();
        let mut config = test_config();
        fake_remote(&mut config, "exit 255");
        let registry = HostRegistry::new(&store);
        let a = registry.add_host("a", "a.lan", None).unwrap();
        let b = registry.add_host("b", "b.lan", None).unwrap();

        let code = Dispatcher::new(&store, &config).dispatch(&sh("exit 0")).await.unwrap();

        assert_eq!(code, 0);
        assert_eq!(store.states_for_host(a.id).unwrap().len(), 1);
        assert_eq!(store.states_for_host(b.id).unwrap().len(), 1);
        assert_eq!(store.states_for_host(LOCAL_HOST_ID).unwrap().len(), 1);
        assert!(store.processes().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dead_host_is_skipped_on_next_dispatch() {
        let _serial = serial_signal_tests();
        let store = Store::open_in_memory().unwrap();
        let mut config = test_config();
        fake_remote(&mut config, "exit 255");
        let a = HostRegistry::new(&store).add_host("a", "a.lan", None).unwrap();
        let dispatcher = Dispatcher::new(&store, &config);

        dispatcher.dispatch(&sh("exit 0")).await.unwrap();
        dispatcher.dispatch(&sh("exit 0")).await.unwrap();

        // second run never tried `a` again
        assert_eq!(store.states_for_host(a.id).unwrap().len(), 1);
        assert_eq!(store.states_for_host(LOCAL_HOST_ID).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_special_flag_never_contacts_remote() {
        let _serial = serial_signal_tests();
        let store = Store::open_in_memory().unwrap();
        let mut config = test_config();
        config.commands.ssh = "/nonexistent/rffmpeg-test/ssh".to_string();
        config.commands.fallback_ffmpeg = "true".to_string();
        HostRegistry::new(&store).add_host("a", "a.lan", None).unwrap();

        let invocation = Invocation::new(Tool::Ffmpeg, vec!["-hwaccels".to_string()]);
        let code = Dispatcher::new(&store, &config).dispatch(&invocation).await.unwrap();

        assert_eq!(code, 0);
        // no dead row for `a`, no fallback row
        assert!(store.states().unwrap().is_empty());
        assert!(store.processes().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_local_failure_is_fatal() {
        let _serial = serial_signal_tests();
        let store = Store::open_in_memory().unwrap();
        let mut config = test_config();
        config.commands.ssh = "/nonexistent/rffmpeg-test/ssh".to_string();
        config.commands.fallback_ffmpeg = "/nonexistent/rffmpeg-test/ffmpeg".to_string();
        let a = HostRegistry::new(&store).add_host("a", "a.lan", None).unwrap();

        let err = Dispatcher::new(&store, &config)
            .dispatch(&sh("exit 0"))
            .await
            .unwrap_err();

        match err {
            DispatchError::FatalDispatchFailure(inner) => {
                assert!(matches!(*inner, DispatchError::SpawnFailure { .. }))
            }
            other => panic!("expected fatal failure, got {other:?}"),
        }
        assert_eq!(store.states_for_host(a.id).unwrap()[0].state, HostState::Dead);
        assert!(store.processes().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_signal_killed_child_reports_128_plus_signal() {
        let _serial = serial_signal_tests();
        let store = Store::open_in_memory().unwrap();
        let config = test_config();

        let code = Dispatcher::new(&store, &config)
            .dispatch(&sh("kill -TERM $$"))
            .await
            .unwrap();

        assert_eq!(code, 143);
        assert!(store.processes().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_local_transport_code_is_not_retried() {
        let _serial = serial_signal_tests();
        let store = Store::open_in_memory().unwrap();
        let config = test_config();

        let code = Dispatcher::new(&store, &config).dispatch(&sh("exit 255")).await.unwrap();

        assert_eq!(code, 255);
        assert_eq!(store.states().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_process_row_exists_while_child_runs() {
        let _serial = serial_signal_tests();
        let store = Store::open_in_memory().unwrap();
        let config = test_config();
        let dispatcher = Dispatcher::new(&store, &config);

        let invocation = sh("sleep 0.5");
        let run = dispatcher.dispatch(&invocation);
        let observe = async {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            store.processes_for_host(LOCAL_HOST_ID).unwrap()
        };
        let (code, during) = tokio::join!(run, observe);

        assert_eq!(code.unwrap(), 0);
        assert_eq!(during.len(), 1);
        assert!(during[0].cmd.starts_with("sh -c sleep 0.5"));
        assert!(store.processes().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_remote_run_is_not_retried() {
        let _serial = serial_signal_tests();
        let store = Store::open_in_memory().unwrap();
        let mut config = test_config();
        // stands in for ssh, which exits 255 when told to terminate
        fake_remote(&mut config, "trap 'exit 255' TERM; sleep 2 & wait");
        let a = HostRegistry::new(&store).add_host("a", "a.lan", None).unwrap();

        signal_self_after(Signal::SIGTERM, Duration::from_millis(300));
        let code = Dispatcher::new(&store, &config)
            .dispatch(&sh("echo ran locally; exit 0"))
            .await
            .unwrap();

        assert_eq!(code, 255);
        assert!(store.states_for_host(a.id).unwrap().is_empty());
        assert!(store.states_for_host(LOCAL_HOST_ID).unwrap().is_empty());
        assert!(store.processes().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_local_run_reports_child_code() {
        let _serial = serial_signal_tests();
        let store = Store::open_in_memory().unwrap();
        let config = test_config();

        signal_self_after(Signal::SIGINT, Duration::from_millis(300));
        let code = Dispatcher::new(&store, &config)
            .dispatch(&sh("trap 'exit 42' INT; sleep 2 & wait"))
            .await
            .unwrap();

        assert_eq!(code, 42);
        assert!(store.processes().unwrap().is_empty());
    }
}
