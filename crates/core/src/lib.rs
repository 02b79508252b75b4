//! rffmpeg
//!
//! Transparent remote-execution dispatcher for ffmpeg/ffprobe. Invocations are
//! rewritten to run over a remote shell on the least loaded worker host, with
//! local execution as the fallback. Hosts, running processes and host state
//! history live in a shared SQLite store.

pub mod command;
pub mod dispatcher;
pub mod model;
pub mod registry;
pub mod selector;
pub mod signals;
pub mod status;
pub mod store;
pub mod tracker;

pub use rffmpeg_config as config;
pub use rffmpeg_config::Config;
pub use command::{build_local_command, build_remote_command, CommandLine, Invocation, Tool};
pub use dispatcher::{DispatchError, Dispatcher};
pub use model::{Host, HostFilter, HostState, Process, Snapshot, State, LOCAL_HOST_ID};
pub use registry::{HostRegistry, RegistryError, DEFAULT_WEIGHT};
pub use selector::{select_host, Selection, SelectionPolicy, SelectionReason, Selector, Target};
pub use status::{status_report, HostStatus, StatusState};
pub use store::{Store, StoreError};
pub use tracker::{ClearSummary, ProcessGuard, Tracker, TrackerError};
