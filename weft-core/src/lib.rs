//! # Weft Core
//!
//! Per-folder synchronization controller for the Weft peer-to-peer folder
//! synchronizer.
//!
//! ## Overview
//!
//! Each [`folder::Folder`] manages one shared folder:
//!
//! - **Scanning**: timed, watcher-triggered, and user-requested rescans
//!   reconcile the local disk with the durable index
//! - **Pulling**: readiness-gated requests to the external puller, with
//!   exponential backoff on failure
//! - **Watching**: supervised filesystem watch subscriptions with capped
//!   retry backoff and burst aggregation
//! - **Serialization**: one event-loop task per folder owns all scan/pull
//!   decision state
//!
//! The heavy lifting (directory walking, block hashing, peer transfer, the
//! index engine, ignore-pattern compilation) lives behind the collaborator
//! contracts in [`scanner`], [`puller`], [`index`], [`matcher`], and
//! [`versioner`].

/// Error types and handling
pub mod error;

/// Observability events and the in-process bus
pub mod events;

/// The folder controller: event loop, scan pipeline, watch supervision
pub mod folder;

/// Filesystem access for a folder root
pub mod fs;

/// Durable index contract
pub mod index;

/// Process-wide I/O gating
pub mod limiter;

/// Ignore-pattern matcher contract
pub mod matcher;

/// Peer content retrieval contract
pub mod puller;

/// Directory walker contract
pub mod scanner;

/// Version history cleanup contract
pub mod versioner;

pub use error::{Result, SyncError};
pub use events::{ChangeAction, Event, EventLogger};
pub use folder::{
    ControllerHost, FileError, Folder, FolderBuilder, FolderHandle,
    FolderState, IGNORE_FILE, NoopHost,
};
pub use fs::{DiskUsage, FolderFilesystem, OsFilesystem, WatchStreams};
pub use index::{FileSet, IndexSnapshot};
pub use limiter::IoLimiter;
pub use matcher::Matcher;
pub use puller::Puller;
pub use scanner::{ScanEntry, Scanner, WalkRequest};
pub use versioner::Versioner;
