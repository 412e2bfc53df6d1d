//! Work-unit dispatch across local, Condor, ClusterGrid and BOINC backends.
//!
//! A [`Master`] creates work units, stages their input files, submits them
//! to the configured backend and polls for results. A running client uses
//! [`client::ClientContext`] for its side of the mailbox protocol.

pub mod client;
pub mod config;
pub mod driver;
pub mod error;
pub mod fsutil;
pub mod logging;
pub mod mailbox;
pub mod master;
pub mod poller;
pub mod registry;
pub mod stager;
pub mod termination;
pub mod workunit;

pub use config::DcConfig;
pub use error::{DcError, ErrorCode};
pub use master::Master;
pub use poller::MasterEvent;
pub use workunit::{ResultStatus, TransferMode, WuResult, WuState};
