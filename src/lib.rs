//! # Voltgate CP
//!
//! OCPP 1.6-J charge point library for EVSE firmware.
//!
//! The library mediates between the physical charging hardware (plug sensor,
//! energy meter, contactor, lock motor) and a remote Central System. It is
//! single-threaded and cooperative: a host loop calls
//! [`ChargePoint::tick`] with a small period, and every state machine does a
//! bounded slice of work per call; nothing blocks.
//!
//! ## Architecture
//!
//! - **support**: cross-cutting utilities (OCPP-J framing, clocks, errors,
//!   retry schedules)
//! - **config**: runtime-typed, validated configuration store with
//!   persistence
//! - **transport**: message-pipe contract towards the Central System
//! - **store**: durable transaction records, keyed `(connectorId, txNr)`
//! - **transaction**: the crash-safe charging session lifecycle
//! - **connector**: per-outlet status inference and session driving
//! - **firmware**: the firmware update state machine
//! - **model**: the owning root aggregating everything, plus the
//!   message-dispatch substrate
//! - **ops**: inbound operation handlers (RemoteStartTransaction, Reset, …)
//!
//! ## Example
//!
//! ```no_run
//! use voltgate_cp::{BootInfo, ChargePoint, ConnectorIo};
//!
//! let mut cp = ChargePoint::builder(BootInfo::new("Voltgate", "VG-One"), 1).build();
//! cp.connector_mut(1).unwrap().set_io(
//!     ConnectorIo::builder()
//!         .connector_plugged(|| false)
//!         .energy_meter(|| 0)
//!         .build(),
//! );
//! loop {
//!     cp.tick();
//!     std::thread::sleep(std::time::Duration::from_millis(100));
//! }
//! ```

pub mod config;
pub mod connector;
pub mod firmware;
pub mod model;
pub(crate) mod ops;
pub mod store;
pub mod support;
pub mod transaction;
pub mod transport;

// Re-export commonly used types at crate root
pub use config::{
    ConfigValue, ConfigWriteOutcome, ConfigurationStore, FileKeyValueStore, KeyValueStore,
    MemoryKeyValueStore,
};
pub use connector::{Availability, Connector, ConnectorIo, ConnectorIoBuilder, PollResult};
pub use firmware::{
    DownloadStatus, FirmwareService, FtpClient, FtpCloseReason, FtpDownload, FtpError, FtpPoll,
    InstallationStatus,
};
pub use model::{BootInfo, ChargePoint, ChargePointBuilder, Reservation, ResetKind};
pub use store::{FileTransactionStore, MemoryTransactionStore, TransactionStore};
pub use support::{Clock, CoreError, CoreResult, OcppFrame, SimClock, SystemClock};
pub use transaction::{SyncState, Transaction, TxAuthorization};
pub use transport::{MemoryTransport, OutboundCall, Transport};
