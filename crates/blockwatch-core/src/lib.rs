#![warn(missing_docs)]

//! blockwatch core: kernel uevent capture, queueing and dispatch for block devices
//!
//! This crate keeps an in-memory device model consistent with what the kernel
//! reports. Uevents are captured from netlink, queued and handed to per-event
//! workers. A reconciliation dispatcher either correlates each event with an
//! in-flight storage operation (completing a two-phase handshake with the
//! thread that performed it) or applies it to the model as an external change.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod flags;
pub mod manager;
pub mod probe;
pub mod queue;
pub mod source;
pub mod sync;
pub mod tree;
pub mod udev;
pub mod validator;

pub use config::{ManagerConfig, NetlinkGroup, ReconcileConfig, SyncConfig};
pub use dispatcher::{ReconciliationDispatcher, SyncRule};
pub use error::{EventError, EventResult};
pub use event::{Action, Attributes, Event};
pub use flags::{OperationFlags, Phase};
pub use manager::{EventManager, ManagerState};
pub use probe::{DeviceProbe, FixedProbe, SysfsProbe};
pub use queue::{EventMask, EventQueue, MaskHandle};
pub use source::{parse_frame, ChannelSender, ChannelSource, NetlinkSource, UeventSource};
pub use sync::{MonitorSwitch, OperationSynchronizer, SharedLock, SyncContext, SyncHandle, WaitOutcome};
pub use tree::{Device, DeviceId, DeviceKind, DeviceTree, Format, InMemoryTree, PendingAction, PvInfo, SyncSlot};
pub use validator::{EventValidator, RequiredValue};
