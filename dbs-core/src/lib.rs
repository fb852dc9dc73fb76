//! Distributed backup service: peers on a LAN replicate file chunks over three
//! multicast channels. This crate holds the protocol, storage and actions; the
//! host binary owns the sockets and feeds datagrams to a [`Dispatcher`].

pub mod action;
pub mod channel;
pub mod chunk;
pub mod core;
pub mod dispatcher;
pub mod identity;
pub mod protocol;
pub mod registry;
pub mod scheduler;
pub mod storage;
pub mod wire;

pub use crate::core::{CoreConfig, PeerCore, Timings};
pub use action::{
    Action, BackupOutcome, ReclaimAction, TriggerBackupAction, TriggerDeleteAction,
    TriggerRestoreAction,
};
pub use channel::{ChannelKind, Channels, Outbound};
pub use dispatcher::{Dispatcher, Routed};
pub use identity::gen_file_id;
pub use protocol::{FileId, Header, Message, MessageKind, PeerId, Version, PROTOCOL_VERSION};
pub use wire::{encode, parse, BuildError, ParseError};
