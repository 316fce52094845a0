//! remcap - remote packet capture controller.
//!
//! Drives `tcpdump` on remote hosts over SSH, streams the raw pcap bytes
//! back, rotates them into local capture files and can fan the live stream
//! out to Wireshark windows spawned on demand.
//!
//! The flow per target: remote sniffer -> SSH stdout -> [`output::FanOut`]
//! -> file sink and any number of viewer sinks. [`capture::Registry`] holds
//! the active [`capture::Capturer`]s and reaps them as they stop or die.

pub mod capture;
pub mod commands;
pub mod config;
pub mod error;
pub mod feedback;
pub mod output;
pub mod remote;
