//! Study & Watch Room hub.
//!
//! Small rooms where members run personal study timers that everyone can
//! see, watch a video in lockstep, chat, and ask an AI coach for help.
//! The hub holds authoritative snapshots; clients tick locally and reconcile
//! against them with [`clock::ClockReconciler`].

pub mod archive;
pub mod cli;
pub mod clock;
pub mod coach;
pub mod collab;
pub mod config;
pub mod error;
pub mod follower;
pub mod logging;
pub mod media;
pub mod playback;
pub mod protocol;
pub mod providers;
pub mod timer;
pub mod watch;
pub mod web;

pub use clock::{ClockReconciler, ClockSnapshot, Reconciliation};
pub use error::{Result, RoomError};
