//! Shared protocol core for AeroDrop transfers.
//!
//! This crate provides everything both peers agree on:
//! - The control-frame set and its wire codec
//! - Manifest types and resume-eligibility rules
//! - Transfer tunables with LAN/WAN presets
//! - The session phase set and typed error/failure reasons
//! - The channel abstraction, with an in-process loopback (plus rendezvous
//!   broker) and a QUIC transport adapter

/// Channel abstraction and transport implementations.
pub mod channel;
/// Transfer tunables and network-class presets.
pub mod config;
/// Typed errors and terminal failure reasons.
pub mod error;
/// Control frames and their wire codec.
pub mod frames;
/// Host-environment integration hooks.
pub mod host;
/// Manifest types, fingerprints, and resume eligibility.
pub mod manifest;
/// Session phases.
pub mod phase;
