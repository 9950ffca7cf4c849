//! Emulated-peer swarms for load-testing a mediasoup portal.
//!
//! Two modes: a conference swarm (rooms of mutually producing/consuming
//! peers over protoo signaling) and a livestream viewer swarm (read-only
//! consumers driven over the portal HTTP API). The binary in `main.rs` is a
//! thin CLI over [`conference_manager::ConferenceManager`] and
//! [`viewer_manager::ViewerManager`].

pub mod cli;
pub mod conference;
pub mod conference_manager;
pub mod consumer;
pub mod executor;
pub mod http;
pub mod protoo;
pub mod ui;
pub mod viewer;
pub mod viewer_manager;
