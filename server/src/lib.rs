//! # VR Kiosk Command Center
//!
//! This library is the control plane of a VR kiosk. Operator consoles
//! connect over WebSocket, send JSON commands, and receive correlated
//! responses plus unsolicited status broadcasts. The server launches one
//! game at a time, runs the paid session countdown, and reports host load.
//!
//! ## Core Responsibilities
//!
//! ### Session Control
//! A session is a running game paired with a countdown. Launching a game
//! replaces whatever ran before, starts a fresh countdown, and broadcasts
//! the new status. When the countdown reaches zero the game is terminated
//! and every console is told.
//!
//! ### Process Supervision
//! Games are ordinary child processes. They are asked to exit first and
//! are force-killed when they ignore the request within the grace period.
//! A game that exits on its own is noticed the next time status is read.
//!
//! ### Status Reporting
//! Every response to `getStatus`, every broadcast, and the welcome frame
//! carry the same aggregate: active game, countdown, pause flag, and host
//! CPU, memory and free disk space.
//!
//! ## Module Organization
//!
//! ### Transport (`transport`, `connection_manager`)
//! - WebSocket accept loop with a connection cap
//! - Per-connection FIFO write queue
//! - Broadcast and idle reaping
//!
//! ### Routing (`router`)
//! Parses frames into requests and hands them to the handler registered
//! for the command name. Malformed frames and unknown commands are
//! answered with an error response.
//!
//! ### Domain (`launcher`, `process`, `timer`, `monitor`)
//! The game launcher with its catalog, the child process wrapper, the
//! session countdown, and the periodic resource sampler.
//!
//! ### Orchestration (`command_center`)
//! Wires the domain components to the router and owns the status loop.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::command_center::{CenterOptions, CommandCenter};
//! use server::config::default_catalog;
//! use server::monitor::HostSampler;
//! use server::transport::NetworkServer;
//! use std::sync::Arc;
//! use tokio::sync::watch;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = NetworkServer::bind("127.0.0.1:8081", 32).await?;
//!     let center = Arc::new(CommandCenter::new(
//!         default_catalog(),
//!         Arc::new(server.hub()),
//!         HostSampler::new(),
//!         CenterOptions::default(),
//!     ));
//!     center.start();
//!
//!     let (_shutdown_tx, shutdown_rx) = watch::channel(false);
//!     server.run(center, shutdown_rx).await;
//!     Ok(())
//! }
//! ```

pub mod command_center;
pub mod config;
pub mod connection_manager;
pub mod error;
pub mod launcher;
pub mod monitor;
pub mod process;
pub mod router;
pub mod timer;
pub mod transport;
