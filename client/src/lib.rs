//! # Kiosk Console Client
//!
//! Operator-side library for talking to the VR command center over
//! WebSocket. It sends JSON commands, matches each reply to its request by
//! id, and queues the unsolicited status broadcasts that arrive in between.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::network::ControlClient;
//! use shared::Params;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = ControlClient::connect("ws://127.0.0.1:8081").await?;
//!
//!     let mut params = Params::new();
//!     params.insert("gameId", "1");
//!     params.insert("sessionDuration", 600);
//!     let response = client.request("launchGame", params).await?;
//!     println!("{:?}", response.data);
//!
//!     // Broadcasts keep arriving until the server goes away
//!     while let Some(update) = client.next_message().await? {
//!         println!("{:?}", update.aggregate_status());
//!     }
//!     Ok(())
//! }
//! ```

pub mod network;
