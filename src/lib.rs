//! Real-time collaborative code rooms for technical interviews.
//!
//! The server side owns the authoritative room state ([`registry`]) and the
//! event protocol that keeps connected editors consistent ([`messages`],
//! [`server`]); [`client`] is the synchronization agent embedded in editor
//! frontends. Everything else the system touches (exercise catalog, AI
//! analysis, analytics) is an external collaborator behind [`services`].

pub mod client;
pub mod config;
pub mod messages;
pub mod registry;
pub mod server;
pub mod services;
