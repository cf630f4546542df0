//! Settlement core of a cross-chain atomic swap broker.
//!
//! Exchanges Lightning Network bitcoin for an SPL-token asset using a
//! hashlocked on-chain escrow: the taker pays a Lightning invoice whose
//! payment hash equals the hashlock on the escrow, and the revealed
//! preimage unlocks the token claim.
//!
//! The crate is the driver side only. The sidechannel bus, the Lightning
//! node, and the chain RPC are consumed through the [`bus::BusClient`],
//! [`lightning::LnClient`], and [`chain::ChainClient`] traits so tests can
//! substitute deterministic fakes.

pub mod autopost;
pub mod bus;
pub mod chain;
pub mod clock;
pub mod context;
pub mod envelope;
pub mod lightning;
pub mod logging;
pub mod receipts;
pub mod sweeper;
pub mod trader;
