pub mod config;
pub mod endpoints;
pub mod engine;
pub mod errors;
pub mod events;
pub mod gateway;
pub mod interfaces;
pub mod leaderboard;
pub mod local_ledger;
pub mod pool;
pub mod price;
pub mod recorder;
pub mod referrals;
pub mod rpc;
pub mod sacrifice;
pub mod server;
pub mod settlement;
pub mod store;
pub mod swap;
pub mod wallet;
pub mod webhook;
