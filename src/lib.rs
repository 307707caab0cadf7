pub mod acquire;
pub mod build_output;
pub mod cli;
pub mod config;
pub mod contract;
pub mod exec;
pub mod ledger;
pub mod load_config;
pub mod lock;
pub mod pipeline;
pub mod publish;
pub mod render;
pub mod trigger;
