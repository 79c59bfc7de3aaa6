pub mod aggregate;
pub mod ast_cache;
pub mod config;
pub mod controller;
pub mod draft;
pub mod features;
pub mod helpers;
pub mod ipc;
pub mod scope;
pub mod serve;
pub mod visitor;
pub mod worker;

pub use controller::run_server;
pub use serve::{run_eval_worker, run_option_worker};
