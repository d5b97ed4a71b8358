#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::unnecessary_literal_bound,
    clippy::module_name_repetitions,
    clippy::struct_field_names,
    clippy::must_use_candidate,
    clippy::new_without_default,
    clippy::return_self_not_must_use
)]

pub mod backend;
pub mod cli;
pub mod config;
pub mod contract;
pub mod error;
pub mod failure;
#[doc(hidden)]
pub mod observability;
pub mod output;
pub mod policy;
pub mod security;
pub mod smoke;
pub mod store;
#[doc(hidden)]
pub mod usage;
pub mod worker;

pub use config::Config;
pub use error::{AgentqError, Result};
pub use store::TaskStore;
pub use worker::Worker;
