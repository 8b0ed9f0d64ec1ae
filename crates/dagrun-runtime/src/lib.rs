//! Worker runtime for the dagrun workflow engine.
//!
//! One [`Engine`] per process: it claims dag instances through the store's
//! CAS, materializes and schedules their task instances, runs registered
//! actions on a bounded pool and lets the watchdog reassign whatever a dead
//! worker leaves behind. Plug in a [`Store`](dagrun_core::store::Store) and
//! a [`Keeper`](dagrun_core::keeper::Keeper), register actions with
//! [`register_actions`], then call [`Engine::run`].

mod config;
mod dispatcher;
mod engine;
mod executor;
mod flag;
mod parser;
mod registry;
mod util;
mod watchdog;

pub mod metric;

pub use self::config::Config;
pub use self::engine::{Engine, EngineBuilder, EngineHandle};
pub use self::flag::{ShutdownFlag, ShutdownGuard};
pub use self::registry::register_actions;
