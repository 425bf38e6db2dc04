//! Embeddable JavaScript sandbox host.
//!
//! A [`Cage`] executes untrusted script inside an isolated QuickJS
//! interpreter and projects host capabilities into the guest through
//! [`CageModule`]s. The crate's core is the host/guest bridge: scoped
//! handle ownership, value marshalling, and the execution pipeline that
//! interleaves the guest microtask queue with host-originated async work.
//!
//! ```no_run
//! use cage::{Cage, modules::ConsoleModule};
//!
//! # async fn demo() -> cage::EvalResult {
//! let cage = Cage::new();
//! let console = ConsoleModule::new();
//! cage.run_code("console.log(\"hello\");", &[&console]).await
//! # }
//! ```

pub mod error;
pub mod marshal;
pub mod module;
pub mod modules;
pub mod runtime;
pub mod scope;
mod state;
pub mod value;
pub mod vm;

pub use error::{CageError, EvalResult, GuestError, MarshalError};
pub use module::{module_from_fn, CageModule, FnModule, ModuleContext, SandboxOutput, Shape};
pub use runtime::{Cage, CageBuilder};
pub use value::HostValue;

/// Tracing target for guest console output.
pub const TRACE_TARGET_SCRIPT: &str = "cage::script";
