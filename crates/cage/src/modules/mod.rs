//! Standard capability modules.
//!
//! Each module is an exemplar of a capability class: it installs
//! guest-visible bindings through the module authoring contract and routes
//! host work through the evaluation's pending-operation pump. Hosts pick
//! the subset they want to project into the guest.

mod blob;
mod console;
mod crypto;
mod encoding;
mod esm;
mod fetch;
mod timers;
mod url;

pub use blob::BlobModule;
pub use console::{BufferSink, ConsoleModule, ConsoleSink, LogLevel, TracingSink};
pub use crypto::CryptoModule;
pub use encoding::EncodingModule;
pub use esm::EsmModule;
pub use fetch::FetchModule;
pub use timers::TimersModule;
pub use url::UrlModule;
