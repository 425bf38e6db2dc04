use thiserror::Error;

/// Result of one evaluation. `Cage::run_code` is total: every failure mode
/// is reported through the `Err` arm, never through a panic.
pub type EvalResult = core::result::Result<(), CageError>;

/// Structural capture of a guest exception.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestError {
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
}

impl GuestError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }
}

impl core::fmt::Display for GuestError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

#[derive(Error, Debug)]
pub enum CageError {
    /// Guest code threw, either at parse time or at run time.
    #[error("guest error: {0}")]
    Guest(GuestError),

    /// A module's `def` failed during setup; the script never ran.
    #[error("module registration failed: {0}")]
    ModuleRegistration(#[source] anyhow::Error),

    /// A guest microtask threw and nothing caught it.
    #[error("unhandled job error: {0}")]
    JobQueue(GuestError),

    /// An after-script hook failed.
    #[error("after-script hook failed: {0}")]
    Hook(#[source] anyhow::Error),

    /// A host value had no guest representation.
    #[error(transparent)]
    Marshal(#[from] MarshalError),

    /// Engine-level failure (runtime creation, handle plumbing, teardown).
    #[error("engine error: {0}")]
    Engine(#[source] anyhow::Error),
}

impl CageError {
    /// The human-readable message, without the error-kind prefix.
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::Guest(e) | Self::JobQueue(e) => e.message.clone(),
            Self::ModuleRegistration(e) | Self::Hook(e) | Self::Engine(e) => e.to_string(),
            Self::Marshal(e) => e.to_string(),
        }
    }

    /// Guest error details when the failure originated inside the guest.
    #[must_use]
    pub fn guest(&self) -> Option<&GuestError> {
        match self {
            Self::Guest(e) | Self::JobQueue(e) => Some(e),
            _ => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum MarshalError {
    /// The value class can never cross into the guest (functions must be
    /// installed deliberately as sandbox functions).
    #[error("cannot marshal {0} to guest")]
    Unmarshallable(&'static str),

    /// The engine rejected an otherwise-marshallable value.
    #[error("guest rejected value: {0}")]
    Engine(String),
}
