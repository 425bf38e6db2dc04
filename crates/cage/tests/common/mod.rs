#![allow(dead_code)]

use std::sync::{Arc, Once};

use cage::modules::{BufferSink, ConsoleModule};
use cage::{Cage, CageModule, EvalResult};

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

pub fn cage() -> Cage {
    init_tracing();
    Cage::builder().build()
}

/// Run `source` with a capturing console plus any extra modules; returns the
/// evaluation result and the captured console lines.
pub async fn run_with_console(
    source: &str,
    extra: &[&dyn CageModule],
) -> (EvalResult, Vec<String>) {
    let sink = BufferSink::new();
    let console = ConsoleModule::with_sink(Arc::new(sink.clone()));
    let mut modules: Vec<&dyn CageModule> = vec![&console];
    modules.extend_from_slice(extra);
    let result = cage().run_code(source, &modules).await;
    (result, sink.messages())
}
