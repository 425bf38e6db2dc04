//! Demo host: run a script (from argv or the built-in sample) inside a cage
//! with the standard capability modules installed.

use std::sync::Arc;

use anyhow::{Context, Result};
use cage::modules::{
    BlobModule, BufferSink, ConsoleModule, CryptoModule, EncodingModule, EsmModule, FetchModule,
    TimersModule, UrlModule,
};
use cage::{Cage, CageModule};
use tracing_subscriber::EnvFilter;

const SAMPLE: &str = r#"
const id = crypto.randomUUID();
console.log("evaluation", id);

const encoded = new TextEncoder().encode("cage");
console.log("encoded bytes:", encoded.length);

setTimeout(() => {
    console.log("timer fired");
}, 25);

const url = new URL("https://example.com/a/b?x=1");
console.log("host:", url.host, "path:", url.pathname);
"#;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let source = match std::env::args().nth(1) {
        Some(path) => std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read script at {path}"))?,
        None => SAMPLE.to_string(),
    };

    let sink = BufferSink::new();
    let console = ConsoleModule::with_sink(Arc::new(sink.clone()));
    let timers = TimersModule;
    let fetch = FetchModule::new();
    let crypto = CryptoModule;
    let encoding = EncodingModule;
    let url = UrlModule;
    let blob = BlobModule;
    let esm = EsmModule::new();

    let modules: Vec<&dyn CageModule> = vec![
        &console, &timers, &fetch, &crypto, &encoding, &url, &blob, &esm,
    ];

    let cage = Cage::builder().max_stack_size(2 * 1024 * 1024).build();
    let result = cage.run_code(&source, &modules).await;

    for line in sink.messages() {
        println!("[guest] {line}");
    }
    match result {
        Ok(()) => {
            println!("evaluation finished: ok");
            Ok(())
        }
        Err(err) => {
            println!("evaluation finished: err ({err})");
            std::process::exit(1);
        }
    }
}
