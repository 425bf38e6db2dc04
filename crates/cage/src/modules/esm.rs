//! ESM loader capability: `import` from `http(s)://` URLs.
//!
//! Resolution follows URL semantics: absolute `http(s)` specifiers pass
//! through, absolute paths resolve against the importing module's origin,
//! and relative paths resolve against the importing module. The entry
//! script has no URL of its own, so a base may be configured for its
//! imports. Fetching runs on the host reactor between declaration
//! attempts; the loader hook itself never blocks.

use anyhow::{anyhow, bail};
use url::Url;

use crate::module::{CageModule, ModuleContext};

pub struct EsmModule {
    client: reqwest::Client,
    base: Option<Url>,
}

impl EsmModule {
    #[must_use]
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            base: None,
        }
    }

    /// Base URL for imports issued by the entry script itself.
    #[must_use]
    pub fn with_base(mut self, base: Url) -> Self {
        self.base = Some(base);
        self
    }

    #[must_use]
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }
}

impl Default for EsmModule {
    fn default() -> Self {
        Self::new()
    }
}

impl CageModule for EsmModule {
    fn def(&self, mcx: &mut ModuleContext<'_, '_>) -> anyhow::Result<()> {
        let base = self.base.clone();
        let client = self.client.clone();
        mcx.set_module_loader(
            move |importer, request| resolve_specifier(base.as_ref(), importer, request),
            move |specifier| {
                let client = client.clone();
                Box::pin(async move { fetch_text(&client, &specifier).await })
            },
        );
        Ok(())
    }
}

fn is_http(url: &Url) -> bool {
    matches!(url.scheme(), "http" | "https")
}

fn resolve_specifier(
    base: Option<&Url>,
    importer: &str,
    request: &str,
) -> anyhow::Result<String> {
    // Absolute http(s) specifiers pass through untouched.
    if let Ok(url) = Url::parse(request) {
        if is_http(&url) {
            return Ok(url.to_string());
        }
        bail!("unsupported import scheme in '{request}'");
    }

    // Fetched modules import relative to their own URL; the entry script
    // falls back to the configured base.
    let context = Url::parse(importer)
        .ok()
        .filter(|url| is_http(url))
        .or_else(|| base.cloned());
    let Some(context) = context else {
        bail!("cannot resolve '{request}' without a base URL");
    };

    let resolved = context
        .join(request)
        .map_err(|err| anyhow!("cannot resolve '{request}' against '{context}': {err}"))?;
    if !is_http(&resolved) {
        bail!("resolved import '{resolved}' is not http(s)");
    }
    Ok(resolved.to_string())
}

async fn fetch_text(client: &reqwest::Client, specifier: &str) -> anyhow::Result<String> {
    tracing::debug!(%specifier, "fetching ES module");
    let response = client
        .get(specifier)
        .send()
        .await
        .map_err(|err| anyhow!("request failed: {err}"))?;
    if !response.status().is_success() {
        bail!("server returned {} for {specifier}", response.status());
    }
    response
        .text()
        .await
        .map_err(|err| anyhow!("failed to read module body: {err}"))
}

#[cfg(test)]
mod tests {
    use super::resolve_specifier;
    use url::Url;

    #[test]
    fn absolute_http_specifiers_pass_through() {
        let resolved =
            resolve_specifier(None, "input", "https://example.com/lib/mod.js").expect("resolve");
        assert_eq!(resolved, "https://example.com/lib/mod.js");
    }

    #[test]
    fn relative_specifiers_resolve_against_the_importer() {
        let resolved = resolve_specifier(
            None,
            "https://example.com/lib/mod.js",
            "./helper.js",
        )
        .expect("resolve");
        assert_eq!(resolved, "https://example.com/lib/helper.js");
    }

    #[test]
    fn absolute_paths_resolve_against_the_origin() {
        let resolved = resolve_specifier(
            None,
            "https://example.com/lib/deep/mod.js",
            "/top.js",
        )
        .expect("resolve");
        assert_eq!(resolved, "https://example.com/top.js");
    }

    #[test]
    fn entry_imports_use_the_configured_base() {
        let base = Url::parse("https://example.com/app/").expect("base");
        let resolved = resolve_specifier(Some(&base), "input", "./mod.js").expect("resolve");
        assert_eq!(resolved, "https://example.com/app/mod.js");

        assert!(resolve_specifier(None, "input", "./mod.js").is_err());
    }

    #[test]
    fn non_http_schemes_are_rejected() {
        assert!(resolve_specifier(None, "input", "file:///etc/passwd").is_err());
    }
}
