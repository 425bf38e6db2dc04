//! Module loader plumbing.
//!
//! QuickJS resolves import graphs synchronously, so the loader hook serves
//! from a text cache and records misses; the runtime fetches the misses on
//! the host reactor and retries declaration. Declaration has no user-visible
//! side effects, which makes the retry safe.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use futures::future::LocalBoxFuture;
use rquickjs::loader::{Loader, Resolver};
use rquickjs::module::{Declared, Module};
use rquickjs::Ctx;

pub(crate) type ResolveFn = Box<dyn Fn(&str, &str) -> anyhow::Result<String>>;
pub(crate) type FetchFn = Box<dyn Fn(String) -> LocalBoxFuture<'static, anyhow::Result<String>>>;

#[derive(Default)]
pub(crate) struct LoaderShared {
    cache: HashMap<String, String>,
    missing: Vec<String>,
}

impl LoaderShared {
    pub(crate) fn insert(&mut self, specifier: String, text: String) {
        self.cache.insert(specifier, text);
    }

    pub(crate) fn take_missing(&mut self) -> Vec<String> {
        std::mem::take(&mut self.missing)
    }
}

pub(crate) struct CageResolver {
    pub(crate) resolve: ResolveFn,
}

impl Resolver for CageResolver {
    fn resolve(&mut self, _ctx: &Ctx<'_>, base: &str, name: &str) -> rquickjs::Result<String> {
        (self.resolve)(base, name).map_err(|err| {
            rquickjs::Error::new_from_js_message("module", "specifier", &err.to_string())
        })
    }
}

pub(crate) struct CageLoader {
    pub(crate) shared: Rc<RefCell<LoaderShared>>,
}

impl Loader for CageLoader {
    fn load<'js>(&mut self, ctx: &Ctx<'js>, name: &str) -> rquickjs::Result<Module<'js, Declared>> {
        let cached = self.shared.borrow().cache.get(name).cloned();
        match cached {
            Some(source) => Module::declare(ctx.clone(), name, source),
            None => {
                tracing::debug!(specifier = name, "module text not cached yet");
                self.shared.borrow_mut().missing.push(name.to_string());
                Err(rquickjs::Error::new_from_js_message(
                    "module",
                    "source",
                    &format!("module not available: {name}"),
                ))
            }
        }
    }
}
