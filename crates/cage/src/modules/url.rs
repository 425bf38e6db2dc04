//! URL capability: `URL` and `URLSearchParams`.
//!
//! Parsing happens host-side with the `url` crate; the guest classes wrap
//! the parsed components. `URLSearchParams` is pure glue.

use rquickjs::function::Rest;
use rquickjs::Value;
use url::Url;

use crate::marshal;
use crate::module::{CageModule, ModuleContext};
use crate::value::HostValue;
use crate::vm;

pub struct UrlModule;

impl CageModule for UrlModule {
    fn def(&self, mcx: &mut ModuleContext<'_, '_>) -> anyhow::Result<()> {
        mcx.define_fn_raw("__cage_url_parse", |ctx, args: Rest<Value<'_>>| {
            let input = args
                .first()
                .map(vm::dump)
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default();
            let base = args
                .get(1)
                .map(vm::dump)
                .and_then(|v| v.as_str().map(str::to_string));

            let parsed = match parse_url(&input, base.as_deref()) {
                Ok(parsed) => parsed,
                Err(message) => return Err(vm::throw_error(&ctx, "TypeError", &message)),
            };
            marshal::to_guest(&ctx, &parsed)
                .map_err(|err| vm::throw_error(&ctx, "TypeError", &err.to_string()))
        })?;

        mcx.eval_glue(URL_GLUE)
    }
}

fn parse_url(input: &str, base: Option<&str>) -> Result<HostValue, String> {
    let parsed = match base {
        Some(base) => Url::parse(base)
            .and_then(|base| base.join(input))
            .map_err(|err| format!("invalid URL '{input}' with base '{base}': {err}"))?,
        None => Url::parse(input).map_err(|err| format!("invalid URL '{input}': {err}"))?,
    };

    let protocol = format!("{}:", parsed.scheme());
    let hostname = parsed.host_str().unwrap_or("").to_string();
    let port = parsed
        .port()
        .map(|p| p.to_string())
        .unwrap_or_default();
    let host = if port.is_empty() {
        hostname.clone()
    } else {
        format!("{hostname}:{port}")
    };
    let search = parsed
        .query()
        .map(|q| format!("?{q}"))
        .unwrap_or_default();
    let hash = parsed
        .fragment()
        .map(|f| format!("#{f}"))
        .unwrap_or_default();
    let origin = parsed.origin().ascii_serialization();

    Ok(HostValue::object([
        ("href", parsed.as_str().into()),
        ("protocol", protocol.into()),
        ("host", host.into()),
        ("hostname", hostname.into()),
        ("port", port.into()),
        ("pathname", parsed.path().into()),
        ("search", search.into()),
        ("hash", hash.into()),
        ("origin", origin.into()),
        ("username", parsed.username().into()),
        (
            "password",
            parsed.password().unwrap_or("").into(),
        ),
    ]))
}

const URL_GLUE: &str = r#"
(() => {
  class URLSearchParams {
    constructor(init) {
      this._list = [];
      if (init instanceof URLSearchParams) {
        this._list = init._list.map(([k, v]) => [k, v]);
      } else if (typeof init === "string") {
        const raw = init.startsWith("?") ? init.slice(1) : init;
        if (raw.length) {
          for (const piece of raw.split("&")) {
            if (!piece) continue;
            const eq = piece.indexOf("=");
            const key = eq < 0 ? piece : piece.slice(0, eq);
            const value = eq < 0 ? "" : piece.slice(eq + 1);
            this._list.push([
              decodeURIComponent(key.replace(/\+/g, " ")),
              decodeURIComponent(value.replace(/\+/g, " ")),
            ]);
          }
        }
      } else if (Array.isArray(init)) {
        for (const pair of init) {
          this._list.push([String(pair[0]), String(pair[1])]);
        }
      } else if (init && typeof init === "object") {
        for (const key of Object.keys(init)) {
          this._list.push([key, String(init[key])]);
        }
      }
    }
    append(name, value) {
      this._list.push([String(name), String(value)]);
    }
    set(name, value) {
      this.delete(name);
      this.append(name, value);
    }
    delete(name) {
      const n = String(name);
      this._list = this._list.filter(([k]) => k !== n);
    }
    get(name) {
      const n = String(name);
      const hit = this._list.find(([k]) => k === n);
      return hit ? hit[1] : null;
    }
    getAll(name) {
      const n = String(name);
      return this._list.filter(([k]) => k === n).map(([, v]) => v);
    }
    has(name) {
      const n = String(name);
      return this._list.some(([k]) => k === n);
    }
    forEach(fn, thisArg) {
      for (const [k, v] of this._list) {
        fn.call(thisArg, v, k, this);
      }
    }
    entries() {
      return this._list.map(([k, v]) => [k, v])[Symbol.iterator]();
    }
    keys() {
      return this._list.map(([k]) => k)[Symbol.iterator]();
    }
    values() {
      return this._list.map(([, v]) => v)[Symbol.iterator]();
    }
    [Symbol.iterator]() {
      return this.entries();
    }
    toString() {
      return this._list
        .map(([k, v]) => `${encodeURIComponent(k)}=${encodeURIComponent(v)}`)
        .join("&");
    }
  }

  class URL {
    constructor(input, base) {
      const parts =
        base === undefined
          ? __cage_url_parse(String(input))
          : __cage_url_parse(String(input), String(base));
      this.href = parts.href;
      this.protocol = parts.protocol;
      this.host = parts.host;
      this.hostname = parts.hostname;
      this.port = parts.port;
      this.pathname = parts.pathname;
      this.search = parts.search;
      this.hash = parts.hash;
      this.origin = parts.origin;
      this.username = parts.username;
      this.password = parts.password;
      this.searchParams = new URLSearchParams(parts.search);
    }
    toString() {
      return this.href;
    }
    toJSON() {
      return this.href;
    }
  }

  // Another capability may already have attached statics to a URL
  // namespace (object URLs); carry them over instead of dropping them.
  const existing = globalThis.URL;
  if (existing) {
    for (const key of Object.keys(existing)) {
      URL[key] = existing[key];
    }
  }
  globalThis.URL = URL;
  globalThis.URLSearchParams = URLSearchParams;
})();
"#;

#[cfg(test)]
mod tests {
    use super::parse_url;
    use crate::value::HostValue;

    #[test]
    fn absolute_urls_decompose() {
        let parsed = parse_url("https://user:pw@example.com:8443/a/b?x=1#frag", None)
            .expect("parse");
        assert_eq!(parsed.get("protocol"), Some(&HostValue::from("https:")));
        assert_eq!(parsed.get("hostname"), Some(&HostValue::from("example.com")));
        assert_eq!(parsed.get("port"), Some(&HostValue::from("8443")));
        assert_eq!(parsed.get("pathname"), Some(&HostValue::from("/a/b")));
        assert_eq!(parsed.get("search"), Some(&HostValue::from("?x=1")));
        assert_eq!(parsed.get("hash"), Some(&HostValue::from("#frag")));
        assert_eq!(parsed.get("username"), Some(&HostValue::from("user")));
    }

    #[test]
    fn relative_urls_resolve_against_base() {
        let parsed = parse_url("../c", Some("https://example.com/a/b/")).expect("parse");
        assert_eq!(
            parsed.get("href"),
            Some(&HostValue::from("https://example.com/a/c"))
        );
    }

    #[test]
    fn invalid_urls_are_rejected() {
        assert!(parse_url("not a url", None).is_err());
    }
}
