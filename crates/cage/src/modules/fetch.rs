//! Fetch capability: `fetch`, `Headers`, `Request`, `Response`,
//! `AbortController`.
//!
//! The guest-facing classes live in glue; the host side performs the
//! request with `reqwest` and hands back a transport payload
//! (`status`/`statusText`/`url`/`headersList`/`bodyBytes`) that the glue
//! wraps in a `Response`. Abort state is parked in the receiver registry
//! and referenced from the guest by integer key, which keeps the
//! signal→fetch→signal graph acyclic.

use std::rc::Rc;

use bytes::Bytes;
use rquickjs::function::Rest;
use rquickjs::Value;
use tokio::sync::oneshot;

use crate::marshal::{self, HostFuture};
use crate::module::{self, CageModule, ModuleContext};
use crate::value::HostValue;
use crate::vm;

/// Responses beyond this size are reported as errors rather than buffered.
const MAX_RESPONSE_BODY_BYTES: usize = 16 * 1024 * 1024;

pub struct FetchModule {
    client: reqwest::Client,
}

#[derive(Default)]
struct AbortState {
    aborted: bool,
    waiters: Vec<oneshot::Sender<()>>,
}

impl FetchModule {
    #[must_use]
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    #[must_use]
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for FetchModule {
    fn default() -> Self {
        Self::new()
    }
}

impl CageModule for FetchModule {
    fn def(&self, mcx: &mut ModuleContext<'_, '_>) -> anyhow::Result<()> {
        {
            let client = self.client.clone();
            let shared = Rc::clone(mcx.shared());
            mcx.define_fn_raw("__cage_fetch", move |ctx, args: Rest<Value<'_>>| {
                let request = args.first().map(vm::dump).unwrap_or_default();
                let future = match build_fetch_future(&client, &shared, &request) {
                    Ok(future) => future,
                    Err(message) => return Err(vm::throw_error(&ctx, "TypeError", &message)),
                };
                marshal::promise_to_guest(&ctx, &shared, future)
                    .map_err(|err| vm::throw_error(&ctx, "TypeError", &err.to_string()))
            })?;
        }

        {
            let shared = Rc::clone(mcx.shared());
            mcx.define_fn_raw("__cage_abort_new", move |ctx, _args: Rest<Value<'_>>| {
                let id = shared.register_receiver(Box::new(AbortState::default()));
                Ok(Value::new_float(ctx.clone(), f64::from(id)))
            })?;
        }

        {
            let shared = Rc::clone(mcx.shared());
            mcx.define_fn_raw("__cage_abort", move |ctx, args: Rest<Value<'_>>| {
                if let Some(id) = args.first().and_then(Value::as_number) {
                    let _ = module::with_receiver::<AbortState, _>(
                        &shared,
                        id as u32,
                        |state| {
                            state.aborted = true;
                            for waiter in state.waiters.drain(..) {
                                let _ = waiter.send(());
                            }
                        },
                    );
                }
                Ok(Value::new_undefined(ctx.clone()))
            })?;
        }

        {
            // `this`-bound: the signal object carries its receiver key.
            let shared = Rc::clone(mcx.shared());
            let check = mcx.fn_method("__cage_signal_aborted", move |ctx, this, _args| {
                let id = module::receiver_key(&this)?;
                let aborted =
                    module::with_receiver::<AbortState, _>(&shared, id, |state| state.aborted)
                        .map_err(|err| vm::throw_error(&ctx, "TypeError", &err.to_string()))?;
                Ok(Value::new_bool(ctx.clone(), aborted))
            })?;
            mcx.set_global("__cage_signal_aborted", check.into_value())?;
        }

        mcx.define_fn_raw("__cage_fetch_decode", |ctx, args: Rest<Value<'_>>| {
            let text = match args.first().map(vm::dump) {
                Some(HostValue::Bytes(bytes)) => {
                    String::from_utf8_lossy(&bytes).into_owned()
                }
                Some(HostValue::String(s)) => s,
                _ => String::new(),
            };
            rquickjs::String::from_str(ctx.clone(), &text).map(rquickjs::String::into_value)
        })?;

        mcx.eval_glue(FETCH_GLUE)
    }
}

/// Pull the transport fields out of the dumped request and build the host
/// future. Returns a message for the guest `TypeError` on malformed input.
fn build_fetch_future(
    client: &reqwest::Client,
    shared: &Rc<crate::state::EvalState>,
    request: &HostValue,
) -> Result<HostFuture, String> {
    let method = request
        .get("method")
        .and_then(HostValue::as_str)
        .unwrap_or("GET")
        .to_string();
    let url = request
        .get("url")
        .and_then(HostValue::as_str)
        .ok_or_else(|| "fetch requires a request URL".to_string())?
        .to_string();

    let mut headers = Vec::new();
    if let Some(list) = request.get("headers").and_then(HostValue::as_array) {
        for pair in list {
            let Some(pair) = pair.as_array() else {
                continue;
            };
            if let (Some(name), Some(value)) = (
                pair.first().and_then(HostValue::as_str),
                pair.get(1).and_then(HostValue::as_str),
            ) {
                headers.push((name.to_string(), value.to_string()));
            }
        }
    }

    let body = match request.get("body") {
        None => None,
        Some(HostValue::Null | HostValue::Undefined) => None,
        Some(HostValue::String(s)) => Some(Bytes::copy_from_slice(s.as_bytes())),
        Some(HostValue::Bytes(b)) => Some(b.clone()),
        Some(_) => return Err("unsupported fetch body".to_string()),
    };

    // Abort wiring: an already-aborted signal rejects without dispatching.
    let mut abort_rx = None;
    if let Some(id) = request.get("signal").and_then(HostValue::as_f64) {
        let (tx, rx) = oneshot::channel();
        let aborted = module::with_receiver::<AbortState, _>(shared, id as u32, |state| {
            if state.aborted {
                true
            } else {
                state.waiters.push(tx);
                false
            }
        })
        .map_err(|err| err.to_string())?;
        if aborted {
            return Ok(Box::pin(std::future::ready(Err(abort_error()))));
        }
        abort_rx = Some(rx);
    }

    let client = client.clone();
    Ok(Box::pin(async move {
        match abort_rx {
            Some(rx) => tokio::select! {
                result = dispatch(client, method, url, headers, body) => result,
                _ = rx => Err(abort_error()),
            },
            None => dispatch(client, method, url, headers, body).await,
        }
    }))
}

fn abort_error() -> HostValue {
    HostValue::error("AbortError", "the operation was aborted")
}

async fn dispatch(
    client: reqwest::Client,
    method: String,
    url: String,
    headers: Vec<(String, String)>,
    body: Option<Bytes>,
) -> Result<HostValue, HostValue> {
    let method = reqwest::Method::from_bytes(method.as_bytes())
        .map_err(|_| HostValue::error("TypeError", format!("invalid method: {method}")))?;

    tracing::debug!(%method, %url, "dispatching fetch");
    let mut builder = client.request(method, &url);
    for (name, value) in &headers {
        // The transport owns the Host header.
        if name.eq_ignore_ascii_case("host") {
            continue;
        }
        builder = builder.header(name, value);
    }
    if let Some(bytes) = body {
        builder = builder.body(bytes);
    }

    let response = builder
        .send()
        .await
        .map_err(|err| HostValue::error("TypeError", format!("fetch failed: {err}")))?;

    let status = response.status();
    let final_url = response.url().to_string();
    // Pairs preserving duplicates and order.
    let headers_list: Vec<HostValue> = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value.to_str().ok().map(|value| {
                HostValue::Array(vec![name.as_str().into(), value.into()])
            })
        })
        .collect();

    let bytes = response
        .bytes()
        .await
        .map_err(|err| HostValue::error("TypeError", format!("failed to read body: {err}")))?;
    if bytes.len() > MAX_RESPONSE_BODY_BYTES {
        return Err(HostValue::error(
            "TypeError",
            format!("response body exceeds maximum size of {MAX_RESPONSE_BODY_BYTES} bytes"),
        ));
    }

    Ok(HostValue::object([
        ("status", HostValue::Number(f64::from(status.as_u16()))),
        (
            "statusText",
            status.canonical_reason().unwrap_or("").into(),
        ),
        ("url", final_url.into()),
        ("headersList", HostValue::Array(headers_list)),
        ("bodyBytes", HostValue::Bytes(bytes)),
    ]))
}

const FETCH_GLUE: &str = r#"
(() => {
  class Headers {
    constructor(init) {
      this._list = [];
      if (init instanceof Headers) {
        this._list = init._list.map(([k, v]) => [k, v]);
      } else if (Array.isArray(init)) {
        for (const pair of init) {
          this.append(pair[0], pair[1]);
        }
      } else if (init && typeof init === "object") {
        for (const key of Object.keys(init)) {
          this.append(key, init[key]);
        }
      }
    }
    append(name, value) {
      this._list.push([String(name).toLowerCase(), String(value)]);
    }
    set(name, value) {
      this.delete(name);
      this.append(name, value);
    }
    delete(name) {
      const n = String(name).toLowerCase();
      this._list = this._list.filter(([k]) => k !== n);
    }
    get(name) {
      const n = String(name).toLowerCase();
      const hits = this._list.filter(([k]) => k === n).map(([, v]) => v);
      return hits.length ? hits.join(", ") : null;
    }
    has(name) {
      const n = String(name).toLowerCase();
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
  }

  class AbortSignal {
    constructor(id) {
      Object.defineProperty(this, "__cageHostId", { value: id });
    }
    get aborted() {
      return __cage_signal_aborted.call(this);
    }
    throwIfAborted() {
      if (this.aborted) {
        const err = new Error("the operation was aborted");
        err.name = "AbortError";
        throw err;
      }
    }
  }

  class AbortController {
    constructor() {
      this._id = __cage_abort_new();
      this.signal = new AbortSignal(this._id);
    }
    abort() {
      __cage_abort(this._id);
    }
  }

  class Request {
    constructor(input, init = {}) {
      if (input instanceof Request) {
        this.url = input.url;
        this.method = init.method ? String(init.method).toUpperCase() : input.method;
        this.headers = new Headers(init.headers ?? input.headers);
        this.body = init.body ?? input.body;
        this.signal = init.signal ?? input.signal;
      } else {
        this.url = String(input);
        this.method = String(init.method ?? "GET").toUpperCase();
        this.headers = new Headers(init.headers);
        this.body = init.body ?? null;
        this.signal = init.signal ?? null;
      }
    }
  }

  class Response {
    constructor(payload) {
      this.status = payload.status;
      this.statusText = payload.statusText;
      this.url = payload.url;
      this.headers = new Headers(payload.headersList);
      this.ok = payload.status >= 200 && payload.status < 300;
      this.bodyUsed = false;
      this._body = payload.bodyBytes;
    }
    arrayBuffer() {
      this.bodyUsed = true;
      return Promise.resolve(this._body);
    }
    text() {
      this.bodyUsed = true;
      return Promise.resolve(__cage_fetch_decode(this._body));
    }
    json() {
      return this.text().then((text) => JSON.parse(text));
    }
  }

  globalThis.Headers = Headers;
  globalThis.AbortSignal = AbortSignal;
  globalThis.AbortController = AbortController;
  globalThis.Request = Request;
  globalThis.Response = Response;

  globalThis.fetch = function fetch(input, init) {
    try {
      const request = new Request(input, init);
      let body = request.body;
      if (
        body !== null &&
        typeof body !== "string" &&
        !(body instanceof ArrayBuffer) &&
        !ArrayBuffer.isView(body)
      ) {
        throw new TypeError("unsupported fetch body");
      }
      if (ArrayBuffer.isView(body)) {
        body = body.buffer.slice(body.byteOffset, body.byteOffset + body.byteLength);
      }
      return __cage_fetch({
        method: request.method,
        url: request.url,
        headers: request.headers._list,
        body,
        signal: request.signal ? request.signal.__cageHostId : undefined,
      }).then((payload) => new Response(payload));
    } catch (err) {
      return Promise.reject(err);
    }
  };
})();
"#;
