//! Blob capability: `Blob`, `File`, `FileReader`, object URLs, and the
//! base64 globals `atob` / `btoa`.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rquickjs::function::Rest;
use rquickjs::Value;

use crate::module::{CageModule, ModuleContext};
use crate::value::HostValue;
use crate::vm;

pub struct BlobModule;

impl CageModule for BlobModule {
    fn def(&self, mcx: &mut ModuleContext<'_, '_>) -> anyhow::Result<()> {
        // Concatenate blob parts (strings as UTF-8, buffers raw) host-side.
        mcx.define_fn_raw("__cage_blob_concat", |ctx, args: Rest<Value<'_>>| {
            let parts = match args.first().map(vm::dump) {
                Some(HostValue::Array(parts)) => parts,
                _ => Vec::new(),
            };
            let mut buf = Vec::new();
            for part in &parts {
                match part {
                    HostValue::String(s) => buf.extend_from_slice(s.as_bytes()),
                    HostValue::Bytes(b) => buf.extend_from_slice(b),
                    HostValue::Undefined | HostValue::Null => {}
                    other => {
                        buf.extend_from_slice(other.to_display_string().as_bytes());
                    }
                }
            }
            rquickjs::ArrayBuffer::new(ctx.clone(), buf)
                .map(rquickjs::ArrayBuffer::into_value)
        })?;

        mcx.define_fn_raw("__cage_blob_text", |ctx, args: Rest<Value<'_>>| {
            let text = match args.first().map(vm::dump) {
                Some(HostValue::Bytes(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
                _ => String::new(),
            };
            rquickjs::String::from_str(ctx.clone(), &text).map(rquickjs::String::into_value)
        })?;

        // atob: base64 text to a binary string (one char per byte).
        mcx.define_fn_raw("__cage_atob", |ctx, args: Rest<Value<'_>>| {
            let input = args
                .first()
                .map(vm::dump)
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default();
            let bytes = STANDARD.decode(input.trim()).map_err(|_| {
                vm::throw_error(
                    &ctx,
                    "InvalidCharacterError",
                    "atob input is not valid base64",
                )
            })?;
            let binary: String = bytes.iter().map(|b| char::from(*b)).collect();
            rquickjs::String::from_str(ctx.clone(), &binary)
                .map(rquickjs::String::into_value)
        })?;

        // btoa: binary string (code points <= 0xFF) to base64 text.
        mcx.define_fn_raw("__cage_btoa", |ctx, args: Rest<Value<'_>>| {
            let input = args
                .first()
                .map(vm::dump)
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default();
            let mut bytes = Vec::with_capacity(input.len());
            for ch in input.chars() {
                let code = u32::from(ch);
                if code > 0xFF {
                    return Err(vm::throw_error(
                        &ctx,
                        "InvalidCharacterError",
                        "btoa input contains characters outside the Latin1 range",
                    ));
                }
                bytes.push(code as u8);
            }
            rquickjs::String::from_str(ctx.clone(), &STANDARD.encode(bytes))
                .map(rquickjs::String::into_value)
        })?;

        mcx.eval_glue(BLOB_GLUE)
    }
}

const BLOB_GLUE: &str = r#"
(() => {
  function normalizeParts(parts) {
    const out = [];
    for (const part of parts) {
      if (part instanceof Blob) {
        out.push(part._buf);
      } else if (ArrayBuffer.isView(part)) {
        out.push(part.buffer.slice(part.byteOffset, part.byteOffset + part.byteLength));
      } else if (part instanceof ArrayBuffer) {
        out.push(part);
      } else {
        out.push(String(part));
      }
    }
    return out;
  }

  class Blob {
    constructor(parts = [], options = {}) {
      this._buf = __cage_blob_concat(normalizeParts(parts));
      this.type = String(options.type ?? "");
    }
    get size() {
      return this._buf.byteLength;
    }
    arrayBuffer() {
      return Promise.resolve(this._buf.slice(0));
    }
    text() {
      return Promise.resolve(__cage_blob_text(this._buf));
    }
    slice(start = 0, end = this.size, contentType = "") {
      const sliced = this._buf.slice(start, end);
      return new Blob([sliced], { type: contentType });
    }
  }

  class File extends Blob {
    constructor(parts, name, options = {}) {
      super(parts, options);
      this.name = String(name);
      this.lastModified = options.lastModified ?? 0;
    }
  }

  class FileReader {
    constructor() {
      this.readyState = FileReader.EMPTY;
      this.result = null;
      this.error = null;
      this.onload = null;
      this.onloadend = null;
      this.onerror = null;
    }
    _finish(result) {
      this.result = result;
      this.readyState = FileReader.DONE;
      if (this.onload) this.onload({ target: this });
      if (this.onloadend) this.onloadend({ target: this });
    }
    _read(blob, produce) {
      if (!(blob instanceof Blob)) {
        throw new TypeError("FileReader expects a Blob");
      }
      this.readyState = FileReader.LOADING;
      Promise.resolve().then(() => {
        try {
          this._finish(produce(blob));
        } catch (err) {
          this.error = err;
          this.readyState = FileReader.DONE;
          if (this.onerror) this.onerror({ target: this });
          if (this.onloadend) this.onloadend({ target: this });
        }
      });
    }
    readAsText(blob) {
      this._read(blob, (b) => __cage_blob_text(b._buf));
    }
    readAsArrayBuffer(blob) {
      this._read(blob, (b) => b._buf.slice(0));
    }
    readAsDataURL(blob) {
      this._read(blob, (b) => {
        const bytes = new Uint8Array(b._buf);
        let binary = "";
        for (let i = 0; i < bytes.length; i++) {
          binary += String.fromCharCode(bytes[i]);
        }
        const mime = b.type || "application/octet-stream";
        return `data:${mime};base64,${__cage_btoa(binary)}`;
      });
    }
  }
  FileReader.EMPTY = 0;
  FileReader.LOADING = 1;
  FileReader.DONE = 2;

  const objectUrls = new Map();
  let nextObjectUrl = 1;

  const urlNamespace =
    globalThis.URL ??
    (globalThis.URL = function URL() {
      throw new TypeError("URL parsing is not installed");
    });
  urlNamespace.createObjectURL = (blob) => {
    const key = `blob:cage/${nextObjectUrl++}`;
    objectUrls.set(key, blob);
    return key;
  };
  urlNamespace.revokeObjectURL = (key) => {
    objectUrls.delete(key);
  };
  urlNamespace._objectUrls = objectUrls;

  globalThis.Blob = Blob;
  globalThis.File = File;
  globalThis.FileReader = FileReader;
  globalThis.atob = __cage_atob;
  globalThis.btoa = __cage_btoa;
})();
"#;
