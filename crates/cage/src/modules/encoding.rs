//! Text encoding capability: `TextEncoder` / `TextDecoder` (UTF-8).

use rquickjs::function::Rest;
use rquickjs::Value;

use crate::module::{CageModule, ModuleContext};
use crate::value::HostValue;
use crate::vm;

pub struct EncodingModule;

impl CageModule for EncodingModule {
    fn def(&self, mcx: &mut ModuleContext<'_, '_>) -> anyhow::Result<()> {
        mcx.define_fn_raw("__cage_utf8_encode", |ctx, args: Rest<Value<'_>>| {
            let text = match args.first().map(vm::dump) {
                Some(HostValue::String(s)) => s,
                Some(HostValue::Undefined) | None => String::new(),
                Some(other) => other.to_display_string(),
            };
            rquickjs::ArrayBuffer::new(ctx.clone(), text.into_bytes())
                .map(rquickjs::ArrayBuffer::into_value)
        })?;

        mcx.define_fn_raw("__cage_utf8_decode", |ctx, args: Rest<Value<'_>>| {
            let text = match args.first().map(vm::dump) {
                Some(HostValue::Bytes(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
                _ => {
                    return Err(vm::throw_error(
                        &ctx,
                        "TypeError",
                        "decode input must be a buffer",
                    ));
                }
            };
            rquickjs::String::from_str(ctx.clone(), &text).map(rquickjs::String::into_value)
        })?;

        mcx.eval_glue(ENCODING_GLUE)
    }
}

const ENCODING_GLUE: &str = r#"
(() => {
  function assertUtf8(label) {
    const normalized = String(label ?? "utf-8").toLowerCase();
    if (normalized !== "utf-8" && normalized !== "utf8" && normalized !== "unicode-1-1-utf-8") {
      throw new RangeError(`unsupported encoding label: ${label}`);
    }
  }

  class TextEncoder {
    get encoding() {
      return "utf-8";
    }
    encode(input = "") {
      return new Uint8Array(__cage_utf8_encode(String(input)));
    }
  }

  class TextDecoder {
    constructor(label = "utf-8") {
      assertUtf8(label);
    }
    get encoding() {
      return "utf-8";
    }
    decode(input) {
      if (input === undefined) {
        return "";
      }
      let buffer = input;
      if (ArrayBuffer.isView(buffer)) {
        buffer = buffer.buffer.slice(buffer.byteOffset, buffer.byteOffset + buffer.byteLength);
      }
      if (!(buffer instanceof ArrayBuffer)) {
        throw new TypeError("decode input must be a buffer");
      }
      return __cage_utf8_decode(buffer);
    }
  }

  globalThis.TextEncoder = TextEncoder;
  globalThis.TextDecoder = TextDecoder;
})();
"#;
