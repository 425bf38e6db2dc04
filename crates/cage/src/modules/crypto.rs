//! Crypto capability: `crypto.getRandomValues`, `crypto.randomUUID`, and
//! `crypto.subtle.digest` (SHA-256/384/512).

use bytes::Bytes;
use rand::RngCore;
use rquickjs::function::Rest;
use rquickjs::Value;
use sha2::{Digest, Sha256, Sha384, Sha512};

use crate::module::{CageModule, ModuleContext};
use crate::value::HostValue;
use crate::vm;

/// WebCrypto quota for one `getRandomValues` call.
const MAX_RANDOM_BYTES: usize = 65536;

pub struct CryptoModule;

impl CageModule for CryptoModule {
    fn def(&self, mcx: &mut ModuleContext<'_, '_>) -> anyhow::Result<()> {
        mcx.define_fn_raw("__cage_random_bytes", |ctx, args: Rest<Value<'_>>| {
            let len = args
                .first()
                .and_then(Value::as_number)
                .filter(|n| n.is_finite() && *n >= 0.0)
                .map(|n| n as usize)
                .unwrap_or(0);
            if len > MAX_RANDOM_BYTES {
                return Err(vm::throw_error(
                    &ctx,
                    "QuotaExceededError",
                    &format!("requested {len} bytes, limit is {MAX_RANDOM_BYTES}"),
                ));
            }
            let mut buf = vec![0_u8; len];
            rand::thread_rng().fill_bytes(&mut buf);
            rquickjs::ArrayBuffer::new(ctx.clone(), buf)
                .map(rquickjs::ArrayBuffer::into_value)
        })?;

        mcx.define_fn_raw("__cage_random_uuid", |ctx, _args: Rest<Value<'_>>| {
            let uuid = random_uuid_v4();
            rquickjs::String::from_str(ctx.clone(), &uuid)
                .map(rquickjs::String::into_value)
        })?;

        mcx.define_fn_raw("__cage_digest", |ctx, args: Rest<Value<'_>>| {
            let algorithm = args
                .first()
                .map(vm::dump)
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default();
            let data = match args.get(1).map(vm::dump) {
                Some(HostValue::Bytes(bytes)) => bytes,
                _ => {
                    return Err(vm::throw_error(
                        &ctx,
                        "TypeError",
                        "digest data must be a buffer",
                    ));
                }
            };
            let digest = match digest_bytes(&algorithm, &data) {
                Some(digest) => digest,
                None => {
                    return Err(vm::throw_error(
                        &ctx,
                        "NotSupportedError",
                        &format!("unsupported digest algorithm: {algorithm}"),
                    ));
                }
            };
            rquickjs::ArrayBuffer::new(ctx.clone(), digest)
                .map(rquickjs::ArrayBuffer::into_value)
        })?;

        mcx.eval_glue(CRYPTO_GLUE)
    }
}

fn digest_bytes(algorithm: &str, data: &Bytes) -> Option<Vec<u8>> {
    match algorithm {
        "SHA-256" => Some(Sha256::digest(data).to_vec()),
        "SHA-384" => Some(Sha384::digest(data).to_vec()),
        "SHA-512" => Some(Sha512::digest(data).to_vec()),
        _ => None,
    }
}

/// RFC 4122 version-4 UUID from engine-independent randomness.
fn random_uuid_v4() -> String {
    let mut bytes = [0_u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    format!(
        "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
        bytes[0], bytes[1], bytes[2], bytes[3],
        bytes[4], bytes[5],
        bytes[6], bytes[7],
        bytes[8], bytes[9],
        bytes[10], bytes[11], bytes[12], bytes[13], bytes[14], bytes[15],
    )
}

const CRYPTO_GLUE: &str = r#"
(() => {
  const subtle = {
    digest(algorithm, data) {
      try {
        const name = typeof algorithm === "string" ? algorithm : algorithm && algorithm.name;
        let buffer = data;
        if (ArrayBuffer.isView(buffer)) {
          buffer = buffer.buffer.slice(buffer.byteOffset, buffer.byteOffset + buffer.byteLength);
        }
        if (!(buffer instanceof ArrayBuffer)) {
          throw new TypeError("digest data must be a buffer");
        }
        return Promise.resolve(__cage_digest(String(name).toUpperCase(), buffer));
      } catch (err) {
        return Promise.reject(err);
      }
    },
  };

  globalThis.crypto = {
    getRandomValues(array) {
      if (!ArrayBuffer.isView(array)) {
        throw new TypeError("getRandomValues requires a typed array");
      }
      const random = new Uint8Array(__cage_random_bytes(array.byteLength));
      const view = new Uint8Array(array.buffer, array.byteOffset, array.byteLength);
      view.set(random);
      return array;
    },
    randomUUID() {
      return __cage_random_uuid();
    },
    subtle,
  };
})();
"#;

#[cfg(test)]
mod tests {
    use super::{digest_bytes, random_uuid_v4};
    use bytes::Bytes;

    #[test]
    fn sha256_matches_known_vector() {
        let digest = digest_bytes("SHA-256", &Bytes::from_static(b"abc")).expect("sha-256");
        let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        assert_eq!(
            hex,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn unknown_algorithm_is_rejected() {
        assert!(digest_bytes("MD5", &Bytes::from_static(b"abc")).is_none());
    }

    #[test]
    fn uuids_carry_version_and_variant_bits() {
        let uuid = random_uuid_v4();
        assert_eq!(uuid.len(), 36);
        let chars: Vec<char> = uuid.chars().collect();
        assert_eq!(chars[14], '4');
        assert!(matches!(chars[19], '8' | '9' | 'a' | 'b'));
    }
}
