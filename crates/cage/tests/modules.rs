mod common;

use cage::modules::{
    BlobModule, CryptoModule, EncodingModule, EsmModule, FetchModule, UrlModule,
};
use cage::CageModule;
use common::run_with_console;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn subtle_digest_matches_known_vector() {
    let crypto = CryptoModule;
    let encoding = EncodingModule;
    let script = r#"
        const data = new TextEncoder().encode("abc");
        const digest = await crypto.subtle.digest("SHA-256", data);
        const hex = Array.from(new Uint8Array(digest))
            .map((b) => b.toString(16).padStart(2, "0"))
            .join("");
        console.log(hex);
    "#;
    let (result, messages) = run_with_console(script, &[&crypto, &encoding]).await;
    assert!(result.is_ok());
    assert_eq!(
        messages,
        vec!["ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"]
    );
}

#[tokio::test]
async fn unsupported_digest_algorithms_reject() {
    let crypto = CryptoModule;
    let encoding = EncodingModule;
    let script = r#"
        try {
            await crypto.subtle.digest("MD5", new TextEncoder().encode("abc"));
            console.log("unreachable");
        } catch (err) {
            console.log(err.name);
        }
    "#;
    let (result, messages) = run_with_console(script, &[&crypto, &encoding]).await;
    assert!(result.is_ok());
    assert_eq!(messages, vec!["NotSupportedError"]);
}

#[tokio::test]
async fn random_uuid_is_v4_shaped() {
    let crypto = CryptoModule;
    let script = r#"
        const uuid = crypto.randomUUID();
        console.log(/^[0-9a-f]{8}-[0-9a-f]{4}-4[0-9a-f]{3}-[89ab][0-9a-f]{3}-[0-9a-f]{12}$/.test(uuid));
    "#;
    let (result, messages) = run_with_console(script, &[&crypto]).await;
    assert!(result.is_ok());
    assert_eq!(messages, vec!["true"]);
}

#[tokio::test]
async fn get_random_values_fills_the_view_in_place() {
    let crypto = CryptoModule;
    let script = r#"
        const array = new Uint8Array(32);
        const out = crypto.getRandomValues(array);
        console.log(out === array, array.some((b) => b !== 0));
    "#;
    let (result, messages) = run_with_console(script, &[&crypto]).await;
    assert!(result.is_ok());
    assert_eq!(messages, vec!["true true"]);
}

#[tokio::test]
async fn text_encoding_round_trips_utf8() {
    let encoding = EncodingModule;
    let script = r#"
        const bytes = new TextEncoder().encode("héllo ✓");
        console.log(new TextDecoder().decode(bytes));
        try {
            new TextDecoder("latin1");
        } catch (err) {
            console.log(err instanceof RangeError);
        }
    "#;
    let (result, messages) = run_with_console(script, &[&encoding]).await;
    assert!(result.is_ok());
    assert_eq!(messages, vec!["héllo ✓", "true"]);
}

#[tokio::test]
async fn url_components_and_search_params() {
    let url = UrlModule;
    let script = r#"
        const u = new URL("https://example.com/a/b?x=1&y=2#frag");
        console.log(u.hostname, u.pathname, u.hash);
        console.log(u.searchParams.get("y"));

        const params = new URLSearchParams("a=1&b=two words");
        params.append("c", "3");
        params.set("a", "9");
        console.log(params.toString());

        const joined = new URL("../up", "https://example.com/a/b/");
        console.log(joined.href);

        try {
            new URL("not a url");
        } catch (err) {
            console.log(err instanceof TypeError);
        }
    "#;
    let (result, messages) = run_with_console(script, &[&url]).await;
    assert!(result.is_ok());
    assert_eq!(
        messages,
        vec![
            "example.com /a/b #frag",
            "2",
            "b=two%20words&c=3&a=9",
            "https://example.com/a/up",
            "true",
        ]
    );
}

#[tokio::test]
async fn blob_surface_and_base64_globals() {
    let blob = BlobModule;
    let script = r#"
        const blob = new Blob(["hello ", "world"]);
        console.log(blob.size);
        console.log(await blob.text());
        console.log(await blob.slice(0, 5).text());

        console.log(btoa("Hello"));
        console.log(atob("SGVsbG8="));

        const key = URL.createObjectURL(blob);
        console.log(key.startsWith("blob:"));
        URL.revokeObjectURL(key);
    "#;
    let (result, messages) = run_with_console(script, &[&blob]).await;
    assert!(result.is_ok());
    assert_eq!(
        messages,
        vec!["11", "hello world", "hello", "SGVsbG8=", "Hello", "true"]
    );
}

#[tokio::test]
async fn blob_and_url_modules_compose_in_either_order() {
    let blob = BlobModule;
    let url = UrlModule;
    let orders: [[&dyn CageModule; 2]; 2] = [[&blob, &url], [&url, &blob]];

    let script = r#"
        const key = URL.createObjectURL(new Blob(["x"]));
        console.log(key.startsWith("blob:"), new URL("https://example.com/a").hostname);
        URL.revokeObjectURL(key);
    "#;
    for order in orders {
        let (result, messages) = run_with_console(script, &order).await;
        assert!(result.is_ok());
        assert_eq!(messages, vec!["true example.com"]);
    }
}

#[tokio::test]
async fn file_reader_delivers_through_the_microtask_queue() {
    let blob = BlobModule;
    let script = r#"
        const reader = new FileReader();
        reader.onload = () => console.log("read:", reader.result);
        reader.readAsText(new Blob(["abc"]));
        console.log("scheduled");
    "#;
    let (result, messages) = run_with_console(script, &[&blob]).await;
    assert!(result.is_ok());
    assert_eq!(messages, vec!["scheduled", "read: abc"]);
}

#[tokio::test]
async fn fetch_round_trips_status_headers_and_body() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/hello"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/plain")
                .set_body_string("world"),
        )
        .mount(&server)
        .await;

    let fetch = FetchModule::new();
    let script = format!(
        r#"
        const response = await fetch("{}/hello");
        console.log(response.status, response.ok);
        console.log(response.headers.get("content-type"));
        console.log(await response.text());
        "#,
        server.uri()
    );
    let (result, messages) = run_with_console(&script, &[&fetch]).await;
    assert!(result.is_ok());
    assert_eq!(messages, vec!["200 true", "text/plain", "world"]);
}

#[tokio::test]
async fn fetch_parses_json_bodies() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/echo"))
        .respond_with(ResponseTemplate::new(201).set_body_string("{\"ok\": true}"))
        .mount(&server)
        .await;

    let fetch = FetchModule::new();
    let script = format!(
        r#"
        const response = await fetch("{}/echo", {{
            method: "POST",
            headers: {{"content-type": "application/json"}},
            body: JSON.stringify({{probe: 1}}),
        }});
        const payload = await response.json();
        console.log(response.status, payload.ok);
        "#,
        server.uri()
    );
    let (result, messages) = run_with_console(&script, &[&fetch]).await;
    assert!(result.is_ok());
    assert_eq!(messages, vec!["201 true"]);
}

#[tokio::test]
async fn aborted_fetches_reject_with_abort_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(
            ResponseTemplate::new(200).set_delay(std::time::Duration::from_secs(5)),
        )
        .mount(&server)
        .await;

    let fetch = FetchModule::new();
    let script = format!(
        r#"
        const controller = new AbortController();
        const pending = fetch("{}/slow", {{signal: controller.signal}})
            .then(() => console.log("unreachable"))
            .catch((err) => console.log(err.name, controller.signal.aborted));
        controller.abort();
        await pending;
        "#,
        server.uri()
    );
    let (result, messages) = run_with_console(&script, &[&fetch]).await;
    assert!(result.is_ok());
    assert_eq!(messages, vec!["AbortError true"]);
}

#[tokio::test]
async fn esm_imports_resolve_over_http() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/lib.js"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            "export const value = 7;\nexport function double(x) { return x * 2; }\n",
        ))
        .mount(&server)
        .await;

    let esm = EsmModule::new();
    let script = format!(
        r#"
        import {{ value, double }} from "{}/lib.js";
        console.log(value, double(4));
        "#,
        server.uri()
    );
    let (result, messages) = run_with_console(&script, &[&esm]).await;
    assert!(result.is_ok());
    assert_eq!(messages, vec!["7 8"]);
}

#[tokio::test]
async fn esm_relative_imports_resolve_against_the_importer() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/pkg/a.js"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            "import { base } from \"./b.js\";\nexport const total = base + 1;\n",
        ))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/pkg/b.js"))
        .respond_with(ResponseTemplate::new(200).set_body_string("export const base = 41;\n"))
        .mount(&server)
        .await;

    let esm = EsmModule::new();
    let script = format!(
        r#"
        import {{ total }} from "{}/pkg/a.js";
        console.log(total);
        "#,
        server.uri()
    );
    let (result, messages) = run_with_console(&script, &[&esm]).await;
    assert!(result.is_ok());
    assert_eq!(messages, vec!["42"]);
}

#[tokio::test]
async fn failing_module_fetches_surface_as_guest_errors() {
    let server = MockServer::start().await;
    // No mock mounted: the fetch comes back 404.

    let esm = EsmModule::new();
    let script = format!(
        "import {{ missing }} from \"{}/absent.js\";",
        server.uri()
    );
    let (result, _messages) = run_with_console(&script, &[&esm]).await;
    let err = result.expect_err("missing module");
    let guest = err.guest().expect("guest error");
    assert_eq!(guest.name, "TypeError");
    assert!(guest.message.contains("failed to load module"));
}
