//! End-to-end tests for one VM: module evaluation, the bridge, the
//! event loop, and the host-backed effect surface. Nothing here
//! touches the network; fetch paths are exercised only up to the
//! quota and SSRF rejections, which are decided host-side before any
//! dispatch.

use std::sync::Arc;
use std::time::{Duration, Instant};

use hornet_bindings::memory::MemoryKv;
use hornet_bindings::{Environment, KvStore, LogLevel};
use hornet_fetch::{FetchPolicy, OutboundClient};
use hornet_vm::{AwaitOutcome, InvokeStatus, RequestState, VmError, VmHost, WsMessage};

const ECHO_MODULE: &str = r#"
export default {
    fetch(request, env, ctx) {
        return new Response('ok', { status: 200 });
    },
    boom() {
        throw new Error('boom');
    },
    add(a, b) {
        return a + b;
    },
};
"#;

fn outbound(policy: FetchPolicy) -> Arc<OutboundClient> {
    Arc::new(OutboundClient::new(policy).expect("outbound client"))
}

fn vm(source: &str) -> VmHost {
    VmHost::new(source, 64 * 1024 * 1024, outbound(FetchPolicy::permissive())).expect("vm")
}

fn in_two_seconds() -> Instant {
    Instant::now() + Duration::from_secs(2)
}

fn state_with_env(vm: &VmHost, max_outbound: usize, env: Environment) -> Arc<RequestState> {
    let state = RequestState::new(max_outbound, Arc::new(env));
    vm.begin_request(state.clone()).expect("begin request");
    state
}

/// Drive the loop until a string global becomes set or time runs out.
fn wait_for_global(vm: &VmHost, name: &str, deadline: Instant) -> Option<String> {
    loop {
        vm.pump_microtasks();
        if let Ok(Some(value)) = vm.global_string(name) {
            return Some(value);
        }
        if Instant::now() >= deadline {
            return None;
        }
        vm.drain(Instant::now() + Duration::from_millis(5)).ok()?;
    }
}

#[test]
fn module_evaluation_binds_default_export() {
    let vm = vm(ECHO_MODULE);
    let bound = vm
        .eval("if (typeof __worker_module__.fetch !== 'function') throw new Error('missing');")
        .is_ok();
    assert!(bound);
}

#[test]
fn parse_error_is_a_compile_error() {
    let result = VmHost::new(
        "export default {",
        64 * 1024 * 1024,
        outbound(FetchPolicy::permissive()),
    );
    assert!(matches!(result, Err(VmError::Compile(_))));
}

#[test]
fn top_level_throw_is_a_compile_error() {
    let result = VmHost::new(
        "throw new Error('bad module'); export default {};",
        64 * 1024 * 1024,
        outbound(FetchPolicy::permissive()),
    );
    match result {
        Err(VmError::Compile(message)) => assert!(message.contains("bad module"), "{message}"),
        other => panic!("expected compile error, got {other:?}", other = other.err()),
    }
}

#[test]
fn invoke_reports_missing_handler() {
    let vm = vm(ECHO_MODULE);
    let status = vm.invoke_handler("scheduled", &[]).unwrap();
    assert_eq!(status, InvokeStatus::Missing);
}

#[test]
fn invoke_reports_sync_throw() {
    let vm = vm(ECHO_MODULE);
    match vm.invoke_handler("boom", &[]).unwrap() {
        InvokeStatus::Threw(reason) => assert!(reason.contains("boom"), "{reason}"),
        other => panic!("expected throw, got {other:?}"),
    }
}

#[test]
fn await_value_is_identity_on_non_promise() {
    let vm = vm(ECHO_MODULE);
    vm.eval("globalThis.__x = 41;").unwrap();
    let outcome = vm.await_value("__x", in_two_seconds()).unwrap();
    assert_eq!(outcome, AwaitOutcome::Fulfilled);
    assert_eq!(vm.json_global("__x").unwrap(), "41");
}

#[test]
fn await_value_resolves_timer_backed_promise() {
    let vm = vm(ECHO_MODULE);
    vm.eval(
        "globalThis.__p = new Promise(function (resolve) { setTimeout(function () { resolve('after-timeout'); }, 10); });",
    )
    .unwrap();
    let outcome = vm.await_value("__p", in_two_seconds()).unwrap();
    assert_eq!(outcome, AwaitOutcome::Fulfilled);
    assert_eq!(vm.json_global("__p").unwrap(), "\"after-timeout\"");
}

#[test]
fn await_value_surfaces_rejection_reason() {
    let vm = vm(ECHO_MODULE);
    vm.eval("globalThis.__p = Promise.reject(new Error('nope'));")
        .unwrap();
    match vm.await_value("__p", in_two_seconds()).unwrap() {
        AwaitOutcome::Rejected(reason) => assert!(reason.contains("nope"), "{reason}"),
        other => panic!("expected rejection, got {other:?}"),
    }
}

#[test]
fn await_value_times_out_on_forever_pending_promise() {
    let vm = vm(ECHO_MODULE);
    vm.eval("globalThis.__p = new Promise(function () {});").unwrap();
    let err = vm
        .await_value("__p", Instant::now() + Duration::from_millis(50))
        .unwrap_err();
    assert!(matches!(err, VmError::Deadline));
}

#[test]
fn timers_fire_in_deadline_order() {
    let vm = vm(ECHO_MODULE);
    vm.eval(
        "globalThis.__order = []; setTimeout(function () { __order.push('late'); }, 25); setTimeout(function () { __order.push('early'); }, 5);",
    )
    .unwrap();
    vm.drain(Instant::now() + Duration::from_millis(100)).unwrap();
    assert_eq!(vm.json_global("__order").unwrap(), r#"["early","late"]"#);
}

#[test]
fn cleared_timer_never_fires() {
    let vm = vm(ECHO_MODULE);
    vm.eval(
        "globalThis.__fired = false; var id = setTimeout(function () { __fired = true; }, 5); clearTimeout(id);",
    )
    .unwrap();
    vm.drain(Instant::now() + Duration::from_millis(40)).unwrap();
    assert_eq!(vm.json_global("__fired").unwrap(), "false");
    assert!(!vm.event_loop().has_pending());
}

#[test]
fn interval_repeats_until_cleared() {
    let vm = vm(ECHO_MODULE);
    vm.eval(
        "globalThis.__count = 0; var id = setInterval(function () { __count++; if (__count >= 3) clearInterval(id); }, 1);",
    )
    .unwrap();
    // The 1ms interval clamps to 10ms, so three firings need ~30ms.
    vm.drain(Instant::now() + Duration::from_millis(500)).unwrap();
    assert_eq!(vm.json_global("__count").unwrap(), "3");
}

#[test]
fn console_lines_land_in_request_state() {
    let vm = vm(ECHO_MODULE);
    let state = state_with_env(&vm, 4, Environment::new());
    vm.eval("console.log('hello', 42); console.error('bad');").unwrap();
    vm.end_request();
    let logs = state.take_logs();
    assert_eq!(logs.len(), 2);
    assert_eq!(logs[0].message, "hello 42");
    assert_eq!(logs[1].level, LogLevel::Error);
}

#[test]
fn fetch_quota_rejection_names_the_limit() {
    let vm = vm(ECHO_MODULE);
    let _state = state_with_env(&vm, 0, Environment::new());
    vm.eval(
        "globalThis.__err = undefined; fetch('http://example.com/').catch(function (e) { globalThis.__err = String(e); });",
    )
    .unwrap();
    vm.pump_microtasks();
    let err = vm.global_string("__err").unwrap().unwrap();
    assert!(err.contains("exceeded maximum fetch requests"), "{err}");
    vm.end_request();
}

#[test]
fn ssrf_precheck_rejects_before_dispatch() {
    let vm = VmHost::new(
        ECHO_MODULE,
        64 * 1024 * 1024,
        outbound(FetchPolicy::default()),
    )
    .unwrap();
    let state = state_with_env(&vm, 4, Environment::new());
    for (url, expect) in [
        ("http://127.0.0.1/", true),
        ("http://[fc00::1]/", true),
    ] {
        vm.eval(&format!(
            "globalThis.__err = undefined; fetch('{url}').catch(function (e) {{ globalThis.__err = String(e); }});"
        ))
        .unwrap();
        vm.pump_microtasks();
        let err = vm.global_string("__err").unwrap().unwrap();
        assert_eq!(err.contains("private IP"), expect, "{url}: {err}");
    }
    // Blocked fetches still consumed quota.
    assert_eq!(state.outbound_count(), 2);
    vm.end_request();
}

#[test]
fn pre_aborted_signal_short_circuits() {
    let vm = vm(ECHO_MODULE);
    let _state = state_with_env(&vm, 4, Environment::new());
    vm.eval(
        "globalThis.__err = undefined; var c = new AbortController(); c.abort(); fetch('http://example.com/', { signal: c.signal }).catch(function (e) { globalThis.__err = e.name; });",
    )
    .unwrap();
    vm.pump_microtasks();
    assert_eq!(
        vm.global_string("__err").unwrap().as_deref(),
        Some("AbortError")
    );
    vm.end_request();
}

#[test]
fn subtle_digest_produces_sha256() {
    let vm = vm(ECHO_MODULE);
    vm.eval(
        "crypto.subtle.digest('SHA-256', new TextEncoder().encode('abc')).then(function (buf) { globalThis.__len = new Uint8Array(buf).length; });",
    )
    .unwrap();
    vm.pump_microtasks();
    assert_eq!(vm.json_global("__len").unwrap(), "32");
}

#[test]
fn digest_stream_matches_one_shot() {
    let vm = vm(ECHO_MODULE);
    let _state = state_with_env(&vm, 4, Environment::new());
    vm.eval(
        r#"
        var stream = new crypto.DigestStream('SHA-256');
        stream.write(new TextEncoder().encode('hello '));
        stream.write(new TextEncoder().encode('world'));
        stream.close();
        Promise.all([
            stream.digest,
            crypto.subtle.digest('SHA-256', new TextEncoder().encode('hello world')),
        ]).then(function (pair) {
            var a = new Uint8Array(pair[0]);
            var b = new Uint8Array(pair[1]);
            var same = a.length === b.length;
            for (var i = 0; i < a.length; i++) same = same && a[i] === b[i];
            globalThis.__same = same;
        });
        "#,
    )
    .unwrap();
    vm.pump_microtasks();
    assert_eq!(vm.json_global("__same").unwrap(), "true");
    vm.end_request();
}

#[test]
fn compression_round_trips_in_js() {
    let vm = vm(ECHO_MODULE);
    vm.eval(
        r#"
        var input = 'squeeze me squeeze me squeeze me';
        var packed = __compress('gzip', input);
        var unpacked = __decompress('gzip', packed);
        globalThis.__same = new TextDecoder().decode(unpacked) === input;
        "#,
    )
    .unwrap();
    assert_eq!(vm.json_global("__same").unwrap(), "true");
}

#[test]
fn encoding_round_trips() {
    let vm = vm(ECHO_MODULE);
    vm.eval(
        r#"
        var text = 'héllo ✓ 𝄞';
        globalThis.__utf8 = new TextDecoder().decode(new TextEncoder().encode(text)) === text;
        globalThis.__b64 = atob(btoa('plain ascii')) === 'plain ascii';
        "#,
    )
    .unwrap();
    assert_eq!(vm.json_global("__utf8").unwrap(), "true");
    assert_eq!(vm.json_global("__b64").unwrap(), "true");
}

#[test]
fn url_parsing_is_host_backed() {
    let vm = vm(ECHO_MODULE);
    vm.eval(
        r#"
        var u = new URL('https://example.com:8443/a/b?x=1&y=2#frag');
        globalThis.__facts = [u.protocol, u.hostname, u.port, u.pathname, u.searchParams.get('y'), u.hash];
        globalThis.__rel = new URL('/next', 'http://example.com/prev').href;
        "#,
    )
    .unwrap();
    assert_eq!(
        vm.json_global("__facts").unwrap(),
        r##"["https:","example.com","8443","/a/b","2","#frag"]"##
    );
    assert_eq!(vm.json_global("__rel").unwrap(), "\"http://example.com/next\"");
}

#[test]
fn websocket_pair_queues_server_messages() {
    let vm = vm(ECHO_MODULE);
    let state = state_with_env(&vm, 4, Environment::new());
    vm.eval(
        r#"
        var pair = new WebSocketPair();
        pair[1].accept();
        pair[1].send('outbound');
        globalThis.__pair = pair[1].__pairId;
        "#,
    )
    .unwrap();
    let pair: u64 = vm.json_global("__pair").unwrap().parse().unwrap();
    assert!(state.ws_pair_accepted(pair));
    assert_eq!(
        state.take_ws_outgoing(pair),
        vec![WsMessage::Text("outbound".to_string())]
    );
    vm.end_request();
}

#[test]
fn websocket_message_dispatch_reaches_listeners() {
    let vm = vm(ECHO_MODULE);
    let _state = state_with_env(&vm, 4, Environment::new());
    vm.eval(
        r#"
        var pair = new WebSocketPair();
        pair[1].accept();
        pair[1].addEventListener('message', function (event) { globalThis.__got = event.data; });
        globalThis.__pair = pair[1].__pairId;
        "#,
    )
    .unwrap();
    let pair = vm.json_global("__pair").unwrap();
    vm.eval(&format!("__ws_dispatch_message({pair}, 'inbound', false);"))
        .unwrap();
    assert_eq!(vm.json_global("__got").unwrap(), "\"inbound\"");
    vm.end_request();
}

#[test]
fn kv_binding_round_trips_through_pending_io() {
    let kv = Arc::new(MemoryKv::new());
    let vm = vm(ECHO_MODULE);
    let _state = state_with_env(
        &vm,
        4,
        Environment::new().with_kv("STORE", kv.clone()),
    );
    vm.eval(
        r#"
        var env = __makeEnv(JSON.stringify({
            vars: {}, secrets: {}, kv: ['STORE'], d1: [], queues: [], storage: [],
            durableObjects: [], services: [], hasAssets: false, hasCache: false, siteId: 's',
        }));
        env.STORE.put('greeting', 'hello').then(function () {
            return env.STORE.get('greeting');
        }).then(function (value) {
            globalThis.__value = value;
        }).catch(function (e) {
            globalThis.__value = 'error: ' + String(e);
        });
        "#,
    )
    .unwrap();
    let value = wait_for_global(&vm, "__value", in_two_seconds()).expect("binding completion");
    assert_eq!(value, "hello");
    assert_eq!(kv.get("greeting").unwrap().as_deref(), Some("hello"));
    vm.end_request();
}

#[test]
fn ready_io_is_delivered_before_later_timers() {
    let kv = Arc::new(MemoryKv::new());
    kv.put("k", "v".to_string(), None).unwrap();
    let vm = vm(ECHO_MODULE);
    let _state = state_with_env(
        &vm,
        4,
        Environment::new().with_kv("STORE", kv),
    );
    vm.eval(
        r#"
        globalThis.__order = [];
        var env = __makeEnv(JSON.stringify({
            vars: {}, secrets: {}, kv: ['STORE'], d1: [], queues: [], storage: [],
            durableObjects: [], services: [], hasAssets: false, hasCache: false, siteId: 's',
        }));
        setTimeout(function () { __order.push('timer'); }, 40);
        env.STORE.get('k').then(function () { __order.push('io'); });
        "#,
    )
    .unwrap();
    vm.drain(Instant::now() + Duration::from_millis(200)).unwrap();
    assert_eq!(vm.json_global("__order").unwrap(), r#"["io","timer"]"#);
    vm.end_request();
}

#[test]
fn wait_until_drain_reports_rejections() {
    let vm = vm(ECHO_MODULE);
    vm.eval(
        r#"
        var ctx = __makeCtx();
        ctx.waitUntil(new Promise(function (resolve) { setTimeout(resolve, 5); }));
        ctx.waitUntil(Promise.reject(new Error('background failed')));
        "#,
    )
    .unwrap();
    let rejections = vm.drain_wait_until(in_two_seconds()).unwrap();
    assert_eq!(rejections.len(), 1);
    assert!(rejections[0].contains("background failed"));
}

#[test]
fn reset_restores_a_reusable_vm() {
    let vm = vm(ECHO_MODULE);
    let _state = state_with_env(&vm, 4, Environment::new());
    vm.eval("setTimeout(function () {}, 60000); globalThis.__call_result = 1;")
        .unwrap();
    vm.end_request();
    vm.reset().unwrap();
    assert!(!vm.event_loop().has_pending());
    assert_eq!(vm.json_global("__call_result").unwrap(), "null");
    // The module binding survives and handlers still invoke.
    assert_eq!(vm.invoke_handler("fetch", &[]).unwrap(), InvokeStatus::Ok);
}

#[test]
fn module_top_level_state_persists_across_resets() {
    let vm = vm("let counter = 0;\nexport default { count() { counter += 1; return counter; } };");
    assert_eq!(vm.invoke_handler("count", &[]).unwrap(), InvokeStatus::Ok);
    assert_eq!(vm.json_global("__call_result").unwrap(), "1");
    vm.reset().unwrap();
    assert_eq!(vm.invoke_handler("count", &[]).unwrap(), InvokeStatus::Ok);
    assert_eq!(vm.json_global("__call_result").unwrap(), "2");
}

#[test]
fn interrupt_aborts_hot_loop() {
    let vm = vm(ECHO_MODULE);
    let handle = vm.interrupt_handle();
    let arm = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        handle.interrupt();
    });
    let started = Instant::now();
    let err = vm.eval("for (;;) {}").unwrap_err();
    arm.join().unwrap();
    assert!(matches!(err, VmError::Interrupted));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn function_arguments_pass_through_globals() {
    let vm = vm(ECHO_MODULE);
    vm.set_json_global("__fn_arg_0", "2").unwrap();
    vm.set_json_global("__fn_arg_1", "40").unwrap();
    let status = vm
        .invoke_handler("add", &["__fn_arg_0", "__fn_arg_1"])
        .unwrap();
    assert_eq!(status, InvokeStatus::Ok);
    assert_eq!(vm.json_global("__call_result").unwrap(), "42");
}
