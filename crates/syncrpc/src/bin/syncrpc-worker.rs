//! Demonstration worker with a fixed capability table.

use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use syncrpc::payload;
use syncrpc::{CallError, Callable, Registry, callable_fn};

fn registry() -> Registry {
    Registry::new()
        .with("echo", |_| async { Ok(callable_fn(|x| async move { Ok(x) })) })
        .with("fail", |init: Value| async move {
            let code = init["code"].as_str().unwrap_or("E_FOO").to_string();
            let message = init["message"].as_str().unwrap_or("bad arg").to_string();
            Ok(callable_fn(move |_| {
                let err = CallError::new(code.clone(), message.clone());
                async move { Err(err) }
            }))
        })
        .with("adder", |init: Value| async move {
            let base = init.as_i64().unwrap_or(0);
            Ok(callable_fn(move |x: Value| async move {
                x.as_i64()
                    .map(|x| json!(base + x))
                    .ok_or_else(|| CallError::new("E_TYPE", format!("expected an integer, got {x}")))
            }))
        })
        .with("delay", |_| async {
            Ok(callable_fn(|x: Value| async move {
                let ms = x["ms"].as_u64().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(x["value"].clone())
            }))
        })
        .with("counter", |_| async { Ok(counter()) })
        .with("bytes", |_| async {
            Ok(callable_fn(|x: Value| async move {
                match (&x, payload::as_bytes(&x)) {
                    (_, Some(raw)) => Ok(payload::bytes(raw)),
                    (Value::String(s), None) => Ok(payload::bytes(s.as_bytes())),
                    _ => Err(CallError::new("E_TYPE", "expected a string or bytes")),
                }
            }))
        })
        .with("broken", |_| async {
            Err::<Arc<dyn Callable>, _>(CallError::new("E_BROKEN", "constructor failed"))
        })
        .with("panic", |_| async {
            Ok(callable_fn(|x: Value| async move {
                if x.is_null() {
                    panic!("panic requested");
                }
                Ok(x)
            }))
        })
        .with("exit", |_| async {
            Ok(callable_fn(|x: Value| async move {
                let code = x.as_i64().unwrap_or(3) as i32;
                tracing::warn!(code, "Exiting on request");
                std::process::exit(code);
            }))
        })
}

/// Numbers calls in arrival order: returns `{"seq": n, "arg": <argument>}`.
fn counter() -> Arc<dyn Callable> {
    let next = Arc::new(AtomicU64::new(0));
    callable_fn(move |x: Value| {
        let seq = next.fetch_add(1, Ordering::SeqCst);
        async move { Ok(json!({"seq": seq, "arg": x})) }
    })
}

fn main() -> ExitCode {
    syncrpc::entrypoint::main(registry())
}
