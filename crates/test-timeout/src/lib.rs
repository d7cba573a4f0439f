//! Test attributes that abort hung tests instead of letting the whole
//! suite stall. `#[tokio_timeout_test]` drives an async body on a fresh
//! current-thread runtime under `tokio::time::timeout`; `#[timeout]` wraps
//! a synchronous body in a watchdog thread.

use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, ItemFn, LitInt};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

fn parse_timeout_secs(attr: TokenStream) -> u64 {
    if attr.is_empty() {
        return DEFAULT_TIMEOUT_SECS;
    }
    let lit = syn::parse::<LitInt>(attr).expect("timeout must be an integer literal of seconds");
    let secs: u64 = lit.base10_parse().expect("timeout must fit in u64");
    assert!(secs > 0, "timeout must be greater than zero");
    secs
}

/// Replaces `#[tokio::test]` for tests that must never hang: the async body
/// runs under a hard deadline and panics with a clear message when it is
/// exceeded.
#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let secs = parse_timeout_secs(attr);
    let function = parse_macro_input!(item as ItemFn);

    if function.sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &function.sig.ident,
            "tokio_timeout_test requires an async function",
        )
        .to_compile_error()
        .into();
    }

    let mut sig = function.sig.clone();
    sig.asyncness = None;
    let attrs = &function.attrs;
    let vis = &function.vis;
    let block = &function.block;

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let deadline = std::time::Duration::from_secs(#secs);
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to build tokio runtime for test");
            runtime.block_on(async {
                if tokio::time::timeout(deadline, async move #block).await.is_err() {
                    panic!("test exceeded {}s timeout", #secs);
                }
            });
        }
    })
}

/// Watchdog wrapper for synchronous tests. The body runs on a helper thread
/// so a hang is reported as a timeout panic rather than a stuck process.
#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let secs = parse_timeout_secs(attr);
    let function = parse_macro_input!(item as ItemFn);

    if function.sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &function.sig.ident,
            "timeout expects a synchronous function; use tokio_timeout_test for async",
        )
        .to_compile_error()
        .into();
    }

    let sig = &function.sig;
    let attrs = &function.attrs;
    let vis = &function.vis;
    let block = &function.block;

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let deadline = std::time::Duration::from_secs(#secs);
            let (done_tx, done_rx) = std::sync::mpsc::channel();
            let worker = std::thread::spawn(move || {
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| #block));
                let _ = done_tx.send(outcome);
            });
            match done_rx.recv_timeout(deadline) {
                Ok(Ok(())) => {
                    let _ = worker.join();
                }
                Ok(Err(panic_payload)) => std::panic::resume_unwind(panic_payload),
                Err(_) => panic!("test exceeded {}s timeout", #secs),
            }
        }
    })
}
