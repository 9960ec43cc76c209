//! Test attributes with a wall-clock deadline.
//!
//! `#[timeout]` wraps a synchronous test, `#[tokio_timeout_test]` wraps an
//! async one and builds its runtime. Both run the body on a helper thread and
//! panic with "test timed out" once the deadline passes.
//!
//! Arguments (all optional, any order):
//! - an integer number of seconds (default 30),
//! - `multi_thread`, async only, selects a two-worker multi-thread runtime
//!   instead of the current-thread one.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::{parse_macro_input, Attribute, Ident, ItemFn, LitInt, Token};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

struct TimeoutArgs {
    secs: u64,
    multi_thread: bool,
}

impl Parse for TimeoutArgs {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let mut args = TimeoutArgs {
            secs: DEFAULT_TIMEOUT_SECS,
            multi_thread: false,
        };
        while !input.is_empty() {
            if input.peek(LitInt) {
                let lit: LitInt = input.parse()?;
                args.secs = lit.base10_parse()?;
                if args.secs == 0 {
                    return Err(syn::Error::new_spanned(lit, "timeout must be greater than zero"));
                }
            } else {
                let ident: Ident = input.parse()?;
                if ident != "multi_thread" {
                    return Err(syn::Error::new_spanned(
                        ident,
                        "expected a timeout in seconds or `multi_thread`",
                    ));
                }
                args.multi_thread = true;
            }
            if !input.is_empty() {
                input.parse::<Token![,]>()?;
            }
        }
        Ok(args)
    }
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as TimeoutArgs);
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(&sig.ident, "tokio_timeout_test expects an async fn")
            .to_compile_error()
            .into();
    }
    sig.asyncness = None;

    let builder = if args.multi_thread {
        quote! { tokio::runtime::Builder::new_multi_thread().worker_threads(2) }
    } else {
        quote! { tokio::runtime::Builder::new_current_thread() }
    };
    let body = quote! {
        let runtime = #builder
            .enable_all()
            .build()
            .expect("failed to build Tokio runtime");
        runtime.block_on(async {
            tokio::time::timeout(timeout_duration, async move #block)
                .await
                .expect("test timed out");
        });
    };

    let attrs = strip_test_attributes(attrs);
    wrap(args.secs, &attrs, quote! { #vis #sig }, body).into()
}

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as TimeoutArgs);
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_some() {
        return syn::Error::new_spanned(&sig.ident, "use tokio_timeout_test for async tests")
            .to_compile_error()
            .into();
    }
    if args.multi_thread {
        return syn::Error::new_spanned(&sig.ident, "`multi_thread` only applies to async tests")
            .to_compile_error()
            .into();
    }

    let attrs = strip_test_attributes(attrs);
    wrap(args.secs, &attrs, quote! { #vis #sig }, quote! { #block; }).into()
}

/// Emits the `#[test]` fn that runs `body` on a helper thread and waits for it
/// up to `secs`.
fn wrap(secs: u64, attrs: &[Attribute], signature: TokenStream2, body: TokenStream2) -> TokenStream2 {
    quote! {
        #[test]
        #(#attrs)*
        #signature {
            let timeout_duration = std::time::Duration::from_secs(#secs);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    #body
                }));
                let _ = sender.send(outcome);
            });
            match receiver.recv_timeout(timeout_duration) {
                Ok(Ok(())) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => panic!("test timed out"),
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread exited without reporting a result")
                }
            }
        }
    }
}

/// Drops `#[test]` and `#[tokio::test]` so the generated fn is registered once.
fn strip_test_attributes(attrs: Vec<Attribute>) -> Vec<Attribute> {
    attrs
        .into_iter()
        .filter(|attr| {
            let path = attr.path();
            let names: Vec<String> = path.segments.iter().map(|s| s.ident.to_string()).collect();
            !matches!(names.as_slice(), [one] if one == "test")
                && !matches!(names.as_slice(), [a, b] if a == "tokio" && b == "test")
        })
        .collect()
}
