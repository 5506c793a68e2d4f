//! Watchdog attributes for tests.
//!
//! `#[timeout]` wraps a synchronous test, `#[tokio_timeout_test]` an async one. Both accept an
//! optional limit in seconds (`#[timeout(5)]` or `secs = 5`); the async form also accepts `paused`
//! to start the Tokio clock paused.

use proc_macro::TokenStream;
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::{parse_macro_input, Attribute, Ident, ItemFn, LitInt, Token};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

struct WatchdogArgs {
    secs: u64,
    paused: bool,
}

impl Parse for WatchdogArgs {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let mut args = WatchdogArgs {
            secs: DEFAULT_TIMEOUT_SECS,
            paused: false,
        };
        while !input.is_empty() {
            if input.peek(LitInt) {
                args.secs = parse_secs(&input.parse()?)?;
            } else {
                let ident: Ident = input.parse()?;
                match ident.to_string().as_str() {
                    "paused" => args.paused = true,
                    "secs" => {
                        input.parse::<Token![=]>()?;
                        args.secs = parse_secs(&input.parse()?)?;
                    }
                    other => {
                        return Err(syn::Error::new(
                            ident.span(),
                            format!("unknown option `{other}`; expected `secs = N` or `paused`"),
                        ))
                    }
                }
            }
            if !input.is_empty() {
                input.parse::<Token![,]>()?;
            }
        }
        Ok(args)
    }
}

fn parse_secs(lit: &LitInt) -> syn::Result<u64> {
    let secs: u64 = lit.base10_parse()?;
    if secs == 0 {
        return Err(syn::Error::new(lit.span(), "timeout must be greater than zero"));
    }
    Ok(secs)
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as WatchdogArgs);
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }
    sig.asyncness = None;

    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_tokio_test_attribute(attr))
        .collect();
    let timeout = args.secs;
    let paused = args.paused;

    let clock = if paused {
        quote! { .start_paused(true) }
    } else {
        quote! {}
    };
    // Paused clocks auto-advance through sleeps; only the wall-clock watchdog guards them.
    let body = if paused {
        quote! { async move #block .await; }
    } else {
        quote! {
            tokio::time::timeout(timeout_duration, async move #block)
                .await
                .expect("test timed out");
        }
    };

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let timeout_duration = std::time::Duration::from_secs(#timeout);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    let runtime = tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        #clock
                        .build()
                        .expect("failed to build Tokio runtime");
                    runtime.block_on(async {
                        #body
                    });
                }));
                let _ = sender.send(result);
            });
            wait_for_test(receiver, timeout_duration);

            fn wait_for_test(
                receiver: std::sync::mpsc::Receiver<std::thread::Result<()>>,
                timeout_duration: std::time::Duration,
            ) {
                match receiver.recv_timeout(timeout_duration) {
                    Ok(Ok(())) => {}
                    Ok(Err(payload)) => std::panic::resume_unwind(payload),
                    Err(std::sync::mpsc::RecvTimeoutError::Timeout) => panic!("test timed out"),
                    Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                        panic!("test thread failed before reporting result")
                    }
                }
            }
        }
    })
}

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as WatchdogArgs);
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &sig.ident,
            "timeout attribute expects a synchronous test function; use tokio_timeout_test",
        )
        .to_compile_error()
        .into();
    }
    if args.paused {
        return syn::Error::new_spanned(
            &sig.ident,
            "`paused` only applies to tokio_timeout_test",
        )
        .to_compile_error()
        .into();
    }

    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_plain_test_attribute(attr))
        .collect();
    let timeout = args.secs;

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let timeout_duration = std::time::Duration::from_secs(#timeout);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| #block));
                let _ = sender.send(result);
            });
            match receiver.recv_timeout(timeout_duration) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => panic!("test timed out"),
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread failed before reporting result")
                }
            }
        }
    })
}

fn is_tokio_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    matches!(
        (segments.next(), segments.next(), segments.next()),
        (Some(first), Some(second), None)
            if first.ident == "tokio" && second.ident == "test"
    )
}

fn is_plain_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    matches!((segments.next(), segments.next()), (Some(first), None) if first.ident == "test")
}
