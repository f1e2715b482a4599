#![warn(clippy::pedantic)]

extern crate proc_macro;

use proc_macro2::TokenStream;
use quote::quote;
use syn::{ItemFn, LitStr, Stmt, meta::ParseNestedMeta, parse_macro_input, parse_quote};

/// Unit the elapsed time is reported in on exit
#[derive(Clone, Copy, PartialEq, Eq)]
enum Unit {
    Nanos,
    Micros,
    Millis,
    Seconds,
}

impl Unit {
    fn parse(name: &LitStr) -> syn::Result<Self> {
        match name.value().as_str() {
            "ns" | "nano" | "nanos" | "nanoseconds" => Ok(Self::Nanos),
            "us" | "micro" | "micros" | "microseconds" => Ok(Self::Micros),
            "ms" | "milli" | "millis" | "milliseconds" => Ok(Self::Millis),
            "s" | "sec" | "secs" | "seconds" => Ok(Self::Seconds),
            other => Err(syn::Error::new(
                name.span(),
                format!("unknown precision `{other}`, expected one of ns, us, ms, s"),
            )),
        }
    }

    fn elapsed(self) -> (TokenStream, &'static str) {
        match self {
            Self::Nanos => (quote!(as_nanos), "ns"),
            Self::Micros => (quote!(as_micros), "us"),
            Self::Millis => (quote!(as_millis), "ms"),
            Self::Seconds => (quote!(as_secs), "s"),
        }
    }
}

#[derive(Default)]
struct Attributes {
    timing: Option<Unit>,
    instrument: Option<TokenStream>,
}

impl Attributes {
    fn parse(&mut self, meta: &ParseNestedMeta) -> syn::Result<()> {
        if meta.path.is_ident("instrument") {
            if self.instrument.is_some() {
                return Err(meta.error("expected only a single `instrument` argument"));
            }
            let args = if meta.input.peek(syn::token::Paren) {
                let content;
                syn::parenthesized!(content in meta.input);
                content.parse()?
            } else {
                TokenStream::new()
            };
            self.instrument = Some(args);
            Ok(())
        } else if meta.path.is_ident("timing") {
            if self.timing.is_some() {
                return Err(meta.error("expected only a single `timing` argument"));
            }
            let mut unit = Unit::Nanos;
            if meta.input.peek(syn::token::Paren) {
                meta.parse_nested_meta(|nested| {
                    if nested.path.is_ident("precision") {
                        unit = Unit::parse(&nested.value()?.parse::<LitStr>()?)?;
                        Ok(())
                    } else {
                        Err(nested.error("expected `precision = \"...\"`"))
                    }
                })?;
            }
            self.timing = Some(unit);
            Ok(())
        } else {
            Err(meta.error("expected `instrument(...)` or `timing(...)`"))
        }
    }
}

/// Adds `tracing::trace!` events at the start and end of an attributed function.
///
/// `instrument(...)` forwards its arguments to `#[tracing::instrument]`, and
/// `timing(precision = "ms")` appends the elapsed time to the exit event.
/// The exit event fires when the function body is left by any path,
/// including an early return, a `?`, or the future being dropped.
#[proc_macro_attribute]
pub fn traced(
    args: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    let mut attributes = Attributes::default();
    let parser = syn::meta::parser(|meta| attributes.parse(&meta));
    parse_macro_input!(args with parser);

    let mut function = parse_macro_input!(item as ItemFn);

    if let Some(args) = attributes.instrument {
        function
            .attrs
            .push(parse_quote!(#[tracing::instrument(#args)]));
    }

    let name = function.sig.ident.to_string();
    let on_exit = match attributes.timing {
        None => quote!(tracing::trace!("OnExit: {}", self.0)),
        Some(unit) => {
            let (method, suffix) = unit.elapsed();
            quote!(tracing::trace!(
                "OnExit: {} ({} {} elapsed)",
                self.0,
                self.1.elapsed().#method(),
                #suffix
            ))
        }
    };

    let guard: Stmt = parse_quote! {
        let __traced_guard = {
            #[allow(dead_code)]
            struct __TracedGuard(&'static str, ::std::time::Instant);

            impl ::core::ops::Drop for __TracedGuard {
                fn drop(&mut self) {
                    #on_exit;
                }
            }

            tracing::trace!("OnEnter: {}", #name);
            __TracedGuard(#name, ::std::time::Instant::now())
        };
    };
    function.block.stmts.insert(0, guard);

    proc_macro::TokenStream::from(quote!(#function))
}
