//! `#[traced]`: wraps a function so that entering and leaving it is traced,
//! optionally with the elapsed time and a `tracing::instrument` span.
//!
//! ```ignore
//! #[traced(instrument(level = tracing::Level::DEBUG, skip(self)), timing(precision = "ms"))]
//! async fn attempt(&self, mail: &Mail) -> Result<(), SendError> { .. }
//! ```

extern crate proc_macro;

use proc_macro2::TokenStream;
use quote::{ToTokens, quote, quote_spanned};
use syn::{ItemFn, Stmt, parse::Parse, parse_macro_input, parse_quote};

#[derive(PartialEq, Eq, Clone, Copy, Default)]
enum Unit {
    #[default]
    Nanos,
    Micros,
    Millis,
    Seconds,
}

impl Unit {
    /// Expression of type `fn(Duration) -> String` rendering the elapsed time.
    fn formatter(self) -> syn::Expr {
        match self {
            Self::Nanos => parse_quote!(|d: std::time::Duration| format!("{}ns", d.as_nanos())),
            Self::Micros => parse_quote!(|d: std::time::Duration| format!("{}us", d.as_micros())),
            Self::Millis => parse_quote!(|d: std::time::Duration| format!("{}ms", d.as_millis())),
            Self::Seconds => {
                parse_quote!(|d: std::time::Duration| format!("{:.3}s", d.as_secs_f64()))
            }
        }
    }
}

impl TryFrom<&str> for Unit {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "ns" | "nanos" => Ok(Self::Nanos),
            "us" | "micros" => Ok(Self::Micros),
            "ms" | "millis" => Ok(Self::Millis),
            "s" | "secs" => Ok(Self::Seconds),
            other => Err(format!("unknown precision `{other}`")),
        }
    }
}

impl Parse for Unit {
    fn parse(input: syn::parse::ParseStream) -> syn::Result<Self> {
        if !input.peek(syn::token::Paren) {
            return Ok(Self::default());
        }

        let content;
        let _ = syn::parenthesized!(content in input);
        let _ = content.parse::<kw::precision>()?;
        let _ = content.parse::<syn::Token![=]>()?;
        let literal = content.parse::<syn::LitStr>()?;

        Self::try_from(literal.value().as_str())
            .map_err(|message| syn::Error::new(literal.span(), message))
    }
}

mod kw {
    syn::custom_keyword!(timing);
    syn::custom_keyword!(precision);
    syn::custom_keyword!(instrument);
}

#[derive(Default)]
struct Options {
    timing: Option<Unit>,
    instrument: Option<TokenStream>,
    unrecognised: Vec<syn::Error>,
}

impl Options {
    fn diagnostics(&self) -> TokenStream {
        let warnings = self.unrecognised.iter().map(|err| {
            let note = syn::LitStr::new(&format!("ignored input to #[traced]: {err}"), err.span());

            quote_spanned! {err.span()=>
                #[warn(deprecated)]
                {
                    #[deprecated(note = #note)]
                    const TRACED_IGNORED_INPUT: () = ();
                    let () = TRACED_IGNORED_INPUT;
                }
            }
        });

        quote! { #(#warnings)* }
    }
}

impl Parse for Options {
    fn parse(input: syn::parse::ParseStream) -> syn::Result<Self> {
        let mut options = Self::default();

        while !input.is_empty() {
            let lookahead = input.lookahead1();
            if lookahead.peek(kw::timing) {
                if options.timing.is_some() {
                    return Err(input.error("`timing` given more than once"));
                }
                let _ = input.parse::<kw::timing>()?;
                options.timing = Some(input.parse()?);
            } else if lookahead.peek(kw::instrument) {
                if options.instrument.is_some() {
                    return Err(input.error("`instrument` given more than once"));
                }
                let _ = input.parse::<kw::instrument>()?;
                let fields = if input.peek(syn::token::Paren) {
                    let content;
                    let _ = syn::parenthesized!(content in input);
                    content.parse()?
                } else {
                    TokenStream::new()
                };
                options.instrument = Some(fields);
            } else if lookahead.peek(syn::Token![,]) {
                let _ = input.parse::<syn::Token![,]>()?;
            } else {
                options.unrecognised.push(lookahead.error());
                let _ = input.parse::<proc_macro2::TokenTree>();
            }
        }

        Ok(options)
    }
}

/// Emits `tracing::trace!` events when the attributed function is entered and
/// when its body is dropped, optionally with the elapsed time.
///
/// Accepts `instrument(...)`, forwarded verbatim to `#[tracing::instrument]`,
/// and `timing(precision = "ns" | "us" | "ms" | "s")`.
#[proc_macro_attribute]
pub fn traced(
    args: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    let options = parse_macro_input!(args as Options);
    let mut function = parse_macro_input!(item as ItemFn);
    let diagnostics = options.diagnostics();

    function
        .attrs
        .push(parse_quote! { #[allow(clippy::items_after_statements)] });

    if let Some(fields) = options.instrument.as_ref() {
        let fields = fields.to_token_stream();
        function
            .attrs
            .push(parse_quote! { #[tracing::instrument(#fields)] });
    }

    let name = function.sig.ident.to_string();
    let on_exit: Stmt = match options.timing {
        Some(unit) => {
            let format = unit.formatter();
            parse_quote! {
                tracing::trace!("exit {} after {}", #name, (#format)(self.started.elapsed()));
            }
        }
        None => parse_quote! { tracing::trace!("exit {}", #name); },
    };

    let guard: Vec<Stmt> = parse_quote! {
        struct __TracedGuard {
            started: std::time::Instant,
        }

        impl __TracedGuard {
            fn enter() -> Self {
                #diagnostics
                tracing::trace!("enter {}", #name);
                Self { started: std::time::Instant::now() }
            }
        }

        impl std::ops::Drop for __TracedGuard {
            fn drop(&mut self) {
                #on_exit
            }
        }

        let __traced_guard = __TracedGuard::enter();
    };

    let body = std::mem::take(&mut function.block.stmts);
    function.block.stmts = guard.into_iter().chain(body).collect();

    proc_macro::TokenStream::from(quote! { #function })
}
