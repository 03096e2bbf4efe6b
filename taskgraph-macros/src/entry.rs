use proc_macro2::{Span, TokenStream};
use quote::{ToTokens, quote, quote_spanned};
use syn::ItemFn;
use syn::parse::Parser;
use syn::spanned::Spanned;

use crate::parse::*;

// syn::AttributeArgs does not implement syn::Parse
type AttributeArgs = syn::punctuated::Punctuated<syn::Meta, syn::Token![,]>;

const ATTRIBUTES: &str = "`flavor`, `worker_threads`, `named_threads`, `high_priority_band`, `background_band`";

/// Config used in case of the attribute not being able to build a valid config
const DEFAULT_ERROR_CONFIG: FinalConfig = FinalConfig {
    flavor: RuntimeFlavor::MultiThread,
    worker_threads: None,
    named_threads: 1,
    high_priority_band: false,
    background_band: false,
};

/// For this input:
///
/// ```rust,ignore
/// #[taskgraph::main(flavor = "multi_thread", worker_threads = 2)]
/// fn main(rt: &taskgraph::Runtime) {
///     rt.spawn(|| println!("Hello world")).wait();
/// }
/// ```
///
/// `args` holds everything between the attribute parentheses:
/// - `flavor = "multi_thread", worker_threads = 2`
///
/// and `item` the function itself. The function keeps its name and return
/// type but loses its argument, the body then runs as a closure receiving a
/// reference to the runtime built from `args`.
pub(crate) fn main(args: TokenStream, item: TokenStream) -> TokenStream {
    // Even when the config is invalid we still expand to something close to
    // the expected item, it keeps IDE completions working.
    let input: ItemFn = match syn::parse2(item.clone()) {
        Ok(it) => it,
        Err(e) => return token_stream_with_error(item, e),
    };

    let config = AttributeArgs::parse_terminated
        .parse2(args)
        .and_then(|args| build_config(&input, args, false));

    expand(input, false, config)
}

pub(crate) fn test(args: TokenStream, item: TokenStream) -> TokenStream {
    let input: ItemFn = match syn::parse2(item.clone()) {
        Ok(it) => it,
        Err(e) => return token_stream_with_error(item, e),
    };

    let config = if let Some(attr) = input.attrs.iter().find(|attr| is_test_attribute(attr)) {
        let msg = "second test attribute is supplied, consider removing or changing the order of your test attributes";
        Err(syn::Error::new_spanned(attr, msg))
    } else {
        AttributeArgs::parse_terminated
            .parse2(args)
            .and_then(|args| build_config(&input, args, true))
    };

    expand(input, true, config)
}

fn expand(input: ItemFn, is_test: bool, config: Result<FinalConfig, syn::Error>) -> TokenStream {
    match config {
        Ok(config) => parse_knobs(input, is_test, config),
        Err(e) => token_stream_with_error(parse_knobs(input, is_test, DEFAULT_ERROR_CONFIG), e),
    }
}

#[derive(Clone, Copy, PartialEq)]
enum RuntimeFlavor {
    MultiThread,
    Restricted,
}

impl RuntimeFlavor {
    fn from_str(s: &str) -> Result<RuntimeFlavor, String> {
        match s {
            "multi_thread" => Ok(RuntimeFlavor::MultiThread),
            "restricted" => Ok(RuntimeFlavor::Restricted),
            _ => Err(format!(
                "No such runtime flavor `{s}`. The runtime flavors are `multi_thread` and `restricted`."
            )),
        }
    }
}

struct FinalConfig {
    flavor: RuntimeFlavor,
    worker_threads: Option<usize>,
    named_threads: usize,
    high_priority_band: bool,
    background_band: bool,
}

struct ConfigBuilder {
    default_flavor: RuntimeFlavor,
    flavor: Option<RuntimeFlavor>,
    worker_threads: Option<(usize, Span)>,
    named_threads: Option<(usize, Span)>,
    high_priority_band: Option<(bool, Span)>,
    background_band: Option<(bool, Span)>,
    is_test: bool,
}

impl ConfigBuilder {
    fn new(is_test: bool) -> Self {
        ConfigBuilder {
            default_flavor: match is_test {
                true => RuntimeFlavor::Restricted,
                false => RuntimeFlavor::MultiThread,
            },
            flavor: None,
            worker_threads: None,
            named_threads: None,
            high_priority_band: None,
            background_band: None,
            is_test,
        }
    }

    fn macro_name(&self) -> &'static str {
        if self.is_test {
            "taskgraph::test"
        } else {
            "taskgraph::main"
        }
    }

    fn set_flavor(&mut self, lit: syn::Lit, span: Span) -> Result<(), syn::Error> {
        if self.flavor.is_some() {
            return Err(syn::Error::new(span, "`flavor` set multiple times."));
        }

        let flavor = parse_string(lit, span, "flavor")?;
        let flavor = RuntimeFlavor::from_str(&flavor).map_err(|err| syn::Error::new(span, err))?;
        self.flavor = Some(flavor);

        Ok(())
    }

    fn set_worker_threads(&mut self, lit: syn::Lit, span: Span) -> Result<(), syn::Error> {
        if self.worker_threads.is_some() {
            return Err(syn::Error::new(
                span,
                "`worker_threads` set multiple times.",
            ));
        }

        let worker_threads = parse_int(lit, span, "worker_threads")?;
        if worker_threads == 0 {
            return Err(syn::Error::new(span, "`worker_threads` may not be 0."));
        }
        self.worker_threads = Some((worker_threads, span));

        Ok(())
    }

    fn set_named_threads(&mut self, lit: syn::Lit, span: Span) -> Result<(), syn::Error> {
        if self.named_threads.is_some() {
            return Err(syn::Error::new(span, "`named_threads` set multiple times."));
        }

        self.named_threads = Some((parse_int(lit, span, "named_threads")?, span));

        Ok(())
    }

    fn set_band(
        slot: &mut Option<(bool, Span)>,
        lit: syn::Lit,
        span: Span,
        field: &str,
    ) -> Result<(), syn::Error> {
        if slot.is_some() {
            return Err(syn::Error::new(span, format!("`{field}` set multiple times.")));
        }

        *slot = Some((parse_bool(lit, span, field)?, span));

        Ok(())
    }

    fn build(&self) -> Result<FinalConfig, syn::Error> {
        let flavor = self.flavor.unwrap_or(self.default_flavor);

        let requires_multi_thread = |option: &str, span: Span| {
            let msg = format!(
                "The `{option}` option requires the `multi_thread` runtime flavor. Use `#[{}(flavor = \"multi_thread\")]`",
                self.macro_name(),
            );
            syn::Error::new(span, msg)
        };

        let worker_threads = match (flavor, self.worker_threads) {
            (RuntimeFlavor::Restricted, Some((_, span))) => {
                return Err(requires_multi_thread("worker_threads", span));
            }
            (RuntimeFlavor::MultiThread, Some((worker_threads, _))) => Some(worker_threads),
            (_, None) => None,
        };

        for (option, band) in [
            ("high_priority_band", self.high_priority_band),
            ("background_band", self.background_band),
        ] {
            if let (RuntimeFlavor::Restricted, Some((true, span))) = (flavor, band) {
                return Err(requires_multi_thread(option, span));
            }
        }

        let named_threads = match (flavor, self.named_threads) {
            (RuntimeFlavor::Restricted, Some((0, span))) => {
                let msg = "The `restricted` runtime flavor needs at least one named thread.";
                return Err(syn::Error::new(span, msg));
            }
            (_, Some((named_threads, _))) => named_threads,
            (_, None) => 1,
        };

        Ok(FinalConfig {
            flavor,
            worker_threads,
            named_threads,
            high_priority_band: self.high_priority_band.is_some_and(|(on, _)| on),
            background_band: self.background_band.is_some_and(|(on, _)| on),
        })
    }
}

fn build_config(
    input: &ItemFn,
    args: AttributeArgs,
    is_test: bool,
) -> Result<FinalConfig, syn::Error> {
    if let Some(asyncness) = input.sig.asyncness {
        let msg = "the function must not be `async`, tasks are plain closures";
        return Err(syn::Error::new_spanned(asyncness, msg));
    }

    runtime_arg(&input.sig)?;

    let mut config = ConfigBuilder::new(is_test);
    let macro_name = config.macro_name();

    for arg in args {
        match arg {
            syn::Meta::NameValue(namevalue) => {
                let ident = namevalue
                    .path
                    .get_ident()
                    .ok_or_else(|| {
                        syn::Error::new_spanned(&namevalue, "Must have specified ident")
                    })?
                    .to_string()
                    .to_lowercase();
                let lit = match &namevalue.value {
                    syn::Expr::Lit(syn::ExprLit { lit, .. }) => lit,
                    expr => return Err(syn::Error::new_spanned(expr, "Must be a literal")),
                };
                let span = lit.span();
                match ident.as_str() {
                    "flavor" => config.set_flavor(lit.clone(), span)?,
                    "worker_threads" => config.set_worker_threads(lit.clone(), span)?,
                    "named_threads" => config.set_named_threads(lit.clone(), span)?,
                    "high_priority_band" => ConfigBuilder::set_band(
                        &mut config.high_priority_band,
                        lit.clone(),
                        span,
                        "high_priority_band",
                    )?,
                    "background_band" => ConfigBuilder::set_band(
                        &mut config.background_band,
                        lit.clone(),
                        span,
                        "background_band",
                    )?,
                    name => {
                        let msg = format!(
                            "Unknown attribute {name} is specified; expected one of: {ATTRIBUTES}",
                        );
                        return Err(syn::Error::new_spanned(namevalue, msg));
                    }
                }
            }
            syn::Meta::Path(path) => {
                let name = path
                    .get_ident()
                    .ok_or_else(|| syn::Error::new_spanned(&path, "Must have specified ident"))?
                    .to_string()
                    .to_lowercase();
                let msg = match name.as_str() {
                    "multi_thread" | "restricted" => {
                        format!("Set the runtime flavor with #[{macro_name}(flavor = \"{name}\")].")
                    }
                    "high_priority_band" | "background_band" => {
                        format!("Enable the band with #[{macro_name}({name} = true)].")
                    }
                    "flavor" | "worker_threads" | "named_threads" => {
                        format!("The `{name}` attribute requires an argument.")
                    }
                    name => {
                        format!(
                            "Unknown attribute {name} is specified; expected one of: {ATTRIBUTES}."
                        )
                    }
                };
                return Err(syn::Error::new_spanned(path, msg));
            }
            other => {
                return Err(syn::Error::new_spanned(
                    other,
                    "Unknown attribute inside the macro",
                ));
            }
        }
    }

    config.build()
}

fn parse_knobs(mut input: ItemFn, is_test: bool, config: FinalConfig) -> TokenStream {
    // Errors on the argument were already reported by `build_config`.
    let rt_pat = runtime_arg(&input.sig).ok().flatten();
    input.sig.inputs.clear();

    // If type mismatch occurs, the current rustc points to the last statement.
    let last_stmt_span = input
        .block
        .stmts
        .last()
        .map_or_else(Span::call_site, |stmt| stmt.span());

    let mut rt = match config.flavor {
        RuntimeFlavor::MultiThread => quote_spanned! {last_stmt_span=>
            taskgraph::runtime::Builder::new_multi_thread()
        },
        RuntimeFlavor::Restricted => quote_spanned! {last_stmt_span=>
            taskgraph::runtime::Builder::new_restricted()
        },
    };

    if let Some(v) = config.worker_threads {
        rt = quote_spanned! {last_stmt_span=> #rt.worker_threads(#v) };
    }

    let named_threads = config.named_threads;
    rt = quote_spanned! {last_stmt_span=> #rt.named_threads(#named_threads) };

    if config.high_priority_band {
        rt = quote_spanned! {last_stmt_span=> #rt.enable_high_priority_band(true) };
    }

    if config.background_band {
        rt = quote_spanned! {last_stmt_span=> #rt.enable_background_band(true) };
    }

    let attach = if config.named_threads > 0 {
        quote! {
            runtime.attach_named_thread(taskgraph::thread::ThreadSelector::named(0));
        }
    } else {
        quote! {}
    };

    let output_type = match &input.sig.output {
        syn::ReturnType::Default => quote! { () },
        syn::ReturnType::Type(_, ret_type) => quote! { #ret_type },
    };

    let rt_pat = match rt_pat {
        Some(pat) => pat.into_token_stream(),
        None => quote! { _ },
    };

    let body = &input.block;

    let generated_attrs = if is_test {
        quote! {
            #[::core::prelude::v1::test]
        }
    } else {
        quote! {}
    };

    let attrs = &input.attrs;
    let vis = &input.vis;
    let sig = &input.sig;

    quote! {
        #(#attrs)*
        #generated_attrs
        #vis #sig {
            #[allow(clippy::expect_used)]
            let runtime = #rt
                .try_build()
                .expect("Failed building the Runtime");
            #attach

            let body = |#rt_pat: &taskgraph::Runtime| -> #output_type #body;
            let output = body(&runtime);

            runtime.shutdown();
            output
        }
    }
}
