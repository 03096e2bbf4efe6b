use proc_macro2::{Span, TokenStream};
use syn::{Attribute, FnArg, Pat};

pub(crate) fn parse_string(lit: syn::Lit, span: Span, field: &str) -> Result<String, syn::Error> {
    match lit {
        syn::Lit::Str(s) => Ok(s.value()),
        syn::Lit::Verbatim(s) => Ok(s.to_string()),
        _ => Err(syn::Error::new(
            span,
            format!("Failed to parse value of `{field}` as string."),
        )),
    }
}

pub(crate) fn parse_int(lit: syn::Lit, span: Span, field: &str) -> Result<usize, syn::Error> {
    match lit {
        syn::Lit::Int(lit) => lit.base10_parse::<usize>().map_err(|e| {
            syn::Error::new(
                span,
                format!("Failed to parse value of `{field}` as integer: {e}"),
            )
        }),
        _ => Err(syn::Error::new(
            span,
            format!("Failed to parse value of `{field}` as integer."),
        )),
    }
}

pub(crate) fn parse_bool(lit: syn::Lit, span: Span, field: &str) -> Result<bool, syn::Error> {
    match lit {
        syn::Lit::Bool(b) => Ok(b.value),
        _ => Err(syn::Error::new(
            span,
            format!("Failed to parse value of `{field}` as bool."),
        )),
    }
}

pub(crate) fn is_test_attribute(attr: &Attribute) -> bool {
    let path = match &attr.meta {
        syn::Meta::Path(path) => path,
        _ => return false,
    };
    let candidates = [
        ["core", "prelude", "*", "test"],
        ["std", "prelude", "*", "test"],
    ];
    if path.leading_colon.is_none()
        && path.segments.len() == 1
        && path.segments[0].arguments.is_none()
        && path.segments[0].ident == "test"
    {
        return true;
    } else if path.segments.len() != candidates[0].len() {
        return false;
    }
    candidates.into_iter().any(|segments| {
        path.segments.iter().zip(segments).all(|(segment, path)| {
            segment.arguments.is_none() && (path == "*" || segment.ident == path)
        })
    })
}

/// Pattern of the optional runtime argument. At most one typed argument,
/// `self` receivers are rejected.
pub(crate) fn runtime_arg(sig: &syn::Signature) -> Result<Option<Box<Pat>>, syn::Error> {
    let mut inputs = sig.inputs.iter();

    let arg = match (inputs.next(), inputs.next()) {
        (None, _) => return Ok(None),
        (Some(arg), None) => arg,
        (Some(_), Some(extra)) => {
            let msg = "at most one argument is allowed, it receives `&taskgraph::Runtime`";
            return Err(syn::Error::new_spanned(extra, msg));
        }
    };

    match arg {
        FnArg::Typed(typed) => Ok(Some(typed.pat.clone())),
        FnArg::Receiver(recv) => Err(syn::Error::new_spanned(
            recv,
            "methods are not supported, use a free function",
        )),
    }
}

pub(crate) fn token_stream_with_error(mut tokens: TokenStream, error: syn::Error) -> TokenStream {
    tokens.extend(error.into_compile_error());
    tokens
}
