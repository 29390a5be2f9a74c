use proc_macro2::TokenStream;
use quote::{ToTokens, quote, quote_spanned};
use syn::parse::Parser;
use syn::spanned::Spanned;

// syn::AttributeArgs does not implement syn::Parse
type AttributeArgs = syn::punctuated::Punctuated<syn::Meta, syn::Token![,]>;

struct Config {
    worker_threads: Option<usize>,
}

impl Config {
    // Tests default to one worker so scheduling stays deterministic unless the
    // test opts into more.
    fn default_for(is_test: bool) -> Self {
        Self {
            worker_threads: is_test.then_some(1),
        }
    }
}

pub(crate) fn expand(args: TokenStream, item: TokenStream, is_test: bool) -> TokenStream {
    // If any of the steps for this macro fail, we still want to expand to an
    // item that is as close to the expected output as possible. This helps
    // out IDEs such that completions and other related features keep working.
    let input: syn::ItemFn = match syn::parse2(item.clone()) {
        Ok(it) => it,
        Err(e) => return token_stream_with_error(item, e),
    };

    match build_config(&input, args, is_test) {
        Ok(config) => expand_with_config(input, is_test, config),
        Err(e) => token_stream_with_error(
            expand_with_config(input, is_test, Config::default_for(is_test)),
            e,
        ),
    }
}

fn build_config(
    input: &syn::ItemFn,
    args: TokenStream,
    is_test: bool,
) -> Result<Config, syn::Error> {
    if input.sig.asyncness.is_none() {
        let msg = "the `async` keyword is missing from the function declaration";
        return Err(syn::Error::new_spanned(input.sig.fn_token, msg));
    }

    if !is_test && input.sig.ident == "main" && !input.sig.inputs.is_empty() {
        let msg = "the main function cannot accept arguments";
        return Err(syn::Error::new_spanned(&input.sig.ident, msg));
    }

    let mut config = Config::default_for(is_test);

    for arg in AttributeArgs::parse_terminated.parse2(args)? {
        let namevalue = match arg {
            syn::Meta::NameValue(namevalue) => namevalue,
            other => {
                return Err(syn::Error::new_spanned(
                    other,
                    "expected `key = value` attribute arguments",
                ));
            }
        };

        let ident = namevalue
            .path
            .get_ident()
            .ok_or_else(|| syn::Error::new_spanned(&namevalue, "must have specified ident"))?
            .to_string();

        match ident.as_str() {
            "worker_threads" => {
                let val = parse_int(&namevalue.value)?;
                if val == 0 {
                    return Err(syn::Error::new(
                        namevalue.value.span(),
                        "`worker_threads` may not be 0",
                    ));
                }
                config.worker_threads = Some(val);
            }
            name => {
                let msg = format!("unknown attribute {name}; expected `worker_threads`");
                return Err(syn::Error::new_spanned(namevalue, msg));
            }
        }
    }

    Ok(config)
}

fn parse_int(expr: &syn::Expr) -> Result<usize, syn::Error> {
    match expr {
        syn::Expr::Lit(syn::ExprLit {
            lit: syn::Lit::Int(lit),
            ..
        }) => lit.base10_parse(),
        other => Err(syn::Error::new_spanned(other, "expected an integer literal")),
    }
}

fn expand_with_config(mut input: syn::ItemFn, is_test: bool, config: Config) -> TokenStream {
    input.sig.asyncness = None;

    // If a type mismatch occurs, the current rustc points at the last
    // statement, so borrow its span for the generated tail expression.
    let last_stmt_span = input
        .block
        .stmts
        .last()
        .map_or_else(proc_macro2::Span::call_site, |stmt| stmt.span());

    let mut rt = quote_spanned! {last_stmt_span=>
        vortio::runtime::Builder::new()
    };
    if let Some(n) = config.worker_threads {
        rt = quote_spanned! {last_stmt_span=> #rt.num_workers(#n) };
    }

    let generated_attrs = if is_test {
        quote! { #[::core::prelude::v1::test] }
    } else {
        quote! {}
    };

    let body = &input.block;
    let tail = quote_spanned! {last_stmt_span=>
        {
            let body = async #body;
            return #rt
                .try_build()
                .expect("failed building the runtime")
                .block_on(body);
        }
    };

    input.block = Box::new(syn::parse2(tail).expect("generated block always parses"));

    let attrs = &input.attrs;
    let vis = &input.vis;
    let sig = &input.sig;
    let block = &input.block;

    quote! {
        #generated_attrs
        #(#attrs)*
        #vis #sig #block
    }
}

fn token_stream_with_error(mut tokens: TokenStream, error: syn::Error) -> TokenStream {
    error.into_compile_error().to_tokens(&mut tokens);
    tokens
}
