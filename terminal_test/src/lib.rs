use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote};
use syn::{parse_macro_input, spanned::Spanned, FnArg, Ident, ItemFn, Pat, Signature, Type};

/// Transform an asynchronous test into a synchronous one, inject dependencies,
/// and ensure that every terminal is shut down regardless of how the test terminates.
///
/// Each test gets its own `SimulatedNetwork` with a `World` of terminals on it.
/// Injectable dependencies are `SimulatedNetwork` and `&World`.
/// `#[terminal_test(active)]` authenticates every terminal before the test runs.
#[proc_macro_attribute]
pub fn terminal_test(args: TokenStream, input: TokenStream) -> TokenStream {
    let mut item_fn = parse_macro_input!(input as ItemFn);

    // Extract the parameters to inject and reject invalid function signatures.
    let test_args = match check_sig(item_fn.sig.clone()) {
        Ok(args) => args,
        Err(err) => {
            return err.into_compile_error().into();
        }
    };

    // Rename the future so the test can have its original name.
    let name = item_fn.sig.ident.clone();
    let new_name = format_ident!("{}_fut", name);
    item_fn.sig.ident = new_name.clone();

    // Authenticate the terminals if asked to.
    let maybe_activate = match parse_macro_input!(args as Option<Ident>) {
        Some(arg) if arg == "active" => quote! {
            runtime.block_on(world.activate());
        },
        Some(arg) => {
            return syn::Error::new(arg.span(), "Expected no argument or `active`")
                .into_compile_error()
                .into();
        }
        None => quote! {},
    };

    // Rewrite the test function.
    quote! {
        #[test]
        fn #name() {
            /// The test itself.
            #item_fn

            crate::testing::init_logging();

            // Create an async runtime for this test alone.
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .thread_name("terminal-test-thread")
                .worker_threads(2)
                .enable_all()
                .build()
                .unwrap();

            // Run the setup.
            let network = crate::testing::network();
            let world = runtime.block_on(crate::testing::World::build(network.clone()));
            #maybe_activate

            // Run the test, catching any panics.
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                runtime.block_on(#new_name(#(#test_args),*));
            }));

            // Run the cleanup.
            runtime.block_on(world.shut_down());

            // If the test panicked, re-raise the panic.
            if let Err(cause) = result {
                std::panic::resume_unwind(cause);
            }
        }
    }
    .into()
}

/// Ensure the wrapped test is async, extract parameters to inject, and reject unknown parameters.
fn check_sig(sig: Signature) -> Result<Vec<TokenStream2>, syn::Error> {
    if sig.asyncness.is_none() {
        return Err(syn::Error::new(sig.span(), "Test must be marked `async`"));
    }

    let mut has_network = false;
    let mut has_world = false;
    let mut args = vec![];

    for input in &sig.inputs {
        if let FnArg::Typed(pat_type) = input {
            if let Pat::Ident(_) = &*pat_type.pat {
                match &*pat_type.ty {
                    Type::Path(type_path) if type_path.path.is_ident("SimulatedNetwork") => {
                        if has_network {
                            return Err(syn::Error::new(
                                input.span(),
                                "Test cannot accept more than one `SimulatedNetwork`",
                            ));
                        }
                        has_network = true;
                        args.push(quote! { network.clone() });
                        continue;
                    }
                    Type::Reference(reference) => {
                        if let Type::Path(type_path) = &*reference.elem {
                            if type_path.path.is_ident("World") && reference.mutability.is_none() {
                                if has_world {
                                    return Err(syn::Error::new(
                                        input.span(),
                                        "Test cannot accept more than one `&World`",
                                    ));
                                }
                                has_world = true;
                                args.push(quote! { &world });
                                continue;
                            }
                        }
                    }
                    _ => {}
                }
            }
        }

        return Err(syn::Error::new(
            input.span(),
            "Expected one of `network_ident: SimulatedNetwork` or `world_ident: &World`",
        ));
    }

    Ok(args)
}
