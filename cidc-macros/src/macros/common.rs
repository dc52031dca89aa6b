use proc_macro::TokenStream;
use quote::quote;
use syn::{ItemEnum, LitStr, parse_macro_input};

pub(crate) fn case_convention(attr: TokenStream) -> syn::Result<String> {
    if attr.is_empty() {
        return Ok("snake_case".to_string());
    }

    Ok(syn::parse::<LitStr>(attr)?.value())
}

pub(crate) fn derive_enum(attr: TokenStream, input: TokenStream) -> TokenStream {
    let item = parse_macro_input!(input as ItemEnum);
    let case = match case_convention(attr) {
        Ok(case) => case,
        Err(err) => return err.to_compile_error().into(),
    };

    let output = quote! {
        #[derive(serde::Deserialize, serde::Serialize, Clone, Copy, PartialEq, Eq, Hash, Debug)]
        #[serde(rename_all = #case)]
        #item
    };

    output.into()
}
