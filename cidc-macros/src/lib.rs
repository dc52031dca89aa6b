use proc_macro::TokenStream;

mod macros;
use macros::{backend, common};

#[proc_macro_attribute]
pub fn insertion(attr: TokenStream, input: TokenStream) -> TokenStream {
    backend::insertion(attr, input)
}

#[proc_macro_attribute]
pub fn selection(attr: TokenStream, input: TokenStream) -> TokenStream {
    backend::selection(attr, input)
}

#[proc_macro_attribute]
pub fn update(attr: TokenStream, input: TokenStream) -> TokenStream {
    backend::update(attr, input)
}

#[proc_macro_attribute]
pub fn query_request(_attr: TokenStream, input: TokenStream) -> TokenStream {
    backend::query_request(input)
}

#[proc_macro_attribute]
pub fn ordinal_columns_enum(_attr: TokenStream, input: TokenStream) -> TokenStream {
    backend::ordinal_columns_enum(input)
}

/// Text-backed database enum. Takes an optional case convention understood by
/// both serde and strum, e.g. `#[db_enum("kebab-case")]`.
#[proc_macro_attribute]
pub fn db_enum(attr: TokenStream, input: TokenStream) -> TokenStream {
    backend::db_enum(attr, input)
}

#[proc_macro_attribute]
pub fn db_json(_attr: TokenStream, input: TokenStream) -> TokenStream {
    backend::db_json(input)
}

#[proc_macro_attribute]
pub fn api_enum(attr: TokenStream, input: TokenStream) -> TokenStream {
    common::derive_enum(attr, input)
}
