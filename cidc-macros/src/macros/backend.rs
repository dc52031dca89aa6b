use proc_macro::TokenStream;
use quote::quote;
use syn::{ItemEnum, ItemStruct, parse_macro_input};

use super::common::{case_convention, derive_enum};

pub fn insertion(attr: TokenStream, input: TokenStream) -> TokenStream {
    let struct_item = parse_macro_input!(input as ItemStruct);

    let table_name = parse_macro_input!(attr as syn::Path);

    let output = quote! {
        #[derive(serde::Deserialize, serde::Serialize, diesel::Insertable, garde::Validate, Debug, Clone)]
        #[diesel(table_name = #table_name, check_for_backend(diesel::pg::Pg))]
        #[garde(allow_unvalidated)]
        #struct_item
    };

    output.into()
}

pub fn selection(attr: TokenStream, input: TokenStream) -> TokenStream {
    let struct_item = parse_macro_input!(input as ItemStruct);

    let table_name = parse_macro_input!(attr as syn::Path);

    let output = quote! {
        #[derive(serde::Serialize, diesel::prelude::Selectable, diesel::prelude::Queryable, Debug, Clone)]
        #[diesel(table_name = #table_name, check_for_backend(diesel::pg::Pg))]
        #struct_item
    };

    output.into()
}

pub fn update(attr: TokenStream, input: TokenStream) -> TokenStream {
    let struct_item = parse_macro_input!(input as ItemStruct);

    let table_name = parse_macro_input!(attr as syn::Path);

    let output = quote! {
        #[derive(serde::Deserialize, serde::Serialize, diesel::prelude::AsChangeset, garde::Validate, Debug, Default, Clone)]
        #[diesel(table_name = #table_name, check_for_backend(diesel::pg::Pg))]
        #[garde(allow_unvalidated)]
        #struct_item
    };

    output.into()
}

pub fn query_request(input: TokenStream) -> TokenStream {
    let struct_item = parse_macro_input!(input as ItemStruct);

    let output = quote! {
        #[derive(serde::Deserialize, Debug, Default, Clone)]
        #[serde(default)]
        #struct_item
    };

    output.into()
}

pub fn ordinal_columns_enum(input: TokenStream) -> TokenStream {
    let enum_with_derives = derive_enum(TokenStream::new(), input);

    let enum_item = parse_macro_input!(enum_with_derives as ItemEnum);

    let output = quote! {
        #[derive(strum::VariantArray, strum::IntoStaticStr)]
        #[strum(serialize_all = "snake_case")]
        #enum_item
    };

    output.into()
}

pub fn db_enum(attr: TokenStream, input: TokenStream) -> TokenStream {
    let case = match case_convention(attr.clone()) {
        Ok(case) => case,
        Err(err) => return err.to_compile_error().into(),
    };

    let enum_with_derives = derive_enum(attr, input);
    let enum_item = parse_macro_input!(enum_with_derives as ItemEnum);

    let ItemEnum { ident, .. } = &enum_item;

    let output = quote! {
        #[derive(diesel::deserialize::FromSqlRow, diesel::expression::AsExpression, strum::EnumString, strum::IntoStaticStr, strum::Display, strum::VariantArray)]
        #[diesel(sql_type = diesel::sql_types::Text)]
        #[strum(serialize_all = #case)]
        #enum_item

        impl diesel::deserialize::FromSql<diesel::sql_types::Text, diesel::pg::Pg> for #ident {
            fn from_sql(bytes: <diesel::pg::Pg as diesel::backend::Backend>::RawValue<'_>) -> diesel::deserialize::Result<Self> {
                use diesel::{deserialize::FromSql, sql_types, pg::Pg};
                use std::str::FromStr;

                let string: String = FromSql::<sql_types::Text, Pg>::from_sql(bytes)?;
                Ok(Self::from_str(&string)?)
            }
        }

        impl diesel::serialize::ToSql<diesel::sql_types::Text, diesel::pg::Pg> for #ident {
            fn to_sql<'b>(
                &'b self,
                out: &mut diesel::serialize::Output<'b, '_, diesel::pg::Pg>,
            ) -> diesel::serialize::Result {
                use diesel::{serialize::ToSql, sql_types, pg::Pg};

                let as_str: &'static str = self.into();
                ToSql::<sql_types::Text, Pg>::to_sql(as_str, &mut out.reborrow())
            }
        }
    };

    output.into()
}

pub fn db_json(input: TokenStream) -> TokenStream {
    let struct_item = parse_macro_input!(input as ItemStruct);

    let ItemStruct { ident, .. } = &struct_item;

    let output = quote! {
        #[derive(diesel::deserialize::FromSqlRow, diesel::expression::AsExpression, serde::Serialize, serde::Deserialize, Debug, Default, Clone, PartialEq)]
        #[diesel(sql_type = diesel::sql_types::Jsonb)]
        #struct_item

        impl diesel::deserialize::FromSql<diesel::sql_types::Jsonb, diesel::pg::Pg> for #ident {
            fn from_sql(bytes: <diesel::pg::Pg as diesel::backend::Backend>::RawValue<'_>) -> diesel::deserialize::Result<Self> {
                use diesel::{deserialize::FromSql, sql_types, pg::Pg};

                let json: serde_json::Value = FromSql::<sql_types::Jsonb, Pg>::from_sql(bytes)?;
                Ok(serde_json::from_value(json)?)
            }
        }

        impl diesel::serialize::ToSql<diesel::sql_types::Jsonb, diesel::pg::Pg> for #ident {
            fn to_sql<'b>(
                &'b self,
                out: &mut diesel::serialize::Output<'b, '_, diesel::pg::Pg>,
            ) -> diesel::serialize::Result {
                use std::io::Write;

                // jsonb binary format version
                out.write_all(&[1])?;
                serde_json::to_writer(out, self)?;

                Ok(diesel::serialize::IsNull::No)
            }
        }
    };

    output.into()
}
