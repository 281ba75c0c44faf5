extern crate proc_macro;

use proc_macro::TokenStream;
use quote::quote;
use syn::parse_macro_input;

/// Derives `Logging` (a CSV header line) and a matching CSV `Display` line
/// for a struct with named fields. Every field must implement `Display`.
#[proc_macro_derive(Logging)]
pub fn logging_derive(input: TokenStream) -> TokenStream {
    let ast = parse_macro_input!(input as syn::DeriveInput);
    impl_logging(&ast)
}

fn impl_logging(ast: &syn::DeriveInput) -> TokenStream {
    let name = &ast.ident;
    let fields = match &ast.data {
        syn::Data::Struct(syn::DataStruct {
            fields: syn::Fields::Named(syn::FieldsNamed { ref named, .. }),
            ..
        }) => named,
        _ => {
            return syn::Error::new_spanned(
                name,
                "Logging can only be derived for structs with named fields",
            )
            .to_compile_error()
            .into()
        }
    };
    let field_names: Vec<_> =
        fields.iter().filter_map(|field| field.ident.as_ref()).collect();

    let log_format = field_names
        .iter()
        .map(|_| "{}")
        .collect::<Vec<_>>()
        .join(",");
    let header_format = field_names
        .iter()
        .map(|field_name| field_name.to_string())
        .collect::<Vec<_>>()
        .join(",");

    let expanded = quote! {
        impl Logging for #name {
            fn header(&self) -> String {
                concat!(#header_format, "\n").to_string()
            }
        }

        impl std::fmt::Display for #name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!(#log_format, "\n"), #(self.#field_names),*)
            }
        }
    };
    expanded.into()
}
