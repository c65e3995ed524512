//! A derive macro for the `Event` trait in the `evently` crate.
use std::collections::HashSet;

use proc_macro::TokenStream;
use quote::quote;
use syn::{Data, DeriveInput, Fields, LitStr, Variant, parse_macro_input, spanned::Spanned};

/// Derives the `Event` trait for an enum.
///
/// Every variant is one event type. Variants either carry exactly one
/// payload value (`Created(UserCreated)`) or none (`Deactivated`). The type
/// tag is the variant name unless overridden with
/// `#[event(name = "UserCreated")]`.
///
/// The generated impl provides `EVENT_TYPES`, `event_type`, `encode` and a
/// decoder per variant, so a registry built from the enum covers every
/// declared type.
#[proc_macro_derive(Event, attributes(event))]
pub fn event_derive(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    expand(&input)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

fn expand(input: &DeriveInput) -> syn::Result<proc_macro2::TokenStream> {
    let name = &input.ident;

    let variants = match &input.data {
        Data::Enum(data) => &data.variants,
        _ => {
            return Err(syn::Error::new(
                input.span(),
                "Event derive macro can only be used on enums",
            ));
        }
    };
    if variants.is_empty() {
        return Err(syn::Error::new(
            input.span(),
            "Event derive macro needs at least one variant",
        ));
    }

    let mut seen = HashSet::new();
    let mut tags = Vec::with_capacity(variants.len());
    let mut type_arms = Vec::with_capacity(variants.len());
    let mut encode_arms = Vec::with_capacity(variants.len());
    let mut registrations = Vec::with_capacity(variants.len());

    for variant in variants {
        let ident = &variant.ident;
        let tag = event_tag(variant)?;
        if !seen.insert(tag.clone()) {
            return Err(syn::Error::new(
                variant.span(),
                format!("duplicate event type `{tag}`"),
            ));
        }

        match &variant.fields {
            Fields::Unnamed(fields) if fields.unnamed.len() == 1 => {
                type_arms.push(quote! { #name::#ident(..) => #tag });
                encode_arms.push(quote! {
                    #name::#ident(payload) => ::evently::__private::serde_json::to_vec(payload)
                });
                registrations.push(quote! {
                    registry.register(#tag, |data| {
                        ::evently::__private::serde_json::from_slice(data).map(#name::#ident)
                    });
                });
            }
            Fields::Unit => {
                type_arms.push(quote! { #name::#ident => #tag });
                encode_arms.push(quote! { #name::#ident => Ok(b"null".to_vec()) });
                registrations.push(quote! {
                    registry.register(#tag, |_| Ok(#name::#ident));
                });
            }
            _ => {
                return Err(syn::Error::new(
                    variant.span(),
                    "event variants must be unit variants or carry exactly one payload value",
                ));
            }
        }
        tags.push(tag);
    }

    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    Ok(quote! {
        impl #impl_generics ::evently::Event for #name #ty_generics #where_clause {
            const EVENT_TYPES: &'static [&'static str] = &[#(#tags),*];

            fn event_type(&self) -> &'static str {
                match self {
                    #(#type_arms),*
                }
            }

            fn encode(&self) -> ::evently::__private::serde_json::Result<::std::vec::Vec<u8>> {
                match self {
                    #(#encode_arms),*
                }
            }

            fn register_decoders(registry: &mut ::evently::EventRegistry<Self>) {
                #(#registrations)*
            }
        }
    })
}

/// Reads `#[event(name = "...")]`, falling back to the variant name.
fn event_tag(variant: &Variant) -> syn::Result<String> {
    let mut tag = None;
    for attr in variant.attrs.iter().filter(|a| a.path().is_ident("event")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("name") {
                let value: LitStr = meta.value()?.parse()?;
                tag = Some(value.value());
                Ok(())
            } else {
                Err(meta.error("unsupported event attribute, expected `name`"))
            }
        })?;
    }
    Ok(tag.unwrap_or_else(|| variant.ident.to_string()))
}
