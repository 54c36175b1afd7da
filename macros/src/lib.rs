//! Derive macros for the eShop event bus
//!
//! # Available Macros
//!
//! - `#[derive(IntegrationEvent)]` - Implements `eshop_eventbus_core::event::IntegrationEvent`
//!
//! # Example
//!
//! ```ignore
//! use eshop_eventbus_macros::IntegrationEvent;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(IntegrationEvent, Clone, Debug, Serialize, Deserialize)]
//! struct OrderStartedIntegrationEvent {
//!     user_id: String,
//! }
//!
//! assert_eq!(OrderStartedIntegrationEvent::EVENT_NAME, "OrderStartedIntegrationEvent");
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use proc_macro::TokenStream;
use quote::quote;
use syn::{Attribute, Data, DeriveInput, LitStr, parse_macro_input};

/// Derive macro for integration event payloads
///
/// Generates an `IntegrationEvent` impl whose `EVENT_NAME` is the type name,
/// or the value given with `#[integration_event(name = "...")]`. The name
/// selects the destination `IntegrationEvents-<name>`, so renaming a type
/// without pinning its name changes where it is published.
///
/// The type must also implement `Serialize` and `Deserialize`.
///
/// # Attributes
///
/// - `#[integration_event(name = "...")]` - Override the event type name
///
/// # Panics
///
/// This macro will produce a compile error (not a runtime panic) if:
/// - Applied to a union
/// - The name is empty or the attribute is malformed
///
/// # Example
///
/// ```ignore
/// #[derive(IntegrationEvent, Clone, Debug, Serialize, Deserialize)]
/// #[integration_event(name = "OrderStatusChangedToPaidIntegrationEvent")]
/// struct OrderPaid {
///     order_id: i32,
/// }
///
/// assert_eq!(OrderPaid::EVENT_NAME, "OrderStatusChangedToPaidIntegrationEvent");
/// ```
#[proc_macro_derive(IntegrationEvent, attributes(integration_event))]
pub fn derive_integration_event(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let name = &input.ident;

    if let Data::Union(_) = &input.data {
        return syn::Error::new_spanned(
            &input,
            "#[derive(IntegrationEvent)] cannot be used on unions",
        )
        .to_compile_error()
        .into();
    }

    let event_name = match event_name_override(&input.attrs) {
        Ok(Some(lit)) => {
            if lit.value().trim().is_empty() {
                return syn::Error::new_spanned(lit, "integration event name must not be empty")
                    .to_compile_error()
                    .into();
            }
            lit.value()
        }
        Ok(None) => name.to_string(),
        Err(err) => return err.to_compile_error().into(),
    };

    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let expanded = quote! {
        impl #impl_generics ::eshop_eventbus_core::event::IntegrationEvent for #name #ty_generics #where_clause {
            const EVENT_NAME: &'static str = #event_name;
        }
    };

    TokenStream::from(expanded)
}

/// Read `name = "..."` from `#[integration_event(...)]`, if present
fn event_name_override(attrs: &[Attribute]) -> syn::Result<Option<LitStr>> {
    let mut found = None;

    for attr in attrs {
        if !attr.path().is_ident("integration_event") {
            continue;
        }

        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("name") {
                if found.is_some() {
                    return Err(meta.error("duplicate `name` in #[integration_event]"));
                }
                found = Some(meta.value()?.parse::<LitStr>()?);
                Ok(())
            } else {
                Err(meta.error("unsupported #[integration_event] key, expected `name`"))
            }
        })?;
    }

    Ok(found)
}
