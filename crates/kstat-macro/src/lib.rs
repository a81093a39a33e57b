// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use proc_macro::TokenStream;
use quote::format_ident;
use quote::quote;
use syn::DeriveInput;
use syn::Field;
use syn::FieldsNamed;
use syn::Ident;
use syn::parse_macro_input;

/// Generate a [`spd::sys::kstat::KStatProvider`] implementation given
/// a struct of named fields of type [`spd::sys::kstat::KStatU64`].
///
/// ```ignore
/// #[derive(KStatProvider)]
/// struct IpsecStats {
///     in_polvio: KStatU64,
///     out_polvio: KStatU64,
/// }
/// ```
///
/// This macro generates the following code based on the struct above.
///
/// ```ignore
/// #[derive(Clone, Debug)]
/// pub struct IpsecStatsSnap {
///     pub in_polvio: u64,
///     pub out_polvio: u64,
/// }
///
/// impl KStatProvider for IpsecStats {
///     const NUM_FIELDS: u32 = 2;
///     const NAMES: &'static [&'static str] = &["in_polvio", "out_polvio"];
///     type Snap = IpsecStatsSnap;
///
///     fn init(&mut self) -> result::Result<(), kstat::Error> {
///         self.in_polvio.init("in_polvio")?;
///         self.out_polvio.init("out_polvio")?;
///         Ok(())
///     }
///
///     fn new() -> Self { ... }
///     fn snapshot(&self) -> Self::Snap { ... }
///
///     fn entries(&self) -> Vec<(&'static str, u64)> {
///         vec![
///             ("in_polvio", self.in_polvio.val()),
///             ("out_polvio", self.out_polvio.val()),
///         ]
///     }
/// }
/// ```
///
/// The order of `entries()` is the declaration order of the fields.
#[proc_macro_derive(KStatProvider)]
pub fn derive_kstat_provider(input: TokenStream) -> TokenStream {
    let DeriveInput { ident, data, .. } = parse_macro_input!(input);
    let fields: Vec<Field> = match data {
        syn::Data::Struct(s) => match s.fields {
            syn::Fields::Named(FieldsNamed { named, .. }) => {
                named.into_iter().collect()
            }

            syn::Fields::Unnamed(_) => {
                panic!("A KStatProvider cannot have unnamed fields");
            }

            syn::Fields::Unit => {
                panic!("A unit struct cannot be a KStatProvider");
            }
        },

        _ => panic!("Only a struct may be a KStatProvider"),
    };

    let num_fields = fields.len() as u32;
    let fields_ident: Vec<Ident> =
        fields.iter().filter_map(|f| f.ident.clone()).collect();
    let ident_snap = format_ident!("{}Snap", ident);

    let output = quote! {
        #[derive(Clone, Debug, Default, Eq, PartialEq)]
        pub struct #ident_snap {
            #( pub #fields_ident: u64, )*
        }

        impl KStatProvider for #ident {
            const NUM_FIELDS: u32 = #num_fields;
            const NAMES: &'static [&'static str] =
                &[ #( stringify!(#fields_ident), )* ];
            type Snap = #ident_snap;

            fn init(
                &mut self
            ) -> core::result::Result<(), kstat::Error> {
                #( self.#fields_ident.init(stringify!(#fields_ident))?; )*
                Ok(())
            }

            fn new() -> Self {
                use ::spd::sys::kstat::KStatU64;

                Self {
                    #( #fields_ident: KStatU64::new(), )*
                }
            }

            fn snapshot(&self) -> Self::Snap {
                #ident_snap {
                    #( #fields_ident: self.#fields_ident.val(), )*
                }
            }

            fn entries(&self) -> Vec<(&'static str, u64)> {
                vec![
                    #( (stringify!(#fields_ident), self.#fields_ident.val()), )*
                ]
            }
        }
    };

    output.into()
}
