// Copyright 2018 The Hypervisor Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Implementation of the `#[bitfield]` attribute macro. See `bit_field`'s
//! crate docs for the field-width convention this relies on.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::format_ident;
use quote::quote;
use syn::parse_macro_input;
use syn::Data;
use syn::DeriveInput;
use syn::Fields;
use syn::Lit;
use syn::Meta;
use syn::Type;

#[proc_macro_attribute]
pub fn bitfield(_args: TokenStream, input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let expanded = match &input.data {
        Data::Struct(_) => expand_struct(input),
        Data::Enum(_) => expand_enum(input),
        _ => syn::Error::new_spanned(
            &input,
            "#[bitfield] only supports structs with named fields and fieldless enums",
        )
        .to_compile_error(),
    };
    expanded.into()
}

/// Reads the bit width out of a `BitFieldN` type name. `bit_field`'s marker
/// types exist solely so this can happen without relying on const generics,
/// which weren't stable when this crate's field-width convention was
/// settled on.
fn width_from_marker_type(ty: &Type) -> Option<u32> {
    let path = match ty {
        Type::Path(p) => &p.path,
        _ => return None,
    };
    let ident = &path.segments.last()?.ident;
    let name = ident.to_string();
    let digits = name.strip_prefix("BitField")?;
    digits.parse::<u32>().ok()
}

fn bits_attr(field: &syn::Field) -> Option<u32> {
    for attr in &field.attrs {
        if !attr.path().is_ident("bits") {
            continue;
        }
        if let Meta::NameValue(nv) = &attr.meta {
            if let syn::Expr::Lit(expr_lit) = &nv.value {
                if let Lit::Int(i) = &expr_lit.lit {
                    return i.base10_parse::<u32>().ok();
                }
            }
        }
    }
    None
}

fn is_bool(ty: &Type) -> bool {
    matches!(ty, Type::Path(p) if p.path.is_ident("bool"))
}

/// Smallest unsigned integer type able to hold a value of `total_bits` bits.
fn backing_repr(total_bits: u32) -> Option<syn::Ident> {
    let name = if total_bits <= 8 {
        "u8"
    } else if total_bits <= 16 {
        "u16"
    } else if total_bits <= 32 {
        "u32"
    } else if total_bits <= 64 {
        "u64"
    } else if total_bits <= 128 {
        "u128"
    } else {
        return None;
    };
    Some(syn::Ident::new(name, proc_macro2::Span::call_site()))
}

/// Smallest unsigned integer type used as the *exchange* type of a plain
/// `BitFieldN` accessor (as opposed to an enum- or bool-typed field, which
/// exchange their own type).
fn exchange_repr(width: u32) -> syn::Ident {
    backing_repr(width).unwrap_or_else(|| syn::Ident::new("u128", proc_macro2::Span::call_site()))
}

struct FieldPlan {
    name: syn::Ident,
    width: u32,
    offset: u32,
    value_ty: TokenStream2,
    is_enum: bool,
    is_bool: bool,
}

fn expand_struct(input: DeriveInput) -> TokenStream2 {
    let name = &input.ident;
    let vis = &input.vis;
    let attrs = &input.attrs;
    let data = match &input.data {
        Data::Struct(s) => s,
        _ => unreachable!(),
    };
    let fields = match &data.fields {
        Fields::Named(f) => &f.named,
        _ => {
            return syn::Error::new_spanned(&input, "#[bitfield] structs must have named fields")
                .to_compile_error()
        }
    };

    let mut plans = Vec::new();
    let mut offset = 0u32;
    for field in fields {
        let field_name = field.ident.clone().expect("named field");
        let explicit_bits = bits_attr(field);
        let (width, is_enum, is_bool, value_ty) = if is_bool(&field.ty) {
            (1, false, true, quote! { bool })
        } else if let Some(width) = width_from_marker_type(&field.ty) {
            let repr = exchange_repr(width);
            (width, false, false, quote! { #repr })
        } else {
            // An enum type used with an explicit #[bits = N] override.
            let ty = &field.ty;
            let width = match explicit_bits {
                Some(w) => w,
                None => {
                    return syn::Error::new_spanned(
                        field,
                        "fields whose type isn't BitFieldN need an explicit #[bits = N]",
                    )
                    .to_compile_error()
                }
            };
            (width, true, false, quote! { #ty })
        };
        let width = explicit_bits.unwrap_or(width);
        plans.push(FieldPlan {
            name: field_name,
            width,
            offset,
            value_ty,
            is_enum,
            is_bool,
        });
        offset += width;
    }

    let total_bits = offset;
    let repr = match backing_repr(total_bits) {
        Some(r) => r,
        None => {
            return syn::Error::new_spanned(
                &input,
                format!("#[bitfield] struct is {} bits wide, over the 128-bit limit", total_bits),
            )
            .to_compile_error()
        }
    };

    let mut accessors = Vec::new();
    for plan in &plans {
        let FieldPlan {
            name: field_name,
            width,
            offset,
            value_ty,
            is_enum,
            is_bool,
        } = plan;
        let getter = format_ident!("get_{}", field_name);
        let setter = format_ident!("set_{}", field_name);
        let mask_bits: u128 = if *width >= 128 {
            u128::MAX
        } else {
            (1u128 << width) - 1
        };

        let get_body = if *is_enum {
            quote! {
                let raw = ((self.0 as u128 >> #offset) & #mask_bits) as u64;
                <#value_ty as bit_field::BitFieldSpecifier>::from_u64(raw)
                    .expect("bitfield holds a value with no matching enum variant")
            }
        } else if *is_bool {
            quote! { ((self.0 as u128 >> #offset) & 1) != 0 }
        } else {
            quote! { ((self.0 as u128 >> #offset) & #mask_bits) as #value_ty }
        };

        let set_value_as_u128 = if *is_enum {
            quote! { bit_field::BitFieldSpecifier::into_u64(value) as u128 }
        } else if *is_bool {
            quote! { value as u128 }
        } else {
            quote! { value as u128 }
        };

        let shifted_mask: u128 = mask_bits << offset;
        accessors.push(quote! {
            pub fn #getter(&self) -> #value_ty {
                #get_body
            }

            pub fn #setter(&mut self, value: #value_ty) {
                let masked = (#set_value_as_u128) & #mask_bits;
                self.0 = (((self.0 as u128) & !#shifted_mask) | (masked << #offset)) as #repr;
            }
        });
    }

    quote! {
        #(#attrs)*
        #vis struct #name(#repr);

        impl #name {
            pub fn new() -> Self {
                #name(0)
            }

            pub fn from_bits(bits: #repr) -> Self {
                #name(bits)
            }

            pub fn into_bits(self) -> #repr {
                self.0
            }

            #(#accessors)*
        }
    }
}

fn expand_enum(input: DeriveInput) -> TokenStream2 {
    let name = &input.ident;
    let data = match &input.data {
        Data::Enum(e) => e,
        _ => unreachable!(),
    };

    let mut from_arms = Vec::new();
    for variant in &data.variants {
        if !matches!(variant.fields, Fields::Unit) {
            return syn::Error::new_spanned(
                variant,
                "#[bitfield] enums must be fieldless with explicit discriminants",
            )
            .to_compile_error();
        }
        let vident = &variant.ident;
        let disc = match &variant.discriminant {
            Some((_, expr)) => expr,
            None => {
                return syn::Error::new_spanned(
                    variant,
                    "#[bitfield] enum variants need an explicit discriminant",
                )
                .to_compile_error()
            }
        };
        from_arms.push(quote! { x if x == (#disc as u64) => Ok(#name::#vident), });
    }

    quote! {
        #input

        impl bit_field::BitFieldSpecifier for #name {
            type Error = u64;

            fn from_u64(value: u64) -> Result<Self, Self::Error> {
                match value {
                    #(#from_arms)*
                    other => Err(other),
                }
            }

            fn into_u64(self) -> u64 {
                self as u64
            }
        }
    }
}
