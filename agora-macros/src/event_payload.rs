use proc_macro2::TokenStream;
use quote::quote;
use syn::{DeriveInput, LitInt, LitStr, Result};

/// #[derive(EventPayload)] 宏实现
pub(crate) fn expand(input: &DeriveInput) -> Result<TokenStream> {
    let cfg = EventAttrConfig::from_attrs(input)?;

    let ident = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();
    let routing_key = cfg.routing_key;
    let version = cfg.version;

    Ok(quote! {
        impl #impl_generics ::agora_eventing::envelope::EventPayload for #ident #ty_generics #where_clause {
            const ROUTING_KEY: &'static str = #routing_key;
            const SCHEMA_VERSION: u32 = #version;
        }
    })
}

// -------- parsing --------

struct EventAttrConfig {
    routing_key: LitStr,
    version: u32,
}

impl EventAttrConfig {
    fn from_attrs(input: &DeriveInput) -> Result<Self> {
        let mut routing_key: Option<LitStr> = None;
        let mut version: Option<u32> = None;

        for attr in input.attrs.iter().filter(|a| a.path().is_ident("event")) {
            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("routing_key") {
                    if routing_key.is_some() {
                        return Err(meta.error("duplicate key 'routing_key' in attribute"));
                    }
                    let lit: LitStr = meta.value()?.parse()?;
                    validate_routing_key(&lit)?;
                    routing_key = Some(lit);
                    Ok(())
                } else if meta.path.is_ident("version") {
                    if version.is_some() {
                        return Err(meta.error("duplicate key 'version' in attribute"));
                    }
                    let lit: LitInt = meta.value()?.parse()?;
                    let value = lit.base10_parse::<u32>()?;
                    if value == 0 {
                        return Err(syn::Error::new(lit.span(), "version must be at least 1"));
                    }
                    version = Some(value);
                    Ok(())
                } else {
                    Err(meta.error("unsupported key, expected `routing_key` or `version`"))
                }
            })?;
        }

        let Some(routing_key) = routing_key else {
            return Err(syn::Error::new(
                input.ident.span(),
                "missing #[event(routing_key = \"<service>.<domain>.<action>\")]",
            ));
        };

        Ok(Self {
            routing_key,
            version: version.unwrap_or(1),
        })
    }
}

/// `<service>.<domain>.<action>`，每段为 `[a-z0-9-]+`
fn validate_routing_key(lit: &LitStr) -> Result<()> {
    let value = lit.value();
    let segments: Vec<&str> = value.split('.').collect();
    let kebab = |s: &&str| {
        !s.is_empty()
            && s.bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
    };

    if segments.len() != 3 || !segments.iter().all(kebab) {
        return Err(syn::Error::new(
            lit.span(),
            format!("invalid routing key '{value}', expected lower-kebab '<service>.<domain>.<action>'"),
        ));
    }
    Ok(())
}
