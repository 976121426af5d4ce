use proc_macro::TokenStream;
use syn::{DeriveInput, parse_macro_input};

mod event_payload;

/// 事件载荷派生宏
/// - 为目标类型实现 `::agora_eventing::envelope::EventPayload`
/// - 参数：`#[event(routing_key = "<service>.<domain>.<action>", version = N)]`
/// - `version` 缺省为 1，必须为正整数
/// - 路由键在编译期按 lower-kebab 三段式校验
#[proc_macro_derive(EventPayload, attributes(event))]
pub fn derive_event_payload(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    event_payload::expand(&input)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}
