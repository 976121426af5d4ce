use agora_macros::EventPayload;

#[derive(EventPayload)]
#[event(routing_key = "product.item.published", version = 0)]
struct ItemPublished {
    sku: String,
}

fn main() {}
