use agora_macros::EventPayload;

#[derive(EventPayload)]
#[event(routing_key = "Product.Item")]
struct ItemPublished {
    sku: String,
}

fn main() {}
