use agora_macros::EventPayload;

#[derive(EventPayload)]
#[event(version = 2)]
struct ItemPublished {
    sku: String,
}

fn main() {}
