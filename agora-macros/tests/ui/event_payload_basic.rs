use agora_eventing::envelope::EventPayload;
use agora_macros::EventPayload;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, EventPayload)]
#[event(routing_key = "product.item.published", version = 2)]
struct ItemPublished {
    sku: String,
}

#[derive(Debug, Serialize, Deserialize, EventPayload)]
#[event(routing_key = "order.cart-line.removed")]
struct CartLineRemoved {
    line: u32,
}

fn main() {
    assert_eq!(ItemPublished::ROUTING_KEY, "product.item.published");
    assert_eq!(ItemPublished::SCHEMA_VERSION, 2);
    assert_eq!(CartLineRemoved::SCHEMA_VERSION, 1);
}
