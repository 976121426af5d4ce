use super::EventHandler;
use crate::envelope::routing::matches_pattern;
use std::sync::Arc;

/// 按注册顺序匹配，第一个命中的模式胜出
#[derive(Clone, Default)]
pub(crate) struct HandlerRegistry {
    entries: Vec<(String, Arc<dyn EventHandler>)>,
}

impl HandlerRegistry {
    pub(crate) fn new(handlers: Vec<Arc<dyn EventHandler>>) -> Self {
        let mut entries = Vec::new();
        for h in handlers {
            for pattern in h.bindings() {
                entries.push((pattern, h.clone()));
            }
        }
        Self { entries }
    }

    pub(crate) fn resolve(&self, routing_key: &str) -> Option<&Arc<dyn EventHandler>> {
        self.entries
            .iter()
            .find(|(pattern, _)| matches_pattern(pattern, routing_key))
            .map(|(_, h)| h)
    }

    /// 去重后的全部绑定模式
    pub(crate) fn patterns(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for (pattern, _) in &self.entries {
            if !out.contains(pattern) {
                out.push(pattern.clone());
            }
        }
        out
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::handler_fn;

    #[test]
    fn first_registered_match_wins() {
        let registry = HandlerRegistry::new(vec![
            handler_fn("specific", "product.item.published", |_| async { Ok(()) }),
            handler_fn("catch-all", "product.#", |_| async { Ok(()) }),
            handler_fn("dup", "product.#", |_| async { Ok(()) }),
        ]);

        let name = |key: &str| registry.resolve(key).map(|h| h.handler_name().to_string());
        assert_eq!(name("product.item.published").as_deref(), Some("specific"));
        assert_eq!(name("product.item.deleted").as_deref(), Some("catch-all"));
        assert!(name("order.cart.created").is_none());
        assert_eq!(
            registry.patterns(),
            vec!["product.item.published".to_string(), "product.#".to_string()]
        );
    }
}
