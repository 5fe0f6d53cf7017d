//! Read-mostly cache for per-seller rule contexts.
//!
//! Thresholds and whitelist change only through admin mutation, so the cache
//! is an `ArcSwap` of an immutable map with coarse-grained invalidation: any
//! admin write drops the whole map. No per-item locking.

use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::error::DetectionError;
use crate::models::RuleContext;
use crate::storage::ResultsStore;

pub struct ContextCache {
    store: Arc<ResultsStore>,
    map: ArcSwap<HashMap<String, Arc<RuleContext>>>,
}

impl ContextCache {
    pub fn new(store: Arc<ResultsStore>) -> Self {
        Self {
            store,
            map: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    pub fn get(&self, seller_id: &str) -> Result<Arc<RuleContext>, DetectionError> {
        if let Some(ctx) = self.map.load().get(seller_id) {
            return Ok(ctx.clone());
        }

        let ctx = Arc::new(self.store.load_context(seller_id)?);
        self.map.rcu(|current| {
            let mut next: HashMap<String, Arc<RuleContext>> = (**current).clone();
            next.insert(seller_id.to_string(), ctx.clone());
            next
        });
        Ok(ctx)
    }

    /// Coarse invalidation after an admin mutation.
    pub fn invalidate(&self) {
        self.map.store(Arc::new(HashMap::new()));
        debug!("rule context cache invalidated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RuleType, Threshold, ThresholdOperator};

    #[test]
    fn test_cache_returns_same_instance_until_invalidated() {
        let store = Arc::new(ResultsStore::in_memory().unwrap());
        let cache = ContextCache::new(store.clone());

        let first = cache.get("seller-1").unwrap();
        assert!(first.thresholds.is_empty());

        store
            .insert_threshold(&Threshold {
                id: None,
                rule_type: RuleType::LostUnits,
                seller_id: None,
                operator: ThresholdOperator::Lt,
                value: 0.01,
                active: true,
            })
            .unwrap();

        // Stale until invalidation.
        assert!(cache.get("seller-1").unwrap().thresholds.is_empty());

        cache.invalidate();
        assert_eq!(cache.get("seller-1").unwrap().thresholds.len(), 1);
    }
}
