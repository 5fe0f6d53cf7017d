//! Shared detector helpers: whitelist checks, threshold evaluation, severity
//! banding, and the dedupe hash.

use sha2::{Digest, Sha256};

use crate::models::{RuleContext, RuleType, Severity, Threshold, WhitelistScope};

/// Length of the truncated dedupe/snapshot digests, in hex characters.
pub const HASH_LEN: usize = 16;

/// True iff an active whitelist entry matches this seller, scope, and value.
pub fn is_whitelisted(ctx: &RuleContext, scope: WhitelistScope, value: &str) -> bool {
    ctx.whitelist.iter().any(|w| {
        w.active && w.seller_id == ctx.seller_id && w.scope == scope && w.value == value
    })
}

/// Convenience: whitelisted under any of SKU/ASIN/VENDOR for one item.
pub fn item_whitelisted(
    ctx: &RuleContext,
    sku: &str,
    asin: &str,
    vendor: Option<&str>,
) -> bool {
    if is_whitelisted(ctx, WhitelistScope::Sku, sku) {
        return true;
    }
    if is_whitelisted(ctx, WhitelistScope::Asin, asin) {
        return true;
    }
    if let Some(v) = vendor {
        if is_whitelisted(ctx, WhitelistScope::Vendor, v) {
            return true;
        }
    }
    false
}

/// True iff the trigger condition fires for at least one threshold.
/// Rules consult multiple thresholds (percentage AND absolute value) and
/// fire when any applies.
pub fn any_threshold_triggers(observed: f64, thresholds: &[&Threshold]) -> bool {
    thresholds.iter().any(|t| t.triggers(observed))
}

/// Severity band for a [0,1] score.
pub fn calculate_severity(score: f64) -> Severity {
    if score < 0.6 {
        Severity::Low
    } else if score < 0.75 {
        Severity::Medium
    } else if score < 0.9 {
        Severity::High
    } else {
        Severity::Critical
    }
}

/// Clamp a raw score into the usable severity band. Small findings still land
/// at 0.5 rather than vanishing, and threshold-driven rules cap at 0.9.
pub fn clamp_score(raw: f64) -> f64 {
    raw.clamp(0.5, 0.9)
}

/// Stable 16-hex digest of (seller_id, rule_type, core_fields).
///
/// `core_fields` must be built deterministically by the rule; serde_json
/// serializes object keys in sorted order, so the canonical form is the
/// default serialization.
pub fn dedupe_hash(seller_id: &str, rule_type: RuleType, core_fields: &serde_json::Value) -> String {
    let canonical = core_fields.to_string();
    let mut hasher = Sha256::new();
    hasher.update(seller_id.as_bytes());
    hasher.update(b"|");
    hasher.update(rule_type.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(canonical.as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..HASH_LEN].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ThresholdOperator, WhitelistItem};
    use serde_json::json;

    fn ctx_with_whitelist(items: Vec<WhitelistItem>) -> RuleContext {
        let mut ctx = RuleContext::new("seller-1");
        ctx.whitelist = items;
        ctx
    }

    #[test]
    fn test_whitelist_matching() {
        let ctx = ctx_with_whitelist(vec![WhitelistItem {
            id: None,
            seller_id: "seller-1".into(),
            scope: WhitelistScope::Sku,
            value: "SKU001".into(),
            active: true,
        }]);

        assert!(is_whitelisted(&ctx, WhitelistScope::Sku, "SKU001"));
        assert!(!is_whitelisted(&ctx, WhitelistScope::Sku, "SKU002"));
        assert!(!is_whitelisted(&ctx, WhitelistScope::Asin, "SKU001"));
    }

    #[test]
    fn test_inactive_whitelist_entry_ignored() {
        let ctx = ctx_with_whitelist(vec![WhitelistItem {
            id: None,
            seller_id: "seller-1".into(),
            scope: WhitelistScope::Vendor,
            value: "Vendor A".into(),
            active: false,
        }]);
        assert!(!item_whitelisted(&ctx, "SKU001", "B0", Some("Vendor A")));
    }

    #[test]
    fn test_severity_bands() {
        assert_eq!(calculate_severity(0.5), Severity::Low);
        assert_eq!(calculate_severity(0.59), Severity::Low);
        assert_eq!(calculate_severity(0.6), Severity::Medium);
        assert_eq!(calculate_severity(0.74), Severity::Medium);
        assert_eq!(calculate_severity(0.75), Severity::High);
        assert_eq!(calculate_severity(0.89), Severity::High);
        assert_eq!(calculate_severity(0.9), Severity::Critical);
        assert_eq!(calculate_severity(1.0), Severity::Critical);
    }

    #[test]
    fn test_score_clamp() {
        assert_eq!(clamp_score(0.01), 0.5);
        assert_eq!(clamp_score(0.7), 0.7);
        assert_eq!(clamp_score(4.2), 0.9);
    }

    #[test]
    fn test_dedupe_hash_stability_and_sensitivity() {
        let fields = json!({"sku": "SKU001", "asin": "B001234567", "units": 10, "value": 50.0, "vendor": "Vendor A"});
        let h1 = dedupe_hash("seller-1", RuleType::LostUnits, &fields);
        let h2 = dedupe_hash("seller-1", RuleType::LostUnits, &fields);
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), HASH_LEN);

        let other = json!({"sku": "SKU002", "asin": "B001234567", "units": 10, "value": 50.0, "vendor": "Vendor A"});
        assert_ne!(h1, dedupe_hash("seller-1", RuleType::LostUnits, &other));
        assert_ne!(h1, dedupe_hash("seller-2", RuleType::LostUnits, &fields));
        assert_ne!(h1, dedupe_hash("seller-1", RuleType::DamagedStock, &fields));
    }

    #[test]
    fn test_any_threshold_triggers() {
        let pct = Threshold {
            id: None,
            rule_type: RuleType::LostUnits,
            seller_id: None,
            operator: ThresholdOperator::Lt,
            value: 0.01,
            active: true,
        };
        let abs = Threshold {
            id: None,
            rule_type: RuleType::LostUnits,
            seller_id: None,
            operator: ThresholdOperator::Lt,
            value: 5.0,
            active: true,
        };
        // Fires when either metric crosses its floor.
        assert!(any_threshold_triggers(0.1, &[&pct]));
        assert!(any_threshold_triggers(50.0, &[&abs]));
        assert!(!any_threshold_triggers(0.001, &[&pct]));
    }
}
