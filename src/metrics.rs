// Counter and gauge helpers. Compiled to no-ops unless the `observability`
// feature is enabled, so call sites stay unconditional.

pub fn increment_decode_failed(variant: &str) {
    #[cfg(feature = "observability")]
    metrics::counter!("whitelist_decode_failed_total", 1, "variant" => variant.to_string());
    #[cfg(not(feature = "observability"))]
    let _ = variant;
}

pub fn increment_state_read_failed(protocol: &str) {
    #[cfg(feature = "observability")]
    metrics::counter!("whitelist_state_read_failed_total", 1, "protocol" => protocol.to_string());
    #[cfg(not(feature = "observability"))]
    let _ = protocol;
}

pub fn increment_pools_upserted(count: u64) {
    #[cfg(feature = "observability")]
    metrics::counter!("whitelist_pools_upserted_total", count);
    #[cfg(not(feature = "observability"))]
    let _ = count;
}

pub fn increment_filter_passed(pass_type: &str) {
    #[cfg(feature = "observability")]
    metrics::counter!("whitelist_filter_passed_total", 1, "pass_type" => pass_type.to_string());
    #[cfg(not(feature = "observability"))]
    let _ = pass_type;
}

pub fn increment_filter_rejected(reason: &str) {
    #[cfg(feature = "observability")]
    metrics::counter!("whitelist_filter_rejected_total", 1, "reason" => reason.to_string());
    #[cfg(not(feature = "observability"))]
    let _ = reason;
}

pub fn increment_batches_scraped(protocol: &str) {
    #[cfg(feature = "observability")]
    metrics::counter!("whitelist_batches_scraped_total", 1, "protocol" => protocol.to_string());
    #[cfg(not(feature = "observability"))]
    let _ = protocol;
}

pub fn increment_broker_publish_failed(subject_kind: &str) {
    #[cfg(feature = "observability")]
    metrics::counter!("whitelist_broker_publish_failed_total", 1, "kind" => subject_kind.to_string());
    #[cfg(not(feature = "observability"))]
    let _ = subject_kind;
}

pub fn increment_pools_missing_decimals(count: u64) {
    #[cfg(feature = "observability")]
    metrics::counter!("whitelist_full_broadcast_excluded_total", count);
    #[cfg(not(feature = "observability"))]
    let _ = count;
}

pub fn set_whitelist_size(chain: &str, size: f64) {
    #[cfg(feature = "observability")]
    metrics::gauge!("whitelist_pool_count", size, "chain" => chain.to_string());
    #[cfg(not(feature = "observability"))]
    let _ = (chain, size);
}
