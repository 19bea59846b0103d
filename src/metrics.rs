//! Prometheus metrics for the manager.
//!
//! Compiled to no-ops when the `metrics` feature is off, so call sites
//! stay unconditional.

#[cfg(feature = "metrics")]
mod imp {
    use once_cell::sync::Lazy;
    use prometheus_client::encoding::text::encode;
    use prometheus_client::metrics::counter::Counter;
    use prometheus_client::registry::Registry;
    use std::sync::Mutex;

    pub static DEPLOYS: Lazy<Counter> = Lazy::new(Counter::default);
    pub static EVENTS_DISPATCHED: Lazy<Counter> = Lazy::new(Counter::default);
    pub static WATCH_RESTARTS: Lazy<Counter> = Lazy::new(Counter::default);
    pub static IMAGE_CACHE_HITS: Lazy<Counter> = Lazy::new(Counter::default);
    pub static IMAGE_CACHE_MISSES: Lazy<Counter> = Lazy::new(Counter::default);

    pub static REGISTRY: Lazy<Mutex<Registry>> = Lazy::new(|| {
        let mut registry = Registry::default();
        registry.register(
            "orbiter_deploys",
            "Deploy operations processed",
            DEPLOYS.clone(),
        );
        registry.register(
            "orbiter_events_dispatched",
            "Subscriber callback invocations launched",
            EVENTS_DISPATCHED.clone(),
        );
        registry.register(
            "orbiter_watch_restarts",
            "Watch stream reconnects",
            WATCH_RESTARTS.clone(),
        );
        registry.register(
            "orbiter_image_cache_hits",
            "Image validation cache hits",
            IMAGE_CACHE_HITS.clone(),
        );
        registry.register(
            "orbiter_image_cache_misses",
            "Image validation cache misses",
            IMAGE_CACHE_MISSES.clone(),
        );
        Mutex::new(registry)
    });

    pub fn render() -> String {
        let registry = REGISTRY.lock().expect("metrics registry lock poisoned");
        let mut out = String::new();
        if encode(&mut out, &registry).is_err() {
            out.clear();
        }
        out
    }
}

pub fn inc_deploys() {
    #[cfg(feature = "metrics")]
    imp::DEPLOYS.inc();
}

pub fn inc_events_dispatched() {
    #[cfg(feature = "metrics")]
    imp::EVENTS_DISPATCHED.inc();
}

pub fn inc_watch_restarts() {
    #[cfg(feature = "metrics")]
    imp::WATCH_RESTARTS.inc();
}

pub fn inc_image_cache_hit() {
    #[cfg(feature = "metrics")]
    imp::IMAGE_CACHE_HITS.inc();
}

pub fn inc_image_cache_miss() {
    #[cfg(feature = "metrics")]
    imp::IMAGE_CACHE_MISSES.inc();
}

/// Render the registry in the Prometheus text format. Empty when the
/// feature is off.
pub fn render() -> String {
    #[cfg(feature = "metrics")]
    {
        imp::render()
    }
    #[cfg(not(feature = "metrics"))]
    {
        String::new()
    }
}

#[cfg(all(test, feature = "metrics"))]
mod tests {
    use super::*;

    #[test]
    fn counters_appear_in_rendered_output() {
        inc_deploys();
        inc_watch_restarts();
        let text = render();
        assert!(text.contains("orbiter_deploys"));
        assert!(text.contains("orbiter_watch_restarts"));
    }
}
