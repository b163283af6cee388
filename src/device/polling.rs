//! Polling cadence decisions
//!
//! Pure decision logic, no I/O: given a handler and the cycle's environment
//! (is a push-capable MQTT path active, is the route a rate-limited cloud
//! broker), decide whether to poll it now, let it ride along lazily, or skip.
//! The per-cycle cloud-request quota and the lazy fairness queue live here.

use std::time::Instant;

use tracing::trace;

use super::handlers::{NamespaceHandler, PollingPolicy};

/// Cloud requests allowed per polling cycle for `Smart` handlers.
pub const CLOUD_QUOTA_PER_CYCLE: usize = 1;

/// What the cycle's traffic looks like, as far as cadence is concerned.
#[derive(Debug, Clone, Copy, Default)]
pub struct CycleEnv {
    /// The active transport delivers pushes, so push-backed state is fresh.
    pub mqtt_push_active: bool,
    /// Requests travel through a rate-limited cloud broker.
    pub cloud_path: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Issue this handler's request now.
    Poll,
    /// Candidate for riding along when the batch has spare capacity.
    Lazy,
    Skip,
}

pub struct PollingScheduler {
    cloud_quota_max: usize,
    cloud_quota: usize,
    /// Lazy candidates ordered oldest-polled-first so none starves.
    lazy_queue: Vec<(Option<Instant>, String)>,
}

impl PollingScheduler {
    pub fn new(cloud_quota_max: usize) -> Self {
        Self {
            cloud_quota_max,
            cloud_quota: cloud_quota_max,
            lazy_queue: Vec::new(),
        }
    }

    /// Resets the cloud quota; called at the top of every cycle.
    pub fn begin_cycle(&mut self) {
        self.cloud_quota = self.cloud_quota_max;
        self.lazy_queue.clear();
    }

    pub fn decide(&mut self, handler: &NamespaceHandler, now: Instant, env: &CycleEnv) -> Decision {
        match handler.policy {
            PollingPolicy::None => Decision::Skip,
            PollingPolicy::Once => {
                if handler.last_response.is_some() {
                    Decision::Skip
                } else {
                    Decision::Poll
                }
            }
            PollingPolicy::Always => {
                if !handler.is_due(now) {
                    return Decision::Skip;
                }
                if env.mqtt_push_active && handler.recently_refreshed(now) {
                    trace!(namespace = %handler.namespace.name, "fresh via push, skipping poll");
                    return Decision::Skip;
                }
                Decision::Poll
            }
            PollingPolicy::Smart => {
                if !handler.is_due(now) {
                    return Decision::Skip;
                }
                if env.cloud_path {
                    if self.cloud_quota == 0 {
                        trace!(
                            namespace = %handler.namespace.name,
                            "cloud quota spent, deferring"
                        );
                        return Decision::Skip;
                    }
                    if let Some(last) = handler.last_request {
                        if now.duration_since(last) < handler.cloud_period {
                            return Decision::Skip;
                        }
                    }
                    self.cloud_quota -= 1;
                }
                Decision::Poll
            }
            PollingPolicy::Lazy => {
                if handler.is_due(now) {
                    Decision::Lazy
                } else {
                    Decision::Skip
                }
            }
        }
    }

    /// Inserts a lazy candidate keeping oldest-polled-first order; a handler
    /// never polled sorts before everything.
    pub fn enqueue_lazy(&mut self, name: &str, last_request: Option<Instant>) {
        let at = self
            .lazy_queue
            .partition_point(|(key, _)| *key <= last_request);
        self.lazy_queue.insert(at, (last_request, name.to_owned()));
    }

    pub fn pop_lazy(&mut self) -> Option<String> {
        if self.lazy_queue.is_empty() {
            None
        } else {
            Some(self.lazy_queue.remove(0).1)
        }
    }

    pub fn lazy_pending(&self) -> usize {
        self.lazy_queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::namespaces::NamespaceRegistry;
    use std::time::Duration;

    fn handler(name: &str) -> NamespaceHandler {
        NamespaceHandler::new(NamespaceRegistry::new().resolve(name))
    }

    #[test]
    fn smart_respects_cloud_quota() {
        let mut scheduler = PollingScheduler::new(1);
        let env = CycleEnv {
            mqtt_push_active: true,
            cloud_path: true,
        };
        let now = Instant::now();
        let electricity = handler("Appliance.Control.Electricity");
        let consumption = handler("Appliance.Control.ConsumptionX");

        scheduler.begin_cycle();
        assert_eq!(scheduler.decide(&electricity, now, &env), Decision::Poll);
        // quota of one is spent, the second smart handler waits a cycle
        assert_eq!(scheduler.decide(&consumption, now, &env), Decision::Skip);

        scheduler.begin_cycle();
        assert_eq!(scheduler.decide(&consumption, now, &env), Decision::Poll);
    }

    #[test]
    fn smart_stretches_to_cloud_period() {
        let mut scheduler = PollingScheduler::new(1);
        let env = CycleEnv {
            mqtt_push_active: false,
            cloud_path: true,
        };
        let mut electricity = handler("Appliance.Control.Electricity");
        let start = Instant::now();
        electricity.mark_requested(start);
        // past its local period but within the longer cloud period
        let later = start + electricity.period + Duration::from_secs(1);
        scheduler.begin_cycle();
        assert_eq!(scheduler.decide(&electricity, later, &env), Decision::Skip);
        let much_later = start + electricity.cloud_period;
        assert_eq!(
            scheduler.decide(&electricity, much_later, &env),
            Decision::Poll
        );
    }

    #[test]
    fn smart_is_unthrottled_off_cloud() {
        let mut scheduler = PollingScheduler::new(1);
        let env = CycleEnv::default();
        let now = Instant::now();
        scheduler.begin_cycle();
        assert_eq!(
            scheduler.decide(&handler("Appliance.Control.Electricity"), now, &env),
            Decision::Poll
        );
        assert_eq!(
            scheduler.decide(&handler("Appliance.Control.ConsumptionX"), now, &env),
            Decision::Poll
        );
    }

    #[test]
    fn always_skips_when_push_keeps_it_fresh() {
        let mut scheduler = PollingScheduler::new(1);
        let now = Instant::now();
        let mut state = handler("Appliance.RollerShutter.State");
        scheduler.begin_cycle();
        let quiet = CycleEnv::default();
        assert_eq!(scheduler.decide(&state, now, &quiet), Decision::Poll);

        state.handle(&serde_json::json!({ "state": [] }));
        let pushy = CycleEnv {
            mqtt_push_active: true,
            cloud_path: false,
        };
        assert_eq!(scheduler.decide(&state, now, &pushy), Decision::Skip);
    }

    #[test]
    fn once_polls_exactly_once() {
        let mut scheduler = PollingScheduler::new(1);
        let now = Instant::now();
        let mut debug = handler("Appliance.System.Debug");
        scheduler.begin_cycle();
        let env = CycleEnv::default();
        assert_eq!(scheduler.decide(&debug, now, &env), Decision::Poll);
        debug.handle(&serde_json::json!({ "debug": {} }));
        assert_eq!(scheduler.decide(&debug, now, &env), Decision::Skip);
    }

    #[test]
    fn lazy_queue_is_oldest_first_and_starvation_free() {
        let mut scheduler = PollingScheduler::new(1);
        let now = Instant::now();

        // three lazy handlers never polled: queue order is insertion order
        scheduler.begin_cycle();
        scheduler.enqueue_lazy("a", None);
        scheduler.enqueue_lazy("b", None);
        scheduler.enqueue_lazy("c", None);
        assert_eq!(scheduler.pop_lazy().as_deref(), Some("a"));
        assert_eq!(scheduler.pop_lazy().as_deref(), Some("b"));
        assert_eq!(scheduler.pop_lazy().as_deref(), Some("c"));
        assert_eq!(scheduler.pop_lazy(), None);

        // each polled exactly once before any is polled twice
        scheduler.begin_cycle();
        scheduler.enqueue_lazy("a", Some(now));
        scheduler.enqueue_lazy("c", Some(now + Duration::from_secs(2)));
        scheduler.enqueue_lazy("b", Some(now + Duration::from_secs(1)));
        assert_eq!(scheduler.pop_lazy().as_deref(), Some("a"));
        assert_eq!(scheduler.pop_lazy().as_deref(), Some("b"));
        assert_eq!(scheduler.pop_lazy().as_deref(), Some("c"));
    }
}
