use std::sync::Arc;

use crate::context::PluginContext;
use crate::error::{PluginError, PluginResult};
use crate::event::{Event, EventOutcome, Plugin};
use crate::metadata::PluginDescriptor;
use crate::PLUGIN_API_LEVEL;

struct RegisteredPlugin {
    descriptor: PluginDescriptor,
    plugin: Arc<dyn Plugin>,
}

/// Ordered set of plugins.
///
/// Registration order is dispatch order. The registry is built at boot and
/// then shared behind an `Arc`, so the order cannot change afterwards.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: Vec<RegisteredPlugin>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a plugin.
    ///
    /// # Errors
    ///
    /// Rejects an empty name, a name already registered, and an API level
    /// newer than this server understands.
    pub fn register(&mut self, plugin: Arc<dyn Plugin>) -> PluginResult<()> {
        let descriptor = plugin.descriptor().clone();

        if descriptor.name.trim().is_empty() {
            return Err(PluginError::InvalidMetadata(
                "plugin name cannot be empty".to_string(),
            ));
        }

        if self.plugins.iter().any(|p| p.descriptor.name == descriptor.name) {
            return Err(PluginError::DuplicatePlugin(descriptor.name));
        }

        if descriptor.api_level > PLUGIN_API_LEVEL {
            return Err(PluginError::UnsupportedApiLevel {
                name: descriptor.name,
                level: descriptor.api_level,
                supported: PLUGIN_API_LEVEL,
            });
        }

        if descriptor.api_level < PLUGIN_API_LEVEL {
            tracing::warn!(
                plugin = %descriptor.name,
                api_level = descriptor.api_level,
                "Plugin targets an older API level"
            );
        }

        tracing::info!(plugin = %descriptor, "Registered plugin");
        self.plugins.push(RegisteredPlugin { descriptor, plugin });
        Ok(())
    }

    /// Freezes the registry for sharing between tasks.
    pub fn freeze(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Descriptors in dispatch order.
    pub fn descriptors(&self) -> impl Iterator<Item = &PluginDescriptor> {
        self.plugins.iter().map(|p| &p.descriptor)
    }

    /// Runs `event` through every plugin that declared its kind.
    ///
    /// Stops at the first `Prevent` and returns it. A failing handler is
    /// logged and counts as `Continue`.
    pub async fn dispatch(&self, ctx: &dyn PluginContext, event: &mut Event<'_>) -> EventOutcome {
        let kind = event.kind();

        for entry in self.plugins.iter().filter(|p| p.descriptor.handles(kind)) {
            match entry.plugin.handle(ctx, event).await {
                Ok(EventOutcome::Continue) => {}
                Ok(EventOutcome::Prevent) => {
                    tracing::debug!(
                        plugin = %entry.descriptor.name,
                        event = %kind,
                        "Event prevented"
                    );
                    return EventOutcome::Prevent;
                }
                Err(e) => {
                    tracing::error!(
                        plugin = %entry.descriptor.name,
                        event = %kind,
                        error = %e,
                        "Plugin handler failed"
                    );
                }
            }
        }

        EventOutcome::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use async_trait::async_trait;
    use fsd9_core::{MetarRecord, Session};
    use parking_lot::Mutex;

    struct NullContext;

    #[async_trait]
    impl PluginContext for NullContext {
        fn send_to(&self, _callsign: &str, _line: &str) -> bool {
            false
        }
        fn broadcast(&self, _line: &str, _exclude: Option<&str>) -> usize {
            0
        }
        fn online_callsigns(&self) -> Vec<String> {
            Vec::new()
        }
        fn online_clients(&self) -> Vec<crate::context::ClientInfo> {
            Vec::new()
        }
        fn kick(&self, _callsign: &str) -> bool {
            false
        }
        async fn metar(&self, _icao: &str) -> Option<MetarRecord> {
            None
        }
        fn plugin_settings(&self, _plugin: &str) -> Option<serde_yaml::Value> {
            None
        }
    }

    enum Behaviour {
        Continue,
        Prevent,
        Fail,
    }

    struct Recorder {
        descriptor: PluginDescriptor,
        behaviour: Behaviour,
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl Recorder {
        fn new(name: &str, behaviour: Behaviour, calls: &Arc<Mutex<Vec<String>>>) -> Arc<Self> {
            Arc::new(Self {
                descriptor: PluginDescriptor::new(
                    name,
                    "1.0.0",
                    vec![EventKind::LineReceived, EventKind::AfterStart],
                ),
                behaviour,
                calls: calls.clone(),
            })
        }
    }

    #[async_trait]
    impl Plugin for Recorder {
        fn descriptor(&self) -> &PluginDescriptor {
            &self.descriptor
        }

        async fn handle(
            &self,
            _ctx: &dyn PluginContext,
            event: &mut Event<'_>,
        ) -> PluginResult<EventOutcome> {
            self.calls.lock().push(self.descriptor.name.clone());
            if let Some(session) = event.session_mut() {
                session.touch();
            }
            match self.behaviour {
                Behaviour::Continue => Ok(EventOutcome::Continue),
                Behaviour::Prevent => Ok(EventOutcome::Prevent),
                Behaviour::Fail => Err(PluginError::ExecutionError("boom".to_string())),
            }
        }
    }

    fn session() -> Session {
        Session::new("127.0.0.1:40000".parse().unwrap())
    }

    fn permutations(items: Vec<usize>) -> Vec<Vec<usize>> {
        if items.len() <= 1 {
            return vec![items];
        }
        let mut out = Vec::new();
        for i in 0..items.len() {
            let mut rest = items.clone();
            let head = rest.remove(i);
            for mut tail in permutations(rest) {
                tail.insert(0, head);
                out.push(tail);
            }
        }
        out
    }

    #[tokio::test]
    async fn test_prevent_stops_chain_in_every_order() {
        let names = ["alpha", "beta", "gamma"];

        for preventer in 0..names.len() {
            for order in permutations(vec![0, 1, 2]) {
                let calls = Arc::new(Mutex::new(Vec::new()));
                let mut registry = PluginRegistry::new();
                for &idx in &order {
                    let behaviour = if idx == preventer {
                        Behaviour::Prevent
                    } else {
                        Behaviour::Continue
                    };
                    registry
                        .register(Recorder::new(names[idx], behaviour, &calls))
                        .unwrap();
                }
                let registry = registry.freeze();

                let mut s = session();
                let mut event = Event::LineReceived {
                    session: &mut s,
                    line: "#TMN123:*:hi",
                };
                let outcome = registry.dispatch(&NullContext, &mut event).await;

                let mut default_ran = false;
                if outcome == EventOutcome::Continue {
                    default_ran = true;
                }

                let position = order.iter().position(|&i| i == preventer).unwrap();
                let expected: Vec<String> = order[..=position]
                    .iter()
                    .map(|&i| names[i].to_string())
                    .collect();

                assert_eq!(outcome, EventOutcome::Prevent);
                assert!(!default_ran);
                assert_eq!(*calls.lock(), expected, "order {:?}", order);
            }
        }
    }

    #[tokio::test]
    async fn test_failing_handler_counts_as_continue() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut registry = PluginRegistry::new();
        registry
            .register(Recorder::new("broken", Behaviour::Fail, &calls))
            .unwrap();
        registry
            .register(Recorder::new("next", Behaviour::Continue, &calls))
            .unwrap();

        let outcome = registry.dispatch(&NullContext, &mut Event::AfterStart).await;
        assert_eq!(outcome, EventOutcome::Continue);
        assert_eq!(*calls.lock(), vec!["broken", "next"]);
    }

    #[tokio::test]
    async fn test_only_declared_kinds_are_delivered() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut registry = PluginRegistry::new();
        registry
            .register(Recorder::new("alpha", Behaviour::Prevent, &calls))
            .unwrap();

        let outcome = registry.dispatch(&NullContext, &mut Event::BeforeStop).await;
        assert_eq!(outcome, EventOutcome::Continue);
        assert!(calls.lock().is_empty());
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut registry = PluginRegistry::new();
        registry
            .register(Recorder::new("alpha", Behaviour::Continue, &calls))
            .unwrap();
        let err = registry
            .register(Recorder::new("alpha", Behaviour::Continue, &calls))
            .unwrap_err();
        assert!(matches!(err, PluginError::DuplicatePlugin(name) if name == "alpha"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_api_level_checks() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut registry = PluginRegistry::new();

        let mut future = Recorder::new("future", Behaviour::Continue, &calls);
        Arc::get_mut(&mut future).unwrap().descriptor.api_level = PLUGIN_API_LEVEL + 1;
        assert!(matches!(
            registry.register(future),
            Err(PluginError::UnsupportedApiLevel { .. })
        ));

        let mut old = Recorder::new("old", Behaviour::Continue, &calls);
        Arc::get_mut(&mut old).unwrap().descriptor.api_level = 0;
        assert!(registry.register(old).is_ok());
    }

    #[test]
    fn test_empty_name_is_invalid() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut registry = PluginRegistry::new();
        assert!(matches!(
            registry.register(Recorder::new("", Behaviour::Continue, &calls)),
            Err(PluginError::InvalidMetadata(_))
        ));
        assert!(registry.is_empty());
    }
}
