use crate::concurrency::CancelToken;
use crate::engine::EnvironmentEngine;
use crate::machine::Machine;
use crate::EngineError;
use berth_schema::{Environment, WorkspaceId};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Routes environments to the engine registered for their type tag.
#[derive(Default)]
pub struct EngineDispatcher {
    engines: BTreeMap<String, Arc<dyn EnvironmentEngine>>,
}

impl EngineDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, engine: Arc<dyn EnvironmentEngine>) -> Self {
        self.register(engine);
        self
    }

    /// Register `engine` under its type tag, replacing any previous engine.
    pub fn register(&mut self, engine: Arc<dyn EnvironmentEngine>) -> Option<Arc<dyn EnvironmentEngine>> {
        self.engines
            .insert(engine.engine_type().to_lowercase(), engine)
    }

    pub fn engine(&self, env_type: &str) -> Result<Arc<dyn EnvironmentEngine>, EngineError> {
        self.engines
            .get(&env_type.to_lowercase())
            .cloned()
            .ok_or_else(|| EngineError::UnknownEngineType(env_type.to_owned()))
    }

    pub fn types(&self) -> impl Iterator<Item = &str> {
        self.engines.keys().map(String::as_str)
    }

    pub fn start(
        &self,
        workspace: &WorkspaceId,
        env: &Environment,
        recover: bool,
    ) -> Result<Vec<Machine>, EngineError> {
        self.engine(env.env_type())?.start(workspace, env, recover)
    }

    pub fn start_with_cancel(
        &self,
        workspace: &WorkspaceId,
        env: &Environment,
        recover: bool,
        cancel: &CancelToken,
    ) -> Result<Vec<Machine>, EngineError> {
        self.engine(env.env_type())?
            .start_with_cancel(workspace, env, recover, cancel)
    }

    pub fn stop(&self, workspace: &WorkspaceId, env_type: &str) -> Result<(), EngineError> {
        self.engine(env_type)?.stop(workspace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::ContainerEngine;
    use crate::registry::Registry;
    use berth_runtime::{MachineRuntime, MockRuntime};
    use berth_schema::MachineConfig;

    fn dispatcher(runtime: &Arc<MockRuntime>, registry: &Arc<Registry>) -> EngineDispatcher {
        let engine = ContainerEngine::new(
            Arc::clone(runtime) as Arc<dyn MachineRuntime>,
            Arc::clone(registry),
            EngineConfig::default(),
        );
        EngineDispatcher::new().with(Arc::new(engine))
    }

    #[test]
    fn routes_on_environment_type() {
        let runtime = Arc::new(MockRuntime::new());
        let registry = Arc::new(Registry::new());
        let dispatcher = dispatcher(&runtime, &registry);
        let ws = WorkspaceId::new("ws1");
        let env = Environment::new("dev", "Docker")
            .with_machine("shell", MachineConfig::from_image("alpine:3"));

        let machines = dispatcher.start(&ws, &env, false).unwrap();
        assert_eq!(machines.len(), 1);
        assert_eq!(registry.snapshot(&ws).unwrap().engine_type, "docker");

        dispatcher.stop(&ws, "docker").unwrap();
        assert!(!registry.is_registered(&ws));
    }

    #[test]
    fn unknown_type_is_rejected_before_any_runtime_call() {
        let runtime = Arc::new(MockRuntime::new());
        let dispatcher = dispatcher(&runtime, &Arc::new(Registry::new()));
        let env = Environment::new("dev", "kubernetes")
            .with_machine("shell", MachineConfig::from_image("alpine:3"));
        let err = dispatcher
            .start(&WorkspaceId::new("ws1"), &env, false)
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownEngineType(t) if t == "kubernetes"));
        assert!(runtime.calls().is_empty());
        assert!(dispatcher.stop(&WorkspaceId::new("ws1"), "kubernetes").is_err());
    }

    #[test]
    fn register_replaces_existing_engine() {
        let runtime = Arc::new(MockRuntime::new());
        let registry = Arc::new(Registry::new());
        let mut dispatcher = dispatcher(&runtime, &registry);
        let replacement = ContainerEngine::new(
            Arc::clone(&runtime) as Arc<dyn MachineRuntime>,
            registry,
            EngineConfig::default(),
        );
        assert!(dispatcher.register(Arc::new(replacement)).is_some());
        assert_eq!(dispatcher.types().collect::<Vec<_>>(), ["docker"]);
    }
}
