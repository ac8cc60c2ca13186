use std::sync::Arc;

use serde_json::{Map, Value};

use cordon_proto::{ContractDetails, ExportInfo};

use crate::error::WorkerError;
use crate::host::Worker;

/// Inflight bookkeeping callbacks. `after_invoke` runs whether the remote
/// call succeeded or failed.
pub trait InvokeHooks: Send + Sync {
    fn before_invoke(&self);
    fn after_invoke(&self);
}

/// Presents the session service's operations as ordinary calls. Holds no
/// state of its own beyond the worker reference and the hooks; never
/// swallows or rewrites the error `invoke` returned.
#[derive(Clone)]
pub struct ServiceProxy {
    worker: Arc<dyn Worker>,
    hooks: Option<Arc<dyn InvokeHooks>>,
}

impl ServiceProxy {
    pub fn new(worker: Arc<dyn Worker>, hooks: Option<Arc<dyn InvokeHooks>>) -> Self {
        ServiceProxy { worker, hooks }
    }

    pub fn worker(&self) -> &Arc<dyn Worker> {
        &self.worker
    }

    pub fn invoke(
        &self,
        command: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<Value, WorkerError> {
        if let Some(hooks) = &self.hooks {
            hooks.before_invoke();
        }
        let result = self.worker.invoke(command, args, kwargs);
        if let Some(hooks) = &self.hooks {
            hooks.after_invoke();
        }
        result
    }

    pub fn stop(&self) {
        self.worker.stop();
    }

    fn invoke_decoded<T: serde::de::DeserializeOwned>(
        &self,
        command: &str,
        args: Vec<Value>,
    ) -> Result<T, WorkerError> {
        let value = self.invoke(command, args, Map::new())?;
        serde_json::from_value(value)
            .map_err(|err| WorkerError::Protocol(format!("{command}: {err}")))
    }

    pub fn hydrate_environment(
        &self,
        environment: &Map<String, Value>,
    ) -> Result<(), WorkerError> {
        self.invoke(
            "hydrate_environment",
            vec![Value::Object(environment.clone())],
            Map::new(),
        )?;
        Ok(())
    }

    pub fn snapshot_environment(&self) -> Result<Map<String, Value>, WorkerError> {
        self.invoke_decoded("snapshot_environment", vec![])
    }

    pub fn get_environment(&self) -> Result<Map<String, Value>, WorkerError> {
        self.invoke_decoded("get_environment", vec![])
    }

    pub fn set_environment_var(&self, key: &str, value: Value) -> Result<Value, WorkerError> {
        self.invoke(
            "set_environment_var",
            vec![Value::from(key), value],
            Map::new(),
        )
    }

    pub fn remove_environment_var(&self, key: &str) -> Result<(), WorkerError> {
        self.invoke("remove_environment_var", vec![Value::from(key)], Map::new())?;
        Ok(())
    }

    pub fn set_signer(&self, signer: &str) -> Result<String, WorkerError> {
        self.invoke_decoded("set_signer", vec![Value::from(signer)])
    }

    pub fn deploy(&self, name: &str, code: &str) -> Result<(), WorkerError> {
        self.invoke("deploy", vec![Value::from(name), Value::from(code)], Map::new())?;
        Ok(())
    }

    pub fn list_contracts(&self) -> Result<Vec<String>, WorkerError> {
        self.invoke_decoded("list_contracts", vec![])
    }

    pub fn get_export_metadata(&self, contract: &str) -> Result<Vec<ExportInfo>, WorkerError> {
        self.invoke_decoded("get_export_metadata", vec![Value::from(contract)])
    }

    pub fn get_contract_details(&self, contract: &str) -> Result<ContractDetails, WorkerError> {
        self.invoke_decoded("get_contract_details", vec![Value::from(contract)])
    }

    pub fn call(
        &self,
        contract: &str,
        function: &str,
        kwargs: Map<String, Value>,
    ) -> Result<Value, WorkerError> {
        self.invoke(
            "call",
            vec![Value::from(contract), Value::from(function), Value::Object(kwargs)],
            Map::new(),
        )
    }

    pub fn dump_state(&self, show_internal: bool) -> Result<String, WorkerError> {
        self.invoke_decoded("dump_state", vec![Value::Bool(show_internal)])
    }

    pub fn apply_state_snapshot(&self, snapshot: &Map<String, Value>) -> Result<(), WorkerError> {
        self.invoke(
            "apply_state_snapshot",
            vec![Value::Object(snapshot.clone())],
            Map::new(),
        )?;
        Ok(())
    }

    pub fn remove_contract(&self, name: &str) -> Result<(), WorkerError> {
        self.invoke("remove_contract", vec![Value::from(name)], Map::new())?;
        Ok(())
    }

    pub fn reset_state(&self) -> Result<(), WorkerError> {
        self.invoke("reset_state", vec![], Map::new())?;
        Ok(())
    }
}
