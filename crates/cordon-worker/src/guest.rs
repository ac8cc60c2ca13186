//! Guest side of the worker boundary: the session service seam and the
//! command dispatch loop that runs inside the worker process.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Read, Write};

use serde_json::{Map, Value};

use cordon_proto::{
    read_frame, write_message, ContractDetails, ExportInfo, RemoteExceptionPayload, Request,
    Response,
};

/// The opaque capability a worker hosts. The runtime forwards every command
/// verbatim; implementations interpret arguments and results.
pub trait SessionService {
    fn hydrate_environment(&mut self, environment: &Map<String, Value>)
        -> Result<(), ServiceError>;
    fn snapshot_environment(&self) -> Result<Map<String, Value>, ServiceError>;
    fn get_environment(&self) -> Result<Map<String, Value>, ServiceError>;
    fn set_environment_var(&mut self, key: &str, value: &Value) -> Result<Value, ServiceError>;
    fn remove_environment_var(&mut self, key: &str) -> Result<(), ServiceError>;
    fn set_signer(&mut self, signer: &str) -> Result<String, ServiceError>;
    fn deploy(&mut self, name: &str, code: &str) -> Result<(), ServiceError>;
    fn list_contracts(&self) -> Result<Vec<String>, ServiceError>;
    fn get_export_metadata(&self, contract: &str) -> Result<Vec<ExportInfo>, ServiceError>;
    fn get_contract_details(&self, contract: &str) -> Result<ContractDetails, ServiceError>;
    fn call(
        &mut self,
        contract: &str,
        function: &str,
        kwargs: &Map<String, Value>,
    ) -> Result<Value, ServiceError>;
    fn dump_state(&self, show_internal: bool) -> Result<String, ServiceError>;
    fn apply_state_snapshot(&mut self, snapshot: &Map<String, Value>)
        -> Result<(), ServiceError>;
    fn remove_contract(&mut self, name: &str) -> Result<(), ServiceError>;
    fn reset_state(&mut self) -> Result<(), ServiceError>;
}

/// Failure raised by a session service. Crosses the process boundary as a
/// [`RemoteExceptionPayload`], never as a live error value.
#[derive(Debug)]
pub enum ServiceError {
    Invalid(String),
    NotFound(String),
    Unsupported(String),
    Io(io::Error),
}

impl ServiceError {
    pub fn invalid(message: impl Into<String>) -> Self {
        ServiceError::Invalid(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        ServiceError::NotFound(message.into())
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        ServiceError::Unsupported(message.into())
    }

    pub fn exc_type(&self) -> &'static str {
        match self {
            ServiceError::Invalid(_) => "InvalidInput",
            ServiceError::NotFound(_) => "NotFound",
            ServiceError::Unsupported(_) => "Unsupported",
            ServiceError::Io(_) => "Io",
        }
    }

    pub fn to_payload(&self) -> RemoteExceptionPayload {
        RemoteExceptionPayload::new(self.exc_type(), module_path!(), self.to_string(), "")
    }
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceError::Invalid(msg)
            | ServiceError::NotFound(msg)
            | ServiceError::Unsupported(msg) => f.write_str(msg),
            ServiceError::Io(err) => write!(f, "io error: {err}"),
        }
    }
}

impl std::error::Error for ServiceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServiceError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for ServiceError {
    fn from(err: io::Error) -> Self {
        ServiceError::Io(err)
    }
}

type Handler<S> = fn(&mut S, &[Value], &Map<String, Value>) -> Result<Value, ServiceError>;

/// Explicit command table, built once at worker startup. An unknown command
/// is a structural condition answered with an error response, not a
/// reflection failure.
pub struct Registry<S: SessionService> {
    handlers: BTreeMap<&'static str, Handler<S>>,
}

impl<S: SessionService> Default for Registry<S> {
    fn default() -> Self {
        Registry::standard()
    }
}

impl<S: SessionService> Registry<S> {
    pub fn standard() -> Self {
        let mut handlers: BTreeMap<&'static str, Handler<S>> = BTreeMap::new();
        handlers.insert("hydrate_environment", handlers::hydrate_environment);
        handlers.insert("snapshot_environment", handlers::snapshot_environment);
        handlers.insert("get_environment", handlers::get_environment);
        handlers.insert("set_environment_var", handlers::set_environment_var);
        handlers.insert("remove_environment_var", handlers::remove_environment_var);
        handlers.insert("set_signer", handlers::set_signer);
        handlers.insert("deploy", handlers::deploy);
        handlers.insert("list_contracts", handlers::list_contracts);
        handlers.insert("get_export_metadata", handlers::get_export_metadata);
        handlers.insert("get_contract_details", handlers::get_contract_details);
        handlers.insert("call", handlers::call);
        handlers.insert("dump_state", handlers::dump_state);
        handlers.insert("apply_state_snapshot", handlers::apply_state_snapshot);
        handlers.insert("remove_contract", handlers::remove_contract);
        handlers.insert("reset_state", handlers::reset_state);
        Registry { handlers }
    }

    pub fn commands(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.handlers.keys().copied()
    }

    pub fn dispatch(&self, service: &mut S, request: &Request) -> Response {
        let Some(handler) = self.handlers.get(request.command()) else {
            let payload = RemoteExceptionPayload::new(
                "UnknownCommand",
                module_path!(),
                format!("unknown command {:?}", request.command()),
                "",
            );
            return Response::error(&payload);
        };
        match handler(service, request.args(), request.kwargs()) {
            Ok(value) => Response::ok(value),
            Err(err) => Response::error(&err.to_payload()),
        }
    }
}

/// Serve one session service over a duplex byte channel until the shutdown
/// command or EOF. Malformed and unknown requests get error responses; only
/// channel-level I/O failures abort the loop.
pub fn serve<S: SessionService>(
    service: &mut S,
    reader: &mut impl Read,
    writer: &mut impl Write,
) -> io::Result<()> {
    let registry = Registry::standard();
    loop {
        let Some(payload) = read_frame(reader)? else {
            break;
        };
        let request: Request = match serde_json::from_slice(&payload) {
            Ok(request) => request,
            Err(err) => {
                let payload = RemoteExceptionPayload::new(
                    "InvalidRequest",
                    module_path!(),
                    format!("invalid message: {err}"),
                    "",
                );
                write_message(writer, &Response::error(&payload))?;
                continue;
            }
        };
        if request.is_shutdown() {
            write_message(writer, &Response::ok(Value::Null))?;
            break;
        }
        let response = registry.dispatch(service, &request);
        write_message(writer, &response)?;
    }
    Ok(())
}

mod handlers {
    use super::*;

    // Arguments arrive positionally, by keyword, or mixed; the original
    // callers used both forms.
    fn arg<'a>(
        args: &'a [Value],
        kwargs: &'a Map<String, Value>,
        index: usize,
        name: &str,
    ) -> Option<&'a Value> {
        args.get(index).or_else(|| kwargs.get(name))
    }

    fn required_str<'a>(
        args: &'a [Value],
        kwargs: &'a Map<String, Value>,
        index: usize,
        name: &str,
    ) -> Result<&'a str, ServiceError> {
        match arg(args, kwargs, index, name) {
            Some(Value::String(s)) => Ok(s),
            Some(_) => Err(ServiceError::invalid(format!("argument {name:?} must be a string"))),
            None => Err(ServiceError::invalid(format!("missing argument {name:?}"))),
        }
    }

    fn required_object<'a>(
        args: &'a [Value],
        kwargs: &'a Map<String, Value>,
        index: usize,
        name: &str,
    ) -> Result<&'a Map<String, Value>, ServiceError> {
        match arg(args, kwargs, index, name) {
            Some(Value::Object(map)) => Ok(map),
            Some(_) => Err(ServiceError::invalid(format!("argument {name:?} must be an object"))),
            None => Err(ServiceError::invalid(format!("missing argument {name:?}"))),
        }
    }

    fn optional_bool(
        args: &[Value],
        kwargs: &Map<String, Value>,
        index: usize,
        name: &str,
        default: bool,
    ) -> Result<bool, ServiceError> {
        match arg(args, kwargs, index, name) {
            Some(Value::Bool(b)) => Ok(*b),
            Some(Value::Null) | None => Ok(default),
            Some(_) => Err(ServiceError::invalid(format!("argument {name:?} must be a boolean"))),
        }
    }

    pub(super) fn hydrate_environment<S: SessionService>(
        service: &mut S,
        args: &[Value],
        kwargs: &Map<String, Value>,
    ) -> Result<Value, ServiceError> {
        let environment = required_object(args, kwargs, 0, "environment")?;
        service.hydrate_environment(environment)?;
        Ok(Value::Null)
    }

    pub(super) fn snapshot_environment<S: SessionService>(
        service: &mut S,
        _args: &[Value],
        _kwargs: &Map<String, Value>,
    ) -> Result<Value, ServiceError> {
        Ok(Value::Object(service.snapshot_environment()?))
    }

    pub(super) fn get_environment<S: SessionService>(
        service: &mut S,
        _args: &[Value],
        _kwargs: &Map<String, Value>,
    ) -> Result<Value, ServiceError> {
        Ok(Value::Object(service.get_environment()?))
    }

    pub(super) fn set_environment_var<S: SessionService>(
        service: &mut S,
        args: &[Value],
        kwargs: &Map<String, Value>,
    ) -> Result<Value, ServiceError> {
        let key = required_str(args, kwargs, 0, "key")?;
        let value = arg(args, kwargs, 1, "value")
            .ok_or_else(|| ServiceError::invalid("missing argument \"value\""))?;
        service.set_environment_var(key, value)
    }

    pub(super) fn remove_environment_var<S: SessionService>(
        service: &mut S,
        args: &[Value],
        kwargs: &Map<String, Value>,
    ) -> Result<Value, ServiceError> {
        let key = required_str(args, kwargs, 0, "key")?;
        service.remove_environment_var(key)?;
        Ok(Value::Null)
    }

    pub(super) fn set_signer<S: SessionService>(
        service: &mut S,
        args: &[Value],
        kwargs: &Map<String, Value>,
    ) -> Result<Value, ServiceError> {
        let signer = required_str(args, kwargs, 0, "signer")?;
        Ok(Value::String(service.set_signer(signer)?))
    }

    pub(super) fn deploy<S: SessionService>(
        service: &mut S,
        args: &[Value],
        kwargs: &Map<String, Value>,
    ) -> Result<Value, ServiceError> {
        let name = required_str(args, kwargs, 0, "name")?;
        let code = required_str(args, kwargs, 1, "code")?;
        service.deploy(name, code)?;
        Ok(Value::Null)
    }

    pub(super) fn list_contracts<S: SessionService>(
        service: &mut S,
        _args: &[Value],
        _kwargs: &Map<String, Value>,
    ) -> Result<Value, ServiceError> {
        let contracts = service.list_contracts()?;
        Ok(Value::Array(contracts.into_iter().map(Value::String).collect()))
    }

    pub(super) fn get_export_metadata<S: SessionService>(
        service: &mut S,
        args: &[Value],
        kwargs: &Map<String, Value>,
    ) -> Result<Value, ServiceError> {
        let contract = required_str(args, kwargs, 0, "contract")?;
        let exports = service.get_export_metadata(contract)?;
        serde_json::to_value(exports)
            .map_err(|err| ServiceError::invalid(format!("unencodable exports: {err}")))
    }

    pub(super) fn get_contract_details<S: SessionService>(
        service: &mut S,
        args: &[Value],
        kwargs: &Map<String, Value>,
    ) -> Result<Value, ServiceError> {
        let contract = required_str(args, kwargs, 0, "contract")?;
        let details = service.get_contract_details(contract)?;
        serde_json::to_value(details)
            .map_err(|err| ServiceError::invalid(format!("unencodable details: {err}")))
    }

    pub(super) fn call<S: SessionService>(
        service: &mut S,
        args: &[Value],
        kwargs: &Map<String, Value>,
    ) -> Result<Value, ServiceError> {
        let contract = required_str(args, kwargs, 0, "contract")?;
        let function = required_str(args, kwargs, 1, "function")?;
        let call_kwargs = required_object(args, kwargs, 2, "kwargs")?;
        service.call(contract, function, call_kwargs)
    }

    pub(super) fn dump_state<S: SessionService>(
        service: &mut S,
        args: &[Value],
        kwargs: &Map<String, Value>,
    ) -> Result<Value, ServiceError> {
        let show_internal = optional_bool(args, kwargs, 0, "show_internal", false)?;
        Ok(Value::String(service.dump_state(show_internal)?))
    }

    pub(super) fn apply_state_snapshot<S: SessionService>(
        service: &mut S,
        args: &[Value],
        kwargs: &Map<String, Value>,
    ) -> Result<Value, ServiceError> {
        let snapshot = required_object(args, kwargs, 0, "snapshot")?;
        service.apply_state_snapshot(snapshot)?;
        Ok(Value::Null)
    }

    pub(super) fn remove_contract<S: SessionService>(
        service: &mut S,
        args: &[Value],
        kwargs: &Map<String, Value>,
    ) -> Result<Value, ServiceError> {
        let name = required_str(args, kwargs, 0, "name")?;
        service.remove_contract(name)?;
        Ok(Value::Null)
    }

    pub(super) fn reset_state<S: SessionService>(
        service: &mut S,
        _args: &[Value],
        _kwargs: &Map<String, Value>,
    ) -> Result<Value, ServiceError> {
        service.reset_state()?;
        Ok(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cordon_proto::Status;

    #[derive(Default)]
    struct EchoService {
        environment: Map<String, Value>,
        contracts: Vec<String>,
    }

    impl SessionService for EchoService {
        fn hydrate_environment(
            &mut self,
            environment: &Map<String, Value>,
        ) -> Result<(), ServiceError> {
            self.environment = environment.clone();
            Ok(())
        }

        fn snapshot_environment(&self) -> Result<Map<String, Value>, ServiceError> {
            Ok(self.environment.clone())
        }

        fn get_environment(&self) -> Result<Map<String, Value>, ServiceError> {
            Ok(self.environment.clone())
        }

        fn set_environment_var(
            &mut self,
            key: &str,
            value: &Value,
        ) -> Result<Value, ServiceError> {
            if key.trim().is_empty() {
                return Err(ServiceError::invalid("Environment key cannot be empty."));
            }
            self.environment.insert(key.to_string(), value.clone());
            Ok(value.clone())
        }

        fn remove_environment_var(&mut self, key: &str) -> Result<(), ServiceError> {
            self.environment.remove(key);
            Ok(())
        }

        fn set_signer(&mut self, signer: &str) -> Result<String, ServiceError> {
            self.environment.insert("signer".to_string(), Value::from(signer));
            Ok(signer.to_string())
        }

        fn deploy(&mut self, name: &str, _code: &str) -> Result<(), ServiceError> {
            self.contracts.push(name.to_string());
            Ok(())
        }

        fn list_contracts(&self) -> Result<Vec<String>, ServiceError> {
            Ok(self.contracts.clone())
        }

        fn get_export_metadata(&self, _contract: &str) -> Result<Vec<ExportInfo>, ServiceError> {
            Ok(vec![])
        }

        fn get_contract_details(&self, contract: &str) -> Result<ContractDetails, ServiceError> {
            Err(ServiceError::not_found(format!("Contract '{contract}' is not deployed.")))
        }

        fn call(
            &mut self,
            _contract: &str,
            _function: &str,
            _kwargs: &Map<String, Value>,
        ) -> Result<Value, ServiceError> {
            Err(ServiceError::unsupported("no engine"))
        }

        fn dump_state(&self, _show_internal: bool) -> Result<String, ServiceError> {
            Ok("{}".to_string())
        }

        fn apply_state_snapshot(
            &mut self,
            _snapshot: &Map<String, Value>,
        ) -> Result<(), ServiceError> {
            Ok(())
        }

        fn remove_contract(&mut self, _name: &str) -> Result<(), ServiceError> {
            Ok(())
        }

        fn reset_state(&mut self) -> Result<(), ServiceError> {
            self.contracts.clear();
            self.environment.clear();
            Ok(())
        }
    }

    fn request(command: &str, args: Vec<Value>) -> Request {
        Request::new(command, args, Map::new())
    }

    #[test]
    fn dispatch_routes_positional_arguments() {
        let registry = Registry::standard();
        let mut service = EchoService::default();
        let response = registry.dispatch(
            &mut service,
            &request("deploy", vec![Value::from("con_a"), Value::from("code")]),
        );
        assert_eq!(response.status(), Status::Ok);
        assert_eq!(service.contracts, vec!["con_a"]);
    }

    #[test]
    fn dispatch_routes_keyword_arguments() {
        let registry = Registry::standard();
        let mut service = EchoService::default();
        let mut kwargs = Map::new();
        kwargs.insert("name".to_string(), Value::from("con_b"));
        kwargs.insert("code".to_string(), Value::from("code"));
        let response =
            registry.dispatch(&mut service, &Request::new("deploy", vec![], kwargs));
        assert_eq!(response.status(), Status::Ok);
        assert_eq!(service.contracts, vec!["con_b"]);
    }

    #[test]
    fn unknown_command_is_an_error_response() {
        let registry = Registry::standard();
        let mut service = EchoService::default();
        let response = registry.dispatch(&mut service, &request("frobnicate", vec![]));
        assert_eq!(response.status(), Status::Error);
        let payload = RemoteExceptionPayload::from_raw(response.payload());
        assert_eq!(payload.exc_type, "UnknownCommand");
        assert!(payload.message.contains("frobnicate"));
    }

    #[test]
    fn service_errors_become_error_responses() {
        let registry = Registry::standard();
        let mut service = EchoService::default();
        let response = registry.dispatch(
            &mut service,
            &request(
                "call",
                vec![Value::from("con_a"), Value::from("f"), Value::Object(Map::new())],
            ),
        );
        assert_eq!(response.status(), Status::Error);
        let payload = RemoteExceptionPayload::from_raw(response.payload());
        assert_eq!(payload.exc_type, "Unsupported");
    }

    #[test]
    fn missing_arguments_are_rejected_locally() {
        let registry = Registry::standard();
        let mut service = EchoService::default();
        let response = registry.dispatch(&mut service, &request("deploy", vec![]));
        assert_eq!(response.status(), Status::Error);
        let payload = RemoteExceptionPayload::from_raw(response.payload());
        assert_eq!(payload.exc_type, "InvalidInput");
    }

    #[test]
    fn registry_covers_the_full_service_surface() {
        let registry: Registry<EchoService> = Registry::standard();
        let commands: Vec<&str> = registry.commands().collect();
        for expected in [
            "hydrate_environment",
            "snapshot_environment",
            "get_environment",
            "set_environment_var",
            "remove_environment_var",
            "set_signer",
            "deploy",
            "list_contracts",
            "get_export_metadata",
            "get_contract_details",
            "call",
            "dump_state",
            "apply_state_snapshot",
            "remove_contract",
            "reset_state",
        ] {
            assert!(commands.contains(&expected), "missing {expected}");
        }
    }

    #[test]
    fn serve_answers_until_shutdown() {
        let mut input = Vec::new();
        cordon_proto::write_message(
            &mut input,
            &request("list_contracts", vec![]),
        )
        .unwrap();
        cordon_proto::write_message(&mut input, &Request::shutdown()).unwrap();

        let mut service = EchoService::default();
        let mut output = Vec::new();
        serve(&mut service, &mut std::io::Cursor::new(input), &mut output).unwrap();

        let mut cursor = std::io::Cursor::new(output);
        let first: Response = cordon_proto::read_message(&mut cursor).unwrap().unwrap();
        assert_eq!(first.status(), Status::Ok);
        let second: Response = cordon_proto::read_message(&mut cursor).unwrap().unwrap();
        assert_eq!(second.status(), Status::Ok);
        assert_eq!(second.payload(), &Value::Null);
        assert!(cordon_proto::read_message::<Response>(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn serve_recovers_from_malformed_frames() {
        let mut input = Vec::new();
        cordon_proto::write_frame(&mut input, b"not json").unwrap();
        cordon_proto::write_message(&mut input, &Request::shutdown()).unwrap();

        let mut service = EchoService::default();
        let mut output = Vec::new();
        serve(&mut service, &mut std::io::Cursor::new(input), &mut output).unwrap();

        let mut cursor = std::io::Cursor::new(output);
        let first: Response = cordon_proto::read_message(&mut cursor).unwrap().unwrap();
        assert_eq!(first.status(), Status::Error);
        let payload = RemoteExceptionPayload::from_raw(first.payload());
        assert_eq!(payload.exc_type, "InvalidRequest");
    }
}
