//! Reference session service: contract code storage, JSON state snapshots
//! and the allow-listed execution environment, rooted at one session's
//! storage home. Contract *execution* is the job of an external engine
//! plugged in behind the same trait; this service keeps every other
//! operation real.

use std::io;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

use cordon_proto::{
    default_environment, ContractDetails, ExportInfo, CONTRACT_STATE_DIR, DEFAULT_SIGNER,
    ENVIRONMENT_KEYS, RUN_STATE_DIR,
};
use cordon_worker::guest::{ServiceError, SessionService};

const CODE_FILE: &str = "code";
const STATE_FILE: &str = "state.json";
const RESERVED_CONTRACT_NAME: &str = "submission";
const MAX_CONTRACT_NAME_LEN: usize = 64;

pub struct StorageService {
    contract_state: PathBuf,
    run_state: PathBuf,
    environment: Map<String, Value>,
}

impl StorageService {
    pub fn new(storage_home: &Path) -> io::Result<Self> {
        let contract_state = storage_home.join(CONTRACT_STATE_DIR);
        let run_state = storage_home.join(RUN_STATE_DIR);
        std::fs::create_dir_all(&contract_state)?;
        std::fs::create_dir_all(&run_state)?;
        Ok(StorageService {
            contract_state,
            run_state,
            environment: coerced_defaults(),
        })
    }

    fn contract_dir(&self, name: &str) -> PathBuf {
        self.contract_state.join(name)
    }

    fn read_code(&self, name: &str) -> Result<Option<String>, ServiceError> {
        let path = self.contract_dir(name).join(CODE_FILE);
        match std::fs::read_to_string(&path) {
            Ok(code) => Ok(Some(code)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn read_state(&self, dir: &Path) -> Result<Map<String, Value>, ServiceError> {
        let path = dir.join(STATE_FILE);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Map::new()),
            Err(err) => return Err(err.into()),
        };
        let value: Value = serde_json::from_slice(&bytes).map_err(|err| {
            ServiceError::invalid(format!("corrupt state file {}: {err}", path.display()))
        })?;
        match value {
            Value::Object(map) => Ok(map),
            _ => Err(ServiceError::invalid(format!(
                "state file {} is not a JSON object",
                path.display()
            ))),
        }
    }

    fn write_state(&self, dir: &Path, state: &Map<String, Value>) -> Result<(), ServiceError> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(STATE_FILE);
        let payload = serde_json::to_vec_pretty(state)
            .map_err(|err| ServiceError::invalid(format!("unencodable state: {err}")))?;
        std::fs::write(path, payload)?;
        Ok(())
    }

    fn contract_names(&self) -> Result<Vec<String>, ServiceError> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.contract_state)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Ok(name) = entry.file_name().into_string() else { continue };
            if name == RESERVED_CONTRACT_NAME {
                continue;
            }
            if entry.path().join(CODE_FILE).is_file() {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }
}

impl SessionService for StorageService {
    fn hydrate_environment(
        &mut self,
        environment: &Map<String, Value>,
    ) -> Result<(), ServiceError> {
        // Unknown keys in a persisted snapshot are pruned, not stored.
        for key in ENVIRONMENT_KEYS {
            if let Some(value) = environment.get(key) {
                let coerced = coerce_environment_value(key, value)?;
                self.environment.insert(key.to_string(), coerced);
            }
        }
        Ok(())
    }

    fn snapshot_environment(&self) -> Result<Map<String, Value>, ServiceError> {
        Ok(self.environment.clone())
    }

    fn get_environment(&self) -> Result<Map<String, Value>, ServiceError> {
        Ok(self.environment.clone())
    }

    fn set_environment_var(&mut self, key: &str, value: &Value) -> Result<Value, ServiceError> {
        let clean_key = key.trim();
        if clean_key.is_empty() {
            return Err(ServiceError::invalid("Environment key cannot be empty."));
        }
        if !ENVIRONMENT_KEYS.contains(&clean_key) {
            return Err(ServiceError::invalid(format!(
                "Environment key '{clean_key}' is not configurable."
            )));
        }

        let blank = match value {
            Value::Null => true,
            Value::String(s) => s.trim().is_empty(),
            _ => false,
        };
        let coerced = if blank {
            default_for(clean_key)?
        } else {
            coerce_environment_value(clean_key, value)?
        };
        self.environment.insert(clean_key.to_string(), coerced.clone());
        Ok(coerced)
    }

    fn remove_environment_var(&mut self, key: &str) -> Result<(), ServiceError> {
        let clean_key = key.trim();
        if clean_key.is_empty() || !ENVIRONMENT_KEYS.contains(&clean_key) {
            return Ok(());
        }
        let default = default_for(clean_key)?;
        self.environment.insert(clean_key.to_string(), default);
        Ok(())
    }

    fn set_signer(&mut self, signer: &str) -> Result<String, ServiceError> {
        let clean = signer.trim();
        if clean.is_empty() {
            return Err(ServiceError::invalid("Signer cannot be empty."));
        }
        self.environment.insert("signer".to_string(), Value::from(clean));
        Ok(clean.to_string())
    }

    fn deploy(&mut self, name: &str, code: &str) -> Result<(), ServiceError> {
        let clean_name = name.trim();
        validate_contract_name(clean_name)?;
        if code.trim().is_empty() {
            return Err(ServiceError::invalid("Contract code cannot be empty."));
        }
        let dir = self.contract_dir(clean_name);
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join(CODE_FILE), code)?;
        Ok(())
    }

    fn list_contracts(&self) -> Result<Vec<String>, ServiceError> {
        self.contract_names()
    }

    fn get_export_metadata(&self, contract: &str) -> Result<Vec<ExportInfo>, ServiceError> {
        let clean_name = contract.trim();
        if clean_name.is_empty() {
            return Err(ServiceError::invalid("Contract name is required."));
        }
        match self.read_code(clean_name)? {
            Some(code) => Ok(scan_exports(&code)),
            None => Ok(Vec::new()),
        }
    }

    fn get_contract_details(&self, contract: &str) -> Result<ContractDetails, ServiceError> {
        let clean_name = contract.trim();
        if clean_name.is_empty() {
            return Err(ServiceError::invalid("Contract name is required."));
        }
        let Some(source) = self.read_code(clean_name)? else {
            return Err(ServiceError::not_found(format!(
                "Contract '{clean_name}' is not deployed."
            )));
        };
        let exports = scan_exports(&source);
        Ok(ContractDetails { name: clean_name.to_string(), source, exports })
    }

    fn call(
        &mut self,
        contract: &str,
        function: &str,
        _kwargs: &Map<String, Value>,
    ) -> Result<Value, ServiceError> {
        if contract.trim().is_empty() {
            return Err(ServiceError::invalid("No contract selected."));
        }
        if function.trim().is_empty() {
            return Err(ServiceError::invalid("No function selected."));
        }
        if self.read_code(contract.trim())?.is_none() {
            return Err(ServiceError::not_found(format!(
                "Contract '{}' is not deployed.",
                contract.trim()
            )));
        }
        Err(ServiceError::unsupported(
            "Contract execution requires an execution engine; none is linked into this worker.",
        ))
    }

    fn dump_state(&self, show_internal: bool) -> Result<String, ServiceError> {
        let mut snapshot: Map<String, Value> = Map::new();
        for name in self.contract_names()? {
            let state = self.read_state(&self.contract_dir(&name))?;
            let filtered: Map<String, Value> = state
                .into_iter()
                .filter(|(key, _)| show_internal || !key.starts_with("__"))
                .collect();
            snapshot.insert(name, Value::Object(filtered));
        }

        let runtime = self.read_state(&self.run_state)?;
        if !runtime.is_empty() {
            let filtered: Map<String, Value> = runtime
                .into_iter()
                .filter(|(key, _)| show_internal || !key.starts_with("__"))
                .collect();
            snapshot.insert("__runtime__".to_string(), Value::Object(filtered));
        }

        serde_json::to_string_pretty(&snapshot)
            .map_err(|err| ServiceError::invalid(format!("unencodable snapshot: {err}")))
    }

    fn apply_state_snapshot(
        &mut self,
        snapshot: &Map<String, Value>,
    ) -> Result<(), ServiceError> {
        for (contract, entries) in snapshot {
            if contract == "__runtime__" {
                continue;
            }
            let Value::Object(entries) = entries else {
                return Err(ServiceError::invalid(format!(
                    "State for '{contract}' must be an object mapping keys to values."
                )));
            };
            validate_contract_name(contract)?;

            let dir = self.contract_dir(contract);
            let mut state = self.read_state(&dir)?;
            for (key, value) in entries {
                if value.is_null() {
                    state.remove(key);
                } else {
                    state.insert(key.clone(), value.clone());
                }
            }
            self.write_state(&dir, &state)?;
        }
        Ok(())
    }

    fn remove_contract(&mut self, name: &str) -> Result<(), ServiceError> {
        let clean_name = name.trim();
        validate_contract_name(clean_name)?;
        let dir = self.contract_dir(clean_name);
        if !dir.join(CODE_FILE).is_file() {
            return Err(ServiceError::not_found(format!(
                "Contract '{clean_name}' is not deployed."
            )));
        }
        std::fs::remove_dir_all(dir)?;
        Ok(())
    }

    fn reset_state(&mut self) -> Result<(), ServiceError> {
        for dir in [&self.contract_state, &self.run_state] {
            if dir.exists() {
                std::fs::remove_dir_all(dir)?;
            }
            std::fs::create_dir_all(dir)?;
        }
        self.environment = coerced_defaults();
        Ok(())
    }
}

fn coerced_defaults() -> Map<String, Value> {
    let mut environment = Map::new();
    for (key, value) in default_environment() {
        // Defaults are known-valid; fall back to the raw value defensively.
        let coerced = coerce_environment_value(&key, &value).unwrap_or(value);
        environment.insert(key, coerced);
    }
    environment
}

fn default_for(key: &str) -> Result<Value, ServiceError> {
    if key == "signer" {
        return Ok(Value::from(DEFAULT_SIGNER));
    }
    let defaults = default_environment();
    match defaults.get(key) {
        Some(value) => coerce_environment_value(key, value),
        None => Ok(Value::from("")),
    }
}

fn coerce_environment_value(key: &str, raw: &Value) -> Result<Value, ServiceError> {
    match key {
        "signer" => Ok(Value::from(text_of(raw)?.trim())),
        "now" => {
            let text = text_of(raw)?;
            let text = text.trim();
            if text.is_empty() {
                return Err(ServiceError::invalid(
                    "Environment['now'] requires an ISO datetime string.",
                ));
            }
            if !looks_like_iso_datetime(text) {
                return Err(ServiceError::invalid("Invalid ISO format for 'now'."));
            }
            Ok(Value::from(text))
        }
        "block_num" => {
            if let Some(n) = raw.as_i64() {
                return Ok(Value::from(n));
            }
            let text = text_of(raw)?;
            let text = text.trim();
            let text = if text.is_empty() { "0" } else { text };
            match parse_int_auto(text) {
                Some(n) => Ok(Value::from(n)),
                None => Err(ServiceError::invalid("block_num must be an integer.")),
            }
        }
        "block_hash" => Ok(Value::from(text_of(raw)?.trim())),
        other => Err(ServiceError::invalid(format!(
            "Environment key '{other}' is not configurable."
        ))),
    }
}

fn text_of(value: &Value) -> Result<String, ServiceError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Null => Ok(String::new()),
        _ => Err(ServiceError::invalid("expected a scalar value")),
    }
}

/// `YYYY-MM-DD` optionally followed by `T`/space and `HH:MM[:SS[.frac]]`.
fn looks_like_iso_datetime(text: &str) -> bool {
    let bytes = text.as_bytes();
    let digits = |range: std::ops::Range<usize>| {
        bytes[range].iter().all(u8::is_ascii_digit)
    };
    if bytes.len() < 10 {
        return false;
    }
    if !(digits(0..4) && bytes[4] == b'-' && digits(5..7) && bytes[7] == b'-' && digits(8..10)) {
        return false;
    }
    if bytes.len() == 10 {
        return true;
    }
    if bytes[10] != b'T' && bytes[10] != b' ' {
        return false;
    }
    let rest = &text[11..];
    if rest.len() < 5 {
        return false;
    }
    let b = rest.as_bytes();
    if !(b[0].is_ascii_digit() && b[1].is_ascii_digit() && b[2] == b':' && b[3].is_ascii_digit() && b[4].is_ascii_digit()) {
        return false;
    }
    match rest.len() {
        5 => true,
        n if n >= 8 && b[5] == b':' && b[6].is_ascii_digit() && b[7].is_ascii_digit() => {
            n == 8 || (b[8] == b'.' && b[9..].iter().all(u8::is_ascii_digit) && n > 9)
        }
        _ => false,
    }
}

/// Integer parsing with the usual base prefixes (`0x`, `0o`, `0b`).
fn parse_int_auto(text: &str) -> Option<i64> {
    let (negative, body) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };
    let magnitude = if let Some(hex) = body.strip_prefix("0x").or_else(|| body.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16).ok()?
    } else if let Some(oct) = body.strip_prefix("0o").or_else(|| body.strip_prefix("0O")) {
        i64::from_str_radix(oct, 8).ok()?
    } else if let Some(bin) = body.strip_prefix("0b").or_else(|| body.strip_prefix("0B")) {
        i64::from_str_radix(bin, 2).ok()?
    } else {
        body.parse::<i64>().ok()?
    };
    Some(if negative { -magnitude } else { magnitude })
}

fn validate_contract_name(name: &str) -> Result<(), ServiceError> {
    if name.is_empty() {
        return Err(ServiceError::invalid("Contract name cannot be empty."));
    }
    if name == RESERVED_CONTRACT_NAME {
        return Err(ServiceError::invalid("Contract name 'submission' is reserved."));
    }
    if name.len() > MAX_CONTRACT_NAME_LEN
        || !name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
    {
        return Err(ServiceError::invalid(format!(
            "Contract name '{name}' must be 1-{MAX_CONTRACT_NAME_LEN} alphanumeric or underscore characters."
        )));
    }
    Ok(())
}

/// Line scan for `@export`-decorated functions: enough for metadata, not a
/// parser. Captures a single-line docstring when one directly follows the
/// signature.
fn scan_exports(source: &str) -> Vec<ExportInfo> {
    let lines: Vec<&str> = source.lines().collect();
    let mut exports = Vec::new();
    for (index, line) in lines.iter().enumerate() {
        let trimmed = line.trim();
        if trimmed != "@export" && !trimmed.starts_with("@export(") {
            continue;
        }
        let Some(def_line) = lines.get(index + 1).map(|l| l.trim()) else { continue };
        let Some(rest) = def_line.strip_prefix("def ") else { continue };
        let Some(paren) = rest.find('(') else { continue };
        let name = rest[..paren].trim();
        if name.is_empty() {
            continue;
        }
        let docstring = lines
            .get(index + 2)
            .map(|l| l.trim())
            .and_then(extract_single_line_docstring)
            .unwrap_or_default();
        exports.push(ExportInfo { name: name.to_string(), docstring });
    }
    exports
}

fn extract_single_line_docstring(line: &str) -> Option<String> {
    for quote in ["\"\"\"", "'''"] {
        if let Some(rest) = line.strip_prefix(quote) {
            if let Some(body) = rest.strip_suffix(quote) {
                if !body.is_empty() {
                    return Some(body.trim().to_string());
                }
            }
        }
    }
    None
}
