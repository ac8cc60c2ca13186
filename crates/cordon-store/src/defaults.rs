//! Default UI state persisted with fresh sessions.

use serde_json::{Map, Value};

pub const DEFAULT_CONTRACT_NAME: &str = "con_demo_token";
pub const DEFAULT_KWARGS_INPUT: &str = "{}";

pub const DEFAULT_CONTRACT: &str = "\
balances = Hash(default_value=0)


@construct
def seed():
    balances['treasury'] = 1_000


@export
def transfer(to: str, amount: int):
    assert amount > 0, 'Amount must be positive.'
    assert balances[ctx.caller] >= amount, 'Insufficient balance.'

    balances[ctx.caller] -= amount
    balances[to] += amount


@export
def balance_of(account: str):
    return balances[account]
";

/// Caller-defined keys the store will persist; everything else is dropped.
pub const SESSION_UI_FIELDS: [&str; 9] = [
    "code_editor",
    "contract_name",
    "kwargs_input",
    "load_view_decompiled",
    "expanded_panel",
    "selected_contract",
    "load_selected_contract",
    "function_name",
    "show_internal_state",
];

pub fn default_ui_state() -> Map<String, Value> {
    let mut ui = Map::new();
    ui.insert("code_editor".to_string(), Value::from(DEFAULT_CONTRACT));
    ui.insert("contract_name".to_string(), Value::from(DEFAULT_CONTRACT_NAME));
    ui.insert("kwargs_input".to_string(), Value::from(DEFAULT_KWARGS_INPUT));
    ui.insert("load_view_decompiled".to_string(), Value::Bool(true));
    ui.insert("expanded_panel".to_string(), Value::from(""));
    ui.insert("selected_contract".to_string(), Value::from(""));
    ui.insert("load_selected_contract".to_string(), Value::from(""));
    ui.insert("function_name".to_string(), Value::from(""));
    ui.insert("show_internal_state".to_string(), Value::Bool(false));
    ui
}

/// Re-materialize every allow-listed key from the supplied map, falling
/// back to the default for keys the caller omitted.
pub fn filter_ui_state(supplied: &Map<String, Value>) -> Map<String, Value> {
    let defaults = default_ui_state();
    let mut filtered = Map::new();
    for key in SESSION_UI_FIELDS {
        let value = supplied
            .get(key)
            .or_else(|| defaults.get(key))
            .cloned()
            .unwrap_or(Value::Null);
        filtered.insert(key.to_string(), value);
    }
    filtered
}
