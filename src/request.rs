//! Outbound requests
//!
//! Every command the runtime can issue is listed in a static registry;
//! string lookups resolve through it instead of naming-convention dispatch.
//! A [`Request`] is a fluent builder over the outbound envelope
//! `{id, command, ...fields}`; the id is assigned by the router at send
//! time.

use once_cell::sync::Lazy;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

use crate::address::Address;
use crate::errors::{PrepError, RemoteError};

/// Descriptor for one wire command.
#[derive(Debug, Clone, Copy)]
pub struct CommandSpec {
    pub name: &'static str,
    /// Commands that carry secrets; refused locally unless the remote is
    /// trusted.
    pub requires_trust: bool,
}

const fn cmd(name: &'static str) -> CommandSpec {
    CommandSpec {
        name,
        requires_trust: false,
    }
}

const fn trusted_cmd(name: &'static str) -> CommandSpec {
    CommandSpec {
        name,
        requires_trust: true,
    }
}

/// The full command table.
pub static COMMANDS: Lazy<BTreeMap<&'static str, CommandSpec>> = Lazy::new(|| {
    [
        cmd("ping"),
        cmd("server_info"),
        cmd("ledger"),
        cmd("ledger_closed"),
        cmd("ledger_header"),
        cmd("ledger_current"),
        cmd("ledger_data"),
        cmd("ledger_entry"),
        cmd("subscribe"),
        cmd("unsubscribe"),
        cmd("transaction_entry"),
        cmd("tx"),
        cmd("account_info"),
        cmd("account_currencies"),
        cmd("account_lines"),
        cmd("account_offers"),
        cmd("account_tx"),
        cmd("book_offers"),
        cmd("path_find"),
        trusted_cmd("wallet_accounts"),
        trusted_cmd("sign"),
        cmd("submit"),
        cmd("unl_list"),
        cmd("unl_add"),
        cmd("unl_delete"),
        cmd("peers"),
        cmd("connect"),
    ]
    .into_iter()
    .map(|spec| (spec.name, spec))
    .collect()
});

/// Resolve a command by name.
pub fn lookup_command(name: &str) -> Option<&'static CommandSpec> {
    COMMANDS.get(name)
}

/// One side of an order book.
#[derive(Debug, Clone)]
pub struct BookSide {
    pub currency: String,
    /// Absent for the native asset.
    pub issuer: Option<String>,
}

impl BookSide {
    fn to_json(&self) -> Value {
        let mut side = Map::new();
        side.insert("currency".into(), json!(self.currency));
        if let Some(issuer) = &self.issuer {
            side.insert("issuer".into(), json!(issuer));
        }
        Value::Object(side)
    }
}

/// A request under construction.
#[derive(Debug, Clone)]
pub struct Request {
    spec: &'static CommandSpec,
    fields: Map<String, Value>,
    /// Pin the request to a specific server URL instead of routed selection.
    pub(crate) server: Option<String>,
}

impl Request {
    pub fn new(spec: &'static CommandSpec) -> Self {
        Self {
            spec,
            fields: Map::new(),
            server: None,
        }
    }

    /// Resolve a command name through the registry.
    pub fn by_name(name: &str) -> Option<Self> {
        lookup_command(name).map(Request::new)
    }

    pub fn command(&self) -> &'static str {
        self.spec.name
    }

    pub fn requires_trust(&self) -> bool {
        self.spec.requires_trust
    }

    /// Pin to a specific server by URL.
    pub fn server(mut self, url: impl Into<String>) -> Self {
        self.server = Some(url.into());
        self
    }

    /// Set an arbitrary field on the envelope.
    pub fn field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    pub fn ledger_hash(self, hash: impl Into<String>) -> Self {
        self.field("ledger_hash", json!(hash.into()))
    }

    pub fn ledger_index(self, index: u64) -> Self {
        self.field("ledger_index", json!(index))
    }

    /// Select a ledger by shortcut name, hash, or index. Strings longer than
    /// twelve characters are treated as hashes.
    pub fn ledger_select(self, spec: &str) -> Self {
        match spec {
            "current" | "closed" | "validated" => self.field("ledger_index", json!(spec)),
            s if s.len() > 12 => self.field("ledger_hash", json!(s)),
            s => match s.parse::<u64>() {
                Ok(index) => self.field("ledger_index", json!(index)),
                Err(_) => self.field("ledger_index", json!(s)),
            },
        }
    }

    pub fn account(self, address: &Address) -> Self {
        self.field("account", json!(address.as_str()))
    }

    pub fn account_root(self, address: &Address) -> Self {
        self.field("account_root", json!(address.as_str()))
    }

    pub fn index(self, hash: impl Into<String>) -> Self {
        self.field("index", json!(hash.into()))
    }

    pub fn offer_id(self, account: &Address, sequence: u32) -> Self {
        self.field(
            "offer",
            json!({ "account": account.as_str(), "seq": sequence }),
        )
    }

    pub fn offer_index(self, index: impl Into<String>) -> Self {
        self.field("offer", json!(index.into()))
    }

    pub fn secret(self, secret: impl Into<String>) -> Self {
        self.field("secret", json!(secret.into()))
    }

    pub fn tx_hash(self, hash: impl Into<String>) -> Self {
        self.field("tx_hash", json!(hash.into()))
    }

    pub fn tx_json(self, tx_json: Value) -> Self {
        self.field("tx_json", tx_json)
    }

    pub fn tx_blob(self, blob: impl Into<String>) -> Self {
        self.field("tx_blob", json!(blob.into()))
    }

    pub fn limit(self, limit: u32) -> Self {
        self.field("limit", json!(limit))
    }

    /// Resume marker from a previous paged response.
    pub fn marker(self, marker: Value) -> Self {
        self.field("marker", marker)
    }

    /// Subscribe/unsubscribe stream names.
    pub fn streams(self, streams: &[&str]) -> Self {
        self.field("streams", json!(streams))
    }

    /// Account subscription list; `realtime` selects the proposed stream.
    pub fn accounts(mut self, accounts: &[Address], realtime: bool) -> Self {
        let key = if realtime { "accounts_proposed" } else { "accounts" };
        let list: Vec<&str> = accounts.iter().map(Address::as_str).collect();
        self.fields.insert(key.into(), json!(list));
        self
    }

    /// Order-book subscription list.
    pub fn books(mut self, books: &[(BookSide, BookSide)], snapshot: bool) -> Self {
        let list: Vec<Value> = books
            .iter()
            .map(|(gets, pays)| {
                let mut book = Map::new();
                book.insert("taker_gets".into(), gets.to_json());
                book.insert("taker_pays".into(), pays.to_json());
                if snapshot {
                    book.insert("snapshot".into(), json!(true));
                }
                Value::Object(book)
            })
            .collect();
        self.fields.insert("books".into(), json!(list));
        self
    }

    /// Local validation applied at send time.
    pub fn validate(&self) -> Result<(), RemoteError> {
        if self.spec.name == "account_tx"
            && self.fields.contains_key("marker")
            && !self.fields.contains_key("ledger_hash")
            && !self.fields.contains_key("ledger_index")
            && !(self.fields.contains_key("ledger_index_min")
                && self.fields.contains_key("ledger_index_max"))
        {
            return Err(RemoteError::Protocol(
                "account_tx with a marker requires an explicit ledger selector".into(),
            ));
        }
        Ok(())
    }

    /// Enforce the trust gate for secret-carrying commands.
    pub fn check_trust(&self, trusted: bool) -> Result<(), RemoteError> {
        if self.spec.requires_trust && !trusted {
            return Err(RemoteError::Prep(PrepError::ServerUntrusted));
        }
        Ok(())
    }

    /// The wire envelope with the assigned id.
    pub fn envelope(&self, id: u64) -> Value {
        let mut message = Map::new();
        message.insert("id".into(), json!(id));
        message.insert("command".into(), json!(self.spec.name));
        for (key, value) in &self.fields {
            message.insert(key.clone(), value.clone());
        }
        Value::Object(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::encode_check;

    fn addr(fill: u8) -> Address {
        Address::parse(&encode_check(0, &[fill; 20])).unwrap()
    }

    #[test]
    fn registry_resolves_known_commands() {
        assert!(lookup_command("account_info").is_some());
        assert!(lookup_command("ledger_data").is_some());
        assert!(lookup_command("no_such_command").is_none());
        assert_eq!(COMMANDS.len(), 27);
    }

    #[test]
    fn secret_carrying_commands_require_trust() {
        let sign = Request::by_name("sign").unwrap();
        assert!(sign.check_trust(false).is_err());
        assert!(sign.check_trust(true).is_ok());
        let ping = Request::by_name("ping").unwrap();
        assert!(ping.check_trust(false).is_ok());
    }

    #[test]
    fn envelope_carries_id_command_and_fields() {
        let request = Request::by_name("account_info").unwrap().account(&addr(1));
        let envelope = request.envelope(7);
        assert_eq!(envelope["id"], json!(7));
        assert_eq!(envelope["command"], json!("account_info"));
        assert_eq!(envelope["account"], json!(addr(1).as_str()));
    }

    #[test]
    fn ledger_select_classifies_specs() {
        let by_name = Request::by_name("ledger").unwrap().ledger_select("validated");
        assert_eq!(by_name.envelope(1)["ledger_index"], json!("validated"));

        let by_index = Request::by_name("ledger").unwrap().ledger_select("8694324");
        assert_eq!(by_index.envelope(1)["ledger_index"], json!(8_694_324u64));

        let hash = "F4D865D83EB88C1A1911B9E90641919A1314F36E1B099F8E95FE3B7C77BE3349";
        let by_hash = Request::by_name("ledger").unwrap().ledger_select(hash);
        assert_eq!(by_hash.envelope(1)["ledger_hash"], json!(hash));
    }

    #[test]
    fn account_tx_marker_requires_ledger_selector() {
        let bad = Request::by_name("account_tx")
            .unwrap()
            .account(&addr(2))
            .marker(json!({"ledger": 5, "seq": 12}));
        assert!(bad.validate().is_err());

        let good = bad.clone().ledger_index(42);
        assert!(good.validate().is_ok());
    }

    #[test]
    fn book_sides_serialize_with_optional_issuer() {
        let gets = BookSide {
            currency: "USD".into(),
            issuer: Some(addr(3).as_str().to_string()),
        };
        let pays = BookSide {
            currency: "XRP".into(),
            issuer: None,
        };
        let request = Request::by_name("subscribe")
            .unwrap()
            .books(&[(gets, pays)], true);
        let envelope = request.envelope(1);
        let book = &envelope["books"][0];
        assert_eq!(book["taker_gets"]["currency"], json!("USD"));
        assert!(book["taker_pays"].get("issuer").is_none());
        assert_eq!(book["snapshot"], json!(true));
    }
}
