//! Masternode collateral slots.
//!
//! A slot is created administratively (alias, host, key) and holds no output
//! until the allocator funds it. An active slot always carries its output.

use serde::{Deserialize, Serialize};

use crate::{OutPoint, SlotId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollateralSlot {
    pub id: SlotId,
    pub alias: String,
    /// `IP:port` of the masternode instance.
    pub address: String,
    pub privkey: String,
    pub output: Option<OutPoint>,
    pub active: bool,
    /// Reclaim priority: lower weights are deactivated first.
    pub weight: u32,
    /// Funding transaction sent for this slot whose output is not listed yet.
    #[serde(default)]
    pub pending_txid: Option<String>,
}

impl CollateralSlot {
    #[must_use]
    pub fn new(
        id: SlotId,
        alias: impl Into<String>,
        address: impl Into<String>,
        privkey: impl Into<String>,
        weight: u32,
    ) -> Self {
        Self {
            id,
            alias: alias.into(),
            address: address.into(),
            privkey: privkey.into(),
            output: None,
            active: false,
            weight,
            pending_txid: None,
        }
    }

    /// Activate with a funded output.
    pub fn activate(&mut self, output: OutPoint) {
        self.output = Some(output);
        self.active = true;
        self.pending_txid = None;
    }

    /// Deactivate, returning the output that backed the slot.
    pub fn deactivate(&mut self) -> Option<OutPoint> {
        self.active = false;
        self.output.take()
    }

    /// One line of the masternode configuration file. Inactive slots are
    /// commented out.
    #[must_use]
    pub fn config_line(&self) -> String {
        let (txid, vout) = match &self.output {
            Some(o) => (o.txid.clone(), o.vout.to_string()),
            None => ("None".to_string(), "None".to_string()),
        };
        let line = format!("{} {} {} {} {}", self.alias, self.address, self.privkey, txid, vout);
        if self.active { line } else { format!("# {line}") }
    }
}

/// Render the full masternode configuration file for `slots`.
#[must_use]
pub fn generate_config<'a>(slots: impl IntoIterator<Item = &'a CollateralSlot>) -> String {
    let mut lines = vec![
        "# Masternode config file".to_string(),
        "# Format: alias IP:port masternodeprivkey collateral_output_txid collateral_output_index"
            .to_string(),
    ];
    lines.extend(slots.into_iter().map(CollateralSlot::config_line));
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inactive_slot_is_commented() {
        let slot = CollateralSlot::new(SlotId(1), "mn1", "10.0.0.1:9999", "key", 0);
        assert_eq!(slot.config_line(), "# mn1 10.0.0.1:9999 key None None");
    }

    #[test]
    fn activation_roundtrip() {
        let mut slot = CollateralSlot::new(SlotId(1), "mn1", "10.0.0.1:9999", "key", 0);
        slot.pending_txid = Some("ab".into());
        let op = OutPoint::new("ab", 1);
        slot.activate(op.clone());
        assert!(slot.pending_txid.is_none());
        assert_eq!(slot.config_line(), "mn1 10.0.0.1:9999 key ab 1");
        assert_eq!(slot.deactivate(), Some(op));
        assert!(!slot.active);
        assert!(slot.output.is_none());
    }

    #[test]
    fn config_has_header_and_one_line_per_slot() {
        let slots = vec![
            CollateralSlot::new(SlotId(1), "a", "h:1", "k1", 0),
            CollateralSlot::new(SlotId(2), "b", "h:2", "k2", 5),
        ];
        let cfg = generate_config(&slots);
        assert_eq!(cfg.lines().count(), 4);
        assert!(cfg.starts_with("# Masternode config file"));
    }

    #[test]
    fn pending_txid_defaults_when_absent() {
        let json = r#"{"id":3,"alias":"a","address":"h:1","privkey":"k","output":null,"active":false,"weight":1}"#;
        let slot: CollateralSlot = serde_json::from_str(json).unwrap();
        assert!(slot.pending_txid.is_none());
    }
}
