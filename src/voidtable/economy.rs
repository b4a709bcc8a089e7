//! Energy economy: currencies, Seeds, and vendors.
//!
//! Characters carry four energy currencies (Breath, Drip, Grain, Spark, in
//! ascending value) plus Seeds — ritual consumables that come Raw (decaying),
//! Attuned (stable, elemental), or Hollow (inert). Vendors sell from small
//! faction-flavored catalogs and gate some scenarios behind a required
//! purchase.

use crate::voidtable::dice::DiceRoller;
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Seed stability variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeedKind {
    Raw,
    Attuned,
    Hollow,
}

/// Elemental attunements for Attuned seeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Element {
    Fire,
    Water,
    Air,
    Earth,
    Spirit,
    Void,
}

impl Element {
    pub fn parse(s: &str) -> Option<Element> {
        match s.trim().to_lowercase().as_str() {
            "fire" => Some(Element::Fire),
            "water" => Some(Element::Water),
            "air" => Some(Element::Air),
            "earth" => Some(Element::Earth),
            "spirit" => Some(Element::Spirit),
            "void" => Some(Element::Void),
            _ => None,
        }
    }
}

/// A ritual seed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Seed {
    pub kind: SeedKind,
    /// Present only on Attuned seeds.
    pub element: Option<Element>,
    /// Sessions until a Raw seed goes Hollow.
    pub cycles_remaining: u32,
    pub origin: String,
}

impl Seed {
    pub fn attuned(element: Element, origin: &str) -> Self {
        Self {
            kind: SeedKind::Attuned,
            element: Some(element),
            cycles_remaining: 0,
            origin: origin.to_string(),
        }
    }

    pub fn hollow(origin: &str) -> Self {
        Self {
            kind: SeedKind::Hollow,
            element: None,
            cycles_remaining: 0,
            origin: origin.to_string(),
        }
    }

    /// A Raw seed with randomized freshness (1-3 cycles).
    pub fn raw(origin: &str, dice: &DiceRoller) -> Self {
        Self {
            kind: SeedKind::Raw,
            element: None,
            cycles_remaining: dice.roll_range(1, 3) as u32,
            origin: origin.to_string(),
        }
    }

    /// Age a Raw seed; returns true when it degraded to Hollow.
    pub fn degrade(&mut self, cycles: u32) -> bool {
        if self.kind != SeedKind::Raw {
            return false;
        }
        self.cycles_remaining = self.cycles_remaining.saturating_sub(cycles);
        if self.cycles_remaining == 0 {
            self.kind = SeedKind::Hollow;
            true
        } else {
            false
        }
    }
}

/// The four energy currencies, cheapest first.
pub const CURRENCIES: [&str; 4] = ["breath", "drip", "grain", "spark"];

/// A character's energy wallet plus seed pouch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnergyInventory {
    pub breath: i32,
    pub drip: i32,
    pub grain: i32,
    pub spark: i32,
    pub seeds: Vec<Seed>,
}

impl EnergyInventory {
    /// Randomized starting wallet; seeds are added separately per faction.
    pub fn starting(dice: &DiceRoller) -> Self {
        Self {
            breath: dice.roll_range(5, 15),
            drip: dice.roll_range(3, 10),
            grain: dice.roll_range(0, 3),
            spark: dice.roll_range(0, 2),
            seeds: Vec::new(),
        }
    }

    pub fn currency(&self, kind: &str) -> i32 {
        match kind {
            "breath" => self.breath,
            "drip" => self.drip,
            "grain" => self.grain,
            "spark" => self.spark,
            _ => 0,
        }
    }

    pub fn add_currency(&mut self, kind: &str, amount: i32) {
        match kind {
            "breath" => self.breath += amount,
            "drip" => self.drip += amount,
            "grain" => self.grain += amount,
            "spark" => self.spark += amount,
            _ => {}
        }
    }

    /// Spend if affordable; returns false (unchanged) otherwise.
    pub fn spend_currency(&mut self, kind: &str, amount: i32) -> bool {
        if self.currency(kind) < amount {
            return false;
        }
        self.add_currency(kind, -amount);
        true
    }

    pub fn add_seed(&mut self, seed: Seed) {
        self.seeds.push(seed);
    }

    /// Remove and return the first seed of the given kind (and element, when
    /// specified).
    pub fn consume_seed(&mut self, kind: SeedKind, element: Option<Element>) -> Option<Seed> {
        let index = self.seeds.iter().position(|s| {
            s.kind == kind && (element.is_none() || s.element == element)
        })?;
        Some(self.seeds.remove(index))
    }

    /// Age every Raw seed by `cycles`; returns how many went Hollow.
    pub fn degrade_raw_seeds(&mut self, cycles: u32) -> usize {
        let mut hollowed = 0;
        for seed in &mut self.seeds {
            if seed.degrade(cycles) {
                hollowed += 1;
            }
        }
        if hollowed > 0 {
            info!("{} raw seed(s) degraded to hollow", hollowed);
        }
        hollowed
    }

    pub fn count_seeds(&self, kind: SeedKind) -> usize {
        self.seeds.iter().filter(|s| s.kind == kind).count()
    }

    /// Short wallet summary for status lines.
    pub fn wallet_summary(&self) -> String {
        format!(
            "{} Spark, {} Grain, {} Drip, {} Breath",
            self.spark, self.grain, self.drip, self.breath
        )
    }
}

/// Vendor archetypes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VendorKind {
    RitualSupplier,
    TechBroker,
    GeneralGoods,
    BondBroker,
}

impl fmt::Display for VendorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VendorKind::RitualSupplier => "ritual supplier",
            VendorKind::TechBroker => "tech broker",
            VendorKind::GeneralGoods => "general goods",
            VendorKind::BondBroker => "bond broker",
        };
        f.write_str(s)
    }
}

/// One catalog entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VendorItem {
    pub name: String,
    /// (currency, amount).
    pub price: (String, i32),
    pub description: String,
}

impl VendorItem {
    fn new(name: &str, currency: &str, amount: i32, description: &str) -> Self {
        Self {
            name: name.to_string(),
            price: (currency.to_string(), amount),
            description: description.to_string(),
        }
    }

    pub fn price_label(&self) -> String {
        format!("{} {}", self.price.1, self.price.0)
    }
}

/// A vendor present in a scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vendor {
    pub name: String,
    pub kind: VendorKind,
    pub faction: String,
    pub greeting: String,
    pub inventory: Vec<VendorItem>,
}

impl Vendor {
    pub fn inventory_display(&self) -> String {
        self.inventory
            .iter()
            .enumerate()
            .map(|(i, item)| format!("{}. {} — {} ({})", i + 1, item.name, item.price_label(), item.description))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Sell by item name: deducts the price from the buyer and returns the
    /// item, or `None` when unknown/unaffordable.
    pub fn sell_item(&self, item_name: &str, buyer: &mut EnergyInventory) -> Option<VendorItem> {
        let item = self
            .inventory
            .iter()
            .find(|i| i.name.eq_ignore_ascii_case(item_name))?
            .clone();
        if buyer.spend_currency(&item.price.0, item.price.1) {
            Some(item)
        } else {
            None
        }
    }
}

/// Price table shared by player purchase processing.
pub fn item_price(item_name: &str) -> Option<(&'static str, i32)> {
    let table: &[(&str, (&str, i32))] = &[
        ("breathwater flask", ("drip", 2)),
        ("dripfruit chews", ("drip", 1)),
        ("med kit (basic)", ("drip", 5)),
        ("med kit (tactical)", ("drip", 6)),
        ("ration pack", ("drip", 2)),
        ("glowsticks", ("breath", 8)),
        ("comm unit", ("drip", 3)),
        ("sparksticks", ("breath", 3)),
        ("echo-calibrator", ("spark", 8)),
        ("scrambled id chip", ("spark", 4)),
        ("bond insurance policy", ("spark", 12)),
        ("data slate (encrypted)", ("drip", 10)),
        ("incense stick", ("breath", 10)),
        ("incense stick (single)", ("breath", 10)),
        ("purification incense (bundle)", ("drip", 8)),
        ("purification incense", ("drip", 8)),
        ("ritual altar access", ("spark", 1)),
        ("void scanner (basic)", ("spark", 4)),
    ];
    table
        .iter()
        .find(|(name, _)| *name == item_name)
        .map(|(_, price)| *price)
}

/// Map a vendor item name to the character inventory slot it fills.
/// `None` means the purchase is a service and nothing is pocketed.
pub fn inventory_key_for(item_name: &str) -> Option<&'static str> {
    let table: &[(&str, Option<&'static str>)] = &[
        ("incense stick", Some("incense")),
        ("incense stick (single)", Some("incense")),
        ("purification incense (bundle)", Some("purification_incense")),
        ("purification incense", Some("purification_incense")),
        ("med kit (basic)", Some("med_kit")),
        ("med kit (tactical)", Some("med_kit")),
        ("breathwater flask", Some("breathwater_flask")),
        ("echo-calibrator", Some("echo_calibrator")),
        ("void scanner (basic)", Some("void_scanner")),
        ("scrambled id chip", Some("scrambled_id")),
        ("data slate (encrypted)", Some("data_slate")),
        ("comm unit", Some("comm_unit")),
        ("glowsticks", Some("glowsticks")),
        ("sparksticks", Some("sparksticks")),
        ("dripfruit chews", Some("dripfruit")),
        ("ration pack", Some("rations")),
        ("ritual altar access", None),
        ("bond insurance policy", None),
    ];
    table
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(item_name))
        .and_then(|(_, key)| *key)
}

/// The standing vendor pool.
pub fn create_standard_vendors() -> Vec<Vendor> {
    vec![
        Vendor {
            name: "Sessa Varn".to_string(),
            kind: VendorKind::RitualSupplier,
            faction: "Communes".to_string(),
            greeting: "The leylines favor the prepared. What do you need?".to_string(),
            inventory: vec![
                VendorItem::new("Incense Stick (single)", "breath", 10, "A single ritual offering"),
                VendorItem::new("Purification Incense (bundle)", "drip", 8, "Cleansing-grade offerings"),
                VendorItem::new("Ritual Altar Access", "spark", 1, "One hour at a sanctified altar"),
            ],
        },
        Vendor {
            name: "Brokerage Unit 7".to_string(),
            kind: VendorKind::TechBroker,
            faction: "Tempest".to_string(),
            greeting: "Hardware, clean or otherwise. No questions either way.".to_string(),
            inventory: vec![
                VendorItem::new("Echo-Calibrator", "spark", 8, "Technical seed attunement rig"),
                VendorItem::new("Void Scanner (basic)", "spark", 4, "Reads ambient corruption"),
                VendorItem::new("Scrambled ID Chip", "spark", 4, "Burns a false identity"),
                VendorItem::new("Data Slate (encrypted)", "drip", 10, "Secure storage"),
            ],
        },
        Vendor {
            name: "Old Marrow".to_string(),
            kind: VendorKind::GeneralGoods,
            faction: "Freeborn".to_string(),
            greeting: "Everything a body needs, nothing a body doesn't.".to_string(),
            inventory: vec![
                VendorItem::new("Med Kit (basic)", "drip", 5, "Field trauma kit"),
                VendorItem::new("Ration Pack", "drip", 2, "Three days of meals"),
                VendorItem::new("Glowsticks", "breath", 8, "Chemical light, one dozen"),
                VendorItem::new("Comm Unit", "drip", 3, "Short-range encrypted comms"),
                VendorItem::new("Breathwater Flask", "drip", 2, "Restorative draught"),
            ],
        },
        Vendor {
            name: "Adjutant Khess".to_string(),
            kind: VendorKind::BondBroker,
            faction: "ACG".to_string(),
            greeting: "Every debt is a door. Shall we open one?".to_string(),
            inventory: vec![
                VendorItem::new("Bond Insurance Policy", "spark", 12, "Underwrites one broken oath"),
                VendorItem::new("Med Kit (tactical)", "drip", 6, "Combat-rated trauma kit"),
            ],
        },
    ]
}

/// Default character inventory slots.
pub fn default_inventory() -> BTreeMap<String, i32> {
    [
        // Ritual consumables
        "blood_offering",
        "incense",
        "neural_stimulant",
        "memory_crystal",
        // Tools & focuses
        "crystal_focus",
        "tech_kit",
        "neural_interface_module",
        "void_scanner",
        "resonance_tuner",
        // Medical / utility
        "med_kit",
        "data_slate",
        "comm_unit",
    ]
    .into_iter()
    .map(|k| (k.to_string(), 0))
    .collect()
}
