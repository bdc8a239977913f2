//! Resource quantities and shared selector types
//!
//! Quantities are stored as signed milli-units so that CPU (`500m`) and
//! memory (`4Gi`) share one arithmetic type.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// CPU cores
pub const RESOURCE_CPU: &str = "cpu";

/// Memory in bytes
pub const RESOURCE_MEMORY: &str = "memory";

/// Pod slots
pub const RESOURCE_PODS: &str = "pods";

/// Synthetic resource counting one unit per node in pool totals
pub const RESOURCE_NODES: &str = "nodes";

/// Errors produced when parsing a quantity string
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QuantityError {
    #[error("Empty quantity")]
    Empty,

    #[error("Invalid quantity '{0}'")]
    Invalid(String),

    #[error("Quantity '{0}' overflows")]
    Overflow(String),
}

/// A resource amount in milli-units
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Quantity(i64);

impl Quantity {
    pub const ZERO: Quantity = Quantity(0);

    /// Build from a whole number of units
    pub fn from_units(units: i64) -> Self {
        Quantity(units.saturating_mul(1000))
    }

    /// Build from milli-units
    pub fn from_milli(milli: i64) -> Self {
        Quantity(milli)
    }

    pub fn milli_value(&self) -> i64 {
        self.0
    }

    /// Whole units, rounded up like the apiserver does
    pub fn value(&self) -> i64 {
        if self.0 >= 0 {
            (self.0 + 999) / 1000
        } else {
            self.0 / 1000
        }
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Parse a Kubernetes quantity string (`2`, `500m`, `1.5`, `4Gi`, `10k`)
    pub fn parse(s: &str) -> Result<Self, QuantityError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(QuantityError::Empty);
        }

        let split = s
            .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-' || c == '+'))
            .unwrap_or(s.len());
        let (number, suffix) = s.split_at(split);

        // (multiplier numerator, divisor) applied to the milli value
        let (mul, div): (i128, i128) = match suffix {
            "" => (1000, 1),
            "m" => (1, 1),
            "k" => (1000 * 1000, 1),
            "M" => (1000 * 1000_i128.pow(2), 1),
            "G" => (1000 * 1000_i128.pow(3), 1),
            "T" => (1000 * 1000_i128.pow(4), 1),
            "P" => (1000 * 1000_i128.pow(5), 1),
            "Ki" => (1000 * 1024, 1),
            "Mi" => (1000 * 1024_i128.pow(2), 1),
            "Gi" => (1000 * 1024_i128.pow(3), 1),
            "Ti" => (1000 * 1024_i128.pow(4), 1),
            "Pi" => (1000 * 1024_i128.pow(5), 1),
            _ => return Err(QuantityError::Invalid(s.to_string())),
        };

        let (negative, digits) = match number.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, number.strip_prefix('+').unwrap_or(number)),
        };
        let (whole, frac) = match digits.split_once('.') {
            Some((w, f)) => (w, f),
            None => (digits, ""),
        };
        if (whole.is_empty() && frac.is_empty())
            || !whole.chars().all(|c| c.is_ascii_digit())
            || !frac.chars().all(|c| c.is_ascii_digit())
        {
            return Err(QuantityError::Invalid(s.to_string()));
        }

        let overflow = || QuantityError::Overflow(s.to_string());
        let whole_val: i128 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| overflow())?
        };
        let frac_scale = 10_i128
            .checked_pow(frac.len() as u32)
            .ok_or_else(overflow)?;
        let frac_val: i128 = if frac.is_empty() {
            0
        } else {
            frac.parse().map_err(|_| overflow())?
        };

        let scaled = whole_val
            .checked_mul(frac_scale)
            .and_then(|w| w.checked_add(frac_val))
            .and_then(|n| n.checked_mul(mul))
            .ok_or_else(overflow)?;
        // Round fractional milli-units up
        let milli = (scaled + frac_scale * div - 1) / (frac_scale * div);
        let milli = i64::try_from(milli).map_err(|_| overflow())?;

        Ok(Quantity(if negative { -milli } else { milli }))
    }
}

impl FromStr for Quantity {
    type Err = QuantityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Quantity::parse(s)
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 % 1000 == 0 {
            write!(f, "{}", self.0 / 1000)
        } else {
            write!(f, "{}m", self.0)
        }
    }
}

impl Add for Quantity {
    type Output = Quantity;

    fn add(self, rhs: Quantity) -> Quantity {
        Quantity(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for Quantity {
    fn add_assign(&mut self, rhs: Quantity) {
        self.0 = self.0.saturating_add(rhs.0);
    }
}

impl Sub for Quantity {
    type Output = Quantity;

    fn sub(self, rhs: Quantity) -> Quantity {
        Quantity(self.0.saturating_sub(rhs.0))
    }
}

impl SubAssign for Quantity {
    fn sub_assign(&mut self, rhs: Quantity) {
        self.0 = self.0.saturating_sub(rhs.0);
    }
}

impl Serialize for Quantity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Quantity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Int(i64),
            Float(f64),
            Str(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Int(units) => Ok(Quantity::from_units(units)),
            Raw::Float(f) => Quantity::parse(&f.to_string()).map_err(serde::de::Error::custom),
            Raw::Str(s) => Quantity::parse(&s).map_err(serde::de::Error::custom),
        }
    }
}

/// Resource name -> quantity
pub type ResourceList = BTreeMap<String, Quantity>;

/// Build a resource list from `(name, quantity-string)` pairs
///
/// Panics on malformed quantities; intended for literals in fixtures.
pub fn resource_list<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> ResourceList {
    pairs
        .into_iter()
        .map(|(name, q)| {
            let quantity = Quantity::parse(q)
                .unwrap_or_else(|e| panic!("invalid quantity literal for {}: {}", name, e));
            (name.to_string(), quantity)
        })
        .collect()
}

/// Add every quantity of `src` into `dst`
pub fn merge_into(dst: &mut ResourceList, src: &ResourceList) {
    for (name, quantity) in src {
        *dst.entry(name.clone()).or_default() += *quantity;
    }
}

/// Sum a set of resource lists
pub fn merge<'a>(lists: impl IntoIterator<Item = &'a ResourceList>) -> ResourceList {
    let mut total = ResourceList::new();
    for list in lists {
        merge_into(&mut total, list);
    }
    total
}

/// `lhs - rhs` over the keys of `lhs`
pub fn subtract(lhs: &ResourceList, rhs: &ResourceList) -> ResourceList {
    lhs.iter()
        .map(|(name, quantity)| {
            let used = rhs.get(name).copied().unwrap_or_default();
            (name.clone(), *quantity - used)
        })
        .collect()
}

/// Per-resource maximum of two lists
pub fn max_resources(lhs: &ResourceList, rhs: &ResourceList) -> ResourceList {
    let mut out = lhs.clone();
    for (name, quantity) in rhs {
        let entry = out.entry(name.clone()).or_default();
        if *quantity > *entry {
            *entry = *quantity;
        }
    }
    out
}

/// Treats a missing entry as zero
pub fn is_zero(quantity: Option<&Quantity>) -> bool {
    quantity.map(|q| q.is_zero()).unwrap_or(true)
}

/// Pod or object key: namespace + name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NamespacedName {
    #[serde(default)]
    pub namespace: String,
    pub name: String,
}

impl NamespacedName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key for a cluster-scoped object
    pub fn cluster_scoped(name: impl Into<String>) -> Self {
        Self::new("", name)
    }
}

impl fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

/// Label selector for filtering resources
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LabelSelector {
    /// Match exact labels
    #[serde(rename = "matchLabels")]
    #[serde(default)]
    pub match_labels: HashMap<String, String>,
}

impl LabelSelector {
    /// Create a selector that matches a specific label
    pub fn matching(key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut labels = HashMap::new();
        labels.insert(key.into(), value.into());
        Self {
            match_labels: labels,
        }
    }

    /// Check if labels match this selector
    pub fn matches(&self, labels: &HashMap<String, String>) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v))
    }
}
