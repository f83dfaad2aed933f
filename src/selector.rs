//! Cheapest-matching instance class selection.
//!
//! Rows are the inner join of the catalogue and the market prices on
//! instance class. The operator either names a class or gives attribute
//! constraints, plus sort keys. Price is always appended as the last sort
//! key so it only breaks ties between rows the operator's keys rank equal.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::provider::{InstanceTypeInfo, MarketPrice};

/// Attribute holding the hourly price of a row.
pub const PRICE: &str = "price";

/// Attribute holding price divided by vCPU count.
pub const PRICE_PER_CPU: &str = "price_per_cpu";

/// Attribute holding the vCPU count in the catalogue.
pub const VCPU: &str = "vcpu";

/// Errors raised while parsing selections or choosing a row.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SelectionError {
    /// Raised when a constraint is not of the form `attr<op>value`.
    #[error("invalid constraint '{0}': expected <attribute><op><number>, e.g. memory>=16")]
    InvalidConstraint(String),
    /// Raised when a sort key is empty.
    #[error("sort keys must not be empty")]
    EmptySortKey,
    /// Raised when nothing satisfies the selection.
    #[error("no instance type matches {selection}")]
    NoMatch {
        /// Description of the selection.
        selection: String,
    },
}

/// One purchasable instance class in one zone.
#[derive(Clone, Debug, PartialEq)]
pub struct CatalogRow {
    /// Instance class name.
    pub instance_type: String,
    /// Zone the price applies to.
    pub zone: String,
    /// Hourly price.
    pub price: f64,
    /// Hardware attributes plus derived `price_per_cpu`.
    pub attributes: BTreeMap<String, f64>,
}

impl CatalogRow {
    /// Looks up a numeric attribute, including `price`.
    #[must_use]
    pub fn attribute(&self, key: &str) -> Option<f64> {
        if key == PRICE {
            return Some(self.price);
        }
        self.attributes.get(key).copied()
    }
}

/// Joins catalogue entries with prices on instance class.
///
/// Classes without a price, and prices without a catalogue entry, are
/// dropped. Each row gains a `price_per_cpu` attribute when the class
/// reports a positive vCPU count.
#[must_use]
pub fn join_prices(catalog: &[InstanceTypeInfo], prices: &[MarketPrice]) -> Vec<CatalogRow> {
    let by_type: BTreeMap<&str, &InstanceTypeInfo> = catalog
        .iter()
        .map(|info| (info.instance_type.as_str(), info))
        .collect();
    prices
        .iter()
        .filter_map(|price| {
            let info = by_type.get(price.instance_type.as_str())?;
            let mut attributes = info.attributes.clone();
            if let Some(vcpu) = attributes.get(VCPU).copied().filter(|vcpu| *vcpu > 0.0) {
                #[expect(
                    clippy::float_arithmetic,
                    reason = "price per CPU is a ratio of two floating point values"
                )]
                let per_cpu = price.price / vcpu;
                attributes.insert(PRICE_PER_CPU.to_owned(), per_cpu);
            }
            Some(CatalogRow {
                instance_type: price.instance_type.clone(),
                zone: price.zone.clone(),
                price: price.price,
                attributes,
            })
        })
        .collect()
}

/// Comparison operator in a [`Constraint`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Comparison {
    /// `>=`
    AtLeast,
    /// `<=`
    AtMost,
    /// `>`
    Above,
    /// `<`
    Below,
    /// `=` or `==`
    Equal,
}

impl Comparison {
    fn holds(self, actual: f64, expected: f64) -> bool {
        match self {
            Self::AtLeast => actual >= expected,
            Self::AtMost => actual <= expected,
            Self::Above => actual > expected,
            Self::Below => actual < expected,
            Self::Equal => actual.total_cmp(&expected) == Ordering::Equal,
        }
    }

    const fn symbol(self) -> &'static str {
        match self {
            Self::AtLeast => ">=",
            Self::AtMost => "<=",
            Self::Above => ">",
            Self::Below => "<",
            Self::Equal => "=",
        }
    }
}

/// Attribute predicate such as `memory>=16`.
#[derive(Clone, Debug, PartialEq)]
pub struct Constraint {
    /// Attribute name.
    pub attribute: String,
    /// Comparison operator.
    pub comparison: Comparison,
    /// Right-hand side.
    pub value: f64,
}

impl Constraint {
    /// Returns `true` when `row` has the attribute and satisfies the bound.
    #[must_use]
    pub fn matches(&self, row: &CatalogRow) -> bool {
        row.attribute(&self.attribute)
            .is_some_and(|actual| self.comparison.holds(actual, self.value))
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.attribute, self.comparison.symbol(), self.value)
    }
}

impl FromStr for Constraint {
    type Err = SelectionError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        const OPERATORS: [(&str, Comparison); 6] = [
            (">=", Comparison::AtLeast),
            ("<=", Comparison::AtMost),
            ("==", Comparison::Equal),
            (">", Comparison::Above),
            ("<", Comparison::Below),
            ("=", Comparison::Equal),
        ];
        let invalid = || SelectionError::InvalidConstraint(raw.to_owned());
        let (attribute, comparison, value) = OPERATORS
            .iter()
            .find_map(|(symbol, comparison)| {
                raw.split_once(symbol)
                    .map(|(lhs, rhs)| (lhs.trim(), *comparison, rhs.trim()))
            })
            .ok_or_else(invalid)?;
        if attribute.is_empty() {
            return Err(invalid());
        }
        let parsed = value.parse::<f64>().map_err(|_| invalid())?;
        Ok(Self {
            attribute: attribute.to_owned(),
            comparison,
            value: parsed,
        })
    }
}

/// Which rows are eligible.
#[derive(Clone, Debug, PartialEq)]
pub enum Selection {
    /// Exactly one named class.
    Exact(String),
    /// Every row satisfying all constraints.
    Matching(Vec<Constraint>),
}

impl Selection {
    /// Parses operator input. Text containing a comparison operator is read
    /// as comma-separated constraints, anything else as a class name.
    ///
    /// # Errors
    ///
    /// Returns [`SelectionError::InvalidConstraint`] for malformed
    /// constraints.
    pub fn parse(raw: &str) -> Result<Self, SelectionError> {
        let trimmed = raw.trim();
        if !trimmed.contains(['<', '>', '=']) {
            return Ok(Self::Exact(trimmed.to_owned()));
        }
        trimmed
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(str::parse)
            .collect::<Result<Vec<_>, _>>()
            .map(Self::Matching)
    }

    fn admits(&self, row: &CatalogRow) -> bool {
        match self {
            Self::Exact(instance_type) => row.instance_type.eq_ignore_ascii_case(instance_type),
            Self::Matching(constraints) => constraints.iter().all(|c| c.matches(row)),
        }
    }
}

impl fmt::Display for Selection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(instance_type) => write!(f, "type {instance_type}"),
            Self::Matching(constraints) if constraints.is_empty() => f.write_str("any type"),
            Self::Matching(constraints) => {
                let joined = constraints
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(",");
                f.write_str(&joined)
            }
        }
    }
}

/// Sort key; a leading `-` sorts descending.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SortKey {
    /// Attribute name.
    pub attribute: String,
    /// Whether larger values come first.
    pub descending: bool,
}

impl SortKey {
    /// Ascending key on `attribute`.
    #[must_use]
    pub fn ascending(attribute: &str) -> Self {
        Self {
            attribute: attribute.to_owned(),
            descending: false,
        }
    }

    fn compare(&self, lhs: &CatalogRow, rhs: &CatalogRow) -> Ordering {
        match (lhs.attribute(&self.attribute), rhs.attribute(&self.attribute)) {
            (Some(a), Some(b)) if self.descending => b.total_cmp(&a),
            (Some(a), Some(b)) => a.total_cmp(&b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
    }
}

impl FromStr for SortKey {
    type Err = SelectionError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        let (attribute, descending) = trimmed
            .strip_prefix('-')
            .map_or((trimmed, false), |rest| (rest, true));
        if attribute.is_empty() {
            return Err(SelectionError::EmptySortKey);
        }
        Ok(Self {
            attribute: attribute.to_owned(),
            descending,
        })
    }
}

/// Chooses the first row after filtering and sorting.
///
/// # Errors
///
/// Returns [`SelectionError::NoMatch`] when no row is eligible.
pub fn select(
    rows: &[CatalogRow],
    selection: &Selection,
    sort: &[SortKey],
) -> Result<CatalogRow, SelectionError> {
    let mut keys = sort.to_vec();
    keys.push(SortKey::ascending(PRICE));

    let mut eligible: Vec<&CatalogRow> = rows.iter().filter(|row| selection.admits(row)).collect();
    eligible.sort_by(|lhs, rhs| {
        keys.iter()
            .map(|key| key.compare(lhs, rhs))
            .find(|ordering| ordering.is_ne())
            .unwrap_or(Ordering::Equal)
    });
    eligible
        .first()
        .map(|row| (*row).clone())
        .ok_or_else(|| SelectionError::NoMatch {
            selection: selection.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};

    fn row(instance_type: &str, price: f64, mem: f64) -> CatalogRow {
        let mut attributes = BTreeMap::new();
        attributes.insert(String::from("mem"), mem);
        CatalogRow {
            instance_type: instance_type.to_owned(),
            zone: String::from("fr-par-1"),
            price,
            attributes,
        }
    }

    #[fixture]
    fn rows() -> Vec<CatalogRow> {
        vec![row("a", 0.5, 8.0), row("b", 0.3, 16.0)]
    }

    fn keys(raw: &[&str]) -> Vec<SortKey> {
        raw.iter()
            .map(|key| key.parse().expect("sort key parses"))
            .collect()
    }

    #[rstest]
    #[case(&[], "b")]
    #[case(&["mem"], "a")]
    #[case(&["-mem"], "b")]
    fn sort_keys_take_priority_over_price(
        rows: Vec<CatalogRow>,
        #[case] sort: &[&str],
        #[case] expected: &str,
    ) {
        let selection = Selection::parse("mem>=8").expect("constraint parses");
        let chosen = select(&rows, &selection, &keys(sort)).expect("a row matches");
        assert_eq!(chosen.instance_type, expected);
    }

    #[rstest]
    fn price_breaks_ties_between_equal_keys() {
        let rows = vec![row("dear", 0.9, 16.0), row("cheap", 0.2, 16.0)];
        let chosen = select(&rows, &Selection::Matching(Vec::new()), &keys(&["-mem"]))
            .expect("a row matches");
        assert_eq!(chosen.instance_type, "cheap");
    }

    #[rstest]
    fn exact_selection_ignores_case(rows: Vec<CatalogRow>) {
        let chosen = select(&rows, &Selection::parse("A").expect("parses"), &[])
            .expect("a row matches");
        assert_eq!(chosen.instance_type, "a");
    }

    #[rstest]
    fn unmatched_filter_reports_selection(rows: Vec<CatalogRow>) {
        let selection = Selection::parse("mem>64").expect("constraint parses");
        let err = select(&rows, &selection, &[]).expect_err("nothing matches");
        assert_eq!(
            err,
            SelectionError::NoMatch {
                selection: String::from("mem>64")
            }
        );
    }

    #[rstest]
    #[case("mem")]
    #[case(">=4")]
    #[case("mem>=lots")]
    fn malformed_constraints_are_rejected(#[case] raw: &str) {
        let parsed = raw.parse::<Constraint>();
        assert!(parsed.is_err(), "{raw} should not parse");
    }

    #[test]
    fn join_drops_unpriced_types_and_adds_price_per_cpu() {
        let mut attributes = BTreeMap::new();
        attributes.insert(String::from(VCPU), 4.0);
        let catalog = vec![
            InstanceTypeInfo {
                instance_type: String::from("PRO2-S"),
                attributes,
            },
            InstanceTypeInfo {
                instance_type: String::from("UNPRICED"),
                attributes: BTreeMap::new(),
            },
        ];
        let prices = vec![MarketPrice {
            instance_type: String::from("PRO2-S"),
            zone: String::from("fr-par-2"),
            price: 0.2,
        }];

        let rows = join_prices(&catalog, &prices);

        let [joined] = rows.as_slice() else {
            panic!("expected one joined row, got {rows:?}");
        };
        assert_eq!(joined.zone, "fr-par-2");
        assert_eq!(joined.attribute(PRICE_PER_CPU), Some(0.05));
    }
}
