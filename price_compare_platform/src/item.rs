//! Product records produced by fetchers and the filter summary derived from them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Category assigned when no keyword rule matches.
pub const DEFAULT_CATEGORY: &str = "Other";

/// Ordered keyword rules; the first rule with a matching keyword wins.
const CATEGORY_RULES: &[(&str, &[&str])] = &[
    ("Footwear", &["shoe", "sneaker", "boot", "sandal", "heel", "loafe"]),
    ("Apparel (Top)", &["shirt", "t-shirt", "top", "kurta", "kurti", "polo"]),
    ("Apparel (Bottom)", &["pant", "jeans", "trouser", "legging", "skirt"]),
    ("Apparel (Full)", &["dress", "gown", "jumpsuit"]),
    ("Accessory", &["watch"]),
    ("Bags", &["bag", "backpack", "handbag"]),
];

/// A product fetched from one store. The product URL is its identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub name: String,
    pub price: f64,
    pub image_url: String,
    pub product_url: String,
    pub store: String,
    #[serde(default)]
    pub category: String,
}

impl Item {
    pub fn new(
        name: impl Into<String>,
        price: f64,
        image_url: impl Into<String>,
        product_url: impl Into<String>,
        store: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            price,
            image_url: image_url.into(),
            product_url: product_url.into(),
            store: store.into(),
            category: String::new(),
        }
    }

    /// First whitespace-delimited token of the name.
    pub fn brand(&self) -> &str {
        self.name.split_whitespace().next().unwrap_or("")
    }

    /// Copy of this item with its category derived from the name.
    pub fn categorized(&self) -> Self {
        Self {
            category: categorize(&self.name).to_string(),
            ..self.clone()
        }
    }
}

/// Derive a category from a product name using the keyword table.
pub fn categorize(name: &str) -> &'static str {
    let name = name.to_lowercase();
    CATEGORY_RULES
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|k| name.contains(k)))
        .map(|(category, _)| *category)
        .unwrap_or(DEFAULT_CATEGORY)
}

/// Summary of an item set used to drive client-side filtering.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Filters {
    pub stores: Vec<String>,
    pub brands: Vec<String>,
    pub categories: Vec<String>,
    pub min_price: i64,
    pub max_price: i64,
}

impl Filters {
    /// Compute filters over `items`. Returns `None` for an empty set.
    pub fn from_items(items: &[Item]) -> Option<Self> {
        if items.is_empty() {
            return None;
        }

        let stores: BTreeSet<&str> = items.iter().map(|i| i.store.as_str()).collect();
        let brands: BTreeSet<&str> = items.iter().map(Item::brand).collect();
        let categories: BTreeSet<&str> = items.iter().map(|i| i.category.as_str()).collect();

        let min = items.iter().map(|i| i.price).fold(f64::INFINITY, f64::min);
        let max = items.iter().map(|i| i.price).fold(f64::NEG_INFINITY, f64::max);

        Some(Self {
            stores: stores.into_iter().map(str::to_string).collect(),
            brands: brands.into_iter().map(str::to_string).collect(),
            categories: categories.into_iter().map(str::to_string).collect(),
            min_price: min.floor() as i64,
            max_price: max.floor() as i64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categorize_first_rule_wins() {
        assert_eq!(categorize("Puma Running Shoes"), "Footwear");
        // "boot" is a footwear keyword and beats "top" further down
        assert_eq!(categorize("Bootcut Top"), "Footwear");
        assert_eq!(categorize("Levis Slim JEANS"), "Apparel (Bottom)");
        assert_eq!(categorize("Floral Maxi Dress"), "Apparel (Full)");
        assert_eq!(categorize("Titan Analog Watch"), "Accessory");
        assert_eq!(categorize("Wildcraft Backpack"), "Bags");
        assert_eq!(categorize("Ceramic Mug"), DEFAULT_CATEGORY);
    }

    #[test]
    fn test_filters_summary() {
        let items = vec![
            Item::new("Nike Air Max", 120.5, "i1", "u1", "Nike").categorized(),
            Item::new("Adidas Polo Shirt", 40.9, "i2", "u2", "Myntra").categorized(),
            Item::new("Nike Pegasus Shoe", 99.0, "i3", "u3", "Myntra").categorized(),
        ];

        let filters = Filters::from_items(&items).unwrap();
        assert_eq!(filters.stores, vec!["Myntra", "Nike"]);
        assert_eq!(filters.brands, vec!["Adidas", "Nike"]);
        assert_eq!(filters.categories, vec!["Apparel (Top)", "Footwear", "Other"]);
        assert_eq!(filters.min_price, 40);
        assert_eq!(filters.max_price, 120);
    }

    #[test]
    fn test_filters_empty_set() {
        assert!(Filters::from_items(&[]).is_none());
    }

    #[test]
    fn test_filters_serialize_camel_case() {
        let items = vec![Item::new("Nike Air", 10.0, "i", "u", "Nike").categorized()];
        let value = serde_json::to_value(Filters::from_items(&items).unwrap()).unwrap();
        assert_eq!(value["minPrice"], 10);
        assert_eq!(value["maxPrice"], 10);
    }
}
