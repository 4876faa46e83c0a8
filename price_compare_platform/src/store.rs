//! Persistence for user interactions, price tracking and coupons.
//!
//! The orchestrator never writes here itself; the request layer and the
//! periodic refresher hand finalized data to a [`Store`].

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::item::Item;
use crate::settings::StoreConfig;

/// Fraction of the current price at which a tracked item is considered a deal.
pub const DESIRED_PRICE_RATIO: f64 = 0.9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClickRecord {
    pub product_name: String,
    pub clicked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WishlistEntry {
    pub product_name: String,
    pub product_url: String,
    pub image_url: String,
    pub store: String,
    pub price: f64,
    pub added_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedItem {
    pub product_url: String,
    pub store: String,
    pub desired_price: f64,
    pub tracked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub product_url: String,
    pub store: String,
    pub price: f64,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coupon {
    pub store: String,
    pub code: String,
    pub description: String,
    pub last_updated: DateTime<Utc>,
}

/// Coupons grouped by store name, stores in sorted order.
pub type CouponsByStore = BTreeMap<String, Vec<Coupon>>;

#[async_trait]
pub trait Store: Send + Sync {
    async fn record_click(&self, requester: &str, product_name: &str) -> Result<()>;

    /// Most recent clicks first.
    async fn click_history(&self, requester: &str, limit: usize) -> Result<Vec<ClickRecord>>;

    /// Returns `false` when the URL is already on the requester's wishlist.
    async fn add_to_wishlist(&self, requester: &str, item: &Item) -> Result<bool>;

    async fn remove_from_wishlist(&self, requester: &str, product_url: &str) -> Result<()>;

    async fn wishlist(&self, requester: &str) -> Result<Vec<WishlistEntry>>;

    /// Idempotent per (requester, URL).
    async fn track_price(&self, requester: &str, item: &Item) -> Result<()>;

    async fn tracked_items(&self, requester: &str) -> Result<Vec<TrackedItem>>;

    async fn log_price(&self, item: &Item) -> Result<()>;

    /// Oldest point first.
    async fn price_history(&self, product_url: &str) -> Result<Vec<PricePoint>>;

    /// Insert, or refresh description and timestamp of an existing (store, code).
    async fn upsert_coupon(&self, store: &str, code: &str, description: &str) -> Result<()>;

    async fn coupons_by_store(&self) -> Result<CouponsByStore>;

    /// Product names each requester interacted with: clicks oldest first,
    /// then wishlist entries. One session per requester.
    async fn interaction_sessions(&self) -> Result<Vec<Vec<String>>>;
}

/// Open the configured store: sled on disk, or memory when no path is set.
pub fn open(config: &StoreConfig) -> Result<Arc<dyn Store>> {
    match config.db_path.as_deref() {
        Some(path) if !path.is_empty() => Ok(Arc::new(SledStore::open(path)?)),
        _ => {
            info!("No store path configured; using in-memory store");
            Ok(Arc::new(InMemoryStore::new()))
        }
    }
}

fn wishlist_entry(item: &Item) -> WishlistEntry {
    WishlistEntry {
        product_name: item.name.clone(),
        product_url: item.product_url.clone(),
        image_url: item.image_url.clone(),
        store: item.store.clone(),
        price: item.price,
        added_at: Utc::now(),
    }
}

fn tracked_item(item: &Item) -> TrackedItem {
    TrackedItem {
        product_url: item.product_url.clone(),
        store: item.store.clone(),
        desired_price: item.price * DESIRED_PRICE_RATIO,
        tracked_at: Utc::now(),
    }
}

fn price_point(item: &Item) -> PricePoint {
    PricePoint {
        product_url: item.product_url.clone(),
        store: item.store.clone(),
        price: item.price,
        recorded_at: Utc::now(),
    }
}

fn group_coupons(coupons: impl IntoIterator<Item = Coupon>) -> CouponsByStore {
    let mut grouped = CouponsByStore::new();
    for coupon in coupons {
        grouped.entry(coupon.store.clone()).or_default().push(coupon);
    }
    for list in grouped.values_mut() {
        list.sort_by(|a, b| b.last_updated.cmp(&a.last_updated));
    }
    grouped
}

/// Key made of `parts` joined by a zero byte, so one requester's prefix
/// never matches another's.
fn composite_key(parts: &[&str]) -> Vec<u8> {
    let mut key = Vec::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            key.push(0);
        }
        key.extend_from_slice(part.as_bytes());
    }
    key
}

/// Requester part of a key built by [`prefix`] or [`composite_key`].
fn requester_of(key: &[u8]) -> String {
    let end = key.iter().position(|b| *b == 0).unwrap_or(key.len());
    String::from_utf8_lossy(&key[..end]).into_owned()
}

fn prefix(part: &str) -> Vec<u8> {
    let mut key = part.as_bytes().to_vec();
    key.push(0);
    key
}

/// Store backed by a sled database with one tree per concern.
pub struct SledStore {
    db: sled::Db,
    clicks: sled::Tree,
    wishlist: sled::Tree,
    tracking: sled::Tree,
    price_history: sled::Tree,
    coupons: sled::Tree,
}

impl SledStore {
    pub fn open(path: &str) -> Result<Self> {
        let db = sled::open(path)
            .map_err(|e| anyhow!("Failed to open store database at '{}': {}", path, e))?;
        info!("Store database opened at '{}'", path);
        Self::from_db(db)
    }

    /// Temporary database removed on drop; used by tests and demos.
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .context("Failed to open temporary store")?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self> {
        Ok(Self {
            clicks: db.open_tree("clicks")?,
            wishlist: db.open_tree("wishlist")?,
            tracking: db.open_tree("price_tracking")?,
            price_history: db.open_tree("price_history")?,
            coupons: db.open_tree("coupons")?,
            db,
        })
    }

    /// Key suffix that sorts in insertion order.
    fn sequence(&self) -> Result<[u8; 8]> {
        Ok(self.db.generate_id()?.to_be_bytes())
    }

    /// Every mutation is flushed before it is acknowledged.
    async fn persist(&self) -> Result<()> {
        self.db
            .flush_async()
            .await
            .context("Failed to flush store database")?;
        Ok(())
    }

    fn decode_prefix<T: DeserializeOwned>(tree: &sled::Tree, prefix: &[u8]) -> Result<Vec<T>> {
        tree.scan_prefix(prefix)
            .map(|entry| -> Result<T> {
                let (_, bytes) = entry?;
                Ok(bincode::deserialize(&bytes)?)
            })
            .collect()
    }
}

#[async_trait]
impl Store for SledStore {
    async fn record_click(&self, requester: &str, product_name: &str) -> Result<()> {
        let record = ClickRecord {
            product_name: product_name.to_string(),
            clicked_at: Utc::now(),
        };
        let mut key = prefix(requester);
        key.extend_from_slice(&self.sequence()?);
        self.clicks.insert(key, bincode::serialize(&record)?)?;
        self.persist().await
    }

    async fn click_history(&self, requester: &str, limit: usize) -> Result<Vec<ClickRecord>> {
        let mut clicks: Vec<ClickRecord> = Self::decode_prefix(&self.clicks, &prefix(requester))?;
        clicks.reverse();
        clicks.truncate(limit);
        Ok(clicks)
    }

    async fn add_to_wishlist(&self, requester: &str, item: &Item) -> Result<bool> {
        let key = composite_key(&[requester, &item.product_url]);
        let value = bincode::serialize(&wishlist_entry(item))?;
        let inserted = self
            .wishlist
            .compare_and_swap(key, None as Option<&[u8]>, Some(value))?
            .is_ok();
        if inserted {
            self.persist().await?;
        }
        Ok(inserted)
    }

    async fn remove_from_wishlist(&self, requester: &str, product_url: &str) -> Result<()> {
        if self
            .wishlist
            .remove(composite_key(&[requester, product_url]))?
            .is_some()
        {
            self.persist().await?;
        }
        Ok(())
    }

    async fn wishlist(&self, requester: &str) -> Result<Vec<WishlistEntry>> {
        Self::decode_prefix(&self.wishlist, &prefix(requester))
    }

    async fn track_price(&self, requester: &str, item: &Item) -> Result<()> {
        let key = composite_key(&[requester, &item.product_url]);
        let value = bincode::serialize(&tracked_item(item))?;
        if self
            .tracking
            .compare_and_swap(key, None as Option<&[u8]>, Some(value))?
            .is_err()
        {
            debug!("{} already tracks {}", requester, item.product_url);
            return Ok(());
        }
        self.persist().await
    }

    async fn tracked_items(&self, requester: &str) -> Result<Vec<TrackedItem>> {
        Self::decode_prefix(&self.tracking, &prefix(requester))
    }

    async fn log_price(&self, item: &Item) -> Result<()> {
        let mut key = prefix(&item.product_url);
        key.extend_from_slice(&self.sequence()?);
        self.price_history
            .insert(key, bincode::serialize(&price_point(item))?)?;
        self.persist().await
    }

    async fn price_history(&self, product_url: &str) -> Result<Vec<PricePoint>> {
        Self::decode_prefix(&self.price_history, &prefix(product_url))
    }

    async fn upsert_coupon(&self, store: &str, code: &str, description: &str) -> Result<()> {
        let coupon = Coupon {
            store: store.to_string(),
            code: code.to_string(),
            description: description.to_string(),
            last_updated: Utc::now(),
        };
        self.coupons
            .insert(composite_key(&[store, code]), bincode::serialize(&coupon)?)?;
        self.persist().await
    }

    async fn coupons_by_store(&self) -> Result<CouponsByStore> {
        let coupons: Vec<Coupon> = Self::decode_prefix(&self.coupons, &[])?;
        Ok(group_coupons(coupons))
    }

    async fn interaction_sessions(&self) -> Result<Vec<Vec<String>>> {
        let mut sessions: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for entry in self.clicks.iter() {
            let (key, bytes) = entry?;
            let click: ClickRecord = bincode::deserialize(&bytes)?;
            sessions
                .entry(requester_of(&key))
                .or_default()
                .push(click.product_name);
        }
        for entry in self.wishlist.iter() {
            let (key, bytes) = entry?;
            let wished: WishlistEntry = bincode::deserialize(&bytes)?;
            sessions
                .entry(requester_of(&key))
                .or_default()
                .push(wished.product_name);
        }
        Ok(sessions.into_values().collect())
    }
}

#[derive(Default)]
struct MemoryTables {
    clicks: BTreeMap<String, Vec<ClickRecord>>,
    wishlist: BTreeMap<(String, String), WishlistEntry>,
    tracking: BTreeMap<(String, String), TrackedItem>,
    price_history: BTreeMap<String, Vec<PricePoint>>,
    coupons: BTreeMap<(String, String), Coupon>,
}

/// Process-local store with the same semantics as [`SledStore`].
#[derive(Default)]
pub struct InMemoryStore {
    tables: Mutex<MemoryTables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn record_click(&self, requester: &str, product_name: &str) -> Result<()> {
        self.tables
            .lock()
            .clicks
            .entry(requester.to_string())
            .or_default()
            .push(ClickRecord {
                product_name: product_name.to_string(),
                clicked_at: Utc::now(),
            });
        Ok(())
    }

    async fn click_history(&self, requester: &str, limit: usize) -> Result<Vec<ClickRecord>> {
        let tables = self.tables.lock();
        Ok(tables
            .clicks
            .get(requester)
            .map(|clicks| clicks.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn add_to_wishlist(&self, requester: &str, item: &Item) -> Result<bool> {
        let mut tables = self.tables.lock();
        let key = (requester.to_string(), item.product_url.clone());
        if tables.wishlist.contains_key(&key) {
            return Ok(false);
        }
        tables.wishlist.insert(key, wishlist_entry(item));
        Ok(true)
    }

    async fn remove_from_wishlist(&self, requester: &str, product_url: &str) -> Result<()> {
        self.tables
            .lock()
            .wishlist
            .remove(&(requester.to_string(), product_url.to_string()));
        Ok(())
    }

    async fn wishlist(&self, requester: &str) -> Result<Vec<WishlistEntry>> {
        let tables = self.tables.lock();
        Ok(tables
            .wishlist
            .iter()
            .filter(|((owner, _), _)| owner == requester)
            .map(|(_, entry)| entry.clone())
            .collect())
    }

    async fn track_price(&self, requester: &str, item: &Item) -> Result<()> {
        self.tables
            .lock()
            .tracking
            .entry((requester.to_string(), item.product_url.clone()))
            .or_insert_with(|| tracked_item(item));
        Ok(())
    }

    async fn tracked_items(&self, requester: &str) -> Result<Vec<TrackedItem>> {
        let tables = self.tables.lock();
        Ok(tables
            .tracking
            .iter()
            .filter(|((owner, _), _)| owner == requester)
            .map(|(_, entry)| entry.clone())
            .collect())
    }

    async fn log_price(&self, item: &Item) -> Result<()> {
        self.tables
            .lock()
            .price_history
            .entry(item.product_url.clone())
            .or_default()
            .push(price_point(item));
        Ok(())
    }

    async fn price_history(&self, product_url: &str) -> Result<Vec<PricePoint>> {
        Ok(self
            .tables
            .lock()
            .price_history
            .get(product_url)
            .cloned()
            .unwrap_or_default())
    }

    async fn upsert_coupon(&self, store: &str, code: &str, description: &str) -> Result<()> {
        self.tables.lock().coupons.insert(
            (store.to_string(), code.to_string()),
            Coupon {
                store: store.to_string(),
                code: code.to_string(),
                description: description.to_string(),
                last_updated: Utc::now(),
            },
        );
        Ok(())
    }

    async fn coupons_by_store(&self) -> Result<CouponsByStore> {
        let coupons: Vec<Coupon> = self.tables.lock().coupons.values().cloned().collect();
        Ok(group_coupons(coupons))
    }

    async fn interaction_sessions(&self) -> Result<Vec<Vec<String>>> {
        let tables = self.tables.lock();
        let mut sessions: BTreeMap<String, Vec<String>> = tables
            .clicks
            .iter()
            .map(|(requester, clicks)| {
                let names = clicks.iter().map(|c| c.product_name.clone()).collect();
                (requester.clone(), names)
            })
            .collect();
        for ((requester, _), entry) in &tables.wishlist {
            sessions
                .entry(requester.clone())
                .or_default()
                .push(entry.product_name.clone());
        }
        Ok(sessions.into_values().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(url: &str, price: f64) -> Item {
        Item::new("Nike Air Boot", price, "img.jpg", url, "Nike")
    }

    async fn exercise_store(store: &dyn Store) {
        // clicks
        store.record_click("alice", "first").await.unwrap();
        store.record_click("alice", "second").await.unwrap();
        store.record_click("alice", "third").await.unwrap();
        store.record_click("alicia", "other").await.unwrap();
        let history = store.click_history("alice", 2).await.unwrap();
        let names: Vec<_> = history.iter().map(|c| c.product_name.as_str()).collect();
        assert_eq!(names, vec!["third", "second"]);

        // wishlist
        assert!(store.add_to_wishlist("alice", &item("u1", 100.0)).await.unwrap());
        assert!(!store.add_to_wishlist("alice", &item("u1", 90.0)).await.unwrap());
        assert!(store.add_to_wishlist("bob", &item("u1", 100.0)).await.unwrap());
        assert_eq!(store.wishlist("alice").await.unwrap().len(), 1);
        store.remove_from_wishlist("alice", "u1").await.unwrap();
        store.remove_from_wishlist("alice", "u1").await.unwrap();
        assert!(store.wishlist("alice").await.unwrap().is_empty());
        assert_eq!(store.wishlist("bob").await.unwrap().len(), 1);

        // price tracking
        store.track_price("alice", &item("u2", 200.0)).await.unwrap();
        store.track_price("alice", &item("u2", 150.0)).await.unwrap();
        let tracked = store.tracked_items("alice").await.unwrap();
        assert_eq!(tracked.len(), 1);
        assert!((tracked[0].desired_price - 180.0).abs() < 1e-9);

        store.log_price(&item("u2", 200.0)).await.unwrap();
        store.log_price(&item("u2", 150.0)).await.unwrap();
        let history = store.price_history("u2").await.unwrap();
        let prices: Vec<_> = history.iter().map(|p| p.price).collect();
        assert_eq!(prices, vec![200.0, 150.0]);

        // coupons
        store.upsert_coupon("Nike", "JUSTDOIT", "15% off").await.unwrap();
        store.upsert_coupon("Myntra", "MYNTRA20", "20% off").await.unwrap();
        store.upsert_coupon("Nike", "JUSTDOIT", "20% off").await.unwrap();
        let coupons = store.coupons_by_store().await.unwrap();
        let stores: Vec<_> = coupons.keys().cloned().collect();
        assert_eq!(stores, vec!["Myntra", "Nike"]);
        assert_eq!(coupons["Nike"].len(), 1);
        assert_eq!(coupons["Nike"][0].description, "20% off");

        // sessions: alice's wishlist entry was removed, bob only wished
        let sessions = store.interaction_sessions().await.unwrap();
        assert_eq!(
            sessions,
            vec![
                vec!["first".to_string(), "second".to_string(), "third".to_string()],
                vec!["other".to_string()],
                vec!["Nike Air Boot".to_string()],
            ]
        );
    }

    #[tokio::test]
    async fn test_in_memory_store() {
        exercise_store(&InMemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_sled_store() {
        exercise_store(&SledStore::temporary().unwrap()).await;
    }

    #[tokio::test]
    async fn test_sled_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        let path = path.to_str().unwrap();

        {
            let store = SledStore::open(path).unwrap();
            store.add_to_wishlist("alice", &item("u1", 10.0)).await.unwrap();
            store.record_click("alice", "Nike Air Boot").await.unwrap();
            store.track_price("alice", &item("u2", 50.0)).await.unwrap();
            store.log_price(&item("u2", 50.0)).await.unwrap();
            store.upsert_coupon("Nike", "JUSTDOIT", "15% off").await.unwrap();
        }

        let store = SledStore::open(path).unwrap();
        assert_eq!(store.wishlist("alice").await.unwrap().len(), 1);
        assert_eq!(store.click_history("alice", 10).await.unwrap().len(), 1);
        assert_eq!(store.tracked_items("alice").await.unwrap().len(), 1);
        assert_eq!(store.price_history("u2").await.unwrap().len(), 1);
        assert_eq!(store.coupons_by_store().await.unwrap()["Nike"].len(), 1);
        assert_eq!(
            store.interaction_sessions().await.unwrap(),
            vec![vec!["Nike Air Boot".to_string(), "Nike Air Boot".to_string()]]
        );
    }

    #[test]
    fn test_coupons_sorted_most_recent_first() {
        let now = Utc::now();
        let older = Coupon {
            store: "Nike".into(),
            code: "A".into(),
            description: String::new(),
            last_updated: now - chrono::Duration::hours(1),
        };
        let newer = Coupon {
            code: "B".into(),
            last_updated: now,
            ..older.clone()
        };
        let grouped = group_coupons(vec![older, newer]);
        assert_eq!(grouped["Nike"][0].code, "B");
    }
}
