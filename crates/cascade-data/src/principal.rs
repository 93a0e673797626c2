use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::DataError;
use crate::event::EventId;

/// The data container handed to every module invocation.
///
/// Products are JSON values keyed by label. Insertion is write-once per
/// label; concurrent readers are expected while sibling paths run.
#[derive(Debug)]
pub struct Principal {
  id: EventId,
  products: RwLock<HashMap<String, serde_json::Value>>,
}

impl Principal {
  pub fn new(id: EventId) -> Self {
    Self {
      id,
      products: RwLock::new(HashMap::new()),
    }
  }

  /// Convenience constructor seeding the store with initial products.
  pub fn with_products(id: EventId, products: HashMap<String, serde_json::Value>) -> Self {
    Self {
      id,
      products: RwLock::new(products),
    }
  }

  pub fn id(&self) -> EventId {
    self.id
  }

  /// Insert a product. Labels are write-once for the life of the principal.
  pub fn put(
    &self,
    label: impl Into<String>,
    product: serde_json::Value,
  ) -> Result<(), DataError> {
    let label = label.into();
    let mut products = self.products.write().expect("product store poisoned");
    if products.contains_key(&label) {
      return Err(DataError::DuplicateProduct { label, id: self.id });
    }
    products.insert(label, product);
    Ok(())
  }

  /// Fetch a product by label, cloning it out of the store.
  pub fn get(&self, label: &str) -> Option<serde_json::Value> {
    self
      .products
      .read()
      .expect("product store poisoned")
      .get(label)
      .cloned()
  }

  /// Fetch a product, failing with context when absent.
  pub fn get_required(&self, label: &str) -> Result<serde_json::Value, DataError> {
    self.get(label).ok_or_else(|| DataError::ProductNotFound {
      label: label.to_string(),
      id: self.id,
    })
  }

  /// Snapshot of every product currently in the store.
  pub fn products(&self) -> HashMap<String, serde_json::Value> {
    self.products.read().expect("product store poisoned").clone()
  }
}
