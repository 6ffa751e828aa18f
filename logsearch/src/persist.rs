use std::sync::Arc;

use common::{KeyValueStore, KeyValueStoreExt};

use crate::model::SearchParams;

const SEARCH_PARAMS_KEY: &str = "searchParams";
const ACTIVE_FIELDS_KEY: &str = "activeFields";
const FAVORITE_MODULE_KEY: &str = "favoriteModule";

/// Per-tab mirror of console state.
///
/// Written by the params store whenever its snapshot changes and read once at
/// startup. Every operation is best-effort: failures are logged and reported
/// as "nothing stored", never returned.
#[derive(Clone)]
pub struct TabMirror {
    store: Arc<dyn KeyValueStore>,
    tab_id: String,
}

impl TabMirror {
    pub fn new(store: Arc<dyn KeyValueStore>, tab_id: impl Into<String>) -> Self {
        Self {
            store,
            tab_id: tab_id.into(),
        }
    }

    pub fn tab_id(&self) -> &str {
        &self.tab_id
    }

    fn tab_key(&self, name: &str) -> String {
        format!("{}:{}", self.tab_id, name)
    }

    pub fn save_params(&self, params: &SearchParams) {
        let key = self.tab_key(SEARCH_PARAMS_KEY);
        if let Err(err) = self.store.put_json(&key, params) {
            tracing::warn!(%key, error = %err, "failed to mirror search params");
        }
    }

    pub fn load_params(&self) -> Option<SearchParams> {
        self.load(&self.tab_key(SEARCH_PARAMS_KEY))
    }

    pub fn save_active_fields(&self, fields: &[String]) {
        let key = self.tab_key(ACTIVE_FIELDS_KEY);
        if let Err(err) = self.store.put_json(&key, fields) {
            tracing::warn!(%key, error = %err, "failed to mirror active fields");
        }
    }

    pub fn load_active_fields(&self) -> Option<Vec<String>> {
        self.load(&self.tab_key(ACTIVE_FIELDS_KEY))
    }

    /// The favorite module is shared by every tab.
    pub fn favorite_module(&self) -> Option<String> {
        self.load(FAVORITE_MODULE_KEY)
    }

    /// Makes `module` the favorite, or clears the favorite if it already is.
    /// Returns the favorite after the toggle.
    pub fn toggle_favorite_module(&self, module: &str) -> Option<String> {
        let next = match self.favorite_module() {
            Some(current) if current == module => None,
            _ => Some(module.to_string()),
        };
        let result = match &next {
            Some(module) => self.store.put_json(FAVORITE_MODULE_KEY, module),
            None => self.store.delete(FAVORITE_MODULE_KEY),
        };
        if let Err(err) = result {
            tracing::warn!(error = %err, "failed to store favorite module");
        }
        next
    }

    fn load<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.store.get_json(key) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(%key, error = %err, "ignoring unreadable mirror entry");
                None
            }
        }
    }
}
