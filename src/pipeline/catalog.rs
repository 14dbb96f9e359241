//! Static per-category configuration and suggested-action building.
//!
//! The catalog is owned by the caller and only read here. Protection of
//! `personal` and `important` does not depend on the catalog: those two are
//! always protected, and the catalog can only add protection elsewhere.

use std::collections::HashMap;

use crate::pipeline::types::{
    ActionType, CategorizationResult, Category, HeaderSignals, SuggestedAction,
};

/// Priority of the category's default action.
const DEFAULT_ACTION_PRIORITY: u8 = 2;

/// Priority of an action boosted by a strong signal.
const BOOSTED_ACTION_PRIORITY: u8 = 1;

#[derive(Debug, Clone)]
pub struct CategoryConfig {
    pub protected: bool,
    pub default_action: ActionType,
    /// Presentation order, ascending.
    pub order: u8,
    /// Why the default action is suggested.
    pub reason: String,
}

impl CategoryConfig {
    fn new(protected: bool, default_action: ActionType, order: u8, reason: &str) -> Self {
        Self {
            protected,
            default_action,
            order,
            reason: reason.to_string(),
        }
    }
}

/// Read-only lookup of category configuration.
#[derive(Debug, Clone)]
pub struct CategoryCatalog {
    entries: HashMap<Category, CategoryConfig>,
}

impl Default for CategoryCatalog {
    fn default() -> Self {
        use ActionType::*;
        use Category::*;

        let entries = HashMap::from([
            (Important, CategoryConfig::new(true, Keep, 1, "Flagged as important")),
            (Personal, CategoryConfig::new(true, Keep, 2, "Written to you personally")),
            (Transactional, CategoryConfig::new(false, Archive, 3, "Receipt or account notice; keep it searchable")),
            (Notification, CategoryConfig::new(false, MarkRead, 4, "Automated notification")),
            (Social, CategoryConfig::new(false, Archive, 5, "Social network activity")),
            (Newsletter, CategoryConfig::new(false, Archive, 6, "Newsletter you subscribed to")),
            (Marketing, CategoryConfig::new(false, Archive, 7, "Promotional email")),
            (Spam, CategoryConfig::new(false, Delete, 8, "Looks like spam")),
            (Unknown, CategoryConfig::new(false, Review, 9, "Could not be categorized confidently")),
        ]);

        Self { entries }
    }
}

impl CategoryCatalog {
    /// Build a catalog from explicit entries. Categories left out fall back
    /// to the default configuration.
    pub fn with_entries(entries: impl IntoIterator<Item = (Category, CategoryConfig)>) -> Self {
        let mut catalog = Self::default();
        catalog.entries.extend(entries);
        catalog
    }

    pub fn config(&self, category: Category) -> Option<&CategoryConfig> {
        self.entries.get(&category)
    }

    pub fn is_protected(&self, category: Category) -> bool {
        category.is_protected() || self.config(category).is_some_and(|c| c.protected)
    }

    /// All categories in presentation order.
    pub fn ordered(&self) -> Vec<Category> {
        let mut categories = Category::ALL.to_vec();
        categories.sort_by_key(|c| self.config(*c).map_or(u8::MAX, |cfg| cfg.order));
        categories
    }

    /// Actions for an email of `category`, best first.
    ///
    /// The default action comes from the catalog. At most one extra action is
    /// added, ahead of it, when a strong header signal applies.
    pub fn suggested_actions(&self, category: Category, signals: &HeaderSignals) -> Vec<SuggestedAction> {
        if self.is_protected(category) {
            return vec![keep_action()];
        }

        let mut actions = Vec::with_capacity(2);

        if let Some(boost) = boosted_action(category, signals) {
            actions.push(boost);
        }

        let (default_action, reason) = match self.config(category) {
            Some(cfg) => (cfg.default_action, cfg.reason.clone()),
            None => (ActionType::Review, "No configuration for category".to_string()),
        };
        if actions.iter().all(|a| a.action_type != default_action) {
            actions.push(SuggestedAction {
                action_type: default_action,
                reason,
                priority: DEFAULT_ACTION_PRIORITY,
            });
        }

        actions.sort_by_key(|a| a.priority);
        actions
    }
}

fn boosted_action(category: Category, signals: &HeaderSignals) -> Option<SuggestedAction> {
    let bulk_category = matches!(
        category,
        Category::Marketing | Category::Newsletter | Category::Social
    );
    if bulk_category && signals.has_list_unsubscribe {
        return Some(SuggestedAction {
            action_type: ActionType::Unsubscribe,
            reason: "One-click unsubscribe available".to_string(),
            priority: BOOSTED_ACTION_PRIORITY,
        });
    }
    None
}

fn keep_action() -> SuggestedAction {
    SuggestedAction {
        action_type: ActionType::Keep,
        reason: "Protected category".to_string(),
        priority: BOOSTED_ACTION_PRIORITY,
    }
}

/// Force a protected result down to a single `keep` action.
///
/// Returns `true` if the actions had to be replaced.
pub fn enforce_protection(result: &mut CategorizationResult) -> bool {
    if !result.category.is_protected() {
        return false;
    }
    let already_keep = result.suggested_actions.len() == 1
        && result.suggested_actions[0].action_type == ActionType::Keep;
    if already_keep {
        return false;
    }
    result.suggested_actions = vec![keep_action()];
    true
}
