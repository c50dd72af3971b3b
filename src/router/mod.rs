//! Table-to-slice routing. The session engine only asks which slice a
//! statement belongs to; shard-key evaluation and fragment fan-out live in
//! the plan layer above this.

use std::collections::HashMap;

use crate::config::{NamespaceConfig, ShardRuleConfig};

/// Routing rule for one `(db, table)` pair
#[derive(Debug, Clone)]
pub struct Rule {
    pub db: String,
    pub table: String,
    pub shard_column: String,
    pub shard_type: String,
    pub slices: Vec<String>,
    pub locations: Vec<usize>,
}

impl Rule {
    fn default_rule(default_slice: &str) -> Self {
        Self {
            db: String::new(),
            table: String::new(),
            shard_column: String::new(),
            shard_type: "default".to_string(),
            slices: vec![default_slice.to_string()],
            locations: Vec::new(),
        }
    }

    fn from_config(config: &ShardRuleConfig) -> Self {
        Self {
            db: config.db.to_lowercase(),
            table: config.table.to_lowercase(),
            shard_column: config.shard_column.to_lowercase(),
            shard_type: config.shard_type.clone(),
            slices: config.slices.clone(),
            locations: config.locations.clone(),
        }
    }

    /// Slice that backs shard `index`; unsharded rules have one slice
    pub fn slice(&self, index: usize) -> &str {
        self.slices
            .get(index.min(self.slices.len().saturating_sub(1)))
            .map(String::as_str)
            .unwrap_or_default()
    }

    pub fn is_default(&self) -> bool {
        self.shard_type == "default"
    }
}

/// Routing table built from a namespace's shard rules
#[derive(Debug, Clone)]
pub struct Router {
    rules: HashMap<(String, String), Rule>,
    default_rule: Rule,
}

impl Router {
    pub fn from_config(config: &NamespaceConfig) -> Self {
        let mut rules = HashMap::new();
        for rule_config in &config.shard_rules {
            let rule = Rule::from_config(rule_config);
            rules.insert((rule.db.clone(), rule.table.clone()), rule);
        }
        Self {
            rules,
            default_rule: Rule::default_rule(&config.default_slice),
        }
    }

    /// Empty router with only a default rule (gray router without overrides)
    pub fn empty(default_slice: &str) -> Self {
        Self {
            rules: HashMap::new(),
            default_rule: Rule::default_rule(default_slice),
        }
    }

    /// Rule for a table; tables without a shard rule route to the default
    /// slice through the default rule.
    pub fn get_rule(&self, db: &str, table: &str) -> &Rule {
        self.rules
            .get(&(db.to_lowercase(), table.to_lowercase()))
            .unwrap_or(&self.default_rule)
    }

    pub fn get_all_rules(&self) -> &HashMap<(String, String), Rule> {
        &self.rules
    }

    pub fn is_sharded(&self, db: &str, table: &str) -> bool {
        self.rules
            .contains_key(&(db.to_lowercase(), table.to_lowercase()))
    }

    pub fn has_rules(&self) -> bool {
        !self.rules.is_empty()
    }

    pub fn default_slice(&self) -> &str {
        self.default_rule.slice(0)
    }
}
