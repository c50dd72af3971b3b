use std::collections::HashMap;

/// Session variables to replay onto backend connections. Values are stored
/// as ready-to-send SQL literals, so strings carry their quotes.
#[derive(Debug, Clone, Default)]
pub struct SessionVariables {
    vars: HashMap<String, String>,
}

impl SessionVariables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_int(&mut self, name: &str, value: i64) {
        self.vars.insert(name.to_lowercase(), value.to_string());
    }

    pub fn set_string(&mut self, name: &str, value: &str) {
        self.vars
            .insert(name.to_lowercase(), format!("'{}'", value.replace('\'', "\\'")));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(&name.to_lowercase()).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Snapshot as `(name, literal)` pairs for connection sync
    pub fn entries(&self) -> Vec<(String, String)> {
        self.vars
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_and_string_literals() {
        let mut vars = SessionVariables::new();
        vars.set_int("sql_select_limit", 100);
        vars.set_string("time_zone", "+08:00");

        assert_eq!(vars.get("sql_select_limit"), Some("100"));
        assert_eq!(vars.get("TIME_ZONE"), Some("'+08:00'"));
    }

    #[test]
    fn string_values_escape_quotes() {
        let mut vars = SessionVariables::new();
        vars.set_string("sql_mode", "NO_AUTO_VALUE_ON_ZERO");
        assert_eq!(vars.get("sql_mode"), Some("'NO_AUTO_VALUE_ON_ZERO'"));
    }
}
