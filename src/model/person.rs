use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// A registered voter, as returned by a voter search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Person {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub birth_date: Option<NaiveDate>,
    /// Codes of the ballot templates this voter is entitled to.
    pub ballot_codes: Vec<u32>,
}

impl Person {
    /// Case-insensitive "contains" match used by voter search.
    pub fn matches(&self, first_name_like: &str, last_name_like: &str) -> bool {
        contains_ignore_case(&self.first_name, first_name_like)
            && contains_ignore_case(&self.last_name, last_name_like)
    }
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_matching() {
        let maria = Person::example();
        assert!(maria.matches("mar", "ROSS"));
        assert!(maria.matches("", ""));
        assert!(!maria.matches("marco", ""));
        assert!(Person::example2().matches("mar", "ross"));
    }
}
