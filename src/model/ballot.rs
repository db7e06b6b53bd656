use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{Code, Error, Result};

/// Plaintext used to fill the preferences a voter left unexpressed.
pub const BLANK_PREFERENCE: &str = "blank";

/// A single candidate standing on an electoral list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    /// Unique within the ballot.
    pub id: String,
    pub first_name: String,
    pub last_name: String,
}

/// An electoral list and the candidates it owns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElectoralList {
    pub name: String,
    pub candidates: Vec<Candidate>,
}

/// An immutable ballot template.
///
/// Exactly one of `lists` (an election) or `options` (a referendum) is populated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmptyBallot {
    pub code: u32,
    pub title: String,
    pub description: String,
    pub max_preferences: usize,
    #[serde(default)]
    pub lists: Vec<ElectoralList>,
    #[serde(default)]
    pub options: Vec<String>,
}

impl EmptyBallot {
    pub fn is_referendum(&self) -> bool {
        !self.options.is_empty()
    }

    pub fn candidates(&self) -> impl Iterator<Item = &Candidate> {
        self.lists.iter().flat_map(|list| list.candidates.iter())
    }

    /// Is `choice` a candidate ID (election) or an option (referendum) of this ballot?
    pub fn is_valid_choice(&self, choice: &str) -> bool {
        if self.is_referendum() {
            self.options.iter().any(|option| option == choice)
        } else {
            self.candidates().any(|candidate| candidate.id == choice)
        }
    }

    /// Check the template is well-formed.
    pub fn validate(&self) -> Result<()> {
        let invalid = |detail: String| Err(Error::new(Code::UnexpectedValue, detail));

        if self.max_preferences == 0 {
            return invalid(format!("ballot {} allows no preferences", self.code));
        }
        let has_candidates = self.candidates().next().is_some();
        if has_candidates == self.is_referendum() {
            return invalid(format!(
                "ballot {} must have either candidates or options, not both or neither",
                self.code
            ));
        }

        let mut seen = HashSet::new();
        let choices: Vec<&str> = if self.is_referendum() {
            self.options.iter().map(String::as_str).collect()
        } else {
            self.candidates().map(|c| c.id.as_str()).collect()
        };
        for choice in choices {
            if choice == BLANK_PREFERENCE {
                return invalid(format!("ballot {} uses the reserved choice `{choice}`", self.code));
            }
            if !seen.insert(choice) {
                return invalid(format!("ballot {} repeats the choice `{choice}`", self.code));
            }
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn examples_are_valid() {
        for ballot in EmptyBallot::all_examples() {
            ballot.validate().unwrap();
        }
    }

    #[test]
    fn choices() {
        let council = EmptyBallot::example();
        assert!(council.is_valid_choice("c3"));
        assert!(!council.is_valid_choice("m1"));
        assert!(!council.is_valid_choice("Harbour Party"));

        let referendum = EmptyBallot::example_referendum();
        assert!(referendum.is_valid_choice("no"));
        assert!(!referendum.is_valid_choice("c1"));
    }

    #[test]
    fn invalid_templates() {
        let mut both = EmptyBallot::example();
        both.options.push("yes".to_string());
        assert!(both.validate().is_err());

        let mut neither = EmptyBallot::example_referendum();
        neither.options.clear();
        assert!(neither.validate().is_err());

        let mut no_preferences = EmptyBallot::example_mayor();
        no_preferences.max_preferences = 0;
        assert!(no_preferences.validate().is_err());

        let mut duplicate = EmptyBallot::example_referendum();
        duplicate.options.push("yes".to_string());
        assert!(duplicate.validate().is_err());

        let mut reserved = EmptyBallot::example_referendum();
        reserved.options.push(BLANK_PREFERENCE.to_string());
        assert!(reserved.validate().is_err());
    }

    #[test]
    fn camel_case_json() {
        let json = serde_json::to_value(EmptyBallot::example_mayor()).unwrap();
        assert_eq!(json["maxPreferences"], 1);
        assert_eq!(json["lists"][0]["candidates"][1]["lastName"], "Liskov");
    }
}
