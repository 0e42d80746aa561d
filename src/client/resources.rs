//! Comic Vine resource registry.
//!
//! Every resource has a detail endpoint addressed by `<type id>-<id>` and a list
//! endpoint. The list name doubles as the rate-limit key, matching how the API
//! throttles per resource.

use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Character,
    Concept,
    Episode,
    Issue,
    Location,
    Movie,
    Object,
    Origin,
    Person,
    Power,
    Publisher,
    Series,
    StoryArc,
    Team,
    Video,
    Volume,
}

impl ResourceType {
    pub const ALL: [ResourceType; 16] = [
        ResourceType::Character,
        ResourceType::Concept,
        ResourceType::Episode,
        ResourceType::Issue,
        ResourceType::Location,
        ResourceType::Movie,
        ResourceType::Object,
        ResourceType::Origin,
        ResourceType::Person,
        ResourceType::Power,
        ResourceType::Publisher,
        ResourceType::Series,
        ResourceType::StoryArc,
        ResourceType::Team,
        ResourceType::Video,
        ResourceType::Volume,
    ];

    /// Numeric prefix of detail ids, e.g. `4000` in `issue/4000-6/`.
    pub fn type_id(&self) -> u32 {
        match self {
            ResourceType::Character => 4005,
            ResourceType::Concept => 4015,
            ResourceType::Episode => 4070,
            ResourceType::Issue => 4000,
            ResourceType::Location => 4020,
            ResourceType::Movie => 4025,
            ResourceType::Object => 4055,
            ResourceType::Origin => 4030,
            ResourceType::Person => 4040,
            ResourceType::Power => 4035,
            ResourceType::Publisher => 4010,
            ResourceType::Series => 4075,
            ResourceType::StoryArc => 4045,
            ResourceType::Team => 4060,
            ResourceType::Video => 2300,
            ResourceType::Volume => 4050,
        }
    }

    /// Singular name used by detail endpoints.
    pub fn name(&self) -> &'static str {
        match self {
            ResourceType::Character => "character",
            ResourceType::Concept => "concept",
            ResourceType::Episode => "episode",
            ResourceType::Issue => "issue",
            ResourceType::Location => "location",
            ResourceType::Movie => "movie",
            ResourceType::Object => "object",
            ResourceType::Origin => "origin",
            ResourceType::Person => "person",
            ResourceType::Power => "power",
            ResourceType::Publisher => "publisher",
            ResourceType::Series => "series",
            ResourceType::StoryArc => "story_arc",
            ResourceType::Team => "team",
            ResourceType::Video => "video",
            ResourceType::Volume => "volume",
        }
    }

    /// Plural name used by list endpoints.
    pub fn list_name(&self) -> &'static str {
        match self {
            ResourceType::Character => "characters",
            ResourceType::Concept => "concepts",
            ResourceType::Episode => "episodes",
            ResourceType::Issue => "issues",
            ResourceType::Location => "locations",
            ResourceType::Movie => "movies",
            ResourceType::Object => "objects",
            ResourceType::Origin => "origins",
            ResourceType::Person => "people",
            ResourceType::Power => "powers",
            ResourceType::Publisher => "publishers",
            ResourceType::Series => "series_list",
            ResourceType::StoryArc => "story_arcs",
            ResourceType::Team => "teams",
            ResourceType::Video => "videos",
            ResourceType::Volume => "volumes",
        }
    }

    pub fn detail_path(&self, id: u64) -> String {
        format!("{}/{}-{}/", self.name(), self.type_id(), id)
    }

    pub fn list_path(&self) -> String {
        format!("{}/", self.list_name())
    }

    /// Accepts singular, plural and kebab-case spellings (`story-arc`, `story_arcs`).
    pub fn from_name(name: &str) -> Option<Self> {
        let normalized = name.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|r| r.name() == normalized || r.list_name() == normalized)
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ResourceType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_name(s).ok_or_else(|| {
            Error::validation_with_context(
                format!("unknown resource '{s}'"),
                ErrorContext::new()
                    .with_field_path("resource")
                    .with_details(format!("expected one of: {}", names())),
            )
        })
    }
}

fn names() -> String {
    ResourceType::ALL
        .iter()
        .map(ResourceType::name)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths() {
        assert_eq!(ResourceType::Issue.detail_path(6), "issue/4000-6/");
        assert_eq!(ResourceType::Issue.list_path(), "issues/");
        assert_eq!(ResourceType::Series.list_path(), "series_list/");
        assert_eq!(ResourceType::Video.detail_path(1), "video/2300-1/");
    }

    #[test]
    fn test_lookup() {
        assert_eq!(ResourceType::from_name("people"), Some(ResourceType::Person));
        assert_eq!(ResourceType::from_name("Story-Arc"), Some(ResourceType::StoryArc));
        assert_eq!(ResourceType::from_name("story_arcs"), Some(ResourceType::StoryArc));
        assert_eq!(ResourceType::from_name("comics"), None);
        let err = "comics".parse::<ResourceType>().unwrap_err();
        assert!(err.to_string().contains("unknown resource"));
    }

    #[test]
    fn test_names_are_unique() {
        let mut all: Vec<&str> = ResourceType::ALL
            .iter()
            .flat_map(|r| [r.name(), r.list_name()])
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 32);
    }
}
