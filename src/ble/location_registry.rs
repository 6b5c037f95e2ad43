//! Named locations for proximity buckets.
//!
//! Location ids are what the tracker assigns; this registry attaches
//! human-readable names and descriptions to them and persists the set as a
//! JSON file next to the service. When no file exists the three proximity
//! buckets are seeded so assignments always resolve to something nameable.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocationInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug)]
pub struct LocationRegistry {
    locations: HashMap<String, LocationInfo>,
    path: PathBuf,
}

fn seeded() -> HashMap<String, LocationInfo> {
    let mut locations = HashMap::new();
    locations.insert(
        "near".to_string(),
        LocationInfo {
            name: "Near".to_string(),
            description: "Within a few meters of the gateway".to_string(),
        },
    );
    locations.insert(
        "mid".to_string(),
        LocationInfo {
            name: "Mid range".to_string(),
            description: "Same room, away from the gateway".to_string(),
        },
    );
    locations.insert(
        "far".to_string(),
        LocationInfo {
            name: "Far".to_string(),
            description: "Edge of reception".to_string(),
        },
    );
    locations
}

impl LocationRegistry {
    /// Loads the registry from `path`, seeding the default buckets when the
    /// file is missing or unreadable.
    pub async fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let locations = match tokio::fs::read_to_string(&path).await {
            Ok(text) => match serde_json::from_str::<HashMap<String, LocationInfo>>(&text) {
                Ok(locations) if !locations.is_empty() => {
                    info!("Loaded {} locations from {}", locations.len(), path.display());
                    locations
                }
                Ok(_) => seeded(),
                Err(e) => {
                    warn!("Malformed location file {}: {}", path.display(), e);
                    seeded()
                }
            },
            Err(_) => seeded(),
        };
        Self { locations, path }
    }

    /// Writes the registry back to its file. Failures are logged, not raised.
    pub async fn save(&self) -> bool {
        let text = match serde_json::to_string_pretty(&self.locations) {
            Ok(text) => text,
            Err(e) => {
                warn!("Could not serialize locations: {}", e);
                return false;
            }
        };
        match tokio::fs::write(&self.path, text).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Could not write {}: {}", self.path.display(), e);
                false
            }
        }
    }

    /// Adds a location; `false` if the id is already taken.
    pub fn add(&mut self, id: &str, name: &str, description: &str) -> bool {
        if self.locations.contains_key(id) {
            return false;
        }
        self.locations.insert(
            id.to_string(),
            LocationInfo {
                name: name.to_string(),
                description: description.to_string(),
            },
        );
        true
    }

    /// Updates name and/or description of an existing location.
    pub fn update(&mut self, id: &str, name: Option<&str>, description: Option<&str>) -> bool {
        let Some(entry) = self.locations.get_mut(id) else {
            return false;
        };
        if let Some(name) = name {
            entry.name = name.to_string();
        }
        if let Some(description) = description {
            entry.description = description.to_string();
        }
        true
    }

    pub fn remove(&mut self, id: &str) -> bool {
        self.locations.remove(id).is_some()
    }

    pub fn get(&self, id: &str) -> Option<&LocationInfo> {
        self.locations.get(id)
    }

    /// Display name for a location id, falling back to the id itself.
    pub fn display_name(&self, id: &str) -> String {
        self.locations
            .get(id)
            .map_or_else(|| id.to_string(), |info| info.name.clone())
    }

    pub fn all(&self) -> &HashMap<String, LocationInfo> {
        &self.locations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_seeds_the_buckets() {
        let dir = tempfile::tempdir().unwrap();
        let registry = LocationRegistry::load(dir.path().join("locations.json")).await;
        assert!(registry.get("near").is_some());
        assert!(registry.get("mid").is_some());
        assert!(registry.get("far").is_some());
        assert_eq!(registry.display_name("attic"), "attic");
    }

    #[tokio::test]
    async fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locations.json");

        let mut registry = LocationRegistry::load(&path).await;
        assert!(registry.add("attic", "Attic", "Top floor storage"));
        assert!(!registry.add("attic", "Attic again", ""));
        assert!(registry.save().await);

        let reloaded = LocationRegistry::load(&path).await;
        assert_eq!(
            reloaded.get("attic").map(|l| l.name.as_str()),
            Some("Attic")
        );
    }

    #[tokio::test]
    async fn update_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = LocationRegistry::load(dir.path().join("l.json")).await;

        assert!(registry.update("near", Some("Very close"), None));
        assert_eq!(registry.display_name("near"), "Very close");
        assert!(!registry.update("nowhere", Some("x"), None));

        assert!(registry.remove("far"));
        assert!(!registry.remove("far"));
    }
}
