use serde::{Deserialize, Serialize};

/// World metadata shipped as `world.json` inside every world archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorldInfo {
    pub name: String,
    pub max_players: u32,
    #[serde(default)]
    pub plugins: Vec<String>,
}

impl WorldInfo {
    /// Plugin list with `required` placed first if the world does not list it.
    pub fn plugins_with(&self, required: &str) -> Vec<String> {
        let mut plugins = self.plugins.clone();
        if !plugins.iter().any(|p| p == required) {
            plugins.insert(0, required.to_string());
        }
        plugins
    }

    /// Name advertised to players, with the optional operator suffix.
    pub fn server_name(&self, suffix: &str) -> String {
        format!("{} {}", self.name, suffix).trim_end().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const WORLD_JSON: &str = r#"{
        "name": "Frontier",
        "maxPlayers": 16,
        "plugins": ["Concealment", "Essentials"]
    }"#;

    #[test]
    fn world_deserialize_test() {
        let world: WorldInfo = serde_json::from_str(WORLD_JSON).unwrap();
        assert_eq!(
            world,
            WorldInfo {
                name: "Frontier".into(),
                max_players: 16,
                plugins: vec!["Concealment".into(), "Essentials".into()],
            }
        );
    }

    #[test]
    fn plugins_default_to_empty() {
        let world: WorldInfo =
            serde_json::from_str(r#"{"name": "Bare", "maxPlayers": 4}"#).unwrap();
        assert!(world.plugins.is_empty());
        assert_eq!(world.plugins_with("Hosting"), vec!["Hosting".to_string()]);
    }

    #[test]
    fn required_plugin_goes_first_once() {
        let mut world: WorldInfo = serde_json::from_str(WORLD_JSON).unwrap();
        assert_eq!(
            world.plugins_with("Hosting"),
            vec!["Hosting", "Concealment", "Essentials"]
        );
        world.plugins.push("Hosting".into());
        assert_eq!(world.plugins_with("Hosting").len(), 3);
    }

    #[test]
    fn server_name_suffix() {
        let world: WorldInfo = serde_json::from_str(WORLD_JSON).unwrap();
        assert_eq!(world.server_name(""), "Frontier");
        assert_eq!(world.server_name("[EU]"), "Frontier [EU]");
    }
}
