use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// A desired wall treatment: what the swatch UI shows (`name`, `hex`) and
/// what the image model is told (`description`).
///
/// Equality is by `id` only; two choices with the same id highlight the same
/// swatch even if their descriptions drifted apart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColorChoice {
    pub id: String,
    pub name: String,
    pub hex: String,
    pub description: String,
}

impl PartialEq for ColorChoice {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ColorChoice {}

impl ColorChoice {
    /// A custom swatch picked from a hex color input.
    pub fn custom(hex: &str) -> Self {
        let hex = hex.trim().to_string();
        Self {
            id: "custom".to_string(),
            name: "Custom".to_string(),
            description: format!("color with hex code {hex}"),
            hex,
        }
    }

    /// A free-text wall description typed by the user. Carries no swatch hex.
    pub fn freeform(text: &str) -> Self {
        Self {
            id: "prompt".to_string(),
            name: "Custom description".to_string(),
            hex: String::new(),
            description: text.trim().to_string(),
        }
    }

    /// Filename offered when saving the repainted image: the display name
    /// lowercased with whitespace collapsed to dashes.
    pub fn download_file_name(&self, extension: &str) -> String {
        let slug = self
            .name
            .to_lowercase()
            .split_whitespace()
            .collect::<Vec<&str>>()
            .join("-");
        let slug = if slug.is_empty() {
            "walls".to_string()
        } else {
            slug
        };
        format!("recoat-{slug}.{extension}")
    }
}

#[derive(Debug, Clone)]
pub struct PresetPalette {
    colors: IndexMap<String, ColorChoice>,
}

impl PresetPalette {
    pub fn new(colors: Option<IndexMap<String, ColorChoice>>) -> Self {
        Self {
            colors: colors.unwrap_or_else(default_presets),
        }
    }

    pub fn get(&self, id: &str) -> Option<&ColorChoice> {
        self.colors.get(id)
    }

    pub fn list(&self) -> impl Iterator<Item = &ColorChoice> {
        self.colors.values()
    }

    /// The choice a fresh or reset session starts with.
    pub fn default_choice(&self) -> ColorChoice {
        self.colors
            .get(DEFAULT_PRESET_ID)
            .or_else(|| self.colors.values().next())
            .cloned()
            .unwrap_or_else(|| ColorChoice::freeform("warm beige"))
    }
}

impl Default for PresetPalette {
    fn default() -> Self {
        Self::new(None)
    }
}

pub const DEFAULT_PRESET_ID: &str = "beige";

fn default_presets() -> IndexMap<String, ColorChoice> {
    let mut map = IndexMap::new();

    let mut insert = |id: &str, name: &str, hex: &str, description: &str| {
        map.insert(
            id.to_string(),
            ColorChoice {
                id: id.to_string(),
                name: name.to_string(),
                hex: hex.to_string(),
                description: description.to_string(),
            },
        );
    };

    insert("white", "Crisp White", "#FFFFFF", "crisp bright white");
    insert("beige", "Warm Beige", "#F5F5DC", "warm beige or cream");
    insert("gray", "Modern Gray", "#A9A9A9", "neutral modern gray");
    insert("navy", "Navy Blue", "#000080", "deep navy blue");
    insert("sage", "Sage Green", "#8A9A5B", "soft sage green");
    insert(
        "terracotta",
        "Terracotta",
        "#E2725B",
        "earthy terracotta orange",
    );
    insert("black", "Matte Black", "#000000", "matte black");
    insert("teal", "Deep Teal", "#008080", "rich deep teal");

    map
}
