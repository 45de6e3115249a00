use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// Program models
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Program {
    pub id: String,
    pub name: String,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub zones: Vec<Zone>,
    /// Denormalized number of content items across all zones.
    #[serde(default)]
    pub content: usize,
    pub last_modified: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Program {
    pub fn content_count(&self) -> usize {
        self.zones.iter().map(|z| z.content.len()).sum()
    }

    pub fn zone(&self, zone_id: &str) -> Option<&Zone> {
        self.zones.iter().find(|z| z.id == zone_id)
    }

    pub fn has_playable_zones(&self) -> bool {
        self.zones.iter().any(|z| !z.content.is_empty())
    }
}

// Zone models
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Zone {
    pub id: String,
    pub name: String,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    #[serde(default)]
    pub background_color: String,
    #[serde(default)]
    pub border_color: String,
    #[serde(default)]
    pub border_width: u32,
    /// Playlist in round-robin order.
    #[serde(default)]
    pub content: Vec<Content>,
    #[serde(default)]
    pub z_index: i32,
}

// Content models
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Image,
    Video,
    Text,
    Web,
}

impl ContentType {
    /// Only media items count against daily limits and telemetry.
    pub fn is_playable_media(self) -> bool {
        matches!(self, ContentType::Image | ContentType::Video)
    }

    /// Nominal seconds credited to telemetry for one scheduler-driven play.
    pub fn nominal_play_secs(self) -> f64 {
        match self {
            ContentType::Video => 15.0,
            _ => 8.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ContentType::Image => "image",
            ContentType::Video => "video",
            ContentType::Text => "text",
            ContentType::Web => "web",
        }
    }
}

impl std::fmt::Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    /// Unique across the whole system; ledger and telemetry key on it.
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub content_type: ContentType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Nominal display duration in seconds.
    #[serde(default)]
    pub duration: u32,
    #[serde(default = "default_true")]
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub total_plays: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn content(id: &str, content_type: ContentType) -> Content {
        Content {
            id: id.to_string(),
            name: format!("{} name", id),
            content_type,
            url: Some(format!("https://media.local/{}", id)),
            text: None,
            duration: 8,
            is_active: true,
            created_at: Utc::now(),
            total_plays: 0,
            file_path: None,
        }
    }

    pub fn zone(id: &str, content: Vec<Content>) -> Zone {
        Zone {
            id: id.to_string(),
            name: format!("Zone {}", id),
            x: 0.0,
            y: 0.0,
            width: 640.0,
            height: 360.0,
            background_color: "#000000".to_string(),
            border_color: "#ffffff".to_string(),
            border_width: 0,
            content,
            z_index: 0,
        }
    }

    pub fn program(id: &str, zones: Vec<Zone>) -> Program {
        let now = Utc::now();
        let mut program = Program {
            id: id.to_string(),
            name: format!("Program {}", id),
            width: 1920,
            height: 1080,
            zones,
            content: 0,
            last_modified: now,
            created_at: now,
            description: None,
        };
        program.content = program.content_count();
        program
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_content_type_wire_format() {
        let item = content("a", ContentType::Video);
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["type"], "video");
        assert_eq!(json["isActive"], true);

        let back: Content = serde_json::from_value(json).unwrap();
        assert_eq!(back.content_type, ContentType::Video);
    }

    #[test]
    fn test_program_content_count() {
        let program = program(
            "p1",
            vec![
                zone("z1", vec![content("a", ContentType::Image)]),
                zone("z2", vec![]),
                zone(
                    "z3",
                    vec![content("b", ContentType::Video), content("c", ContentType::Text)],
                ),
            ],
        );
        assert_eq!(program.content_count(), 3);
        assert!(program.has_playable_zones());
        assert!(program.zone("z2").is_some());
        assert!(program.zone("nope").is_none());
    }

    #[test]
    fn test_only_media_is_playable() {
        assert!(ContentType::Image.is_playable_media());
        assert!(ContentType::Video.is_playable_media());
        assert!(!ContentType::Text.is_playable_media());
        assert!(!ContentType::Web.is_playable_media());
        assert_eq!(ContentType::Video.nominal_play_secs(), 15.0);
        assert_eq!(ContentType::Image.nominal_play_secs(), 8.0);
    }
}
