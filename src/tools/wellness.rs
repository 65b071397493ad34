//! The wellness tool set: mood history, song and doctor recommendations,
//! breathing exercises.
//!
//! Each tool resolves its data through a source trait so tests (and future
//! real backends) can swap the provider. The default providers serve a
//! static catalog.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{Tool, ToolContext, ToolOutput, ToolRegistry};

pub const MOOD_HISTORY_TOOL: &str = "get_mood_history";
pub const SONGS_TOOL: &str = "get_recommended_songs";
pub const DOCTORS_TOOL: &str = "get_recommended_doctors";
pub const BREATHING_TOOL: &str = "get_breathing_exercise_data";

/// Tools the crisis strategy is allowed to use.
pub const CRISIS_TOOL_NAMES: &[&str] = &[DOCTORS_TOOL, SONGS_TOOL];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoodRecord {
    pub mood: String,
    pub date: String, // YYYY-MM-DD
    pub reason: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SongRecommendation {
    pub title: String,
    pub artist: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoctorRecommendation {
    pub name: String,
    pub specialty: String,
    pub rating: f64,
    pub accepts_insurance: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreathingExercise {
    pub name: String,
    pub pattern: String,
    pub duration_minutes: u32,
    pub reason: String,
}

pub trait MoodSource: Send + Sync {
    fn mood_history(&self, user_id: &str, days: u32) -> Vec<MoodRecord>;
}

pub trait SongSource: Send + Sync {
    fn songs_for(&self, mood_category: &str, count: usize) -> Vec<SongRecommendation>;
}

pub trait DoctorSource: Send + Sync {
    fn doctors_for(&self, specialty: &str) -> Vec<DoctorRecommendation>;
}

pub trait BreathingSource: Send + Sync {
    fn exercises_for(&self, user_id: &str) -> Vec<BreathingExercise>;
}

/// Static in-crate catalog backing all four sources.
pub struct StaticWellnessCatalog;

impl MoodSource for StaticWellnessCatalog {
    fn mood_history(&self, _user_id: &str, days: u32) -> Vec<MoodRecord> {
        let moods = [
            ("calm", "quiet evening", "Spent the evening reading and felt settled."),
            ("anxious", "work deadline", "Kept worrying about an upcoming deadline."),
            ("sad", "argument with a friend", "A disagreement that lingered all day."),
            ("happy", "walk outside", "A long walk in the sun lifted the whole day."),
            ("tired", "poor sleep", "Slept badly and dragged through the afternoon."),
            ("neutral", "routine day", "Nothing notable, just a regular day."),
            ("stressed", "too many errands", "Everything felt like it piled up at once."),
        ];
        let today = Utc::now().date_naive();
        (0..days.min(moods.len() as u32))
            .map(|i| {
                let (mood, reason, description) = moods[i as usize];
                MoodRecord {
                    mood: mood.to_string(),
                    date: (today - Duration::days(i as i64)).format("%Y-%m-%d").to_string(),
                    reason: reason.to_string(),
                    description: description.to_string(),
                }
            })
            .collect()
    }
}

impl SongSource for StaticWellnessCatalog {
    fn songs_for(&self, mood_category: &str, count: usize) -> Vec<SongRecommendation> {
        let catalog: &[(&str, &str, &str)] = match mood_category {
            "calming" => &[
                ("Weightless", "Marconi Union", "Composed with a slowing tempo that eases a racing mind."),
                ("Clair de Lune", "Claude Debussy", "Gentle piano that gives anxious thoughts somewhere soft to land."),
                ("Holocene", "Bon Iver", "Spacious and quiet, good for winding down."),
                ("River Flows in You", "Yiruma", "A calm, repeating melody that steadies breathing."),
                ("Saturn", "Sleeping at Last", "Slow strings that invite stillness."),
            ],
            "motivational" => &[
                ("Eye of the Tiger", "Survivor", "A classic push when energy is low."),
                ("Stronger", "Kelly Clarkson", "A reminder that hard stretches build resilience."),
                ("Lose Yourself", "Eminem", "Focus and drive for taking the first step."),
                ("Don't Stop Me Now", "Queen", "Pure momentum for getting moving."),
                ("Rise Up", "Andra Day", "Steady encouragement for heavy days."),
            ],
            // "uplifting" and anything unrecognized
            _ => &[
                ("Here Comes the Sun", "The Beatles", "A warm reminder that difficult stretches pass."),
                ("Three Little Birds", "Bob Marley", "An easy, reassuring refrain."),
                ("Walking on Sunshine", "Katrina and the Waves", "Bright energy for a gray day."),
                ("Lovely Day", "Bill Withers", "Grounded optimism without forcing it."),
                ("Good as Hell", "Lizzo", "A confidence boost with a smile."),
            ],
        };
        catalog
            .iter()
            .take(count.max(1))
            .map(|(title, artist, reason)| SongRecommendation {
                title: title.to_string(),
                artist: artist.to_string(),
                reason: reason.to_string(),
            })
            .collect()
    }
}

impl DoctorSource for StaticWellnessCatalog {
    fn doctors_for(&self, _specialty: &str) -> Vec<DoctorRecommendation> {
        vec![
            DoctorRecommendation {
                name: "Dr. Sarah Johnson".to_string(),
                specialty: "Clinical Psychology".to_string(),
                rating: 4.9,
                accepts_insurance: true,
            },
            DoctorRecommendation {
                name: "Dr. Miguel Alvarez".to_string(),
                specialty: "Psychiatry".to_string(),
                rating: 4.7,
                accepts_insurance: true,
            },
            DoctorRecommendation {
                name: "Dr. Priya Nair".to_string(),
                specialty: "Counseling and Therapy".to_string(),
                rating: 4.8,
                accepts_insurance: false,
            },
        ]
    }
}

impl BreathingSource for StaticWellnessCatalog {
    fn exercises_for(&self, _user_id: &str) -> Vec<BreathingExercise> {
        vec![
            BreathingExercise {
                name: "Box Breathing (4-4-4-4)".to_string(),
                pattern: "Inhale 4s, hold 4s, exhale 4s, hold 4s".to_string(),
                duration_minutes: 5,
                reason: "Evens out a racing heart rate during acute stress.".to_string(),
            },
            BreathingExercise {
                name: "4-7-8 Breathing".to_string(),
                pattern: "Inhale 4s, hold 7s, exhale 8s".to_string(),
                duration_minutes: 4,
                reason: "The long exhale activates the body's rest response.".to_string(),
            },
            BreathingExercise {
                name: "Diaphragmatic Breathing".to_string(),
                pattern: "Slow belly breaths, hand on stomach, 6 breaths per minute".to_string(),
                duration_minutes: 10,
                reason: "Good baseline practice for ongoing anxiety.".to_string(),
            },
        ]
    }
}

pub struct MoodHistoryTool {
    source: Arc<dyn MoodSource>,
}

impl MoodHistoryTool {
    pub fn new(source: Arc<dyn MoodSource>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl Tool for MoodHistoryTool {
    fn name(&self) -> &str {
        MOOD_HISTORY_TOOL
    }

    fn description(&self) -> &str {
        "Retrieve the user's recorded emotional states over recent days. Use when the user asks about mood patterns, mood tracking, how they have been feeling, or emotional trends."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "days": {
                    "type": "integer",
                    "description": "Number of past days to retrieve",
                    "default": 7
                }
            }
        })
    }

    async fn execute(&self, params: serde_json::Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let days = params["days"].as_u64().unwrap_or(7) as u32;
        tracing::debug!("Fetching mood history for user {} over {} days", ctx.user_id, days);
        let records = self.source.mood_history(&ctx.user_id, days);
        Ok(ToolOutput::Json(serde_json::to_value(records)?))
    }
}

pub struct SongRecommendationTool {
    source: Arc<dyn SongSource>,
}

impl SongRecommendationTool {
    pub fn new(source: Arc<dyn SongSource>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl Tool for SongRecommendationTool {
    fn name(&self) -> &str {
        SONGS_TOOL
    }

    fn description(&self) -> &str {
        "Suggest songs tailored to the user's emotional state. Categories: uplifting, calming, motivational. Use when music could genuinely help the user's mood."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "mood_category": {
                    "type": "string",
                    "enum": ["uplifting", "calming", "motivational"],
                    "description": "Emotional theme of the songs"
                },
                "count": {
                    "type": "integer",
                    "description": "Number of songs to fetch",
                    "default": 5
                }
            },
            "required": ["mood_category"]
        })
    }

    async fn execute(&self, params: serde_json::Value, _ctx: &ToolContext) -> Result<ToolOutput> {
        let category = params["mood_category"].as_str().unwrap_or("uplifting");
        let count = params["count"].as_u64().unwrap_or(5) as usize;
        tracing::debug!("Fetching {} '{}' songs", count, category);
        let songs = self.source.songs_for(category, count);
        Ok(ToolOutput::Json(serde_json::to_value(songs)?))
    }
}

pub struct DoctorRecommendationTool {
    source: Arc<dyn DoctorSource>,
}

impl DoctorRecommendationTool {
    pub fn new(source: Arc<dyn DoctorSource>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl Tool for DoctorRecommendationTool {
    fn name(&self) -> &str {
        DOCTORS_TOOL
    }

    fn description(&self) -> &str {
        "List qualified mental health professionals. Use when the user needs professional help or the conversation suggests escalation."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "specialty": {
                    "type": "string",
                    "description": "Type of specialist",
                    "default": "mental_health"
                }
            }
        })
    }

    async fn execute(&self, params: serde_json::Value, _ctx: &ToolContext) -> Result<ToolOutput> {
        let specialty = params["specialty"].as_str().unwrap_or("mental_health");
        tracing::debug!("Fetching recommended doctors for specialty: {}", specialty);
        let doctors = self.source.doctors_for(specialty);
        Ok(ToolOutput::Json(serde_json::to_value(doctors)?))
    }
}

pub struct BreathingExerciseTool {
    source: Arc<dyn BreathingSource>,
}

impl BreathingExerciseTool {
    pub fn new(source: Arc<dyn BreathingSource>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl Tool for BreathingExerciseTool {
    fn name(&self) -> &str {
        BREATHING_TOOL
    }

    fn description(&self) -> &str {
        "Get personalized breathing exercises. Use when the user mentions stress, anxiety, panic, or asks for breathing techniques."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {}
        })
    }

    async fn execute(&self, _params: serde_json::Value, ctx: &ToolContext) -> Result<ToolOutput> {
        tracing::debug!("Fetching breathing exercises for user {}", ctx.user_id);
        let exercises = self.source.exercises_for(&ctx.user_id);
        Ok(ToolOutput::Json(serde_json::to_value(exercises)?))
    }
}

/// Build a registry with the full wellness tool set over the static catalog.
pub async fn default_registry() -> ToolRegistry {
    let catalog = Arc::new(StaticWellnessCatalog);
    let registry = ToolRegistry::new();
    registry
        .register(Arc::new(MoodHistoryTool::new(catalog.clone())))
        .await;
    registry
        .register(Arc::new(SongRecommendationTool::new(catalog.clone())))
        .await;
    registry
        .register(Arc::new(DoctorRecommendationTool::new(catalog.clone())))
        .await;
    registry
        .register(Arc::new(BreathingExerciseTool::new(catalog)))
        .await;
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ToolCall;

    fn ctx() -> ToolContext {
        ToolContext::for_user("user-1", "Ada")
    }

    #[tokio::test]
    async fn default_registry_has_all_four_tools() {
        let registry = default_registry().await;
        let mut names = registry.list_names().await;
        names.sort();
        assert_eq!(
            names,
            vec![BREATHING_TOOL, MOOD_HISTORY_TOOL, DOCTORS_TOOL, SONGS_TOOL]
        );
    }

    #[tokio::test]
    async fn mood_history_respects_days_parameter() {
        let registry = default_registry().await;
        let call = ToolCall {
            name: MOOD_HISTORY_TOOL.to_string(),
            arguments: serde_json::json!({"days": 3}),
        };
        let result = registry.execute_call(&call, &ctx()).await;
        let records: Vec<MoodRecord> =
            serde_json::from_str(&result.output.to_llm_string()).unwrap();
        assert_eq!(records.len(), 3);
        assert!(!records[0].mood.is_empty());
    }

    #[tokio::test]
    async fn song_tool_honors_category_and_count() {
        let registry = default_registry().await;
        let call = ToolCall {
            name: SONGS_TOOL.to_string(),
            arguments: serde_json::json!({"mood_category": "calming", "count": 2}),
        };
        let result = registry.execute_call(&call, &ctx()).await;
        let songs: Vec<SongRecommendation> =
            serde_json::from_str(&result.output.to_llm_string()).unwrap();
        assert_eq!(songs.len(), 2);
        assert_eq!(songs[0].title, "Weightless");
    }

    #[tokio::test]
    async fn unknown_song_category_falls_back_to_uplifting() {
        let catalog = StaticWellnessCatalog;
        let songs = catalog.songs_for("melancholy", 1);
        assert_eq!(songs[0].title, "Here Comes the Sun");
    }

    #[tokio::test]
    async fn doctor_tool_returns_real_names() {
        let registry = default_registry().await;
        let call = ToolCall {
            name: DOCTORS_TOOL.to_string(),
            arguments: serde_json::json!({}),
        };
        let result = registry.execute_call(&call, &ctx()).await;
        let doctors: Vec<DoctorRecommendation> =
            serde_json::from_str(&result.output.to_llm_string()).unwrap();
        assert!(doctors.iter().any(|d| d.name.starts_with("Dr. ")));
    }

    #[tokio::test]
    async fn breathing_tool_includes_patterns() {
        let registry = default_registry().await;
        let call = ToolCall {
            name: BREATHING_TOOL.to_string(),
            arguments: serde_json::json!({}),
        };
        let result = registry.execute_call(&call, &ctx()).await;
        let exercises: Vec<BreathingExercise> =
            serde_json::from_str(&result.output.to_llm_string()).unwrap();
        assert!(exercises.iter().any(|e| e.name.contains("Box Breathing")));
        assert!(exercises.iter().all(|e| !e.pattern.is_empty()));
    }

    #[test]
    fn crisis_tool_subset_is_doctors_and_songs() {
        assert_eq!(CRISIS_TOOL_NAMES, &[DOCTORS_TOOL, SONGS_TOOL]);
    }
}
