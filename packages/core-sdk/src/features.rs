use std::{fmt, str::FromStr};

use anyhow::anyhow;

use crate::models::Message;

/**
 * \brief 写作辅助功能集合，各功能只在提示词与采样参数上不同。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    Continue,
    Brainstorm,
    Expand,
    Rewrite,
    ToneShift,
    ScenePlan,
    Describe,
    Dialogue,
}

/**
 * \brief 功能的采样参数与系统指令。
 */
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeaturePreset {
    pub max_tokens: u32,
    pub temperature: f32,
    pub instruction: &'static str,
    /** \brief 是否需要附加文风指引（产出正文的功能才需要） */
    pub prose_guidance: bool,
}

impl Feature {
    pub const ALL: [Feature; 8] = [
        Feature::Continue,
        Feature::Brainstorm,
        Feature::Expand,
        Feature::Rewrite,
        Feature::ToneShift,
        Feature::ScenePlan,
        Feature::Describe,
        Feature::Dialogue,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Feature::Continue => "continue",
            Feature::Brainstorm => "brainstorm",
            Feature::Expand => "expand",
            Feature::Rewrite => "rewrite",
            Feature::ToneShift => "tone-shift",
            Feature::ScenePlan => "scene-plan",
            Feature::Describe => "describe",
            Feature::Dialogue => "dialogue",
        }
    }

    pub fn preset(self) -> FeaturePreset {
        match self {
            Feature::Continue => FeaturePreset {
                max_tokens: 800,
                temperature: 0.8,
                instruction: "Continue the story from where the text ends.",
                prose_guidance: true,
            },
            Feature::Brainstorm => FeaturePreset {
                max_tokens: 600,
                temperature: 1.0,
                instruction: "Brainstorm distinct ideas for what could happen next.",
                prose_guidance: false,
            },
            Feature::Expand => FeaturePreset {
                max_tokens: 1000,
                temperature: 0.7,
                instruction: "Expand the passage with richer detail without changing events.",
                prose_guidance: true,
            },
            Feature::Rewrite => FeaturePreset {
                max_tokens: 1000,
                temperature: 0.7,
                instruction: "Rewrite the passage while keeping its meaning.",
                prose_guidance: true,
            },
            Feature::ToneShift => FeaturePreset {
                max_tokens: 1000,
                temperature: 0.8,
                instruction: "Rewrite the passage in the requested tone.",
                prose_guidance: true,
            },
            Feature::ScenePlan => FeaturePreset {
                max_tokens: 700,
                temperature: 0.6,
                instruction: "Outline the next scene as a numbered list of beats.",
                prose_guidance: false,
            },
            Feature::Describe => FeaturePreset {
                max_tokens: 500,
                temperature: 0.9,
                instruction: "Describe the subject using the five senses.",
                prose_guidance: true,
            },
            Feature::Dialogue => FeaturePreset {
                max_tokens: 700,
                temperature: 0.85,
                instruction: "Write dialogue that fits each character's voice.",
                prose_guidance: true,
            },
        }
    }

    /**
     * \brief 组装发往模型的消息：系统指令 + 故事上下文 + 用户输入。
     */
    pub fn build_messages(self, story_context: &str, user_prompt: &str) -> Vec<Message> {
        let preset = self.preset();
        let mut system = format!(
            "You are a fiction writing assistant. {}",
            preset.instruction
        );
        if !story_context.trim().is_empty() {
            system.push_str("\n\n");
            system.push_str(story_context);
        }
        vec![Message::system(system), Message::user(user_prompt)]
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Feature {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Feature::ALL
            .iter()
            .copied()
            .find(|f| f.as_str() == s.trim().to_ascii_lowercase())
            .ok_or_else(|| anyhow!("unknown feature: {}", s))
    }
}
