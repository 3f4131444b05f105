//! 故事上下文：从存储读取圣经与角色，并渲染为有长度上限的提示片段。

use std::str::FromStr;

use anyhow::anyhow;

use crate::{
    db::StoryStore,
    features::Feature,
    models::{BibleFields, CharacterSummary, SaliencyMap, StoryContext},
    telemetry,
    telemetry::truncate_chars,
};

/** \brief 拼装后上下文的总字符上限。 */
pub const MAX_CONTEXT_CHARS: usize = 8000;
const FIELD_MAX_CHARS: usize = 1500;
const STYLE_SAMPLE_MAX_CHARS: usize = 1200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProseMode {
    Balanced,
    Cinematic,
    Lyrical,
    Minimal,
    MatchStyle,
}

impl FromStr for ProseMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "balanced" => Ok(ProseMode::Balanced),
            "cinematic" => Ok(ProseMode::Cinematic),
            "lyrical" => Ok(ProseMode::Lyrical),
            "minimal" => Ok(ProseMode::Minimal),
            "match-style" => Ok(ProseMode::MatchStyle),
            other => Err(anyhow!("unknown prose mode: {}", other)),
        }
    }
}

impl ProseMode {
    fn guidance(self) -> &'static str {
        match self {
            ProseMode::Balanced => {
                "Prose style: balanced. Mix action, dialogue and description evenly; keep sentences varied and clear."
            }
            ProseMode::Cinematic => {
                "Prose style: cinematic. Favor visual, present-moment beats, quick cuts and concrete action."
            }
            ProseMode::Lyrical => {
                "Prose style: lyrical. Use rhythm, imagery and figurative language; let sentences breathe."
            }
            ProseMode::Minimal => {
                "Prose style: minimal. Short declarative sentences, sparse adjectives, subtext over exposition."
            }
            ProseMode::MatchStyle => {
                "Prose style: match the author's voice. Imitate the diction, rhythm and sentence length of the sample below."
            }
        }
    }
}

/**
 * \brief 读取项目的故事上下文，最多两次查询。
 * \details 没有圣经是正常情况；查询失败同样按缺失处理，不影响整体请求。
 */
pub fn fetch_story_context(
    store: &dyn StoryStore,
    project_id: &str,
    user_id: Option<&str>,
) -> StoryContext {
    let bible = store.fetch_bible(project_id, user_id).unwrap_or_else(|e| {
        telemetry::log_error(
            "story.context",
            &format!("bible lookup failed project={}: {}", project_id, e),
        );
        None
    });
    let characters = store
        .fetch_characters(project_id, user_id)
        .unwrap_or_else(|e| {
            telemetry::log_error(
                "story.context",
                &format!("character lookup failed project={}: {}", project_id, e),
            );
            Vec::new()
        });
    StoryContext { bible, characters }
}

/**
 * \brief 上下文渲染选项。
 */
#[derive(Debug, Clone, Copy)]
pub struct PromptContextOptions<'a> {
    pub feature: Feature,
    pub prose_mode: Option<ProseMode>,
    pub saliency: Option<&'a SaliencyMap>,
}

impl<'a> PromptContextOptions<'a> {
    pub fn new(feature: Feature) -> Self {
        Self {
            feature,
            prose_mode: None,
            saliency: None,
        }
    }
}

/**
 * \brief 将故事上下文渲染为提示片段；输入全空时返回空串。
 */
pub fn build_story_prompt_context(ctx: &StoryContext, opts: &PromptContextOptions<'_>) -> String {
    let mut sections: Vec<String> = Vec::new();

    if let Some(bible) = &ctx.bible {
        let fields = [
            ("Genre", &bible.genre),
            ("Style", &bible.style),
            ("Point of view", &bible.pov),
            ("Tense", &bible.tense),
            ("Synopsis", &bible.synopsis),
            ("Setting", &bible.setting),
            ("Worldbuilding", &bible.worldbuilding),
            ("Outline", &bible.outline),
            ("Notes", &bible.braindump),
        ];
        let lines: Vec<String> = fields
            .iter()
            .filter_map(|(label, value)| {
                non_empty(value.as_deref())
                    .map(|v| format!("{}: {}", label, truncate_chars(v, FIELD_MAX_CHARS)))
            })
            .collect();
        if !lines.is_empty() {
            sections.push(format!("[Story Bible]\n{}", lines.join("\n")));
        }
    }

    let characters = ordered_characters(&ctx.characters, opts.saliency);
    if !characters.is_empty() {
        let lines: Vec<String> = characters.iter().map(|c| format_character(c)).collect();
        sections.push(format!("[Characters]\n{}", lines.join("\n")));
    }

    if let Some(focus) = opts.saliency.and_then(render_saliency) {
        sections.push(focus);
    }

    if opts.feature.preset().prose_guidance && (ctx.bible.is_some() || opts.prose_mode.is_some())
    {
        sections.push(format!(
            "[Prose Style]\n{}",
            build_prose_mode_guidance_with_override(ctx.bible.as_ref(), opts.prose_mode)
        ));
    }

    let joined = sections.join("\n\n");
    let bounded = truncate_chars(joined.trim(), MAX_CONTEXT_CHARS);
    if bounded.trim().is_empty() {
        String::new()
    } else {
        bounded
    }
}

/**
 * \brief 生成文风指引：显式覆盖优先，其次圣经中保存的模式，最后 balanced。
 * \details 请求 match-style 但没有文风样本时退回 balanced，并在输出中注明原因。
 */
pub fn build_prose_mode_guidance_with_override(
    bible: Option<&BibleFields>,
    override_mode: Option<ProseMode>,
) -> String {
    let stored = bible
        .and_then(|b| b.prose_mode.as_deref())
        .and_then(|m| m.parse::<ProseMode>().ok());
    let mode = override_mode.or(stored).unwrap_or(ProseMode::Balanced);

    if mode != ProseMode::MatchStyle {
        return mode.guidance().to_string();
    }

    match bible.and_then(|b| non_empty(b.style_sample.as_deref())) {
        Some(sample) => format!(
            "{}\n\nStyle sample:\n\"\"\"\n{}\n\"\"\"",
            mode.guidance(),
            truncate_chars(sample, STYLE_SAMPLE_MAX_CHARS)
        ),
        None => format!(
            "{}\n(Fallback: match-style was requested but no style sample is available, so balanced guidance is used.)",
            ProseMode::Balanced.guidance()
        ),
    }
}

fn ordered_characters<'a>(
    characters: &'a [CharacterSummary],
    saliency: Option<&SaliencyMap>,
) -> Vec<&'a CharacterSummary> {
    let named: Vec<&CharacterSummary> = characters
        .iter()
        .filter(|c| !c.name.trim().is_empty())
        .collect();
    let Some(map) = saliency else {
        return named;
    };
    let is_active = |c: &CharacterSummary| map.active_characters.iter().any(|a| a == &c.name);
    let (mut active, rest): (Vec<_>, Vec<_>) = named.into_iter().partition(|c| is_active(*c));
    active.extend(rest);
    active
}

fn format_character(c: &CharacterSummary) -> String {
    let head = match non_empty(c.role.as_deref()) {
        Some(role) => format!("- {} ({})", c.name.trim(), role),
        None => format!("- {}", c.name.trim()),
    };
    match non_empty(c.description.as_deref()) {
        Some(d) => format!("{}: {}", head, truncate_chars(d, FIELD_MAX_CHARS / 3)),
        None => head,
    }
}

fn render_saliency(map: &SaliencyMap) -> Option<String> {
    let mut lines = Vec::new();
    if !map.active_characters.is_empty() {
        lines.push(format!(
            "Active characters: {}",
            map.active_characters.join(", ")
        ));
    }
    if !map.active_locations.is_empty() {
        lines.push(format!(
            "Active locations: {}",
            map.active_locations.join(", ")
        ));
    }
    if !map.active_plotlines.is_empty() {
        lines.push(format!(
            "Active plotlines: {}",
            map.active_plotlines.join(", ")
        ));
    }
    if lines.is_empty() {
        None
    } else {
        Some(format!("[Scene Focus]\n{}", lines.join("\n")))
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteStore;

    fn hero(name: &str, role: Option<&str>) -> CharacterSummary {
        CharacterSummary {
            name: name.into(),
            role: role.map(Into::into),
            description: Some(format!("{} 的简介", name)),
        }
    }

    #[test]
    fn test_project_without_bible_yields_character_only_context() {
        let store = SqliteStore::open_in_memory().expect("store");
        store
            .insert_character("p1", "u1", &hero("林默", Some("主角")))
            .expect("insert");

        let ctx = fetch_story_context(&store, "p1", Some("u1"));
        assert!(ctx.bible.is_none());
        assert_eq!(ctx.characters.len(), 1);

        let text = build_story_prompt_context(&ctx, &PromptContextOptions::new(Feature::Continue));
        assert_eq!(text, "[Characters]\n- 林默 (主角): 林默 的简介");
    }

    #[test]
    fn test_empty_context_renders_empty_string() {
        let text = build_story_prompt_context(
            &StoryContext::default(),
            &PromptContextOptions::new(Feature::Expand),
        );
        assert_eq!(text, "");

        let blank = StoryContext {
            bible: None,
            characters: vec![CharacterSummary {
                name: "  ".into(),
                ..Default::default()
            }],
        };
        assert_eq!(
            build_story_prompt_context(&blank, &PromptContextOptions::new(Feature::Expand)),
            ""
        );
    }

    #[test]
    fn test_bible_fields_only_when_non_empty() {
        let ctx = StoryContext {
            bible: Some(BibleFields {
                genre: Some("悬疑".into()),
                synopsis: Some("   ".into()),
                ..Default::default()
            }),
            characters: vec![hero("Ada", None)],
        };
        let text = build_story_prompt_context(&ctx, &PromptContextOptions::new(Feature::Brainstorm));
        assert!(text.contains("Genre: 悬疑"));
        assert!(!text.contains("Synopsis"));
        assert!(text.contains("- Ada: Ada 的简介"));
        assert!(!text.contains("[Prose Style]"));

        let text = build_story_prompt_context(&ctx, &PromptContextOptions::new(Feature::Continue));
        assert!(text.contains("[Prose Style]\nProse style: balanced."));
    }

    #[test]
    fn test_character_without_description_has_no_dangling_colon() {
        let ctx = StoryContext {
            bible: None,
            characters: vec![
                CharacterSummary {
                    name: "甲".into(),
                    role: Some("主角".into()),
                    description: None,
                },
                CharacterSummary {
                    name: "乙".into(),
                    role: None,
                    description: Some("  ".into()),
                },
            ],
        };
        let text = build_story_prompt_context(&ctx, &PromptContextOptions::new(Feature::Expand));
        assert_eq!(text, "[Characters]\n- 甲 (主角)\n- 乙");
        assert!(!text.contains(": "));
    }

    #[test]
    fn test_match_style_without_sample_falls_back_to_balanced() {
        let bible = BibleFields {
            style_sample: None,
            prose_mode: Some("match-style".into()),
            ..Default::default()
        };
        let text = build_prose_mode_guidance_with_override(Some(&bible), None);
        assert!(text.starts_with(ProseMode::Balanced.guidance()));
        assert!(text.contains("Fallback: match-style was requested"));
    }

    #[test]
    fn test_override_beats_stored_mode() {
        let bible = BibleFields {
            prose_mode: Some("lyrical".into()),
            style_sample: Some("雨落在青石板上。".into()),
            ..Default::default()
        };
        assert_eq!(
            build_prose_mode_guidance_with_override(Some(&bible), None),
            ProseMode::Lyrical.guidance()
        );
        assert_eq!(
            build_prose_mode_guidance_with_override(Some(&bible), Some(ProseMode::Minimal)),
            ProseMode::Minimal.guidance()
        );
        let matched =
            build_prose_mode_guidance_with_override(Some(&bible), Some(ProseMode::MatchStyle));
        assert!(matched.contains("雨落在青石板上。"));
        assert!(!matched.contains("Fallback"));
        assert_eq!(
            build_prose_mode_guidance_with_override(None, None),
            ProseMode::Balanced.guidance()
        );
    }

    #[test]
    fn test_saliency_overlay_puts_active_characters_first() {
        let ctx = StoryContext {
            bible: None,
            characters: vec![hero("甲", None), hero("乙", None)],
        };
        let map = SaliencyMap {
            active_characters: vec!["乙".into()],
            active_locations: vec!["酒馆".into()],
            active_plotlines: vec![],
        };
        let opts = PromptContextOptions {
            feature: Feature::ScenePlan,
            prose_mode: None,
            saliency: Some(&map),
        };
        let text = build_story_prompt_context(&ctx, &opts);
        let yi = text.find("- 乙").expect("乙 listed");
        let jia = text.find("- 甲").expect("甲 listed");
        assert!(yi < jia);
        assert!(text.contains("[Scene Focus]\nActive characters: 乙\nActive locations: 酒馆"));
    }

    #[test]
    fn test_context_is_bounded() {
        let ctx = StoryContext {
            bible: None,
            characters: (0..200)
                .map(|i| CharacterSummary {
                    name: format!("角色{}", i),
                    role: None,
                    description: Some("很长的描述".repeat(100)),
                })
                .collect(),
        };
        let text = build_story_prompt_context(&ctx, &PromptContextOptions::new(Feature::Continue));
        assert_eq!(text.chars().count(), MAX_CONTEXT_CHARS);
    }

    #[test]
    fn test_prose_mode_parse() {
        assert_eq!("Match-Style".parse::<ProseMode>().expect("parse"), ProseMode::MatchStyle);
        assert!("baroque".parse::<ProseMode>().is_err());
    }
}
