//! 显著性启发式：扫描正文末尾窗口，找出当前活跃的角色与地点。
//!
//! 地点正则目前只覆盖中文叙事句式（“在……里”“来到……”“走进……”）。

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::{
    llm,
    models::{CharacterSummary, Message, ProviderConfig, SaliencyMap},
    telemetry,
};

/** \brief 只扫描正文末尾的字符数。 */
pub const SALIENCY_WINDOW_CHARS: usize = 2000;
pub const MAX_ACTIVE_CHARACTERS: usize = 5;
pub const MAX_ACTIVE_LOCATIONS: usize = 3;
pub const MAX_ACTIVE_PLOTLINES: usize = 3;

const MAX_WORLDBUILDING_KEYWORD_CHARS: usize = 12;

static LOCATION_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"在(\p{Han}{2,6}?)(?:里|中|内|外|上|下|旁|前|后|附近|门口)",
        r"(?:到达|来到|抵达)了?(\p{Han}{2,6}?)(?:[，。！？、；,.!?;\s]|$)",
        r"走进了?(\p{Han}{2,6}?)(?:[里内中，。！？、；,.!?;\s]|$)",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

fn is_keyword_separator(c: char) -> bool {
    c.is_whitespace() || is_phrase_separator(c)
}

fn is_phrase_separator(c: char) -> bool {
    matches!(
        c,
        ',' | '，' | '、' | '。' | '.' | ';' | '；' | ':' | '：' | '/' | '|' | '(' | ')' | '（' | '）' | '\n'
    )
}

/**
 * \brief 纯函数：计算正文末尾窗口的显著性映射，无隐藏状态。
 * \param setting 故事圣经中的场景设定，按空白与标点切词后作为地点关键词
 * \param worldbuilding 世界观设定，按标点切分出的短条目作为地点关键词
 */
pub fn compute_saliency(
    text: &str,
    characters: &[CharacterSummary],
    setting: Option<&str>,
    worldbuilding: Option<&str>,
) -> SaliencyMap {
    let window = trailing_window(text, SALIENCY_WINDOW_CHARS);
    if window.trim().is_empty() {
        return SaliencyMap::default();
    }
    let lower = window.to_lowercase();

    SaliencyMap {
        active_characters: detect_characters(&lower, characters),
        active_locations: detect_locations(window, &lower, setting, worldbuilding),
        active_plotlines: Vec::new(),
    }
}

/** \brief 取文本末尾至多 max_chars 个字符。 */
pub fn trailing_window(text: &str, max_chars: usize) -> &str {
    let total = text.chars().count();
    if total <= max_chars {
        return text;
    }
    match text.char_indices().nth(total - max_chars) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}

fn detect_characters(lower: &str, characters: &[CharacterSummary]) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    for character in characters {
        let name = character.name.trim();
        if name.is_empty() || found.iter().any(|f| f == name) {
            continue;
        }
        let full = lower.contains(&name.to_lowercase());
        // 单字 token 误报太多，直接忽略
        let partial = || {
            name.split_whitespace()
                .filter(|t| t.chars().count() > 1)
                .any(|t| lower.contains(&t.to_lowercase()))
        };
        if full || partial() {
            found.push(name.to_string());
            if found.len() == MAX_ACTIVE_CHARACTERS {
                break;
            }
        }
    }
    found
}

fn detect_locations(
    window: &str,
    lower: &str,
    setting: Option<&str>,
    worldbuilding: Option<&str>,
) -> Vec<String> {
    let mut keywords: Vec<&str> = Vec::new();
    if let Some(setting) = setting {
        keywords.extend(setting.split(is_keyword_separator));
    }
    if let Some(world) = worldbuilding {
        keywords.extend(
            world
                .split(is_phrase_separator)
                .map(str::trim)
                .filter(|k| k.chars().count() <= MAX_WORLDBUILDING_KEYWORD_CHARS),
        );
    }

    let mut found: Vec<String> = Vec::new();
    let mut push = |candidate: &str| {
        let candidate = candidate.trim();
        if candidate.chars().count() >= 2 && !found.iter().any(|f| f == candidate) {
            found.push(candidate.to_string());
        }
    };

    for keyword in keywords {
        if keyword.chars().count() >= 2 && lower.contains(&keyword.to_lowercase()) {
            push(keyword);
        }
    }
    for pattern in LOCATION_PATTERNS.iter() {
        for caps in pattern.captures_iter(window) {
            if let Some(m) = caps.get(1) {
                push(m.as_str());
            }
        }
    }

    found.truncate(MAX_ACTIVE_LOCATIONS);
    found
}

/**
 * \brief 模型返回的部分显著性结果；缺失或格式错误的字段为 None。
 */
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartialSaliency {
    pub active_characters: Option<Vec<String>>,
    pub active_locations: Option<Vec<String>>,
    pub active_plotlines: Option<Vec<String>>,
}

/**
 * \brief 从模型回复中提取 JSON 对象；完全无法解析时返回 None。
 */
pub fn parse_ai_saliency(reply: &str) -> Option<PartialSaliency> {
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    if end < start {
        return None;
    }
    let v: Value = serde_json::from_str(&reply[start..=end]).ok()?;
    let obj = v.as_object()?;
    let field = |key: &str| -> Option<Vec<String>> {
        obj.get(key)?
            .as_array()?
            .iter()
            .map(|item| item.as_str().map(|s| s.trim().to_string()))
            .collect::<Option<Vec<_>>>()
            .map(|items| items.into_iter().filter(|s| !s.is_empty()).collect())
    };
    Some(PartialSaliency {
        active_characters: field("activeCharacters"),
        active_locations: field("activeLocations"),
        active_plotlines: field("activePlotlines"),
    })
}

/**
 * \brief 逐字段合并：模型给出的字段优先，缺失字段退回启发式结果。
 */
pub fn merge_saliency(partial: PartialSaliency, fallback: SaliencyMap) -> SaliencyMap {
    let pick = |ai: Option<Vec<String>>, heuristic: Vec<String>, cap: usize| {
        let mut items = ai.unwrap_or(heuristic);
        items.truncate(cap);
        items
    };
    SaliencyMap {
        active_characters: pick(
            partial.active_characters,
            fallback.active_characters,
            MAX_ACTIVE_CHARACTERS,
        ),
        active_locations: pick(
            partial.active_locations,
            fallback.active_locations,
            MAX_ACTIVE_LOCATIONS,
        ),
        active_plotlines: pick(
            partial.active_plotlines,
            fallback.active_plotlines,
            MAX_ACTIVE_PLOTLINES,
        ),
    }
}

/**
 * \brief 借助模型增强显著性分析；调用失败或回复不可解析时使用启发式结果。
 */
pub async fn enhance_saliency(
    client: &reqwest::Client,
    config: &ProviderConfig,
    text: &str,
    characters: &[CharacterSummary],
    setting: Option<&str>,
    worldbuilding: Option<&str>,
) -> SaliencyMap {
    let fallback = compute_saliency(text, characters, setting, worldbuilding);
    let window = trailing_window(text, SALIENCY_WINDOW_CHARS);
    if window.trim().is_empty() {
        return fallback;
    }

    let roster = characters
        .iter()
        .map(|c| c.name.trim())
        .filter(|n| !n.is_empty())
        .collect::<Vec<_>>()
        .join(", ");
    let messages = vec![
        Message::system(
            "Identify which characters, locations and plotlines are active in the passage. \
             Reply with JSON only: {\"activeCharacters\":[],\"activeLocations\":[],\"activePlotlines\":[]}.",
        ),
        Message::user(format!(
            "Known characters: {}\nSetting: {}\n\nPassage:\n{}",
            roster,
            setting.unwrap_or(""),
            window
        )),
    ];

    match llm::chat_once(client, config, &messages, 300, 0.2).await {
        Ok(reply) => match parse_ai_saliency(&reply) {
            Some(partial) => merge_saliency(partial, fallback),
            None => {
                telemetry::log_event("saliency", "unparseable model reply, using heuristic");
                fallback
            }
        },
        Err(e) => {
            telemetry::log_error("saliency", &format!("enhancement failed: {}", e.message));
            fallback
        }
    }
}
