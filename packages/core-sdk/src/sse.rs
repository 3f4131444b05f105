use serde_json::Value;

/**
 * \brief 按行切分上游字节流，处理跨网络分片的半行与半个 UTF-8 字符。
 */
#[derive(Debug, Default)]
pub struct SseLineDecoder {
    buf: Vec<u8>,
}

impl SseLineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /**
     * \brief 追加一个分片，返回其中所有完整的行（不含换行符）。
     */
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let raw = self.buf.drain(..=pos).collect::<Vec<u8>>();
            lines.push(decode_line(&raw[..raw.len() - 1]));
        }
        lines
    }

    /**
     * \brief 流结束时取出未以换行结尾的残余行。
     */
    pub fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.buf);
        Some(decode_line(&raw))
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

/**
 * \brief 单行 SSE 映射结果。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Delta(String),
    Done,
    Ignored,
}

/**
 * \brief 将一行 SSE 文本映射为内容片段；非 data 行与坏 JSON 一律忽略。
 */
pub fn map_line(line: &str) -> Frame {
    let Some(payload) = line.strip_prefix("data: ") else {
        return Frame::Ignored;
    };
    if payload.trim() == "[DONE]" {
        return Frame::Done;
    }
    match parse_openai_delta(payload) {
        Some(delta) if !delta.is_empty() => Frame::Delta(delta),
        _ => Frame::Ignored,
    }
}

fn parse_openai_delta(payload: &str) -> Option<String> {
    let v: Value = serde_json::from_str(payload).ok()?;
    v.get("choices")?
        .get(0)?
        .get("delta")?
        .get("content")?
        .as_str()
        .map(|s| s.to_string())
}

/**
 * \brief 从非流式响应中取出完整回复。
 */
pub fn extract_openai_content(v: &Value) -> String {
    v.get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .unwrap_or("")
        .to_string()
}
