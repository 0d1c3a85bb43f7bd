//! 附件拼接：把附件描述合并进提示词
//!
//! 每个附件一行「文件名 / 大小 / 类型」，有文本预览时附上截断后的预览。

use crate::bus::Attachment;

/// 默认预览字符预算
pub const DEFAULT_PREVIEW_CHARS: usize = 2000;

/// 合并文本与附件，得到发送给 Agent 的提示词
pub fn build_prompt(text: &str, attachments: &[Attachment], preview_chars: usize) -> String {
    let mut prompt = text.trim().to_string();
    for attachment in attachments {
        if !prompt.is_empty() {
            prompt.push_str("\n\n");
        }
        prompt.push_str(&describe(attachment));
        if let Some(preview) = attachment
            .text_preview
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
        {
            prompt.push_str("\nPreview:\n");
            prompt.push_str(&bounded_preview(preview, preview_chars));
        }
    }
    prompt
}

fn describe(attachment: &Attachment) -> String {
    let content_type = attachment
        .content_type
        .as_deref()
        .unwrap_or("application/octet-stream");
    format!(
        "[Attachment] {} ({}, {})",
        attachment.filename,
        human_size(attachment.size_bytes),
        content_type
    )
}

fn bounded_preview(preview: &str, max_chars: usize) -> String {
    let total = preview.chars().count();
    if total <= max_chars {
        return preview.to_string();
    }
    let mut out: String = preview.chars().take(max_chars).collect();
    out.push_str(&format!("\n… ({} more characters)", total - max_chars));
    out
}

fn human_size(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    let b = bytes as f64;
    if b >= MB {
        format!("{:.1} MB", b / MB)
    } else if b >= KB {
        format!("{:.1} KB", b / KB)
    } else {
        format!("{bytes} B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_only() {
        assert_eq!(build_prompt("  hi  ", &[], 10), "hi");
    }

    #[test]
    fn test_attachment_line_and_preview() {
        let attachments = vec![Attachment::new("notes.txt", 2048)
            .with_content_type("text/plain")
            .with_preview("abcdefghij")];
        let prompt = build_prompt("look", &attachments, 4);
        assert_eq!(
            prompt,
            "look\n\n[Attachment] notes.txt (2.0 KB, text/plain)\nPreview:\nabcd\n… (6 more characters)"
        );
    }

    #[test]
    fn test_attachment_without_text() {
        let prompt = build_prompt("", &[Attachment::new("a.bin", 12)], 100);
        assert_eq!(prompt, "[Attachment] a.bin (12 B, application/octet-stream)");
    }
}
