//! Prompts sent to the hosted model.

use crate::services::DiffMetadata;

/// Longest OCR excerpt forwarded per sheet.
const MAX_SECTION_CHARS: usize = 1500;

pub const OCR_PROMPT: &str = "You are reading one sheet of an architectural or engineering \
drawing set. Transcribe the text you can read and return a JSON object of the form \
{\"sections\": {\"title_block\": \"...\", \"notes\": \"...\", \"revisions\": \"...\", \
\"other\": \"...\"}}. Omit sections that are not present. Do not describe the linework.";

/// Escapes chat-template markers so page text cannot steer the model.
pub fn sanitize_for_prompt(text: &str) -> String {
    text.replace("<|", "< |")
        .replace("|>", "| >")
        .replace("[INST]", "[ INST ]")
        .replace("[/INST]", "[ / INST ]")
}

pub fn summary_prompt(metadata: &DiffMetadata) -> String {
    let mut prompt = format!(
        "The image is a change overlay of drawing \"{}\" (sheet {}). Red marks ink removed \
         from the previous revision, green marks ink added in the new revision and gray is \
         unchanged.\n\
         Measured: {} changed regions, {} added px, {} removed px, {} unchanged px, \
         alignment score {:.2} ({} overlay).\n",
        sanitize_for_prompt(&metadata.drawing_name),
        metadata.page_number,
        metadata.change_count,
        metadata.added_pixels,
        metadata.removed_pixels,
        metadata.overlap_pixels,
        metadata.alignment_score,
        metadata.composite_mode,
    );

    for (label, doc) in [("Previous", &metadata.old_text), ("Revised", &metadata.new_text)] {
        let Some(doc) = doc.as_ref().filter(|d| !d.is_empty()) else {
            continue;
        };
        prompt.push_str(&format!("{} sheet text:\n", label));
        for (section, text) in &doc.sections {
            let excerpt: String = sanitize_for_prompt(text).chars().take(MAX_SECTION_CHARS).collect();
            prompt.push_str(&format!("[{}] {}\n", section, excerpt));
        }
    }

    prompt.push_str(
        "Respond with a JSON object: {\"changes\": [\"...\"], \"critical_change\": \"...\" or null, \
         \"recommendations\": [\"...\"]}. List each distinct change once, in plain language.",
    );
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::OcrDocument;

    fn metadata() -> DiffMetadata {
        DiffMetadata {
            drawing_name: "A-101 <|system|>".to_string(),
            page_number: 1,
            change_count: 2,
            added_pixels: 100,
            removed_pixels: 50,
            overlap_pixels: 10_000,
            alignment_score: 0.91,
            composite_mode: "soft".to_string(),
            old_text: None,
            new_text: None,
        }
    }

    #[test]
    fn test_summary_prompt_carries_metrics_and_escapes_markers() {
        let prompt = summary_prompt(&metadata());
        assert!(prompt.contains("2 changed regions"));
        assert!(prompt.contains("0.91"));
        assert!(!prompt.contains("<|system|>"));
        assert!(!prompt.contains("sheet text"));
    }

    #[test]
    fn test_summary_prompt_includes_ocr_sections() {
        let mut meta = metadata();
        let mut doc = OcrDocument::default();
        doc.sections.insert("notes".to_string(), "x".repeat(5000));
        meta.new_text = Some(doc);
        let prompt = summary_prompt(&meta);
        assert!(prompt.contains("Revised sheet text:"));
        assert!(prompt.contains("[notes] "));
        assert!(!prompt.contains(&"x".repeat(MAX_SECTION_CHARS + 1)));
    }
}
