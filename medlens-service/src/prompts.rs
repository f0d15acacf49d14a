use medlens::Language;

/// Instructions for the structured interpretation call. The reply must be a
/// JSON object that `AnalysisResult::from_model_output` can read.
pub fn analysis_prompt(language: &Language) -> String {
    format!(
        "You are an expert medical document interpreter. The attached document is a patient's own \
        medical record: a lab report, prescription, imaging report or discharge note.

        Read it carefully and explain it to the patient. Write every human-readable field in {language} \
        (language tag \"{tag}\"), keeping test names and units as printed.

        Respond with ONLY a JSON object, no commentary and no Markdown, with this shape:
        {{
          \"classification\": \"short document type, e.g. Complete blood count\",
          \"document_type\": \"the same type in English snake_case, e.g. complete_blood_count\",
          \"summary\": \"2-4 sentence plain-language overview\",
          \"findings\": [
            {{
              \"name\": \"test or observation\",
              \"value\": \"value as printed\",
              \"unit\": \"unit or null\",
              \"reference_range\": \"range as printed or null\",
              \"status\": \"normal | low | high | abnormal | critical | unknown\",
              \"confidence\": 0.0,
              \"plain_explanation\": \"what this means for the patient\",
              \"technical_explanation\": \"clinical detail\"
            }}
          ],
          \"abnormal_highlights\": [\"one line per result that needs attention\"],
          \"suggested_questions\": [\"questions the patient could ask their doctor\"],
          \"action_plan\": {{ \"summary\": \"...\", \"steps\": [\"...\"] }},
          \"glossary\": [{{ \"term\": \"...\", \"definition\": \"...\" }}]
        }}

        Always write document_type in English whatever the output language, so that two \
        reports of the same kind get the same value. \
        Use confidence between 0 and 1 for how sure you are that the value was read correctly. \
        Never invent values that are not in the document. If the document is not medical, \
        say so in the summary and return no findings.",
        language = language.display_name(),
        tag = language.as_str(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_names_the_output_language() {
        let prompt = analysis_prompt(&Language::parse("vi").unwrap());
        assert!(prompt.contains("Vietnamese"));
        assert!(prompt.contains("\"vi\""));
        assert!(prompt.contains("\"classification\""));
        assert!(prompt.contains("\"document_type\""));
        assert!(prompt.contains("document_type in English"));
    }
}
