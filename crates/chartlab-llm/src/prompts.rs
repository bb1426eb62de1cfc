//! Prompts for presenting-symptom extraction.
//!
//! Written for instruction-tuned Llama 3 models with a JSON-array grammar constraint.

/// System prompt shared by all presenting-symptom prompts.
pub const SYSTEM_PROMPT: &str = r#"You are a clinical researcher that reads medical charts and answers questions about them.
Use only the information in the text provided to answer the question.
If a patient denies something, do not include it in your answer.
After you provide an answer, you immediately stop talking."#;

/// Instructions preceding the history in every extraction prompt.
pub const EXTRACTION_INSTRUCTIONS: &str = r#"Read the following patient history and list the patient's presenting symptoms.
Include only symptoms present now or reported for the days to weeks leading up to admission.
Ignore any symptoms from past medical history or prior hospital admissions.
Give your answer as a JSON array containing up to ten strings.
Each string contains between one and three words.

"#;

/// User prompt template for symptom extraction.
pub fn make_extraction_prompt(history: &str) -> String {
    format!("{}{}", EXTRACTION_INSTRUCTIONS, history)
}

/// JSON schema the completion is constrained to.
pub const ARRAY_OF_SHORT_STRINGS_SCHEMA: &str = r#"{
    "$schema": "http://json-schema.org/draft-07/schema#",
    "type": "array",
    "minItems": 1,
    "maxItems": 10,
    "items": {
        "type": "string",
        "minLength": 2,
        "maxLength": 100
    }
}"#;

/// Few-shot examples (history, expected completion).
pub const FEW_SHOT_EXAMPLES: &[(&str, &str)] = &[
    (
        "72M with HTN presenting with 3 days of fever, chills and productive cough. Denies chest pain.",
        r#"["fever", "chills", "productive cough"]"#,
    ),
    (
        "Pt is a 45F with h/o UTIs who reports dysuria and urinary frequency since yesterday, now with flank pain.",
        r#"["dysuria", "urinary frequency", "flank pain"]"#,
    ),
];

/// Build a complete Llama 3 chat prompt, optionally with few-shot turns.
pub fn build_full_prompt(history: &str, include_examples: bool) -> String {
    let mut prompt = String::from("<|begin_of_text|>");

    push_turn(&mut prompt, "system", SYSTEM_PROMPT);

    if include_examples {
        for (input, output) in FEW_SHOT_EXAMPLES {
            push_turn(&mut prompt, "user", &make_extraction_prompt(input));
            push_turn(&mut prompt, "assistant", output);
        }
    }

    push_turn(&mut prompt, "user", &make_extraction_prompt(history));
    prompt.push_str("<|start_header_id|>assistant<|end_header_id|>\n\n");

    prompt
}

fn push_turn(prompt: &mut String, role: &str, content: &str) {
    prompt.push_str("<|start_header_id|>");
    prompt.push_str(role);
    prompt.push_str("<|end_header_id|>\n\n");
    prompt.push_str(content);
    prompt.push_str("<|eot_id|>");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extraction_prompt() {
        let prompt = make_extraction_prompt("Fever and chills for two days");
        assert!(prompt.contains("Fever and chills for two days"));
        assert!(prompt.contains("JSON array"));
    }

    #[test]
    fn test_full_prompt_with_examples() {
        let prompt = build_full_prompt("Cough", true);
        assert!(prompt.starts_with("<|begin_of_text|>"));
        assert!(prompt.contains("productive cough"));
        assert!(prompt.ends_with("<|start_header_id|>assistant<|end_header_id|>\n\n"));
        // system + 2 examples * 2 turns + request
        assert_eq!(prompt.matches("<|eot_id|>").count(), 6);
    }

    #[test]
    fn test_full_prompt_without_examples() {
        let prompt = build_full_prompt("Cough", false);
        assert!(!prompt.contains("dysuria"));
        assert_eq!(prompt.matches("<|eot_id|>").count(), 2);
    }

    #[test]
    fn test_schema_is_valid_json() {
        let value: serde_json::Value = serde_json::from_str(ARRAY_OF_SHORT_STRINGS_SCHEMA).unwrap();
        assert_eq!(value["maxItems"], 10);
    }
}
