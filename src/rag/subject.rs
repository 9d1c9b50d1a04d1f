//! Greeting detection and subject classification.

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use crate::core::config::SubjectProfile;

/// Strips diacritics: "Matemáticas" becomes "Matematicas".
pub fn fold_accents(input: &str) -> String {
    input.nfkd().filter(|c| !is_combining_mark(*c)).collect()
}

pub fn normalize_greeting(input: &str) -> String {
    let lowered = input.to_lowercase().replace(['¡', '!'], "");
    fold_accents(lowered.trim())
}

/// Exact match of the normalized message against the configured phrases.
pub fn is_greeting(message: &str, greetings: &[String]) -> bool {
    let normalized = normalize_greeting(message);
    greetings
        .iter()
        .any(|phrase| normalize_greeting(phrase) == normalized)
}

pub fn classification_prompt(question: &str, subjects: &[SubjectProfile]) -> String {
    let names: Vec<&str> = subjects.iter().map(|s| s.name.as_str()).collect();
    let mut prompt = format!(
        "Clasifica la siguiente pregunta en una de estas materias: {}.\n\
         Usa las siguientes definiciones como guía:\n",
        names.join(", ")
    );
    for subject in subjects {
        prompt.push_str(&format!("- {}: {}.\n", subject.name, subject.description));
    }
    prompt.push_str(
        "\n- None: Si la pregunta es un saludo o despedida.\n\
         Ejemplos:\n\
         Pregunta: ¿Cómo se dice perro en inglés? -> Materia: Ingles\n\
         Pregunta: Calcula la derivada de x. -> Materia: Matematicas\n\
         Pregunta: ¿Qué es el ser? -> Materia: Filosofia\n\
         Pregunta: Hola, ¿cómo estás? -> Materia: None\n\n\
         Si no encaja claramente en ninguna, responde 'None'.\n\
         Responde ÚNICAMENTE con el nombre de la materia o 'None'.\n\n",
    );
    prompt.push_str(&format!("Pregunta: {}\nMateria:", question));
    prompt
}

/// Maps a classifier reply onto a configured subject name. Accents and
/// periods are ignored; anything else must match exactly.
pub fn parse_subject(response: &str, subjects: &[SubjectProfile]) -> Option<String> {
    let cleaned = fold_accents(response.trim().replace('.', "").trim());
    subjects
        .iter()
        .find(|s| fold_accents(&s.name) == cleaned)
        .map(|s| s.name.clone())
}
